use crate::encoding::{bincode, wire};
use crate::errdata;
use crate::error::Result;
use crate::raft::Topics;
use crate::types::{ClusterConfig, Event, Mutation, Operation, Term, TopicName};

use log::info;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::fs::{File, OpenOptions};
use std::io::{BufReader, Read, Seek as _, SeekFrom, Write as _};
use std::path::{Path, PathBuf};

/// Node metadata persisted outside the logs: the node's identity, current
/// term, and the last term a vote was granted in.
#[derive(Clone, Copy, Debug, Default, Deserialize, PartialEq, Serialize)]
pub struct NodeMeta {
    /// The node id, generated on first start. Nil until then.
    pub id: crate::types::NodeId,
    pub term: Term,
    pub voted_in: Term,
}

/// State recovered by scanning the logs at startup.
#[derive(Debug, Default)]
pub struct Recovery {
    /// The offset of the last committed mutation.
    pub last_offset: u64,
    /// The term of that mutation.
    pub last_term: Term,
    /// The most recently committed cluster config, if any.
    pub config: Option<ClusterConfig>,
    /// The committed per-topic projection state.
    pub topics: Topics,
    /// The persisted node metadata.
    pub meta: NodeMeta,
}

/// A single append-only log file of length-prefixed records, with an
/// in-memory index of record positions and terms. The index is rebuilt by
/// scanning the file on startup; maintaining it on disk would require extra
/// fsyncing, and the scan doubles as a recovery pass.
struct Stream {
    file: File,
    /// Record positions, sizes, and terms by (1-indexed) offset.
    index: BTreeMap<u64, (u64, u32, Term)>,
}

impl Stream {
    fn open(path: &Path) -> Result<Self> {
        let file = OpenOptions::new().read(true).write(true).create(true).open(path)?;
        Ok(Self { file, index: BTreeMap::new() })
    }

    fn len(&self) -> u64 {
        self.index.len() as u64
    }

    /// Scans the file front to back, indexing each record and yielding it to
    /// the visitor.
    fn scan(&mut self, mut visit: impl FnMut(u64, &[u8]) -> Result<Term>) -> Result<()> {
        let Self { file, index } = self;
        let size = file.metadata()?.len();
        file.seek(SeekFrom::Start(0))?;
        let mut reader = BufReader::new(file);
        let mut pos = 0;
        let mut offset = 1;
        while pos < size {
            let Some(payload) = wire::read_frame(&mut reader)? else { break };
            let term = visit(offset, &payload)?;
            index.insert(offset, (pos + 2, payload.len() as u32, term));
            pos += 2 + payload.len() as u64;
            offset += 1;
        }
        Ok(())
    }

    /// Appends a record as a wire frame. Durability is the caller's problem.
    fn append(&mut self, offset: u64, term: Term, payload: &[u8]) -> Result<()> {
        assert_eq!(offset, self.len() + 1, "log offset gap");
        let pos = self.file.seek(SeekFrom::End(0))?;
        wire::write_frame(&mut self.file, payload)?;
        self.index.insert(offset, (pos + 2, payload.len() as u32, term));
        Ok(())
    }

    /// Reads the record at the given offset.
    fn get(&mut self, offset: u64) -> Result<Vec<u8>> {
        let Some((pos, size, _)) = self.index.get(&offset).copied() else {
            return errdata!("no record at offset {offset}");
        };
        let mut payload = vec![0; size as usize];
        self.file.seek(SeekFrom::Start(pos))?;
        self.file.read_exact(&mut payload)?;
        Ok(payload)
    }
}

/// The log store. A single global mutation log, one event log per topic, and
/// a small metadata file, all in the data directory. Only committed records
/// are ever written, so the files are strictly append-only; random fetch by
/// offset is served through the in-memory indexes.
pub struct LogStore {
    dir: PathBuf,
    mutations: Stream,
    topics: HashMap<TopicName, Stream>,
    /// If true, fsync on every commit.
    sync: bool,
}

impl LogStore {
    /// Opens or creates the store in the given directory, scanning the logs
    /// to rebuild the indexes and recover the committed state.
    pub fn open(dir: &Path, sync: bool) -> Result<(Self, Recovery)> {
        std::fs::create_dir_all(dir.join("topics"))?;
        let mut recovery = Recovery::default();

        let mut mutations = Stream::open(&dir.join("mutations"))?;
        mutations.scan(|offset, payload| {
            let mutation = Mutation::decode(payload)?;
            if mutation.offset != offset {
                return errdata!("mutation log corrupt at offset {offset}");
            }
            recovery.last_term = mutation.term;
            if let Operation::UpdateConfig(config) = mutation.op {
                recovery.config = Some(config);
            }
            Ok(mutation.term)
        })?;
        recovery.last_offset = mutations.len();

        let mut topics = HashMap::new();
        for dirent in std::fs::read_dir(dir.join("topics"))? {
            let path = dirent?.path();
            let topic = topic_from_file(&path)?;
            let mut stream = Stream::open(&path)?;
            stream.scan(|local, payload| {
                let event = Event::decode(payload)?;
                if event.local_offset != local || event.topic != topic {
                    return errdata!("event log corrupt for topic {topic} at offset {local}");
                }
                recovery.topics.apply(std::slice::from_ref(&event));
                Ok(event.term)
            })?;
            topics.insert(topic, stream);
        }

        let meta_path = dir.join("meta");
        if meta_path.try_exists()? {
            let mut bytes = Vec::new();
            File::open(&meta_path)?.read_to_end(&mut bytes)?;
            if !bytes.is_empty() {
                recovery.meta = bincode::deserialize(&bytes)?;
            }
        }

        info!(
            "Opened log store in {} with {} committed mutations",
            dir.display(),
            recovery.last_offset
        );
        Ok((Self { dir: dir.to_path_buf(), mutations, topics, sync }, recovery))
    }

    /// Commits a mutation and its event batch: the events land first,
    /// atomically per topic, then the mutation. Commits must arrive in
    /// ascending offset order.
    pub fn commit(&mut self, mutation: &Mutation, events: &[Event]) -> Result<()> {
        let mut touched = HashSet::new();
        for event in events {
            if !self.topics.contains_key(&event.topic) {
                let stream = Stream::open(&topic_file(&self.dir, &event.topic))?;
                self.topics.insert(event.topic.clone(), stream);
            }
            let stream = self.topics.get_mut(&event.topic).expect("topic stream");
            stream.append(event.local_offset, event.term, &event.encode())?;
            touched.insert(event.topic.clone());
        }
        if self.sync {
            for topic in &touched {
                self.topics.get(topic).expect("touched topic").file.sync_data()?;
            }
        }
        self.mutations.append(mutation.offset, mutation.term, &mutation.encode())?;
        if self.sync {
            self.mutations.file.sync_data()?;
        }
        Ok(())
    }

    /// Fetches a committed mutation by offset.
    pub fn fetch(&mut self, offset: u64) -> Result<Mutation> {
        Mutation::decode(&self.mutations.get(offset)?)
    }

    /// Fetches a committed event by topic and local offset.
    pub fn fetch_event(&mut self, topic: &TopicName, local: u64) -> Result<Event> {
        let Some(stream) = self.topics.get_mut(topic) else {
            return errdata!("no event log for topic {topic}");
        };
        Event::decode(&stream.get(local)?)
    }

    /// The term of the committed mutation at the given offset; offset 0 has
    /// term 0.
    pub fn term_at(&self, offset: u64) -> Result<Term> {
        if offset == 0 {
            return Ok(0);
        }
        match self.mutations.index.get(&offset) {
            Some((_, _, term)) => Ok(*term),
            None => errdata!("no mutation at offset {offset}"),
        }
    }

    /// Persists the node metadata.
    pub fn save_meta(&mut self, meta: NodeMeta) -> Result<()> {
        let mut file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(self.dir.join("meta"))?;
        file.write_all(&bincode::serialize(&meta)?)?;
        if self.sync {
            file.sync_data()?;
        }
        Ok(())
    }
}

impl Drop for LogStore {
    /// Attempt to fsync data on drop, in case we're running without sync.
    fn drop(&mut self) {
        self.mutations.file.sync_all().ok();
        for stream in self.topics.values() {
            stream.file.sync_all().ok();
        }
    }
}

/// The event log path of a topic. Topic names can contain arbitrary UTF-8,
/// so file names use the hex of the name's bytes.
fn topic_file(dir: &Path, topic: &TopicName) -> PathBuf {
    let name: String = topic.as_str().bytes().map(|b| format!("{b:02x}")).collect();
    dir.join("topics").join(format!("{name}.log"))
}

fn topic_from_file(path: &Path) -> Result<TopicName> {
    let Some(name) = path.file_stem().and_then(|n| n.to_str()) else {
        return errdata!("invalid topic log file {}", path.display());
    };
    if name.len() % 2 != 0 || !name.bytes().all(|b| b.is_ascii_hexdigit()) {
        return errdata!("invalid topic log file {}", path.display());
    }
    let bytes: Vec<u8> = (0..name.len())
        .step_by(2)
        .map(|i| u8::from_str_radix(&name[i..i + 2], 16).expect("checked hex"))
        .collect();
    TopicName::new(String::from_utf8(bytes)?)
}
