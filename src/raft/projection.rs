use crate::errinput;
use crate::error::Result;
use crate::types::{Change, Event, Mutation, Operation, TopicName};

use std::collections::HashMap;

/// A topic program: deterministic code deployed with CREATE_TOPIC that maps
/// keyed mutations to event batches.
#[derive(Clone, Debug, PartialEq)]
pub struct Program {
    pub code: Vec<u8>,
    pub args: Vec<u8>,
}

/// A deterministic runtime for programmable topics. The runtime is external
/// to the core and must produce identical output on every replica given
/// identical inputs; the core treats a run failure as a zero-event outcome
/// reported to the client as an error effect.
pub trait Runtime: Send {
    /// Runs a keyed mutation through a topic's program, returning the
    /// changes to record, in order.
    fn run(&self, program: &Program, mutation: &Mutation) -> Result<Vec<Change>>;
}

/// The default runtime: applies raw key semantics regardless of the deployed
/// code.
pub struct RawRuntime;

impl Runtime for RawRuntime {
    fn run(&self, _program: &Program, mutation: &Mutation) -> Result<Vec<Change>> {
        match &mutation.op {
            Operation::Put { key, value } => {
                Ok(vec![Change::KeyPut { key: key.clone(), value: value.clone() }])
            }
            Operation::Delete { key } => Ok(vec![Change::KeyDelete { key: key.clone() }]),
            op => errinput!("program cannot run {op:?}"),
        }
    }
}

/// Projection state for a single topic. A topic name owns a single
/// append-only event stream, so local offsets continue across destroy and
/// re-create.
#[derive(Clone, Debug, PartialEq)]
struct TopicState {
    /// The local offset the next event will take.
    next_local: u64,
    /// False once the topic has been destroyed (and not re-created).
    live: bool,
    /// The deployed program, for programmable topics.
    program: Option<Program>,
}

/// The per-topic projection table: the state the deterministic projector
/// reads and writes when turning mutations into event batches. The core
/// keeps two copies: one as of the last commit, and a speculative one as of
/// the last appended mutation, rebuilt from the committed copy when a
/// follower drops conflicting entries.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Topics {
    topics: HashMap<TopicName, TopicState>,
}

impl Topics {
    pub fn new() -> Self {
        Self::default()
    }

    /// The last committed local offset of a topic, or 0 if it has none.
    pub fn last_local(&self, topic: &TopicName) -> u64 {
        self.topics.get(topic).map_or(0, |t| t.next_local - 1)
    }

    /// Restores a topic's state during recovery.
    pub fn restore(&mut self, topic: TopicName, next_local: u64, live: bool, program: Option<Program>) {
        self.topics.insert(topic, TopicState { next_local, live, program });
    }

    /// Projects a mutation into its event batch, updating the table. Returns
    /// the events and an error flag; a flagged outcome has no events and
    /// leaves the table untouched. Config changes produce no events and must
    /// not be projected.
    ///
    /// A keyed mutation on a topic that was never explicitly created starts
    /// the topic's stream implicitly; only a destroyed topic rejects them.
    pub fn project(&mut self, mutation: &Mutation, runtime: &dyn Runtime) -> (Vec<Event>, bool) {
        let topic = &mutation.topic;
        match &mutation.op {
            Operation::CreateTopic { code, args } => {
                if self.topics.get(topic).is_some_and(|t| t.live) {
                    return (Vec::new(), true);
                }
                let program =
                    (!code.is_empty()).then(|| Program { code: code.clone(), args: args.clone() });
                let state = self.state_mut(topic);
                state.live = true;
                state.program = program;
                let change = Change::TopicCreate { code: code.clone(), args: args.clone() };
                (vec![self.event(mutation, change)], false)
            }
            Operation::DestroyTopic => {
                let Some(state) = self.topics.get_mut(topic) else { return (Vec::new(), true) };
                if !state.live {
                    return (Vec::new(), true);
                }
                state.live = false;
                state.program = None;
                (vec![self.event(mutation, Change::TopicDestroy)], false)
            }
            Operation::Put { .. } | Operation::Delete { .. } => {
                if self.topics.get(topic).is_some_and(|t| !t.live) {
                    return (Vec::new(), true);
                }
                let changes = match self.topics.get(topic).and_then(|t| t.program.clone()) {
                    Some(program) => match runtime.run(&program, mutation) {
                        Ok(changes) => changes,
                        Err(_) => return (Vec::new(), true),
                    },
                    None => match &mutation.op {
                        Operation::Put { key, value } => {
                            vec![Change::KeyPut { key: key.clone(), value: value.clone() }]
                        }
                        Operation::Delete { key } => vec![Change::KeyDelete { key: key.clone() }],
                        _ => unreachable!(),
                    },
                };
                if changes
                    .iter()
                    .any(|c| !matches!(c, Change::KeyPut { .. } | Change::KeyDelete { .. }))
                {
                    return (Vec::new(), true);
                }
                self.state_mut(topic).live = true;
                let events = changes.into_iter().map(|c| self.event(mutation, c)).collect();
                (events, false)
            }
            Operation::UpdateConfig(_) => panic!("config changes are not projected"),
        }
    }

    /// Applies a committed event batch to the table. Replaying stored events
    /// reproduces the exact state transition of the projection that created
    /// them, which is what makes speculative rebuilds and startup recovery
    /// possible.
    pub fn apply(&mut self, events: &[Event]) {
        for event in events {
            let state = self.state_mut(&event.topic);
            state.next_local = event.local_offset + 1;
            match &event.change {
                Change::TopicCreate { code, args } => {
                    state.live = true;
                    state.program = (!code.is_empty())
                        .then(|| Program { code: code.clone(), args: args.clone() });
                }
                Change::TopicDestroy => {
                    state.live = false;
                    state.program = None;
                }
                Change::KeyPut { .. } | Change::KeyDelete { .. } => state.live = true,
                Change::ConfigChange(_) => panic!("config pseudo-events are not applied"),
            }
        }
    }

    fn state_mut(&mut self, topic: &TopicName) -> &mut TopicState {
        self.topics
            .entry(topic.clone())
            .or_insert(TopicState { next_local: 1, live: false, program: None })
    }

    /// Stamps a change as this topic's next event, advancing the local
    /// offset.
    fn event(&mut self, mutation: &Mutation, change: Change) -> Event {
        let state = self.state_mut(&mutation.topic);
        let local_offset = state.next_local;
        state.next_local += 1;
        Event {
            term: mutation.term,
            offset: mutation.offset,
            local_offset,
            topic: mutation.topic.clone(),
            client: mutation.client,
            nonce: mutation.nonce,
            change,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errdata;
    use uuid::Uuid;

    fn mutation(offset: u64, topic: &str, op: Operation) -> Mutation {
        Mutation {
            term: 1,
            offset,
            topic: TopicName::new(topic).unwrap(),
            client: Uuid::from_u128(1),
            nonce: offset,
            op,
        }
    }

    fn put(offset: u64, topic: &str, value: u8) -> Mutation {
        mutation(offset, topic, Operation::Put { key: b"k".to_vec(), value: vec![value] })
    }

    #[test]
    fn raw_topic_lifecycle() {
        let mut topics = Topics::new();
        let create =
            mutation(1, "t", Operation::CreateTopic { code: Vec::new(), args: Vec::new() });
        let (events, error) = topics.project(&create, &RawRuntime);
        assert!(!error);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].local_offset, 1);
        assert!(matches!(events[0].change, Change::TopicCreate { .. }));

        let (events, error) = topics.project(&put(2, "t", 7), &RawRuntime);
        assert!(!error);
        assert_eq!(events[0].local_offset, 2);
        assert_eq!(topics.last_local(&TopicName::new("t").unwrap()), 2);

        // A duplicate create is an error effect with no events.
        let (events, error) = topics.project(&create, &RawRuntime);
        assert!(error);
        assert!(events.is_empty());

        let destroy = mutation(3, "t", Operation::DestroyTopic);
        let (events, error) = topics.project(&destroy, &RawRuntime);
        assert!(!error);
        assert_eq!(events[0].local_offset, 3);

        // Keyed mutations on a destroyed topic fail.
        let (_, error) = topics.project(&put(4, "t", 8), &RawRuntime);
        assert!(error);

        // Re-creating the topic continues its offset sequence.
        let (events, error) = topics.project(&create, &RawRuntime);
        assert!(!error);
        assert_eq!(events[0].local_offset, 4);
    }

    #[test]
    fn implicit_topic() {
        // A put on a topic that was never created starts the stream.
        let mut topics = Topics::new();
        let (events, error) = topics.project(&put(1, "t", 1), &RawRuntime);
        assert!(!error);
        assert_eq!(events[0].local_offset, 1);
        assert!(matches!(events[0].change, Change::KeyPut { .. }));

        // But destroying a topic that was never created fails.
        let (_, error) = topics.project(&mutation(2, "u", Operation::DestroyTopic), &RawRuntime);
        assert!(error);
    }

    struct FanoutRuntime;
    impl Runtime for FanoutRuntime {
        fn run(&self, _: &Program, mutation: &Mutation) -> Result<Vec<Change>> {
            match &mutation.op {
                Operation::Put { key, value } => Ok(vec![
                    Change::KeyPut { key: key.clone(), value: value.clone() },
                    Change::KeyDelete { key: key.clone() },
                ]),
                _ => errdata!("boom"),
            }
        }
    }

    #[test]
    fn programmable_topic() {
        let mut topics = Topics::new();
        let create = mutation(
            1,
            "p",
            Operation::CreateTopic { code: b"code".to_vec(), args: Vec::new() },
        );
        topics.project(&create, &FanoutRuntime);

        // One mutation fans out into two events sharing its global offset.
        let (events, error) = topics.project(&put(2, "p", 1), &FanoutRuntime);
        assert!(!error);
        assert_eq!(events.len(), 2);
        assert_eq!((events[0].local_offset, events[1].local_offset), (2, 3));
        assert!(events.iter().all(|e| e.offset == 2));

        // A runtime failure is a zero-event error outcome without state change.
        let delete = mutation(3, "p", Operation::Delete { key: b"k".to_vec() });
        let (events, error) = topics.project(&delete, &FanoutRuntime);
        assert!(error);
        assert!(events.is_empty());
        assert_eq!(topics.last_local(&TopicName::new("p").unwrap()), 3);
    }

    #[test]
    fn apply_matches_project() {
        // Replaying projected events reproduces the table state.
        let mut projected = Topics::new();
        let mut batches = Vec::new();
        let mutations = [
            mutation(1, "t", Operation::CreateTopic { code: Vec::new(), args: Vec::new() }),
            put(2, "t", 1),
            mutation(3, "p", Operation::CreateTopic { code: b"c".to_vec(), args: Vec::new() }),
            put(4, "p", 2),
            mutation(5, "t", Operation::DestroyTopic),
        ];
        for m in &mutations {
            let (events, error) = projected.project(m, &RawRuntime);
            assert!(!error);
            batches.push(events);
        }

        let mut applied = Topics::new();
        for batch in &batches {
            applied.apply(batch);
        }
        assert_eq!(applied, projected);
    }
}
