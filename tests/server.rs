//! End-to-end tests driving live server nodes over TCP with the client
//! library.

use laminar::encoding::wire;
use laminar::error::Result;
use laminar::types::{Change, Request, Response};
use laminar::{Client, Listener, Server};

use crossbeam::channel::Sender;
use pretty_assertions::assert_eq;
use std::net::{SocketAddr, TcpListener, TcpStream};
use tempdir::TempDir;
use uuid::Uuid;

struct TestNode {
    client_addr: SocketAddr,
    stop_tx: Sender<()>,
    _dir: TempDir,
}

impl TestNode {
    /// Starts a single bootstrap node on ephemeral ports.
    fn spawn() -> TestNode {
        let dir = TempDir::new("laminar-test").unwrap();
        let client_listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let peer_listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let client_addr = client_listener.local_addr().unwrap();
        let cluster_addr = peer_listener.local_addr().unwrap();
        let server = Server::new(dir.path(), cluster_addr, client_addr).unwrap();
        let (stop_tx, stop_rx) = crossbeam::channel::bounded(1);
        std::thread::spawn(move || {
            server.serve(client_listener, peer_listener, stop_rx).unwrap()
        });
        TestNode { client_addr, stop_tx, _dir: dir }
    }
}

impl Drop for TestNode {
    fn drop(&mut self) {
        self.stop_tx.send(()).ok();
    }
}

#[test]
fn single_node_commit() -> Result<()> {
    let node = TestNode::spawn();
    let mut client = Client::connect(node.client_addr)?;
    assert_eq!(client.next_nonce(), 1);
    assert_eq!(client.commit_offset(), 0);
    assert_eq!(client.config().entries.len(), 1);

    let commit = client.put("t", b"", &[1])?;
    assert_eq!(commit, laminar::client::Commit { offset: 1, error: false });
    assert_eq!(client.commit_offset(), 1);

    // A listener on the topic from offset 0 sees the single put.
    let mut listener = Listener::connect(node.client_addr, "t", 0)?;
    let event = listener.recv()?;
    assert_eq!(event.local_offset, 1);
    assert_eq!(event.offset, 1);
    assert_eq!(event.nonce, 1);
    assert_eq!(event.change, Change::KeyPut { key: Vec::new(), value: vec![1] });
    Ok(())
}

#[test]
fn listener_catches_up_and_follows() -> Result<()> {
    let node = TestNode::spawn();
    let mut client = Client::connect(node.client_addr)?;
    client.create_topic("orders", b"", b"")?;
    client.put("orders", b"a", &[1])?;

    // The committed history is served from the log store...
    let mut listener = Listener::connect(node.client_addr, "orders", 0)?;
    let event = listener.recv()?;
    assert_eq!(event.local_offset, 1);
    assert!(matches!(event.change, Change::TopicCreate { .. }));
    let event = listener.recv()?;
    assert_eq!(event.local_offset, 2);
    assert_eq!(event.change, Change::KeyPut { key: b"a".to_vec(), value: vec![1] });

    // ...and new commits stream in as they land.
    client.put("orders", b"b", &[2])?;
    let event = listener.recv()?;
    assert_eq!(event.local_offset, 3);
    assert_eq!(event.change, Change::KeyPut { key: b"b".to_vec(), value: vec![2] });
    Ok(())
}

#[test]
fn mid_stream_listener_resumes() -> Result<()> {
    let node = TestNode::spawn();
    let mut client = Client::connect(node.client_addr)?;
    for n in 1..=4u8 {
        client.put("t", &[n], &[n])?;
    }
    // A listener resuming after local offset 2 sees only 3 and 4.
    let mut listener = Listener::connect(node.client_addr, "t", 2)?;
    assert_eq!(listener.recv()?.local_offset, 3);
    assert_eq!(listener.recv()?.local_offset, 4);
    Ok(())
}

#[test]
fn reconnect_replays_missed_acks() -> Result<()> {
    let node = TestNode::spawn();
    let mut client = Client::connect(node.client_addr)?;
    let id = client.id();
    for n in 1..=3u8 {
        client.put("t", b"k", &[n])?;
    }
    drop(client);

    // The client saw the commit of nonce 1 only. The server replays the
    // acks for everything after that commit horizon, then hands the session
    // back at the next free nonce.
    let (client, replayed) = Client::reconnect(node.client_addr, id, 1, 2)?;
    assert_eq!(
        replayed,
        vec![
            Response::Received { nonce: 2, commit_offset: 2 },
            Response::Committed { nonce: 2, commit_offset: 2, error: false },
            Response::Received { nonce: 3, commit_offset: 3 },
            Response::Committed { nonce: 3, commit_offset: 3, error: false },
        ],
    );
    assert_eq!(client.next_nonce(), 4);
    assert_eq!(client.commit_offset(), 3);
    Ok(())
}

#[test]
fn reconnect_with_nothing_missed_is_ready_immediately() -> Result<()> {
    let node = TestNode::spawn();
    let mut client = Client::connect(node.client_addr)?;
    client.put("t", b"k", &[1])?;
    let id = client.id();
    drop(client);

    let (client, replayed) = Client::reconnect(node.client_addr, id, 1, 2)?;
    assert_eq!(replayed, Vec::new());
    assert_eq!(client.next_nonce(), 2);
    Ok(())
}

#[test]
fn bad_nonce_is_rejected_without_state_change() -> Result<()> {
    let node = TestNode::spawn();
    let mut stream = TcpStream::connect(node.client_addr)?;
    let client = Uuid::new_v4();
    wire::write_frame(&mut stream, &Request::Handshake { client }.encode())?;
    let mut reader = std::io::BufReader::new(stream.try_clone()?);
    let frame = wire::read_frame(&mut reader)?.expect("ready");
    assert!(matches!(Response::decode(&frame)?, Response::Ready { nonce: 1, .. }));

    // Nonce 5 is out of sequence; the expected nonce is 1.
    let topic = laminar::types::TopicName::new("t")?;
    let put = Request::Put { nonce: 5, topic: topic.clone(), key: vec![], value: vec![1] };
    wire::write_frame(&mut stream, &put.encode())?;
    let frame = wire::read_frame(&mut reader)?.expect("error response");
    assert_eq!(Response::decode(&frame)?, Response::Error { nonce: 5 });

    // The expected nonce still works.
    let put = Request::Put { nonce: 1, topic, key: vec![], value: vec![1] };
    wire::write_frame(&mut stream, &put.encode())?;
    let frame = wire::read_frame(&mut reader)?.expect("received response");
    assert_eq!(Response::decode(&frame)?, Response::Received { nonce: 1, commit_offset: 0 });
    Ok(())
}

#[test]
fn destroyed_topic_rejects_mutations() -> Result<()> {
    let node = TestNode::spawn();
    let mut client = Client::connect(node.client_addr)?;
    client.create_topic("t", b"", b"")?;
    client.put("t", b"k", &[1])?;
    client.destroy_topic("t")?;

    // The put commits, but with an error effect and no events.
    let commit = client.put("t", b"k", &[2])?;
    assert!(commit.error);
    Ok(())
}

#[test]
fn config_update_reaches_clients_and_listeners() -> Result<()> {
    let node = TestNode::spawn();
    let mut client = Client::connect(node.client_addr)?;
    client.put("t", b"k", &[1])?;

    // Receiving the put proves the subscription is live before the config
    // change commits.
    let mut listener = Listener::connect(node.client_addr, "t", 0)?;
    assert_eq!(listener.recv()?.local_offset, 1);

    // Re-submitting the current single-node config exercises the commit and
    // broadcast machinery without changing membership.
    let entries = client.config().entries.clone();
    let commit = client.update_config(entries.clone())?;
    assert_eq!(commit.offset, 2);

    // The waiting listener observes the config as a pseudo-event with
    // sentinel offsets and a zero client id.
    let event = listener.recv()?;
    assert_eq!(event.offset, u64::MAX);
    assert_eq!(event.local_offset, u64::MAX);
    assert_eq!(event.client, Uuid::nil());
    assert_eq!(event.change, Change::ConfigChange(laminar::types::ClusterConfig { entries }));
    Ok(())
}

#[test]
fn config_growth_to_two_nodes() -> Result<()> {
    let a = TestNode::spawn();
    let b = TestNode::spawn();

    // Each bootstrap node reports a single-member config naming itself;
    // that's how clients learn node identities to compose new configs.
    let client_b = Client::connect(b.client_addr)?;
    let entry_b = client_b.config().entries[0].clone();
    let mut client_a = Client::connect(a.client_addr)?;
    let entry_a = client_a.config().entries[0].clone();
    assert_ne!(entry_a.id, entry_b.id);

    // A synchronizing put proves the listener is live before the change.
    client_a.put("t", b"k", &[1])?;
    let mut listener = Listener::connect(a.client_addr, "t", 0)?;
    assert_eq!(listener.recv()?.local_offset, 1);

    // The config change only commits once B has joined and acked it.
    let commit = client_a.update_config(vec![entry_a.clone(), entry_b.clone()])?;
    assert_eq!(commit.offset, 2);
    assert!(!commit.error);

    let event = listener.recv()?;
    match event.change {
        Change::ConfigChange(config) => {
            assert_eq!(config.entries, vec![entry_a, entry_b]);
        }
        change => panic!("expected config change, got {change:?}"),
    }

    // The grown cluster still commits mutations, now requiring B's ack.
    let commit = client_a.put("t", b"k", &[2])?;
    assert_eq!(commit.offset, 3);
    Ok(())
}
