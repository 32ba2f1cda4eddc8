//! Replication server and client over loopback TCP.

mod fixtures;

use std::net::{Shutdown, TcpStream};
use std::thread;
use std::time::{Duration, Instant};

use shardrepl::core::{ErrorCode, ErrorPayload, Limits, ReplicationTaskAttributes, TaskId};
use shardrepl::repl::{
    AckManagerConfig, ClientError, FrameReader, FrameWriter, GetMessages, ReplEnvelope,
    ReplMessage, ReplicationClient, decode_envelope, encode_envelope,
};
use shardrepl::test_harness::history_descriptor;

use fixtures::repl_rig::{ReplRig, cluster, ids, short_poll};

#[test]
fn client_polls_and_fetches_over_tcp() {
    let rig = ReplRig::start(short_poll(2), 4);
    rig.shard.commit_history(1..=3);
    let mut client = rig.client();

    let first = client
        .get_messages(&cluster("west"), TaskId::ZERO, None)
        .expect("first poll");
    assert_eq!(ids(&first), vec![1, 2]);
    assert!(first.has_more);

    let second = client
        .get_messages(&cluster("west"), first.last_retrieved_message_id, None)
        .expect("second poll");
    assert_eq!(ids(&second), vec![3]);
    assert!(!second.has_more);
    assert_eq!(second.last_retrieved_message_id, TaskId::new(3));

    let task = client.get_task(&history_descriptor(2)).expect("get task");
    let ReplicationTaskAttributes::History(attrs) = task.attributes else {
        panic!("expected history task");
    };
    assert_eq!(attrs.events.data.as_ref(), b"events-2");
}

#[test]
fn remote_errors_carry_code_and_task() {
    let rig = ReplRig::start(short_poll(10), 4);
    let mut client = rig.client();

    let err = client
        .get_task(&history_descriptor(42))
        .expect_err("nothing stored");
    let payload = match err {
        ClientError::Remote(payload) => payload,
        other => panic!("expected remote error, got {other:?}"),
    };
    assert_eq!(payload.code, ErrorCode::NotFound);
    assert_eq!(payload.task_id, Some(TaskId::new(42)));
    assert!(!payload.retryable);

    // The connection survives an error response.
    let messages = client
        .get_messages(&cluster("west"), TaskId::ZERO, Some(Duration::from_millis(20)))
        .expect("poll after error");
    assert!(messages.is_empty());
}

#[test]
fn client_wait_bounds_long_poll() {
    let config = AckManagerConfig {
        long_poll_timeout: Duration::from_secs(30),
        ..AckManagerConfig::default()
    };
    let rig = ReplRig::start(config, 4);
    let mut client = rig.client();

    let start = Instant::now();
    let messages = client
        .get_messages(&cluster("west"), TaskId::ZERO, Some(Duration::from_millis(100)))
        .expect("poll");
    assert!(messages.is_empty());
    assert!(start.elapsed() < Duration::from_secs(5));
}

#[test]
fn connections_over_limit_are_refused() {
    let rig = ReplRig::start(short_poll(10), 1);
    let mut first = rig.client();
    first
        .get_messages(&cluster("west"), TaskId::ZERO, Some(Duration::from_millis(10)))
        .expect("first connection is served");

    let mut second = rig.client();
    let err = second
        .get_messages(&cluster("east"), TaskId::ZERO, Some(Duration::from_millis(10)))
        .expect_err("second connection is refused");
    match err {
        ClientError::Remote(payload) => {
            assert_eq!(payload.code, ErrorCode::Overloaded);
            assert!(payload.retryable);
        }
        ClientError::Closed | ClientError::Io(_) | ClientError::Frame(_) => {}
        other => panic!("unexpected error: {other:?}"),
    }
}

#[test]
fn departed_poller_frees_its_connection_slot() {
    let config = AckManagerConfig {
        long_poll_timeout: Duration::from_secs(30),
        ..AckManagerConfig::default()
    };
    let rig = ReplRig::start(config, 1);

    let raw = TcpStream::connect(rig.addr()).expect("connect");
    let mut writer = FrameWriter::new(
        raw.try_clone().expect("clone stream"),
        Limits::default().max_frame_bytes,
    );
    let request = encode_envelope(&ReplEnvelope::v1(ReplMessage::GetMessages(GetMessages {
        polling_cluster: cluster("gone"),
        last_retrieved_message_id: TaskId::ZERO,
        wait_timeout_ms: None,
    })))
    .expect("encode request");
    writer.write_frame(&request).expect("write request");
    thread::sleep(Duration::from_millis(150));
    raw.shutdown(Shutdown::Both).expect("close stream");
    drop(writer);
    drop(raw);

    let start = Instant::now();
    let messages = loop {
        let mut client = rig.client();
        match client.get_messages(&cluster("next"), TaskId::ZERO, Some(Duration::from_millis(10))) {
            Ok(messages) => break messages,
            Err(_) if start.elapsed() < Duration::from_secs(2) => {
                thread::sleep(Duration::from_millis(50));
            }
            Err(err) => panic!("slot still held after {:?}: {err:?}", start.elapsed()),
        }
    };
    assert!(messages.is_empty());
    assert!(start.elapsed() < Duration::from_secs(2));
}

#[test]
fn refused_peers_do_not_stall_accepts() {
    let rig = ReplRig::start(short_poll(10), 1);
    let mut holder = rig.client();
    holder
        .get_messages(&cluster("west"), TaskId::ZERO, Some(Duration::from_millis(10)))
        .expect("holder is served");

    // Silent peers make the server wait out its drain for each of them.
    let start = Instant::now();
    let peers: Vec<TcpStream> = (0..5)
        .map(|_| TcpStream::connect(rig.addr()).expect("connect"))
        .collect();
    for peer in peers {
        let mut reader = FrameReader::new(peer, Limits::default().max_frame_bytes);
        let frame = reader
            .read_next()
            .expect("read reply")
            .expect("overloaded reply");
        let envelope = decode_envelope(&frame, &Limits::default()).expect("decode reply");
        assert!(matches!(
            envelope.message,
            ReplMessage::Error(ErrorPayload {
                code: ErrorCode::Overloaded,
                ..
            })
        ));
    }
    assert!(
        start.elapsed() < Duration::from_millis(600),
        "refusals took {:?}",
        start.elapsed()
    );
}

#[test]
fn shutdown_releases_blocked_poller() {
    let config = AckManagerConfig {
        long_poll_timeout: Duration::from_secs(30),
        ..AckManagerConfig::default()
    };
    let mut rig = ReplRig::start(config, 4);
    let mut client = rig.client();

    let poller = thread::spawn(move || {
        let start = Instant::now();
        let result = client.get_messages(&cluster("west"), TaskId::ZERO, None);
        (result, start.elapsed())
    });

    thread::sleep(Duration::from_millis(150));
    rig.shutdown();

    let (result, elapsed) = poller.join().expect("poller thread");
    assert!(elapsed < Duration::from_secs(10), "released after {elapsed:?}");
    match result {
        Err(ClientError::Remote(payload)) => {
            assert!(matches!(
                payload.code,
                ErrorCode::Cancelled | ErrorCode::ShuttingDown
            ));
        }
        Err(ClientError::Closed | ClientError::Io(_) | ClientError::Frame(_)) => {}
        other => panic!("unexpected poll result: {other:?}"),
    }
}

#[test]
fn connect_to_closed_port_fails() {
    let rig = ReplRig::start(short_poll(10), 1);
    let addr = rig.addr();
    drop(rig);
    assert!(ReplicationClient::connect(addr, Limits::default()).is_err());
}
