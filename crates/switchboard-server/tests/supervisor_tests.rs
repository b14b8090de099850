//! Integration tests for the operator supervisor.
//!
//! Each test starts a supervisor on an ephemeral localhost port with an
//! in-memory document and talks to it through real TCP event streams. The
//! JSON logger is installed per test (current-thread runtime), writing into
//! the same fan-out the supervisor attaches operator log feeds to, so log
//! statements arrive at connected operators as events.

#![allow(clippy::unwrap_used)]

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use switchboard_fanout::Fanout;
use switchboard_server::config::OperatorsConfig;
use switchboard_server::{ServerError, Supervisor, implant, logging};
use switchboard_store::{Manager, StoreOptions};
use switchboard_stream::{Stream, StreamError};
use switchboard_types::events::{OPERATOR_CONNECTED, OPERATOR_DISCONNECTED, TASK_QUEUED};
use switchboard_types::{
    Document, EVENT_ENQUEUE, EVENT_GOODBYE, EVENT_NAME, EVENT_SEEN, EnqueueRequest, Goodbye,
    Hello, OperatorConnected, OperatorDisconnected, Sighting, TaskQueued,
};
use tokio::io::AsyncReadExt as _;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

const WAIT: Duration = Duration::from_secs(20);

struct Server {
    supervisor: Supervisor,
    store: Arc<Manager<Document>>,
    addr: SocketAddr,
    accept_loop: JoinHandle<Result<(), ServerError>>,
}

fn settings(name_timeout_ms: u64) -> OperatorsConfig {
    OperatorsConfig {
        name_timeout_ms,
        accept_backoff_ms: 50,
        log_pipe_capacity: 8192,
    }
}

async fn start(fanout: Fanout, settings: OperatorsConfig) -> Server {
    let store = Manager::open(StoreOptions::default(), None).await.unwrap();
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let supervisor = Supervisor::new(Arc::clone(&store), fanout, settings);
    let accept_loop = tokio::spawn({
        let supervisor = supervisor.clone();
        async move { supervisor.serve(listener).await }
    });
    Server {
        supervisor,
        store,
        addr,
        accept_loop,
    }
}

/// Connect and announce `name`.
async fn connect(addr: SocketAddr, name: &str) -> Arc<Stream> {
    let conn = TcpStream::connect(addr).await.unwrap();
    let stream = Arc::new(Stream::new(conn));
    stream
        .send(
            EVENT_NAME,
            &Hello {
                name: name.to_owned(),
            },
        )
        .await
        .unwrap();
    stream
}

fn spawn_receiver(stream: &Arc<Stream>) -> JoinHandle<Result<(), StreamError>> {
    let stream = Arc::clone(stream);
    tokio::spawn(async move { stream.run().await })
}

/// Forward every `seen` answer into a channel.
fn collect_seen(stream: &Stream) -> mpsc::UnboundedReceiver<Vec<Sighting>> {
    let (tx, rx) = mpsc::unbounded_channel();
    stream.on(EVENT_SEEN, move |_, seen: Vec<Sighting>| {
        let _ = tx.send(seen);
        async {}
    });
    rx
}

/// Round-trip a `seen` request. Once it is answered the server has finished
/// the handshake and this operator's log feed is attached.
async fn list_seen(
    stream: &Stream,
    answers: &mut mpsc::UnboundedReceiver<Vec<Sighting>>,
) -> Vec<Sighting> {
    stream.send(EVENT_SEEN, &()).await.unwrap();
    tokio::time::timeout(WAIT, answers.recv())
        .await
        .unwrap()
        .unwrap()
}

#[tokio::test(flavor = "current_thread")]
async fn connection_churn_is_fully_reported() {
    const CONNECTIONS: usize = 200;

    let fanout = Fanout::new();
    let _log = tracing::subscriber::set_default(logging::subscriber(fanout.clone(), "info"));
    let server = start(fanout, settings(5_000)).await;

    let watcher = connect(server.addr, "watcher").await;
    let (tx, mut rx) = mpsc::unbounded_channel();
    {
        let tx = tx.clone();
        watcher.on(OPERATOR_CONNECTED, move |_, ev: OperatorConnected| {
            let _ = tx.send((true, ev.number));
            async {}
        });
    }
    watcher.on(OPERATOR_DISCONNECTED, move |_, ev: OperatorDisconnected| {
        let _ = tx.send((false, ev.number));
        async {}
    });
    let mut answers = collect_seen(&watcher);
    let _receiver = spawn_receiver(&watcher);
    let _ = list_seen(&watcher, &mut answers).await;

    let mut clients = Vec::new();
    for _ in 0..CONNECTIONS {
        let addr = server.addr;
        clients.push(tokio::spawn(async move {
            drop(TcpStream::connect(addr).await.unwrap());
        }));
    }
    for client in clients {
        client.await.unwrap();
    }

    let mut connected = std::collections::HashSet::new();
    let mut disconnected = std::collections::HashSet::new();
    while connected.len() < CONNECTIONS || disconnected.len() < CONNECTIONS {
        let (up, number) = tokio::time::timeout(WAIT, rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_ne!(number, 1, "watcher's own events are not expected");
        let fresh = if up {
            connected.insert(number)
        } else {
            disconnected.insert(number)
        };
        assert!(fresh, "duplicate notification for connection {number}");
    }
    assert_eq!(connected, disconnected);

    server.supervisor.shutdown(None).await;
}

#[tokio::test(flavor = "current_thread")]
async fn enqueue_validates_and_echoes() {
    let fanout = Fanout::new();
    let _log = tracing::subscriber::set_default(logging::subscriber(fanout.clone(), "info"));
    let server = start(fanout, settings(5_000)).await;

    let alice = connect(server.addr, "alice").await;
    let (echo_tx, mut echoes) = mpsc::unbounded_channel();
    alice.on(EVENT_ENQUEUE, move |_, echo: EnqueueRequest| {
        let _ = echo_tx.send(echo);
        async {}
    });
    let (queued_tx, mut queued) = mpsc::unbounded_channel();
    alice.on(TASK_QUEUED, move |_, ev: TaskQueued| {
        let _ = queued_tx.send(ev);
        async {}
    });
    let mut answers = collect_seen(&alice);
    let _receiver = spawn_receiver(&alice);
    let _ = list_seen(&alice, &mut answers).await;

    for (id, task, expected) in [
        ("", "whoami", "missing implant ID"),
        ("i-1", "", "missing task"),
        ("i-1", "whoami", ""),
    ] {
        alice
            .send(EVENT_ENQUEUE, &EnqueueRequest::new(id, task))
            .await
            .unwrap();
        let echo = tokio::time::timeout(WAIT, echoes.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!((echo.id.as_str(), echo.task.as_str()), (id, task));
        assert_eq!(echo.error, expected);
    }

    assert_eq!(server.store.read().await.pending("i-1"), ["whoami"]);
    assert_eq!(server.store.read().await.task_q.len(), 1);

    let ev = tokio::time::timeout(WAIT, queued.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(
        ev,
        TaskQueued {
            id: "i-1".to_owned(),
            task: "whoami".to_owned(),
            operator: "alice".to_owned(),
        }
    );

    server.supervisor.shutdown(None).await;
}

#[tokio::test(flavor = "current_thread")]
async fn seen_lists_sightings_newest_first() {
    let server = start(Fanout::new(), settings(5_000)).await;
    for i in 0..5 {
        let from = format!("10.0.0.{i}");
        let _ = implant::check_in(&server.store, &format!("id-{i}"), &from, 16)
            .await
            .unwrap();
    }
    let _ = implant::check_in(&server.store, "id-2", "10.9.9.9", 16)
        .await
        .unwrap();

    let op = connect(server.addr, "bob").await;
    let mut answers = collect_seen(&op);
    let _receiver = spawn_receiver(&op);
    let seen = list_seen(&op, &mut answers).await;

    let got: Vec<(&str, &str)> = seen
        .iter()
        .map(|s| (s.id.as_str(), s.from.as_str()))
        .collect();
    assert_eq!(
        got,
        [
            ("id-2", "10.9.9.9"),
            ("id-4", "10.0.0.4"),
            ("id-3", "10.0.0.3"),
            ("id-1", "10.0.0.1"),
            ("id-0", "10.0.0.0"),
        ]
    );

    server.supervisor.shutdown(None).await;
}

#[tokio::test(flavor = "current_thread")]
async fn shutdown_says_goodbye_and_drains() {
    let server = start(Fanout::new(), settings(5_000)).await;

    let op = connect(server.addr, "carol").await;
    let (tx, mut goodbyes) = mpsc::unbounded_channel();
    op.on(EVENT_GOODBYE, move |_, bye: Goodbye| {
        let _ = tx.send(bye.message);
        async {}
    });
    let mut answers = collect_seen(&op);
    let receiver = spawn_receiver(&op);
    let _ = list_seen(&op, &mut answers).await;
    assert_eq!(server.supervisor.connections(), 1);

    tokio::time::timeout(WAIT, server.supervisor.shutdown(Some("maintenance window")))
        .await
        .unwrap();

    assert_eq!(
        goodbyes.recv().await.as_deref(),
        Some("maintenance window")
    );
    tokio::time::timeout(WAIT, receiver)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert_eq!(server.supervisor.connections(), 0);
    server.accept_loop.await.unwrap().unwrap();
}

#[tokio::test(flavor = "current_thread")]
async fn silent_operator_gets_a_synthesized_name() {
    let fanout = Fanout::new();
    let _log = tracing::subscriber::set_default(logging::subscriber(fanout.clone(), "info"));
    let server = start(fanout, settings(100)).await;

    let watcher = connect(server.addr, "watcher").await;
    let (tx, mut names) = mpsc::unbounded_channel();
    watcher.on(OPERATOR_CONNECTED, move |_, ev: OperatorConnected| {
        let _ = tx.send((ev.number, ev.name));
        async {}
    });
    let mut answers = collect_seen(&watcher);
    let _receiver = spawn_receiver(&watcher);
    let _ = list_seen(&watcher, &mut answers).await;

    let silent = TcpStream::connect(server.addr).await.unwrap();
    let (number, name) = tokio::time::timeout(WAIT, names.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(number, 2);
    assert_eq!(name, "operator-2");

    let _named = connect(server.addr, "dave").await;
    let (_, name) = tokio::time::timeout(WAIT, names.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(name, "dave");

    drop(silent);
    server.supervisor.shutdown(None).await;
}

#[tokio::test]
async fn connections_after_shutdown_are_dropped() {
    let server = start(Fanout::new(), settings(5_000)).await;
    server.supervisor.shutdown(None).await;

    let (left, mut right) = tokio::io::duplex(1024);
    tokio::time::timeout(
        WAIT,
        server.supervisor.handle(left, "in-memory".to_owned()),
    )
    .await
    .unwrap();

    let mut rest = Vec::new();
    right.read_to_end(&mut rest).await.unwrap();
    assert!(rest.is_empty());
    assert_eq!(server.supervisor.connections(), 0);
}
