//! End-to-end relay scenarios over real WebSocket connections: a scripted
//! host and scripted clients talk to an in-process relay server.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures_util::StreamExt;
use tokio_util::sync::CancellationToken;

use cove::protocol::{Frame, Hello, Input, Payload, Snapshot};
use cove::relay::auth::Authenticator;
use cove::relay::server::RelayState;
use cove::relay::store::ShareScope;
use cove::relay::{Hub, RelayServer, Store, UserStore};
use cove::wsclient::{self, Credentials, WsSink, WsSource};

const RECV_TIMEOUT: Duration = Duration::from_secs(2);

struct TestRelay {
    endpoint: String,
    store: Arc<Store>,
    _cancel: CancellationToken,
}

async fn start_relay() -> TestRelay {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(Store::new());
    let users = Arc::new(UserStore::load(&dir.path().join("users.json")).unwrap());
    let server = RelayServer::new(RelayState {
        store: store.clone(),
        auth: Authenticator::new(users.clone()),
        users,
        hub: Arc::new(Hub::new()),
        data_dir: dir.path().to_path_buf(),
    });
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let router = server.router();
    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            axum::serve(listener, router)
                .with_graceful_shutdown(async move { cancel.cancelled().await })
                .await
                .unwrap();
        });
    }
    // Keep the tempdir alive for the duration of the test process.
    std::mem::forget(dir);
    TestRelay {
        endpoint: format!("http://{addr}"),
        store,
        _cancel: cancel,
    }
}

impl TestRelay {
    fn access_token(&self) -> String {
        self.store.create_access_token("tester", Utc::now()).token
    }

    fn share_token(&self, session_id: &str, scope: ShareScope) -> String {
        self.store
            .create_share_token(session_id, scope, None, Utc::now())
            .unwrap()
            .token
    }
}

async fn connect_host(relay: &TestRelay, session_id: &str) -> (WsSink, WsSource) {
    let token = relay.access_token();
    let stream = wsclient::connect(&relay.endpoint, "/ws/host", Credentials::Bearer(&token))
        .await
        .unwrap();
    let (mut sink, source) = stream.split();
    let hello = Frame::new(
        session_id,
        Payload::Hello(Hello {
            cols: 80,
            rows: 24,
            client_type: "host".into(),
            ..Default::default()
        }),
    );
    wsclient::write_frame(&mut sink, &hello).await.unwrap();
    (sink, source)
}

async fn connect_client(
    relay: &TestRelay,
    session_id: &str,
    client_id: &str,
    wants_control: bool,
    credentials: Credentials<'_>,
) -> (WsSink, WsSource) {
    let stream = wsclient::connect(&relay.endpoint, "/ws/client", credentials)
        .await
        .unwrap();
    let (mut sink, source) = stream.split();
    let hello = Frame::new(
        session_id,
        Payload::Hello(Hello {
            client_id: client_id.into(),
            cols: 80,
            rows: 24,
            wants_control,
            client_type: "attach".into(),
            ..Default::default()
        }),
    );
    wsclient::write_frame(&mut sink, &hello).await.unwrap();
    (sink, source)
}

async fn recv(source: &mut WsSource) -> Frame {
    tokio::time::timeout(RECV_TIMEOUT, wsclient::next_frame(source))
        .await
        .expect("timed out waiting for frame")
        .expect("stream closed unexpectedly")
}

/// Receive frames until one matches, failing on timeout.
async fn recv_until(source: &mut WsSource, mut matches: impl FnMut(&Frame) -> bool) -> Frame {
    loop {
        let frame = recv(source).await;
        if matches(&frame) {
            return frame;
        }
    }
}

fn text_snapshot(text: &str) -> Snapshot {
    let mut snap = Snapshot::blank(80, 24);
    for (i, ch) in text.chars().enumerate() {
        snap.runes[i] = ch as u32;
    }
    snap
}

fn snapshot_text(snap: &Snapshot) -> String {
    snap.runes
        .iter()
        .filter_map(|&r| char::from_u32(r))
        .collect()
}

#[tokio::test]
async fn client_without_host_gets_error_and_close() {
    let relay = start_relay().await;
    let token = relay.share_token("lonely", ShareScope::View);
    let (_sink, mut source) = connect_client(
        &relay,
        "lonely",
        "c1",
        false,
        Credentials::ShareToken(&token),
    )
    .await;
    let frame = recv(&mut source).await;
    match frame.payload {
        Payload::Error(err) => assert_eq!(err.message, "no host connected"),
        other => panic!("expected error, got {other:?}"),
    }
}

#[tokio::test]
async fn host_disconnect_is_broadcast_to_clients() {
    let relay = start_relay().await;
    let (host_sink, host_source) = connect_host(&relay, "s1").await;

    let token = relay.access_token();
    let (_sink, mut source) =
        connect_client(&relay, "s1", "c1", false, Credentials::Bearer(&token)).await;
    recv_until(&mut source, |frame| {
        matches!(frame.payload, Payload::Welcome(_))
    })
    .await;

    // Tear the host connection down entirely.
    drop(host_sink);
    drop(host_source);

    let frame = recv_until(&mut source, |frame| {
        matches!(frame.payload, Payload::Error(_))
    })
    .await;
    match frame.payload {
        Payload::Error(err) => assert_eq!(err.message, "host disconnected"),
        _ => unreachable!(),
    }
}

#[tokio::test]
async fn control_handoff_reaches_everyone() {
    let relay = start_relay().await;
    let (mut host_sink, mut host_source) = connect_host(&relay, "s1").await;

    let t1 = relay.share_token("s1", ShareScope::Control);
    let (_c1_sink, mut c1_source) =
        connect_client(&relay, "s1", "c1", true, Credentials::ShareToken(&t1)).await;
    let welcome = recv_until(&mut c1_source, |frame| {
        matches!(frame.payload, Payload::Welcome(_))
    })
    .await;
    match welcome.payload {
        Payload::Welcome(welcome) => {
            assert!(welcome.granted_control);
            assert_eq!(welcome.holder_client_id, "c1");
        }
        _ => unreachable!(),
    }

    let t2 = relay.share_token("s1", ShareScope::Control);
    let (mut c2_sink, mut c2_source) =
        connect_client(&relay, "s1", "c2", false, Credentials::ShareToken(&t2)).await;
    let welcome = recv_until(&mut c2_source, |frame| {
        matches!(frame.payload, Payload::Welcome(_))
    })
    .await;
    match welcome.payload {
        Payload::Welcome(welcome) => {
            assert!(!welcome.granted_control);
            assert_eq!(welcome.holder_client_id, "c1");
        }
        _ => unreachable!(),
    }

    // Client 2 types; it seizes the lease.
    let input = Frame::new(
        "s1",
        Payload::Input(Input {
            data: b"TWO\r\n".to_vec(),
        }),
    );
    wsclient::write_frame(&mut c2_sink, &input).await.unwrap();

    // Everyone observes exactly the new holder (client 1 first saw its own
    // grant broadcast, so match on the handoff specifically).
    for source in [&mut c1_source, &mut c2_source, &mut host_source] {
        recv_until(source, |frame| {
            matches!(&frame.payload, Payload::Control(control) if control.holder_client_id == "c2")
        })
        .await;
    }

    // The host sees the input and publishes the resulting screen.
    let input = recv_until(&mut host_source, |frame| {
        matches!(frame.payload, Payload::Input(_))
    })
    .await;
    match &input.payload {
        Payload::Input(input) => assert_eq!(input.data, b"TWO\r\n"),
        _ => unreachable!(),
    }
    let snap = Frame::new("s1", Payload::Snapshot(text_snapshot("TWO")));
    wsclient::write_frame(&mut host_sink, &snap).await.unwrap();

    for source in [&mut c1_source, &mut c2_source] {
        let frame = recv_until(source, |frame| {
            matches!(frame.payload, Payload::Snapshot(_))
        })
        .await;
        assert!(frame.seq > 0);
        match frame.payload {
            Payload::Snapshot(snap) => assert!(snapshot_text(&snap).contains("TWO")),
            _ => unreachable!(),
        }
    }
}

#[tokio::test]
async fn view_scope_input_is_rejected_but_connection_survives() {
    let relay = start_relay().await;
    let (mut host_sink, _host_source) = connect_host(&relay, "s1").await;

    let token = relay.share_token("s1", ShareScope::View);
    let (mut sink, mut source) =
        connect_client(&relay, "s1", "viewer", false, Credentials::ShareToken(&token)).await;
    recv_until(&mut source, |frame| {
        matches!(frame.payload, Payload::Welcome(_))
    })
    .await;

    let input = Frame::new(
        "s1",
        Payload::Input(Input {
            data: b"x".to_vec(),
        }),
    );
    wsclient::write_frame(&mut sink, &input).await.unwrap();
    let frame = recv_until(&mut source, |frame| {
        matches!(frame.payload, Payload::Error(_))
    })
    .await;
    match frame.payload {
        Payload::Error(err) => assert_eq!(err.message, "control not permitted"),
        _ => unreachable!(),
    }

    // Still attached: a host snapshot arrives afterwards.
    let snap = Frame::new("s1", Payload::Snapshot(text_snapshot("ok")));
    wsclient::write_frame(&mut host_sink, &snap).await.unwrap();
    let frame = recv_until(&mut source, |frame| {
        matches!(frame.payload, Payload::Snapshot(_))
    })
    .await;
    assert_eq!(frame.seq, 1);
}

#[tokio::test]
async fn hello_resync_produces_fresh_snapshot_with_next_seq() {
    let relay = start_relay().await;
    let (mut host_sink, mut host_source) = connect_host(&relay, "s1").await;

    let token = relay.access_token();
    let (mut sink, mut source) =
        connect_client(&relay, "s1", "c1", false, Credentials::Bearer(&token)).await;
    recv_until(&mut source, |frame| {
        matches!(frame.payload, Payload::Welcome(_))
    })
    .await;

    let snap = Frame::new("s1", Payload::Snapshot(text_snapshot("one")));
    wsclient::write_frame(&mut host_sink, &snap).await.unwrap();
    let first = recv_until(&mut source, |frame| {
        matches!(frame.payload, Payload::Snapshot(_))
    })
    .await;
    assert_eq!(first.seq, 1);

    // Client requests resync; the relay forwards the Hello to the host,
    // which answers with a fresh snapshot stamped with the next seq.
    let hello = Frame::new(
        "s1",
        Payload::Hello(Hello {
            client_id: "c1".into(),
            cols: 80,
            rows: 24,
            last_seq: 1,
            client_type: "attach".into(),
            ..Default::default()
        }),
    );
    wsclient::write_frame(&mut sink, &hello).await.unwrap();

    recv_until(&mut host_source, |frame| {
        matches!(&frame.payload, Payload::Hello(hello) if hello.last_seq == 1)
    })
    .await;
    let snap = Frame::new("s1", Payload::Snapshot(text_snapshot("two")));
    wsclient::write_frame(&mut host_sink, &snap).await.unwrap();

    let second = recv_until(&mut source, |frame| {
        matches!(frame.payload, Payload::Snapshot(_))
    })
    .await;
    assert_eq!(second.seq, 2);
}

#[tokio::test]
async fn new_host_replaces_previous_one() {
    let relay = start_relay().await;
    let (_first_sink, mut first_source) = connect_host(&relay, "s1").await;
    let (_second_sink, _second_source) = connect_host(&relay, "s1").await;

    // The first host's stream ends once it is evicted.
    let closed = tokio::time::timeout(RECV_TIMEOUT, async {
        loop {
            if wsclient::next_frame(&mut first_source).await.is_none() {
                return;
            }
        }
    })
    .await;
    assert!(closed.is_ok(), "evicted host stream should close");
}

#[tokio::test]
async fn expired_share_token_is_rejected() {
    let relay = start_relay().await;
    let token = relay
        .store
        .create_share_token(
            "s1",
            ShareScope::View,
            Some(Duration::from_secs(1)),
            Utc::now() - chrono::Duration::hours(1),
        )
        .unwrap()
        .token;
    let result = wsclient::connect(
        &relay.endpoint,
        "/ws/client",
        Credentials::ShareToken(&token),
    )
    .await;
    assert!(result.is_err());
}
