use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tracing::debug;

use crate::protocol::{Frame, Payload};
use crate::relay::store::ShareScope;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Role {
    Host,
    Client,
}

/// One registered stream participant. Sends are serialized by the
/// implementation; the hub never holds its lock across a send.
#[async_trait]
pub trait Connection: Send + Sync {
    fn id(&self) -> &str;
    fn role(&self) -> Role;
    fn scope(&self) -> ShareScope;
    fn session_id(&self) -> String;
    async fn send(&self, frame: &Frame) -> anyhow::Result<()>;
    async fn close(&self, reason: &str);
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum HubError {
    #[error("unknown session")]
    UnknownSession,
    #[error("no host connected")]
    NoHost,
    #[error("control not permitted")]
    ControlNotPermitted,
}

#[derive(Default)]
struct SessionState {
    host: Option<Arc<dyn Connection>>,
    clients: HashMap<String, Arc<dyn Connection>>,
    client_labels: HashMap<String, String>,
    controller: Option<String>,
    cols: usize,
    rows: usize,
    seq: u64,
}

impl SessionState {
    /// Label of the current controller: the declared client id when known,
    /// the raw conn id (or "host") otherwise.
    fn holder_label(&self) -> String {
        let controller = match &self.controller {
            Some(controller) => controller,
            None => return String::new(),
        };
        self.client_labels
            .get(controller)
            .cloned()
            .unwrap_or_else(|| controller.clone())
    }
}

/// Routes frames between the host and clients of each session.
#[derive(Default)]
pub struct Hub {
    sessions: Mutex<HashMap<String, SessionState>>,
}

impl Hub {
    pub fn new() -> Hub {
        Hub::default()
    }

    /// Attach a host connection, evicting any previous one.
    pub async fn register_host(
        &self,
        conn: Arc<dyn Connection>,
        session_id: &str,
        cols: usize,
        rows: usize,
    ) {
        let evicted = {
            let mut sessions = self.sessions.lock().unwrap();
            let state = sessions.entry(session_id.to_string()).or_default();
            let evicted = state.host.take();
            state.host = Some(conn);
            state.cols = cols;
            state.rows = rows;
            evicted
        };
        if let Some(prev) = evicted {
            prev.close("replaced by new host").await;
        }
    }

    /// Add a client; grants control iff requested, permitted by scope and
    /// currently unheld. Returns (granted, holder label, cols, rows).
    pub fn register_client(
        &self,
        conn: Arc<dyn Connection>,
        session_id: &str,
        client_id: &str,
        wants_control: bool,
    ) -> (bool, String, usize, usize) {
        let mut sessions = self.sessions.lock().unwrap();
        let state = sessions.entry(session_id.to_string()).or_default();
        let conn_id = conn.id().to_string();
        let label = if client_id.is_empty() {
            conn_id.clone()
        } else {
            client_id.to_string()
        };
        let scope = conn.scope();
        state.clients.insert(conn_id.clone(), conn);
        state.client_labels.insert(conn_id.clone(), label);
        let granted = wants_control && scope == ShareScope::Control && state.controller.is_none();
        if granted {
            state.controller = Some(conn_id);
        }
        (granted, state.holder_label(), state.cols, state.rows)
    }

    /// Remove a connection. A departing host fails every client with
    /// "host disconnected"; a departing client just drops out. Fully empty
    /// sessions are evicted.
    pub async fn unregister(&self, conn: &dyn Connection) {
        let session_id = conn.session_id();
        let notify = {
            let mut sessions = self.sessions.lock().unwrap();
            let state = match sessions.get_mut(&session_id) {
                Some(state) => state,
                None => return,
            };
            let mut notify = Vec::new();
            match conn.role() {
                Role::Host => {
                    if state
                        .host
                        .as_ref()
                        .is_some_and(|host| host.id() == conn.id())
                    {
                        state.host = None;
                        state.controller = None;
                        notify.extend(state.clients.values().cloned());
                    }
                }
                Role::Client => {
                    state.clients.remove(conn.id());
                    state.client_labels.remove(conn.id());
                }
            }
            if state.controller.as_deref() == Some(conn.id()) {
                state.controller = None;
            }
            if state.host.is_none() && state.clients.is_empty() {
                sessions.remove(&session_id);
            }
            notify
        };

        for client in notify {
            let frame = Frame::error(&session_id, "host disconnected");
            if let Err(err) = client.send(&frame).await {
                debug!(error = %err, "failed to notify client of host disconnect");
            }
            client.close("host disconnected").await;
        }
    }

    /// Route a host frame: stamp the session sequence on snapshots and diffs,
    /// record host control assertions, fan out to every client.
    pub async fn handle_host_frame(
        &self,
        conn: &dyn Connection,
        mut frame: Frame,
    ) -> Result<(), HubError> {
        let clients = {
            let mut sessions = self.sessions.lock().unwrap();
            let state = sessions
                .get_mut(&conn.session_id())
                .ok_or(HubError::UnknownSession)?;
            if let Payload::Control(control) = &frame.payload {
                state.controller = Some(control.holder_client_id.clone());
            }
            if matches!(frame.payload, Payload::Snapshot(_) | Payload::Diff(_)) {
                state.seq += 1;
                frame.seq = state.seq;
            }
            state.clients.values().cloned().collect::<Vec<_>>()
        };

        for client in clients {
            if let Err(err) = client.send(&frame).await {
                debug!(client = client.id(), error = %err, "failed to send to client");
            }
        }
        Ok(())
    }

    /// Route a client frame. Hello goes to the host to trigger a fresh
    /// snapshot. Input/Resize from a control-scope client seizes the lease
    /// (announced with exactly one Control broadcast) and is forwarded;
    /// view-scope submissions are rejected before any state changes.
    pub async fn handle_client_frame(
        &self,
        conn: &dyn Connection,
        frame: Frame,
    ) -> Result<(), HubError> {
        let is_input_or_resize = matches!(frame.payload, Payload::Input(_) | Payload::Resize(_));
        if is_input_or_resize && conn.scope() != ShareScope::Control {
            return Err(HubError::ControlNotPermitted);
        }

        let (host, control_broadcast) = {
            let mut sessions = self.sessions.lock().unwrap();
            let state = sessions
                .get_mut(&conn.session_id())
                .ok_or(HubError::UnknownSession)?;
            let host = state.host.clone().ok_or(HubError::NoHost)?;
            if matches!(frame.payload, Payload::Hello(_)) {
                (host, None)
            } else {
                let mut broadcast = None;
                if is_input_or_resize && state.controller.as_deref() != Some(conn.id()) {
                    state.controller = Some(conn.id().to_string());
                    let targets: Vec<_> = state.clients.values().cloned().collect();
                    broadcast = Some((state.holder_label(), targets));
                }
                (host, broadcast)
            }
        };

        if let Some((holder, targets)) = control_broadcast {
            let control = Frame::control(conn.session_id(), holder);
            for client in targets {
                if let Err(err) = client.send(&control).await {
                    debug!(client = client.id(), error = %err, "failed to announce controller");
                }
            }
            if let Err(err) = host.send(&control).await {
                debug!(error = %err, "failed to announce controller to host");
            }
        }

        host.send(&frame).await.map_err(|err| {
            debug!(error = %err, "failed to forward frame to host");
            HubError::NoHost
        })
    }

    /// Re-announce the current controller to everyone in the session.
    pub async fn broadcast_control(&self, session_id: &str) {
        let (holder, host, clients) = {
            let sessions = self.sessions.lock().unwrap();
            let state = match sessions.get(session_id) {
                Some(state) => state,
                None => return,
            };
            (
                state.holder_label(),
                state.host.clone(),
                state.clients.values().cloned().collect::<Vec<_>>(),
            )
        };
        if holder.is_empty() {
            return;
        }
        let control = Frame::control(session_id, holder);
        for client in clients {
            let _ = client.send(&control).await;
        }
        if let Some(host) = host {
            let _ = host.send(&control).await;
        }
    }

    pub fn has_host(&self, session_id: &str) -> bool {
        let sessions = self.sessions.lock().unwrap();
        sessions
            .get(session_id)
            .is_some_and(|state| state.host.is_some())
    }

    pub fn touch_session(&self, session_id: &str, cols: usize, rows: usize) {
        let mut sessions = self.sessions.lock().unwrap();
        let state = sessions.entry(session_id.to_string()).or_default();
        state.cols = cols;
        state.rows = rows;
    }

    /// Current controller label and sequence, for tests and diagnostics.
    pub fn session_state(&self, session_id: &str) -> Option<(String, u64)> {
        let sessions = self.sessions.lock().unwrap();
        sessions
            .get(session_id)
            .map(|state| (state.holder_label(), state.seq))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{Hello, Input, Resize, Snapshot};
    use tokio::sync::Mutex as AsyncMutex;

    struct MockConn {
        id: String,
        role: Role,
        scope: ShareScope,
        session_id: String,
        sent: AsyncMutex<Vec<Frame>>,
        closed: AsyncMutex<Vec<String>>,
    }

    impl MockConn {
        fn new(id: &str, role: Role, scope: ShareScope, session_id: &str) -> Arc<MockConn> {
            Arc::new(MockConn {
                id: id.to_string(),
                role,
                scope,
                session_id: session_id.to_string(),
                sent: AsyncMutex::new(Vec::new()),
                closed: AsyncMutex::new(Vec::new()),
            })
        }

        async fn sent_frames(&self) -> Vec<Frame> {
            self.sent.lock().await.clone()
        }

        async fn close_reasons(&self) -> Vec<String> {
            self.closed.lock().await.clone()
        }
    }

    #[async_trait]
    impl Connection for MockConn {
        fn id(&self) -> &str {
            &self.id
        }
        fn role(&self) -> Role {
            self.role
        }
        fn scope(&self) -> ShareScope {
            self.scope
        }
        fn session_id(&self) -> String {
            self.session_id.clone()
        }
        async fn send(&self, frame: &Frame) -> anyhow::Result<()> {
            self.sent.lock().await.push(frame.clone());
            Ok(())
        }
        async fn close(&self, reason: &str) {
            self.closed.lock().await.push(reason.to_string());
        }
    }

    fn snapshot_frame(session: &str) -> Frame {
        Frame::new(session, Payload::Snapshot(Snapshot::blank(2, 2)))
    }

    fn input_frame(session: &str, data: &[u8]) -> Frame {
        Frame::new(
            session,
            Payload::Input(Input {
                data: data.to_vec(),
            }),
        )
    }

    #[tokio::test]
    async fn new_host_evicts_previous() {
        let hub = Hub::new();
        let first = MockConn::new("h1", Role::Host, ShareScope::Control, "s1");
        let second = MockConn::new("h2", Role::Host, ShareScope::Control, "s1");
        hub.register_host(first.clone(), "s1", 80, 24).await;
        hub.register_host(second, "s1", 80, 24).await;
        assert_eq!(first.close_reasons().await, vec!["replaced by new host"]);
    }

    #[tokio::test]
    async fn seq_stamped_only_on_snapshot_and_diff() {
        let hub = Hub::new();
        let host = MockConn::new("h", Role::Host, ShareScope::Control, "s1");
        let client = MockConn::new("c", Role::Client, ShareScope::Control, "s1");
        hub.register_host(host.clone(), "s1", 80, 24).await;
        hub.register_client(client.clone(), "s1", "c1", false);

        hub.handle_host_frame(host.as_ref(), snapshot_frame("s1"))
            .await
            .unwrap();
        hub.handle_host_frame(host.as_ref(), Frame::control("s1", "host"))
            .await
            .unwrap();
        hub.handle_host_frame(host.as_ref(), snapshot_frame("s1"))
            .await
            .unwrap();

        let frames = client.sent_frames().await;
        let seqs: Vec<u64> = frames.iter().map(|frame| frame.seq).collect();
        assert_eq!(seqs, vec![1, 0, 2]);
    }

    #[tokio::test]
    async fn view_scope_input_is_rejected_without_state_change() {
        let hub = Hub::new();
        let host = MockConn::new("h", Role::Host, ShareScope::Control, "s1");
        let viewer = MockConn::new("v", Role::Client, ShareScope::View, "s1");
        hub.register_host(host.clone(), "s1", 80, 24).await;
        hub.register_client(viewer.clone(), "s1", "v1", false);

        let err = hub
            .handle_client_frame(viewer.as_ref(), input_frame("s1", b"x"))
            .await
            .unwrap_err();
        assert_eq!(err, HubError::ControlNotPermitted);
        assert!(host.sent_frames().await.is_empty());
        let (holder, _) = hub.session_state("s1").unwrap();
        assert!(holder.is_empty());
    }

    #[tokio::test]
    async fn input_from_control_scope_seizes_lease_and_broadcasts_once() {
        let hub = Hub::new();
        let host = MockConn::new("h", Role::Host, ShareScope::Control, "s1");
        let c1 = MockConn::new("conn1", Role::Client, ShareScope::Control, "s1");
        let c2 = MockConn::new("conn2", Role::Client, ShareScope::Control, "s1");
        hub.register_host(host.clone(), "s1", 80, 24).await;
        let (granted, _, _, _) = hub.register_client(c1.clone(), "s1", "c1", true);
        assert!(granted);
        hub.register_client(c2.clone(), "s1", "c2", false);

        hub.handle_client_frame(c2.as_ref(), input_frame("s1", b"TWO\r\n"))
            .await
            .unwrap();

        let (holder, _) = hub.session_state("s1").unwrap();
        assert_eq!(holder, "c2");

        let controls = |frames: Vec<Frame>| {
            frames
                .into_iter()
                .filter_map(|frame| match frame.payload {
                    Payload::Control(control) => Some(control.holder_client_id),
                    _ => None,
                })
                .collect::<Vec<_>>()
        };
        assert_eq!(controls(c1.sent_frames().await), vec!["c2"]);
        assert_eq!(controls(c2.sent_frames().await), vec!["c2"]);
        assert_eq!(controls(host.sent_frames().await), vec!["c2"]);

        // The input itself reached the host after the announcement.
        let host_frames = host.sent_frames().await;
        assert!(matches!(
            host_frames.last().unwrap().payload,
            Payload::Input(_)
        ));
    }

    #[tokio::test]
    async fn controller_kept_while_held_does_not_rebroadcast() {
        let hub = Hub::new();
        let host = MockConn::new("h", Role::Host, ShareScope::Control, "s1");
        let c1 = MockConn::new("conn1", Role::Client, ShareScope::Control, "s1");
        hub.register_host(host.clone(), "s1", 80, 24).await;
        hub.register_client(c1.clone(), "s1", "c1", true);

        hub.handle_client_frame(c1.as_ref(), input_frame("s1", b"a"))
            .await
            .unwrap();
        hub.handle_client_frame(c1.as_ref(), input_frame("s1", b"b"))
            .await
            .unwrap();
        let control_count = c1
            .sent_frames()
            .await
            .iter()
            .filter(|frame| matches!(frame.payload, Payload::Control(_)))
            .count();
        assert_eq!(control_count, 0);
    }

    #[tokio::test]
    async fn host_disconnect_notifies_and_closes_clients() {
        let hub = Hub::new();
        let host = MockConn::new("h", Role::Host, ShareScope::Control, "s1");
        let client = MockConn::new("c", Role::Client, ShareScope::View, "s1");
        hub.register_host(host.clone(), "s1", 80, 24).await;
        hub.register_client(client.clone(), "s1", "c1", false);

        hub.unregister(host.as_ref()).await;

        let frames = client.sent_frames().await;
        assert!(frames.iter().any(|frame| matches!(
            &frame.payload,
            Payload::Error(err) if err.message == "host disconnected"
        )));
        assert_eq!(client.close_reasons().await, vec!["host disconnected"]);
        assert!(!hub.has_host("s1"));
    }

    #[tokio::test]
    async fn hello_is_forwarded_to_host() {
        let hub = Hub::new();
        let host = MockConn::new("h", Role::Host, ShareScope::Control, "s1");
        let client = MockConn::new("c", Role::Client, ShareScope::View, "s1");
        hub.register_host(host.clone(), "s1", 80, 24).await;
        hub.register_client(client.clone(), "s1", "c1", false);

        let hello = Frame::new(
            "s1",
            Payload::Hello(Hello {
                client_id: "c1".into(),
                last_seq: 5,
                ..Hello::default()
            }),
        );
        hub.handle_client_frame(client.as_ref(), hello).await.unwrap();
        let frames = host.sent_frames().await;
        assert!(matches!(frames[0].payload, Payload::Hello(_)));
    }

    #[tokio::test]
    async fn client_without_host_gets_no_host_error() {
        let hub = Hub::new();
        let client = MockConn::new("c", Role::Client, ShareScope::View, "s1");
        hub.register_client(client.clone(), "s1", "c1", false);
        let err = hub
            .handle_client_frame(
                client.as_ref(),
                Frame::new("s1", Payload::Hello(Hello::default())),
            )
            .await
            .unwrap_err();
        assert_eq!(err, HubError::NoHost);
    }

    #[tokio::test]
    async fn resize_also_seizes_lease() {
        let hub = Hub::new();
        let host = MockConn::new("h", Role::Host, ShareScope::Control, "s1");
        let client = MockConn::new("c", Role::Client, ShareScope::Control, "s1");
        hub.register_host(host.clone(), "s1", 80, 24).await;
        hub.register_client(client.clone(), "s1", "c9", false);

        hub.handle_client_frame(
            client.as_ref(),
            Frame::new("s1", Payload::Resize(Resize { cols: 100, rows: 30 })),
        )
        .await
        .unwrap();
        let (holder, _) = hub.session_state("s1").unwrap();
        assert_eq!(holder, "c9");
    }
}
