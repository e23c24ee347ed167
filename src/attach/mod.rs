//! Attach client: connects to the relay, reconstructs the remote terminal
//! from snapshot and diff frames, forwards keystrokes, and requests a fresh
//! snapshot whenever it observes a sequence gap.

use std::io::{IsTerminal, Write};
use std::sync::{Arc, Mutex};

use anyhow::{bail, Result};
use futures_util::StreamExt;
use rand::RngCore;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::config::{DEFAULT_TERMINAL_COLS, DEFAULT_TERMINAL_ROWS};
use crate::protocol::diff::apply_diff;
use crate::protocol::{Frame, Hello, Input, Payload, Resize, Snapshot};
use crate::render;
use crate::wsclient::{self, Credentials};

#[derive(Clone, Debug, Default)]
pub struct AttachOptions {
    pub endpoint: String,
    pub session_id: String,
    pub access_token: String,
    pub share_token: String,
    pub request_control: bool,
    pub client_id: String,
}

#[derive(Default)]
struct ClientState {
    last_snapshot: Option<Snapshot>,
    last_render: Option<Snapshot>,
    last_seq: u64,
    needs_resync: bool,
    resync_requested: bool,
    holder: String,
}

/// What to do with an incoming sequenced frame.
enum SeqDecision {
    Accept,
    /// Drop and (at most once per gap) re-send Hello with the last seq.
    Resync,
    Drop,
}

pub struct AttachClient {
    opts: AttachOptions,
    client_id: String,
    state: Mutex<ClientState>,
    error: Mutex<Option<String>>,
}

struct RawModeGuard(bool);

impl RawModeGuard {
    fn new(enable: bool) -> RawModeGuard {
        if !enable {
            return RawModeGuard(false);
        }
        match crossterm::terminal::enable_raw_mode() {
            Ok(()) => RawModeGuard(true),
            Err(err) => {
                warn!(error = %err, "failed to enable raw mode");
                RawModeGuard(false)
            }
        }
    }
}

impl Drop for RawModeGuard {
    fn drop(&mut self) {
        if self.0 {
            let _ = crossterm::terminal::disable_raw_mode();
        }
    }
}

impl AttachClient {
    pub fn new(opts: AttachOptions) -> AttachClient {
        let client_id = if opts.client_id.is_empty() {
            new_client_id()
        } else {
            opts.client_id.clone()
        };
        AttachClient {
            opts,
            client_id,
            state: Mutex::new(ClientState::default()),
            error: Mutex::new(None),
        }
    }

    pub async fn run(self: &Arc<Self>, cancel: CancellationToken) -> Result<()> {
        if self.opts.endpoint.is_empty() {
            bail!("endpoint is required");
        }
        if self.opts.share_token.is_empty() && self.opts.access_token.is_empty() {
            bail!("access token is required");
        }

        let credentials = if self.opts.share_token.is_empty() {
            Credentials::Bearer(&self.opts.access_token)
        } else {
            Credentials::ShareToken(&self.opts.share_token)
        };
        let stream = wsclient::connect(&self.opts.endpoint, "/ws/client", credentials).await?;
        let (mut sink, mut source) = stream.split();

        wsclient::write_frame(&mut sink, &self.hello_frame()).await?;

        let (tx, mut rx) = mpsc::unbounded_channel::<Frame>();
        let writer = tokio::spawn(async move {
            while let Some(frame) = rx.recv().await {
                if let Err(err) = wsclient::write_frame(&mut sink, &frame).await {
                    debug!(error = %err, "attach write failed");
                    return;
                }
            }
        });

        let _raw_guard = RawModeGuard::new(std::io::stdin().is_terminal());

        let (control_tx, control_rx) = mpsc::unbounded_channel::<()>();
        let input_task = spawn_input_loop(tx.clone(), self.opts.session_id.clone(), cancel.clone());
        let resize_task = self.spawn_resize_loop(tx.clone(), control_rx, cancel.clone());

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                frame = wsclient::next_frame(&mut source) => {
                    let frame = match frame {
                        Some(frame) => frame,
                        None => break,
                    };
                    if !self.handle_frame(frame, &tx, &control_tx) {
                        break;
                    }
                }
            }
        }

        cancel.cancel();
        input_task.abort();
        resize_task.abort();
        writer.abort();
        let _ = writer.await;

        if let Some(message) = self.error.lock().unwrap().take() {
            bail!("{message}");
        }
        Ok(())
    }

    fn hello_frame(&self) -> Frame {
        let (cols, rows) = terminal_size_or_default();
        let last_seq = self.state.lock().unwrap().last_seq;
        Frame::new(
            &self.opts.session_id,
            Payload::Hello(Hello {
                client_id: self.client_id.clone(),
                cols,
                rows,
                wants_control: self.opts.request_control,
                last_seq,
                client_type: "attach".to_string(),
            }),
        )
    }

    /// Returns false when the client should exit.
    fn handle_frame(
        &self,
        frame: Frame,
        tx: &mpsc::UnboundedSender<Frame>,
        control_tx: &mpsc::UnboundedSender<()>,
    ) -> bool {
        match frame.payload {
            Payload::Snapshot(snap) => self.handle_snapshot(frame.seq, snap),
            Payload::Diff(diff) => match self.check_seq(frame.seq) {
                SeqDecision::Accept => {
                    let snap = {
                        let mut state = self.state.lock().unwrap();
                        let snap = apply_diff(state.last_snapshot.take(), &diff);
                        state.last_snapshot = Some(snap.clone());
                        snap
                    };
                    self.render(&snap, false);
                }
                SeqDecision::Resync => {
                    let _ = tx.send(self.hello_frame());
                }
                SeqDecision::Drop => {}
            },
            Payload::Welcome(welcome) => {
                self.set_holder(&welcome.holder_client_id, control_tx);
            }
            Payload::Control(control) => {
                self.set_holder(&control.holder_client_id, control_tx);
            }
            Payload::Error(err) => {
                *self.error.lock().unwrap() = Some(format!("server error: {}", err.message));
                return false;
            }
            _ => {}
        }
        true
    }

    /// A snapshot always re-baselines the sequence and clears any pending
    /// resync; this is how a requested resync completes.
    fn handle_snapshot(&self, seq: u64, snap: Snapshot) {
        {
            let mut state = self.state.lock().unwrap();
            state.last_snapshot = Some(snap.clone());
            if seq != 0 {
                state.last_seq = seq;
            }
            state.needs_resync = false;
            state.resync_requested = false;
        }
        self.render(&snap, true);
    }

    fn check_seq(&self, seq: u64) -> SeqDecision {
        if seq == 0 {
            return SeqDecision::Accept;
        }
        let mut state = self.state.lock().unwrap();
        if state.needs_resync {
            if state.resync_requested {
                return SeqDecision::Drop;
            }
            state.resync_requested = true;
            return SeqDecision::Resync;
        }
        if state.last_seq != 0 && seq != state.last_seq + 1 {
            state.needs_resync = true;
            state.resync_requested = true;
            return SeqDecision::Resync;
        }
        state.last_seq = seq;
        SeqDecision::Accept
    }

    fn set_holder(&self, holder: &str, control_tx: &mpsc::UnboundedSender<()>) {
        let became_controller = {
            let mut state = self.state.lock().unwrap();
            if state.holder == holder {
                return;
            }
            state.holder = holder.to_string();
            holder == self.client_id
        };
        if became_controller {
            let _ = control_tx.send(());
        }
    }

    fn is_controller(&self) -> bool {
        let state = self.state.lock().unwrap();
        !state.holder.is_empty() && state.holder == self.client_id
    }

    fn render(&self, snap: &Snapshot, full: bool) {
        let (cols, rows) = terminal_size_or_default();
        let mut stdout = std::io::stdout();
        let prev = {
            let mut state = self.state.lock().unwrap();
            let prev = if full { None } else { state.last_render.take() };
            state.last_render = Some(snap.clone());
            prev
        };
        let result = if full {
            render::render_viewport(&mut stdout, snap, cols, rows)
        } else {
            render::render_viewport_delta(&mut stdout, prev.as_ref(), snap, cols, rows)
        };
        if let Err(err) = result.and_then(|_| stdout.flush()) {
            debug!(error = %err, "render failed");
        }
    }

    fn send_resize(&self, tx: &mpsc::UnboundedSender<Frame>) {
        let (cols, rows) = terminal_size_or_default();
        let _ = tx.send(Frame::new(
            &self.opts.session_id,
            Payload::Resize(Resize { cols, rows }),
        ));
    }

    /// Local window changes: repaint the cached snapshot in the new
    /// viewport, and propagate the size to the host when controlling. A
    /// freshly acquired lease also announces our size once.
    #[cfg(unix)]
    fn spawn_resize_loop(
        self: &Arc<Self>,
        tx: mpsc::UnboundedSender<Frame>,
        mut control_rx: mpsc::UnboundedReceiver<()>,
        cancel: CancellationToken,
    ) -> tokio::task::JoinHandle<()> {
        let client = self.clone();
        tokio::spawn(async move {
            let mut sigwinch = match tokio::signal::unix::signal(
                tokio::signal::unix::SignalKind::window_change(),
            ) {
                Ok(signal) => signal,
                Err(err) => {
                    warn!(error = %err, "failed to install SIGWINCH handler");
                    return;
                }
            };
            loop {
                let from_signal = tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = sigwinch.recv() => true,
                    next = control_rx.recv() => {
                        if next.is_none() {
                            return;
                        }
                        false
                    }
                };
                if from_signal {
                    let snap = client.state.lock().unwrap().last_snapshot.clone();
                    if let Some(snap) = snap {
                        client.render(&snap, true);
                    }
                }
                if client.is_controller() {
                    client.send_resize(&tx);
                }
            }
        })
    }

    #[cfg(not(unix))]
    fn spawn_resize_loop(
        self: &Arc<Self>,
        tx: mpsc::UnboundedSender<Frame>,
        mut control_rx: mpsc::UnboundedReceiver<()>,
        cancel: CancellationToken,
    ) -> tokio::task::JoinHandle<()> {
        let client = self.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    next = control_rx.recv() => {
                        if next.is_none() {
                            return;
                        }
                    }
                }
                if client.is_controller() {
                    client.send_resize(&tx);
                }
            }
        })
    }
}

fn spawn_input_loop(
    tx: mpsc::UnboundedSender<Frame>,
    session_id: String,
    cancel: CancellationToken,
) -> tokio::task::JoinHandle<()> {
    let (bytes_tx, mut bytes_rx) = mpsc::unbounded_channel::<Vec<u8>>();
    std::thread::spawn(move || {
        use std::io::Read;
        let mut stdin = std::io::stdin();
        let mut buf = [0u8; 1024];
        loop {
            match stdin.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => {
                    if bytes_tx.send(buf[..n].to_vec()).is_err() {
                        break;
                    }
                }
                Err(_) => break,
            }
        }
    });
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return,
                data = bytes_rx.recv() => {
                    let data = match data {
                        Some(data) => data,
                        None => return,
                    };
                    let frame = Frame::new(&session_id, Payload::Input(Input { data }));
                    if tx.send(frame).is_err() {
                        return;
                    }
                }
            }
        }
    })
}

fn new_client_id() -> String {
    let mut bytes = [0u8; 8];
    rand::thread_rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}

fn terminal_size_or_default() -> (usize, usize) {
    match crossterm::terminal::size() {
        Ok((cols, rows)) if cols > 0 && rows > 0 => (cols as usize, rows as usize),
        _ => (DEFAULT_TERMINAL_COLS, DEFAULT_TERMINAL_ROWS),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn client() -> AttachClient {
        AttachClient::new(AttachOptions {
            endpoint: "http://localhost:0".into(),
            session_id: "s1".into(),
            access_token: "t".into(),
            client_id: "me".into(),
            ..Default::default()
        })
    }

    #[test]
    fn zero_seq_always_accepted() {
        let client = client();
        assert!(matches!(client.check_seq(0), SeqDecision::Accept));
    }

    #[test]
    fn first_nonzero_seq_is_baseline() {
        let client = client();
        assert!(matches!(client.check_seq(5), SeqDecision::Accept));
        assert_eq!(client.state.lock().unwrap().last_seq, 5);
    }

    #[test]
    fn gap_requests_resync_once() {
        let client = client();
        assert!(matches!(client.check_seq(1), SeqDecision::Accept));
        // seq 3 skips 2: resync requested exactly once, then frames drop.
        assert!(matches!(client.check_seq(3), SeqDecision::Resync));
        assert!(matches!(client.check_seq(4), SeqDecision::Drop));
        assert!(matches!(client.check_seq(5), SeqDecision::Drop));
    }

    #[test]
    fn snapshot_clears_resync_latch() {
        let client = client();
        assert!(matches!(client.check_seq(1), SeqDecision::Accept));
        assert!(matches!(client.check_seq(3), SeqDecision::Resync));
        // Fresh snapshot with the next hub seq restores the sequence.
        let snap = Snapshot::blank(2, 2);
        client.handle_snapshot(4, snap);
        let state = client.state.lock().unwrap();
        assert_eq!(state.last_seq, 4);
        assert!(!state.needs_resync);
        drop(state);
        assert!(matches!(client.check_seq(5), SeqDecision::Accept));
    }

    #[test]
    fn contiguous_seq_accepted() {
        let client = client();
        for seq in 1..=5 {
            assert!(matches!(client.check_seq(seq), SeqDecision::Accept));
        }
        assert_eq!(client.state.lock().unwrap().last_seq, 5);
    }

    #[test]
    fn holder_tracking() {
        let client = client();
        let (tx, mut rx) = mpsc::unbounded_channel();
        client.set_holder("other", &tx);
        assert!(!client.is_controller());
        assert!(rx.try_recv().is_err());
        client.set_holder("me", &tx);
        assert!(client.is_controller());
        assert!(rx.try_recv().is_ok());
    }
}
