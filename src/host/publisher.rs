use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;

use anyhow::{bail, Result};
use futures_util::StreamExt;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::config::{
    DEFAULT_BUFFER_LINES, RECONNECT_BACKOFF_INITIAL, RECONNECT_BACKOFF_MAX, WRITE_TIMEOUT,
};
use crate::protocol::diff::{diff_snapshots, DiffOutcome};
use crate::protocol::{Frame, Payload, Snapshot, HOST_CONTROL_ID};
use crate::wsclient::{self, Credentials};

#[derive(Clone, Debug, Default)]
pub struct PublishOptions {
    pub endpoint: String,
    pub token: String,
    pub session_id: String,
    pub cols: usize,
    pub rows: usize,
    /// Announce the host as controller right after connecting.
    pub publish_control: bool,
    /// Offline buffer budget in line-equivalents; zero means the default.
    pub buffer_lines: usize,
}

type InputCallback = Box<dyn Fn(&[u8]) + Send + Sync>;
type ResizeCallback = Box<dyn Fn(usize, usize) + Send + Sync>;
type ControlCallback = Box<dyn Fn(&str) + Send + Sync>;
type FrameCallback = Box<dyn Fn(&Frame) + Send + Sync>;

/// Hooks back into the owner (session runner or command host). Callbacks keep
/// the publisher and its owner from sharing a mutable aggregate.
#[derive(Default)]
pub struct PublisherCallbacks {
    pub on_input: Option<InputCallback>,
    pub on_resize: Option<ResizeCallback>,
    pub on_control: Option<ControlCallback>,
    pub on_frame: Option<FrameCallback>,
}

struct Buffered {
    frame: Frame,
    lines: usize,
}

#[derive(Default)]
struct PubState {
    last_snap: Option<Snapshot>,
    last_sent: Option<Snapshot>,
    buffer: VecDeque<Buffered>,
    buffer_used: usize,
    holder: String,
    want_control: bool,
    sender: Option<mpsc::UnboundedSender<Frame>>,
}

/// Streams terminal updates to the relay and feeds remote input back through
/// callbacks. Reconnects with exponential backoff; updates published while
/// disconnected land in a bounded offline buffer.
pub struct Publisher {
    opts: PublishOptions,
    buffer_lines: usize,
    callbacks: PublisherCallbacks,
    state: Mutex<PubState>,
}

impl Publisher {
    pub fn new(opts: PublishOptions, callbacks: PublisherCallbacks) -> Publisher {
        let buffer_lines = if opts.buffer_lines == 0 {
            DEFAULT_BUFFER_LINES
        } else {
            opts.buffer_lines
        };
        Publisher {
            opts,
            buffer_lines,
            callbacks,
            state: Mutex::new(PubState::default()),
        }
    }

    /// Connect and serve until cancellation, reconnecting with backoff. A
    /// successful connect resets the backoff to its initial value.
    pub async fn run(&self, cancel: CancellationToken) -> Result<()> {
        if self.opts.endpoint.is_empty() {
            bail!("endpoint is required");
        }
        if self.opts.token.is_empty() {
            bail!("access token is required");
        }
        if self.opts.session_id.is_empty() {
            bail!("session id is required");
        }

        let mut backoff = RECONNECT_BACKOFF_INITIAL;
        loop {
            if cancel.is_cancelled() {
                return Ok(());
            }
            match self.connect_and_serve(&cancel).await {
                Ok(()) => backoff = RECONNECT_BACKOFF_INITIAL,
                Err(err) => debug!(error = %err, "publisher disconnected"),
            }
            tokio::select! {
                _ = cancel.cancelled() => return Ok(()),
                _ = tokio::time::sleep(backoff) => {}
            }
            backoff = (backoff * 2).min(RECONNECT_BACKOFF_MAX);
        }
    }

    async fn connect_and_serve(&self, cancel: &CancellationToken) -> Result<()> {
        let stream = wsclient::connect(
            &self.opts.endpoint,
            "/ws/host",
            Credentials::Bearer(&self.opts.token),
        )
        .await?;
        let (mut sink, mut source) = stream.split();

        let hello = Frame::new(
            &self.opts.session_id,
            Payload::Hello(crate::protocol::Hello {
                cols: self.opts.cols,
                rows: self.opts.rows,
                wants_control: self.opts.publish_control,
                client_type: "host".to_string(),
                ..Default::default()
            }),
        );
        wsclient::write_frame(&mut sink, &hello).await?;

        // Single writer task serializes all sends for this connection.
        let (tx, mut rx) = mpsc::unbounded_channel::<Frame>();
        let writer = tokio::spawn(async move {
            while let Some(frame) = rx.recv().await {
                match wsclient::write_frame(&mut sink, &frame).await {
                    Ok(()) => {}
                    Err(err) => {
                        debug!(error = %err, "publisher write failed");
                        return;
                    }
                }
            }
        });

        let want_control = {
            let mut state = self.state.lock().unwrap();
            state.sender = Some(tx);
            state.want_control
        };
        if want_control {
            self.send_control(HOST_CONTROL_ID);
        }
        self.flush_buffer();

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                frame = wsclient::next_frame(&mut source) => {
                    let frame = match frame {
                        Some(frame) => frame,
                        None => break,
                    };
                    if !self.handle_frame(frame) {
                        break;
                    }
                }
            }
        }

        self.clear_sender();
        writer.abort();
        let _ = tokio::time::timeout(Duration::from_millis(100), writer).await;
        Ok(())
    }

    /// Dispatch one relay frame. Returns false when the connection should be
    /// dropped.
    fn handle_frame(&self, frame: Frame) -> bool {
        match frame.payload {
            Payload::Input(input) => {
                if let Some(on_input) = &self.callbacks.on_input {
                    if !input.data.is_empty() {
                        on_input(&input.data);
                    }
                }
            }
            Payload::Resize(resize) => {
                if let Some(on_resize) = &self.callbacks.on_resize {
                    on_resize(resize.cols, resize.rows);
                }
            }
            Payload::Welcome(welcome) => self.set_holder(&welcome.holder_client_id),
            Payload::Control(control) => self.set_holder(&control.holder_client_id),
            Payload::Hello(_) => self.send_resync_snapshot(),
            Payload::Error(err) => {
                warn!(message = %err.message, "relay error");
                return false;
            }
            _ => {}
        }
        true
    }

    /// Publish a new emulator snapshot; `data` is the raw PTY chunk that
    /// produced it (used only for line accounting on the offline buffer).
    pub fn publish(&self, data: Option<&[u8]>, snap: Snapshot) {
        let (frame, lines) = {
            let mut state = self.state.lock().unwrap();
            state.last_snap = Some(snap.clone());
            match diff_snapshots(state.last_sent.as_ref(), &snap) {
                DiffOutcome::Unchanged => return,
                DiffOutcome::FullSnapshot => {
                    let lines = snapshot_lines(&snap, data);
                    state.last_sent = Some(snap.clone());
                    (
                        Frame::new(&self.opts.session_id, Payload::Snapshot(snap)),
                        lines,
                    )
                }
                DiffOutcome::Rows(diff) => {
                    let lines = diff_lines(&diff, data);
                    state.last_sent = Some(snap);
                    (
                        Frame::new(&self.opts.session_id, Payload::Diff(diff)),
                        lines,
                    )
                }
            }
        };
        if let Some(on_frame) = &self.callbacks.on_frame {
            on_frame(&frame);
        }
        if !self.send_frame(&frame) {
            self.enqueue(frame, lines);
        }
    }

    /// Publish after a size change; dimensions differ from `last_sent`, so
    /// this always produces a full snapshot frame.
    pub fn resize(&self, _cols: usize, _rows: usize, snap: Snapshot) {
        self.publish(None, snap);
    }

    /// Assert the host's controller lease: record the intent (it is replayed
    /// on the next connect while offline) and announce when connected.
    pub fn take_control(&self) {
        {
            let mut state = self.state.lock().unwrap();
            state.want_control = true;
            if state.holder == HOST_CONTROL_ID {
                return;
            }
        }
        self.send_control(HOST_CONTROL_ID);
    }

    pub fn holder(&self) -> String {
        self.state.lock().unwrap().holder.clone()
    }

    fn send_control(&self, holder: &str) {
        let frame = Frame::control(&self.opts.session_id, holder);
        if self.send_frame(&frame) {
            self.set_holder(holder);
        } else {
            self.state.lock().unwrap().holder = holder.to_string();
        }
    }

    fn set_holder(&self, holder: &str) {
        {
            let mut state = self.state.lock().unwrap();
            if state.holder == holder {
                return;
            }
            state.holder = holder.to_string();
        }
        if let Some(on_control) = &self.callbacks.on_control {
            on_control(holder);
        }
    }

    /// A client requested resync via Hello: answer with a fresh full
    /// snapshot of the latest published state.
    fn send_resync_snapshot(&self) {
        let frame = {
            let mut state = self.state.lock().unwrap();
            let snap = match &state.last_snap {
                Some(snap) => snap.clone(),
                None => return,
            };
            state.last_sent = Some(snap.clone());
            Frame::new(&self.opts.session_id, Payload::Snapshot(snap))
        };
        if let Some(on_frame) = &self.callbacks.on_frame {
            on_frame(&frame);
        }
        let _ = self.send_frame(&frame);
    }

    fn send_frame(&self, frame: &Frame) -> bool {
        let sender = {
            let state = self.state.lock().unwrap();
            match &state.sender {
                Some(sender) => sender.clone(),
                None => return false,
            }
        };
        if sender.send(frame.clone()).is_err() {
            self.clear_sender();
            return false;
        }
        true
    }

    fn clear_sender(&self) {
        self.state.lock().unwrap().sender = None;
    }

    /// Flush buffered frames in order; anything that fails to send is
    /// re-enqueued for the next connect.
    fn flush_buffer(&self) {
        let queue: Vec<Buffered> = {
            let mut state = self.state.lock().unwrap();
            state.buffer_used = 0;
            state.buffer.drain(..).collect()
        };
        let mut failed = false;
        for entry in queue {
            if failed || !self.send_frame(&entry.frame) {
                failed = true;
                self.enqueue(entry.frame, entry.lines);
            }
        }
    }

    /// Append to the offline buffer, draining from the head past the line
    /// budget. The head of the buffer must be a snapshot for the flushed
    /// stream to be applicable after reconnect; when it is not, the whole
    /// buffer is replaced with one full snapshot of the latest state.
    fn enqueue(&self, frame: Frame, lines: usize) {
        if self.buffer_lines == 0 {
            return;
        }
        let mut state = self.state.lock().unwrap();
        state.buffer.push_back(Buffered { frame, lines });
        state.buffer_used += lines;
        while state.buffer_used > self.buffer_lines && !state.buffer.is_empty() {
            let dropped = state.buffer.pop_front().unwrap();
            state.buffer_used -= dropped.lines;
        }
        let head_is_snapshot = state
            .buffer
            .front()
            .map(|entry| matches!(entry.frame.payload, Payload::Snapshot(_)))
            .unwrap_or(true);
        if !head_is_snapshot {
            if let Some(snap) = state.last_snap.clone() {
                state.buffer.clear();
                state.buffer.push_back(Buffered {
                    frame: Frame::new(&self.opts.session_id, Payload::Snapshot(snap)),
                    lines: self.buffer_lines,
                });
                state.buffer_used = self.buffer_lines;
            }
        }
    }

    #[cfg(test)]
    fn buffer_contents(&self) -> Vec<Frame> {
        self.state
            .lock()
            .unwrap()
            .buffer
            .iter()
            .map(|entry| entry.frame.clone())
            .collect()
    }
}

fn count_newlines(data: Option<&[u8]>) -> usize {
    data.map(|data| data.iter().filter(|&&b| b == b'\n').count())
        .unwrap_or(0)
}

fn snapshot_lines(snap: &Snapshot, data: Option<&[u8]>) -> usize {
    let lines = count_newlines(data);
    if lines > 0 {
        return lines;
    }
    snap.rows.max(1)
}

fn diff_lines(diff: &crate::protocol::Diff, data: Option<&[u8]>) -> usize {
    let lines = count_newlines(data);
    if lines > 0 {
        return lines;
    }
    diff.changed.len().max(1)
}
