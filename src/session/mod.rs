//! Local interactive session: owns the PTY and shell, mirrors output into
//! the emulator, renders locally and optionally publishes to a relay. Four
//! cooperative loops: stdin to PTY, PTY output fan-out, local resize, and
//! remote input/resize arriving through publisher callbacks.

pub mod passwd;
pub mod pty;
pub mod veof;

use std::io::Write;
use std::sync::{Arc, Mutex};

use anyhow::{bail, Result};
use crossterm::terminal::{disable_raw_mode, enable_raw_mode, size as terminal_size};
use portable_pty::CommandBuilder;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::{DEFAULT_TERMINAL_COLS, DEFAULT_TERMINAL_ROWS};
use crate::host::{PublishOptions, Publisher, PublisherCallbacks};
use crate::protocol::{Snapshot, HOST_CONTROL_ID};
use crate::render;
use crate::session::passwd::resolve_shell;
use crate::session::pty::{spawn_reader, Pty};
use crate::term::emu::Emulator;

#[derive(Clone, Debug, Default)]
pub struct SessionOptions {
    pub endpoint: String,
    pub token: String,
    pub session_id: String,
    pub cols: usize,
    pub rows: usize,
    pub shell: String,
    pub term: String,
    pub publish: bool,
    pub publish_control: bool,
    pub buffer_lines: usize,
    /// Leave the controlling terminal in cooked mode (tests, pipes).
    pub disable_raw: bool,
}

/// Restores cooked mode on every exit path, including unwinds.
struct RawModeGuard(bool);

impl RawModeGuard {
    fn new(enable: bool) -> RawModeGuard {
        if !enable {
            return RawModeGuard(false);
        }
        match enable_raw_mode() {
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
            let _ = disable_raw_mode();
        }
    }
}

/// State shared between the loops and the publisher callbacks.
struct Shared {
    pty: Arc<Pty>,
    emulator: Mutex<Emulator>,
    size: Mutex<(usize, usize)>,
    holder: Mutex<String>,
    veof_orig: Option<u8>,
}

impl Shared {
    fn holder(&self) -> String {
        self.holder.lock().unwrap().clone()
    }

    /// Record the controller and gate VEOF accordingly: disabled while a
    /// remote holds the lease, restored when the host does.
    fn set_holder(&self, holder: &str) {
        *self.holder.lock().unwrap() = holder.to_string();
        self.apply_veof(holder);
    }

    fn apply_veof(&self, holder: &str) {
        #[cfg(unix)]
        {
            let (Some(fd), Some(orig)) = (self.pty.master_fd(), self.veof_orig) else {
                return;
            };
            let target = if !holder.is_empty() && holder != HOST_CONTROL_ID {
                0
            } else {
                orig
            };
            if !veof::set_veof(fd, target) {
                debug!("failed to update VEOF");
            }
        }
        #[cfg(not(unix))]
        let _ = holder;
    }

    fn filter_remote_input(&self, data: &[u8]) -> Vec<u8> {
        #[cfg(unix)]
        {
            if let Some(fd) = self.pty.master_fd() {
                return veof::filter_remote_input(fd, data);
            }
        }
        data.to_vec()
    }

    fn snapshot_after_write(&self, data: &[u8]) -> Snapshot {
        let mut emulator = self.emulator.lock().unwrap();
        emulator.write(data);
        Snapshot::from_term(&emulator.snapshot())
    }

    fn resize(&self, cols: usize, rows: usize) -> Snapshot {
        *self.size.lock().unwrap() = (cols, rows);
        let _ = self.pty.resize(cols, rows);
        let mut emulator = self.emulator.lock().unwrap();
        emulator.resize(cols, rows);
        Snapshot::from_term(&emulator.snapshot())
    }

    fn size(&self) -> (usize, usize) {
        *self.size.lock().unwrap()
    }
}

pub struct Runner {
    opts: SessionOptions,
}

impl Runner {
    pub fn new(opts: SessionOptions) -> Runner {
        Runner { opts }
    }

    pub async fn run(&self, cancel: CancellationToken) -> Result<()> {
        let mut opts = self.opts.clone();
        if opts.session_id.is_empty() {
            opts.session_id = crate::config::DEFAULT_SESSION_ID.to_string();
        }
        if opts.cols == 0 || opts.rows == 0 {
            let (cols, rows) = local_term_size()
                .unwrap_or((DEFAULT_TERMINAL_COLS, DEFAULT_TERMINAL_ROWS));
            opts.cols = cols;
            opts.rows = rows;
        }
        if opts.publish && opts.endpoint.is_empty() {
            bail!("endpoint is required when publishing");
        }
        if opts.publish && opts.token.is_empty() {
            bail!("access token is required when publishing");
        }

        let mut cmd = CommandBuilder::new(resolve_shell(&opts.shell));
        if !opts.term.is_empty() {
            cmd.env("TERM", &opts.term);
        }
        let (pty, reader) = Pty::spawn(cmd, opts.cols, opts.rows)?;
        let pty = Arc::new(pty);

        #[cfg(unix)]
        let veof_orig = pty.master_fd().and_then(veof::get_veof);
        #[cfg(not(unix))]
        let veof_orig = None;

        let shared = Arc::new(Shared {
            pty: pty.clone(),
            emulator: Mutex::new(Emulator::new(opts.cols, opts.rows)),
            size: Mutex::new((opts.cols, opts.rows)),
            holder: Mutex::new(String::new()),
            veof_orig,
        });

        let _raw_guard = RawModeGuard::new(!opts.disable_raw);

        let publisher = if opts.publish {
            Some(self.start_publisher(&opts, &shared, &cancel))
        } else {
            None
        };

        if let Some(publisher) = &publisher {
            shared.set_holder(HOST_CONTROL_ID);
            publisher.take_control();
            let snap = {
                let emulator = shared.emulator.lock().unwrap();
                Snapshot::from_term(&emulator.snapshot())
            };
            publisher.publish(None, snap);
        }

        let stdin_task = spawn_stdin_loop(shared.clone(), publisher.clone(), cancel.clone());
        let resize_task = spawn_resize_loop(shared.clone(), publisher.clone(), cancel.clone());

        // PTY output: emulator, local render, publish.
        let mut chunks = spawn_reader(reader);
        let mut last_render: Option<Snapshot> = None;
        let mut stdout = std::io::stdout();
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                chunk = chunks.recv() => {
                    let data = match chunk {
                        Some(data) => data,
                        None => break,
                    };
                    let snap = shared.snapshot_after_write(&data);
                    if use_renderer(&shared) {
                        let (view_cols, view_rows) =
                            local_term_size().unwrap_or_else(|| shared.size());
                        if let Err(err) = render::render_viewport_delta(
                            &mut stdout,
                            last_render.as_ref(),
                            &snap,
                            view_cols,
                            view_rows,
                        ) {
                            debug!(error = %err, "render failed");
                        }
                        last_render = Some(snap.clone());
                    } else {
                        last_render = None;
                        if let Err(err) = stdout.write_all(&data).and_then(|_| stdout.flush()) {
                            debug!(error = %err, "stdout write failed");
                        }
                    }
                    if let Some(publisher) = &publisher {
                        publisher.publish(Some(&data), snap);
                    }
                }
            }
        }

        cancel.cancel();
        pty.kill();
        stdin_task.abort();
        resize_task.abort();
        info!("session ended");
        Ok(())
    }

    fn start_publisher(
        &self,
        opts: &SessionOptions,
        shared: &Arc<Shared>,
        cancel: &CancellationToken,
    ) -> Arc<Publisher> {
        let callbacks = PublisherCallbacks {
            on_input: Some(Box::new({
                let shared = shared.clone();
                move |data: &[u8]| {
                    if shared.holder() == HOST_CONTROL_ID {
                        return;
                    }
                    let data = shared.filter_remote_input(data);
                    if data.is_empty() {
                        return;
                    }
                    if let Err(err) = shared.pty.write(&data) {
                        debug!(error = %err, "remote input write failed");
                    }
                }
            })),
            on_resize: Some(Box::new({
                let shared = shared.clone();
                move |cols: usize, rows: usize| {
                    if cols == 0 || rows == 0 {
                        return;
                    }
                    if shared.holder() == HOST_CONTROL_ID {
                        return;
                    }
                    shared.resize(cols, rows);
                }
            })),
            on_control: Some(Box::new({
                let shared = shared.clone();
                move |holder: &str| {
                    if holder.is_empty() {
                        return;
                    }
                    shared.set_holder(holder);
                }
            })),
            on_frame: None,
        };
        let publisher = Arc::new(Publisher::new(
            PublishOptions {
                endpoint: opts.endpoint.clone(),
                token: opts.token.clone(),
                session_id: opts.session_id.clone(),
                cols: opts.cols,
                rows: opts.rows,
                publish_control: opts.publish_control,
                buffer_lines: opts.buffer_lines,
            },
            callbacks,
        ));
        {
            let publisher = publisher.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move {
                if let Err(err) = publisher.run(cancel).await {
                    warn!(error = %err, "publisher stopped");
                }
            });
        }
        publisher
    }
}

/// Host keystroke: reassert the lease and, if a viewer forced another size
/// while controlling, snap the PTY back to the local terminal.
fn take_local_control(shared: &Shared, publisher: &Publisher) {
    publisher.take_control();
    shared.set_holder(HOST_CONTROL_ID);
    let Some((cols, rows)) = local_term_size() else {
        return;
    };
    if (cols, rows) == shared.size() {
        return;
    }
    let snap = shared.resize(cols, rows);
    publisher.resize(cols, rows, snap);
}

fn spawn_stdin_loop(
    shared: Arc<Shared>,
    publisher: Option<Arc<Publisher>>,
    cancel: CancellationToken,
) -> tokio::task::JoinHandle<()> {
    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel::<Vec<u8>>();
    std::thread::spawn(move || {
        use std::io::Read;
        let mut stdin = std::io::stdin();
        let mut buf = [0u8; 4096];
        loop {
            match stdin.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => {
                    if tx.send(buf[..n].to_vec()).is_err() {
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
                data = rx.recv() => {
                    let data = match data {
                        Some(data) => data,
                        None => return,
                    };
                    if let Some(publisher) = &publisher {
                        take_local_control(&shared, publisher);
                    }
                    if let Err(err) = shared.pty.write(&data) {
                        debug!(error = %err, "pty write failed");
                        return;
                    }
                }
            }
        }
    })
}

#[cfg(unix)]
fn spawn_resize_loop(
    shared: Arc<Shared>,
    publisher: Option<Arc<Publisher>>,
    cancel: CancellationToken,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut sigwinch =
            match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::window_change()) {
                Ok(signal) => signal,
                Err(err) => {
                    warn!(error = %err, "failed to install SIGWINCH handler");
                    return;
                }
            };
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = sigwinch.recv() => {}
            }
            let Some((cols, rows)) = local_term_size() else {
                continue;
            };
            if let Some(publisher) = &publisher {
                take_local_control(&shared, publisher);
            }
            let snap = shared.resize(cols, rows);
            if let Some(publisher) = &publisher {
                publisher.resize(cols, rows, snap);
            }
        }
    })
}

#[cfg(not(unix))]
fn spawn_resize_loop(
    _shared: Arc<Shared>,
    _publisher: Option<Arc<Publisher>>,
    _cancel: CancellationToken,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async {})
}

/// Delta-render through the emulator when the local terminal no longer
/// matches the PTY size (a viewer resized it); raw passthrough otherwise.
fn use_renderer(shared: &Shared) -> bool {
    match local_term_size() {
        Some((cols, rows)) => (cols, rows) != shared.size(),
        None => false,
    }
}

fn local_term_size() -> Option<(usize, usize)> {
    match terminal_size() {
        Ok((cols, rows)) if cols > 0 && rows > 0 => Some((cols as usize, rows as usize)),
        _ => None,
    }
}
