use std::sync::{Arc, Mutex, OnceLock};

use anyhow::{bail, Result};
use portable_pty::CommandBuilder;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::host::{PublishOptions, Publisher, PublisherCallbacks};
use crate::protocol::Snapshot;
use crate::session::passwd::resolve_shell;
use crate::session::pty::{spawn_reader, Pty};
use crate::term::emu::Emulator;

/// Headless host: runs a command under a PTY and publishes it to the relay.
/// Remote input is written to the PTY unconditionally (there is no local
/// operator competing for the lease).
pub struct CommandHost {
    pub endpoint: String,
    pub token: String,
    pub session_id: String,
    pub cols: usize,
    pub rows: usize,
    pub command: Vec<String>,
    pub term: String,
    pub buffer_lines: usize,
}

impl CommandHost {
    pub async fn run(&self, cancel: CancellationToken) -> Result<()> {
        if self.session_id.is_empty() {
            bail!("session id is required");
        }
        let cols = if self.cols == 0 {
            crate::config::DEFAULT_TERMINAL_COLS
        } else {
            self.cols
        };
        let rows = if self.rows == 0 {
            crate::config::DEFAULT_TERMINAL_ROWS
        } else {
            self.rows
        };

        let mut cmd = if self.command.is_empty() {
            CommandBuilder::new(resolve_shell(""))
        } else {
            let mut cmd = CommandBuilder::new(&self.command[0]);
            cmd.args(&self.command[1..]);
            cmd
        };
        if !self.term.is_empty() {
            cmd.env("TERM", &self.term);
        }

        let (pty, reader) = Pty::spawn(cmd, cols, rows)?;
        let pty = Arc::new(pty);
        let emulator = Arc::new(Mutex::new(Emulator::new(cols, rows)));

        // The resize callback needs the publisher, which needs the
        // callbacks; late-bind through a slot.
        let publisher_slot: Arc<OnceLock<Arc<Publisher>>> = Arc::new(OnceLock::new());
        let callbacks = PublisherCallbacks {
            on_input: Some(Box::new({
                let pty = pty.clone();
                move |data: &[u8]| {
                    if let Err(err) = pty.write(data) {
                        debug!(error = %err, "pty write failed");
                    }
                }
            })),
            on_resize: Some(Box::new({
                let pty = pty.clone();
                let emulator = emulator.clone();
                let slot = publisher_slot.clone();
                move |cols: usize, rows: usize| {
                    if cols == 0 || rows == 0 {
                        return;
                    }
                    let _ = pty.resize(cols, rows);
                    let snap = {
                        let mut emulator = emulator.lock().unwrap();
                        emulator.resize(cols, rows);
                        emulator.snapshot()
                    };
                    if let Some(publisher) = slot.get() {
                        publisher.resize(cols, rows, Snapshot::from_term(&snap));
                    }
                }
            })),
            on_control: None,
            on_frame: None,
        };

        let publisher = Arc::new(Publisher::new(
            PublishOptions {
                endpoint: self.endpoint.clone(),
                token: self.token.clone(),
                session_id: self.session_id.clone(),
                cols,
                rows,
                publish_control: true,
                buffer_lines: self.buffer_lines,
            },
            callbacks,
        ));
        let _ = publisher_slot.set(publisher.clone());

        let publisher_task = {
            let publisher = publisher.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { publisher.run(cancel).await })
        };

        info!(session = %self.session_id, "host session started");
        {
            let snap = {
                let emulator = emulator.lock().unwrap();
                emulator.snapshot()
            };
            publisher.publish(None, Snapshot::from_term(&snap));
        }
        let mut chunks = spawn_reader(reader);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                chunk = chunks.recv() => {
                    let data = match chunk {
                        Some(data) => data,
                        None => break,
                    };
                    let snap = {
                        let mut emulator = emulator.lock().unwrap();
                        emulator.write(&data);
                        emulator.snapshot()
                    };
                    publisher.publish(Some(&data), Snapshot::from_term(&snap));
                }
            }
        }

        pty.kill();
        cancel.cancel();
        let _ = publisher_task.await;
        Ok(())
    }
}
