use std::io::{Read, Write};
use std::sync::Mutex;

use anyhow::{Context, Result};
use portable_pty::{native_pty_system, Child, CommandBuilder, MasterPty, PtySize};
use tokio::sync::mpsc;
use tracing::debug;

/// A spawned PTY with its child process. The writer is behind a mutex so
/// local and remote input never interleave mid-write.
pub struct Pty {
    master: Box<dyn MasterPty + Send>,
    writer: Mutex<Box<dyn Write + Send>>,
    child: Mutex<Box<dyn Child + Send + Sync>>,
}

// `MasterPty` trait objects are not `Sync`, but every method on the trait
// takes `&self` and is safe to call concurrently (they're thin wrappers
// around kernel calls like ioctl/ptsname). All other fields are already
// behind a `Mutex`, so `Pty` as a whole is safe to share across threads.
unsafe impl Sync for Pty {}

impl Pty {
    pub fn spawn(cmd: CommandBuilder, cols: usize, rows: usize) -> Result<(Pty, Box<dyn Read + Send>)> {
        let pty_system = native_pty_system();
        let pair = pty_system
            .openpty(PtySize {
                rows: rows as u16,
                cols: cols as u16,
                pixel_width: 0,
                pixel_height: 0,
            })
            .context("failed to open pty")?;
        let child = pair
            .slave
            .spawn_command(cmd)
            .context("failed to spawn command")?;
        let reader = pair
            .master
            .try_clone_reader()
            .context("failed to clone pty reader")?;
        let writer = pair
            .master
            .take_writer()
            .context("failed to take pty writer")?;
        Ok((
            Pty {
                master: pair.master,
                writer: Mutex::new(writer),
                child: Mutex::new(child),
            },
            reader,
        ))
    }

    pub fn write(&self, data: &[u8]) -> Result<()> {
        let mut writer = self.writer.lock().unwrap();
        writer.write_all(data)?;
        writer.flush()?;
        Ok(())
    }

    pub fn resize(&self, cols: usize, rows: usize) -> Result<()> {
        self.master
            .resize(PtySize {
                rows: rows as u16,
                cols: cols as u16,
                pixel_width: 0,
                pixel_height: 0,
            })
            .context("pty resize failed")
    }

    /// File descriptor of the PTY master, for termios manipulation.
    #[cfg(unix)]
    pub fn master_fd(&self) -> Option<std::os::unix::io::RawFd> {
        self.master.as_raw_fd()
    }

    pub fn kill(&self) {
        let mut child = self.child.lock().unwrap();
        let _ = child.kill();
        let _ = child.wait();
    }

    /// True once the child has exited.
    pub fn child_exited(&self) -> bool {
        match self.child.lock().unwrap().try_wait() {
            Ok(Some(_)) => true,
            Ok(None) => false,
            Err(_) => true,
        }
    }
}

impl Drop for Pty {
    fn drop(&mut self) {
        let mut child = self.child.lock().unwrap();
        let _ = child.kill();
        let _ = child.wait();
    }
}

/// Pump the blocking PTY reader into a channel from a dedicated thread; the
/// channel closes on EOF (child exit) or read error.
pub fn spawn_reader(mut reader: Box<dyn Read + Send>) -> mpsc::UnboundedReceiver<Vec<u8>> {
    let (tx, rx) = mpsc::unbounded_channel();
    std::thread::spawn(move || {
        let mut buf = [0u8; 4096];
        loop {
            match reader.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => {
                    if tx.send(buf[..n].to_vec()).is_err() {
                        break;
                    }
                }
                Err(err) => {
                    debug!(error = %err, "pty read ended");
                    break;
                }
            }
        }
    });
    rx
}
