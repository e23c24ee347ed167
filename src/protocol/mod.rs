//! Wire-level frame model. A [`Frame`] is one message on the stream: an
//! envelope carrying the session id, a hub-assigned sequence number and a
//! tagged payload. Snapshots travel as parallel arrays in row-major order,
//! which keeps row comparison a straight slice walk.

pub mod diff;
pub mod wire;

use crate::term;

/// Label the hub and publishers use for the host's controller lease.
pub const HOST_CONTROL_ID: &str = "host";

#[derive(Clone, Debug, PartialEq)]
pub struct Frame {
    pub session_id: String,
    /// Zero for frames not subject to sequencing; snapshots and diffs carry
    /// a monotonically increasing per-session value assigned by the hub.
    pub seq: u64,
    pub payload: Payload,
}

#[derive(Clone, Debug, PartialEq)]
pub enum Payload {
    Hello(Hello),
    Welcome(Welcome),
    Snapshot(Snapshot),
    Diff(Diff),
    Input(Input),
    Resize(Resize),
    Control(Control),
    Error(ErrorInfo),
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct Hello {
    pub client_id: String,
    pub cols: usize,
    pub rows: usize,
    pub wants_control: bool,
    pub last_seq: u64,
    pub client_type: String,
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct Welcome {
    pub granted_control: bool,
    pub server_cols: usize,
    pub server_rows: usize,
    pub holder_client_id: String,
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct Snapshot {
    pub cols: usize,
    pub rows: usize,
    pub runes: Vec<u32>,
    pub modes: Vec<u16>,
    pub fg: Vec<u32>,
    pub bg: Vec<u32>,
    pub cursor: term::Cursor,
    pub cursor_visible: bool,
    pub mode: u32,
    pub title: String,
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct Diff {
    pub cols: usize,
    pub rows: usize,
    pub changed: Vec<DiffRow>,
    pub cursor: term::Cursor,
    pub cursor_visible: bool,
    pub mode: u32,
    pub title: String,
}

/// One changed row carrying the full width of the grid.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct DiffRow {
    pub y: usize,
    pub runes: Vec<u32>,
    pub modes: Vec<u16>,
    pub fg: Vec<u32>,
    pub bg: Vec<u32>,
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct Input {
    pub data: Vec<u8>,
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct Resize {
    pub cols: usize,
    pub rows: usize,
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct Control {
    pub holder_client_id: String,
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct ErrorInfo {
    pub message: String,
}

impl Frame {
    pub fn new(session_id: impl Into<String>, payload: Payload) -> Frame {
        Frame {
            session_id: session_id.into(),
            seq: 0,
            payload,
        }
    }

    pub fn error(session_id: impl Into<String>, message: impl Into<String>) -> Frame {
        Frame::new(
            session_id,
            Payload::Error(ErrorInfo {
                message: message.into(),
            }),
        )
    }

    pub fn control(session_id: impl Into<String>, holder: impl Into<String>) -> Frame {
        Frame::new(
            session_id,
            Payload::Control(Control {
                holder_client_id: holder.into(),
            }),
        )
    }

    pub fn welcome(
        session_id: impl Into<String>,
        granted: bool,
        cols: usize,
        rows: usize,
        holder: impl Into<String>,
    ) -> Frame {
        Frame::new(
            session_id,
            Payload::Welcome(Welcome {
                granted_control: granted,
                server_cols: cols,
                server_rows: rows,
                holder_client_id: holder.into(),
            }),
        )
    }
}

impl Snapshot {
    /// Flatten an emulator snapshot into the parallel-array wire form.
    pub fn from_term(snap: &term::Snapshot) -> Snapshot {
        let len = snap.cells.len();
        let mut runes = Vec::with_capacity(len);
        let mut modes = Vec::with_capacity(len);
        let mut fg = Vec::with_capacity(len);
        let mut bg = Vec::with_capacity(len);
        for cell in &snap.cells {
            runes.push(cell.ch as u32);
            modes.push(cell.mode);
            fg.push(cell.fg.raw());
            bg.push(cell.bg.raw());
        }
        Snapshot {
            cols: snap.cols,
            rows: snap.rows,
            runes,
            modes,
            fg,
            bg,
            cursor: snap.cursor,
            cursor_visible: snap.cursor_visible,
            mode: snap.mode,
            title: snap.title.clone(),
        }
    }

    /// Empty grid of the given size with default attributes.
    pub fn blank(cols: usize, rows: usize) -> Snapshot {
        let len = cols * rows;
        Snapshot {
            cols,
            rows,
            runes: vec![' ' as u32; len],
            modes: vec![0; len],
            fg: vec![0; len],
            bg: vec![0; len],
            ..Snapshot::default()
        }
    }

    pub fn rune_at(&self, x: usize, y: usize) -> char {
        let idx = y * self.cols + x;
        self.runes
            .get(idx)
            .and_then(|&r| char::from_u32(r))
            .unwrap_or(' ')
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::term::emu::Emulator;

    #[test]
    fn from_term_packs_parallel_arrays() {
        let mut emu = Emulator::new(4, 2);
        emu.write(b"\x1b[31mhi");
        let snap = Snapshot::from_term(&emu.snapshot());
        assert_eq!(snap.runes.len(), 8);
        assert_eq!(snap.modes.len(), 8);
        assert_eq!(snap.fg.len(), 8);
        assert_eq!(snap.bg.len(), 8);
        assert_eq!(snap.rune_at(0, 0), 'h');
        assert_eq!(snap.rune_at(1, 0), 'i');
        assert_eq!(snap.fg[0], crate::term::Color::indexed16(1).raw());
    }

    #[test]
    fn blank_snapshot_is_spaces() {
        let snap = Snapshot::blank(3, 2);
        assert_eq!(snap.runes, vec![' ' as u32; 6]);
        assert_eq!(snap.rune_at(2, 1), ' ');
    }
}
