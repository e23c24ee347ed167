//! Binary frame codec. Each frame is one transport message: a header byte
//! packing protocol version and payload kind, the session id, the sequence
//! number, then kind-specific fields. Integers are LEB128-style var-ints.

use super::{
    Control, Diff, DiffRow, ErrorInfo, Frame, Hello, Input, Payload, Resize, Snapshot, Welcome,
};
use crate::config::MAX_FRAME_BYTES;
use crate::term::Cursor;

pub const PROTOCOL_VERSION: u8 = 1;

const VERSION_SHIFT: u8 = 5;
const VERSION_MASK: u8 = 0b1110_0000;
const KIND_MASK: u8 = 0b0001_1111;

const KIND_HELLO: u8 = 1;
const KIND_WELCOME: u8 = 2;
const KIND_SNAPSHOT: u8 = 3;
const KIND_DIFF: u8 = 4;
const KIND_INPUT: u8 = 5;
const KIND_RESIZE: u8 = 6;
const KIND_CONTROL: u8 = 7;
const KIND_ERROR: u8 = 8;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum WireError {
    #[error("invalid protocol version: {0}")]
    InvalidVersion(u8),
    /// Unknown payload tag. Readers skip the message instead of closing.
    #[error("unknown frame kind: {0}")]
    UnknownKind(u8),
    #[error("frame exceeds {limit} bytes: {size}")]
    FrameTooLarge { size: usize, limit: usize },
    #[error("unexpected end of input")]
    UnexpectedEof,
    #[error("varint overflow")]
    VarIntOverflow,
    #[error("invalid data: {0}")]
    InvalidData(&'static str),
}

impl WireError {
    /// True when the message should be discarded without tearing down the
    /// connection.
    pub fn is_skippable(&self) -> bool {
        matches!(self, WireError::UnknownKind(_))
    }
}

pub fn encode_frame(frame: &Frame) -> Vec<u8> {
    let mut buf = Vec::with_capacity(64);
    let kind = match &frame.payload {
        Payload::Hello(_) => KIND_HELLO,
        Payload::Welcome(_) => KIND_WELCOME,
        Payload::Snapshot(_) => KIND_SNAPSHOT,
        Payload::Diff(_) => KIND_DIFF,
        Payload::Input(_) => KIND_INPUT,
        Payload::Resize(_) => KIND_RESIZE,
        Payload::Control(_) => KIND_CONTROL,
        Payload::Error(_) => KIND_ERROR,
    };
    buf.push((PROTOCOL_VERSION << VERSION_SHIFT) & VERSION_MASK | kind);
    write_string(&mut buf, &frame.session_id);
    write_var_u64(&mut buf, frame.seq);
    match &frame.payload {
        Payload::Hello(hello) => {
            write_string(&mut buf, &hello.client_id);
            write_var_u64(&mut buf, hello.cols as u64);
            write_var_u64(&mut buf, hello.rows as u64);
            buf.push(hello.wants_control as u8);
            write_var_u64(&mut buf, hello.last_seq);
            write_string(&mut buf, &hello.client_type);
        }
        Payload::Welcome(welcome) => {
            buf.push(welcome.granted_control as u8);
            write_var_u64(&mut buf, welcome.server_cols as u64);
            write_var_u64(&mut buf, welcome.server_rows as u64);
            write_string(&mut buf, &welcome.holder_client_id);
        }
        Payload::Snapshot(snap) => encode_snapshot(&mut buf, snap),
        Payload::Diff(diff) => encode_diff(&mut buf, diff),
        Payload::Input(input) => write_bytes(&mut buf, &input.data),
        Payload::Resize(resize) => {
            write_var_u64(&mut buf, resize.cols as u64);
            write_var_u64(&mut buf, resize.rows as u64);
        }
        Payload::Control(control) => write_string(&mut buf, &control.holder_client_id),
        Payload::Error(err) => write_string(&mut buf, &err.message),
    }
    buf
}

pub fn decode_frame(bytes: &[u8]) -> Result<Frame, WireError> {
    if bytes.len() > MAX_FRAME_BYTES {
        return Err(WireError::FrameTooLarge {
            size: bytes.len(),
            limit: MAX_FRAME_BYTES,
        });
    }
    let mut reader = Reader::new(bytes);
    let header = reader.read_u8()?;
    let version = (header & VERSION_MASK) >> VERSION_SHIFT;
    if version != PROTOCOL_VERSION {
        return Err(WireError::InvalidVersion(version));
    }
    let kind = header & KIND_MASK;
    let session_id = reader.read_string()?;
    let seq = reader.read_var_u64()?;
    let payload = match kind {
        KIND_HELLO => Payload::Hello(Hello {
            client_id: reader.read_string()?,
            cols: reader.read_var_usize()?,
            rows: reader.read_var_usize()?,
            wants_control: reader.read_bool()?,
            last_seq: reader.read_var_u64()?,
            client_type: reader.read_string()?,
        }),
        KIND_WELCOME => Payload::Welcome(Welcome {
            granted_control: reader.read_bool()?,
            server_cols: reader.read_var_usize()?,
            server_rows: reader.read_var_usize()?,
            holder_client_id: reader.read_string()?,
        }),
        KIND_SNAPSHOT => Payload::Snapshot(decode_snapshot(&mut reader)?),
        KIND_DIFF => Payload::Diff(decode_diff(&mut reader)?),
        KIND_INPUT => Payload::Input(Input {
            data: reader.read_bytes()?,
        }),
        KIND_RESIZE => Payload::Resize(Resize {
            cols: reader.read_var_usize()?,
            rows: reader.read_var_usize()?,
        }),
        KIND_CONTROL => Payload::Control(Control {
            holder_client_id: reader.read_string()?,
        }),
        KIND_ERROR => Payload::Error(ErrorInfo {
            message: reader.read_string()?,
        }),
        other => return Err(WireError::UnknownKind(other)),
    };
    Ok(Frame {
        session_id,
        seq,
        payload,
    })
}

fn encode_snapshot(buf: &mut Vec<u8>, snap: &Snapshot) {
    write_var_u64(buf, snap.cols as u64);
    write_var_u64(buf, snap.rows as u64);
    let len = snap.cols * snap.rows;
    for i in 0..len {
        write_var_u64(buf, snap.runes.get(i).copied().unwrap_or(' ' as u32) as u64);
    }
    for i in 0..len {
        write_var_u64(buf, snap.modes.get(i).copied().unwrap_or(0) as u64);
    }
    for i in 0..len {
        write_var_u64(buf, snap.fg.get(i).copied().unwrap_or(0) as u64);
    }
    for i in 0..len {
        write_var_u64(buf, snap.bg.get(i).copied().unwrap_or(0) as u64);
    }
    write_var_u64(buf, snap.cursor.x as u64);
    write_var_u64(buf, snap.cursor.y as u64);
    buf.push(snap.cursor_visible as u8);
    write_var_u64(buf, snap.mode as u64);
    write_string(buf, &snap.title);
}

fn decode_snapshot(reader: &mut Reader) -> Result<Snapshot, WireError> {
    let cols = reader.read_var_usize()?;
    let rows = reader.read_var_usize()?;
    let len = cells_len(cols, rows)?;
    let mut runes = Vec::with_capacity(len);
    for _ in 0..len {
        runes.push(reader.read_var_u32()?);
    }
    let mut modes = Vec::with_capacity(len);
    for _ in 0..len {
        modes.push(reader.read_var_u32()? as u16);
    }
    let mut fg = Vec::with_capacity(len);
    for _ in 0..len {
        fg.push(reader.read_var_u32()?);
    }
    let mut bg = Vec::with_capacity(len);
    for _ in 0..len {
        bg.push(reader.read_var_u32()?);
    }
    let cursor = Cursor {
        x: reader.read_var_usize()?,
        y: reader.read_var_usize()?,
    };
    let cursor_visible = reader.read_bool()?;
    let mode = reader.read_var_u32()?;
    let title = reader.read_string()?;
    Ok(Snapshot {
        cols,
        rows,
        runes,
        modes,
        fg,
        bg,
        cursor,
        cursor_visible,
        mode,
        title,
    })
}

fn encode_diff(buf: &mut Vec<u8>, diff: &Diff) {
    write_var_u64(buf, diff.cols as u64);
    write_var_u64(buf, diff.rows as u64);
    write_var_u64(buf, diff.changed.len() as u64);
    for row in &diff.changed {
        write_var_u64(buf, row.y as u64);
        for i in 0..diff.cols {
            write_var_u64(buf, row.runes.get(i).copied().unwrap_or(' ' as u32) as u64);
        }
        for i in 0..diff.cols {
            write_var_u64(buf, row.modes.get(i).copied().unwrap_or(0) as u64);
        }
        for i in 0..diff.cols {
            write_var_u64(buf, row.fg.get(i).copied().unwrap_or(0) as u64);
        }
        for i in 0..diff.cols {
            write_var_u64(buf, row.bg.get(i).copied().unwrap_or(0) as u64);
        }
    }
    write_var_u64(buf, diff.cursor.x as u64);
    write_var_u64(buf, diff.cursor.y as u64);
    buf.push(diff.cursor_visible as u8);
    write_var_u64(buf, diff.mode as u64);
    write_string(buf, &diff.title);
}

fn decode_diff(reader: &mut Reader) -> Result<Diff, WireError> {
    let cols = reader.read_var_usize()?;
    let rows = reader.read_var_usize()?;
    cells_len(cols, rows)?;
    let changed_count = reader.read_var_usize()?;
    if changed_count > rows {
        return Err(WireError::InvalidData("more changed rows than rows"));
    }
    let mut changed = Vec::with_capacity(changed_count);
    for _ in 0..changed_count {
        let y = reader.read_var_usize()?;
        let mut runes = Vec::with_capacity(cols);
        for _ in 0..cols {
            runes.push(reader.read_var_u32()?);
        }
        let mut modes = Vec::with_capacity(cols);
        for _ in 0..cols {
            modes.push(reader.read_var_u32()? as u16);
        }
        let mut fg = Vec::with_capacity(cols);
        for _ in 0..cols {
            fg.push(reader.read_var_u32()?);
        }
        let mut bg = Vec::with_capacity(cols);
        for _ in 0..cols {
            bg.push(reader.read_var_u32()?);
        }
        changed.push(DiffRow {
            y,
            runes,
            modes,
            fg,
            bg,
        });
    }
    let cursor = Cursor {
        x: reader.read_var_usize()?,
        y: reader.read_var_usize()?,
    };
    let cursor_visible = reader.read_bool()?;
    let mode = reader.read_var_u32()?;
    let title = reader.read_string()?;
    Ok(Diff {
        cols,
        rows,
        changed,
        cursor,
        cursor_visible,
        mode,
        title,
    })
}

fn cells_len(cols: usize, rows: usize) -> Result<usize, WireError> {
    cols.checked_mul(rows)
        .filter(|&len| len <= MAX_FRAME_BYTES)
        .ok_or(WireError::InvalidData("grid dimensions out of range"))
}

fn write_var_u64(buf: &mut Vec<u8>, mut value: u64) {
    loop {
        let mut byte = (value & 0x7f) as u8;
        value >>= 7;
        if value != 0 {
            byte |= 0x80;
        }
        buf.push(byte);
        if value == 0 {
            break;
        }
    }
}

fn write_string(buf: &mut Vec<u8>, value: &str) {
    write_bytes(buf, value.as_bytes());
}

fn write_bytes(buf: &mut Vec<u8>, value: &[u8]) {
    write_var_u64(buf, value.len() as u64);
    buf.extend_from_slice(value);
}

struct Reader<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(bytes: &'a [u8]) -> Reader<'a> {
        Reader { bytes, pos: 0 }
    }

    fn read_u8(&mut self) -> Result<u8, WireError> {
        let byte = *self
            .bytes
            .get(self.pos)
            .ok_or(WireError::UnexpectedEof)?;
        self.pos += 1;
        Ok(byte)
    }

    fn read_bool(&mut self) -> Result<bool, WireError> {
        Ok(self.read_u8()? != 0)
    }

    fn read_var_u64(&mut self) -> Result<u64, WireError> {
        let mut value = 0u64;
        let mut shift = 0u32;
        loop {
            let byte = self.read_u8()?;
            if shift >= 64 {
                return Err(WireError::VarIntOverflow);
            }
            value |= ((byte & 0x7f) as u64) << shift;
            if byte & 0x80 == 0 {
                return Ok(value);
            }
            shift += 7;
        }
    }

    fn read_var_u32(&mut self) -> Result<u32, WireError> {
        let value = self.read_var_u64()?;
        u32::try_from(value).map_err(|_| WireError::VarIntOverflow)
    }

    fn read_var_usize(&mut self) -> Result<usize, WireError> {
        let value = self.read_var_u64()?;
        usize::try_from(value).map_err(|_| WireError::VarIntOverflow)
    }

    fn read_bytes(&mut self) -> Result<Vec<u8>, WireError> {
        let len = self.read_var_usize()?;
        if self.pos + len > self.bytes.len() {
            return Err(WireError::UnexpectedEof);
        }
        let out = self.bytes[self.pos..self.pos + len].to_vec();
        self.pos += len;
        Ok(out)
    }

    fn read_string(&mut self) -> Result<String, WireError> {
        let bytes = self.read_bytes()?;
        String::from_utf8(bytes).map_err(|_| WireError::InvalidData("invalid utf-8 string"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn round_trip(frame: Frame) {
        let bytes = encode_frame(&frame);
        let decoded = decode_frame(&bytes).expect("decode");
        assert_eq!(decoded, frame);
    }

    #[test]
    fn hello_round_trip() {
        round_trip(Frame::new(
            "s1",
            Payload::Hello(Hello {
                client_id: "c1".into(),
                cols: 120,
                rows: 40,
                wants_control: true,
                last_seq: 5,
                client_type: "attach".into(),
            }),
        ));
    }

    #[test]
    fn welcome_round_trip() {
        round_trip(Frame::welcome("s1", true, 80, 24, "c1"));
    }

    #[test]
    fn snapshot_round_trip() {
        let mut snap = Snapshot::blank(3, 2);
        snap.runes[0] = 'x' as u32;
        snap.modes[1] = crate::term::MODE_BOLD;
        snap.fg[2] = crate::term::Color::indexed256(200).raw();
        snap.cursor = Cursor { x: 2, y: 1 };
        snap.cursor_visible = true;
        snap.title = "title".into();
        let mut frame = Frame::new("s1", Payload::Snapshot(snap));
        frame.seq = 42;
        round_trip(frame);
    }

    #[test]
    fn diff_round_trip() {
        let diff = Diff {
            cols: 2,
            rows: 3,
            changed: vec![DiffRow {
                y: 1,
                runes: vec!['a' as u32, 'b' as u32],
                modes: vec![0, crate::term::MODE_INVERSE],
                fg: vec![0, crate::term::Color::rgb(9, 8, 7).raw()],
                bg: vec![0, 0],
            }],
            cursor: Cursor { x: 1, y: 2 },
            cursor_visible: false,
            mode: crate::term::FLAG_WRAP,
            title: String::new(),
        };
        let mut frame = Frame::new("s1", Payload::Diff(diff));
        frame.seq = 7;
        round_trip(frame);
    }

    #[test]
    fn input_resize_control_error_round_trip() {
        round_trip(Frame::new(
            "s1",
            Payload::Input(Input {
                data: vec![0x04, b'x', 0xff],
            }),
        ));
        round_trip(Frame::new(
            "s1",
            Payload::Resize(Resize { cols: 81, rows: 25 }),
        ));
        round_trip(Frame::control("s1", "c2"));
        round_trip(Frame::error("s1", "no host connected"));
    }

    #[test]
    fn unknown_kind_is_skippable() {
        let mut bytes = encode_frame(&Frame::error("s", "m"));
        bytes[0] = (PROTOCOL_VERSION << VERSION_SHIFT) | 0x1f;
        let err = decode_frame(&bytes).unwrap_err();
        assert!(err.is_skippable());
    }

    #[test]
    fn bad_version_rejected() {
        let mut bytes = encode_frame(&Frame::error("s", "m"));
        bytes[0] = (3 << VERSION_SHIFT) | (bytes[0] & KIND_MASK);
        assert_eq!(decode_frame(&bytes), Err(WireError::InvalidVersion(3)));
    }

    #[test]
    fn oversized_frame_rejected() {
        let bytes = vec![0u8; MAX_FRAME_BYTES + 1];
        assert!(matches!(
            decode_frame(&bytes),
            Err(WireError::FrameTooLarge { .. })
        ));
    }

    #[test]
    fn truncated_frame_rejected() {
        let bytes = encode_frame(&Frame::error("session", "message"));
        assert_eq!(
            decode_frame(&bytes[..bytes.len() - 3]),
            Err(WireError::UnexpectedEof)
        );
    }
}
