//! ANSI renderer: reconstructs a snapshot on a local terminal with the
//! minimal escape stream. Three entry points mirror how the attach client
//! uses them: a clearing full render, a non-clearing full render (used when
//! the viewport origin moves, to avoid whole-screen flicker), and a
//! row-delta render for the common case.

use std::fmt::Write as _;
use std::io::{self, Write};

use crate::protocol::Snapshot;
use crate::term::{
    Color, ColorKind, MODE_BLINK, MODE_BOLD, MODE_FAINT, MODE_HIDDEN, MODE_INVERSE, MODE_ITALIC,
    MODE_UNDERLINE,
};

const CLEAR_SCREEN: &str = "\x1b[2J";
const HOME: &str = "\x1b[H";
const HIDE_CURSOR: &str = "\x1b[?25l";
const SHOW_CURSOR: &str = "\x1b[?25h";
const RESET: &str = "\x1b[0m";
const CLEAR_LINE: &str = "\x1b[K";

#[derive(Clone, Copy, PartialEq, Eq)]
struct RenderAttr {
    mode: u16,
    fg: Color,
    bg: Color,
}

const DEFAULT_ATTR: RenderAttr = RenderAttr {
    mode: 0,
    fg: Color::DEFAULT,
    bg: Color::DEFAULT,
};

/// Full render: clear screen, repaint every viewport row.
pub fn render_viewport(
    w: &mut dyn Write,
    snap: &Snapshot,
    view_cols: usize,
    view_rows: usize,
) -> io::Result<()> {
    let mut out = String::new();
    out.push_str(CLEAR_SCREEN);
    out.push_str(HOME);
    render_body(&mut out, snap, view_cols, view_rows);
    w.write_all(out.as_bytes())?;
    w.flush()
}

/// Full render without the leading clear; rows still end in clear-to-EOL.
pub fn render_viewport_no_clear(
    w: &mut dyn Write,
    snap: &Snapshot,
    view_cols: usize,
    view_rows: usize,
) -> io::Result<()> {
    let mut out = String::new();
    render_body(&mut out, snap, view_cols, view_rows);
    w.write_all(out.as_bytes())?;
    w.flush()
}

/// Delta render: repaint only viewport rows whose cells changed between
/// `prev` and `snap`. Falls back to a full render when dimensions changed and
/// to a non-clearing full render when the viewport origin moved. Never emits
/// a clear-screen.
pub fn render_viewport_delta(
    w: &mut dyn Write,
    prev: Option<&Snapshot>,
    snap: &Snapshot,
    view_cols: usize,
    view_rows: usize,
) -> io::Result<()> {
    let prev = match prev {
        Some(prev) if prev.cols == snap.cols && prev.rows == snap.rows => prev,
        _ => return render_viewport(w, snap, view_cols, view_rows),
    };

    let cols = snap.cols;
    let rows = snap.rows;
    let view_cols = if view_cols == 0 { cols } else { view_cols };
    let view_rows = if view_rows == 0 { rows } else { view_rows };

    let (cursor_x, cursor_y) = clamped_cursor(snap);
    let (prev_cursor_x, prev_cursor_y) = clamped_cursor(prev);
    let (x0, y0) = viewport_origin(cols, rows, view_cols, view_rows, cursor_x, cursor_y);
    let (px0, py0) = viewport_origin(cols, rows, view_cols, view_rows, prev_cursor_x, prev_cursor_y);
    if x0 != px0 || y0 != py0 {
        return render_viewport_no_clear(w, snap, view_cols, view_rows);
    }

    let mut out = String::new();
    out.push_str(if snap.cursor_visible {
        SHOW_CURSOR
    } else {
        HIDE_CURSOR
    });
    if snap.title != prev.title {
        write_title(&mut out, &snap.title);
    }

    for y in 0..view_rows {
        let cy = y0 + y;
        if viewport_row_equal(prev, snap, cy, x0, view_cols) {
            continue;
        }
        let _ = write!(out, "\x1b[{};1H", y + 1);
        render_row(&mut out, snap, cy, x0, view_cols);
    }

    move_cursor_into_view(&mut out, cursor_x, cursor_y, x0, y0, view_cols, view_rows);
    w.write_all(out.as_bytes())?;
    w.flush()
}

fn render_body(out: &mut String, snap: &Snapshot, view_cols: usize, view_rows: usize) {
    let cols = snap.cols;
    let rows = snap.rows;
    let view_cols = if view_cols == 0 { cols } else { view_cols };
    let view_rows = if view_rows == 0 { rows } else { view_rows };

    out.push_str(if snap.cursor_visible {
        SHOW_CURSOR
    } else {
        HIDE_CURSOR
    });

    let (cursor_x, cursor_y) = clamped_cursor(snap);
    let (x0, y0) = viewport_origin(cols, rows, view_cols, view_rows, cursor_x, cursor_y);

    out.push_str(RESET);
    for y in 0..view_rows {
        let cy = y0 + y;
        let _ = write!(out, "\x1b[{};1H", y + 1);
        render_row(out, snap, cy, x0, view_cols);
    }

    // Cursor lands on its mapped position when inside the viewport;
    // otherwise the cursor is hidden to avoid pointing at the wrong cell.
    if cursor_x >= x0 && cursor_x < x0 + view_cols && cursor_y >= y0 && cursor_y < y0 + view_rows {
        let _ = write!(out, "\x1b[{};{}H", cursor_y - y0 + 1, cursor_x - x0 + 1);
    } else if snap.cursor_visible {
        out.push_str(HIDE_CURSOR);
    }

    if !snap.title.is_empty() {
        write_title(out, &snap.title);
    }
}

fn render_row(out: &mut String, snap: &Snapshot, cy: usize, x0: usize, view_cols: usize) {
    let cols = snap.cols;
    let rows = snap.rows;
    out.push_str(&sgr(DEFAULT_ATTR));
    let mut current = DEFAULT_ATTR;
    for x in 0..view_cols {
        let cx = x0 + x;
        let mut attr = DEFAULT_ATTR;
        let mut ch = ' ';
        if cx < cols && cy < rows {
            let idx = cy * cols + cx;
            if let Some(&r) = snap.runes.get(idx) {
                ch = char::from_u32(r).unwrap_or(' ');
            }
            if let Some(&m) = snap.modes.get(idx) {
                attr.mode = m;
            }
            if let Some(&fg) = snap.fg.get(idx) {
                attr.fg = Color::from_raw(fg);
            }
            if let Some(&bg) = snap.bg.get(idx) {
                attr.bg = Color::from_raw(bg);
            }
        }
        if ch == '\0' {
            ch = ' ';
        }
        if attr.mode & MODE_HIDDEN != 0 {
            ch = ' ';
        }
        if attr != current {
            out.push_str(&sgr(attr));
            current = attr;
        }
        out.push(ch);
    }
    out.push_str(CLEAR_LINE);
}

fn move_cursor_into_view(
    out: &mut String,
    cursor_x: usize,
    cursor_y: usize,
    x0: usize,
    y0: usize,
    view_cols: usize,
    view_rows: usize,
) {
    let view_x = cursor_x
        .saturating_sub(x0)
        .min(view_cols.saturating_sub(1));
    let view_y = cursor_y
        .saturating_sub(y0)
        .min(view_rows.saturating_sub(1));
    let _ = write!(out, "\x1b[{};{}H", view_y + 1, view_x + 1);
}

fn clamped_cursor(snap: &Snapshot) -> (usize, usize) {
    (
        snap.cursor.x.min(snap.cols.saturating_sub(1)),
        snap.cursor.y.min(snap.rows.saturating_sub(1)),
    )
}

fn viewport_row_equal(prev: &Snapshot, snap: &Snapshot, cy: usize, x0: usize, view_cols: usize) -> bool {
    if cy >= snap.rows {
        return true;
    }
    for x in 0..view_cols {
        let cx = x0 + x;
        if cx >= snap.cols {
            continue;
        }
        let idx = cy * snap.cols + cx;
        if prev.runes.get(idx) != snap.runes.get(idx)
            || prev.modes.get(idx) != snap.modes.get(idx)
            || prev.fg.get(idx) != snap.fg.get(idx)
            || prev.bg.get(idx) != snap.bg.get(idx)
        {
            return false;
        }
    }
    true
}

/// Anchor the viewport so the cursor is visible, clamped within the snapshot.
pub fn viewport_origin(
    cols: usize,
    rows: usize,
    view_cols: usize,
    view_rows: usize,
    cursor_x: usize,
    cursor_y: usize,
) -> (usize, usize) {
    let mut x0 = 0;
    let mut y0 = 0;
    if view_cols < cols {
        if cursor_x >= view_cols {
            x0 = cursor_x - view_cols + 1;
        }
        x0 = x0.min(cols - view_cols);
    }
    if view_rows < rows {
        if cursor_y >= view_rows {
            y0 = cursor_y - view_rows + 1;
        }
        y0 = y0.min(rows - view_rows);
    }
    (x0, y0)
}

/// One SGR sequence that fully describes `attr`, starting from reset.
/// Inverse is emitted as code 7 with fg/bg untouched, so the receiving
/// terminal keeps the palette semantics the source intended.
fn sgr(attr: RenderAttr) -> String {
    let mut codes: Vec<String> = vec!["0".into()];
    if attr.mode & MODE_BOLD != 0 {
        codes.push("1".into());
    }
    if attr.mode & MODE_FAINT != 0 {
        codes.push("2".into());
    }
    if attr.mode & MODE_ITALIC != 0 {
        codes.push("3".into());
    }
    if attr.mode & MODE_UNDERLINE != 0 {
        codes.push("4".into());
    }
    if attr.mode & MODE_BLINK != 0 {
        codes.push("5".into());
    }
    if attr.mode & MODE_INVERSE != 0 {
        codes.push("7".into());
    }
    if attr.mode & MODE_HIDDEN != 0 {
        codes.push("8".into());
    }
    color_codes(&mut codes, true, attr.fg);
    color_codes(&mut codes, false, attr.bg);
    format!("\x1b[{}m", codes.join(";"))
}

fn color_codes(codes: &mut Vec<String>, is_fg: bool, color: Color) {
    match color.kind() {
        ColorKind::Default => codes.push(if is_fg { "39".into() } else { "49".into() }),
        ColorKind::Indexed16(idx) => {
            // Low palette maps to 30-37/40-47, high to 90-97/100-107.
            // Bold never promotes a low slot to the bright palette.
            let base = match (is_fg, idx < 8) {
                (true, true) => 30 + idx as u32,
                (true, false) => 90 + (idx - 8) as u32,
                (false, true) => 40 + idx as u32,
                (false, false) => 100 + (idx - 8) as u32,
            };
            codes.push(base.to_string());
        }
        ColorKind::Indexed256(idx) => {
            // Always 256-space syntax, even for idx < 16: the source chose
            // this palette explicitly.
            codes.push(if is_fg { "38".into() } else { "48".into() });
            codes.push("5".into());
            codes.push(idx.to_string());
        }
        ColorKind::Rgb(r, g, b) => {
            codes.push(if is_fg { "38".into() } else { "48".into() });
            codes.push("2".into());
            codes.push(r.to_string());
            codes.push(g.to_string());
            codes.push(b.to_string());
        }
    }
}

fn write_title(out: &mut String, title: &str) {
    let clean: String = title.chars().filter(|&c| c != '\n' && c != '\r').collect();
    let _ = write!(out, "\x1b]0;{}\x07", clean);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::term::{Cursor, MODE_HIDDEN};

    fn snapshot_with(cols: usize, rows: usize, text: &str) -> Snapshot {
        let mut snap = Snapshot::blank(cols, rows);
        for (i, ch) in text.chars().enumerate() {
            snap.runes[i] = ch as u32;
        }
        snap.cursor_visible = true;
        snap
    }

    fn render_to_string(snap: &Snapshot, view_cols: usize, view_rows: usize) -> String {
        let mut buf = Vec::new();
        render_viewport(&mut buf, snap, view_cols, view_rows).unwrap();
        String::from_utf8(buf).unwrap()
    }

    #[test]
    fn full_render_clears_and_homes() {
        let snap = snapshot_with(4, 2, "hi");
        let out = render_to_string(&snap, 4, 2);
        assert!(out.starts_with("\x1b[2J\x1b[H"));
        assert!(out.contains("hi"));
    }

    #[test]
    fn viewport_clamps_origin_to_cursor() {
        assert_eq!(viewport_origin(4, 4, 2, 2, 3, 3), (2, 2));
        assert_eq!(viewport_origin(4, 4, 2, 2, 0, 0), (0, 0));
        assert_eq!(viewport_origin(4, 4, 4, 4, 3, 3), (0, 0));
        assert_eq!(viewport_origin(10, 10, 4, 4, 9, 0), (6, 0));
    }

    #[test]
    fn inverse_keeps_palette_codes() {
        let mut snap = snapshot_with(1, 1, "x");
        snap.modes[0] = MODE_INVERSE;
        snap.fg[0] = Color::indexed16(2).raw();
        snap.bg[0] = Color::indexed16(4).raw();
        let out = render_to_string(&snap, 1, 1);
        assert!(out.contains("\x1b[0;7;32;44m"), "got {out:?}");
    }

    #[test]
    fn indexed256_low_values_stay_in_256_space() {
        let mut snap = snapshot_with(1, 1, "x");
        snap.fg[0] = Color::indexed256(7).raw();
        let out = render_to_string(&snap, 1, 1);
        assert!(out.contains("38;5;7"), "got {out:?}");
        assert!(!out.contains("\x1b[37m"));
    }

    #[test]
    fn bold_does_not_promote_palette() {
        let mut snap = snapshot_with(1, 1, "x");
        snap.modes[0] = MODE_BOLD;
        snap.fg[0] = Color::indexed16(1).raw();
        let out = render_to_string(&snap, 1, 1);
        assert!(out.contains(";31"), "got {out:?}");
        assert!(!out.contains(";91"), "got {out:?}");
    }

    #[test]
    fn truecolor_codes() {
        let mut snap = snapshot_with(1, 1, "x");
        snap.bg[0] = Color::rgb(10, 20, 30).raw();
        let out = render_to_string(&snap, 1, 1);
        assert!(out.contains("48;2;10;20;30"), "got {out:?}");
    }

    #[test]
    fn hidden_cells_render_blank() {
        let mut snap = snapshot_with(3, 1, "abc");
        snap.modes[1] = MODE_HIDDEN;
        let out = render_to_string(&snap, 3, 1);
        assert!(!out.contains("abc"));
        assert!(out.contains('a'));
        assert!(out.contains('c'));
    }

    #[test]
    fn title_is_sanitized() {
        let mut snap = snapshot_with(1, 1, "x");
        snap.title = "bad\r\ntitle".into();
        let out = render_to_string(&snap, 1, 1);
        assert!(out.contains("\x1b]0;badtitle\x07"));
    }

    #[test]
    fn delta_on_identical_snapshot_paints_no_rows() {
        let mut snap = snapshot_with(4, 2, "data");
        snap.cursor = Cursor { x: 0, y: 0 };
        let mut buf = Vec::new();
        render_viewport_delta(&mut buf, Some(&snap), &snap.clone(), 4, 2).unwrap();
        let out = String::from_utf8(buf).unwrap();
        assert!(!out.contains("data"));
        assert!(!out.contains(CLEAR_SCREEN));
    }

    #[test]
    fn delta_repaints_only_changed_row() {
        let prev = snapshot_with(3, 2, "abcdef");
        let mut next = prev.clone();
        next.runes[4] = 'X' as u32;
        let mut buf = Vec::new();
        render_viewport_delta(&mut buf, Some(&prev), &next, 3, 2).unwrap();
        let out = String::from_utf8(buf).unwrap();
        assert!(out.contains("\x1b[2;1H"));
        assert!(!out.contains("\x1b[1;1Ha"));
        assert!(!out.contains(CLEAR_SCREEN));
    }

    #[test]
    fn delta_falls_back_to_full_on_resize() {
        let prev = snapshot_with(3, 2, "abcdef");
        let next = snapshot_with(4, 2, "abcdefgh");
        let mut buf = Vec::new();
        render_viewport_delta(&mut buf, Some(&prev), &next, 4, 2).unwrap();
        let out = String::from_utf8(buf).unwrap();
        assert!(out.contains(CLEAR_SCREEN));
    }

    #[test]
    fn delta_never_clears_on_origin_shift() {
        let mut prev = snapshot_with(8, 8, "");
        prev.cursor = Cursor { x: 0, y: 0 };
        let mut next = prev.clone();
        next.cursor = Cursor { x: 7, y: 7 };
        let mut buf = Vec::new();
        render_viewport_delta(&mut buf, Some(&prev), &next, 4, 4).unwrap();
        let out = String::from_utf8(buf).unwrap();
        assert!(!out.contains(CLEAR_SCREEN));
    }

    #[test]
    fn render_reparsed_by_emulator_round_trips_256_colors() {
        let mut snap = snapshot_with(2, 1, "ab");
        snap.fg[0] = Color::indexed256(7).raw();
        let out = render_to_string(&snap, 2, 1);

        let mut emu = crate::term::emu::Emulator::new(2, 1);
        emu.write(out.as_bytes());
        let reparsed = emu.snapshot();
        let cell = reparsed.cell_at(0, 0).unwrap();
        assert_eq!(cell.fg.kind(), crate::term::ColorKind::Indexed256(7));
    }
}
