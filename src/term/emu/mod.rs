//! A small VT-style terminal emulator. It interprets the escape subset that
//! interactive shells and full-screen programs actually emit and keeps an
//! authoritative cell grid; malformed sequences are dropped silently so a
//! corrupt byte can never wedge the stream.

mod parser;
mod screen;

use unicode_width::UnicodeWidthChar;

use self::parser::{param, param_or, parse_osc, Parser, State};
use self::screen::Screen;
use crate::term::{
    Cell, Color, Cursor, Snapshot, FLAG_ALT_SCREEN, FLAG_INSERT, FLAG_ORIGIN, FLAG_WRAP,
    MODE_BLINK, MODE_BOLD, MODE_FAINT, MODE_HIDDEN, MODE_INVERSE, MODE_ITALIC, MODE_UNDERLINE,
};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Active {
    Main,
    Alt,
}

#[derive(Clone, Copy, Debug, Default)]
struct Attr {
    mode: u16,
    fg: Color,
    bg: Color,
}

pub struct Emulator {
    cols: usize,
    rows: usize,

    main: Screen,
    alt: Screen,
    active: Active,

    cursor_visible: bool,
    title: String,

    wrap_pending: bool,
    wrap_mode: bool,
    origin_mode: bool,
    insert_mode: bool,
    newline_mode: bool,

    attr: Attr,
    parser: Parser,
    tab_stops: Vec<bool>,

    g0_line_drawing: bool,
    g1_line_drawing: bool,
    use_g1: bool,
}

impl Emulator {
    pub fn new(cols: usize, rows: usize) -> Emulator {
        let cols = if cols == 0 { 80 } else { cols };
        let rows = if rows == 0 { 24 } else { rows };
        Emulator {
            cols,
            rows,
            main: Screen::new(cols, rows),
            alt: Screen::new(cols, rows),
            active: Active::Main,
            cursor_visible: true,
            title: String::new(),
            wrap_pending: false,
            wrap_mode: true,
            origin_mode: false,
            insert_mode: false,
            newline_mode: false,
            attr: Attr::default(),
            parser: Parser::default(),
            tab_stops: default_tabs(cols),
            g0_line_drawing: false,
            g1_line_drawing: false,
            use_g1: false,
        }
    }

    /// Absorb raw PTY output.
    pub fn write(&mut self, bytes: &[u8]) {
        for &byte in bytes {
            self.consume_byte(byte);
        }
    }

    /// Reshape the grid, preserving overlapping content anchored top-left.
    pub fn resize(&mut self, cols: usize, rows: usize) {
        if cols == 0 || rows == 0 {
            return;
        }
        self.cols = cols;
        self.rows = rows;
        self.main = self.main.resize(cols, rows);
        self.alt = self.alt.resize(cols, rows);
        self.tab_stops = default_tabs(cols);
        self.wrap_pending = false;
    }

    /// Capture the current authoritative state.
    pub fn snapshot(&self) -> Snapshot {
        let scr = self.scr_ref();
        Snapshot {
            cols: self.cols,
            rows: self.rows,
            cursor: scr.cursor,
            cursor_visible: self.cursor_visible,
            mode: self.mode_flags(),
            title: self.title.clone(),
            cells: scr.cells.clone(),
        }
    }

    fn mode_flags(&self) -> u32 {
        let mut flags = 0;
        if self.wrap_mode {
            flags |= FLAG_WRAP;
        }
        if self.origin_mode {
            flags |= FLAG_ORIGIN;
        }
        if self.insert_mode {
            flags |= FLAG_INSERT;
        }
        if self.active == Active::Alt {
            flags |= FLAG_ALT_SCREEN;
        }
        flags
    }

    fn scr(&mut self) -> &mut Screen {
        match self.active {
            Active::Main => &mut self.main,
            Active::Alt => &mut self.alt,
        }
    }

    fn scr_ref(&self) -> &Screen {
        match self.active {
            Active::Main => &self.main,
            Active::Alt => &self.alt,
        }
    }

    fn consume_byte(&mut self, byte: u8) {
        match self.parser.state {
            State::Ground => self.handle_ground(byte),
            State::Escape => self.handle_escape(byte),
            State::Csi => self.handle_csi_byte(byte),
            State::Osc => self.handle_osc_byte(byte),
            State::Str => self.handle_str_byte(byte),
            State::Charset => self.handle_charset_byte(byte),
        }
    }

    fn handle_ground(&mut self, byte: u8) {
        match byte {
            0x1b => self.parser.state = State::Escape,
            0x9b => {
                self.parser.reset_csi();
                self.parser.state = State::Csi;
            }
            0x9d => {
                self.parser.reset_osc();
                self.parser.state = State::Osc;
            }
            0x00..=0x1f | 0x7f => self.handle_control(byte),
            _ => self.handle_printable_byte(byte),
        }
    }

    fn handle_escape(&mut self, byte: u8) {
        self.parser.state = State::Ground;
        match byte {
            b'[' => {
                self.parser.reset_csi();
                self.parser.state = State::Csi;
            }
            b']' => {
                self.parser.reset_osc();
                self.parser.state = State::Osc;
            }
            b'P' | b'X' | b'^' | b'_' => {
                self.parser.reset_str();
                self.parser.state = State::Str;
            }
            b'7' => self.scr().save_cursor(),
            b'8' => self.scr().restore_cursor(),
            b'D' => self.new_line(false),
            b'M' => self.reverse_index(),
            b'E' => self.new_line(true),
            b'c' => self.reset(),
            b'H' => self.set_tab_stop(),
            b'(' => {
                self.parser.charset_target = 0;
                self.parser.state = State::Charset;
            }
            b')' => {
                self.parser.charset_target = 1;
                self.parser.state = State::Charset;
            }
            _ => {}
        }
    }

    fn handle_csi_byte(&mut self, byte: u8) {
        match byte {
            0x40..=0x7e => {
                let private = self.parser.private;
                let params = self.parser.finalize_params();
                self.parser.state = State::Ground;
                self.handle_csi(byte, &params, private);
            }
            b'?' if !self.parser.param_seen => self.parser.private = true,
            b'0'..=b'9' => self.parser.add_digit((byte - b'0') as i32),
            b';' => self.parser.next_param(),
            0x20..=0x2f => {}
            0x1b => self.parser.state = State::Escape,
            _ => {}
        }
    }

    fn handle_osc_byte(&mut self, byte: u8) {
        if self.parser.osc_esc {
            self.parser.osc_esc = false;
            if byte == b'\\' {
                self.parser.state = State::Ground;
                self.handle_osc();
                return;
            }
            self.parser.osc_buf.push(0x1b);
            self.parser.osc_buf.push(byte);
            return;
        }
        match byte {
            0x1b => self.parser.osc_esc = true,
            0x07 => {
                self.parser.state = State::Ground;
                self.handle_osc();
            }
            _ => self.parser.osc_buf.push(byte),
        }
    }

    fn handle_str_byte(&mut self, byte: u8) {
        if self.parser.osc_esc {
            self.parser.osc_esc = false;
            if byte == b'\\' {
                self.parser.state = State::Ground;
            }
            return;
        }
        if byte == 0x1b {
            self.parser.osc_esc = true;
        }
    }

    fn handle_control(&mut self, byte: u8) {
        match byte {
            0x08 => {
                let scr = self.scr();
                scr.cursor.x = scr.cursor.x.saturating_sub(1);
                self.wrap_pending = false;
            }
            0x09 => self.tab(),
            0x0a | 0x0b | 0x0c => self.new_line(false),
            0x0d => {
                self.scr().cursor.x = 0;
                self.wrap_pending = false;
            }
            0x0e => self.use_g1 = true,
            0x0f => self.use_g1 = false,
            _ => {}
        }
    }

    fn handle_printable_byte(&mut self, byte: u8) {
        if byte < 0x80 {
            self.print_rune(byte as char);
            return;
        }
        self.parser.utf8_buf.push(byte);
        match std::str::from_utf8(&self.parser.utf8_buf) {
            Ok(text) => {
                if let Some(ch) = text.chars().next() {
                    self.parser.utf8_buf.clear();
                    self.print_rune(ch);
                }
            }
            Err(err) if err.error_len().is_some() || self.parser.utf8_buf.len() >= 4 => {
                self.parser.utf8_buf.clear();
                self.print_rune(byte as char);
            }
            Err(_) => {}
        }
    }

    fn handle_osc(&mut self) {
        let (code, payload) = parse_osc(&self.parser.osc_buf);
        if code == 0 || code == 2 {
            self.title = payload;
        }
        self.parser.reset_osc();
    }

    fn handle_charset_byte(&mut self, byte: u8) {
        let line_drawing = byte == b'0';
        match self.parser.charset_target {
            0 => self.g0_line_drawing = line_drawing,
            _ => self.g1_line_drawing = line_drawing,
        }
        self.parser.state = State::Ground;
    }

    fn handle_csi(&mut self, final_byte: u8, params: &[i32], private: bool) {
        match final_byte {
            b'A' => self.cursor_up(param(params, 0, 1)),
            b'B' | b'e' => self.cursor_down(param(params, 0, 1)),
            b'C' => self.cursor_forward(param(params, 0, 1)),
            b'D' => self.cursor_backward(param(params, 0, 1)),
            b'E' => {
                self.cursor_down(param(params, 0, 1));
                self.scr().cursor.x = 0;
            }
            b'F' => {
                self.cursor_up(param(params, 0, 1));
                self.scr().cursor.x = 0;
            }
            b'G' => self.cursor_column(param(params, 0, 1)),
            b'H' | b'f' => {
                let row = param(params, 0, 1);
                let col = param(params, 1, 1);
                self.cursor_position(row, col);
            }
            b'J' => self.erase_display(param_or(params, 0, 0)),
            b'K' => self.erase_line(param_or(params, 0, 0)),
            b'L' => {
                let n = param(params, 0, 1) as usize;
                let fill = self.blank_cell();
                let row = self.scr_ref().cursor.y;
                self.scr().insert_lines(row, n, fill);
            }
            b'M' => {
                let n = param(params, 0, 1) as usize;
                let fill = self.blank_cell();
                let row = self.scr_ref().cursor.y;
                self.scr().delete_lines(row, n, fill);
            }
            b'@' => self.insert_chars(param(params, 0, 1) as usize),
            b'P' => self.delete_chars(param(params, 0, 1) as usize),
            b'X' => self.erase_chars(param(params, 0, 1) as usize),
            b'S' => {
                let n = param(params, 0, 1) as usize;
                let fill = self.blank_cell();
                self.scr().scroll_up(n, fill);
            }
            b'T' => {
                let n = param(params, 0, 1) as usize;
                let fill = self.blank_cell();
                self.scr().scroll_down(n, fill);
            }
            b'm' => self.select_graphic_rendition(params),
            b'r' => self.set_scroll_region(params),
            b's' => self.scr().save_cursor(),
            b'u' => self.scr().restore_cursor(),
            b'g' => self.clear_tab_stops(param_or(params, 0, 0)),
            b'h' => self.set_mode(params, private, true),
            b'l' => self.set_mode(params, private, false),
            b'd' => {
                let row = param(params, 0, 1);
                let col = self.scr_ref().cursor.x as i32 + 1;
                self.cursor_position(row, col);
            }
            _ => {}
        }
    }

    fn print_rune(&mut self, ch: char) {
        let ch = self.translate_rune(ch);
        if self.wrap_pending {
            self.wrap_pending = false;
            self.new_line(true);
        }

        let mut width = ch.width().unwrap_or(1).max(1);
        if width > self.cols {
            width = 1;
        }

        if self.scr_ref().cursor.x >= self.cols && self.wrap_mode {
            self.new_line(true);
        }
        if width == 2 && self.scr_ref().cursor.x == self.cols - 1 && self.wrap_mode {
            self.new_line(true);
        }

        if self.insert_mode {
            self.insert_chars(width);
        }

        let cursor = self.scr_ref().cursor;
        self.set_cell(cursor.x, cursor.y, ch, width);

        let cols = self.cols;
        let hit_margin = {
            let scr = self.scr();
            scr.cursor.x += width;
            if scr.cursor.x >= cols {
                scr.cursor.x = cols - 1;
                true
            } else {
                false
            }
        };
        if hit_margin && self.wrap_mode {
            self.wrap_pending = true;
        }
    }

    fn translate_rune(&self, ch: char) -> char {
        if !('\x20'..='\x7e').contains(&ch) {
            return ch;
        }
        let line_drawing = if self.use_g1 {
            self.g1_line_drawing
        } else {
            self.g0_line_drawing
        };
        if line_drawing {
            map_line_drawing(ch)
        } else {
            ch
        }
    }

    fn set_cell(&mut self, x: usize, y: usize, ch: char, width: usize) {
        let attr = self.attr;
        let cols = self.cols;
        let scr = self.scr();
        if !scr.in_bounds(x, y) {
            return;
        }
        let idx = scr.index(x, y);
        scr.cells[idx] = Cell {
            ch,
            mode: attr.mode,
            fg: attr.fg,
            bg: attr.bg,
        };
        if width == 2 && x + 1 < cols {
            let cont = scr.index(x + 1, y);
            scr.cells[cont] = Cell {
                ch: ' ',
                mode: attr.mode,
                fg: attr.fg,
                bg: attr.bg,
            };
        }
    }

    fn set_tab_stop(&mut self) {
        let x = self.scr_ref().cursor.x;
        if x < self.tab_stops.len() {
            self.tab_stops[x] = true;
        }
    }

    fn clear_tab_stops(&mut self, mode: i32) {
        match mode {
            0 => {
                let x = self.scr_ref().cursor.x;
                if x < self.tab_stops.len() {
                    self.tab_stops[x] = false;
                }
            }
            3 => self.tab_stops = vec![false; self.cols],
            _ => {}
        }
    }

    fn tab(&mut self) {
        let start = self.scr_ref().cursor.x + 1;
        let next = (start..self.tab_stops.len())
            .find(|&x| self.tab_stops[x])
            .unwrap_or(self.cols.saturating_sub(1));
        self.scr().cursor.x = next;
    }

    fn cursor_position(&mut self, row: i32, col: i32) {
        let row = row.max(1) as usize;
        let col = col.max(1) as usize;
        let mut y = row - 1;
        if self.origin_mode {
            y += self.scr_ref().scroll_top;
        }
        y = y.min(self.scr_ref().scroll_bottom).min(self.rows - 1);
        let x = (col - 1).min(self.cols - 1);
        let scr = self.scr();
        scr.cursor = Cursor { x, y };
        self.wrap_pending = false;
    }

    fn cursor_column(&mut self, col: i32) {
        let col = (col.max(1) as usize).min(self.cols);
        self.scr().cursor.x = col - 1;
        self.wrap_pending = false;
    }

    fn cursor_up(&mut self, n: i32) {
        let n = n.max(1) as usize;
        let min_y = if self.origin_mode {
            self.scr_ref().scroll_top
        } else {
            0
        };
        let scr = self.scr();
        scr.cursor.y = scr.cursor.y.saturating_sub(n).max(min_y);
        self.wrap_pending = false;
    }

    fn cursor_down(&mut self, n: i32) {
        let n = n.max(1) as usize;
        let max_y = if self.origin_mode {
            self.scr_ref().scroll_bottom
        } else {
            self.rows - 1
        };
        let scr = self.scr();
        scr.cursor.y = (scr.cursor.y + n).min(max_y);
        self.wrap_pending = false;
    }

    fn cursor_forward(&mut self, n: i32) {
        let n = n.max(1) as usize;
        let cols = self.cols;
        let scr = self.scr();
        scr.cursor.x = (scr.cursor.x + n).min(cols - 1);
        self.wrap_pending = false;
    }

    fn cursor_backward(&mut self, n: i32) {
        let n = n.max(1) as usize;
        let scr = self.scr();
        scr.cursor.x = scr.cursor.x.saturating_sub(n);
        self.wrap_pending = false;
    }

    fn new_line(&mut self, with_cr: bool) {
        let newline_mode = self.newline_mode;
        let fill = self.blank_cell();
        let scr = self.scr();
        if with_cr {
            scr.cursor.x = 0;
        }
        scr.cursor.y += 1;
        if scr.cursor.y > scr.scroll_bottom {
            scr.cursor.y = scr.scroll_bottom;
            scr.scroll_up(1, fill);
        }
        if newline_mode {
            scr.cursor.x = 0;
        }
        self.wrap_pending = false;
    }

    fn reverse_index(&mut self) {
        let fill = self.blank_cell();
        let scr = self.scr();
        if scr.cursor.y == scr.scroll_top {
            scr.scroll_down(1, fill);
        } else {
            scr.cursor.y = scr.cursor.y.saturating_sub(1);
        }
    }

    fn erase_display(&mut self, mode: i32) {
        let fill = self.blank_cell();
        let cols = self.cols;
        let rows = self.rows;
        match mode {
            0 => {
                self.erase_line(0);
                let start = self.scr_ref().cursor.y + 1;
                for y in start..rows {
                    self.scr().clear_line(y, 0, cols - 1, fill);
                }
            }
            1 => {
                let end = self.scr_ref().cursor.y;
                for y in 0..end {
                    self.scr().clear_line(y, 0, cols - 1, fill);
                }
                self.erase_line(1);
            }
            2 => self.scr().clear_all(fill),
            _ => {}
        }
    }

    fn erase_line(&mut self, mode: i32) {
        let fill = self.blank_cell();
        let cols = self.cols;
        let cursor = self.scr_ref().cursor;
        match mode {
            0 => self.scr().clear_line(cursor.y, cursor.x, cols - 1, fill),
            1 => self.scr().clear_line(cursor.y, 0, cursor.x, fill),
            2 => self.scr().clear_line(cursor.y, 0, cols - 1, fill),
            _ => {}
        }
    }

    fn insert_chars(&mut self, n: usize) {
        let fill = self.blank_cell();
        let cursor = self.scr_ref().cursor;
        self.scr().insert_chars(cursor.y, cursor.x, n.max(1), fill);
    }

    fn delete_chars(&mut self, n: usize) {
        let fill = self.blank_cell();
        let cursor = self.scr_ref().cursor;
        self.scr().delete_chars(cursor.y, cursor.x, n.max(1), fill);
    }

    fn erase_chars(&mut self, n: usize) {
        let fill = self.blank_cell();
        let cursor = self.scr_ref().cursor;
        let end = cursor.x + n.max(1) - 1;
        self.scr().clear_line(cursor.y, cursor.x, end, fill);
    }

    fn set_scroll_region(&mut self, params: &[i32]) {
        let rows = self.rows;
        let top = param(params, 0, 1) as usize - 1;
        let bottom = (param(params, 1, rows as i32) as usize - 1).min(rows - 1);
        let scr = self.scr();
        if top >= bottom {
            scr.scroll_top = 0;
            scr.scroll_bottom = rows - 1;
        } else {
            scr.scroll_top = top;
            scr.scroll_bottom = bottom;
        }
        self.cursor_position(1, 1);
    }

    fn set_mode(&mut self, params: &[i32], private: bool, enable: bool) {
        for &p in params {
            if private {
                match p {
                    7 => self.wrap_mode = enable,
                    25 => self.cursor_visible = enable,
                    6 => {
                        self.origin_mode = enable;
                        self.cursor_position(1, 1);
                    }
                    47 | 1047 | 1049 => self.set_alt_screen(enable, p == 1049),
                    _ => {}
                }
            } else {
                match p {
                    4 => self.insert_mode = enable,
                    20 => self.newline_mode = enable,
                    _ => {}
                }
            }
        }
    }

    fn set_alt_screen(&mut self, enable: bool, save_cursor: bool) {
        let fill = self.blank_cell();
        if enable {
            if save_cursor {
                self.main.save_cursor();
            }
            self.alt.clear_all(fill);
            self.active = Active::Alt;
            self.alt.cursor = Cursor::default();
        } else {
            if save_cursor {
                self.main.restore_cursor();
            }
            self.active = Active::Main;
        }
        self.wrap_pending = false;
    }

    fn select_graphic_rendition(&mut self, params: &[i32]) {
        let params: Vec<i32> = if params.is_empty() {
            vec![0]
        } else {
            params.iter().map(|&p| if p < 0 { 0 } else { p }).collect()
        };
        let mut i = 0;
        while i < params.len() {
            match params[i] {
                0 => self.attr = Attr::default(),
                1 => self.attr.mode |= MODE_BOLD,
                2 => self.attr.mode |= MODE_FAINT,
                3 => self.attr.mode |= MODE_ITALIC,
                4 => self.attr.mode |= MODE_UNDERLINE,
                5 => self.attr.mode |= MODE_BLINK,
                7 => self.attr.mode |= MODE_INVERSE,
                8 => self.attr.mode |= MODE_HIDDEN,
                22 => self.attr.mode &= !(MODE_BOLD | MODE_FAINT),
                23 => self.attr.mode &= !MODE_ITALIC,
                24 => self.attr.mode &= !MODE_UNDERLINE,
                25 => self.attr.mode &= !MODE_BLINK,
                27 => self.attr.mode &= !MODE_INVERSE,
                28 => self.attr.mode &= !MODE_HIDDEN,
                39 => self.attr.fg = Color::DEFAULT,
                49 => self.attr.bg = Color::DEFAULT,
                p @ 30..=37 => self.attr.fg = Color::indexed16((p - 30) as u8),
                p @ 40..=47 => self.attr.bg = Color::indexed16((p - 40) as u8),
                p @ 90..=97 => self.attr.fg = Color::indexed16((p - 90 + 8) as u8),
                p @ 100..=107 => self.attr.bg = Color::indexed16((p - 100 + 8) as u8),
                p @ (38 | 48) => {
                    let is_fg = p == 38;
                    if params.get(i + 1) == Some(&5) {
                        if let Some(&idx) = params.get(i + 2) {
                            let color = Color::indexed256((idx & 0xff) as u8);
                            if is_fg {
                                self.attr.fg = color;
                            } else {
                                self.attr.bg = color;
                            }
                            i += 2;
                        }
                    } else if params.get(i + 1) == Some(&2) {
                        if let (Some(&r), Some(&g), Some(&b)) =
                            (params.get(i + 2), params.get(i + 3), params.get(i + 4))
                        {
                            let color = Color::rgb(
                                (r & 0xff) as u8,
                                (g & 0xff) as u8,
                                (b & 0xff) as u8,
                            );
                            if is_fg {
                                self.attr.fg = color;
                            } else {
                                self.attr.bg = color;
                            }
                            i += 4;
                        }
                    }
                }
                _ => {}
            }
            i += 1;
        }
    }

    fn blank_cell(&self) -> Cell {
        Cell {
            ch: ' ',
            mode: self.attr.mode,
            fg: self.attr.fg,
            bg: self.attr.bg,
        }
    }

    fn reset(&mut self) {
        self.attr = Attr::default();
        self.wrap_mode = true;
        self.origin_mode = false;
        self.insert_mode = false;
        self.newline_mode = false;
        self.cursor_visible = true;
        self.wrap_pending = false;
        self.title.clear();
        let fill = Cell::default();
        self.main.clear_all(fill);
        self.alt.clear_all(fill);
        self.active = Active::Main;
        self.main.cursor = Cursor::default();
        self.main.scroll_top = 0;
        self.main.scroll_bottom = self.rows - 1;
        self.tab_stops = default_tabs(self.cols);
    }
}

fn default_tabs(cols: usize) -> Vec<bool> {
    let mut stops = vec![false; cols];
    let mut x = 0;
    while x < cols {
        stops[x] = true;
        x += 8;
    }
    stops
}

fn map_line_drawing(ch: char) -> char {
    match ch {
        '`' => '◆',
        'a' => '▒',
        'f' => '°',
        'g' => '±',
        'j' => '┘',
        'k' => '┐',
        'l' => '┌',
        'm' => '└',
        'n' => '┼',
        'q' => '─',
        't' => '├',
        'u' => '┤',
        'v' => '┴',
        'w' => '┬',
        'x' => '│',
        '~' => '·',
        _ => ch,
    }
}
