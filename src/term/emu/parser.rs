/// Escape-sequence parser states.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub(super) enum State {
    #[default]
    Ground,
    Escape,
    Csi,
    Osc,
    /// DCS/SOS/PM/APC payloads, collected and discarded.
    Str,
    Charset,
}

/// Incremental parse state carried between [`write`](super::Emulator::write)
/// calls. CSI parameters default to -1 when absent so handlers can apply
/// their own defaults.
#[derive(Debug, Default)]
pub(super) struct Parser {
    pub state: State,

    pub private: bool,
    params: Vec<i32>,
    pub param_seen: bool,
    current: i32,
    has_param: bool,

    pub osc_buf: Vec<u8>,
    pub osc_esc: bool,

    pub utf8_buf: Vec<u8>,
    pub charset_target: usize,
}

impl Parser {
    pub fn reset_csi(&mut self) {
        self.private = false;
        self.params.clear();
        self.param_seen = false;
        self.current = 0;
        self.has_param = false;
    }

    pub fn add_digit(&mut self, digit: i32) {
        self.param_seen = true;
        if !self.has_param {
            self.current = 0;
            self.has_param = true;
        }
        self.current = self.current.saturating_mul(10).saturating_add(digit);
    }

    pub fn next_param(&mut self) {
        if self.has_param {
            self.params.push(self.current);
        } else {
            self.params.push(-1);
        }
        self.has_param = false;
        self.current = 0;
    }

    pub fn finalize_params(&mut self) -> Vec<i32> {
        if self.has_param {
            self.params.push(self.current);
        } else if self.params.is_empty() {
            self.params.push(-1);
        }
        let out = self.params.clone();
        self.reset_csi();
        out
    }

    pub fn reset_osc(&mut self) {
        self.osc_buf.clear();
        self.osc_esc = false;
    }

    pub fn reset_str(&mut self) {
        self.osc_esc = false;
    }
}

/// Split an OSC payload into its numeric code and argument.
pub(super) fn parse_osc(buf: &[u8]) -> (i32, String) {
    if buf.is_empty() {
        return (-1, String::new());
    }
    let text = String::from_utf8_lossy(buf);
    let (code, payload) = match text.split_once(';') {
        Some((code, payload)) => (code, payload.to_string()),
        None => (text.as_ref(), String::new()),
    };
    match code.parse::<i32>() {
        Ok(code) => (code, payload),
        Err(_) => (-1, String::new()),
    }
}

/// Positional CSI parameter with a default for missing, negative or zero
/// values (zero means "default" for every sequence this emulator handles).
pub(super) fn param(params: &[i32], idx: usize, default: i32) -> i32 {
    match params.get(idx) {
        Some(&value) if value > 0 => value,
        _ => default,
    }
}

/// Like [`param`] but zero is meaningful (erase modes).
pub(super) fn param_or(params: &[i32], idx: usize, default: i32) -> i32 {
    match params.get(idx) {
        Some(&value) if value >= 0 => value,
        _ => default,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn params_default_to_minus_one() {
        let mut parser = Parser::default();
        parser.next_param();
        parser.add_digit(4);
        let params = parser.finalize_params();
        assert_eq!(params, vec![-1, 4]);
    }

    #[test]
    fn empty_csi_yields_single_default() {
        let mut parser = Parser::default();
        assert_eq!(parser.finalize_params(), vec![-1]);
    }

    #[test]
    fn osc_splits_code_and_payload() {
        assert_eq!(parse_osc(b"0;my title"), (0, "my title".to_string()));
        assert_eq!(parse_osc(b"2;a;b"), (2, "a;b".to_string()));
        assert_eq!(parse_osc(b"garbage"), (-1, String::new()));
    }

    #[test]
    fn param_defaults() {
        assert_eq!(param(&[-1], 0, 1), 1);
        assert_eq!(param(&[0], 0, 1), 1);
        assert_eq!(param(&[5], 0, 1), 5);
        assert_eq!(param_or(&[0], 0, 1), 0);
        assert_eq!(param_or(&[], 0, 1), 1);
    }
}
