//! GDB machine-interface record decoding.
//!
//! Every line GDB prints in `--interpreter=mi3` mode becomes one [`ResponseRecord`].
//! Tuples decode to JSON objects and lists to arrays, so typed helpers can pull
//! fields out with `serde_json` accessors or deserialize them outright.

use serde::Serialize;
use serde_json::{Map, Value};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum AsyncKind {
    /// `*` records: execution state changes such as `running` and `stopped`.
    Exec,
    /// `+` records: progress of long operations.
    Status,
    /// `=` records: breakpoint, thread and library notifications.
    Notify,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum StreamKind {
    Console,
    Target,
    Log,
    /// A line that is not MI at all, usually inferior output on a shared terminal.
    Raw,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ResponseRecord {
    Result {
        token: Option<u64>,
        message: String,
        payload: Value,
    },
    Notification {
        token: Option<u64>,
        kind: AsyncKind,
        message: String,
        payload: Value,
    },
    Stream {
        kind: StreamKind,
        text: String,
    },
    Error {
        token: Option<u64>,
        message: String,
        payload: Value,
    },
}

impl ResponseRecord {
    pub fn token(&self) -> Option<u64> {
        match self {
            Self::Result { token, .. }
            | Self::Notification { token, .. }
            | Self::Error { token, .. } => *token,
            Self::Stream { .. } => None,
        }
    }

    pub fn message(&self) -> &str {
        match self {
            Self::Result { message, .. }
            | Self::Notification { message, .. }
            | Self::Error { message, .. } => message,
            Self::Stream { text, .. } => text,
        }
    }

    pub fn payload(&self) -> Option<&Value> {
        match self {
            Self::Result { payload, .. }
            | Self::Notification { payload, .. }
            | Self::Error { payload, .. } => Some(payload),
            Self::Stream { .. } => None,
        }
    }

    /// Records that answer a command: `^done`, `^running`, `^connected`, `^error`, ...
    pub fn is_reply(&self) -> bool {
        matches!(self, Self::Result { .. } | Self::Error { .. })
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::Result { .. } => "result",
            Self::Notification { .. } => "notification",
            Self::Stream { .. } => "stream",
            Self::Error { .. } => "error",
        }
    }
}

/// Decoded `*stopped` notification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StopEvent {
    pub reason: String,
    pub address: Option<u64>,
    pub breakpoint: Option<u32>,
}

impl StopEvent {
    pub fn from_record(record: &ResponseRecord) -> Option<Self> {
        let ResponseRecord::Notification { message, payload, .. } = record else {
            return None;
        };
        if message != "stopped" {
            return None;
        }
        let reason = payload
            .get("reason")
            .and_then(Value::as_str)
            .unwrap_or("unknown")
            .to_string();
        let address = payload
            .get("frame")
            .and_then(|frame| frame.get("addr"))
            .and_then(Value::as_str)
            .and_then(parse_int);
        let breakpoint = payload
            .get("bkptno")
            .and_then(Value::as_str)
            .and_then(|n| n.parse().ok());
        Some(Self {
            reason,
            address,
            breakpoint,
        })
    }

    pub fn is_breakpoint_hit(&self) -> bool {
        self.reason == "breakpoint-hit"
    }
}

/// First stop notification among `records`, if any.
pub fn find_stop(records: &[ResponseRecord]) -> Option<StopEvent> {
    records.iter().find_map(StopEvent::from_record)
}

/// Whether `records` contain a result record with the given class, e.g. `connected`.
pub fn check_records(records: &[ResponseRecord], expected: &str) -> bool {
    records
        .iter()
        .any(|r| matches!(r, ResponseRecord::Result { message, .. } if message == expected))
}

/// Decodes one output line. The `(gdb)` prompt and blank lines yield `None`.
pub fn parse_record(line: &str) -> Option<ResponseRecord> {
    let line = line.trim_end_matches(['\r', '\n']);
    if line.is_empty() || line.trim_end() == "(gdb)" {
        return None;
    }

    let digits = line.bytes().take_while(u8::is_ascii_digit).count();
    let token = if digits > 0 { line[..digits].parse().ok() } else { None };
    let rest = &line[digits..];
    let raw = || ResponseRecord::Stream {
        kind: StreamKind::Raw,
        text: line.to_string(),
    };

    let Some(marker) = rest.chars().next() else {
        return Some(raw());
    };
    let body = &rest[marker.len_utf8()..];

    let record = match marker {
        '^' | '*' | '+' | '=' => {
            let Some((message, payload)) = parse_class_and_results(body) else {
                return Some(raw());
            };
            match marker {
                '^' if message == "error" => ResponseRecord::Error {
                    token,
                    message: payload
                        .get("msg")
                        .and_then(Value::as_str)
                        .unwrap_or("error")
                        .to_string(),
                    payload,
                },
                '^' => ResponseRecord::Result {
                    token,
                    message,
                    payload,
                },
                _ => ResponseRecord::Notification {
                    token,
                    kind: match marker {
                        '*' => AsyncKind::Exec,
                        '+' => AsyncKind::Status,
                        _ => AsyncKind::Notify,
                    },
                    message,
                    payload,
                },
            }
        }
        '~' | '@' | '&' if token.is_none() => {
            let mut cursor = Cursor::new(body);
            match cursor.c_string() {
                Some(text) if cursor.at_end() => ResponseRecord::Stream {
                    kind: match marker {
                        '~' => StreamKind::Console,
                        '@' => StreamKind::Target,
                        _ => StreamKind::Log,
                    },
                    text,
                },
                _ => raw(),
            }
        }
        _ => raw(),
    };
    Some(record)
}

fn parse_class_and_results(body: &str) -> Option<(String, Value)> {
    let (class, results) = match body.find(',') {
        Some(i) => (&body[..i], &body[i + 1..]),
        None => (body, ""),
    };
    if class.is_empty() {
        return None;
    }
    let mut payload = Map::new();
    if !results.is_empty() {
        let mut cursor = Cursor::new(results);
        loop {
            let (key, value) = cursor.result()?;
            payload.insert(key, value);
            if cursor.at_end() {
                break;
            }
            cursor.expect(b',')?;
        }
    }
    Some((class.to_string(), Value::Object(payload)))
}

struct Cursor<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn new(text: &'a str) -> Self {
        Self {
            bytes: text.as_bytes(),
            pos: 0,
        }
    }

    fn at_end(&self) -> bool {
        self.pos >= self.bytes.len()
    }

    fn peek(&self) -> Option<u8> {
        self.bytes.get(self.pos).copied()
    }

    fn expect(&mut self, byte: u8) -> Option<()> {
        if self.peek() == Some(byte) {
            self.pos += 1;
            Some(())
        } else {
            None
        }
    }

    fn result(&mut self) -> Option<(String, Value)> {
        let start = self.pos;
        while let Some(b) = self.peek() {
            if b == b'=' {
                break;
            }
            self.pos += 1;
        }
        let key = std::str::from_utf8(&self.bytes[start..self.pos]).ok()?.to_string();
        self.expect(b'=')?;
        let value = self.result_value()?;
        Some((key, value))
    }

    /// A value that may be followed by more `,{..}` tuples, which is how GDB prints a
    /// breakpoint with several locations. The extra tuples go under `locations` of
    /// the first one.
    fn result_value(&mut self) -> Option<Value> {
        let mut value = self.value()?;
        let mut extra = Vec::new();
        while self.peek() == Some(b',') && self.bytes.get(self.pos + 1) == Some(&b'{') {
            self.pos += 1;
            extra.push(self.tuple()?);
        }
        if !extra.is_empty() {
            if let Value::Object(map) = &mut value {
                map.entry("locations").or_insert(Value::Array(extra));
            }
        }
        Some(value)
    }

    fn value(&mut self) -> Option<Value> {
        match self.peek()? {
            b'"' => self.c_string().map(Value::String),
            b'{' => self.tuple(),
            b'[' => self.list(),
            _ => None,
        }
    }

    fn tuple(&mut self) -> Option<Value> {
        self.expect(b'{')?;
        let mut map = Map::new();
        if self.expect(b'}').is_some() {
            return Some(Value::Object(map));
        }
        loop {
            let (key, value) = self.result()?;
            map.insert(key, value);
            if self.expect(b'}').is_some() {
                return Some(Value::Object(map));
            }
            self.expect(b',')?;
        }
    }

    /// Lists hold either bare values or `key=value` results; keys are dropped.
    fn list(&mut self) -> Option<Value> {
        self.expect(b'[')?;
        let mut items = Vec::new();
        if self.expect(b']').is_some() {
            return Some(Value::Array(items));
        }
        loop {
            let item = match self.peek()? {
                b'"' | b'{' | b'[' => self.value()?,
                _ => self.result()?.1,
            };
            items.push(item);
            if self.expect(b']').is_some() {
                return Some(Value::Array(items));
            }
            self.expect(b',')?;
        }
    }

    fn c_string(&mut self) -> Option<String> {
        self.expect(b'"')?;
        let mut out = Vec::new();
        loop {
            let b = self.peek()?;
            self.pos += 1;
            match b {
                b'"' => return Some(String::from_utf8_lossy(&out).into_owned()),
                b'\\' => {
                    let escaped = self.peek()?;
                    self.pos += 1;
                    match escaped {
                        b'n' => out.push(b'\n'),
                        b't' => out.push(b'\t'),
                        b'r' => out.push(b'\r'),
                        b'0'..=b'7' => {
                            let mut value = u32::from(escaped - b'0');
                            for _ in 0..2 {
                                match self.peek() {
                                    Some(d @ b'0'..=b'7') => {
                                        value = value * 8 + u32::from(d - b'0');
                                        self.pos += 1;
                                    }
                                    _ => break,
                                }
                            }
                            out.push((value & 0xff) as u8);
                        }
                        other => out.push(other),
                    }
                }
                other => out.push(other),
            }
        }
    }
}

/// Parses an MI integer: `0x` hex or signed decimal.
///
/// Negative values are returned as their unsigned 64-bit two's complement since
/// registers are machine words.
pub fn parse_int(text: &str) -> Option<u64> {
    let text = text.trim();
    if let Some(hex) = text.strip_prefix("0x").or_else(|| text.strip_prefix("0X")) {
        return u64::from_str_radix(hex, 16).ok();
    }
    let value: i128 = text.parse().ok()?;
    if value < i128::from(i64::MIN) || value > i128::from(u64::MAX) {
        return None;
    }
    Some(value as u64)
}

pub fn decode_hex(text: &str) -> Option<Vec<u8>> {
    if text.len() % 2 != 0 {
        return None;
    }
    (0..text.len())
        .step_by(2)
        .map(|i| u8::from_str_radix(text.get(i..i + 2)?, 16).ok())
        .collect()
}

/// Quotes `text` as an MI c-string argument.
pub fn mi_quote(text: &str) -> String {
    let mut quoted = String::with_capacity(text.len() + 2);
    quoted.push('"');
    for c in text.chars() {
        match c {
            '"' | '\\' => {
                quoted.push('\\');
                quoted.push(c);
            }
            '\n' => quoted.push_str("\\n"),
            _ => quoted.push(c),
        }
    }
    quoted.push('"');
    quoted
}
