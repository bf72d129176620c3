//! STOMP frame codec.
//!
//! Frames are `COMMAND\n`, zero or more `name:value\n` headers, a blank line,
//! the body and a terminating NUL. A bare EOL between frames is a heart-beat.

use std::fmt;

use thiserror::Error;

pub const ACCEPT_VERSIONS: &str = "1.0,1.1,1.2";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FrameError {
    #[error("frame is truncated")]
    Truncated,

    #[error("unknown STOMP command {0:?}")]
    UnknownCommand(String),

    #[error("header line {0:?} has no ':' separator")]
    MissingHeaderSeparator(String),

    #[error("invalid escape sequence in header {0:?}")]
    InvalidEscape(String),

    #[error("invalid content-length {0:?}")]
    InvalidContentLength(String),

    #[error("frame is not valid UTF-8")]
    InvalidUtf8,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Command {
    Connect,
    Stomp,
    Connected,
    Send,
    Subscribe,
    Unsubscribe,
    Ack,
    Nack,
    Begin,
    Commit,
    Abort,
    Disconnect,
    Message,
    Receipt,
    Error,
}

impl Command {
    pub fn as_str(&self) -> &'static str {
        match self {
            Command::Connect => "CONNECT",
            Command::Stomp => "STOMP",
            Command::Connected => "CONNECTED",
            Command::Send => "SEND",
            Command::Subscribe => "SUBSCRIBE",
            Command::Unsubscribe => "UNSUBSCRIBE",
            Command::Ack => "ACK",
            Command::Nack => "NACK",
            Command::Begin => "BEGIN",
            Command::Commit => "COMMIT",
            Command::Abort => "ABORT",
            Command::Disconnect => "DISCONNECT",
            Command::Message => "MESSAGE",
            Command::Receipt => "RECEIPT",
            Command::Error => "ERROR",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        let command = match s {
            "CONNECT" => Command::Connect,
            "STOMP" => Command::Stomp,
            "CONNECTED" => Command::Connected,
            "SEND" => Command::Send,
            "SUBSCRIBE" => Command::Subscribe,
            "UNSUBSCRIBE" => Command::Unsubscribe,
            "ACK" => Command::Ack,
            "NACK" => Command::Nack,
            "BEGIN" => Command::Begin,
            "COMMIT" => Command::Commit,
            "ABORT" => Command::Abort,
            "DISCONNECT" => Command::Disconnect,
            "MESSAGE" => Command::Message,
            "RECEIPT" => Command::Receipt,
            "ERROR" => Command::Error,
            _ => return None,
        };
        Some(command)
    }

    // CONNECT and CONNECTED headers are sent verbatim.
    fn escapes_headers(&self) -> bool {
        !matches!(self, Command::Connect | Command::Stomp | Command::Connected)
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub command: Command,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

/// One unit read off the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decoded {
    Frame(Frame),
    Heartbeat,
}

impl Frame {
    pub fn new(command: Command) -> Self {
        Self {
            command,
            headers: Vec::new(),
            body: Vec::new(),
        }
    }

    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    pub fn with_body(mut self, body: impl Into<Vec<u8>>) -> Self {
        self.body = body.into();
        self
    }

    /// Value of the first header called `name`; repeated headers keep the first.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.as_str())
    }

    pub fn body_str(&self) -> Result<&str, FrameError> {
        std::str::from_utf8(&self.body).map_err(|_| FrameError::InvalidUtf8)
    }

    pub fn connect(host: &str, heartbeat: (u64, u64)) -> Self {
        Frame::new(Command::Connect)
            .header("accept-version", ACCEPT_VERSIONS)
            .header("host", host)
            .header("heart-beat", format!("{},{}", heartbeat.0, heartbeat.1))
    }

    pub fn subscribe(id: &str, destination: &str) -> Self {
        Frame::new(Command::Subscribe)
            .header("id", id)
            .header("destination", destination)
            .header("ack", "auto")
    }

    pub fn unsubscribe(id: &str) -> Self {
        Frame::new(Command::Unsubscribe).header("id", id)
    }

    pub fn disconnect(receipt: &str) -> Self {
        Frame::new(Command::Disconnect).header("receipt", receipt)
    }

    pub fn encode(&self) -> Vec<u8> {
        let escape = self.command.escapes_headers();
        let mut out = Vec::with_capacity(self.body.len() + 64);
        out.extend_from_slice(self.command.as_str().as_bytes());
        out.push(b'\n');

        for (name, value) in &self.headers {
            if escape {
                out.extend_from_slice(escape_header(name).as_bytes());
                out.push(b':');
                out.extend_from_slice(escape_header(value).as_bytes());
            } else {
                out.extend_from_slice(name.as_bytes());
                out.push(b':');
                out.extend_from_slice(value.as_bytes());
            }
            out.push(b'\n');
        }

        if !self.body.is_empty() && self.get("content-length").is_none() {
            out.extend_from_slice(format!("content-length:{}\n", self.body.len()).as_bytes());
        }

        out.push(b'\n');
        out.extend_from_slice(&self.body);
        out.push(0);
        out
    }
}

/// Parse a `heart-beat` header value (`"<cx>,<cy>"`).
pub fn parse_heartbeat(value: &str) -> Option<(u64, u64)> {
    let (x, y) = value.split_once(',')?;
    Some((x.trim().parse().ok()?, y.trim().parse().ok()?))
}

/// Decode every frame in `data`, which is one transport message.
///
/// A message made only of EOLs decodes to a single [`Decoded::Heartbeat`].
pub fn decode_all(data: &[u8]) -> Result<Vec<Decoded>, FrameError> {
    match decode_partial(data) {
        (decoded, None) => Ok(decoded),
        (_, Some(e)) => Err(e),
    }
}

/// Like [`decode_all`], but keeps the frames decoded before the first
/// malformed one. Decoding stops at that frame since the framing cannot be
/// trusted past it.
pub fn decode_partial(data: &[u8]) -> (Vec<Decoded>, Option<FrameError>) {
    let mut out = Vec::new();
    let mut pos = 0;

    loop {
        let start = pos;
        pos = skip_eols(data, pos);
        if pos >= data.len() {
            if pos > start && out.is_empty() {
                out.push(Decoded::Heartbeat);
            }
            return (out, None);
        }

        match decode_frame(data, pos) {
            Ok((frame, next)) => {
                out.push(Decoded::Frame(frame));
                pos = next;
            }
            Err(e) => return (out, Some(e)),
        }
    }
}

fn decode_frame(data: &[u8], pos: usize) -> Result<(Frame, usize), FrameError> {
    let (line, mut pos) = read_line(data, pos)?;
    let command = Command::parse(line).ok_or_else(|| FrameError::UnknownCommand(line.to_string()))?;
    let escape = command.escapes_headers();

    let mut headers = Vec::new();
    loop {
        let (line, next) = read_line(data, pos)?;
        pos = next;
        if line.is_empty() {
            break;
        }
        let (name, value) = line
            .split_once(':')
            .ok_or_else(|| FrameError::MissingHeaderSeparator(line.to_string()))?;
        if escape {
            headers.push((unescape_header(name)?, unescape_header(value)?));
        } else {
            headers.push((name.to_string(), value.to_string()));
        }
    }

    let mut frame = Frame {
        command,
        headers,
        body: Vec::new(),
    };

    match frame.get("content-length") {
        Some(raw) => {
            let len: usize = raw
                .trim()
                .parse()
                .map_err(|_| FrameError::InvalidContentLength(raw.to_string()))?;
            let end = pos.checked_add(len).ok_or(FrameError::Truncated)?;
            if data.get(end) != Some(&0) {
                return Err(FrameError::Truncated);
            }
            frame.body = data[pos..end].to_vec();
            Ok((frame, end + 1))
        }
        None => {
            let nul = data[pos..]
                .iter()
                .position(|b| *b == 0)
                .ok_or(FrameError::Truncated)?;
            frame.body = data[pos..pos + nul].to_vec();
            Ok((frame, pos + nul + 1))
        }
    }
}

fn skip_eols(data: &[u8], mut pos: usize) -> usize {
    while pos < data.len() {
        match data[pos] {
            b'\n' => pos += 1,
            b'\r' if data.get(pos + 1) == Some(&b'\n') => pos += 2,
            _ => break,
        }
    }
    pos
}

fn read_line(data: &[u8], pos: usize) -> Result<(&str, usize), FrameError> {
    let rest = &data[pos..];
    let eol = rest
        .iter()
        .position(|b| *b == b'\n')
        .ok_or(FrameError::Truncated)?;
    let mut line = &rest[..eol];
    if let Some(stripped) = line.strip_suffix(b"\r") {
        line = stripped;
    }
    let line = std::str::from_utf8(line).map_err(|_| FrameError::InvalidUtf8)?;
    Ok((line, pos + eol + 1))
}

fn escape_header(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for c in raw.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            '\r' => out.push_str("\\r"),
            '\n' => out.push_str("\\n"),
            ':' => out.push_str("\\c"),
            c => out.push(c),
        }
    }
    out
}

fn unescape_header(raw: &str) -> Result<String, FrameError> {
    let mut out = String::with_capacity(raw.len());
    let mut chars = raw.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('\\') => out.push('\\'),
            Some('r') => out.push('\r'),
            Some('n') => out.push('\n'),
            Some('c') => out.push(':'),
            _ => return Err(FrameError::InvalidEscape(raw.to_string())),
        }
    }
    Ok(out)
}
