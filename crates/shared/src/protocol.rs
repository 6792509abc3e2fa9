//! STOMP 1.2 framing and the destination layout used by the chat broker.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::{domain::UserId, error::FrameError};

pub const PUBLISH_PREFIX: &str = "/app/chat";
pub const DEFAULT_CHANNEL_PREFIX: &str = "/topic/conversation";

/// Destination a sender publishes to: `/app/chat/{sender}/{recipient}`.
pub fn publish_destination(sender_id: UserId, recipient_id: UserId) -> String {
    format!("{PUBLISH_PREFIX}/{sender_id}/{recipient_id}")
}

/// Channel both participants of a conversation subscribe to. The ids are
/// ordered so that either side derives the same name.
pub fn conversation_channel(prefix: &str, a: UserId, b: UserId) -> String {
    let (low, high) = if a <= b { (a, b) } else { (b, a) };
    format!("{}/{low}.{high}", prefix.trim_end_matches('/'))
}

/// Body of a published chat message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SendPayload {
    pub content: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    Connect,
    Stomp,
    Connected,
    Send,
    Subscribe,
    Unsubscribe,
    Message,
    Receipt,
    Error,
    Disconnect,
}

impl Command {
    pub fn as_str(self) -> &'static str {
        match self {
            Command::Connect => "CONNECT",
            Command::Stomp => "STOMP",
            Command::Connected => "CONNECTED",
            Command::Send => "SEND",
            Command::Subscribe => "SUBSCRIBE",
            Command::Unsubscribe => "UNSUBSCRIBE",
            Command::Message => "MESSAGE",
            Command::Receipt => "RECEIPT",
            Command::Error => "ERROR",
            Command::Disconnect => "DISCONNECT",
        }
    }

    fn parse(raw: &str) -> Result<Self, FrameError> {
        Ok(match raw {
            "CONNECT" => Command::Connect,
            "STOMP" => Command::Stomp,
            "CONNECTED" => Command::Connected,
            "SEND" => Command::Send,
            "SUBSCRIBE" => Command::Subscribe,
            "UNSUBSCRIBE" => Command::Unsubscribe,
            "MESSAGE" => Command::Message,
            "RECEIPT" => Command::Receipt,
            "ERROR" => Command::Error,
            "DISCONNECT" => Command::Disconnect,
            other => return Err(FrameError::UnknownCommand(other.to_string())),
        })
    }

    // Header values of the handshake frames are sent verbatim.
    fn escapes_headers(self) -> bool {
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
    pub body: String,
}

impl Frame {
    pub fn new(command: Command) -> Self {
        Self {
            command,
            headers: Vec::new(),
            body: String::new(),
        }
    }

    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    pub fn with_body(mut self, body: impl Into<String>) -> Self {
        self.body = body.into();
        self
    }

    /// First value of `name`; repeated headers keep the earliest entry.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key == name)
            .map(|(_, value)| value.as_str())
    }

    pub fn encode(&self) -> String {
        let escape = self.command.escapes_headers();
        let mut out = String::with_capacity(self.body.len() + 64);
        out.push_str(self.command.as_str());
        out.push('\n');
        for (name, value) in &self.headers {
            if escape {
                out.push_str(&escape_header(name));
                out.push(':');
                out.push_str(&escape_header(value));
            } else {
                out.push_str(name);
                out.push(':');
                out.push_str(value);
            }
            out.push('\n');
        }
        out.push('\n');
        out.push_str(&self.body);
        out.push('\0');
        out
    }

    /// Decodes the first frame of `raw`. A payload made only of EOLs is a
    /// heart-beat and yields `Ok(None)`.
    pub fn decode(raw: &str) -> Result<Option<Self>, FrameError> {
        Ok(Self::decode_next(raw)?.map(|(frame, _)| frame))
    }

    /// Decodes every frame carried by one transport message, skipping the
    /// heart-beat EOLs between them.
    pub fn decode_all(raw: &str) -> Result<Vec<Self>, FrameError> {
        let mut frames = Vec::new();
        let mut rest = raw;
        while let Some((frame, consumed)) = Self::decode_next(rest)? {
            frames.push(frame);
            rest = &rest[consumed..];
        }
        Ok(frames)
    }

    // Returns the frame and how many bytes of `raw` it used.
    fn decode_next(raw: &str) -> Result<Option<(Self, usize)>, FrameError> {
        let trimmed = raw.trim_start_matches(['\r', '\n']);
        let skipped = raw.len() - trimmed.len();
        let raw = trimmed;
        if raw.is_empty() {
            return Ok(None);
        }

        let mut pos = 0;
        let mut lines = Vec::new();
        loop {
            let Some(eol) = raw[pos..].find('\n') else {
                return Err(FrameError::Unterminated);
            };
            let line = raw[pos..pos + eol].trim_end_matches('\r');
            pos += eol + 1;
            if line.is_empty() {
                break;
            }
            lines.push(line);
        }

        let mut lines = lines.into_iter();
        let command = Command::parse(lines.next().ok_or(FrameError::Empty)?)?;
        let escaped = command.escapes_headers();

        let mut headers = Vec::new();
        for line in lines {
            let (name, value) = line
                .split_once(':')
                .ok_or_else(|| FrameError::MalformedHeader(line.to_string()))?;
            if escaped {
                headers.push((unescape_header(name)?, unescape_header(value)?));
            } else {
                headers.push((name.to_string(), value.to_string()));
            }
        }

        let rest = &raw[pos..];
        let declared = headers
            .iter()
            .find(|(name, _)| name == "content-length")
            .and_then(|(_, value)| value.trim().parse::<usize>().ok());
        let (body, used) = match declared {
            Some(declared) => {
                let body = rest.get(..declared).ok_or(FrameError::ContentLength {
                    declared,
                    actual: rest.len(),
                })?;
                let terminator = usize::from(rest[declared..].starts_with('\0'));
                (body.to_string(), declared + terminator)
            }
            None => {
                let end = rest.find('\0').ok_or(FrameError::Unterminated)?;
                (rest[..end].to_string(), end + 1)
            }
        };

        let frame = Self {
            command,
            headers,
            body,
        };
        Ok(Some((frame, skipped + pos + used)))
    }
}

fn escape_header(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for ch in raw.chars() {
        match ch {
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            ':' => out.push_str("\\c"),
            other => out.push(other),
        }
    }
    out
}

fn unescape_header(raw: &str) -> Result<String, FrameError> {
    let mut out = String::with_capacity(raw.len());
    let mut chars = raw.chars();
    while let Some(ch) = chars.next() {
        if ch != '\\' {
            out.push(ch);
            continue;
        }
        match chars.next() {
            Some('\\') => out.push('\\'),
            Some('n') => out.push('\n'),
            Some('r') => out.push('\r'),
            Some('c') => out.push(':'),
            _ => return Err(FrameError::InvalidEscape(raw.to_string())),
        }
    }
    Ok(out)
}
