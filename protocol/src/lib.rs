// Wire protocol for the pingrig liveness probe.
//
// The protocol is line-oriented: one message per '\n'-terminated line.
//
//   PROBE <sequence> <timestamp-ms> [payload]
//   ACK <sequence> <timestamp-ms> [payload]
//
// Anything else on the wire is a protocol violation.

use std::fmt;
use std::str::FromStr;

use thiserror::Error;

pub mod codec;

pub use codec::{LineCodec, MAX_LINE_LENGTH};

#[derive(Debug, Error)]
pub enum ProtocolError {
    /// The line does not match either message form. Carries the raw
    /// offending content so it can be logged verbatim.
    #[error("malformed message: {line:?}")]
    Malformed { line: String },

    #[error("unknown message kind: {kind:?}")]
    UnknownKind { kind: String },

    #[error("line exceeds {MAX_LINE_LENGTH} bytes")]
    LineTooLong,

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageKind {
    Probe,
    Ack,
}

impl MessageKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageKind::Probe => "PROBE",
            MessageKind::Ack => "ACK",
        }
    }
}

impl FromStr for MessageKind {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "PROBE" => Ok(MessageKind::Probe),
            "ACK" => Ok(MessageKind::Ack),
            other => Err(ProtocolError::UnknownKind {
                kind: other.to_string(),
            }),
        }
    }
}

/// A single protocol message. Immutable after construction; one is
/// built per send.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub kind: MessageKind,
    /// Strictly increasing per connection, starting at 0.
    pub sequence: u64,
    /// Milliseconds since the Unix epoch, taken at send time.
    pub timestamp_ms: u64,
    /// Optional free-form payload (rest of the line).
    pub payload: Option<String>,
}

impl Message {
    pub fn probe(sequence: u64) -> Self {
        Message {
            kind: MessageKind::Probe,
            sequence,
            timestamp_ms: now_ms(),
            payload: None,
        }
    }

    /// Build the acknowledgement for a probe: identical sequence
    /// number, fresh server timestamp.
    pub fn ack_for(probe: &Message) -> Self {
        Message {
            kind: MessageKind::Ack,
            sequence: probe.sequence,
            timestamp_ms: now_ms(),
            payload: None,
        }
    }

    /// Parse one line (without the trailing newline).
    pub fn parse(line: &str) -> Result<Self, ProtocolError> {
        let malformed = || ProtocolError::Malformed {
            line: line.to_string(),
        };

        let mut parts = line.split_whitespace();
        let kind_str = parts.next().ok_or_else(malformed)?;
        let kind = kind_str.parse::<MessageKind>()?;

        let sequence = parts
            .next()
            .and_then(|s| s.parse::<u64>().ok())
            .ok_or_else(malformed)?;
        let timestamp_ms = parts
            .next()
            .and_then(|s| s.parse::<u64>().ok())
            .ok_or_else(malformed)?;

        let rest: Vec<&str> = parts.collect();
        let payload = if rest.is_empty() {
            None
        } else {
            Some(rest.join(" "))
        };

        Ok(Message {
            kind,
            sequence,
            timestamp_ms,
            payload,
        })
    }
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {} {}",
            self.kind.as_str(),
            self.sequence,
            self.timestamp_ms
        )?;
        if let Some(ref payload) = self.payload {
            write!(f, " {}", payload)?;
        }
        Ok(())
    }
}

/// Current wall-clock time in milliseconds since the Unix epoch.
pub fn now_ms() -> u64 {
    chrono::Utc::now().timestamp_millis() as u64
}
