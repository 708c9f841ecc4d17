// Line codec for protocol messages.
//
// Splits the incoming byte stream on '\n' and parses each line into a
// Message; encodes a Message back as one '\n'-terminated line. Used
// through tokio_util's Framed on both server and client sides.

use bytes::{Buf, BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::{Message, ProtocolError};

/// Maximum accepted line length in bytes. A peer that streams more
/// than this without a newline is violating the protocol.
pub const MAX_LINE_LENGTH: usize = 8 * 1024;

#[derive(Debug, Default)]
pub struct LineCodec;

impl LineCodec {
    pub fn new() -> Self {
        LineCodec
    }
}

impl Decoder for LineCodec {
    type Item = Message;
    type Error = ProtocolError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Message>, ProtocolError> {
        let Some(newline) = src.iter().position(|&b| b == b'\n') else {
            if src.len() > MAX_LINE_LENGTH {
                return Err(ProtocolError::LineTooLong);
            }
            return Ok(None);
        };

        if newline > MAX_LINE_LENGTH {
            return Err(ProtocolError::LineTooLong);
        }

        let line = src.split_to(newline);
        src.advance(1); // consume the '\n'

        // Lossy conversion keeps the raw bytes visible in the error
        // path instead of failing on invalid UTF-8 separately.
        let text = String::from_utf8_lossy(&line);
        let text = text.trim_end_matches('\r');

        let msg = Message::parse(text)?;
        log::trace!("decoded {} {}", msg.kind.as_str(), msg.sequence);
        Ok(Some(msg))
    }
}

impl Encoder<Message> for LineCodec {
    type Error = ProtocolError;

    fn encode(&mut self, msg: Message, dst: &mut BytesMut) -> Result<(), ProtocolError> {
        let line = msg.to_string();
        dst.reserve(line.len() + 1);
        dst.put_slice(line.as_bytes());
        dst.put_u8(b'\n');
        log::trace!("encoded {} {}", msg.kind.as_str(), msg.sequence);
        Ok(())
    }
}
