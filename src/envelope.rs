//! Message envelope wire format.
//!
//! Every message on the wire is one envelope: a fixed-size header followed by
//! the message body. The transport layer never interprets the body; it only
//! frames it. The header carries a message type id and a correlation id so
//! the application protocol above can route responses to their requests
//! without decoding bodies.
//!
//! Wire format (all integers little-endian):
//!
//! ```text
//! [id: u32][correlation_id: u32][body_len: u32][body: body_len bytes]
//! ```

use crate::error::Error;

/// Correlation id used by messages that do not respond to anything.
pub const NO_CORRELATION_ID: u32 = 0;

/// One length-prefixed wire unit wrapping an application message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageEnvelope {
    id: u32,
    correlation_id: u32,
    body: Vec<u8>,
}

impl MessageEnvelope {
    /// Size of the fixed envelope header in bytes.
    pub const HEADER_LENGTH: usize = 12;

    /// Largest body length accepted on decode.
    ///
    /// A length prefix above this is treated as corruption rather than an
    /// instruction to buffer gigabytes.
    pub const MAX_BODY_LENGTH: usize = 16 * 1024 * 1024;

    /// Creates an envelope wrapping `body`.
    pub fn new(id: u32, correlation_id: u32, body: Vec<u8>) -> Self {
        Self {
            id,
            correlation_id,
            body,
        }
    }

    /// The application message type id.
    pub fn id(&self) -> u32 {
        self.id
    }

    /// The id of the message this one responds to, or [`NO_CORRELATION_ID`].
    pub fn correlation_id(&self) -> u32 {
        self.correlation_id
    }

    /// The message body bytes.
    pub fn body(&self) -> &[u8] {
        &self.body
    }

    /// Consumes the envelope, returning the body.
    pub fn into_body(self) -> Vec<u8> {
        self.body
    }

    /// Total size of the envelope on the wire: header plus body.
    pub fn total_length(&self) -> usize {
        Self::HEADER_LENGTH + self.body.len()
    }

    /// Serializes the envelope to its wire format.
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(self.total_length());
        buf.extend(self.id.to_le_bytes());
        buf.extend(self.correlation_id.to_le_bytes());
        buf.extend((self.body.len() as u32).to_le_bytes());
        buf.extend_from_slice(&self.body);
        buf
    }

    /// Decodes the fixed header, returning `(id, correlation_id, body_len)`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::EnvelopeTooLarge`] if the declared body length exceeds
    /// [`MAX_BODY_LENGTH`](Self::MAX_BODY_LENGTH).
    pub fn decode_header(header: &[u8; Self::HEADER_LENGTH]) -> Result<(u32, u32, usize), Error> {
        let id = u32::from_le_bytes(header[0..4].try_into().expect("fixed slice"));
        let correlation_id = u32::from_le_bytes(header[4..8].try_into().expect("fixed slice"));
        let body_len = u32::from_le_bytes(header[8..12].try_into().expect("fixed slice")) as usize;

        if body_len > Self::MAX_BODY_LENGTH {
            return Err(Error::EnvelopeTooLarge {
                length: body_len,
                max: Self::MAX_BODY_LENGTH,
            });
        }

        Ok((id, correlation_id, body_len))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encode_layout() {
        let envelope = MessageEnvelope::new(7, 3, vec![0xAA, 0xBB]);
        let bytes = envelope.encode();
        assert_eq!(bytes.len(), MessageEnvelope::HEADER_LENGTH + 2);
        assert_eq!(&bytes[0..4], &7u32.to_le_bytes());
        assert_eq!(&bytes[4..8], &3u32.to_le_bytes());
        assert_eq!(&bytes[8..12], &2u32.to_le_bytes());
        assert_eq!(&bytes[12..], &[0xAA, 0xBB]);
    }

    #[test]
    fn decode_header_round_trip() {
        let envelope = MessageEnvelope::new(42, NO_CORRELATION_ID, vec![1; 5]);
        let bytes = envelope.encode();
        let header: [u8; MessageEnvelope::HEADER_LENGTH] =
            bytes[..MessageEnvelope::HEADER_LENGTH].try_into().unwrap();
        let (id, correlation_id, body_len) = MessageEnvelope::decode_header(&header).unwrap();
        assert_eq!(id, 42);
        assert_eq!(correlation_id, NO_CORRELATION_ID);
        assert_eq!(body_len, 5);
    }

    #[test]
    fn oversized_body_length_is_rejected() {
        let mut header = [0u8; MessageEnvelope::HEADER_LENGTH];
        header[8..12].copy_from_slice(&(u32::MAX).to_le_bytes());
        assert!(matches!(
            MessageEnvelope::decode_header(&header),
            Err(Error::EnvelopeTooLarge { .. })
        ));
    }
}
