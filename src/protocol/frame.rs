//! Transport framing: the 8-byte header every vita-ske1 message is prefixed
//! with, plus the two message bodies it can carry.

use crate::error::FrameError;

pub const NONCE_LEN: usize = 32;
pub const KEY_MESSAGE_LEN: usize = 4 + 32 + 32; // spi + public_key + auth_code
pub const HEADER_LEN: usize = 8;

/// IP protocol number used when wrapping a framed message for transmission:
/// "any private encryption scheme".
pub const IP_PROTOCOL_NUMBER: u8 = 99;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageType {
    Nonce = 1,
    Key = 3,
}

impl TryFrom<u8> for MessageType {
    type Error = FrameError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(MessageType::Nonce),
            3 => Ok(MessageType::Key),
            other => Err(FrameError::UnknownMessageType(other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransportHeader {
    pub spi: u32,
    pub message_type: MessageType,
}

impl TransportHeader {
    pub fn encode(&self) -> [u8; HEADER_LEN] {
        let mut out = [0u8; HEADER_LEN];
        out[0..4].copy_from_slice(&self.spi.to_be_bytes());
        out[4] = self.message_type as u8;
        out
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, FrameError> {
        if bytes.len() < HEADER_LEN {
            return Err(FrameError::Truncated);
        }
        let spi = u32::from_be_bytes(bytes[0..4].try_into().unwrap());
        let message_type = MessageType::try_from(bytes[4])?;
        Ok(Self { spi, message_type })
    }

    pub fn expected_body_len(&self) -> usize {
        match self.message_type {
            MessageType::Nonce => NONCE_LEN,
            MessageType::Key => KEY_MESSAGE_LEN,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NonceMessage {
    pub nonce: [u8; 32],
}

impl NonceMessage {
    pub fn encode(&self) -> [u8; NONCE_LEN] {
        self.nonce
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, FrameError> {
        if bytes.len() != NONCE_LEN {
            return Err(FrameError::BodyLength {
                expected: NONCE_LEN,
                got: bytes.len(),
            });
        }
        let mut nonce = [0u8; 32];
        nonce.copy_from_slice(bytes);
        Ok(Self { nonce })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KeyMessage {
    pub spi: u32,
    pub public_key: [u8; 32],
    pub auth_code: [u8; 32],
}

impl KeyMessage {
    pub fn encode(&self) -> [u8; KEY_MESSAGE_LEN] {
        let mut out = [0u8; KEY_MESSAGE_LEN];
        out[0..4].copy_from_slice(&self.spi.to_be_bytes());
        out[4..36].copy_from_slice(&self.public_key);
        out[36..68].copy_from_slice(&self.auth_code);
        out
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, FrameError> {
        if bytes.len() != KEY_MESSAGE_LEN {
            return Err(FrameError::BodyLength {
                expected: KEY_MESSAGE_LEN,
                got: bytes.len(),
            });
        }
        let spi = u32::from_be_bytes(bytes[0..4].try_into().unwrap());
        let mut public_key = [0u8; 32];
        public_key.copy_from_slice(&bytes[4..36]);
        let mut auth_code = [0u8; 32];
        auth_code.copy_from_slice(&bytes[36..68]);
        Ok(Self {
            spi,
            public_key,
            auth_code,
        })
    }
}

/// A fully parsed datagram: header plus typed body.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Body {
    Nonce(NonceMessage),
    Key(KeyMessage),
}

/// Parse a raw datagram into its header and body, validating the body length
/// against the type declared in the header.
pub fn decode_datagram(bytes: &[u8]) -> Result<(TransportHeader, Body), FrameError> {
    let header = TransportHeader::decode(bytes)?;
    let body_bytes = &bytes[HEADER_LEN..];
    if body_bytes.len() != header.expected_body_len() {
        return Err(FrameError::BodyLength {
            expected: header.expected_body_len(),
            got: body_bytes.len(),
        });
    }
    let body = match header.message_type {
        MessageType::Nonce => Body::Nonce(NonceMessage::decode(body_bytes)?),
        MessageType::Key => Body::Key(KeyMessage::decode(body_bytes)?),
    };
    Ok((header, body))
}

pub fn encode_nonce_datagram(spi: u32, msg: &NonceMessage) -> Vec<u8> {
    let header = TransportHeader {
        spi,
        message_type: MessageType::Nonce,
    };
    let mut out = Vec::with_capacity(HEADER_LEN + NONCE_LEN);
    out.extend_from_slice(&header.encode());
    out.extend_from_slice(&msg.encode());
    out
}

pub fn encode_key_datagram(spi: u32, msg: &KeyMessage) -> Vec<u8> {
    let header = TransportHeader {
        spi,
        message_type: MessageType::Key,
    };
    let mut out = Vec::with_capacity(HEADER_LEN + KEY_MESSAGE_LEN);
    out.extend_from_slice(&header.encode());
    out.extend_from_slice(&msg.encode());
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_roundtrip_is_bytewise_identity() {
        let h = TransportHeader {
            spi: 1234,
            message_type: MessageType::Key,
        };
        let encoded = h.encode();
        let decoded = TransportHeader::decode(&encoded).unwrap();
        assert_eq!(h, decoded);
        assert_eq!(&encoded[5..8], &[0, 0, 0]);
    }

    #[test]
    fn nonce_datagram_roundtrip() {
        let msg = NonceMessage { nonce: [7u8; 32] };
        let bytes = encode_nonce_datagram(999, &msg);
        let (header, body) = decode_datagram(&bytes).unwrap();
        assert_eq!(header.spi, 999);
        assert_eq!(header.message_type, MessageType::Nonce);
        assert_eq!(body, Body::Nonce(msg));
    }

    #[test]
    fn key_datagram_roundtrip() {
        let msg = KeyMessage {
            spi: 256,
            public_key: [1u8; 32],
            auth_code: [2u8; 32],
        };
        let bytes = encode_key_datagram(42, &msg);
        assert_eq!(bytes.len(), HEADER_LEN + KEY_MESSAGE_LEN);
        let (header, body) = decode_datagram(&bytes).unwrap();
        assert_eq!(header.spi, 42);
        assert_eq!(body, Body::Key(msg));
    }

    #[test]
    fn malformed_body_length_is_rejected() {
        let mut bytes = encode_nonce_datagram(1, &NonceMessage { nonce: [0u8; 32] });
        bytes.pop();
        assert!(matches!(
            decode_datagram(&bytes),
            Err(FrameError::BodyLength { .. })
        ));
    }

    #[test]
    fn truncated_header_is_rejected() {
        assert!(matches!(decode_datagram(&[0u8; 4]), Err(FrameError::Truncated)));
    }
}
