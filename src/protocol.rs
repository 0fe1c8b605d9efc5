//! Telegram codec.
//!
//! Wire layout, all numeric fields as two upper-case hex digits:
//!
//! ```text
//! {AA;CC;LL|<payload>|KK}
//!  |  |  |             +-- additive checksum of address, command, payload (mod 256)
//!  |  |  +---------------- payload length in bytes
//!  |  +------------------- command code
//!  +---------------------- device address
//! ```
//!
//! Payload text is a `;`-separated list of tokens. A query carries bare field
//! codes (`PAC;UDC`), a reply carries `CODE=V1[,V2...]` with hex values.

use arrayvec::ArrayVec;
use heapless::Vec;
use serde::{Deserialize, Serialize};
use static_assertions::const_assert;
use thiserror::Error;

pub const MAX_TELEGRAM_SIZE: usize = 255;
/// Framing bytes around the payload.
pub const FRAME_OVERHEAD: usize = 14;
pub const MAX_PAYLOAD_SIZE: usize = 240;
pub const MAX_TOKEN_VALUES: usize = 4;

/// Command code used for data queries and their replies.
pub const QUERY_PORT: u8 = 0x64;

pub const TOKEN_DELIMITER: u8 = b';';
pub const VALUE_DELIMITER: char = ',';

const_assert!(MAX_PAYLOAD_SIZE + FRAME_OVERHEAD <= MAX_TELEGRAM_SIZE);
const_assert!(MAX_PAYLOAD_SIZE <= u8::MAX as usize);

pub type TelegramBuffer = Vec<u8, MAX_TELEGRAM_SIZE>;

const START: u8 = b'{';
const END: u8 = b'}';
const FIELD_SEP: u8 = b';';
const SECTION_SEP: u8 = b'|';

/// Bytes up to and including the payload separator; enough for
/// [`expected_length`] to answer.
pub const HEADER_LEN: usize = 10;

// Byte offsets of the fixed header.
const ADDRESS_AT: usize = 1;
const COMMAND_AT: usize = 4;
const LENGTH_AT: usize = 7;
const PAYLOAD_AT: usize = HEADER_LEN;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    #[error("malformed frame: {0}")]
    MalformedFrame(&'static str),

    #[error("checksum mismatch: computed {expected:02X}, received {actual:02X}")]
    ChecksumMismatch { expected: u8, actual: u8 },

    #[error("length field says {declared} payload bytes, frame carries {actual}")]
    LengthMismatch { declared: usize, actual: usize },

    #[error("malformed token '{0}'")]
    MalformedToken(String),

    #[error("payload of {0} bytes exceeds frame capacity")]
    FrameTooLarge(usize),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Frame {
    pub address: u8,
    pub command: u8,
    #[serde(with = "serde_bytes")]
    pub payload: std::vec::Vec<u8>,
    pub checksum: u8,
}

impl Frame {
    /// Build a frame with a correct checksum.
    pub fn new(address: u8, command: u8, payload: impl Into<std::vec::Vec<u8>>) -> Self {
        let payload = payload.into();
        let checksum = Self::compute_checksum(address, command, &payload);
        Self {
            address,
            command,
            payload,
            checksum,
        }
    }

    /// Query for one or more field codes.
    pub fn query(address: u8, codes: &[&str]) -> Self {
        Self::new(address, QUERY_PORT, codes.join(";").into_bytes())
    }

    pub fn compute_checksum(address: u8, command: u8, payload: &[u8]) -> u8 {
        payload
            .iter()
            .fold(address.wrapping_add(command), |sum, byte| sum.wrapping_add(*byte))
    }

    pub fn verify(&self) -> Result<(), ProtocolError> {
        let expected = Self::compute_checksum(self.address, self.command, &self.payload);
        if expected == self.checksum {
            Ok(())
        } else {
            Err(ProtocolError::ChecksumMismatch {
                expected,
                actual: self.checksum,
            })
        }
    }

    pub fn encoded_len(&self) -> usize {
        FRAME_OVERHEAD + self.payload.len()
    }

    /// Render the telegram. The transmitted checksum is the stored one, so a
    /// frame with a wrong checksum encodes as-is.
    pub fn encode(&self) -> Result<TelegramBuffer, ProtocolError> {
        if self.payload.len() > MAX_PAYLOAD_SIZE {
            return Err(ProtocolError::FrameTooLarge(self.payload.len()));
        }

        let mut out = TelegramBuffer::new();
        // Capacity was checked above; none of these pushes can fail.
        let _ = out.push(START);
        push_hex(&mut out, self.address);
        let _ = out.push(FIELD_SEP);
        push_hex(&mut out, self.command);
        let _ = out.push(FIELD_SEP);
        push_hex(&mut out, self.payload.len() as u8);
        let _ = out.push(SECTION_SEP);
        let _ = out.extend_from_slice(&self.payload);
        let _ = out.push(SECTION_SEP);
        push_hex(&mut out, self.checksum);
        let _ = out.push(END);

        debug_assert_eq!(out.len(), self.encoded_len());
        Ok(out)
    }

    /// Parse a complete telegram and verify its checksum.
    pub fn decode(buf: &[u8]) -> Result<Self, ProtocolError> {
        let frame = Self::parse_unverified(buf)?;
        frame.verify()?;
        Ok(frame)
    }

    /// Parse the framing only; the checksum field is taken as transmitted.
    pub fn parse_unverified(buf: &[u8]) -> Result<Self, ProtocolError> {
        let declared = match expected_length(buf)? {
            Some(total) => total - FRAME_OVERHEAD,
            None => return Err(ProtocolError::MalformedFrame("truncated header")),
        };
        if buf.len() != declared + FRAME_OVERHEAD {
            return Err(ProtocolError::LengthMismatch {
                declared,
                actual: buf.len().saturating_sub(FRAME_OVERHEAD),
            });
        }

        let address = parse_hex(&buf[ADDRESS_AT..ADDRESS_AT + 2])?;
        let command = parse_hex(&buf[COMMAND_AT..COMMAND_AT + 2])?;
        if buf[PAYLOAD_AT - 1] != SECTION_SEP {
            return Err(ProtocolError::MalformedFrame("missing payload separator"));
        }

        let trailer = PAYLOAD_AT + declared;
        if buf[trailer] != SECTION_SEP {
            return Err(ProtocolError::MalformedFrame("missing checksum separator"));
        }
        let checksum = parse_hex(&buf[trailer + 1..trailer + 3])?;
        if buf[trailer + 3] != END {
            return Err(ProtocolError::MalformedFrame("missing end marker"));
        }

        Ok(Self {
            address,
            command,
            payload: buf[PAYLOAD_AT..trailer].to_vec(),
            checksum,
        })
    }

    /// Iterate over the payload tokens.
    pub fn tokens(&self) -> impl Iterator<Item = Result<Token<'_>, ProtocolError>> {
        tokenize(&self.payload)
    }
}

/// Total telegram length once enough of the header is buffered.
///
/// `Ok(None)` means keep reading. An error means the buffer does not start
/// with a telegram at all.
pub fn expected_length(buf: &[u8]) -> Result<Option<usize>, ProtocolError> {
    match buf.first() {
        None => return Ok(None),
        Some(&START) => {}
        Some(_) => return Err(ProtocolError::MalformedFrame("missing start marker")),
    }
    if buf.len() < PAYLOAD_AT {
        return Ok(None);
    }
    if buf[ADDRESS_AT + 2] != FIELD_SEP || buf[COMMAND_AT + 2] != FIELD_SEP {
        return Err(ProtocolError::MalformedFrame("missing header separator"));
    }
    let length = usize::from(parse_hex(&buf[LENGTH_AT..LENGTH_AT + 2])?);
    if length > MAX_PAYLOAD_SIZE {
        return Err(ProtocolError::FrameTooLarge(length));
    }
    Ok(Some(FRAME_OVERHEAD + length))
}

/// One `CODE=V1[,V2...]` entry of a reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Token<'a> {
    pub code: &'a str,
    pub values: ArrayVec<&'a str, MAX_TOKEN_VALUES>,
}

impl<'a> Token<'a> {
    pub fn arity(&self) -> usize {
        self.values.len()
    }

    /// Value `index` read as hex.
    pub fn hex_value(&self, index: usize) -> Result<u32, ProtocolError> {
        let raw = self
            .values
            .get(index)
            .ok_or_else(|| self.malformed())?;
        u32::from_str_radix(raw, 16).map_err(|_| self.malformed())
    }

    pub fn malformed(&self) -> ProtocolError {
        ProtocolError::MalformedToken(format!("{}={}", self.code, self.values.join(",")))
    }
}

/// Split one token. A missing `=`, an empty code, an empty value or more
/// than [`MAX_TOKEN_VALUES`] values are malformed.
pub fn parse_token(text: &str) -> Result<Token<'_>, ProtocolError> {
    let malformed = || ProtocolError::MalformedToken(text.to_owned());

    let (code, rest) = text.split_once('=').ok_or_else(malformed)?;
    let code = code.trim();
    if code.is_empty() {
        return Err(malformed());
    }

    let mut values = ArrayVec::new();
    for value in rest.split(VALUE_DELIMITER) {
        let value = value.trim();
        if value.is_empty() {
            return Err(malformed());
        }
        values.try_push(value).map_err(|_| malformed())?;
    }
    Ok(Token { code, values })
}

/// Tokens of a reply payload. Empty segments are skipped.
pub fn tokenize(payload: &[u8]) -> impl Iterator<Item = Result<Token<'_>, ProtocolError>> {
    payload
        .split(|b| *b == TOKEN_DELIMITER)
        .filter(|segment| !segment.is_empty())
        .map(|segment| {
            core::str::from_utf8(segment)
                .map_err(|_| ProtocolError::MalformedToken(String::from_utf8_lossy(segment).into_owned()))
                .and_then(parse_token)
        })
}

/// Render `CODE=V1,V2` with upper-case hex values.
pub fn format_token(code: &str, values: &[u32]) -> String {
    let rendered: std::vec::Vec<String> = values.iter().map(|v| format!("{v:X}")).collect();
    format!("{code}={}", rendered.join(","))
}

fn push_hex(out: &mut TelegramBuffer, byte: u8) {
    const DIGITS: &[u8; 16] = b"0123456789ABCDEF";
    let _ = out.push(DIGITS[usize::from(byte >> 4)]);
    let _ = out.push(DIGITS[usize::from(byte & 0x0F)]);
}

fn parse_hex(digits: &[u8]) -> Result<u8, ProtocolError> {
    core::str::from_utf8(digits)
        .ok()
        .and_then(|s| u8::from_str_radix(s, 16).ok())
        .ok_or(ProtocolError::MalformedFrame("bad hex field"))
}
