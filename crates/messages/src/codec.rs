//! Wire encoding for consensus messages.
//!
//! # Wire Format
//!
//! ```text
//! [version: u8][msg_id: u8][len: u32 le][payload: SBOR-encoded message]
//! ```
//!
//! - Version is currently `1`
//! - `msg_id` selects the message kind (Prepare / Sign / Commit / ViewChange)
//! - `len` is the payload length; frames above [`MAX_WIRE_LEN`] are rejected
//!   on both encode and decode

use crate::{CommitReq, PrepareReq, SignReq, ViewChangeReq};
use thiserror::Error;

/// Current wire format version.
pub const WIRE_VERSION: u8 = 1;

/// Maximum accepted payload length. Prepares carry whole blocks, so the cap
/// is generous; anything larger is rejected rather than fragmented.
pub const MAX_WIRE_LEN: usize = 4 * 1024 * 1024;

/// Frame header length: version + msg id + payload length.
const HEADER_LEN: usize = 6;

/// One-byte message kind tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MsgId {
    /// Leader proposal with block payload.
    Prepare = 0x00,
    /// First-phase vote.
    Sign = 0x01,
    /// Second-phase vote.
    Commit = 0x02,
    /// View-change request.
    ViewChange = 0x03,
}

impl MsgId {
    /// Parse from the wire byte.
    pub fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            0x00 => Some(MsgId::Prepare),
            0x01 => Some(MsgId::Sign),
            0x02 => Some(MsgId::Commit),
            0x03 => Some(MsgId::ViewChange),
            _ => None,
        }
    }
}

/// Errors that can occur during message encoding/decoding.
#[derive(Debug, Error)]
pub enum CodecError {
    #[error("Unknown wire version: {0}")]
    UnknownVersion(u8),

    #[error("Unknown message id: {0:#04x}")]
    UnknownMsgId(u8),

    #[error("Message too short")]
    MessageTooShort,

    #[error("Frame length mismatch: header says {declared}, got {actual}")]
    LengthMismatch { declared: usize, actual: usize },

    #[error("Oversize frame: {0} bytes")]
    Oversize(usize),

    #[error("SBOR decode error: {0}")]
    SborDecode(String),

    #[error("SBOR encode error: {0}")]
    SborEncode(String),
}

/// A decoded consensus message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProtocolMsg {
    Prepare(PrepareReq),
    Sign(SignReq),
    Commit(CommitReq),
    ViewChange(ViewChangeReq),
}

impl ProtocolMsg {
    /// The wire tag for this message.
    pub fn msg_id(&self) -> MsgId {
        match self {
            ProtocolMsg::Prepare(_) => MsgId::Prepare,
            ProtocolMsg::Sign(_) => MsgId::Sign,
            ProtocolMsg::Commit(_) => MsgId::Commit,
            ProtocolMsg::ViewChange(_) => MsgId::ViewChange,
        }
    }
}

/// Encode a message to wire format.
pub fn encode(msg: &ProtocolMsg) -> Result<Vec<u8>, CodecError> {
    let payload = match msg {
        ProtocolMsg::Prepare(req) => sbor::basic_encode(req),
        ProtocolMsg::Sign(req) => sbor::basic_encode(req),
        ProtocolMsg::Commit(req) => sbor::basic_encode(req),
        ProtocolMsg::ViewChange(req) => sbor::basic_encode(req),
    }
    .map_err(|e| CodecError::SborEncode(format!("{e:?}")))?;

    if payload.len() > MAX_WIRE_LEN {
        return Err(CodecError::Oversize(payload.len()));
    }

    let mut bytes = Vec::with_capacity(HEADER_LEN + payload.len());
    bytes.push(WIRE_VERSION);
    bytes.push(msg.msg_id() as u8);
    bytes.extend_from_slice(&(payload.len() as u32).to_le_bytes());
    bytes.extend(payload);
    Ok(bytes)
}

/// Peek the message id of an encoded frame without decoding the payload.
pub fn peek_msg_id(bytes: &[u8]) -> Result<MsgId, CodecError> {
    if bytes.len() < HEADER_LEN {
        return Err(CodecError::MessageTooShort);
    }
    if bytes[0] != WIRE_VERSION {
        return Err(CodecError::UnknownVersion(bytes[0]));
    }
    MsgId::from_byte(bytes[1]).ok_or(CodecError::UnknownMsgId(bytes[1]))
}

/// Decode a message from wire format.
pub fn decode(bytes: &[u8]) -> Result<ProtocolMsg, CodecError> {
    let id = peek_msg_id(bytes)?;

    let declared = u32::from_le_bytes([bytes[2], bytes[3], bytes[4], bytes[5]]) as usize;
    if declared > MAX_WIRE_LEN {
        return Err(CodecError::Oversize(declared));
    }
    let payload = &bytes[HEADER_LEN..];
    if payload.len() != declared {
        return Err(CodecError::LengthMismatch {
            declared,
            actual: payload.len(),
        });
    }

    let decode_err = |e| CodecError::SborDecode(format!("{e:?}"));
    match id {
        MsgId::Prepare => Ok(ProtocolMsg::Prepare(
            sbor::basic_decode(payload).map_err(decode_err)?,
        )),
        MsgId::Sign => Ok(ProtocolMsg::Sign(
            sbor::basic_decode(payload).map_err(decode_err)?,
        )),
        MsgId::Commit => Ok(ProtocolMsg::Commit(
            sbor::basic_decode(payload).map_err(decode_err)?,
        )),
        MsgId::ViewChange => Ok(ProtocolMsg::ViewChange(
            sbor::basic_decode(payload).map_err(decode_err)?,
        )),
    }
}
