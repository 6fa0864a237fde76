//! Frame layout: `length(4B BE over the rest) ‖ version(1B) ‖ code(1B) ‖
//! msgpack payload`. Decoding enforces a hard size cap before touching the
//! payload so oversized frames are dropped at the boundary.

use crate::error::{NetworkError, Result};
use crate::messages::*;

pub const WIRE_VERSION: u8 = 1;

/// Maximum allowed size of a single frame payload (4 MB).
pub const MAX_MESSAGE_SIZE: usize = 4 * 1024 * 1024;

pub fn encode_frame(msg: &WireMessage) -> Result<Vec<u8>> {
    let payload = match msg {
        WireMessage::CastVerify(m) => rmp_serde::to_vec(m)?,
        WireMessage::VerifiedCast(m) => rmp_serde::to_vec(m)?,
        WireMessage::CastRewardSignReq(m) => rmp_serde::to_vec(m)?,
        WireMessage::CastRewardSignGot(m) => rmp_serde::to_vec(m)?,
        WireMessage::ReqProposalBlock(m) => rmp_serde::to_vec(m)?,
        WireMessage::ResponseProposalBlock(m) => rmp_serde::to_vec(m)?,
        WireMessage::ForkFindAncestorReq(m) => rmp_serde::to_vec(m)?,
        WireMessage::ForkFindAncestorResponse(m) => rmp_serde::to_vec(m)?,
        WireMessage::ForkChainSliceReq(m) => rmp_serde::to_vec(m)?,
        WireMessage::ForkChainSliceResponse(m) => rmp_serde::to_vec(m)?,
    };
    if payload.len() > MAX_MESSAGE_SIZE {
        return Err(NetworkError::FrameTooLarge(payload.len()));
    }
    let mut frame = Vec::with_capacity(6 + payload.len());
    frame.extend_from_slice(&((payload.len() + 2) as u32).to_be_bytes());
    frame.push(WIRE_VERSION);
    frame.push(msg.code());
    frame.extend_from_slice(&payload);
    Ok(frame)
}

pub fn decode_frame(frame: &[u8]) -> Result<WireMessage> {
    if frame.len() < 6 {
        return Err(NetworkError::FrameTooShort);
    }
    let declared = u32::from_be_bytes(frame[..4].try_into().unwrap()) as usize;
    if declared != frame.len() - 4 {
        return Err(NetworkError::FrameTooShort);
    }
    if declared - 2 > MAX_MESSAGE_SIZE {
        return Err(NetworkError::FrameTooLarge(declared));
    }
    let version = frame[4];
    if version != WIRE_VERSION {
        return Err(NetworkError::UnsupportedVersion(version));
    }
    let code = frame[5];
    let payload = &frame[6..];
    let msg = match code {
        1 => WireMessage::CastVerify(rmp_serde::from_slice(payload)?),
        2 => WireMessage::VerifiedCast(rmp_serde::from_slice(payload)?),
        3 => WireMessage::CastRewardSignReq(rmp_serde::from_slice(payload)?),
        4 => WireMessage::CastRewardSignGot(rmp_serde::from_slice(payload)?),
        5 => WireMessage::ReqProposalBlock(rmp_serde::from_slice(payload)?),
        6 => WireMessage::ResponseProposalBlock(rmp_serde::from_slice(payload)?),
        7 => WireMessage::ForkFindAncestorReq(rmp_serde::from_slice(payload)?),
        8 => WireMessage::ForkFindAncestorResponse(rmp_serde::from_slice(payload)?),
        9 => WireMessage::ForkChainSliceReq(rmp_serde::from_slice(payload)?),
        10 => WireMessage::ForkChainSliceResponse(rmp_serde::from_slice(payload)?),
        other => return Err(NetworkError::UnknownCode(other)),
    };
    Ok(msg)
}
