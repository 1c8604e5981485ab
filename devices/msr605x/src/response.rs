//! Interpreting reassembled messages against the command that produced them.

use magstripe_core::TrackNumber;

use crate::abi::{Command, Expect, DATA_BLOCK};
use crate::consts::{ACK, END_SENTINEL, ESC, FS, NAK};
use crate::types::{Coercivity, ProtocolError, ReadFormat, TrackPayloads};

/// Decoded command response
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Response {
    Ack,
    Text(String),
    Tracks(TrackPayloads),
    Coercivity(Coercivity),
    Nothing,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Status {
    Ok,
    Rejected(u8),
}

/// Split one status reply off the front of a message
fn status(bytes: &[u8]) -> Option<(Status, &[u8])> {
    match bytes {
        [ACK, rest @ ..] => Some((Status::Ok, rest)),
        [NAK, rest @ ..] => Some((Status::Rejected(NAK), rest)),
        [ESC, b'0' | b'y', rest @ ..] => Some((Status::Ok, rest)),
        [ESC, code @ (b'1' | b'2' | b'4' | b'9' | b'A'), rest @ ..] => {
            Some((Status::Rejected(*code), rest))
        },
        _ => None,
    }
}

/// Decode `message` as the reply to `command`
pub fn decode_response(command: &Command, message: &[u8]) -> Result<Response, ProtocolError> {
    match command.expect() {
        Expect::Status { echo } => match status(message) {
            Some((Status::Ok, rest)) if rest.len() == echo => Ok(Response::Ack),
            Some((Status::Ok, _)) => Err(ProtocolError::MalformedResponse(
                "unexpected bytes after status",
            )),
            Some((Status::Rejected(status), _)) => Err(ProtocolError::DeviceRejected { status }),
            None => Err(ProtocolError::MalformedResponse("expected a status reply")),
        },
        Expect::Text => {
            if let Some((Status::Rejected(status), [])) = status(message) {
                return Err(ProtocolError::DeviceRejected { status });
            }
            decode_text(message).map(Response::Text)
        },
        Expect::Coercivity => match message {
            [ESC, b'h'] => Ok(Response::Coercivity(Coercivity::Hi)),
            [ESC, b'l'] => Ok(Response::Coercivity(Coercivity::Lo)),
            _ => match status(message) {
                Some((Status::Rejected(status), [])) => {
                    Err(ProtocolError::DeviceRejected { status })
                },
                _ => Err(ProtocolError::MalformedResponse("expected ESC h or ESC l")),
            },
        },
        Expect::Tracks(format) => decode_tracks(format, message).map(Response::Tracks),
        Expect::Nothing => Ok(Response::Nothing),
    }
}

fn decode_text(message: &[u8]) -> Result<String, ProtocolError> {
    let start = message
        .iter()
        .position(|&b| b != ESC && b != 0)
        .unwrap_or(message.len());
    let end = message
        .iter()
        .rposition(|&b| b != 0 && !b.is_ascii_whitespace())
        .map_or(start, |i| i + 1)
        .max(start);
    let text = &message[start..end];
    if text.is_empty() {
        return Err(ProtocolError::MalformedResponse("empty text reply"));
    }
    if !text.iter().all(|b| b.is_ascii_graphic() || *b == b' ') {
        return Err(ProtocolError::MalformedResponse("text reply is not printable"));
    }
    Ok(text.iter().map(|&b| char::from(b)).collect())
}

fn decode_tracks(format: ReadFormat, message: &[u8]) -> Result<TrackPayloads, ProtocolError> {
    if let Some((Status::Rejected(status), [])) = status(message) {
        return Err(ProtocolError::DeviceRejected { status });
    }

    let body = message.strip_prefix(&[ESC, DATA_BLOCK]).unwrap_or(message);
    let (payloads, rest) = match format {
        ReadFormat::Iso => iso_block(body)?,
        ReadFormat::Raw => raw_block(body)?,
    };

    match status(rest) {
        _ if rest.is_empty() => {},
        Some((Status::Ok, [])) => {},
        // the block is still usable, unreadable tracks come back empty
        Some((Status::Rejected(status), [])) => {
            tracing::debug!("read finished with status {status:#04x}");
        },
        _ => {
            return Err(ProtocolError::MalformedResponse(
                "unexpected bytes after track block",
            ))
        },
    }

    Ok(payloads)
}

/// `ESC 1 <text> ESC 2 <text> ESC 3 <text> ? FS`, returning what follows `FS`
fn iso_block(body: &[u8]) -> Result<(TrackPayloads, &[u8]), ProtocolError> {
    let end = body
        .iter()
        .position(|&b| b == FS)
        .ok_or(ProtocolError::Incomplete)?;
    let (block, rest) = (&body[..end], &body[end + 1..]);
    let block = block.strip_suffix(&[END_SENTINEL]).unwrap_or(block);

    let mut payloads = TrackPayloads::new();
    let mut segments = block.split(|&b| b == ESC);
    if segments.next().is_some_and(|lead| !lead.is_empty()) {
        return Err(ProtocolError::MalformedResponse(
            "data before the first track marker",
        ));
    }
    for segment in segments {
        let (&marker, data) = segment
            .split_first()
            .ok_or(ProtocolError::MalformedResponse("empty track marker"))?;
        let track = TrackNumber::from_u8(marker)
            .ok_or(ProtocolError::MalformedResponse("unknown track marker"))?;
        payloads.set(track, data.to_vec())?;
    }

    Ok((payloads, rest))
}

/// `ESC 1 <len> <bytes> ... ? FS`, returning what follows `FS`
fn raw_block(body: &[u8]) -> Result<(TrackPayloads, &[u8]), ProtocolError> {
    let mut payloads = TrackPayloads::new();
    let mut rest = body;
    loop {
        match rest {
            [ESC, marker, tail @ ..] => {
                let track = TrackNumber::from_u8(*marker)
                    .ok_or(ProtocolError::MalformedResponse("unknown track marker"))?;
                let (&len, tail) = tail.split_first().ok_or(ProtocolError::Incomplete)?;
                let len = len as usize;
                if tail.len() < len {
                    return Err(ProtocolError::Incomplete);
                }
                let (data, tail) = tail.split_at(len);
                payloads.set(track, data.to_vec())?;
                rest = tail;
            },
            [END_SENTINEL, FS, tail @ ..] | [FS, tail @ ..] => return Ok((payloads, tail)),
            [] | [ESC] | [END_SENTINEL] => return Err(ProtocolError::Incomplete),
            _ => {
                return Err(ProtocolError::MalformedResponse(
                    "unexpected byte in raw track block",
                ))
            },
        }
    }
}
