//! `tokio_util` codecs for bridge records.
//!
//! [`BridgeCodec`] is the bridge's side: it decodes requests and encodes
//! responses. [`BridgeClientCodec`] is the peer's side. A bad magic or
//! version cannot be resynchronised and is returned as a decode error,
//! which ends the connection.

use bytes::BytesMut;
use tokio_util::codec::{Decoder, Encoder};

use crate::bridge::wire::{self, HEADER_SIZE, Request, Response};
use crate::error::SocError;

/// Length of the complete record at the front of `src`, once its header
/// is present and valid.
fn frame_len(src: &BytesMut, payload_words: fn(&[u8]) -> usize) -> Result<Option<usize>, SocError> {
    if src.len() < HEADER_SIZE {
        return Ok(None);
    }
    wire::check_header(&src[..HEADER_SIZE])?;
    let total = HEADER_SIZE + 4 * payload_words(&src[..HEADER_SIZE]);
    Ok(Some(total))
}

/// Server-side codec: `Request` in, `Response` out.
#[derive(Debug, Default, Clone, Copy)]
pub struct BridgeCodec;

impl Decoder for BridgeCodec {
    type Item = Request;
    type Error = SocError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        let Some(total) = frame_len(src, Request::payload_words)? else {
            return Ok(None);
        };
        if src.len() < total {
            src.reserve(total - src.len());
            return Ok(None);
        }
        let frame = src.split_to(total);
        Ok(Some(Request::parse(&frame)))
    }
}

impl Encoder<Response> for BridgeCodec {
    type Error = SocError;

    fn encode(&mut self, item: Response, dst: &mut BytesMut) -> Result<(), Self::Error> {
        item.encode(dst)
    }
}

/// Peer-side codec: `Request` out, `Response` in.
#[derive(Debug, Default, Clone, Copy)]
pub struct BridgeClientCodec;

impl Decoder for BridgeClientCodec {
    type Item = Response;
    type Error = SocError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        let Some(total) = frame_len(src, Response::payload_words)? else {
            return Ok(None);
        };
        if src.len() < total {
            src.reserve(total - src.len());
            return Ok(None);
        }
        let frame = src.split_to(total);
        Response::parse(&frame).map(Some)
    }
}

impl Encoder<Request> for BridgeClientCodec {
    type Error = SocError;

    fn encode(&mut self, item: Request, dst: &mut BytesMut) -> Result<(), Self::Error> {
        item.encode(dst)
    }
}

// ── Tests ────────────────────────────────────────────────────────
