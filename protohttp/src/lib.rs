//! Protobuf messages over HTTP.
//!
//! Each message is framed as a 4-byte little-endian length followed by the
//! encoded message. A response carrying the `linkerd-error` header holds a
//! single [`ApiError`] frame; any other non-200 response is a transport
//! error.
//!
//! Readers consume exactly one frame and never attempt to resynchronize on
//! malformed input.

#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

use bytes::{Buf, BufMut, Bytes, BytesMut};
use http_body_util::{BodyExt, Full};
use prost::Message;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

pub const ERROR_HEADER: &str = "linkerd-error";

pub const DEFAULT_MAX_FRAME_LEN: usize = 4 * 1024 * 1024;

const PREFIX_LEN: usize = 4;

pub type Body = Full<Bytes>;

/// An application error returned by a peer.
#[derive(Clone, PartialEq, Message)]
pub struct ApiError {
    #[prost(string, tag = "1")]
    pub error: String,
}

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("invalid frame: {0}")]
    Framing(#[from] FrameError),

    #[error("{0}")]
    Api(String),

    #[error("unexpected response status: {0}")]
    Status(http::StatusCode),

    #[error("failed to decode message: {0}")]
    Decode(#[from] prost::DecodeError),

    #[error("failed to read response body: {0}")]
    Body(#[source] Box<dyn std::error::Error + Send + Sync>),
}

#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("truncated: expected {expected} bytes but {available} remain")]
    Truncated { expected: usize, available: usize },

    #[error("{len} bytes exceeds the maximum frame length of {max} bytes")]
    TooLarge { len: usize, max: usize },

    #[error(transparent)]
    Encode(#[from] prost::EncodeError),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Encodes a message as a single length-prefixed frame.
pub fn encode_frame<M: Message>(msg: &M) -> Result<Bytes, Error> {
    let len = msg.encoded_len();
    let prefix = u32::try_from(len).map_err(|_| FrameError::TooLarge {
        len,
        max: u32::MAX as usize,
    })?;
    let mut buf = BytesMut::with_capacity(PREFIX_LEN + len);
    buf.put_u32_le(prefix);
    msg.encode(&mut buf).map_err(FrameError::from)?;
    Ok(buf.freeze())
}

/// Decodes a single frame from the front of `buf`.
///
/// Bytes following the frame are left in `buf`.
pub fn decode_frame<M, B>(buf: &mut B, max_len: usize) -> Result<M, Error>
where
    M: Message + Default,
    B: Buf,
{
    if buf.remaining() < PREFIX_LEN {
        return Err(FrameError::Truncated {
            expected: PREFIX_LEN,
            available: buf.remaining(),
        }
        .into());
    }
    let len = buf.get_u32_le() as usize;
    check_len(len, max_len)?;
    if buf.remaining() < len {
        return Err(FrameError::Truncated {
            expected: len,
            available: buf.remaining(),
        }
        .into());
    }
    let payload = buf.copy_to_bytes(len);
    Ok(M::decode(payload)?)
}

/// Reads exactly one frame from `io`.
pub async fn read_frame<M, R>(io: &mut R, max_len: usize) -> Result<M, Error>
where
    M: Message + Default,
    R: AsyncRead + Unpin,
{
    let mut prefix = [0u8; PREFIX_LEN];
    io.read_exact(&mut prefix)
        .await
        .map_err(|e| io_error(e, PREFIX_LEN))?;
    let len = u32::from_le_bytes(prefix) as usize;
    check_len(len, max_len)?;

    let mut payload = vec![0u8; len];
    io.read_exact(&mut payload)
        .await
        .map_err(|e| io_error(e, len))?;
    Ok(M::decode(payload.as_slice())?)
}

pub async fn write_frame<M, W>(io: &mut W, msg: &M) -> Result<(), Error>
where
    M: Message,
    W: AsyncWrite + Unpin,
{
    let frame = encode_frame(msg)?;
    io.write_all(&frame).await.map_err(FrameError::from)?;
    io.flush().await.map_err(FrameError::from)?;
    Ok(())
}

/// Builds a successful response holding `msg`.
pub fn ok_response<M: Message>(msg: &M) -> Result<http::Response<Body>, Error> {
    let frame = encode_frame(msg)?;
    Ok(http::Response::new(Full::new(frame)))
}

/// Builds an error response that carries `error` as an [`ApiError`].
///
/// `status` is used for the response status and names the error in the
/// `linkerd-error` header.
pub fn error_response(
    status: http::StatusCode,
    error: impl std::fmt::Display,
) -> Result<http::Response<Body>, Error> {
    let frame = encode_frame(&ApiError {
        error: error.to_string(),
    })?;
    let reason = status.canonical_reason().unwrap_or("Unknown");
    let mut rsp = http::Response::new(Full::new(frame));
    *rsp.status_mut() = status;
    rsp.headers_mut()
        .insert(ERROR_HEADER, http::HeaderValue::from_static(reason));
    Ok(rsp)
}

/// Reads a response, returning its message or the error it describes.
pub async fn read_response<M, B>(rsp: http::Response<B>, max_len: usize) -> Result<M, Error>
where
    M: Message + Default,
    B: http_body::Body,
    B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
{
    let (parts, body) = rsp.into_parts();
    let has_error = parts.headers.contains_key(ERROR_HEADER);
    if !has_error && parts.status != http::StatusCode::OK {
        return Err(Error::Status(parts.status));
    }

    let mut bytes = read_body_frame(body, max_len).await?;
    if has_error {
        let ApiError { error } = decode_frame(&mut bytes, max_len)?;
        tracing::debug!(status = %parts.status, %error, "peer returned an error");
        return Err(Error::Api(error));
    }
    decode_frame(&mut bytes, max_len)
}

/// Buffers the first frame of a body.
///
/// The length prefix is checked as soon as it arrives, and reading stops once
/// the frame is complete, so at most one body chunk beyond `max_len` is ever
/// buffered.
async fn read_body_frame<B>(body: B, max_len: usize) -> Result<Bytes, Error>
where
    B: http_body::Body,
    B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
{
    let mut body = std::pin::pin!(body);
    let mut buf = BytesMut::new();
    let mut expected = PREFIX_LEN;
    while buf.len() < expected {
        let Some(frame) = body.frame().await else {
            return Err(FrameError::Truncated {
                expected,
                available: buf.len(),
            }
            .into());
        };
        if let Ok(data) = frame.map_err(|e| Error::Body(e.into()))?.into_data() {
            buf.put(data);
        }

        if expected == PREFIX_LEN && buf.len() >= PREFIX_LEN {
            let len = u32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]) as usize;
            check_len(len, max_len)?;
            expected += len;
        }
    }
    Ok(buf.freeze())
}

fn check_len(len: usize, max: usize) -> Result<(), FrameError> {
    if len > max {
        return Err(FrameError::TooLarge { len, max });
    }
    Ok(())
}

fn io_error(error: std::io::Error, expected: usize) -> FrameError {
    if error.kind() == std::io::ErrorKind::UnexpectedEof {
        // `read_exact` does not report how much was read.
        return FrameError::Truncated {
            expected,
            available: 0,
        };
    }
    FrameError::Io(error)
}

#[cfg(test)]
mod tests;
