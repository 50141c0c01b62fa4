//! Length-prefixed frame codec.
//!
//! Implements tokio's `Decoder` and `Encoder` traits for the wire framing:
//! a 4-byte big-endian length prefix followed by the message bytes. The
//! codec is deliberately header-agnostic; it reassembles raw frames so that
//! request types the proxy does not understand still pass through intact.
//! Header fields are peeked separately via [`RequestHeaderInfo`] and
//! [`response_correlation_id`].

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::error::ProxyError;

/// Maximum frame size (100 MB by default).
pub const DEFAULT_MAX_FRAME_SIZE: usize = 100 * 1024 * 1024;

/// One length-prefixed protocol message, without the prefix.
///
/// The payload is owned by whichever pipeline stage currently holds the
/// frame; it moves forward through the session and is never duplicated.
#[derive(Debug, Clone)]
pub struct Frame {
    /// The complete frame bytes (after the length prefix).
    pub payload: Bytes,
}

impl Frame {
    /// Wrap a payload in a frame.
    #[must_use]
    pub fn new(payload: Bytes) -> Self {
        Self { payload }
    }
}

/// Codec for length-prefixed frames.
///
/// Frames are encoded as:
/// - 4 bytes: message length (big-endian, excludes these 4 bytes)
/// - N bytes: message content
///
/// Decoding tolerates the length prefix split across reads, the payload
/// split across reads, and multiple complete frames arriving in one read.
/// A zero-length payload is legal and completes immediately.
#[derive(Debug, Clone)]
pub struct FrameCodec {
    max_frame_size: usize,
}

impl FrameCodec {
    /// Create a new codec with default max frame size.
    #[must_use]
    pub fn new() -> Self {
        Self {
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
        }
    }

    /// Create a new codec with custom max frame size.
    #[must_use]
    pub fn with_max_frame_size(max_frame_size: usize) -> Self {
        Self { max_frame_size }
    }
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl Decoder for FrameCodec {
    type Item = Frame;
    type Error = ProxyError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        // Need at least 4 bytes for the length prefix
        if src.len() < 4 {
            return Ok(None);
        }

        // Read length without consuming
        let length = u32::from_be_bytes([src[0], src[1], src[2], src[3]]) as usize;

        if length > self.max_frame_size {
            return Err(ProxyError::FrameTooLarge {
                length,
                max: self.max_frame_size,
            });
        }

        // Need length prefix + message body
        if src.len() < 4 + length {
            // Reserve space for the full frame
            src.reserve(4 + length - src.len());
            return Ok(None);
        }

        // Consume length prefix, then take the payload
        src.advance(4);
        let payload = src.split_to(length).freeze();

        Ok(Some(Frame::new(payload)))
    }
}

impl Encoder<Frame> for FrameCodec {
    type Error = ProxyError;

    fn encode(&mut self, item: Frame, dst: &mut BytesMut) -> Result<(), Self::Error> {
        dst.reserve(4 + item.payload.len());
        dst.put_u32(item.payload.len() as u32);
        dst.extend_from_slice(&item.payload);
        Ok(())
    }
}

/// Request header fields the correlator needs: api key, api version and
/// correlation id, in the first 8 bytes of every request frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RequestHeaderInfo {
    /// The numeric API key of the request.
    pub api_key: i16,
    /// The API version.
    pub api_version: i16,
    /// The correlation ID for request/response matching.
    pub correlation_id: i32,
}

impl RequestHeaderInfo {
    /// Peek the request header from a frame payload.
    ///
    /// # Errors
    ///
    /// Returns [`ProxyError::MalformedFrame`] if the payload is too short
    /// to carry a request header.
    pub fn parse(payload: &Bytes) -> Result<Self, ProxyError> {
        if payload.len() < 8 {
            return Err(ProxyError::MalformedFrame {
                message: format!(
                    "request frame of {} bytes is too small for a request header",
                    payload.len()
                ),
            });
        }
        Ok(Self {
            api_key: i16::from_be_bytes([payload[0], payload[1]]),
            api_version: i16::from_be_bytes([payload[2], payload[3]]),
            correlation_id: i32::from_be_bytes([payload[4], payload[5], payload[6], payload[7]]),
        })
    }
}

/// Peek the correlation id from a response frame payload.
///
/// Both response header versions start with the 4-byte correlation id, so
/// this does not need to know the api key.
///
/// # Errors
///
/// Returns [`ProxyError::MalformedFrame`] if the payload is shorter than
/// 4 bytes.
pub fn response_correlation_id(payload: &Bytes) -> Result<i32, ProxyError> {
    if payload.len() < 4 {
        return Err(ProxyError::MalformedFrame {
            message: format!(
                "response frame of {} bytes is too small for a correlation id",
                payload.len()
            ),
        });
    }
    Ok(i32::from_be_bytes([
        payload[0], payload[1], payload[2], payload[3],
    ]))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn encode_frame(body: &[u8]) -> BytesMut {
        let mut buf = BytesMut::new();
        buf.put_u32(body.len() as u32);
        buf.extend_from_slice(body);
        buf
    }

    fn request_frame(api_key: i16, api_version: i16, correlation_id: i32, body: &[u8]) -> BytesMut {
        let mut payload = BytesMut::new();
        payload.put_i16(api_key);
        payload.put_i16(api_version);
        payload.put_i32(correlation_id);
        payload.extend_from_slice(body);
        encode_frame(&payload)
    }

    #[test]
    fn test_decode_valid_frame() {
        let mut codec = FrameCodec::new();
        let mut buf = request_frame(3, 9, 12345, &[1, 2, 3, 4]);

        let frame = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(frame.payload.len(), 12);

        let header = RequestHeaderInfo::parse(&frame.payload).unwrap();
        assert_eq!(header.api_key, 3);
        assert_eq!(header.api_version, 9);
        assert_eq!(header.correlation_id, 12345);
    }

    #[test]
    fn test_decode_incomplete_length() {
        let mut codec = FrameCodec::new();
        let mut buf = BytesMut::from(&[0u8, 0, 0][..]); // Only 3 bytes

        assert!(codec.decode(&mut buf).unwrap().is_none());
    }

    #[test]
    fn test_decode_incomplete_body() {
        let mut codec = FrameCodec::new();
        let mut buf = BytesMut::new();
        buf.put_u32(100); // Expect 100 bytes
        buf.put_u32(0); // Only 4 bytes of body

        assert!(codec.decode(&mut buf).unwrap().is_none());
    }

    #[test]
    fn test_decode_zero_length_frame() {
        let mut codec = FrameCodec::new();
        let mut buf = BytesMut::new();
        buf.put_u32(0);

        let frame = codec.decode(&mut buf).unwrap().unwrap();
        assert!(frame.payload.is_empty());
        assert!(buf.is_empty());
    }

    #[test]
    fn test_decode_frame_too_large() {
        let mut codec = FrameCodec::with_max_frame_size(100);
        let mut buf = BytesMut::new();
        buf.put_u32(200); // Larger than max

        let result = codec.decode(&mut buf);
        assert!(matches!(result, Err(ProxyError::FrameTooLarge { .. })));
    }

    #[test]
    fn test_multiple_frames_in_one_read() {
        let mut codec = FrameCodec::new();
        let mut buf = BytesMut::new();
        buf.extend_from_slice(&request_frame(18, 3, 1, &[]));
        buf.extend_from_slice(&request_frame(3, 9, 2, &[]));

        let frame1 = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(RequestHeaderInfo::parse(&frame1.payload).unwrap().correlation_id, 1);

        let frame2 = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(RequestHeaderInfo::parse(&frame2.payload).unwrap().correlation_id, 2);

        assert!(codec.decode(&mut buf).unwrap().is_none());
    }

    #[test]
    fn test_byte_by_byte_reassembly() {
        // Framing idempotence: an arbitrary chunking of the stream must
        // reproduce exactly the original frame sequence, in order.
        let frames: Vec<BytesMut> = vec![
            request_frame(18, 3, 1, b"alpha"),
            request_frame(3, 9, 2, b""),
            encode_frame(b""), // zero-length payload between real frames
            request_frame(10, 4, 3, b"gamma-gamma-gamma"),
        ];
        let mut stream = BytesMut::new();
        for f in &frames {
            stream.extend_from_slice(f);
        }

        for chunk_size in [1usize, 2, 3, 5, 7, stream.len()] {
            let mut codec = FrameCodec::new();
            let mut accumulated = BytesMut::new();
            let mut decoded = Vec::new();

            for chunk in stream.chunks(chunk_size) {
                accumulated.extend_from_slice(chunk);
                while let Some(frame) = codec.decode(&mut accumulated).unwrap() {
                    decoded.push(frame);
                }
            }

            assert_eq!(decoded.len(), frames.len(), "chunk size {chunk_size}");
            for (frame, original) in decoded.iter().zip(&frames) {
                assert_eq!(&frame.payload[..], &original[4..], "chunk size {chunk_size}");
            }
        }
    }

    #[test]
    fn test_encode_decode_roundtrip() {
        let mut codec = FrameCodec::new();
        let mut dst = BytesMut::new();
        codec
            .encode(Frame::new(Bytes::from_static(&[1, 2, 3, 4])), &mut dst)
            .unwrap();

        assert_eq!(u32::from_be_bytes([dst[0], dst[1], dst[2], dst[3]]), 4);
        let frame = codec.decode(&mut dst).unwrap().unwrap();
        assert_eq!(&frame.payload[..], &[1, 2, 3, 4]);
    }

    #[test]
    fn test_request_header_too_short() {
        let payload = Bytes::from_static(&[0, 3, 0]);
        assert!(matches!(
            RequestHeaderInfo::parse(&payload),
            Err(ProxyError::MalformedFrame { .. })
        ));
    }

    #[test]
    fn test_response_correlation_id() {
        let payload = Bytes::from_static(&[0, 0, 0, 7, 9, 9]);
        assert_eq!(response_correlation_id(&payload).unwrap(), 7);

        let short = Bytes::from_static(&[0, 0]);
        assert!(matches!(
            response_correlation_id(&short),
            Err(ProxyError::MalformedFrame { .. })
        ));
    }
}
