use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};
use tracing::trace;

use crate::error::ProtocolError;
use crate::frame::{Control, Frame, FrameKind, TerminalSignal};
use crate::{DEFAULT_MAX_FRAME_BYTES, HEADER_LEN};

// ---------------------------------------------------------------------------
// Encoding
// ---------------------------------------------------------------------------

/// Append the wire form of `frame` to `dst`.
pub fn encode_into(frame: &Frame, dst: &mut BytesMut) -> Result<(), ProtocolError> {
    let kind = frame.kind();
    let len = frame.payload_len();
    let wire_len = u32::try_from(len).map_err(|_| ProtocolError::FrameTooLarge {
        kind,
        len,
        max: u32::MAX as usize,
    })?;

    dst.reserve(HEADER_LEN + len);
    dst.put_u8(kind.tag());
    dst.put_u32(wire_len);
    match frame {
        Frame::Output(data) | Frame::Input(data) => dst.extend_from_slice(data),
        Frame::Resize { rows, cols } => {
            dst.put_u16(*rows);
            dst.put_u16(*cols);
        }
        Frame::Control(Control::Close { reason }) => dst.extend_from_slice(reason.as_bytes()),
        Frame::Control(Control::Exit { code, signal }) => {
            dst.put_u32(*code);
            if let Some(signal) = signal {
                dst.extend_from_slice(signal.as_bytes());
            }
        }
        Frame::Control(Control::Ping(data) | Control::Pong(data)) => dst.extend_from_slice(data),
        Frame::Control(Control::Signal(signal)) => dst.put_u8(signal.to_wire()),
    }
    Ok(())
}

/// Encode a single frame into its own buffer.
pub fn encode(frame: &Frame) -> Result<Bytes, ProtocolError> {
    let mut buf = BytesMut::with_capacity(HEADER_LEN + frame.payload_len());
    encode_into(frame, &mut buf)?;
    Ok(buf.freeze())
}

// ---------------------------------------------------------------------------
// Decoding
// ---------------------------------------------------------------------------

/// Incremental frame decoder.
///
/// Feed it a growing buffer; each call either consumes exactly one complete
/// frame from the front, or returns `Ok(None)` and leaves the buffer alone
/// until more bytes arrive. Header checks (tag, declared length) run as soon
/// as the header bytes are present, so oversized frames are refused before
/// their payload is buffered.
#[derive(Debug, Clone, Copy)]
pub struct FrameDecoder {
    max_frame_bytes: usize,
}

impl Default for FrameDecoder {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_FRAME_BYTES)
    }
}

impl FrameDecoder {
    pub fn new(max_frame_bytes: usize) -> Self {
        Self { max_frame_bytes }
    }

    pub fn max_frame_bytes(&self) -> usize {
        self.max_frame_bytes
    }

    pub fn decode(&mut self, buf: &mut BytesMut) -> Result<Option<Frame>, ProtocolError> {
        let Some(&tag) = buf.first() else {
            return Ok(None);
        };
        let kind = FrameKind::from_tag(tag).ok_or(ProtocolError::UnknownTag { tag })?;

        if buf.len() < HEADER_LEN {
            return Ok(None);
        }
        let len = u32::from_be_bytes([buf[1], buf[2], buf[3], buf[4]]) as usize;
        if len > self.max_frame_bytes {
            return Err(ProtocolError::FrameTooLarge {
                kind,
                len,
                max: self.max_frame_bytes,
            });
        }

        let total = HEADER_LEN + len;
        if buf.len() < total {
            buf.reserve(total - buf.len());
            trace!(%kind, have = buf.len(), need = total, "partial frame buffered");
            return Ok(None);
        }

        buf.advance(HEADER_LEN);
        let payload = buf.split_to(len).freeze();
        parse_payload(kind, payload).map(Some)
    }
}

fn parse_payload(kind: FrameKind, mut payload: Bytes) -> Result<Frame, ProtocolError> {
    let frame = match kind {
        FrameKind::Output => Frame::Output(payload),
        FrameKind::Input => Frame::Input(payload),
        FrameKind::Resize => {
            if payload.len() != 4 {
                return Err(ProtocolError::invalid(
                    kind,
                    format!("expected 4 bytes, got {}", payload.len()),
                ));
            }
            let rows = payload.get_u16();
            let cols = payload.get_u16();
            if rows == 0 || cols == 0 {
                return Err(ProtocolError::invalid(
                    kind,
                    format!("zero dimension {rows}x{cols}"),
                ));
            }
            Frame::Resize { rows, cols }
        }
        FrameKind::Close => Frame::Control(Control::Close {
            reason: utf8(kind, payload)?,
        }),
        FrameKind::Exit => {
            if payload.len() < 4 {
                return Err(ProtocolError::invalid(
                    kind,
                    format!("expected at least 4 bytes, got {}", payload.len()),
                ));
            }
            let code = payload.get_u32();
            let signal = if payload.is_empty() {
                None
            } else {
                Some(utf8(kind, payload)?)
            };
            Frame::Control(Control::Exit { code, signal })
        }
        FrameKind::Ping => Frame::Control(Control::Ping(payload)),
        FrameKind::Pong => Frame::Control(Control::Pong(payload)),
        FrameKind::Signal => {
            let &[id] = &payload[..] else {
                return Err(ProtocolError::invalid(
                    kind,
                    format!("expected 1 byte, got {}", payload.len()),
                ));
            };
            let signal = TerminalSignal::from_wire(id)
                .ok_or_else(|| ProtocolError::invalid(kind, format!("unknown signal id {id}")))?;
            Frame::Control(Control::Signal(signal))
        }
    };
    Ok(frame)
}

fn utf8(kind: FrameKind, payload: Bytes) -> Result<String, ProtocolError> {
    String::from_utf8(payload.to_vec())
        .map_err(|e| ProtocolError::invalid(kind, format!("not UTF-8: {e}")))
}

// ---------------------------------------------------------------------------
// tokio-util codec
// ---------------------------------------------------------------------------

/// [`Frame`] codec for byte-stream transports (`Framed<TcpStream, FrameCodec>`).
///
/// Outgoing frames are held to the same size limit as incoming ones.
#[derive(Debug, Clone, Copy, Default)]
pub struct FrameCodec {
    decoder: FrameDecoder,
}

impl FrameCodec {
    pub fn new(max_frame_bytes: usize) -> Self {
        Self {
            decoder: FrameDecoder::new(max_frame_bytes),
        }
    }
}

impl Decoder for FrameCodec {
    type Item = Frame;
    type Error = ProtocolError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Frame>, ProtocolError> {
        self.decoder.decode(src)
    }
}

impl Encoder<Frame> for FrameCodec {
    type Error = ProtocolError;

    fn encode(&mut self, frame: Frame, dst: &mut BytesMut) -> Result<(), ProtocolError> {
        let len = frame.payload_len();
        let max = self.decoder.max_frame_bytes();
        if len > max {
            return Err(ProtocolError::FrameTooLarge {
                kind: frame.kind(),
                len,
                max,
            });
        }
        encode_into(&frame, dst)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_frames() -> Vec<Frame> {
        vec![
            Frame::output(&b"hello\r\n"[..]),
            Frame::output(Bytes::new()),
            Frame::input(&b"ls -la\n"[..]),
            Frame::resize(40, 120),
            Frame::close("client closed"),
            Frame::close(""),
            Frame::exit(0, None),
            Frame::exit(129, Some("Hangup".into())),
            Frame::ping(&b"1234"[..]),
            Frame::pong(Bytes::new()),
            Frame::signal(TerminalSignal::Interrupt),
            Frame::signal(TerminalSignal::Kill),
        ]
    }

    fn decode_all(bytes: &[u8]) -> Result<Vec<Frame>, ProtocolError> {
        let mut buf = BytesMut::from(bytes);
        let mut decoder = FrameDecoder::default();
        let mut frames = Vec::new();
        while let Some(frame) = decoder.decode(&mut buf)? {
            frames.push(frame);
        }
        assert!(buf.is_empty(), "{} trailing bytes", buf.len());
        Ok(frames)
    }

    #[test]
    fn resize_wire_layout() {
        let bytes = encode(&Frame::resize(40, 120)).unwrap();
        assert_eq!(&bytes[..], &[0x03, 0, 0, 0, 4, 0, 40, 0, 120]);
    }

    #[test]
    fn exit_wire_layout() {
        let bytes = encode(&Frame::exit(2, Some("Killed".into()))).unwrap();
        assert_eq!(bytes[0], 0x11);
        assert_eq!(&bytes[1..5], &10u32.to_be_bytes());
        assert_eq!(&bytes[5..9], &2u32.to_be_bytes());
        assert_eq!(&bytes[9..], b"Killed");
    }

    #[test]
    fn frame_round_trip() {
        for frame in sample_frames() {
            let bytes = encode(&frame).unwrap();
            let decoded = decode_all(&bytes).unwrap();
            assert_eq!(decoded, vec![frame.clone()], "frame {frame:?}");
            assert_eq!(encode(&decoded[0]).unwrap(), bytes);
        }
    }

    #[test]
    fn concatenated_frames_decode_in_order() {
        let frames = sample_frames();
        let mut buf = BytesMut::new();
        for frame in &frames {
            encode_into(frame, &mut buf).unwrap();
        }
        assert_eq!(decode_all(&buf).unwrap(), frames);
    }

    #[test]
    fn partial_arrival_completes_later() {
        let bytes = encode(&Frame::input(&b"partial"[..])).unwrap();
        let mut decoder = FrameDecoder::default();

        for split in 0..bytes.len() {
            let mut buf = BytesMut::from(&bytes[..split]);
            assert!(decoder.decode(&mut buf).unwrap().is_none(), "split {split}");
            assert_eq!(buf.len(), split, "partial bytes must stay buffered");
            buf.extend_from_slice(&bytes[split..]);
            assert_eq!(
                decoder.decode(&mut buf).unwrap(),
                Some(Frame::input(&b"partial"[..]))
            );
            assert!(buf.is_empty());
        }
    }

    #[test]
    fn unknown_tag_rejected_immediately() {
        let mut buf = BytesMut::from(&[0x7f][..]);
        let err = FrameDecoder::default().decode(&mut buf).unwrap_err();
        assert!(matches!(err, ProtocolError::UnknownTag { tag: 0x7f }));
        assert_eq!(err.tag(), Some(0x7f));
    }

    #[test]
    fn oversized_frame_rejected_before_payload() {
        let mut buf = BytesMut::new();
        buf.put_u8(0x02);
        buf.put_u32(2048);
        let err = FrameDecoder::new(1024).decode(&mut buf).unwrap_err();
        match err {
            ProtocolError::FrameTooLarge { kind, len, max } => {
                assert_eq!(kind, FrameKind::Input);
                assert_eq!((len, max), (2048, 1024));
            }
            other => panic!("expected FrameTooLarge, got {other:?}"),
        }
    }

    #[test]
    fn zero_resize_rejected() {
        let bytes = [0x03, 0, 0, 0, 4, 0, 0, 0, 80];
        let err = decode_all(&bytes).unwrap_err();
        assert!(matches!(
            err,
            ProtocolError::InvalidPayload {
                kind: FrameKind::Resize,
                ..
            }
        ));
    }

    #[test]
    fn short_resize_rejected() {
        let bytes = [0x03, 0, 0, 0, 2, 0, 24];
        assert!(decode_all(&bytes).is_err());
    }

    #[test]
    fn invalid_utf8_close_rejected() {
        let bytes = [0x10, 0, 0, 0, 2, 0xc3, 0x28];
        let err = decode_all(&bytes).unwrap_err();
        assert_eq!(err.tag(), Some(0x10));
    }

    #[test]
    fn short_exit_rejected() {
        let bytes = [0x11, 0, 0, 0, 3, 0, 0, 0];
        assert!(decode_all(&bytes).is_err());
    }

    #[test]
    fn unknown_signal_rejected() {
        let bytes = [0x14, 0, 0, 0, 1, 9];
        let err = decode_all(&bytes).unwrap_err();
        assert!(err.to_string().contains("unknown signal id 9"), "{err}");
    }

    #[test]
    fn codec_refuses_to_encode_oversized_frame() {
        let mut codec = FrameCodec::new(1024);
        let mut dst = BytesMut::new();
        let err = codec
            .encode(Frame::output(vec![0u8; 2048]), &mut dst)
            .unwrap_err();
        assert!(matches!(err, ProtocolError::FrameTooLarge { .. }));
        assert!(dst.is_empty());
    }
}
