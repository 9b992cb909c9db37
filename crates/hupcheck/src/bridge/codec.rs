//! Framed codec for bridge communication.
//!
//! Uses LengthDelimitedCodec for framing + serde_json for serialization.
//! The async side (driver) wraps it in FramedRead/FramedWrite; the host runs
//! on plain threads and uses [`FrameReader`]/[`FrameWriter`] over blocking
//! `Read`/`Write` with the same codec, so both ends agree byte for byte.

use std::io::{self, Read, Write};
use std::marker::PhantomData;

use serde::{Serialize, de::DeserializeOwned};
use tokio_util::bytes::{Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder, LengthDelimitedCodec};

/// Frames larger than this are rejected on decode.
pub const MAX_FRAME_LENGTH: usize = 16 * 1024 * 1024;

/// Codec that frames messages with length prefix and serializes with JSON.
pub struct JsonCodec<T> {
    inner: LengthDelimitedCodec,
    _phantom: PhantomData<T>,
}

impl<T> Default for JsonCodec<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> JsonCodec<T> {
    pub fn new() -> Self {
        Self {
            inner: LengthDelimitedCodec::builder()
                .length_field_length(4)
                .max_frame_length(MAX_FRAME_LENGTH)
                .new_codec(),
            _phantom: PhantomData,
        }
    }
}

impl<T: DeserializeOwned> Decoder for JsonCodec<T> {
    type Item = T;
    type Error = io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        match self.inner.decode(src)? {
            Some(bytes) => {
                let item = serde_json::from_slice(&bytes)
                    .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
                Ok(Some(item))
            }
            None => Ok(None),
        }
    }
}

impl<T: Serialize> Encoder<T> for JsonCodec<T> {
    type Error = io::Error;

    fn encode(&mut self, item: T, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let json =
            serde_json::to_vec(&item).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        tracing::trace!(json_size_bytes = json.len(), "Encoding frame");
        self.inner.encode(Bytes::from(json), dst)
    }
}

/// Blocking frame reader over any `Read`.
pub struct FrameReader<R, T> {
    inner: R,
    codec: JsonCodec<T>,
    buf: BytesMut,
    eof: bool,
}

impl<R: Read, T: DeserializeOwned> FrameReader<R, T> {
    pub fn new(inner: R) -> Self {
        Self {
            inner,
            codec: JsonCodec::new(),
            buf: BytesMut::with_capacity(8 * 1024),
            eof: false,
        }
    }

    /// Read the next frame.
    ///
    /// `Ok(None)` means a clean end-of-stream on a frame boundary. A stream
    /// that ends mid-frame is an `UnexpectedEof` error.
    pub fn read_frame(&mut self) -> io::Result<Option<T>> {
        loop {
            if let Some(item) = self.codec.decode(&mut self.buf)? {
                return Ok(Some(item));
            }
            if self.eof {
                if self.buf.is_empty() {
                    return Ok(None);
                }
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    format!("stream closed with {} bytes of partial frame", self.buf.len()),
                ));
            }

            let mut chunk = [0u8; 8 * 1024];
            match self.inner.read(&mut chunk) {
                Ok(0) => self.eof = true,
                Ok(n) => self.buf.extend_from_slice(&chunk[..n]),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
    }
}

/// Blocking frame writer over any `Write`.
///
/// Each frame is encoded completely before a single `write_all`, then
/// flushed. Callers sharing a writer serialize through a mutex.
pub struct FrameWriter<W, T> {
    inner: W,
    codec: JsonCodec<T>,
    buf: BytesMut,
}

impl<W: Write, T: Serialize> FrameWriter<W, T> {
    pub fn new(inner: W) -> Self {
        Self {
            inner,
            codec: JsonCodec::new(),
            buf: BytesMut::new(),
        }
    }

    pub fn write_frame(&mut self, item: T) -> io::Result<()> {
        self.buf.clear();
        self.codec.encode(item, &mut self.buf)?;
        self.inner.write_all(&self.buf)?;
        self.inner.flush()
    }

    pub fn into_inner(self) -> W {
        self.inner
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::protocol::{Call, CallId, CallResult, Fault, Outcome};
    use serde_json::{Map, json};

    #[test]
    fn codec_roundtrip_call() {
        let mut codec = JsonCodec::<Call>::new();
        let mut buf = BytesMut::new();

        let call = Call::new("bind", vec![json!("127.0.0.1"), json!(0)], Map::new());
        codec.encode(call.clone(), &mut buf).unwrap();
        let decoded = codec.decode(&mut buf).unwrap().unwrap();

        assert_eq!(decoded, call);
        assert!(buf.is_empty());
    }

    #[test]
    fn codec_waits_for_complete_frame() {
        let mut codec = JsonCodec::<CallResult>::new();
        let mut full = BytesMut::new();
        codec
            .encode(CallResult::value(CallId::new(), json!("pong")), &mut full)
            .unwrap();

        let mut partial = BytesMut::from(&full[..full.len() - 3]);
        assert!(codec.decode(&mut partial).unwrap().is_none());

        partial.extend_from_slice(&full[full.len() - 3..]);
        assert!(codec.decode(&mut partial).unwrap().is_some());
    }

    #[test]
    fn codec_rejects_garbage_payload() {
        let mut codec = JsonCodec::<Call>::new();
        let mut buf = BytesMut::new();
        buf.extend_from_slice(&4u32.to_be_bytes());
        buf.extend_from_slice(b"nope");

        let err = codec.decode(&mut buf).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }

    #[test]
    fn blocking_writer_and_reader_agree() {
        let mut writer = FrameWriter::<Vec<u8>, CallResult>::new(Vec::new());
        let id = CallId::new();
        writer.write_frame(CallResult::startup()).unwrap();
        writer
            .write_frame(CallResult::fault(id, Fault::internal("boom")))
            .unwrap();
        let bytes = writer.into_inner();

        let mut reader = FrameReader::<_, CallResult>::new(&bytes[..]);
        assert!(reader.read_frame().unwrap().unwrap().is_startup());

        let second = reader.read_frame().unwrap().unwrap();
        assert_eq!(second.id, id);
        assert!(matches!(second.outcome, Outcome::Fault(ref f) if f.message == "boom"));

        assert!(reader.read_frame().unwrap().is_none());
    }

    #[test]
    fn blocking_reader_reports_truncated_frame() {
        let mut writer = FrameWriter::<Vec<u8>, CallResult>::new(Vec::new());
        writer.write_frame(CallResult::startup()).unwrap();
        let bytes = writer.into_inner();

        let mut reader = FrameReader::<_, CallResult>::new(&bytes[..bytes.len() - 1]);
        let err = reader.read_frame().unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);
    }
}
