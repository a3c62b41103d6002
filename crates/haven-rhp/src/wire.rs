//! Framed wire encoding.
//!
//! Every message travels in a length-prefixed frame: a big-endian u32
//! length followed by that many payload bytes. Within a frame, integers
//! are little-endian, currency values are 16-byte big-endian, hashes are
//! 32 bytes, signatures 64 bytes, and RPC selectors are 16-byte
//! zero-padded identifiers.

use haven_types::{Currency, Hash256, PublicKey, Signature, SECTOR_SIZE};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Largest accepted frame: a sector payload plus headroom for the
/// surrounding message fields.
pub const MAX_FRAME_SIZE: usize = SECTOR_SIZE + 16384;

/// Error types for framing and message decoding.
#[derive(Debug, thiserror::Error)]
pub enum WireError {
    /// The underlying stream failed.
    #[error("stream error: {0}")]
    Io(#[from] std::io::Error),

    /// A frame exceeded [`MAX_FRAME_SIZE`].
    #[error("frame too large: {0} bytes")]
    FrameTooLarge(usize),

    /// A message ended before a field could be read.
    #[error("unexpected end of message")]
    UnexpectedEof,

    /// A message carried bytes past its last field.
    #[error("{0} trailing bytes after message")]
    TrailingBytes(usize),

    /// A length field exceeded its bound.
    #[error("length {got} exceeds bound {max}")]
    LengthOutOfBounds { got: usize, max: usize },

    /// A selector did not name a known RPC.
    #[error("unknown RPC selector {0:?}")]
    UnknownRpc(String),

    /// A field failed domain validation.
    #[error("invalid field: {0}")]
    InvalidField(&'static str),
}

/// A 16-byte zero-padded identifier, used for RPC selectors.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Specifier(pub [u8; 16]);

impl Specifier {
    /// Build a specifier from an identifier of at most 16 bytes.
    pub const fn new(name: &str) -> Specifier {
        let bytes = name.as_bytes();
        assert!(bytes.len() <= 16, "specifier too long");
        let mut out = [0u8; 16];
        let mut i = 0;
        while i < bytes.len() {
            out[i] = bytes[i];
            i += 1;
        }
        Specifier(out)
    }

    /// Parse from a slice; must be exactly 16 bytes.
    pub fn from_slice(bytes: &[u8]) -> Result<Specifier, WireError> {
        let arr: [u8; 16] = bytes
            .try_into()
            .map_err(|_| WireError::InvalidField("specifier"))?;
        Ok(Specifier(arr))
    }
}

impl std::fmt::Debug for Specifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let end = self.0.iter().position(|&b| b == 0).unwrap_or(16);
        write!(f, "Specifier({})", String::from_utf8_lossy(&self.0[..end]))
    }
}

impl std::fmt::Display for Specifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let end = self.0.iter().position(|&b| b == 0).unwrap_or(16);
        f.write_str(&String::from_utf8_lossy(&self.0[..end]))
    }
}

/// Read one frame from the stream.
pub async fn read_frame<S>(stream: &mut S) -> Result<Vec<u8>, WireError>
where
    S: AsyncRead + Unpin,
{
    let mut len_buf = [0u8; 4];
    stream.read_exact(&mut len_buf).await?;
    let len = u32::from_be_bytes(len_buf) as usize;
    if len > MAX_FRAME_SIZE {
        return Err(WireError::FrameTooLarge(len));
    }
    let mut payload = vec![0u8; len];
    stream.read_exact(&mut payload).await?;
    Ok(payload)
}

/// Write one frame to the stream and flush it.
pub async fn write_frame<S>(stream: &mut S, payload: &[u8]) -> Result<(), WireError>
where
    S: AsyncWrite + Unpin,
{
    if payload.len() > MAX_FRAME_SIZE {
        return Err(WireError::FrameTooLarge(payload.len()));
    }
    stream.write_all(&(payload.len() as u32).to_be_bytes()).await?;
    stream.write_all(payload).await?;
    stream.flush().await?;
    Ok(())
}

/// Serializer for message bodies.
#[derive(Default)]
pub struct Encoder {
    buf: Vec<u8>,
}

impl Encoder {
    pub fn new() -> Encoder {
        Encoder::default()
    }

    pub fn finish(self) -> Vec<u8> {
        self.buf
    }

    pub fn write_u8(&mut self, v: u8) {
        self.buf.push(v);
    }

    pub fn write_bool(&mut self, v: bool) {
        self.buf.push(v as u8);
    }

    pub fn write_u64(&mut self, v: u64) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    pub fn write_currency(&mut self, v: Currency) {
        self.buf.extend_from_slice(&v.to_be_bytes());
    }

    pub fn write_hash(&mut self, v: &Hash256) {
        self.buf.extend_from_slice(v.as_bytes());
    }

    pub fn write_pubkey(&mut self, v: &PublicKey) {
        self.buf.extend_from_slice(v.as_bytes());
    }

    pub fn write_signature(&mut self, v: &Signature) {
        self.buf.extend_from_slice(v.as_bytes());
    }

    pub fn write_specifier(&mut self, v: &Specifier) {
        self.buf.extend_from_slice(&v.0);
    }

    /// Length-prefixed byte string.
    pub fn write_bytes(&mut self, v: &[u8]) {
        self.write_u64(v.len() as u64);
        self.buf.extend_from_slice(v);
    }
}

/// Deserializer over a message body.
pub struct Decoder<'a> {
    data: &'a [u8],
}

impl<'a> Decoder<'a> {
    pub fn new(data: &'a [u8]) -> Decoder<'a> {
        Decoder { data }
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], WireError> {
        if self.data.len() < n {
            return Err(WireError::UnexpectedEof);
        }
        let (head, tail) = self.data.split_at(n);
        self.data = tail;
        Ok(head)
    }

    pub fn read_u8(&mut self) -> Result<u8, WireError> {
        Ok(self.take(1)?[0])
    }

    pub fn read_bool(&mut self) -> Result<bool, WireError> {
        Ok(self.read_u8()? != 0)
    }

    pub fn read_u64(&mut self) -> Result<u64, WireError> {
        let bytes: [u8; 8] = self.take(8)?.try_into().expect("exact take");
        Ok(u64::from_le_bytes(bytes))
    }

    pub fn read_currency(&mut self) -> Result<Currency, WireError> {
        let bytes: [u8; 16] = self.take(16)?.try_into().expect("exact take");
        Ok(Currency::from_be_bytes(bytes))
    }

    pub fn read_hash(&mut self) -> Result<Hash256, WireError> {
        let bytes: [u8; 32] = self.take(32)?.try_into().expect("exact take");
        Ok(Hash256(bytes))
    }

    pub fn read_pubkey(&mut self) -> Result<PublicKey, WireError> {
        let bytes: [u8; 32] = self.take(32)?.try_into().expect("exact take");
        Ok(PublicKey(bytes))
    }

    pub fn read_signature(&mut self) -> Result<Signature, WireError> {
        let bytes: [u8; 64] = self.take(64)?.try_into().expect("exact take");
        Ok(Signature(bytes))
    }

    pub fn read_specifier(&mut self) -> Result<Specifier, WireError> {
        let bytes: [u8; 16] = self.take(16)?.try_into().expect("exact take");
        Ok(Specifier(bytes))
    }

    /// Length-prefixed byte string, bounded by `max`.
    pub fn read_bytes(&mut self, max: usize) -> Result<Vec<u8>, WireError> {
        let len = self.read_u64()? as usize;
        if len > max {
            return Err(WireError::LengthOutOfBounds { got: len, max });
        }
        Ok(self.take(len)?.to_vec())
    }

    /// Fail if any input remains.
    pub fn finish(self) -> Result<(), WireError> {
        if self.data.is_empty() {
            Ok(())
        } else {
            Err(WireError::TrailingBytes(self.data.len()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scalar_roundtrip() {
        let mut enc = Encoder::new();
        enc.write_u8(7);
        enc.write_bool(true);
        enc.write_u64(0xDEAD_BEEF);
        enc.write_currency(Currency(1 << 100));
        enc.write_hash(&Hash256([3u8; 32]));
        enc.write_signature(&Signature([4u8; 64]));
        enc.write_bytes(b"hello");
        let buf = enc.finish();

        let mut dec = Decoder::new(&buf);
        assert_eq!(dec.read_u8().expect("u8"), 7);
        assert!(dec.read_bool().expect("bool"));
        assert_eq!(dec.read_u64().expect("u64"), 0xDEAD_BEEF);
        assert_eq!(dec.read_currency().expect("currency"), Currency(1 << 100));
        assert_eq!(dec.read_hash().expect("hash"), Hash256([3u8; 32]));
        assert_eq!(dec.read_signature().expect("sig"), Signature([4u8; 64]));
        assert_eq!(dec.read_bytes(16).expect("bytes"), b"hello");
        dec.finish().expect("no trailing bytes");
    }

    #[test]
    fn test_decoder_eof() {
        let mut dec = Decoder::new(&[1, 2, 3]);
        assert!(matches!(dec.read_u64(), Err(WireError::UnexpectedEof)));
    }

    #[test]
    fn test_decoder_rejects_trailing() {
        let dec = Decoder::new(&[0u8; 4]);
        assert!(matches!(dec.finish(), Err(WireError::TrailingBytes(4))));
    }

    #[test]
    fn test_bytes_bound() {
        let mut enc = Encoder::new();
        enc.write_bytes(&[0u8; 100]);
        let buf = enc.finish();
        let mut dec = Decoder::new(&buf);
        assert!(matches!(
            dec.read_bytes(50),
            Err(WireError::LengthOutOfBounds { got: 100, max: 50 })
        ));
    }

    #[test]
    fn test_specifier() {
        let spec = Specifier::new("ReadSector");
        assert_eq!(spec.to_string(), "ReadSector");
        assert_eq!(Specifier::from_slice(&spec.0).expect("parse"), spec);
        assert!(Specifier::from_slice(&[0u8; 15]).is_err());
    }

    #[tokio::test]
    async fn test_frame_roundtrip() {
        let (mut a, mut b) = tokio::io::duplex(1 << 16);
        write_frame(&mut a, b"request body").await.expect("write");
        let frame = read_frame(&mut b).await.expect("read");
        assert_eq!(frame, b"request body");
    }

    #[tokio::test]
    async fn test_frame_too_large_rejected() {
        let (mut a, mut b) = tokio::io::duplex(64);
        let oversized = (MAX_FRAME_SIZE as u32 + 1).to_be_bytes();
        tokio::io::AsyncWriteExt::write_all(&mut a, &oversized)
            .await
            .expect("write header");
        let err = read_frame(&mut b).await.expect_err("must reject");
        assert!(matches!(err, WireError::FrameTooLarge(_)));
    }
}
