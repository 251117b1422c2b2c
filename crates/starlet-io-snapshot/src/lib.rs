//! Deterministic snapshot encoding for emulated components.
//!
//! The save-state format uses a small tag-length-value (TLV) encoding to provide:
//! - deterministic byte output (fields are emitted in writer order)
//! - forward compatibility (unknown tags are skipped on load)
//! - explicit versioning (major/minor) per component
//!
//! Components implement [`IoSnapshot`]; the machine-level save-state is a fixed-order
//! concatenation of component snapshots. A failed load must leave the running state
//! untouched, so decoding never mutates anything until the whole payload has parsed.

use std::fmt;

/// Component snapshot version. Only additions within the same major version are
/// forward compatible; a major bump rejects older snapshots.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SnapshotVersion {
    pub major: u16,
    pub minor: u16,
}

impl SnapshotVersion {
    pub const fn new(major: u16, minor: u16) -> Self {
        Self { major, minor }
    }
}

impl fmt::Display for SnapshotVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.major, self.minor)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum SnapshotError {
    #[error("snapshot truncated")]
    Truncated,
    #[error("snapshot component id mismatch")]
    ComponentIdMismatch,
    #[error("unsupported snapshot major version {0}")]
    UnsupportedVersion(u16),
    #[error("duplicate snapshot field tag {0}")]
    DuplicateTag(u16),
    #[error("invalid field encoding: {0}")]
    InvalidFieldEncoding(&'static str),
    #[error("trailing bytes after payload")]
    TrailingBytes,
    #[error("snapshot allocation limit exceeded")]
    OutOfMemory,
}

pub type SnapshotResult<T> = Result<T, SnapshotError>;

/// Snapshotting contract for emulated components.
///
/// Implementations must keep `DEVICE_ID` stable forever and only perform
/// forward-compatible additions within the same major version by adding new
/// TLV fields.
pub trait IoSnapshot {
    const DEVICE_ID: [u8; 4];
    const DEVICE_VERSION: SnapshotVersion;

    fn save_state(&self) -> Vec<u8>;
    fn load_state(&mut self, bytes: &[u8]) -> SnapshotResult<()>;
}

// ----------------------------------------
// Raw little-endian encoder/decoder
// ----------------------------------------

/// Byte-level builder for nested field payloads.
///
/// Consuming-builder style so sequences read as a single expression at call
/// sites; the outer TLV framing is handled by [`SnapshotWriter`].
#[derive(Debug, Default)]
pub struct Encoder {
    buf: Vec<u8>,
}

impl Encoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn u8(mut self, v: u8) -> Self {
        self.buf.push(v);
        self
    }

    pub fn u16(mut self, v: u16) -> Self {
        self.buf.extend_from_slice(&v.to_le_bytes());
        self
    }

    pub fn u32(mut self, v: u32) -> Self {
        self.buf.extend_from_slice(&v.to_le_bytes());
        self
    }

    pub fn u64(mut self, v: u64) -> Self {
        self.buf.extend_from_slice(&v.to_le_bytes());
        self
    }

    pub fn bool(self, v: bool) -> Self {
        self.u8(u8::from(v))
    }

    pub fn bytes(mut self, v: &[u8]) -> Self {
        self.buf.extend_from_slice(v);
        self
    }

    /// Length-prefixed string (u32 byte count + UTF-8 bytes).
    pub fn str(self, v: &str) -> Self {
        self.u32(v.len() as u32).bytes(v.as_bytes())
    }

    /// Length-prefixed list of length-prefixed byte strings.
    pub fn vec_bytes(mut self, v: &[Vec<u8>]) -> Self {
        self = self.u32(v.len() as u32);
        for item in v {
            self = self.u32(item.len() as u32).bytes(item);
        }
        self
    }

    pub fn finish(self) -> Vec<u8> {
        self.buf
    }
}

// Strings decoded from untrusted snapshots are bounded so corrupted input
// cannot force pathological allocations.
const MAX_STRING_BYTES: usize = 64 * 1024;

/// Byte-level reader for nested field payloads.
#[derive(Debug)]
pub struct Decoder<'a> {
    buf: &'a [u8],
}

impl<'a> Decoder<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf }
    }

    pub fn remaining(&self) -> usize {
        self.buf.len()
    }

    fn take(&mut self, len: usize) -> SnapshotResult<&'a [u8]> {
        if self.buf.len() < len {
            return Err(SnapshotError::Truncated);
        }
        let (head, tail) = self.buf.split_at(len);
        self.buf = tail;
        Ok(head)
    }

    pub fn u8(&mut self) -> SnapshotResult<u8> {
        Ok(self.take(1)?[0])
    }

    pub fn u16(&mut self) -> SnapshotResult<u16> {
        let b = self.take(2)?;
        Ok(u16::from_le_bytes([b[0], b[1]]))
    }

    pub fn u32(&mut self) -> SnapshotResult<u32> {
        let b = self.take(4)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    pub fn u64(&mut self) -> SnapshotResult<u64> {
        let b = self.take(8)?;
        let mut raw = [0u8; 8];
        raw.copy_from_slice(b);
        Ok(u64::from_le_bytes(raw))
    }

    pub fn bool(&mut self) -> SnapshotResult<bool> {
        match self.u8()? {
            0 => Ok(false),
            1 => Ok(true),
            _ => Err(SnapshotError::InvalidFieldEncoding("bool")),
        }
    }

    pub fn bytes(&mut self, len: usize) -> SnapshotResult<&'a [u8]> {
        self.take(len)
    }

    pub fn bytes_vec(&mut self, len: usize) -> SnapshotResult<Vec<u8>> {
        let mut out = Vec::new();
        out.try_reserve_exact(len)
            .map_err(|_| SnapshotError::OutOfMemory)?;
        out.extend_from_slice(self.take(len)?);
        Ok(out)
    }

    /// Counterpart of [`Encoder::str`].
    pub fn str(&mut self) -> SnapshotResult<String> {
        let len = self.u32()? as usize;
        if len > MAX_STRING_BYTES {
            return Err(SnapshotError::InvalidFieldEncoding("string too long"));
        }
        let bytes = self.take(len)?;
        std::str::from_utf8(bytes)
            .map(str::to_string)
            .map_err(|_| SnapshotError::InvalidFieldEncoding("string utf8"))
    }

    /// Fails unless the payload was fully consumed. Call at the end of every
    /// nested decode so oversized fields are rejected rather than ignored.
    pub fn finish(self) -> SnapshotResult<()> {
        if self.buf.is_empty() {
            Ok(())
        } else {
            Err(SnapshotError::TrailingBytes)
        }
    }
}

// ----------------------------------------
// TLV writer/reader
// ----------------------------------------

/// Layout: component id (4 bytes), major (u16), minor (u16), then repeated
/// fields of tag (u16), length (u32), payload.
#[derive(Debug)]
pub struct SnapshotWriter {
    buf: Vec<u8>,
}

impl SnapshotWriter {
    pub fn new(device_id: [u8; 4], version: SnapshotVersion) -> Self {
        let mut buf = Vec::new();
        buf.extend_from_slice(&device_id);
        buf.extend_from_slice(&version.major.to_le_bytes());
        buf.extend_from_slice(&version.minor.to_le_bytes());
        Self { buf }
    }

    fn field(&mut self, tag: u16, payload: &[u8]) {
        self.buf.extend_from_slice(&tag.to_le_bytes());
        self.buf.extend_from_slice(&(payload.len() as u32).to_le_bytes());
        self.buf.extend_from_slice(payload);
    }

    pub fn field_u8(&mut self, tag: u16, v: u8) {
        self.field(tag, &[v]);
    }

    pub fn field_u16(&mut self, tag: u16, v: u16) {
        self.field(tag, &v.to_le_bytes());
    }

    pub fn field_u32(&mut self, tag: u16, v: u32) {
        self.field(tag, &v.to_le_bytes());
    }

    pub fn field_u64(&mut self, tag: u16, v: u64) {
        self.field(tag, &v.to_le_bytes());
    }

    pub fn field_bool(&mut self, tag: u16, v: bool) {
        self.field(tag, &[u8::from(v)]);
    }

    pub fn field_bytes(&mut self, tag: u16, v: Vec<u8>) {
        self.field(tag, &v);
    }

    pub fn field_str(&mut self, tag: u16, v: &str) {
        self.field(tag, v.as_bytes());
    }

    pub fn finish(self) -> Vec<u8> {
        self.buf
    }
}

/// Parsed view over a component snapshot. Field payloads are borrowed from the
/// input; nothing is copied until a caller asks for it.
#[derive(Debug)]
pub struct SnapshotReader<'a> {
    version: SnapshotVersion,
    fields: Vec<(u16, &'a [u8])>,
}

impl<'a> SnapshotReader<'a> {
    pub fn parse(bytes: &'a [u8], device_id: [u8; 4]) -> SnapshotResult<Self> {
        let mut d = Decoder::new(bytes);
        let id = d.bytes(4)?;
        if id != device_id {
            return Err(SnapshotError::ComponentIdMismatch);
        }
        let major = d.u16()?;
        let minor = d.u16()?;

        let mut fields: Vec<(u16, &'a [u8])> = Vec::new();
        while d.remaining() > 0 {
            let tag = d.u16()?;
            let len = d.u32()? as usize;
            let payload = d.bytes(len)?;
            if fields.iter().any(|(t, _)| *t == tag) {
                return Err(SnapshotError::DuplicateTag(tag));
            }
            fields.push((tag, payload));
        }

        Ok(Self {
            version: SnapshotVersion::new(major, minor),
            fields,
        })
    }

    pub fn version(&self) -> SnapshotVersion {
        self.version
    }

    pub fn ensure_device_major(&self, major: u16) -> SnapshotResult<()> {
        if self.version.major == major {
            Ok(())
        } else {
            Err(SnapshotError::UnsupportedVersion(self.version.major))
        }
    }

    /// Raw payload for `tag`, or `None` if the snapshot does not carry it.
    pub fn bytes(&self, tag: u16) -> Option<&'a [u8]> {
        self.fields
            .iter()
            .find(|(t, _)| *t == tag)
            .map(|(_, payload)| *payload)
    }

    fn fixed(&self, tag: u16, len: usize, what: &'static str) -> SnapshotResult<Option<&'a [u8]>> {
        match self.bytes(tag) {
            None => Ok(None),
            Some(payload) if payload.len() == len => Ok(Some(payload)),
            Some(_) => Err(SnapshotError::InvalidFieldEncoding(what)),
        }
    }

    pub fn u8(&self, tag: u16) -> SnapshotResult<Option<u8>> {
        Ok(self.fixed(tag, 1, "u8 field")?.map(|b| b[0]))
    }

    pub fn u16(&self, tag: u16) -> SnapshotResult<Option<u16>> {
        Ok(self
            .fixed(tag, 2, "u16 field")?
            .map(|b| u16::from_le_bytes([b[0], b[1]])))
    }

    pub fn u32(&self, tag: u16) -> SnapshotResult<Option<u32>> {
        Ok(self
            .fixed(tag, 4, "u32 field")?
            .map(|b| u32::from_le_bytes([b[0], b[1], b[2], b[3]])))
    }

    pub fn u64(&self, tag: u16) -> SnapshotResult<Option<u64>> {
        Ok(self.fixed(tag, 8, "u64 field")?.map(|b| {
            let mut raw = [0u8; 8];
            raw.copy_from_slice(b);
            u64::from_le_bytes(raw)
        }))
    }

    pub fn bool(&self, tag: u16) -> SnapshotResult<Option<bool>> {
        match self.fixed(tag, 1, "bool field")?.map(|b| b[0]) {
            None => Ok(None),
            Some(0) => Ok(Some(false)),
            Some(1) => Ok(Some(true)),
            Some(_) => Err(SnapshotError::InvalidFieldEncoding("bool field")),
        }
    }

    /// Mandatory string field.
    pub fn str(&self, tag: u16) -> SnapshotResult<Option<String>> {
        match self.bytes(tag) {
            None => Ok(None),
            Some(payload) => {
                if payload.len() > MAX_STRING_BYTES {
                    return Err(SnapshotError::InvalidFieldEncoding("string too long"));
                }
                std::str::from_utf8(payload)
                    .map(|s| Some(s.to_string()))
                    .map_err(|_| SnapshotError::InvalidFieldEncoding("string utf8"))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TAG_A: u16 = 1;
    const TAG_B: u16 = 2;
    const TAG_C: u16 = 3;

    #[test]
    fn roundtrip_preserves_fields() {
        let mut w = SnapshotWriter::new(*b"TEST", SnapshotVersion::new(1, 2));
        w.field_u32(TAG_A, 0xDEAD_BEEF);
        w.field_bool(TAG_B, true);
        w.field_bytes(TAG_C, vec![1, 2, 3]);
        let bytes = w.finish();

        let r = SnapshotReader::parse(&bytes, *b"TEST").unwrap();
        r.ensure_device_major(1).unwrap();
        assert_eq!(r.version(), SnapshotVersion::new(1, 2));
        assert_eq!(r.u32(TAG_A).unwrap(), Some(0xDEAD_BEEF));
        assert_eq!(r.bool(TAG_B).unwrap(), Some(true));
        assert_eq!(r.bytes(TAG_C), Some(&[1u8, 2, 3][..]));
    }

    #[test]
    fn unknown_tags_are_skipped_and_missing_tags_read_as_none() {
        let mut w = SnapshotWriter::new(*b"TEST", SnapshotVersion::new(1, 0));
        w.field_u8(9999, 7);
        let bytes = w.finish();

        let r = SnapshotReader::parse(&bytes, *b"TEST").unwrap();
        assert_eq!(r.u8(TAG_A).unwrap(), None);
        assert_eq!(r.u8(9999).unwrap(), Some(7));
    }

    #[test]
    fn wrong_component_id_is_rejected() {
        let w = SnapshotWriter::new(*b"AAAA", SnapshotVersion::new(1, 0));
        let bytes = w.finish();
        assert_eq!(
            SnapshotReader::parse(&bytes, *b"BBBB").unwrap_err(),
            SnapshotError::ComponentIdMismatch
        );
    }

    #[test]
    fn major_version_mismatch_is_rejected() {
        let w = SnapshotWriter::new(*b"TEST", SnapshotVersion::new(2, 0));
        let bytes = w.finish();
        let r = SnapshotReader::parse(&bytes, *b"TEST").unwrap();
        assert_eq!(
            r.ensure_device_major(1).unwrap_err(),
            SnapshotError::UnsupportedVersion(2)
        );
    }

    #[test]
    fn truncated_input_is_rejected_without_panicking() {
        let mut w = SnapshotWriter::new(*b"TEST", SnapshotVersion::new(1, 0));
        w.field_bytes(TAG_A, vec![0; 16]);
        let bytes = w.finish();

        for len in 0..bytes.len() {
            assert!(SnapshotReader::parse(&bytes[..len], *b"TEST").is_err());
        }
    }

    #[test]
    fn duplicate_tags_are_rejected() {
        let mut w = SnapshotWriter::new(*b"TEST", SnapshotVersion::new(1, 0));
        w.field_u8(TAG_A, 1);
        w.field_u8(TAG_A, 2);
        let bytes = w.finish();
        assert_eq!(
            SnapshotReader::parse(&bytes, *b"TEST").unwrap_err(),
            SnapshotError::DuplicateTag(TAG_A)
        );
    }

    #[test]
    fn wrong_field_width_is_an_encoding_error() {
        let mut w = SnapshotWriter::new(*b"TEST", SnapshotVersion::new(1, 0));
        w.field_u16(TAG_A, 0x1234);
        let bytes = w.finish();
        let r = SnapshotReader::parse(&bytes, *b"TEST").unwrap();
        assert!(r.u32(TAG_A).is_err());
    }

    #[test]
    fn nested_encoder_decoder_roundtrip() {
        let payload = Encoder::new()
            .u32(2)
            .u16(0xAABB)
            .u16(0xCCDD)
            .str("keyboard")
            .finish();

        let mut d = Decoder::new(&payload);
        let count = d.u32().unwrap();
        assert_eq!(count, 2);
        assert_eq!(d.u16().unwrap(), 0xAABB);
        assert_eq!(d.u16().unwrap(), 0xCCDD);
        assert_eq!(d.str().unwrap(), "keyboard");
        d.finish().unwrap();
    }

    #[test]
    fn nested_decoder_rejects_trailing_bytes() {
        let payload = Encoder::new().u8(1).u8(2).finish();
        let mut d = Decoder::new(&payload);
        assert_eq!(d.u8().unwrap(), 1);
        assert_eq!(d.finish().unwrap_err(), SnapshotError::TrailingBytes);
    }

    #[test]
    fn vec_bytes_roundtrip() {
        let items = vec![vec![1u8, 2], vec![], vec![3u8]];
        let payload = Encoder::new().vec_bytes(&items).finish();

        let mut d = Decoder::new(&payload);
        let count = d.u32().unwrap() as usize;
        let mut out = Vec::new();
        for _ in 0..count {
            let len = d.u32().unwrap() as usize;
            out.push(d.bytes_vec(len).unwrap());
        }
        d.finish().unwrap();
        assert_eq!(out, items);
    }
}
