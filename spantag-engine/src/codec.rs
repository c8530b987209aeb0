//! Binary model codec: little-endian primitives and compressed block framing.
//!
//! A model artifact is a sequence of compressed blocks. Each block is framed
//! as:
//!
//! ```text
//! [4B] uncompressed length (u32 LE)
//! [4B] compressed length (u32 LE)
//! [4B] CRC32 of the uncompressed payload (u32 LE)
//! [compressed length B] DEFLATE-compressed payload
//! ```
//!
//! Decoders verify the CRC and reject on mismatch.

use std::io::{Read, Write};

use flate2::Compression;
use flate2::read::DeflateDecoder;
use flate2::write::DeflateEncoder;

/// Errors that can occur while reading or writing model data.
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("truncated model data")]
    Truncated,

    #[error("invalid model format: {0}")]
    Format(String),

    #[error("block checksum mismatch: expected {expected:08x}, computed {computed:08x}")]
    Crc { expected: u32, computed: u32 },
}

pub type Result<T> = std::result::Result<T, CodecError>;

// An adversarial header must not make us allocate unbounded memory.
const MAX_BLOCK_LEN: usize = 512 * 1024 * 1024;

/// Cursor over a decompressed block, reading little-endian primitives.
pub struct Reader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Reader { data, pos: 0 }
    }

    /// True when every byte of the block has been consumed.
    pub fn is_end(&self) -> bool {
        self.pos == self.data.len()
    }

    pub fn next_bytes(&mut self, n: usize) -> Result<&'a [u8]> {
        if self.data.len() - self.pos < n {
            return Err(CodecError::Truncated);
        }
        let slice = &self.data[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    pub fn next_u8(&mut self) -> Result<u8> {
        Ok(self.next_bytes(1)?[0])
    }

    pub fn next_u16(&mut self) -> Result<u16> {
        let b = self.next_bytes(2)?;
        Ok(u16::from_le_bytes([b[0], b[1]]))
    }

    pub fn next_u32(&mut self) -> Result<u32> {
        let b = self.next_bytes(4)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    pub fn next_f32(&mut self) -> Result<f32> {
        let b = self.next_bytes(4)?;
        Ok(f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    pub fn next_f64(&mut self) -> Result<f64> {
        let b = self.next_bytes(8)?;
        Ok(f64::from_le_bytes([
            b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7],
        ]))
    }

    /// Read a string framed as a 1-byte length followed by UTF-8 bytes.
    pub fn next_str(&mut self) -> Result<String> {
        let len = self.next_u8()? as usize;
        let bytes = self.next_bytes(len)?;
        String::from_utf8(bytes.to_vec())
            .map_err(|e| CodecError::Format(format!("invalid UTF-8 in string: {e}")))
    }
}

/// Builder for a block payload, writing little-endian primitives.
#[derive(Default)]
pub struct Writer {
    buf: Vec<u8>,
}

impl Writer {
    pub fn new() -> Self {
        Writer::default()
    }

    pub fn put_u8(&mut self, v: u8) {
        self.buf.push(v);
    }

    pub fn put_u16(&mut self, v: u16) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    pub fn put_u32(&mut self, v: u32) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    pub fn put_f32(&mut self, v: f32) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    pub fn put_f64(&mut self, v: f64) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    /// Write a string as a 1-byte length followed by UTF-8 bytes.
    ///
    /// Strings longer than 255 bytes are truncated at a character boundary.
    pub fn put_str(&mut self, s: &str) {
        let mut len = s.len().min(255);
        while !s.is_char_boundary(len) {
            len -= 1;
        }
        self.buf.push(len as u8);
        self.buf.extend_from_slice(&s.as_bytes()[..len]);
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.buf
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.buf
    }
}

/// Compress `payload` and write one framed block to `out`.
pub fn save_block(out: &mut dyn Write, payload: &[u8]) -> Result<()> {
    let mut encoder = DeflateEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(payload)?;
    let compressed = encoder.finish()?;

    out.write_all(&(payload.len() as u32).to_le_bytes())?;
    out.write_all(&(compressed.len() as u32).to_le_bytes())?;
    out.write_all(&crc32fast::hash(payload).to_le_bytes())?;
    out.write_all(&compressed)?;
    Ok(())
}

/// Read one framed block from `input`, decompress it and verify its CRC.
pub fn load_block(input: &mut dyn Read) -> Result<Vec<u8>> {
    let mut header = [0u8; 12];
    input
        .read_exact(&mut header)
        .map_err(|_| CodecError::Truncated)?;
    let uncompressed_len = u32::from_le_bytes([header[0], header[1], header[2], header[3]]) as usize;
    let compressed_len = u32::from_le_bytes([header[4], header[5], header[6], header[7]]) as usize;
    let expected_crc = u32::from_le_bytes([header[8], header[9], header[10], header[11]]);

    if uncompressed_len > MAX_BLOCK_LEN || compressed_len > MAX_BLOCK_LEN {
        return Err(CodecError::Format(format!(
            "block too large: {uncompressed_len} uncompressed, {compressed_len} compressed"
        )));
    }

    let mut compressed = vec![0u8; compressed_len];
    input
        .read_exact(&mut compressed)
        .map_err(|_| CodecError::Truncated)?;

    let mut payload = Vec::with_capacity(uncompressed_len);
    DeflateDecoder::new(&compressed[..])
        .take(uncompressed_len as u64 + 1)
        .read_to_end(&mut payload)
        .map_err(|e| CodecError::Format(format!("corrupt compressed block: {e}")))?;
    if payload.len() != uncompressed_len {
        return Err(CodecError::Format(format!(
            "block length mismatch: expected {uncompressed_len}, got {}",
            payload.len()
        )));
    }

    let computed = crc32fast::hash(&payload);
    if computed != expected_crc {
        return Err(CodecError::Crc {
            expected: expected_crc,
            computed,
        });
    }

    Ok(payload)
}

/// Serialise a `Writer`'s payload as one compressed block.
pub fn save_writer(out: &mut dyn Write, writer: Writer) -> Result<()> {
    save_block(out, &writer.into_bytes())
}
