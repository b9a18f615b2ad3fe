//! On-disk layout of a `.cmsa` archive
//!
//! All integers are big-endian.
//!
//! ```text
//! header   : "CMSA" | version u8 | flags u8
//!            [encrypted: salt (u16 len + utf8) | memory u32 | time u32
//!                        | parallelism u32 | key check (u32 len + bytes)]
//! segment* : 'S' | name (u16 len + utf8) | doc count u64 | byte len u64 | payload
//! payload  : (u32 len + document bytes)*
//! trailer  : 'E' | segment count u32
//! ```
//!
//! The whole file may additionally be gzip-wrapped.

use std::io::{self, Read, Write};

use crate::crypto::{KdfCost, KeyDerivationParams};
use crate::error::{EngineError, EngineResult};

pub const MAGIC: &[u8; 4] = b"CMSA";
pub const FORMAT_VERSION: u8 = 1;
pub const FLAG_ENCRYPTED: u8 = 0b0000_0001;
pub const TAG_SEGMENT: u8 = b'S';
pub const TAG_END: u8 = b'E';
pub const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];

/// Archive file extension
pub const EXTENSION: &str = "cmsa";

/// Upper bound on one encoded document; larger lengths mean corruption
pub const MAX_DOCUMENT_LEN: u32 = 64 * 1024 * 1024;

/// Length prefix preceding every document in a payload
pub const DOC_LEN_PREFIX: u64 = 4;

/// Key material recorded in an encrypted archive's header
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncryptionHeader {
    pub params: KeyDerivationParams,
    /// Sealed marker used to check the passphrase
    pub key_check: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArchiveHeader {
    pub version: u8,
    pub encryption: Option<EncryptionHeader>,
}

impl ArchiveHeader {
    pub fn new(encryption: Option<EncryptionHeader>) -> Self {
        Self {
            version: FORMAT_VERSION,
            encryption,
        }
    }

    pub fn is_encrypted(&self) -> bool {
        self.encryption.is_some()
    }

    pub fn write_to<W: Write>(&self, w: &mut W) -> EngineResult<()> {
        w.write_all(MAGIC)?;
        w.write_all(&[self.version])?;
        let flags = if self.is_encrypted() { FLAG_ENCRYPTED } else { 0 };
        w.write_all(&[flags])?;

        if let Some(enc) = &self.encryption {
            write_str16(w, &enc.params.salt)?;
            write_u32(w, enc.params.cost.memory_cost)?;
            write_u32(w, enc.params.cost.time_cost)?;
            write_u32(w, enc.params.cost.parallelism)?;
            write_u32(w, len_u32(enc.key_check.len())?)?;
            w.write_all(&enc.key_check)?;
        }
        Ok(())
    }

    pub fn read_from<R: Read>(r: &mut R) -> EngineResult<Self> {
        let mut magic = [0u8; 4];
        read_exact(r, &mut magic, "archive header")?;
        if &magic != MAGIC {
            return Err(EngineError::Archive(
                "Not a CMS backup archive (bad magic bytes)".into(),
            ));
        }

        let version = read_u8(r, "archive version")?;
        if version != FORMAT_VERSION {
            return Err(EngineError::Archive(format!(
                "Unsupported archive version: {}",
                version
            )));
        }

        let flags = read_u8(r, "archive flags")?;
        if flags & !FLAG_ENCRYPTED != 0 {
            return Err(EngineError::Archive(format!(
                "Unknown archive flags: {:#04x}",
                flags
            )));
        }

        let encryption = if flags & FLAG_ENCRYPTED != 0 {
            let salt = read_str16(r, "key salt")?;
            let cost = KdfCost {
                memory_cost: read_u32(r, "key cost")?,
                time_cost: read_u32(r, "key cost")?,
                parallelism: read_u32(r, "key cost")?,
            };
            if cost.exceeds_ceiling() {
                return Err(EngineError::Archive(format!(
                    "Key derivation cost too high (memory {} KiB, time {}, parallelism {})",
                    cost.memory_cost, cost.time_cost, cost.parallelism
                )));
            }
            let check_len = read_u32(r, "key check")?;
            if check_len > 1024 {
                return Err(EngineError::Archive(format!(
                    "Key check block too large: {} bytes",
                    check_len
                )));
            }
            let mut key_check = vec![0u8; check_len as usize];
            read_exact(r, &mut key_check, "key check")?;
            Some(EncryptionHeader {
                params: KeyDerivationParams { salt, cost },
                key_check,
            })
        } else {
            None
        };

        Ok(Self {
            version,
            encryption,
        })
    }
}

/// Framing of one collection segment; the payload follows it directly
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SegmentHeader {
    pub name: String,
    pub document_count: u64,
    /// Payload size in bytes, including document length prefixes
    pub byte_length: u64,
}

impl SegmentHeader {
    /// Write tag and framing; the caller writes the payload
    pub fn write_to<W: Write>(&self, w: &mut W) -> EngineResult<()> {
        w.write_all(&[TAG_SEGMENT])?;
        write_str16(w, &self.name)?;
        write_u64(w, self.document_count)?;
        write_u64(w, self.byte_length)?;
        Ok(())
    }

    /// Read framing after the tag byte has been consumed
    pub fn read_after_tag<R: Read>(r: &mut R) -> EngineResult<Self> {
        let name = read_str16(r, "segment name")?;
        let document_count = read_u64(r, "segment header")?;
        let byte_length = read_u64(r, "segment header")?;

        if document_count.saturating_mul(DOC_LEN_PREFIX) > byte_length {
            return Err(EngineError::Archive(format!(
                "Segment '{}' claims {} documents in {} bytes",
                name, document_count, byte_length
            )));
        }

        Ok(Self {
            name,
            document_count,
            byte_length,
        })
    }
}

pub fn write_trailer<W: Write>(w: &mut W, segment_count: u32) -> EngineResult<()> {
    w.write_all(&[TAG_END])?;
    write_u32(w, segment_count)
}

// ----------------------------------------------------------------------
// Primitive encoding
// ----------------------------------------------------------------------

fn len_u32(len: usize) -> EngineResult<u32> {
    u32::try_from(len).map_err(|_| EngineError::Archive(format!("Length {} exceeds u32", len)))
}

pub fn write_u32<W: Write>(w: &mut W, v: u32) -> EngineResult<()> {
    w.write_all(&v.to_be_bytes())?;
    Ok(())
}

pub fn write_u64<W: Write>(w: &mut W, v: u64) -> EngineResult<()> {
    w.write_all(&v.to_be_bytes())?;
    Ok(())
}

pub fn write_str16<W: Write>(w: &mut W, s: &str) -> EngineResult<()> {
    let len = u16::try_from(s.len())
        .map_err(|_| EngineError::Archive(format!("Name too long: {} bytes", s.len())))?;
    w.write_all(&len.to_be_bytes())?;
    w.write_all(s.as_bytes())?;
    Ok(())
}

/// Write one length-prefixed document, returning the bytes written
pub fn write_document<W: Write>(w: &mut W, body: &[u8]) -> EngineResult<u64> {
    let len = len_u32(body.len())?;
    if len > MAX_DOCUMENT_LEN {
        return Err(EngineError::Archive(format!(
            "Document of {} bytes exceeds the {} byte limit",
            len, MAX_DOCUMENT_LEN
        )));
    }
    write_u32(w, len)?;
    w.write_all(body)?;
    Ok(DOC_LEN_PREFIX + u64::from(len))
}

/// Map a read failure to an archive error, calling out truncation
pub fn read_error(e: io::Error, what: &str) -> EngineError {
    if e.kind() == io::ErrorKind::UnexpectedEof {
        EngineError::Archive(format!("Archive truncated while reading {}", what))
    } else {
        EngineError::Archive(format!("Failed to read {}: {}", what, e))
    }
}

pub fn read_exact<R: Read>(r: &mut R, buf: &mut [u8], what: &str) -> EngineResult<()> {
    r.read_exact(buf).map_err(|e| read_error(e, what))
}

pub fn read_u8<R: Read>(r: &mut R, what: &str) -> EngineResult<u8> {
    let mut buf = [0u8; 1];
    read_exact(r, &mut buf, what)?;
    Ok(buf[0])
}

pub fn read_u16<R: Read>(r: &mut R, what: &str) -> EngineResult<u16> {
    let mut buf = [0u8; 2];
    read_exact(r, &mut buf, what)?;
    Ok(u16::from_be_bytes(buf))
}

pub fn read_u32<R: Read>(r: &mut R, what: &str) -> EngineResult<u32> {
    let mut buf = [0u8; 4];
    read_exact(r, &mut buf, what)?;
    Ok(u32::from_be_bytes(buf))
}

pub fn read_u64<R: Read>(r: &mut R, what: &str) -> EngineResult<u64> {
    let mut buf = [0u8; 8];
    read_exact(r, &mut buf, what)?;
    Ok(u64::from_be_bytes(buf))
}

pub fn read_str16<R: Read>(r: &mut R, what: &str) -> EngineResult<String> {
    let len = read_u16(r, what)?;
    let mut buf = vec![0u8; len as usize];
    read_exact(r, &mut buf, what)?;
    String::from_utf8(buf).map_err(|_| EngineError::Archive(format!("Invalid UTF-8 in {}", what)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn test_plain_header_layout() {
        let mut buf = Vec::new();
        ArchiveHeader::new(None).write_to(&mut buf).unwrap();
        assert_eq!(buf, b"CMSA\x01\x00");

        let header = ArchiveHeader::read_from(&mut Cursor::new(&buf)).unwrap();
        assert!(!header.is_encrypted());
    }

    #[test]
    fn test_encrypted_header_carries_params() {
        let enc = EncryptionHeader {
            params: KeyDerivationParams {
                salt: "c2FsdHNhbHRzYWx0".into(),
                cost: KdfCost::default(),
            },
            key_check: vec![7; 40],
        };
        let mut buf = Vec::new();
        ArchiveHeader::new(Some(enc.clone())).write_to(&mut buf).unwrap();
        assert_eq!(buf[5], FLAG_ENCRYPTED);

        let header = ArchiveHeader::read_from(&mut Cursor::new(&buf)).unwrap();
        assert_eq!(header.encryption, Some(enc));
    }

    #[test]
    fn test_bad_magic_rejected() {
        let err = ArchiveHeader::read_from(&mut Cursor::new(b"PK\x03\x04\x01\x00")).unwrap_err();
        assert!(matches!(err, EngineError::Archive(_)));
    }

    #[test]
    fn test_unknown_version_rejected() {
        let err = ArchiveHeader::read_from(&mut Cursor::new(b"CMSA\x09\x00")).unwrap_err();
        assert!(err.to_string().contains("version"));
    }

    #[test]
    fn test_oversized_key_cost_rejected_before_derivation() {
        let enc = EncryptionHeader {
            params: KeyDerivationParams {
                salt: "c2FsdHNhbHRzYWx0".into(),
                cost: KdfCost {
                    memory_cost: 8,
                    time_cost: u32::MAX,
                    parallelism: 1,
                },
            },
            key_check: vec![7; 40],
        };
        let mut buf = Vec::new();
        ArchiveHeader::new(Some(enc)).write_to(&mut buf).unwrap();

        let started = std::time::Instant::now();
        let err = ArchiveHeader::read_from(&mut Cursor::new(&buf)).unwrap_err();
        assert!(matches!(err, EngineError::Archive(_)));
        assert!(err.to_string().contains("cost"));
        assert!(started.elapsed() < std::time::Duration::from_secs(1));
    }

    #[test]
    fn test_truncated_header_reported() {
        let err = ArchiveHeader::read_from(&mut Cursor::new(b"CM")).unwrap_err();
        assert!(err.to_string().contains("truncated"));
    }

    #[test]
    fn test_segment_header_sanity_check() {
        let mut buf = Vec::new();
        SegmentHeader {
            name: "blogs".into(),
            document_count: 10,
            byte_length: 8,
        }
        .write_to(&mut buf)
        .unwrap();

        let mut cursor = Cursor::new(&buf[1..]);
        let err = SegmentHeader::read_after_tag(&mut cursor).unwrap_err();
        assert!(err.to_string().contains("claims 10 documents"));
    }

    #[test]
    fn test_document_framing() {
        let mut buf = Vec::new();
        let written = write_document(&mut buf, b"{}").unwrap();
        assert_eq!(written, 6);
        assert_eq!(&buf[..4], &[0, 0, 0, 2]);
    }
}
