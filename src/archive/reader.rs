//! Archive reader
//!
//! [`ArchiveReader::open`] validates the header once and derives the key for
//! encrypted archives. Every [`ArchiveReader::stream`] call reopens the file
//! and walks it front to back without buffering whole segments.

use std::fs::File;
use std::io::{self, BufReader, Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use flate2::read::GzDecoder;

use super::format::{self, ArchiveHeader, SegmentHeader, DOC_LEN_PREFIX, MAX_DOCUMENT_LEN};
use crate::crypto::{self, derive_key, DerivedKey};
use crate::error::{EngineError, EngineResult};
use crate::models::Document;

/// Validated handle on an archive file
#[derive(Debug)]
pub struct ArchiveReader {
    path: PathBuf,
    compressed: bool,
    header: ArchiveHeader,
    key: Option<Arc<DerivedKey>>,
}

impl ArchiveReader {
    /// Open an archive, verifying the passphrase when it is encrypted
    pub fn open(path: &Path, passphrase: Option<&str>) -> EngineResult<Self> {
        let (mut input, compressed) = open_input(path)?;
        let header = ArchiveHeader::read_from(&mut input)?;

        let key = match &header.encryption {
            Some(enc) => {
                let passphrase = passphrase.ok_or_else(|| {
                    EngineError::Encryption(
                        "Archive is encrypted and no passphrase was given".into(),
                    )
                })?;
                let key = derive_key(passphrase, &enc.params)?;
                crypto::verify_key_check(&enc.key_check, &key)?;
                Some(Arc::new(key))
            }
            None => None,
        };

        Ok(Self {
            path: path.to_path_buf(),
            compressed,
            header,
            key,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn is_compressed(&self) -> bool {
        self.compressed
    }

    pub fn is_encrypted(&self) -> bool {
        self.header.is_encrypted()
    }

    /// Start a fresh pass over the archive's segments
    pub fn stream(&self) -> EngineResult<ArchiveStream> {
        let (mut input, _) = open_input(&self.path)?;
        ArchiveHeader::read_from(&mut input)?;
        Ok(ArchiveStream {
            input,
            key: self.key.clone(),
            current: None,
            segments_seen: 0,
            finished: false,
        })
    }

    /// Segment headers in archive order, payloads skipped
    pub fn headers(&self) -> EngineResult<Vec<SegmentHeader>> {
        let mut stream = self.stream()?;
        let mut headers = Vec::new();
        while let Some(header) = stream.next_segment()? {
            headers.push(header);
        }
        Ok(headers)
    }
}

fn open_input(path: &Path) -> EngineResult<(Box<dyn Read + Send>, bool)> {
    let mut file = File::open(path).map_err(|e| {
        if e.kind() == io::ErrorKind::NotFound {
            EngineError::file_not_found(path.display().to_string())
        } else {
            EngineError::Io(format!("Failed to open {}: {}", path.display(), e))
        }
    })?;

    let mut magic = [0u8; 2];
    format::read_exact(&mut file, &mut magic, "archive header")?;
    file.seek(SeekFrom::Start(0))?;

    let compressed = magic == format::GZIP_MAGIC;
    let input: Box<dyn Read + Send> = if compressed {
        Box::new(BufReader::new(GzDecoder::new(BufReader::new(file))))
    } else {
        Box::new(BufReader::new(file))
    };
    Ok((input, compressed))
}

struct SegmentCursor {
    header: SegmentHeader,
    documents_read: u64,
    bytes_read: u64,
}

impl SegmentCursor {
    fn remaining_bytes(&self) -> u64 {
        self.header.byte_length - self.bytes_read
    }
}

/// One forward pass over an archive
pub struct ArchiveStream {
    input: Box<dyn Read + Send>,
    key: Option<Arc<DerivedKey>>,
    current: Option<SegmentCursor>,
    segments_seen: u32,
    finished: bool,
}

impl ArchiveStream {
    /// Advance to the next segment, skipping whatever is left of the current one
    ///
    /// Returns `None` after the trailer, once its segment count has been
    /// checked.
    pub fn next_segment(&mut self) -> EngineResult<Option<SegmentHeader>> {
        if self.finished {
            return Ok(None);
        }

        if let Some(cursor) = self.current.take() {
            let remaining = cursor.remaining_bytes();
            let skipped = io::copy(&mut (&mut self.input).take(remaining), &mut io::sink())
                .map_err(|e| format::read_error(e, "segment payload"))?;
            if skipped != remaining {
                return Err(EngineError::Archive(format!(
                    "Archive truncated inside segment '{}'",
                    cursor.header.name
                )));
            }
        }

        match format::read_u8(&mut self.input, "segment tag")? {
            format::TAG_SEGMENT => {
                let header = SegmentHeader::read_after_tag(&mut self.input)?;
                self.segments_seen += 1;
                self.current = Some(SegmentCursor {
                    header: header.clone(),
                    documents_read: 0,
                    bytes_read: 0,
                });
                Ok(Some(header))
            }
            format::TAG_END => {
                let declared = format::read_u32(&mut self.input, "archive trailer")?;
                if declared != self.segments_seen {
                    return Err(EngineError::Archive(format!(
                        "Trailer declares {} segments but {} were read",
                        declared, self.segments_seen
                    )));
                }
                let mut extra = [0u8; 1];
                if self.input.read(&mut extra)? != 0 {
                    return Err(EngineError::Archive("Trailing data after archive end".into()));
                }
                self.finished = true;
                Ok(None)
            }
            tag => Err(EngineError::Archive(format!(
                "Unexpected tag {:#04x} in archive",
                tag
            ))),
        }
    }

    /// Next document of the current segment, `None` at its end
    pub fn next_document(&mut self) -> EngineResult<Option<Document>> {
        let Some(cursor) = self.current.as_mut() else {
            return Ok(None);
        };

        if cursor.documents_read == cursor.header.document_count {
            if cursor.bytes_read != cursor.header.byte_length {
                return Err(EngineError::Archive(format!(
                    "Segment '{}' has {} stray bytes after its last document",
                    cursor.header.name,
                    cursor.remaining_bytes()
                )));
            }
            return Ok(None);
        }

        let len = format::read_u32(&mut self.input, "document length")?;
        let framed = DOC_LEN_PREFIX + u64::from(len);
        if len > MAX_DOCUMENT_LEN || framed > cursor.remaining_bytes() {
            return Err(EngineError::Archive(format!(
                "Document length {} overruns segment '{}'",
                len, cursor.header.name
            )));
        }

        let mut body = vec![0u8; len as usize];
        format::read_exact(&mut self.input, &mut body, "document")?;
        cursor.bytes_read += framed;
        cursor.documents_read += 1;

        let json = match &self.key {
            Some(key) => crypto::open(&body, key)?,
            None => body,
        };
        let document: Document = serde_json::from_slice(&json).map_err(|e| {
            EngineError::Archive(format!(
                "Corrupt document in segment '{}': {}",
                cursor.header.name, e
            ))
        })?;
        Ok(Some(document))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::archive::writer::{ArchiveKey, ArchiveWriter};
    use crate::crypto::key_derivation::test_cost;
    use serde_json::json;
    use std::fs;
    use tempfile::TempDir;

    fn doc(id: &str) -> Document {
        json!({"_id": id, "body": format!("text {}", id)})
            .as_object()
            .cloned()
            .unwrap()
    }

    fn write_archive(dir: &Path, compress: bool, key: Option<ArchiveKey>) -> PathBuf {
        let dest = dir.join(if compress { "a.cmsa.gz" } else { "a.cmsa" });
        ArchiveWriter::new(dir, key)
            .unwrap()
            .write_segments(
                &dest,
                compress,
                vec![
                    ("blogs".to_string(), vec![doc("b1"), doc("b2"), doc("b3")]),
                    ("users".to_string(), vec![doc("u1")]),
                    ("comments".to_string(), vec![]),
                ],
            )
            .unwrap();
        dest
    }

    fn read_all(reader: &ArchiveReader) -> Vec<(String, Vec<Document>)> {
        let mut stream = reader.stream().unwrap();
        let mut out = Vec::new();
        while let Some(header) = stream.next_segment().unwrap() {
            let mut docs = Vec::new();
            while let Some(d) = stream.next_document().unwrap() {
                docs.push(d);
            }
            out.push((header.name, docs));
        }
        out
    }

    #[test]
    fn test_stream_preserves_order_and_content() {
        let temp = TempDir::new().unwrap();
        let path = write_archive(temp.path(), false, None);
        let reader = ArchiveReader::open(&path, None).unwrap();

        let segments = read_all(&reader);
        let names: Vec<_> = segments.iter().map(|(n, _)| n.as_str()).collect();
        assert_eq!(names, vec!["blogs", "users", "comments"]);
        assert_eq!(segments[0].1, vec![doc("b1"), doc("b2"), doc("b3")]);
        assert!(segments[2].1.is_empty());
    }

    #[test]
    fn test_gzip_detected_by_magic() {
        let temp = TempDir::new().unwrap();
        let path = write_archive(temp.path(), true, None);
        let reader = ArchiveReader::open(&path, None).unwrap();
        assert!(reader.is_compressed());
        assert_eq!(read_all(&reader)[1].1, vec![doc("u1")]);
    }

    #[test]
    fn test_unread_segments_are_skipped() {
        let temp = TempDir::new().unwrap();
        let path = write_archive(temp.path(), true, None);
        let reader = ArchiveReader::open(&path, None).unwrap();

        let mut stream = reader.stream().unwrap();
        stream.next_segment().unwrap();
        // read only one document of blogs
        assert!(stream.next_document().unwrap().is_some());
        let users = stream.next_segment().unwrap().unwrap();
        assert_eq!(users.name, "users");
        assert_eq!(stream.next_document().unwrap(), Some(doc("u1")));
    }

    #[test]
    fn test_headers_listing_and_restream() {
        let temp = TempDir::new().unwrap();
        let path = write_archive(temp.path(), false, None);
        let reader = ArchiveReader::open(&path, None).unwrap();

        let headers = reader.headers().unwrap();
        assert_eq!(headers.len(), 3);
        assert_eq!(headers[0].document_count, 3);
        // a second pass starts from the top again
        assert_eq!(read_all(&reader).len(), 3);
    }

    #[test]
    fn test_encrypted_round_trip_and_wrong_passphrase() {
        let temp = TempDir::new().unwrap();
        let key = ArchiveKey::derive("hunter2", test_cost()).unwrap();
        let path = write_archive(temp.path(), true, Some(key));

        let raw = fs::read(&path).unwrap();
        assert!(!String::from_utf8_lossy(&raw).contains("text b1"));

        let reader = ArchiveReader::open(&path, Some("hunter2")).unwrap();
        assert!(reader.is_encrypted());
        assert_eq!(read_all(&reader)[0].1[0], doc("b1"));

        let err = ArchiveReader::open(&path, Some("wrong")).unwrap_err();
        assert!(matches!(err, EngineError::Encryption(_)));
        let err = ArchiveReader::open(&path, None).unwrap_err();
        assert!(matches!(err, EngineError::Encryption(_)));
    }

    #[test]
    fn test_truncated_archive_is_archive_error() {
        let temp = TempDir::new().unwrap();
        let path = write_archive(temp.path(), false, None);
        let bytes = fs::read(&path).unwrap();
        fs::write(&path, &bytes[..bytes.len() - 20]).unwrap();

        let reader = ArchiveReader::open(&path, None).unwrap();
        let err = reader.headers().unwrap_err();
        assert!(matches!(err, EngineError::Archive(_)));
    }

    #[test]
    fn test_non_archive_rejected() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("notes.txt");
        fs::write(&path, "hello world").unwrap();
        let err = ArchiveReader::open(&path, None).unwrap_err();
        assert!(matches!(err, EngineError::Archive(_)));
    }

    #[test]
    fn test_missing_file_is_not_found() {
        let temp = TempDir::new().unwrap();
        let err = ArchiveReader::open(&temp.path().join("gone.cmsa"), None).unwrap_err();
        assert!(err.is_not_found());
    }
}
