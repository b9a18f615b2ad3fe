//! Archive writer
//!
//! Each collection is dumped into its own spool file so dumps can run on
//! separate threads. [`ArchiveWriter::finish`] then stitches the spools
//! together in order behind the header, optionally through gzip.

use std::fs::{self, File};
use std::io::{self, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use flate2::write::GzEncoder;
use flate2::Compression;
use tempfile::TempDir;
use tracing::debug;

use super::format::{self, ArchiveHeader, EncryptionHeader, SegmentHeader};
use crate::crypto::{self, derive_key, DerivedKey, KdfCost, KeyDerivationParams};
use crate::error::{EngineError, EngineResult};
use crate::models::Document;

/// Passphrase-derived key plus the header block describing it
#[derive(Clone)]
pub struct ArchiveKey {
    header: EncryptionHeader,
    key: Arc<DerivedKey>,
}

impl ArchiveKey {
    /// Derive a fresh key with a random salt
    pub fn derive(passphrase: &str, cost: KdfCost) -> EngineResult<Self> {
        let params = KeyDerivationParams::generate(cost);
        let key = derive_key(passphrase, &params)?;
        let key_check = crypto::key_check(&key)?;
        Ok(Self {
            header: EncryptionHeader { params, key_check },
            key: Arc::new(key),
        })
    }
}

/// Builds one archive file from spooled segments
pub struct ArchiveWriter {
    spool_dir: TempDir,
    key: Option<ArchiveKey>,
}

impl ArchiveWriter {
    /// Create a writer whose spool files live under `work_dir`
    pub fn new(work_dir: &Path, key: Option<ArchiveKey>) -> EngineResult<Self> {
        fs::create_dir_all(work_dir).map_err(|e| {
            EngineError::Io(format!(
                "Failed to create directory {}: {}",
                work_dir.display(),
                e
            ))
        })?;
        let spool_dir = tempfile::Builder::new()
            .prefix(".spool-")
            .tempdir_in(work_dir)
            .map_err(|e| EngineError::Io(format!("Failed to create spool directory: {}", e)))?;
        Ok(Self { spool_dir, key })
    }

    pub fn is_encrypted(&self) -> bool {
        self.key.is_some()
    }

    /// Open the spool for the segment at position `index`
    pub fn spool(&self, index: usize, name: &str) -> EngineResult<SegmentSpool> {
        let path = self.spool_dir.path().join(format!("{:04}-{}.seg", index, name));
        let file = File::create(&path)
            .map_err(|e| EngineError::Io(format!("Failed to create spool file: {}", e)))?;
        Ok(SegmentSpool {
            name: name.to_string(),
            path,
            writer: BufWriter::new(file),
            key: self.key.as_ref().map(|k| Arc::clone(&k.key)),
            document_count: 0,
            byte_length: 0,
        })
    }

    /// Write the archive to `dest` and return its size on disk
    ///
    /// Segments are written in the order given. The spool directory is
    /// removed when the writer drops, whether or not this succeeds.
    pub fn finish(
        self,
        segments: &[SpooledSegment],
        dest: &Path,
        compress: bool,
    ) -> EngineResult<u64> {
        let file = File::create(dest).map_err(|e| {
            EngineError::Io(format!("Failed to create archive {}: {}", dest.display(), e))
        })?;
        let header = ArchiveHeader::new(self.key.as_ref().map(|k| k.header.clone()));

        let file = if compress {
            let encoder = GzEncoder::new(BufWriter::new(file), Compression::default());
            let encoder = write_body(encoder, &header, segments)?;
            let buffered = encoder.finish()?;
            into_file(buffered)?
        } else {
            into_file(write_body(BufWriter::new(file), &header, segments)?)?
        };

        file.sync_all()?;
        let size = file.metadata()?.len();
        debug!(path = %dest.display(), size, compress, "archive written");
        Ok(size)
    }

    /// Write named document sequences as one archive in a single call
    pub fn write_segments<I>(
        self,
        dest: &Path,
        compress: bool,
        segments: impl IntoIterator<Item = (String, I)>,
    ) -> EngineResult<u64>
    where
        I: IntoIterator<Item = Document>,
    {
        let mut spooled = Vec::new();
        for (index, (name, documents)) in segments.into_iter().enumerate() {
            let mut spool = self.spool(index, &name)?;
            for doc in documents {
                spool.push(&doc)?;
            }
            spooled.push(spool.finish()?);
        }
        self.finish(&spooled, dest, compress)
    }
}

fn into_file(writer: BufWriter<File>) -> EngineResult<File> {
    writer
        .into_inner()
        .map_err(|e| EngineError::Io(format!("Failed to flush archive: {}", e.error())))
}

fn write_body<W: Write>(
    mut out: W,
    header: &ArchiveHeader,
    segments: &[SpooledSegment],
) -> EngineResult<W> {
    header.write_to(&mut out)?;

    for segment in segments {
        SegmentHeader {
            name: segment.name.clone(),
            document_count: segment.document_count,
            byte_length: segment.byte_length,
        }
        .write_to(&mut out)?;

        let mut input = BufReader::new(File::open(&segment.path)?);
        let copied = io::copy(&mut input, &mut out)?;
        if copied != segment.byte_length {
            return Err(EngineError::Archive(format!(
                "Spool for '{}' holds {} bytes, expected {}",
                segment.name, copied, segment.byte_length
            )));
        }
    }

    let count = u32::try_from(segments.len())
        .map_err(|_| EngineError::Archive("Too many segments".into()))?;
    format::write_trailer(&mut out, count)?;
    out.flush()?;
    Ok(out)
}

/// An open spool receiving one collection's documents
pub struct SegmentSpool {
    name: String,
    path: PathBuf,
    writer: BufWriter<File>,
    key: Option<Arc<DerivedKey>>,
    document_count: u64,
    byte_length: u64,
}

impl SegmentSpool {
    pub fn push(&mut self, document: &Document) -> EngineResult<()> {
        let json = serde_json::to_vec(document)?;
        let body = match &self.key {
            Some(key) => crypto::seal(&json, key)?,
            None => json,
        };
        self.byte_length += format::write_document(&mut self.writer, &body)?;
        self.document_count += 1;
        Ok(())
    }

    pub fn document_count(&self) -> u64 {
        self.document_count
    }

    pub fn finish(mut self) -> EngineResult<SpooledSegment> {
        self.writer.flush()?;
        Ok(SpooledSegment {
            name: self.name,
            path: self.path,
            document_count: self.document_count,
            byte_length: self.byte_length,
        })
    }
}

/// A completed spool ready to be stitched into the archive
#[derive(Debug, Clone)]
pub struct SpooledSegment {
    pub name: String,
    path: PathBuf,
    pub document_count: u64,
    pub byte_length: u64,
}
