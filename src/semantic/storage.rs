//! Binary snapshot of the vector index.
//!
//! File format: index_<model-slug>.bin
//!
//! Header (47 bytes):
//! - version: u8 (1)
//! - model_id: [u8; 32] (SHA256 hash of model name)
//! - dimensions: u16 (little-endian)
//! - row_count: u64 (little-endian)
//! - checksum: u32 (CRC32 of header fields before checksum)
//!
//! Body:
//! - matrix: [f32; row_count * dimensions] (little-endian, row-major)
//! - body_checksum: u32 (CRC32 of the matrix bytes)

use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use crate::semantic::index::{IndexError, VectorIndex};

const FORMAT_VERSION: u8 = 1;

/// version(1) + model_id(32) + dimensions(2) + row_count(8) + checksum(4)
const HEADER_SIZE: usize = 47;

#[derive(Debug, thiserror::Error)]
pub enum SnapshotError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid file format: {0}")]
    InvalidFormat(String),

    #[error("Version mismatch: file version {0}, supported version {1}")]
    VersionMismatch(u8, u8),

    #[error("Model mismatch: snapshot was built with a different model")]
    ModelMismatch,

    #[error("Checksum mismatch: file may be corrupted")]
    ChecksumMismatch,
}

impl From<IndexError> for SnapshotError {
    fn from(err: IndexError) -> Self {
        SnapshotError::InvalidFormat(err.to_string())
    }
}

/// Turn a model name into something usable in a file name.
pub fn model_slug(model_name: &str) -> String {
    model_name
        .chars()
        .map(|c| match c {
            'a'..='z' | 'A'..='Z' | '0'..='9' | '.' | '_' | '-' => c,
            _ => '-',
        })
        .collect()
}

/// Persists one [`VectorIndex`] per model under a directory.
#[derive(Debug, Clone)]
pub struct SnapshotStore {
    path: PathBuf,
}

impl SnapshotStore {
    pub fn new(dir: impl AsRef<Path>, model_name: &str) -> Self {
        let path = dir
            .as_ref()
            .join(format!("index_{}.bin", model_slug(model_name)));
        Self { path }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn exists(&self) -> bool {
        self.path.exists()
    }

    /// Load the snapshot, refusing files written for another model.
    pub fn load(&self, expected_model_id: &[u8; 32]) -> Result<VectorIndex, SnapshotError> {
        let file = File::open(&self.path)?;
        let mut reader = BufReader::new(file);

        let header = Self::read_header(&mut reader)?;
        if header.model_id != *expected_model_id {
            return Err(SnapshotError::ModelMismatch);
        }

        let values = (header.row_count as usize)
            .checked_mul(header.dimensions as usize)
            .ok_or_else(|| SnapshotError::InvalidFormat("row count overflows".to_string()))?;

        let mut body = vec![0u8; values * 4];
        reader
            .read_exact(&mut body)
            .map_err(|_| SnapshotError::InvalidFormat("truncated matrix".to_string()))?;

        let mut checksum = [0u8; 4];
        reader
            .read_exact(&mut checksum)
            .map_err(|_| SnapshotError::InvalidFormat("missing body checksum".to_string()))?;
        if u32::from_le_bytes(checksum) != crc32fast::hash(&body) {
            return Err(SnapshotError::ChecksumMismatch);
        }

        let mut trailing = [0u8; 1];
        if reader.read(&mut trailing)? != 0 {
            return Err(SnapshotError::InvalidFormat(
                "trailing bytes after matrix".to_string(),
            ));
        }

        let matrix = body
            .chunks_exact(4)
            .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
            .collect();

        Ok(VectorIndex::from_matrix(header.dimensions as usize, matrix)?)
    }

    /// Save the index.
    ///
    /// Uses atomic write: temp file -> fsync -> rename
    pub fn save(&self, index: &VectorIndex, model_id: &[u8; 32]) -> Result<(), SnapshotError> {
        let dimensions = u16::try_from(index.dimensions()).map_err(|_| {
            SnapshotError::InvalidFormat(format!("{} dimensions do not fit", index.dimensions()))
        })?;

        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let temp_path = self.path.with_extension("tmp");
        let result = Self::write_to_file(&temp_path, index, dimensions, model_id);
        if result.is_err() {
            let _ = std::fs::remove_file(&temp_path);
            return result;
        }

        std::fs::rename(&temp_path, &self.path)?;
        log::debug!(
            "saved snapshot {} ({} rows)",
            self.path.display(),
            index.len()
        );
        Ok(())
    }

    /// Delete the snapshot file if it exists.
    pub fn delete(&self) -> Result<(), SnapshotError> {
        if self.path.exists() {
            std::fs::remove_file(&self.path)?;
        }
        Ok(())
    }

    fn write_to_file(
        path: &Path,
        index: &VectorIndex,
        dimensions: u16,
        model_id: &[u8; 32],
    ) -> Result<(), SnapshotError> {
        let file = File::create(path)?;
        let mut writer = BufWriter::new(file);

        let mut header = [0u8; HEADER_SIZE];
        header[0] = FORMAT_VERSION;
        header[1..33].copy_from_slice(model_id);
        header[33..35].copy_from_slice(&dimensions.to_le_bytes());
        header[35..43].copy_from_slice(&(index.len() as u64).to_le_bytes());
        let checksum = crc32fast::hash(&header[0..43]);
        header[43..47].copy_from_slice(&checksum.to_le_bytes());
        writer.write_all(&header)?;

        let mut body_hasher = crc32fast::Hasher::new();
        for value in index.matrix() {
            let bytes = value.to_le_bytes();
            body_hasher.update(&bytes);
            writer.write_all(&bytes)?;
        }
        writer.write_all(&body_hasher.finalize().to_le_bytes())?;

        writer.flush()?;
        let file = writer
            .into_inner()
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e))?;
        file.sync_all()?;

        Ok(())
    }

    fn read_header(reader: &mut impl Read) -> Result<Header, SnapshotError> {
        let mut bytes = [0u8; HEADER_SIZE];
        reader
            .read_exact(&mut bytes)
            .map_err(|_| SnapshotError::InvalidFormat("truncated header".to_string()))?;

        let version = bytes[0];
        if version != FORMAT_VERSION {
            return Err(SnapshotError::VersionMismatch(version, FORMAT_VERSION));
        }

        let stored_checksum = u32::from_le_bytes([bytes[43], bytes[44], bytes[45], bytes[46]]);
        if stored_checksum != crc32fast::hash(&bytes[0..43]) {
            return Err(SnapshotError::ChecksumMismatch);
        }

        let mut model_id = [0u8; 32];
        model_id.copy_from_slice(&bytes[1..33]);

        let mut row_count = [0u8; 8];
        row_count.copy_from_slice(&bytes[35..43]);

        Ok(Header {
            model_id,
            dimensions: u16::from_le_bytes([bytes[33], bytes[34]]),
            row_count: u64::from_le_bytes(row_count),
        })
    }
}

#[derive(Debug)]
struct Header {
    model_id: [u8; 32],
    dimensions: u16,
    row_count: u64,
}
