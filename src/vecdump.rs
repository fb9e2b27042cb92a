use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use memmap2::Mmap;

use crate::error::{RagError, Result};

/// File extension for on-disk vector dumps.
pub const DUMP_EXTENSION: &str = "vecdump";

const HEADER_BYTES: usize = 16;
const HASH_BYTES: u32 = 8;

/// Fixed 16-byte little-endian header at the start of every dump.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DumpHeader {
    pub num_entries: u32,
    pub hash_size_bytes: u32,
    pub vector_size_bytes: u32,
    pub vector_dimensions: u32,
}

impl DumpHeader {
    fn parse(bytes: &[u8]) -> Self {
        let word = |i: usize| {
            u32::from_le_bytes([bytes[i], bytes[i + 1], bytes[i + 2], bytes[i + 3]])
        };
        Self {
            num_entries: word(0),
            hash_size_bytes: word(4),
            vector_size_bytes: word(8),
            vector_dimensions: word(12),
        }
    }

    fn expected_file_len(&self) -> usize {
        HEADER_BYTES
            + self.num_entries as usize
                * (self.vector_size_bytes as usize + self.hash_size_bytes as usize)
    }
}

/// Returns the dump path for a document fingerprint inside `dir`.
pub fn dump_path(dir: &Path, fingerprint: &str) -> PathBuf {
    dir.join(format!("{fingerprint}.{DUMP_EXTENSION}"))
}

/// Writes vectors and their hashes to `<dir>/<fingerprint>.vecdump`.
///
/// The directory is created if missing and the file is written to a
/// temporary sibling first, then renamed, so a reader never observes a
/// partial dump. All vectors must share one dimension and there must
/// be exactly one hash per vector.
pub fn write_dump(
    dir: &Path,
    fingerprint: &str,
    vectors: &[Vec<f32>],
    hashes: &[u64],
) -> Result<PathBuf> {
    if vectors.len() != hashes.len() {
        return Err(RagError::InvariantViolation(format!(
            "vector count ({}) differs from hash count ({})",
            vectors.len(),
            hashes.len()
        )));
    }

    let dimensions = vectors.first().map(Vec::len).unwrap_or(0);
    for (i, v) in vectors.iter().enumerate() {
        if v.len() != dimensions {
            return Err(RagError::DimensionMismatch {
                expected: dimensions,
                actual: v.len(),
            });
        }
        if v.len() > u32::MAX as usize / 4 {
            return Err(RagError::InvariantViolation(format!(
                "vector {i} is too large to dump"
            )));
        }
    }

    std::fs::create_dir_all(dir)?;
    let final_path = dump_path(dir, fingerprint);
    let tmp_path = final_path.with_extension(format!("{DUMP_EXTENSION}.tmp"));

    let header = DumpHeader {
        num_entries: vectors.len() as u32,
        hash_size_bytes: HASH_BYTES,
        vector_size_bytes: (dimensions * 4) as u32,
        vector_dimensions: dimensions as u32,
    };

    {
        let mut out = BufWriter::new(File::create(&tmp_path)?);
        out.write_all(&header.num_entries.to_le_bytes())?;
        out.write_all(&header.hash_size_bytes.to_le_bytes())?;
        out.write_all(&header.vector_size_bytes.to_le_bytes())?;
        out.write_all(&header.vector_dimensions.to_le_bytes())?;
        for vector in vectors {
            for value in vector {
                out.write_all(&value.to_le_bytes())?;
            }
        }
        for hash in hashes {
            out.write_all(&hash.to_le_bytes())?;
        }
        out.flush()?;
    }
    std::fs::rename(&tmp_path, &final_path)?;

    tracing::debug!(
        path = %final_path.display(),
        entries = header.num_entries,
        dimensions = header.vector_dimensions,
        "wrote vector dump"
    );
    Ok(final_path)
}

/// A read-only memory-mapped dump.
///
/// The mapping stays alive for the handle's lifetime; vector accessors
/// borrow directly from the mapped region. Hashes are decoded once at
/// open time because their section is only guaranteed 4-byte aligned.
/// Dropping the handle unmaps the file and closes the descriptor.
#[derive(Debug)]
pub struct MappedDump {
    mmap: Mmap,
    header: DumpHeader,
    hashes: Vec<u64>,
}

impl MappedDump {
    pub fn open(path: &Path) -> Result<Self> {
        let file = File::open(path)?;
        let mmap = unsafe { Mmap::map(&file)? };

        if mmap.len() < HEADER_BYTES {
            return Err(RagError::Parse(format!(
                "{}: file too small for a dump header",
                path.display()
            )));
        }

        let header = DumpHeader::parse(&mmap[..HEADER_BYTES]);
        if header.hash_size_bytes != HASH_BYTES {
            return Err(RagError::Parse(format!(
                "{}: unsupported hash size {}",
                path.display(),
                header.hash_size_bytes
            )));
        }
        if header.vector_size_bytes != header.vector_dimensions * 4 {
            return Err(RagError::Parse(format!(
                "{}: vector size {} does not match dimensions {}",
                path.display(),
                header.vector_size_bytes,
                header.vector_dimensions
            )));
        }
        if mmap.len() != header.expected_file_len() {
            return Err(RagError::Parse(format!(
                "{}: file length {} does not match header ({} entries of dim {})",
                path.display(),
                mmap.len(),
                header.num_entries,
                header.vector_dimensions
            )));
        }

        let hash_offset = HEADER_BYTES
            + header.num_entries as usize * header.vector_size_bytes as usize;
        let hashes = mmap[hash_offset..]
            .chunks_exact(8)
            .map(|b| u64::from_le_bytes(b.try_into().expect("8-byte chunk")))
            .collect();

        Ok(Self {
            mmap,
            header,
            hashes,
        })
    }

    pub fn header(&self) -> &DumpHeader {
        &self.header
    }

    pub fn num_entries(&self) -> usize {
        self.header.num_entries as usize
    }

    pub fn dimensions(&self) -> usize {
        self.header.vector_dimensions as usize
    }

    /// All vectors as one contiguous `num_entries * dimensions` slice,
    /// borrowed from the mapping.
    pub fn vectors(&self) -> &[f32] {
        let len = self.num_entries() * self.dimensions();
        let bytes = &self.mmap[HEADER_BYTES..HEADER_BYTES + len * 4];
        // The mapping is page aligned and the header is 16 bytes, so
        // the vector section satisfies f32 alignment.
        debug_assert_eq!(bytes.as_ptr() as usize % std::mem::align_of::<f32>(), 0);
        unsafe { std::slice::from_raw_parts(bytes.as_ptr() as *const f32, len) }
    }

    /// The i-th stored vector.
    pub fn vector(&self, i: usize) -> &[f32] {
        let d = self.dimensions();
        &self.vectors()[i * d..(i + 1) * d]
    }

    pub fn hashes(&self) -> &[u64] {
        &self.hashes
    }
}
