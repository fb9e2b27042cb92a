use std::collections::BTreeMap;
use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};

use sha2::{Digest, Sha256};

use crate::error::{RagError, Result};

const READ_BUF_BYTES: usize = 64 * 1024;

/// Computes the lowercase hex SHA-256 digest of a file's bytes.
///
/// The digest identifies one version of a document: re-ingesting a
/// file whose bytes are unchanged produces the same fingerprint and is
/// skipped upstream.
pub fn fingerprint_file(path: &Path) -> Result<String> {
    let mut file = File::open(path).map_err(|e| {
        RagError::Io(std::io::Error::new(
            e.kind(),
            format!("cannot read {}: {e}", path.display()),
        ))
    })?;

    let mut hasher = Sha256::new();
    let mut buf = [0u8; READ_BUF_BYTES];
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }

    Ok(format!("{:x}", hasher.finalize()))
}

/// Fingerprints a batch of files, preserving the path → digest
/// association. An unreadable file fails the whole batch with the
/// offending path in the error.
pub fn fingerprint_files(paths: &[PathBuf]) -> Result<BTreeMap<PathBuf, String>> {
    let mut hashes = BTreeMap::new();
    for path in paths {
        hashes.insert(path.clone(), fingerprint_file(path)?);
    }
    Ok(hashes)
}
