//! SHA-256 helpers used for artifact content fingerprints.

use std::path::Path;

use sha2::{Digest, Sha256};

use crate::error::UtilError;

/// Compute the SHA-256 hex digest of a byte slice.
pub fn sha256_bytes(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    format!("{:x}", hasher.finalize())
}

/// Compute the SHA-256 hex digest of a file using streaming reads.
///
/// # Errors
/// Returns an error if the file cannot be opened or read.
pub fn sha256_file(path: &Path) -> Result<String, UtilError> {
    let mut hasher = Sha256::new();
    feed_file(&mut hasher, path)?;
    Ok(format!("{:x}", hasher.finalize()))
}

/// Hash every regular file below `dir`, keyed by its path relative to `dir`.
///
/// Files are visited in sorted order so the digest only depends on the tree's
/// names and contents. An empty directory hashes to the digest of no input.
///
/// # Errors
/// Returns an error if the directory cannot be walked or a file cannot be read.
pub fn sha256_tree(dir: &Path) -> Result<String, UtilError> {
    let escaped = glob::Pattern::escape(&dir.display().to_string());
    let pattern = format!("{escaped}/**/*");

    let mut paths: Vec<_> = glob::glob(&pattern)
        .map_err(|e| UtilError::GlobPattern {
            pattern: pattern.clone(),
            message: e.to_string(),
        })?
        .filter_map(Result::ok)
        .filter(|p| p.is_file())
        .collect();
    paths.sort();

    let mut hasher = Sha256::new();
    for path in &paths {
        let relative = path.strip_prefix(dir).unwrap_or(path);
        let name = relative.display().to_string();
        hasher.update(name.len().to_le_bytes());
        hasher.update(name.as_bytes());
        feed_file(&mut hasher, path)?;
    }
    Ok(format!("{:x}", hasher.finalize()))
}

/// Fingerprint a produced location, which may be a file or a directory.
///
/// Files and directories are tagged differently, so a file and a directory
/// holding that same content never collide.
///
/// # Errors
/// Returns [`UtilError::MissingLocation`] if nothing exists at `path`, or an
/// I/O error if its contents cannot be read.
pub fn sha256_location(path: &Path) -> Result<String, UtilError> {
    if path.is_dir() {
        let tree = sha256_tree(path)?;
        Ok(sha256_parts(&["dir", &tree]))
    } else if path.is_file() {
        let file = sha256_file(path)?;
        Ok(sha256_parts(&["file", &file]))
    } else {
        Err(UtilError::MissingLocation {
            path: path.display().to_string(),
        })
    }
}

/// Combine string parts into one digest. The order of `parts` matters.
///
/// Each part is length-prefixed so `["ab", "c"]` and `["a", "bc"]` differ.
pub fn sha256_parts(parts: &[&str]) -> String {
    let mut hasher = Sha256::new();
    for part in parts {
        hasher.update(part.len().to_le_bytes());
        hasher.update(part.as_bytes());
    }
    format!("{:x}", hasher.finalize())
}

/// Combine string parts into one digest regardless of their order.
pub fn sha256_unordered<S: AsRef<str>>(parts: &[S]) -> String {
    let mut sorted: Vec<&str> = parts.iter().map(AsRef::as_ref).collect();
    sorted.sort_unstable();
    sha256_parts(&sorted)
}

fn feed_file(hasher: &mut Sha256, path: &Path) -> Result<(), UtilError> {
    let file = std::fs::File::open(path).map_err(|source| UtilError::Io {
        path: path.display().to_string(),
        source,
    })?;
    let mut reader = std::io::BufReader::new(file);
    let mut buf = vec![0u8; 64 * 1024];
    loop {
        let n = std::io::Read::read(&mut reader, &mut buf).map_err(|source| UtilError::Io {
            path: path.display().to_string(),
            source,
        })?;
        if n == 0 {
            break;
        }
        let Some(chunk) = buf.get(..n) else {
            break;
        };
        hasher.update(chunk);
    }
    Ok(())
}
