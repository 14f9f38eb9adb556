use std::fs::File;
use std::io::{BufReader, Read};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use memmap2::MmapOptions;
use rayon::prelude::*;
use sha2::{Digest, Sha256};

const MMAP_THRESHOLD: u64 = 256 * 1024 * 1024;
const READ_BUFFER: usize = 64 * 1024;

/// Hex SHA-256 of a file's contents.
pub fn content_hash(path: &Path) -> Result<String> {
    let file = File::open(path).with_context(|| format!("Failed to open file: {:?}", path))?;
    let len = file.metadata()?.len();

    let mut hasher = Sha256::new();
    if len > MMAP_THRESHOLD {
        // The mapping is only read; a file truncated underneath us is not handled.
        let mmap = unsafe { MmapOptions::new().map(&file)? };
        hasher.update(&mmap);
    } else {
        let mut reader = BufReader::with_capacity(READ_BUFFER, file);
        let mut buffer = vec![0u8; READ_BUFFER];
        loop {
            let count = reader.read(&mut buffer)?;
            if count == 0 {
                break;
            }
            hasher.update(&buffer[..count]);
        }
    }

    Ok(hex::encode(hasher.finalize()))
}

/// Hashes a batch in parallel; failures stay paired with their path.
pub fn hash_batch(paths: &[PathBuf]) -> Vec<(PathBuf, Result<String>)> {
    paths
        .par_iter()
        .map(|path| (path.clone(), content_hash(path)))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn hashes_known_content() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("abc.bin");
        fs::write(&path, b"abc")?;

        assert_eq!(
            content_hash(&path)?,
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
        Ok(())
    }

    #[test]
    fn batch_keeps_errors_per_file() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let a = dir.path().join("a");
        let b = dir.path().join("b");
        fs::write(&a, b"same")?;
        fs::write(&b, b"same")?;
        let missing = dir.path().join("missing");

        let results = hash_batch(&[a.clone(), b, missing.clone()]);
        assert_eq!(results.len(), 3);
        assert_eq!(results[0].0, a);
        assert_eq!(
            results[0].1.as_ref().ok(),
            results[1].1.as_ref().ok()
        );
        assert_eq!(results[2].0, missing);
        assert!(results[2].1.is_err());
        Ok(())
    }
}
