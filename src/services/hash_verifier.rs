use std::fs::{self, File};
use std::io::Read;
use std::path::Path;

use sha2::{Digest, Sha256};

use crate::errors::Result;

const HASH_BUFFER_SIZE: usize = 1024 * 1024;

pub fn compute_sha256(path: &Path) -> Result<String> {
    let mut file = File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buffer = vec![0_u8; HASH_BUFFER_SIZE];
    loop {
        let read = file.read(&mut buffer)?;
        if read == 0 {
            break;
        }
        hasher.update(&buffer[..read]);
    }
    Ok(hex::encode(hasher.finalize()))
}

/// Check the package against the hash the feed committed to. A corrupt file
/// is deleted so it cannot be installed; a file that vanished mid-check was
/// most likely removed by a concurrent delete, so it exits silently.
pub fn verify(path: &Path, expected_hash: &str) -> bool {
    match compute_sha256(path) {
        Ok(actual) if actual.eq_ignore_ascii_case(expected_hash.trim()) => {
            tracing::debug!("verification successful for {}", path.display());
            true
        }
        Ok(actual) => {
            tracing::error!(
                "hash mismatch for {}: expected {expected_hash}, got {actual}",
                path.display()
            );
            let _ = fs::remove_file(path);
            false
        }
        Err(err) => {
            if path.exists() {
                tracing::error!("error while verifying {}: {err}", path.display());
                let _ = fs::remove_file(path);
            } else {
                // The download was probably stopped. Exit silently.
                tracing::debug!("file {} vanished during verification", path.display());
            }
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;
    use uuid::Uuid;

    fn temp_file(contents: &[u8]) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("ota-updater-hash-test-{}", Uuid::new_v4()));
        fs::create_dir_all(&dir).expect("create temp dir");
        let path = dir.join("package.zip");
        fs::write(&path, contents).expect("write file");
        path
    }

    #[test]
    fn verify_matches_digest() {
        let path = temp_file(b"payload bytes");
        let expected = compute_sha256(&path).expect("digest");
        assert!(verify(&path, &expected));
        assert!(path.exists());
        // Case-insensitive comparison, the feed is not consistent about it.
        assert!(verify(&path, &expected.to_uppercase()));
        let _ = fs::remove_dir_all(path.parent().expect("parent"));
    }

    #[test]
    fn single_byte_mutation_fails_and_deletes() {
        let path = temp_file(b"payload bytes");
        let expected = compute_sha256(&path).expect("digest");

        let mut mutated = fs::read(&path).expect("read");
        mutated[0] ^= 0x01;
        fs::write(&path, &mutated).expect("write");

        assert!(!verify(&path, &expected));
        assert!(!path.exists());
        let _ = fs::remove_dir_all(path.parent().expect("parent"));
    }

    #[test]
    fn missing_file_fails_silently() {
        let path = temp_file(b"payload bytes");
        let parent = path.parent().expect("parent").to_path_buf();
        fs::remove_file(&path).expect("remove");
        assert!(!verify(&path, "abc"));
        let _ = fs::remove_dir_all(parent);
    }
}
