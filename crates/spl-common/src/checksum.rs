//! Archive checksum utilities.
//!
//! The processed-archive ledger identifies an archive by the hex SHA-256 of
//! its bytes; these helpers compute and verify that digest.

use std::io::Read;
use std::path::Path;

use sha2::{Digest, Sha256};

use crate::error::{EtlError, Result};

/// Compute the hex SHA-256 digest of a byte slice
pub fn compute_checksum(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}

/// Compute the hex SHA-256 digest of a file, streaming in 8 KiB blocks
pub fn compute_file_checksum(path: impl AsRef<Path>) -> Result<String> {
    let mut file = std::fs::File::open(path.as_ref())?;
    let mut hasher = Sha256::new();
    let mut buffer = [0u8; 8192];

    loop {
        let bytes_read = file.read(&mut buffer)?;
        if bytes_read == 0 {
            break;
        }
        hasher.update(&buffer[..bytes_read]);
    }

    Ok(hex::encode(hasher.finalize()))
}

/// Verify that a file's digest matches the ledger-recorded value
pub fn verify_file_checksum(path: impl AsRef<Path>, expected: &str) -> Result<()> {
    let path = path.as_ref();
    let actual = compute_file_checksum(path)?;
    if actual == expected {
        Ok(())
    } else {
        Err(EtlError::checksum_mismatch(
            path.display().to_string(),
            expected,
            actual,
        ))
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use tempfile::NamedTempFile;

    use super::*;

    #[test]
    fn test_compute_checksum_known_vector() {
        // SHA-256 of "spl"
        assert_eq!(
            compute_checksum(b"spl"),
            "8c64802bb57ab85b89646541ba23fdacf78b8a4697489b96c16bdb7ff1ad3d4d"
        );
    }

    #[test]
    fn test_file_and_byte_checksums_agree() {
        let data = b"<document xmlns=\"urn:hl7-org:v3\"/>";
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(data).unwrap();
        file.flush().unwrap();

        let from_file = compute_file_checksum(file.path()).unwrap();
        assert_eq!(from_file, compute_checksum(data));
        assert_eq!(from_file.len(), 64);
    }

    #[test]
    fn test_verify_file_checksum_mismatch() {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(b"archive bytes").unwrap();
        file.flush().unwrap();

        let wrong = "0".repeat(64);
        let result = verify_file_checksum(file.path(), &wrong);
        assert!(matches!(
            result.unwrap_err(),
            EtlError::ChecksumMismatch { .. }
        ));
    }

    #[test]
    fn test_verify_file_checksum_match() {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(b"archive bytes").unwrap();
        file.flush().unwrap();

        let expected = compute_file_checksum(file.path()).unwrap();
        assert!(verify_file_checksum(file.path(), &expected).is_ok());
    }
}
