//! Streaming SHA-256 digest of file contents.

use std::fs::File;
use std::io::{self, Read};
use std::path::Path;

use sha2::{Digest, Sha256};

use crate::error::{DlpError, Result};

const CHUNK_SIZE: usize = 4096;

/// Streams `path` in 4 KiB chunks and returns the hex-encoded SHA-256
/// digest. Permission errors map to `AccessDenied`; any other I/O failure
/// maps to `IoError`, both carrying the offending path.
pub fn hash_file(path: impl AsRef<Path>) -> Result<String> {
    let path = path.as_ref();
    let mut file = File::open(path).map_err(|e| DlpError::from_io(path, e))?;
    let mut hasher = Sha256::new();
    let mut buf = [0u8; CHUNK_SIZE];
    loop {
        let n = match file.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(DlpError::from_io(path, e)),
        };
        hasher.update(&buf[..n]);
    }
    Ok(hex::encode(hasher.finalize()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn hash_is_reproducible() {
        let mut f = NamedTempFile::new().unwrap();
        f.write_all(b"the quick brown fox").unwrap();
        let h1 = hash_file(f.path()).unwrap();
        let h2 = hash_file(f.path()).unwrap();
        assert_eq!(h1, h2);
        assert_eq!(h1.len(), 64);
    }

    #[test]
    fn different_content_different_hash() {
        let mut f1 = NamedTempFile::new().unwrap();
        f1.write_all(b"alpha").unwrap();
        let mut f2 = NamedTempFile::new().unwrap();
        f2.write_all(b"beta").unwrap();
        assert_ne!(hash_file(f1.path()).unwrap(), hash_file(f2.path()).unwrap());
    }

    #[test]
    fn missing_file_errors() {
        let result = hash_file("/nonexistent/path/zzz");
        assert!(result.is_err());
    }

    #[test]
    fn large_file_spans_multiple_chunks() {
        let mut f = NamedTempFile::new().unwrap();
        let data = vec![b'x'; CHUNK_SIZE * 3 + 17];
        f.write_all(&data).unwrap();
        let h = hash_file(f.path()).unwrap();
        assert_eq!(h.len(), 64);
    }
}
