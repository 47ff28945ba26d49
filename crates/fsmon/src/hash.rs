//! File content hashing for modification detection.
//!
//! A zero hash means "never computed". The `(inode, size)` identity is
//! kept next to the hash as a cheap pre-filter: when neither changed
//! since the last computation, the stored hash is reused without
//! touching the file content.

use std::fs::File;
use std::io::{self, Read};
use std::os::unix::fs::MetadataExt;
use std::path::Path;

use sha2::{Digest, Sha256};

pub type ContentHash = [u8; 32];

pub const ZERO_HASH: ContentHash = [0u8; 32];

pub fn is_zero(hash: &ContentHash) -> bool {
    hash.iter().all(|b| *b == 0)
}

/// Cheap identity of a file, used to skip re-hashing unchanged content.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FileIdent {
    pub ino: u64,
    pub size: u64,
}

pub fn ident_of(meta: &std::fs::Metadata) -> FileIdent {
    FileIdent {
        ino: meta.ino(),
        size: meta.size(),
    }
}

pub fn file_ident(path: &Path) -> io::Result<FileIdent> {
    Ok(ident_of(&std::fs::metadata(path)?))
}

/// SHA-256 of the file content.
pub fn hash_file(path: &Path) -> io::Result<ContentHash> {
    let mut file = File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buffer = [0u8; 32 * 1024];
    loop {
        let n = file.read(&mut buffer)?;
        if n == 0 {
            break;
        }
        hasher.update(&buffer[..n]);
    }
    Ok(hasher.finalize().into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn hash_changes_with_content() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("target");
        std::fs::write(&path, b"one").unwrap();
        let first = hash_file(&path).unwrap();
        assert!(!is_zero(&first));

        let mut f = std::fs::OpenOptions::new().append(true).open(&path).unwrap();
        f.write_all(b"two").unwrap();
        drop(f);
        let second = hash_file(&path).unwrap();
        assert_ne!(first, second);
    }

    #[test]
    fn ident_tracks_size() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("target");
        std::fs::write(&path, b"abc").unwrap();
        let before = file_ident(&path).unwrap();
        std::fs::write(&path, b"abcdef").unwrap();
        let after = file_ident(&path).unwrap();
        assert_eq!(before.ino, after.ino);
        assert_ne!(before.size, after.size);
    }
}
