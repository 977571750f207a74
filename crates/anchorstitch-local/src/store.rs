//! Filesystem helpers shared by the result writer, the usage ledger and
//! the diagnostic sink.

use anchorstitch_core::{Error, Result};
use sha2::{Digest, Sha256};
use std::fs;
use std::path::{Path, PathBuf};

fn tmp_path(path: &Path) -> PathBuf {
    let mut name = path
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(".tmp");
    path.with_file_name(name)
}

/// Write-then-rename so a crash mid-write is never mistaken for a
/// completed file.
pub fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent).map_err(|e| Error::Store(e.to_string()))?;
        }
    }
    let tmp = tmp_path(path);
    fs::write(&tmp, bytes).map_err(|e| Error::Store(e.to_string()))?;
    fs::rename(&tmp, path).map_err(|e| Error::Store(e.to_string()))
}

/// Stable content key for traceability of outputs back to their input.
pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut h = Sha256::new();
    h.update(bytes);
    hex::encode(h.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn write_atomic_leaves_no_tmp_behind() {
        let dir = tempfile::tempdir().expect("tempdir");
        let p = dir.path().join("out").join("x.json");
        write_atomic(&p, b"{}").expect("write");
        assert_eq!(fs::read(&p).expect("read"), b"{}");
        assert!(!tmp_path(&p).exists());
    }

    #[test]
    fn sha256_hex_is_stable() {
        assert_eq!(
            sha256_hex(b"abc"),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }
}
