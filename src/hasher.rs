//! BLAKE3 hashing for input fingerprints and synced-folder content.

use std::io::Read;
use std::path::Path;

use crate::error::{Error, Result};

const STREAM_BUF_SIZE: usize = 65536;

/// Hash a string. Returns `"blake3:{hex}"`.
pub fn hash_string(s: &str) -> String {
    format!("blake3:{}", blake3::hash(s.as_bytes()).to_hex())
}

/// Fingerprint a resource's desired inputs: type token plus canonical JSON.
///
/// `serde_json::Map` keeps keys sorted, so serialization is canonical and the
/// fingerprint is stable across declaration order.
pub fn fingerprint(ty: &str, inputs: &serde_json::Map<String, serde_json::Value>) -> String {
    let body = serde_json::Value::Object(inputs.clone()).to_string();
    hash_string(&format!("{}\0{}", ty, body))
}

/// Hash a file's contents. Returns `"blake3:{hex}"`.
pub fn hash_file(path: &Path) -> Result<String> {
    let mut file = std::fs::File::open(path)?;
    let mut hasher = blake3::Hasher::new();
    let mut buf = [0u8; STREAM_BUF_SIZE];
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(format!("blake3:{}", hasher.finalize().to_hex()))
}

/// Hash a directory (sorted walk, relative paths included in hash).
/// Skips symlinks.
pub fn hash_directory(path: &Path) -> Result<String> {
    let mut entries: Vec<(String, String)> = Vec::new();

    fn walk(base: &Path, current: &Path, entries: &mut Vec<(String, String)>) -> Result<()> {
        let read_dir = std::fs::read_dir(current)?;
        let mut children: Vec<std::fs::DirEntry> = read_dir.filter_map(|e| e.ok()).collect();
        children.sort_by_key(|e| e.file_name());

        for entry in children {
            let ft = entry.file_type()?;
            if ft.is_symlink() {
                continue;
            }
            let path = entry.path();
            let rel = path
                .strip_prefix(base)
                .map_err(|e| Error::State(format!("path prefix error: {}", e)))?
                .to_string_lossy()
                .to_string();
            if ft.is_file() {
                let hash = hash_file(&path)?;
                entries.push((rel, hash));
            } else if ft.is_dir() {
                walk(base, &path, entries)?;
            }
        }
        Ok(())
    }

    walk(path, path, &mut entries)?;

    let mut hasher = blake3::Hasher::new();
    for (rel, hash) in &entries {
        hasher.update(rel.as_bytes());
        hasher.update(b"\0");
        hasher.update(hash.as_bytes());
        hasher.update(b"\n");
    }
    Ok(format!("blake3:{}", hasher.finalize().to_hex()))
}
