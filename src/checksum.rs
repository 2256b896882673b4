//! Checksum & Metadata Gatherer (§4.A): the leaf component everything else
//! in the change-detection pipeline is built on.

use std::collections::HashMap;
use std::fs;
use std::io::Read;
use std::path::Path;

use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};
use walkdir::WalkDir;

use crate::error::{EngineError, EngineResult};
use crate::model::FileMetadata;

const STREAM_BUF_SIZE: usize = 1024 * 1024;

/// Stream `path` through SHA-256 and hex-encode the digest. Never loads the
/// whole file into memory.
pub fn file_checksum(path: &Path) -> EngineResult<String> {
    let mut file = fs::File::open(path).map_err(EngineError::io)?;
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; STREAM_BUF_SIZE];
    loop {
        let n = file.read(&mut buf).map_err(EngineError::io)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hex_encode(&hasher.finalize()))
}

/// Read one filesystem entry's metadata. For directories the checksum is
/// always empty regardless of `want_checksum`. inode/device are best-effort
/// move hints; their absence (non-unix platforms, or a metadata read race)
/// never fails the call.
pub fn gather_file_metadata(path: &Path, want_checksum: bool) -> EngineResult<FileMetadata> {
    let meta = fs::metadata(path).map_err(EngineError::io)?;
    let is_dir = meta.is_dir();
    let modified: DateTime<Utc> = meta.modified().map_err(EngineError::io)?.into();
    let checksum = if !is_dir && want_checksum {
        file_checksum(path)?
    } else {
        String::new()
    };

    let (inode, device) = platform_ids(&meta);

    Ok(FileMetadata {
        path: path.to_string_lossy().into_owned(),
        size: if is_dir { 0 } else { meta.len() },
        modified,
        is_dir,
        checksum,
        permissions: platform_permissions(&meta),
        inode,
        device,
    })
}

/// Recursively walk `root`, returning metadata for every entry keyed by its
/// path relative to `root`. A per-entry failure (permission denied mid-walk,
/// a file vanishing between directory-read and stat) is logged and skipped
/// rather than aborting the whole walk.
pub fn gather_directory_metadata(root: &Path, want_checksum: bool) -> HashMap<String, FileMetadata> {
    let mut out = HashMap::new();
    for entry in WalkDir::new(root).min_depth(1).into_iter() {
        let entry = match entry {
            Ok(e) => e,
            Err(err) => {
                crate::logging::error(format!("walk error under {}: {err}", root.display()));
                continue;
            }
        };
        let abs_path = entry.path();
        let rel_path = match abs_path.strip_prefix(root) {
            Ok(p) => p.to_string_lossy().replace('\\', "/"),
            Err(_) => continue,
        };
        match gather_file_metadata(abs_path, want_checksum) {
            Ok(mut meta) => {
                meta.path = rel_path.clone();
                out.insert(rel_path, meta);
            }
            Err(err) => {
                crate::logging::error(format!("metadata error for {}: {err}", abs_path.display()));
            }
        }
    }
    out
}

/// Hash every file's absolute path followed by its content into a single
/// rolling digest, so both structural changes (renames, additions) and pure
/// content changes move the result.
pub fn directory_checksum(root: &Path) -> EngineResult<String> {
    let mut hasher = Sha256::new();
    let mut paths: Vec<_> = WalkDir::new(root)
        .min_depth(1)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file())
        .map(|e| e.path().to_path_buf())
        .collect();
    paths.sort();

    for path in paths {
        hasher.update(path.to_string_lossy().as_bytes());
        let mut file = fs::File::open(&path).map_err(EngineError::io)?;
        let mut buf = vec![0u8; STREAM_BUF_SIZE];
        loop {
            let n = file.read(&mut buf).map_err(EngineError::io)?;
            if n == 0 {
                break;
            }
            hasher.update(&buf[..n]);
        }
    }
    Ok(hex_encode(&hasher.finalize()))
}

fn hex_encode(bytes: &[u8]) -> String {
    let mut s = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        s.push_str(&format!("{b:02x}"));
    }
    s
}

#[cfg(unix)]
fn platform_ids(meta: &fs::Metadata) -> (u64, u64) {
    use std::os::unix::fs::MetadataExt;
    (meta.ino(), meta.dev())
}

#[cfg(not(unix))]
fn platform_ids(_meta: &fs::Metadata) -> (u64, u64) {
    (0, 0)
}

#[cfg(unix)]
fn platform_permissions(meta: &fs::Metadata) -> u32 {
    use std::os::unix::fs::PermissionsExt;
    meta.permissions().mode()
}

#[cfg(not(unix))]
fn platform_permissions(_meta: &fs::Metadata) -> u32 {
    0
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_dir(name: &str) -> std::path::PathBuf {
        let nanos = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap()
            .as_nanos();
        let dir = std::env::temp_dir().join(format!("syncore-checksum-{name}-{nanos}"));
        let _ = fs::remove_dir_all(&dir);
        fs::create_dir_all(&dir).unwrap();
        dir
    }

    #[test]
    fn checksum_of_empty_file_is_well_known_sha256() {
        let dir = temp_dir("empty");
        let path = dir.join("empty.txt");
        fs::write(&path, b"").unwrap();
        let digest = file_checksum(&path).unwrap();
        assert_eq!(
            digest,
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }

    #[test]
    fn checksum_is_pure_function_of_bytes() {
        let dir = temp_dir("pure");
        let a = dir.join("a.txt");
        let b = dir.join("b.txt");
        fs::write(&a, b"Hello, World!").unwrap();
        fs::write(&b, b"Hello, World!").unwrap();
        assert_eq!(file_checksum(&a).unwrap(), file_checksum(&b).unwrap());

        // single-bit flip
        fs::write(&b, b"Hello, World.").unwrap();
        assert_ne!(file_checksum(&a).unwrap(), file_checksum(&b).unwrap());
    }

    #[test]
    fn known_vector_hello_world() {
        let dir = temp_dir("vector");
        let path = dir.join("a.txt");
        fs::write(&path, b"Hello, World!").unwrap();
        assert_eq!(
            file_checksum(&path).unwrap(),
            "dffd6021bb2bd5b0af676290809ec3a53191dd81c7f70a4b28688a362182986"
        );
    }

    #[test]
    fn directory_metadata_is_relative_to_root() {
        let dir = temp_dir("walk");
        fs::create_dir_all(dir.join("sub")).unwrap();
        fs::write(dir.join("a.txt"), b"a").unwrap();
        fs::write(dir.join("sub").join("b.txt"), b"bb").unwrap();

        let meta = gather_directory_metadata(&dir, true);
        assert!(meta.contains_key("a.txt"));
        assert!(meta.contains_key("sub"));
        assert!(meta.contains_key("sub/b.txt") || meta.contains_key("sub\\b.txt"));
        assert_eq!(meta["sub"].checksum, "");
    }

    #[test]
    fn empty_directory_has_empty_metadata_map() {
        let dir = temp_dir("empty-dir");
        let meta = gather_directory_metadata(&dir, true);
        assert!(meta.is_empty());
    }
}
