//! File metadata exchanged in the transfer request and stored in journals.

use std::collections::HashMap;
use std::fs;
use std::os::unix::fs::{MetadataExt, OpenOptionsExt};
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{DraftError, Result};

/// POSIX-style status carried for every entry.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileStatus {
    pub mode: u32,
    pub uid: u32,
    pub gid: u32,
    pub dev: u64,
    #[serde(rename = "blksize")]
    pub blk_size: u64,
    #[serde(rename = "blocks")]
    pub blk_count: u64,
    pub size: u64,
}

impl FileStatus {
    pub fn is_regular(&self) -> bool {
        self.mode & libc::S_IFMT == libc::S_IFREG
    }

    pub fn is_dir(&self) -> bool {
        self.mode & libc::S_IFMT == libc::S_IFDIR
    }
}

/// One entry of a transfer: path relative to the transfer root, status, and
/// a 16-bit id unique within the transfer (1-based; 0 marks directories).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileInfo {
    pub path: String,

    /// Optional per-target suffix appended to the path on the receive side.
    #[serde(
        default,
        rename = "target_suffix",
        skip_serializing_if = "String::is_empty"
    )]
    pub target_suffix: String,

    pub status: FileStatus,

    pub id: u16,
}

fn status_of(path: &Path) -> Result<FileStatus> {
    let md = fs::symlink_metadata(path)?;

    Ok(FileStatus {
        mode: md.mode(),
        uid: md.uid(),
        gid: md.gid(),
        dev: md.dev(),
        blk_size: md.blksize(),
        blk_count: md.blocks(),
        size: md.len(),
    })
}

fn walk_dir(root: &Path, dir: &Path, next_id: &mut u16, out: &mut Vec<FileInfo>) -> Result<()> {
    let mut entries: Vec<_> = fs::read_dir(dir)?.collect::<std::io::Result<_>>()?;
    entries.sort_by_key(|e| e.file_name());

    for entry in entries {
        let path = entry.path();
        let status = status_of(&path)?;

        let rel = path
            .strip_prefix(root)
            .unwrap_or(&path)
            .to_string_lossy()
            .into_owned();

        let id = if status.is_dir() {
            0
        } else {
            *next_id += 1;
            *next_id
        };

        out.push(FileInfo {
            path: rel,
            target_suffix: String::new(),
            status,
            id,
        });

        if status.is_dir() {
            walk_dir(root, &path, next_id, out)?;
        }
    }

    Ok(())
}

/// Gather the file set for a transfer rooted at `path`.
///
/// A single file yields one entry named after the file; a directory yields
/// every entry beneath it, sorted per directory for a deterministic id
/// assignment. Ids count non-directories from 1.
pub fn scan(path: &Path) -> Result<Vec<FileInfo>> {
    if !path.exists() {
        tracing::warn!(path = %path.display(), "scan: path does not exist");
        return Ok(Vec::new());
    }

    let status = status_of(path)?;

    if !status.is_dir() {
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| path.to_string_lossy().into_owned());

        return Ok(vec![FileInfo {
            path: name,
            target_suffix: String::new(),
            status,
            id: 1,
        }]);
    }

    let mut out = Vec::new();
    let mut next_id = 0u16;
    walk_dir(path, path, &mut next_id, &mut out)?;

    Ok(out)
}

/// Resolve an announced path under the receiver's root.
pub fn rooted_path(root: &Path, path: &str, suffix: &str) -> PathBuf {
    let mut name = String::with_capacity(path.len() + suffix.len());
    name.push_str(path);
    name.push_str(suffix);

    root.join(name)
}

/// A destination file created for an incoming transfer.
#[derive(Debug)]
pub struct TargetFile {
    pub path: PathBuf,
    pub file: std::sync::Arc<fs::File>,
    /// Size announced by the sender; the file is truncated back to this
    /// after block-aligned writes.
    pub size: u64,
}

/// Allocate backing blocks for the first `len` bytes of `file`.
pub(crate) fn preallocate(file: &fs::File, len: u64) -> Result<()> {
    let err = unsafe { libc::posix_fallocate(file.as_raw_fd(), 0, len as libc::off_t) };

    if err != 0 {
        return Err(DraftError::Io(std::io::Error::from_raw_os_error(err)));
    }

    Ok(())
}

/// Materialize every announced regular file under `root` at its full size.
///
/// Returns the `file_id -> TargetFile` map used by the writer and the final
/// truncate pass.
pub fn create_target_files(
    root: &Path,
    infos: &[FileInfo],
    direct_io: bool,
) -> Result<HashMap<u16, TargetFile>> {
    let mut map = HashMap::new();

    for info in infos {
        if !info.status.is_regular() {
            continue;
        }

        let path = rooted_path(root, &info.path, &info.target_suffix);

        tracing::info!(id = info.id, path = %path.display(), size = info.status.size,
            "creating target file");

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        let mut opts = fs::OpenOptions::new();
        opts.read(true)
            .write(true)
            .create(true)
            .mode(info.status.mode & 0o777);
        if direct_io {
            opts.custom_flags(libc::O_DIRECT);
        }

        let file = opts.open(&path)?;

        if info.status.size > 0 {
            preallocate(&file, info.status.size)?;
        }

        map.insert(
            info.id,
            TargetFile {
                path,
                file: std::sync::Arc::new(file),
                size: info.status.size,
            },
        );
    }

    Ok(map)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_scan_single_file() {
        let tmp = TempDir::new().unwrap();
        let file = tmp.path().join("data.bin");
        fs::write(&file, vec![0x55u8; 100]).unwrap();

        let infos = scan(&file).unwrap();
        assert_eq!(infos.len(), 1);
        assert_eq!(infos[0].path, "data.bin");
        assert_eq!(infos[0].id, 1);
        assert_eq!(infos[0].status.size, 100);
        assert!(infos[0].status.is_regular());
    }

    #[test]
    fn test_scan_tree_assigns_ids() {
        let tmp = TempDir::new().unwrap();
        fs::create_dir_all(tmp.path().join("a/c")).unwrap();
        fs::write(tmp.path().join("a/b.txt"), "hello").unwrap();
        fs::write(tmp.path().join("a/c/d.bin"), vec![0u8; 4096]).unwrap();

        let infos = scan(tmp.path()).unwrap();

        let dirs: Vec<_> = infos.iter().filter(|i| i.status.is_dir()).collect();
        let files: Vec<_> = infos.iter().filter(|i| i.status.is_regular()).collect();

        assert_eq!(dirs.len(), 2);
        assert!(dirs.iter().all(|d| d.id == 0));

        assert_eq!(files.len(), 2);
        let mut ids: Vec<_> = files.iter().map(|f| f.id).collect();
        ids.sort_unstable();
        assert_eq!(ids, vec![1, 2]);

        assert!(files.iter().any(|f| f.path == "a/b.txt"));
        assert!(files.iter().any(|f| f.path == "a/c/d.bin"));
    }

    #[test]
    fn test_scan_missing_path_is_empty() {
        let tmp = TempDir::new().unwrap();
        let infos = scan(&tmp.path().join("nope")).unwrap();
        assert!(infos.is_empty());
    }

    #[test]
    fn test_create_target_files() {
        let tmp = TempDir::new().unwrap();

        let infos = vec![
            FileInfo {
                path: "x/y.bin".to_string(),
                status: FileStatus {
                    mode: libc::S_IFREG | 0o644,
                    size: 8192,
                    ..Default::default()
                },
                id: 1,
                ..Default::default()
            },
            FileInfo {
                path: "x".to_string(),
                status: FileStatus {
                    mode: libc::S_IFDIR | 0o755,
                    ..Default::default()
                },
                id: 0,
                ..Default::default()
            },
        ];

        let map = create_target_files(tmp.path(), &infos, false).unwrap();
        assert_eq!(map.len(), 1);

        let target = &map[&1];
        assert_eq!(target.size, 8192);
        assert_eq!(fs::metadata(&target.path).unwrap().len(), 8192);
    }

    #[test]
    fn test_rooted_path_applies_suffix() {
        let p = rooted_path(Path::new("/tmp/rx"), "a/b.txt", ".part");
        assert_eq!(p, PathBuf::from("/tmp/rx/a/b.txt.part"));
    }
}
