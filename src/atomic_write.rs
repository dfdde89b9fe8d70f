//! Write-then-rename helper shared by the task store, settings store, sync
//! worker and STRM worker (spec.md §9: "Atomic writes consistently use
//! write-temp-then-rename; callers must never assume the target filesystem
//! supports directory-level atomicity, only same-directory rename
//! atomicity.").

use std::io;
use std::path::Path;

/// Writes `contents` to `path` via a sibling temp file, then renames it into
/// place. The temp file lives in the same directory as `path` so the final
/// rename is atomic on POSIX and NTFS.
pub fn write_atomic(path: &Path, contents: &[u8]) -> io::Result<()> {
    let tmp_path = temp_path_for(path);
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(&tmp_path, contents)?;
    std::fs::rename(&tmp_path, path)?;
    Ok(())
}

pub async fn write_atomic_async(path: &Path, contents: Vec<u8>) -> io::Result<()> {
    let tmp_path = temp_path_for(path);
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    tokio::fs::write(&tmp_path, &contents).await?;
    tokio::fs::rename(&tmp_path, path).await?;
    Ok(())
}

fn temp_path_for(path: &Path) -> std::path::PathBuf {
    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| "tmp".to_string());
    path.with_file_name(format!("{file_name}.tmp"))
}

/// The suffix used for in-progress copy destinations in the sync worker
/// (spec.md §4.3: `<name>.cgpart`).
pub const PART_SUFFIX: &str = ".cgpart";

pub fn part_path_for(dest: &Path) -> std::path::PathBuf {
    let file_name = dest
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default();
    dest.with_file_name(format!("{file_name}{PART_SUFFIX}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn write_atomic_leaves_no_temp_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("doc.json");
        write_atomic(&path, b"{}").unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "{}");
        assert!(!temp_path_for(&path).exists());
    }

    #[test]
    fn part_path_appends_suffix() {
        let p = Path::new("/a/b/movie.mkv");
        assert_eq!(part_path_for(p), Path::new("/a/b/movie.mkv.cgpart"));
    }
}
