//! Disk usage of a mounted volume.

use std::collections::HashSet;
use std::io;
use std::os::unix::fs::MetadataExt;
use std::path::Path;

use walkdir::WalkDir;

use crate::types::Usage;

/// Size of the unit `st_blocks` is counted in.
const BLOCK_SIZE: i64 = 512;

/// Allocated bytes and distinct inodes below `root`, `root` included.
///
/// Hard links are counted once.
///
/// # Errors
///
/// Fails if any entry cannot be read.
pub fn disk_usage(root: &Path) -> io::Result<Usage> {
    let mut seen = HashSet::new();
    let mut usage = Usage::default();

    for entry in WalkDir::new(root) {
        let entry = entry.map_err(io::Error::other)?;
        let metadata = entry.metadata().map_err(io::Error::other)?;
        if !seen.insert((metadata.dev(), metadata.ino())) {
            continue;
        }
        usage.inodes += 1;
        usage.size += i64::try_from(metadata.blocks())
            .unwrap_or(i64::MAX / BLOCK_SIZE)
            .saturating_mul(BLOCK_SIZE);
    }

    Ok(usage)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counts_written_bytes() {
        let dir = tempfile::tempdir().unwrap();
        let empty = disk_usage(dir.path()).unwrap();
        assert_eq!(empty.inodes, 1);

        std::fs::write(dir.path().join("data"), vec![0xa5_u8; 64 * 1024]).unwrap();
        let full = disk_usage(dir.path()).unwrap();
        assert_eq!(full.inodes, 2);
        assert!(full.size >= empty.size + 64 * 1024);
    }

    #[test]
    fn hard_links_count_once() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("file");
        std::fs::write(&file, vec![1_u8; 8192]).unwrap();
        let before = disk_usage(dir.path()).unwrap();

        std::fs::hard_link(&file, dir.path().join("link")).unwrap();
        assert_eq!(disk_usage(dir.path()).unwrap(), before);
    }
}
