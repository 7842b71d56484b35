use std::path::{Path, PathBuf};

/// Total bytes of regular files under `root`, skipping `exclude`.
///
/// Walks with an explicit stack. Symlinks are counted as themselves and
///  never followed.
pub async fn directory_size(root: &Path, exclude: Option<&Path>) -> std::io::Result<u64> {
    let mut total = 0u64;
    let mut pending: Vec<PathBuf> = vec![root.to_path_buf()];

    while let Some(dir) = pending.pop() {
        let mut entries = tokio::fs::read_dir(&dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if exclude.is_some_and(|excluded| path == excluded) {
                continue;
            }
            let metadata = tokio::fs::symlink_metadata(&path).await?;
            if metadata.is_dir() {
                pending.push(path);
            } else if metadata.is_file() {
                total += metadata.len();
            }
        }
    }
    Ok(total)
}
