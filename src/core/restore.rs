use std::path::{Path, PathBuf};

use tracing::{info, warn};

use crate::error::RestoreError;

/// Suffix appended to a subtitle before its timeline was rewritten.
pub const BACKUP_SUFFIX: &str = ".csf-bk";

/// Put every `*.csf-bk` backup under `roots` back in place of the subtitle it
/// was taken from. Returns how many were restored.
pub async fn restore_timeline_backups(roots: Vec<PathBuf>) -> Result<usize, RestoreError> {
    info!(roots = roots.len(), "Restoring subtitle timeline backups");
    let restored = tokio::task::spawn_blocking(move || {
        let mut restored = 0;
        for root in &roots {
            let mut backups = Vec::new();
            collect_backups(root, &mut backups)?;
            for backup in backups {
                match restore_one(&backup) {
                    Ok(target) => {
                        info!(from = %backup.display(), to = %target.display(), "Subtitle restored");
                        restored += 1;
                    }
                    Err(e) => warn!(path = %backup.display(), error = %e, "Could not restore subtitle backup"),
                }
            }
        }
        Ok::<_, RestoreError>(restored)
    })
    .await??;
    info!(restored, "Timeline backup restore finished");
    Ok(restored)
}

fn collect_backups(dir: &Path, out: &mut Vec<PathBuf>) -> Result<(), RestoreError> {
    let read_err = |source| RestoreError::ReadDir {
        path: dir.to_path_buf(),
        source,
    };
    for entry in std::fs::read_dir(dir).map_err(read_err)? {
        let entry = entry.map_err(read_err)?;
        let path = entry.path();
        if entry.file_type().map_err(read_err)?.is_dir() {
            collect_backups(&path, out)?;
        } else if path
            .file_name()
            .and_then(|n| n.to_str())
            .is_some_and(|n| n.len() > BACKUP_SUFFIX.len() && n.ends_with(BACKUP_SUFFIX))
        {
            out.push(path);
        }
    }
    Ok(())
}

fn restore_one(backup: &Path) -> std::io::Result<PathBuf> {
    let name = backup
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default();
    let original = backup.with_file_name(name.strip_suffix(BACKUP_SUFFIX).unwrap_or(&name));
    std::fs::copy(backup, &original)?;
    std::fs::remove_file(backup)?;
    Ok(original)
}
