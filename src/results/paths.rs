//! Path containment rules for shared-storage result access.
//!
//! Result files are addressed by a client-supplied relative path, so every
//! access goes through these checks before the filesystem is touched. The
//! invariant: nothing outside `{storage_root}/{task_id}/` is ever opened.

use std::path::{Component, Path, PathBuf};

/// Rejects any client path that is absolute, contains `..`, or smuggles a
/// prefix/root component. `.` segments are tolerated.
pub fn validate_relative_path(file_path: &str) -> Result<(), String> {
    if file_path.is_empty() {
        return Err("result file path is empty".to_string());
    }
    if file_path.contains('\\') {
        return Err("invalid result file path".to_string());
    }

    let path = Path::new(file_path);
    if path.is_absolute() {
        return Err("result file path must be relative".to_string());
    }
    for component in path.components() {
        match component {
            Component::Normal(_) | Component::CurDir => {}
            Component::ParentDir | Component::RootDir | Component::Prefix(_) => {
                return Err("invalid result file path".to_string());
            }
        }
    }
    Ok(())
}

/// Task ids become directory names, so they get the same screening.
pub fn validate_task_dir_component(task_id: &str) -> Result<(), String> {
    if task_id.is_empty()
        || task_id.contains('/')
        || task_id.contains('\\')
        || task_id.contains("..")
    {
        return Err("invalid task identifier".to_string());
    }
    Ok(())
}

/// Joins a validated relative path under the task's result directory and
/// re-checks containment as a last line of defense.
pub fn resolve_task_file(
    storage_root: &Path,
    task_id: &str,
    file_path: &str,
) -> Result<PathBuf, String> {
    validate_task_dir_component(task_id)?;
    validate_relative_path(file_path)?;

    let task_dir = storage_root.join(task_id);
    let resolved = task_dir.join(file_path);
    if !resolved.starts_with(&task_dir) {
        return Err("invalid result file path".to_string());
    }
    Ok(resolved)
}
