use std::path::PathBuf;

use super::StorageError;

/// Expands a leading `~` or `$HOME` against the `HOME` environment variable.
pub(crate) fn expand_home_path(raw_path: &str) -> Result<PathBuf, StorageError> {
    let suffix = if raw_path == "~" || raw_path == "$HOME" {
        Some("")
    } else {
        raw_path
            .strip_prefix("~/")
            .or_else(|| raw_path.strip_prefix("$HOME/"))
    };

    let Some(suffix) = suffix else {
        return Ok(PathBuf::from(raw_path));
    };

    let home = std::env::var_os("HOME")
        .filter(|home| !home.is_empty())
        .ok_or(StorageError::HomeDirectoryUnavailable)?;
    let base = PathBuf::from(home);
    Ok(if suffix.is_empty() { base } else { base.join(suffix) })
}
