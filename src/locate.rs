use std::path::{Path, PathBuf};

use crate::config::{ENGINE_PATH_ENV, ENGINE_SEARCH_PATHS};
use crate::error::SessionError;

/// Resolves the engine executable: explicit path, then the `SAS_PATH`
/// environment override, then the conventional install locations. An
/// explicit path or env override that is not executable is an error rather
/// than a fallthrough, since it indicates a misconfigured environment.
pub(crate) fn locate_engine(explicit: Option<&Path>) -> Result<PathBuf, SessionError> {
    if let Some(path) = explicit {
        if is_executable(path) {
            return Ok(path.to_path_buf());
        }
        return Err(SessionError::ExecutableNotFound);
    }

    if let Some(value) = std::env::var_os(ENGINE_PATH_ENV) {
        if !value.is_empty() {
            let path = PathBuf::from(value);
            if is_executable(&path) {
                return Ok(path);
            }
            return Err(SessionError::ExecutableNotFound);
        }
    }

    for candidate in ENGINE_SEARCH_PATHS {
        let path = Path::new(candidate);
        if is_executable(path) {
            return Ok(path.to_path_buf());
        }
    }

    Err(SessionError::ExecutableNotFound)
}

fn is_executable(path: &Path) -> bool {
    if !path.is_file() {
        return false;
    }

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::metadata(path)
            .map(|meta| meta.permissions().mode() & 0o111 != 0)
            .unwrap_or(false)
    }

    #[cfg(not(unix))]
    {
        true
    }
}
