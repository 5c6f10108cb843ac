//! On-disk storage of PEM material
//!
//! Files are written atomically:
//! 1. Write to a temporary sibling with a `.tmp` suffix
//! 2. fsync
//! 3. Rename over the target (atomic on POSIX)
//!
//! Private keys are created `0600`, certificates `0644`.

use std::fs::OpenOptions;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};

use crate::error::{PkiError, Result};

/// Whether a file holds secret material
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileKind {
    /// Private key, owner read/write only
    PrivateKey,
    /// Certificate, world readable
    Certificate,
}

impl FileKind {
    #[cfg(unix)]
    fn mode(self) -> u32 {
        match self {
            FileKind::PrivateKey => 0o600,
            FileKind::Certificate => 0o644,
        }
    }
}

fn temp_path(target: &Path) -> PathBuf {
    let mut name = target
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(".tmp");
    target.with_file_name(name)
}

/// Write `content` to `target` atomically, creating parent directories
pub fn write_atomic(target: &Path, content: &[u8], kind: FileKind) -> Result<()> {
    if let Some(parent) = target.parent() {
        std::fs::create_dir_all(parent).map_err(|e| PkiError::io("create directory", parent, e))?;
    }

    let tmp = temp_path(target);
    let mut options = OpenOptions::new();
    options.write(true).create(true).truncate(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(kind.mode());
    }

    let mut file = options
        .open(&tmp)
        .map_err(|e| PkiError::io("create", &tmp, e))?;
    file.write_all(content)
        .map_err(|e| PkiError::io("write", &tmp, e))?;
    file.sync_all().map_err(|e| PkiError::io("sync", &tmp, e))?;

    // mode() only applies when the file is created, so reset it for stale temp files
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(&tmp, std::fs::Permissions::from_mode(kind.mode()))
            .map_err(|e| PkiError::io("set permissions on", &tmp, e))?;
    }

    std::fs::rename(&tmp, target).map_err(|e| PkiError::io("rename", target, e))?;
    tracing::debug!(path = %target.display(), ?kind, "wrote PKI file");
    Ok(())
}

/// Read a PEM file, returning `None` if it does not exist
pub fn read_if_exists(path: &Path) -> Result<Option<String>> {
    match std::fs::read_to_string(path) {
        Ok(content) => Ok(Some(content)),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
        Err(e) => Err(PkiError::io("read", path, e)),
    }
}
