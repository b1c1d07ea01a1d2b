//! Atomic installation of certificate material
//!
//! Every file is written to a sibling temporary path, flushed to disk and
//! permissioned, then renamed over the final path. A reader either sees the
//! previous file or the complete new one.

use chrono::Utc;
use std::fs::{self, OpenOptions};
use std::io::{self, ErrorKind, Write};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, warn};

use crate::inspect::{inspect_pem, InspectError};

/// Private keys: owner read/write only
pub const KEY_MODE: u32 = 0o600;
/// Certificates and chains: world readable
pub const CERT_MODE: u32 = 0o644;

const TEMP_SUFFIX: &str = ".tmp";
const BACKUP_SUFFIX: &str = ".bak";

#[derive(Error, Debug)]
pub enum InstallError {
    #[error("Failed to write {}: {source}", path.display())]
    Write {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("Failed to set permissions on {}: {source}", path.display())]
    Permissions {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("Failed to promote {} to {}: {source}", from.display(), to.display())]
    Rename {
        from: PathBuf,
        to: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("Refusing to install invalid certificate: {0}")]
    InvalidCertificate(#[from] InspectError),
}

/// Temporary sibling used while `path` is being written
pub fn temp_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(TEMP_SUFFIX);
    PathBuf::from(name)
}

fn backup_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(BACKUP_SUFFIX);
    PathBuf::from(name)
}

/// Set unix permission bits on `path`
pub fn set_permissions(path: &Path, mode: u32) -> Result<(), InstallError> {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(path, fs::Permissions::from_mode(mode)).map_err(|source| {
            InstallError::Permissions {
                path: path.to_path_buf(),
                source,
            }
        })?;
    }
    #[cfg(not(unix))]
    let _ = (path, mode);

    Ok(())
}

/// Atomically replace `path` with `content`, leaving it with `mode`
pub fn write_atomic(path: &Path, content: &[u8], mode: u32) -> Result<(), InstallError> {
    let temp = write_temp(path, content, mode)?;
    promote(&temp, path)
}

/// Atomically install a certificate and its private key
///
/// The certificate is parsed before anything touches the disk. Both
/// temporary files are complete and permissioned before either rename, so
/// the key is never visible under its final name with loose permissions.
/// If the key cannot be promoted, the previous certificate is put back so
/// the pair on disk never mixes old and new material.
pub fn install_pair(
    cert_path: &Path,
    key_path: &Path,
    cert_pem: &str,
    key_pem: &str,
) -> Result<(), InstallError> {
    inspect_pem(cert_pem.as_bytes(), Utc::now())?;

    let temp_cert = write_temp(cert_path, cert_pem.as_bytes(), CERT_MODE)?;
    let temp_key = match write_temp(key_path, key_pem.as_bytes(), KEY_MODE) {
        Ok(temp) => temp,
        Err(e) => {
            discard(&temp_cert);
            return Err(e);
        }
    };

    let backup = match keep_previous(cert_path) {
        Ok(backup) => backup,
        Err(e) => {
            discard(&temp_cert);
            discard(&temp_key);
            return Err(e);
        }
    };

    if let Err(e) = promote(&temp_cert, cert_path) {
        discard(&temp_key);
        if let Some(backup) = &backup {
            discard(backup);
        }
        return Err(e);
    }
    if let Err(e) = promote(&temp_key, key_path) {
        restore_previous(cert_path, backup.as_deref());
        return Err(e);
    }
    if let Some(backup) = &backup {
        discard(backup);
    }

    debug!(
        cert_path = %cert_path.display(),
        key_path = %key_path.display(),
        "Installed certificate and key"
    );
    Ok(())
}

fn write_temp(path: &Path, content: &[u8], mode: u32) -> Result<PathBuf, InstallError> {
    let temp = temp_path(path);
    let write_err = |source| InstallError::Write {
        path: temp.clone(),
        source,
    };

    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent).map_err(|source| InstallError::Write {
            path: parent.to_path_buf(),
            source,
        })?;
    }

    // A leftover from an interrupted run may carry looser permissions.
    match fs::remove_file(&temp) {
        Ok(()) => debug!(path = %temp.display(), "Removed stale temporary file"),
        Err(e) if e.kind() == ErrorKind::NotFound => {}
        Err(e) => return Err(write_err(e)),
    }

    let mut options = OpenOptions::new();
    options.write(true).create_new(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(mode);
    }

    let mut file = options.open(&temp).map_err(write_err)?;
    file.write_all(content).map_err(write_err)?;
    file.sync_all().map_err(write_err)?;
    drop(file);

    // Creation mode is filtered by the umask.
    if let Err(e) = set_permissions(&temp, mode) {
        discard(&temp);
        return Err(e);
    }

    Ok(temp)
}

fn promote(temp: &Path, path: &Path) -> Result<(), InstallError> {
    fs::rename(temp, path).map_err(|source| {
        discard(temp);
        InstallError::Rename {
            from: temp.to_path_buf(),
            to: path.to_path_buf(),
            source,
        }
    })?;

    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        sync_dir(parent);
    }
    Ok(())
}

/// Hard-link the current certificate aside so it can be restored
fn keep_previous(path: &Path) -> Result<Option<PathBuf>, InstallError> {
    if !path.exists() {
        return Ok(None);
    }
    let backup = backup_path(path);
    discard(&backup);
    fs::hard_link(path, &backup).map_err(|source| InstallError::Write {
        path: backup.clone(),
        source,
    })?;
    Ok(Some(backup))
}

fn restore_previous(path: &Path, backup: Option<&Path>) {
    let restored = match backup {
        Some(backup) => fs::rename(backup, path),
        None => fs::remove_file(path),
    };
    match restored {
        Ok(()) => warn!(path = %path.display(), "Key install failed, certificate rolled back"),
        Err(e) => warn!(path = %path.display(), error = %e, "Failed to roll back certificate"),
    }
}

fn sync_dir(dir: &Path) {
    #[cfg(unix)]
    {
        if let Err(e) = fs::File::open(dir).and_then(|d| d.sync_all()) {
            warn!(dir = %dir.display(), error = %e, "Failed to sync directory after rename");
        }
    }
    #[cfg(not(unix))]
    let _ = dir;
}

fn discard(temp: &Path) {
    if let Err(e) = fs::remove_file(temp) {
        if e.kind() != ErrorKind::NotFound {
            warn!(path = %temp.display(), error = %e, "Failed to remove temporary file");
        }
    }
}
