use async_trait::async_trait;
use common::{AccessMode, NfsVolumeSource, Object, PersistentVolume};
use log::{debug, info};
use std::io::{self, ErrorKind};
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use tokio::fs;

use super::{ProvisionError, ProvisionRequest, VolumeSource, VolumeStrategy};

/// File inside every provisioned directory holding the owning claim uid.
pub const OWNER_FILE: &str = ".rkp-claim";

const DIR_MODE: u32 = 0o755;

/// Provisions volumes as sub-directories of a locally mounted NFS export.
///
/// `mount_path` is where the export `server:server_path` is mounted on this
/// host. The volume of claim `x` lives at `mount_path/x` locally and is
/// published as `server:server_path/x`.
#[derive(Debug, Clone)]
pub struct NfsStrategy {
    name: String,
    server: String,
    server_path: PathBuf,
    mount_path: PathBuf,
}

impl NfsStrategy {
    pub fn new(
        name: impl Into<String>,
        server: impl Into<String>,
        server_path: impl Into<PathBuf>,
        mount_path: impl Into<PathBuf>,
    ) -> Self {
        Self {
            name: name.into(),
            server: server.into(),
            server_path: server_path.into(),
            mount_path: mount_path.into(),
        }
    }

    fn claim_dir(&self, claim_name: &str) -> Result<PathBuf, ProvisionError> {
        check_dir_name(claim_name)?;
        Ok(self.mount_path.join(claim_name))
    }

    async fn check_mount_root(&self) -> Result<(), ProvisionError> {
        match fs::metadata(&self.mount_path).await {
            Ok(meta) if meta.is_dir() => Ok(()),
            Ok(_) => Err(ProvisionError::Terminal(format!(
                "mount path {} is not a directory",
                self.mount_path.display()
            ))),
            Err(e) => Err(classify("stat mount path", &self.mount_path, e)),
        }
    }
}

#[async_trait]
impl VolumeStrategy for NfsStrategy {
    fn name(&self) -> &str {
        &self.name
    }

    fn supports_access_mode(&self, mode: AccessMode) -> bool {
        matches!(
            mode,
            AccessMode::ReadWriteOnce
                | AccessMode::ReadOnlyMany
                | AccessMode::ReadWriteMany
                | AccessMode::ReadWriteOncePod
        )
    }

    async fn provision(&self, request: ProvisionRequest<'_>) -> Result<VolumeSource, ProvisionError> {
        let claim_name = request.claim.name();
        let dir = self.claim_dir(claim_name)?;
        self.check_mount_root().await?;
        let uid = request.claim.metadata.uid.as_str();

        match fs::create_dir(&dir).await {
            Ok(()) => {
                fs::set_permissions(&dir, std::fs::Permissions::from_mode(DIR_MODE))
                    .await
                    .map_err(|e| classify("chmod", &dir, e))?;
                info!(
                    "Created directory {} for volume {}",
                    dir.display(),
                    request.volume_name
                );
            }
            Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                match read_owner(&dir).await? {
                    Some(owner) if owner == uid => {
                        debug!("Volume directory {} already provisioned", dir.display());
                        return Ok(self.source(claim_name));
                    }
                    Some(owner) => {
                        return Err(ProvisionError::Terminal(format!(
                            "{} belongs to claim uid {owner}, not {} ({uid})",
                            dir.display(),
                            claim_name
                        )));
                    }
                    // created by an attempt that died before recording the owner
                    None => debug!("Adopting unowned volume directory {}", dir.display()),
                }
            }
            Err(e) => return Err(classify("mkdir", &dir, e)),
        }

        let owner = dir.join(OWNER_FILE);
        fs::write(&owner, uid)
            .await
            .map_err(|e| classify("write owner file", &owner, e))?;
        Ok(self.source(claim_name))
    }

    async fn delete(&self, volume: &PersistentVolume) -> Result<(), ProvisionError> {
        let Some(claim_ref) = volume.spec.claim_ref.as_ref() else {
            return Err(ProvisionError::Terminal(format!(
                "volume {} has no claim reference",
                volume.name()
            )));
        };
        let dir = self.claim_dir(&claim_ref.name)?;
        let expected = claim_ref.uid.as_str();
        match read_owner(&dir).await {
            Ok(Some(owner)) if !expected.is_empty() && owner != expected => {
                return Err(ProvisionError::Terminal(format!(
                    "{} belongs to claim uid {owner}, refusing to delete it for {expected}",
                    dir.display()
                )));
            }
            Ok(_) => {}
            Err(e) => return Err(e),
        }
        match fs::remove_dir_all(&dir).await {
            Ok(()) => {
                info!("Removed volume directory {}", dir.display());
                Ok(())
            }
            Err(e) if e.kind() == ErrorKind::NotFound => {
                debug!("Volume directory {} already gone", dir.display());
                Ok(())
            }
            Err(e) => Err(classify("remove", &dir, e)),
        }
    }
}

impl NfsStrategy {
    fn source(&self, claim_name: &str) -> VolumeSource {
        VolumeSource::Nfs(NfsVolumeSource {
            server: self.server.clone(),
            path: self.server_path.join(claim_name).display().to_string(),
            read_only: false,
        })
    }
}

/// Owner uid recorded in `dir`, or `None` if the directory or file is missing.
async fn read_owner(dir: &Path) -> Result<Option<String>, ProvisionError> {
    let path = dir.join(OWNER_FILE);
    match fs::read_to_string(&path).await {
        Ok(owner) => Ok(Some(owner.trim().to_string())),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
        Err(e) => Err(classify("read owner file", &path, e)),
    }
}

fn check_dir_name(name: &str) -> Result<(), ProvisionError> {
    if name.is_empty()
        || name == "."
        || name == ".."
        || name.contains(['/', '\\', '\0'])
    {
        return Err(ProvisionError::Terminal(format!(
            "invalid volume directory name {name:?}"
        )));
    }
    Ok(())
}

fn classify(op: &str, path: &Path, err: io::Error) -> ProvisionError {
    let msg = format!("{op} {}: {err}", path.display());
    match err.kind() {
        ErrorKind::PermissionDenied
        | ErrorKind::ReadOnlyFilesystem
        | ErrorKind::InvalidInput
        | ErrorKind::NotADirectory => ProvisionError::Terminal(msg),
        // NotFound, StorageFull, ResourceBusy, Interrupted, TimedOut,
        // WouldBlock and anything unknown may clear up on their own
        _ => ProvisionError::Retryable(msg),
    }
}
