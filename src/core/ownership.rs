use nix::unistd::{Gid, Group, Uid, User};
use std::os::unix::fs::MetadataExt;
use std::path::Path;
use tracing::{debug, warn};

/// The account that should own mirrored files.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackupOwner {
    pub user: String,
    pub group: String,
    pub uid: Uid,
    pub gid: Gid,
}

impl BackupOwner {
    /// Format as "user:group" for rsync's --chown
    pub fn as_chown_arg(&self) -> String {
        format!("{}:{}", self.user, self.group)
    }
}

/// Decide who should own the mirrored files.
///
/// Only relevant when the daemon runs as root; otherwise files are owned by
/// the daemon's own user and this returns None. Detection order:
/// 1. `SUDO_USER`
/// 2. owner of the backup directory
pub fn resolve_backup_owner(backup_dir: &Path) -> Option<BackupOwner> {
    if !Uid::effective().is_root() {
        return None;
    }

    if let Some(owner) = owner_from_sudo_user() {
        debug!(user = %owner.user, group = %owner.group, "Backup owner from SUDO_USER");
        return Some(owner);
    }

    match owner_of_path(backup_dir) {
        Some(owner) if !owner.uid.is_root() => {
            debug!(
                user = %owner.user,
                group = %owner.group,
                path = %backup_dir.display(),
                "Backup owner from backup directory"
            );
            Some(owner)
        }
        Some(_) => None,
        None => {
            warn!(path = %backup_dir.display(), "Could not determine backup owner, mirrored files stay owned by root");
            None
        }
    }
}

fn owner_from_sudo_user() -> Option<BackupOwner> {
    let name = std::env::var("SUDO_USER").ok().filter(|n| !n.is_empty())?;
    let user = User::from_name(&name).ok()??;
    let group = Group::from_gid(user.gid).ok()??;

    Some(BackupOwner {
        user: user.name,
        group: group.name,
        uid: user.uid,
        gid: group.gid,
    })
}

fn owner_of_path(path: &Path) -> Option<BackupOwner> {
    let metadata = std::fs::metadata(path).ok()?;
    let user = User::from_uid(Uid::from_raw(metadata.uid())).ok()??;
    let group = Group::from_gid(Gid::from_raw(metadata.gid())).ok()??;

    Some(BackupOwner {
        user: user.name,
        group: group.name,
        uid: user.uid,
        gid: group.gid,
    })
}
