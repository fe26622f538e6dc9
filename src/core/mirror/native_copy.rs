use std::collections::HashSet;
use std::fs::{self, File};
use std::io::{self, BufReader, BufWriter, ErrorKind, Read, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use filetime::FileTime;
use nix::unistd::chown;
use tracing::{debug, error, info, info_span, warn};

use crate::core::mirror::{MirrorEngine, MirrorReport, ensure_source};
use crate::core::models::BackupTask;
use crate::core::ownership::BackupOwner;
use crate::error::MirrorError;
use crate::logging::LogThrottle;

/// Buffer size for file I/O operations (128KB)
const BUFFER_SIZE: usize = 128 * 1024;

/// Mirrors a tree with plain file I/O.
///
/// Unchanged files (same size and mtime) are skipped, entries that no
/// longer exist on the device are pruned from the target, and permissions
/// and timestamps are preserved.
pub struct NativeCopyEngine {
    /// fsync each copied file before moving on.
    pub sync_files: bool,
    pub owner: Option<BackupOwner>,
}

impl Default for NativeCopyEngine {
    fn default() -> Self {
        Self {
            sync_files: true,
            owner: None,
        }
    }
}

#[async_trait]
impl MirrorEngine for NativeCopyEngine {
    async fn mirror(&self, task: &BackupTask) -> Result<MirrorReport, MirrorError> {
        ensure_source(&task.source)?;

        let source = task.source.clone();
        let target = task.target.clone();
        let options = CopyOptions {
            sync_files: self.sync_files,
            owner: self.owner.clone(),
        };
        let span = info_span!(
            "native_mirror",
            device = %task.key,
            destination = %target.display()
        );

        tokio::task::spawn_blocking(move || {
            let _entered = span.enter();
            mirror_tree(&source, &target, &options)
        })
        .await?
    }
}

struct CopyOptions {
    sync_files: bool,
    owner: Option<BackupOwner>,
}

struct FileInfo {
    relative: PathBuf,
    size: u64,
    modified: FileTime,
}

#[derive(Default)]
struct ScanResult {
    files: Vec<FileInfo>,
    /// Parents before children.
    directories: Vec<PathBuf>,
    total_bytes: u64,
}

struct FileCopyError {
    message: String,
    is_device_removed: bool,
}

fn mirror_tree(source: &Path, target: &Path, options: &CopyOptions) -> Result<MirrorReport, MirrorError> {
    let start = Instant::now();
    info!("Starting native mirror");

    let mut scan = ScanResult::default();
    scan_directory(source, Path::new(""), &mut scan)?;
    info!(
        files = scan.files.len(),
        directories = scan.directories.len(),
        total_bytes = scan.total_bytes,
        "Scan complete"
    );

    fs::create_dir_all(target).map_err(|source| MirrorError::Prepare {
        path: target.to_path_buf(),
        source,
    })?;

    let keep_dirs: HashSet<&Path> = scan.directories.iter().map(PathBuf::as_path).collect();
    let keep_files: HashSet<&Path> = scan.files.iter().map(|f| f.relative.as_path()).collect();
    let files_removed = prune_stale(target, Path::new(""), &keep_dirs, &keep_files)?;

    for relative in &scan.directories {
        let dest = target.join(relative);
        fs::create_dir_all(&dest).map_err(|source| MirrorError::Prepare {
            path: dest.clone(),
            source,
        })?;
    }

    let throttle = LogThrottle::new(Duration::from_secs(2));
    let mut bytes_copied: u64 = 0;
    let mut files_copied: u64 = 0;
    let mut errors: Vec<(String, String)> = Vec::new();

    for file in &scan.files {
        let dest = target.join(&file.relative);
        let name = file.relative.display().to_string();

        if is_unchanged(&dest, file) {
            debug!(file = %name, "Unchanged, skipping");
            continue;
        }

        match copy_single_file(&source.join(&file.relative), &dest, options) {
            Ok(bytes) => {
                bytes_copied += bytes;
                files_copied += 1;
                if throttle.should_log() {
                    info!(bytes_copied, total_bytes = scan.total_bytes, file = %name, "Mirror progress");
                }
            }
            Err(e) if e.is_device_removed => {
                return Err(MirrorError::DeviceRemoved(format!("{} ({})", name, e.message)));
            }
            Err(e) => {
                error!(file = %name, error = %e.message, "Failed to copy file");
                errors.push((name, e.message));
            }
        }
    }

    // Directory modes last, a read-only source directory must not block its own files.
    for relative in scan.directories.iter().rev() {
        let dest = target.join(relative);
        if let Ok(metadata) = fs::metadata(source.join(relative)) {
            if let Err(e) = fs::set_permissions(&dest, metadata.permissions()) {
                debug!(dest = %dest.display(), error = %e, "Failed to set directory permissions");
            }
        }
        apply_owner(&dest, options.owner.as_ref());
    }

    if !errors.is_empty() {
        let mut summary = errors
            .iter()
            .take(10)
            .map(|(file, message)| format!("  - {}: {}", file, message))
            .collect::<Vec<_>>()
            .join("\n");
        if errors.len() > 10 {
            summary.push_str(&format!("\n  ... and {} more", errors.len() - 10));
        }
        return Err(MirrorError::Copy {
            count: errors.len(),
            summary,
        });
    }

    let report = MirrorReport {
        bytes_copied,
        files_copied,
        files_removed,
        duration_secs: start.elapsed().as_secs(),
    };
    info!(
        bytes_copied,
        files_copied,
        files_removed,
        duration_secs = report.duration_secs,
        "Native mirror complete"
    );
    Ok(report)
}

fn scan_directory(base: &Path, relative: &Path, scan: &mut ScanResult) -> Result<(), MirrorError> {
    let current = base.join(relative);
    let entries = match fs::read_dir(&current) {
        Ok(entries) => entries,
        // e.g. a root-only lost+found below the mountpoint
        Err(e) if e.kind() == ErrorKind::PermissionDenied && !relative.as_os_str().is_empty() => {
            warn!(path = %current.display(), "Skipping unreadable directory");
            return Ok(());
        }
        Err(e) => return Err(read_error(&current, e)),
    };

    for entry in entries {
        let entry = entry.map_err(|e| read_error(&current, e))?;
        let child = relative.join(entry.file_name());

        // symlink_metadata: links are not followed (and not mirrored)
        let metadata = match entry.path().symlink_metadata() {
            Ok(m) => m,
            Err(e) if is_device_removed_error(&e) => {
                return Err(MirrorError::DeviceRemoved(e.to_string()));
            }
            Err(e) => {
                warn!(path = %entry.path().display(), error = %e, "Skipping unreadable entry");
                continue;
            }
        };

        if metadata.is_dir() {
            scan.directories.push(child.clone());
            scan_directory(base, &child, scan)?;
        } else if metadata.is_file() {
            scan.total_bytes += metadata.len();
            scan.files.push(FileInfo {
                relative: child,
                size: metadata.len(),
                modified: FileTime::from_last_modification_time(&metadata),
            });
        }
    }

    Ok(())
}

fn read_error(path: &Path, e: io::Error) -> MirrorError {
    if is_device_removed_error(&e) {
        MirrorError::DeviceRemoved(format!("{}: {}", path.display(), e))
    } else {
        MirrorError::Prepare {
            path: path.to_path_buf(),
            source: e,
        }
    }
}

/// Remove target entries with no same-typed counterpart in the source.
fn prune_stale(
    target: &Path,
    relative: &Path,
    keep_dirs: &HashSet<&Path>,
    keep_files: &HashSet<&Path>,
) -> Result<u64, MirrorError> {
    let current = target.join(relative);
    let entries = fs::read_dir(&current).map_err(|source| MirrorError::Prepare {
        path: current.clone(),
        source,
    })?;
    let mut removed = 0;

    for entry in entries.flatten() {
        let child = relative.join(entry.file_name());
        let path = entry.path();
        let is_dir = path.symlink_metadata().map(|m| m.is_dir()).unwrap_or(false);

        let result = if is_dir && keep_dirs.contains(child.as_path()) {
            removed += prune_stale(target, &child, keep_dirs, keep_files)?;
            continue;
        } else if !is_dir && keep_files.contains(child.as_path()) {
            continue;
        } else if is_dir {
            fs::remove_dir_all(&path)
        } else {
            fs::remove_file(&path)
        };

        result.map_err(|source| MirrorError::Prepare {
            path: path.clone(),
            source,
        })?;
        debug!(path = %child.display(), "Removed stale entry");
        removed += 1;
    }

    Ok(removed)
}

fn is_unchanged(dest: &Path, file: &FileInfo) -> bool {
    match dest.symlink_metadata() {
        Ok(m) => {
            m.is_file()
                && m.len() == file.size
                && FileTime::from_last_modification_time(&m) == file.modified
        }
        Err(_) => false,
    }
}

fn copy_single_file(source: &Path, dest: &Path, options: &CopyOptions) -> Result<u64, FileCopyError> {
    let io_err = |what: &str, e: io::Error| FileCopyError {
        message: format!("{}: {}", what, e),
        is_device_removed: is_device_removed_error(&e),
    };

    let source_metadata = fs::metadata(source).map_err(|e| io_err("Failed to read source metadata", e))?;
    let mut reader = BufReader::with_capacity(
        BUFFER_SIZE,
        File::open(source).map_err(|e| io_err("Failed to open source file", e))?,
    );
    // Replace rather than truncate, the old copy may be read-only.
    if dest.symlink_metadata().is_ok() {
        let _ = fs::remove_file(dest);
    }
    let mut writer = BufWriter::with_capacity(
        BUFFER_SIZE,
        File::create(dest).map_err(|e| FileCopyError {
            // Target-side failures say nothing about the device.
            message: format!("Failed to create destination file: {}", e),
            is_device_removed: false,
        })?,
    );

    let mut buffer = vec![0u8; BUFFER_SIZE];
    let mut bytes_written: u64 = 0;

    loop {
        let n = reader
            .read(&mut buffer)
            .map_err(|e| io_err("Failed to read from source", e))?;
        if n == 0 {
            break;
        }
        writer.write_all(&buffer[..n]).map_err(|e| FileCopyError {
            message: format!("Failed to write to destination: {}", e),
            is_device_removed: false,
        })?;
        bytes_written += n as u64;
    }

    let file = writer.into_inner().map_err(|e| FileCopyError {
        message: format!("Failed to flush destination file: {}", e.error()),
        is_device_removed: false,
    })?;
    if options.sync_files {
        file.sync_all().map_err(|e| FileCopyError {
            message: format!("Failed to sync file: {}", e),
            is_device_removed: false,
        })?;
    }

    if let Err(e) = fs::set_permissions(dest, source_metadata.permissions()) {
        debug!(dest = %dest.display(), error = %e, "Failed to set file permissions");
    }

    let atime = FileTime::from_last_access_time(&source_metadata);
    let mtime = FileTime::from_last_modification_time(&source_metadata);
    if let Err(e) = filetime::set_file_times(dest, atime, mtime) {
        debug!(dest = %dest.display(), error = %e, "Failed to preserve timestamps");
    }

    apply_owner(dest, options.owner.as_ref());
    Ok(bytes_written)
}

fn apply_owner(path: &Path, owner: Option<&BackupOwner>) {
    if let Some(owner) = owner {
        if let Err(e) = chown(path, Some(owner.uid), Some(owner.gid)) {
            debug!(path = %path.display(), error = %e, "Failed to set ownership");
        }
    }
}

/// Whether an I/O error on the source side means the device went away.
fn is_device_removed_error(error: &io::Error) -> bool {
    match error.kind() {
        ErrorKind::NotFound | ErrorKind::BrokenPipe | ErrorKind::NotConnected => true,
        _ => matches!(
            error.raw_os_error(),
            Some(libc::EIO | libc::ENODEV | libc::ENXIO | libc::ENOMEDIUM | libc::EMEDIUMTYPE)
        ),
    }
}
