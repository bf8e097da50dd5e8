// Filesystem helpers used by render jobs to prepare and clean up output
// locations.

use super::{required_str, CommandContext, CommandHandler, CommandOutcome, Settings};
use async_trait::async_trait;
use chrono::{DateTime, Local};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tokio::fs;

/// Format of the modification time appended by `move_out_of_way`.
const MTIME_FORMAT: &str = "%Y-%m-%d_%H%M%S";

/// `move_out_of_way { src }`: renames an existing path to `<src>-<mtime>`
/// so a fresh render can be written to `src`. A missing `src` is fine.
pub struct MoveOutOfWayCommand;

/// `copy_file { src, dest }`: copies a file, creating the destination's
/// parent directories.
pub struct CopyFileCommand;

/// `remove_tree { path }`: removes a file or directory tree. A missing path
/// is fine.
pub struct RemoveTreeCommand;

/// `create_directory { path }`: creates a directory and its parents.
pub struct CreateDirectoryCommand;

async fn exists(path: &Path) -> bool {
    fs::symlink_metadata(path).await.is_ok()
}

/// First free `<src>-<stamp>` name, adding `-2`, `-3`, ... on collisions.
async fn out_of_way_target(src: &Path, stamp: &str) -> PathBuf {
    let base = format!("{}-{}", src.display(), stamp);
    let mut candidate = PathBuf::from(&base);
    let mut n = 2u32;
    while exists(&candidate).await {
        candidate = PathBuf::from(format!("{base}-{n}"));
        n += 1;
    }
    candidate
}

#[async_trait]
impl CommandHandler for MoveOutOfWayCommand {
    async fn execute(&self, settings: &Settings, context: &CommandContext) -> CommandOutcome {
        let src = match required_str(settings, "src") {
            Ok(src) => PathBuf::from(src),
            Err(reason) => return CommandOutcome::failed(reason),
        };

        let metadata = match fs::symlink_metadata(&src).await {
            Ok(metadata) => metadata,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                context.log(format!("{} does not exist, nothing to move", src.display()));
                return CommandOutcome::success();
            }
            Err(e) => return CommandOutcome::failed(format!("cannot stat {}: {e}", src.display())),
        };

        let stamp = match metadata.modified() {
            Ok(mtime) => DateTime::<Local>::from(mtime).format(MTIME_FORMAT).to_string(),
            Err(_) => Local::now().format(MTIME_FORMAT).to_string(),
        };
        let target = out_of_way_target(&src, &stamp).await;

        context.log(format!("Moving {} to {}", src.display(), target.display()));
        match fs::rename(&src, &target).await {
            Ok(()) => CommandOutcome::success_with(target.display().to_string()),
            Err(e) => CommandOutcome::failed(format!(
                "cannot move {} to {}: {e}",
                src.display(),
                target.display()
            )),
        }
    }
}

#[async_trait]
impl CommandHandler for CopyFileCommand {
    async fn execute(&self, settings: &Settings, context: &CommandContext) -> CommandOutcome {
        let (src, dest) = match (required_str(settings, "src"), required_str(settings, "dest")) {
            (Ok(src), Ok(dest)) => (PathBuf::from(src), PathBuf::from(dest)),
            (Err(reason), _) | (_, Err(reason)) => return CommandOutcome::failed(reason),
        };

        if let Some(parent) = dest.parent().filter(|p| !p.as_os_str().is_empty()) {
            if let Err(e) = fs::create_dir_all(parent).await {
                return CommandOutcome::failed(format!("cannot create {}: {e}", parent.display()));
            }
        }

        context.log(format!("Copying {} to {}", src.display(), dest.display()));
        match fs::copy(&src, &dest).await {
            Ok(bytes) => CommandOutcome::success_with(format!("copied {bytes} bytes")),
            Err(e) => CommandOutcome::failed(format!(
                "cannot copy {} to {}: {e}",
                src.display(),
                dest.display()
            )),
        }
    }
}

#[async_trait]
impl CommandHandler for RemoveTreeCommand {
    async fn execute(&self, settings: &Settings, context: &CommandContext) -> CommandOutcome {
        let path = match required_str(settings, "path") {
            Ok(path) => PathBuf::from(path),
            Err(reason) => return CommandOutcome::failed(reason),
        };

        let result = match fs::symlink_metadata(&path).await {
            Err(e) if e.kind() == ErrorKind::NotFound => {
                context.log(format!("{} does not exist, nothing to remove", path.display()));
                return CommandOutcome::success();
            }
            Err(e) => Err(e),
            Ok(metadata) if metadata.is_dir() => fs::remove_dir_all(&path).await,
            Ok(_) => fs::remove_file(&path).await,
        };

        match result {
            Ok(()) => {
                context.log(format!("Removed {}", path.display()));
                CommandOutcome::success()
            }
            Err(e) => CommandOutcome::failed(format!("cannot remove {}: {e}", path.display())),
        }
    }
}

#[async_trait]
impl CommandHandler for CreateDirectoryCommand {
    async fn execute(&self, settings: &Settings, context: &CommandContext) -> CommandOutcome {
        let path = match required_str(settings, "path") {
            Ok(path) => PathBuf::from(path),
            Err(reason) => return CommandOutcome::failed(reason),
        };

        match fs::create_dir_all(&path).await {
            Ok(()) => {
                context.log(format!("Created {}", path.display()));
                CommandOutcome::success()
            }
            Err(e) => CommandOutcome::failed(format!("cannot create {}: {e}", path.display())),
        }
    }
}
