//! Preparing a results directory for upload: names the bucket cannot hold
//! are escaped, and directories with too many files are compressed.

use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::OnceLock;

use regex::Regex;

use crate::error::{DispatchError, Result};

/// Characters the bucket rejects in object names.
pub const INVALID_GS_CHARS: [char; 5] = ['[', ']', '*', '?', '#'];

/// Inclusive code point ranges the bucket rejects.
pub const INVALID_GS_CHAR_RANGES: [(u32, u32); 3] = [(0x00, 0x1F), (0x7F, 0x84), (0x86, 0xFF)];

/// Folders left uncompressed so they stay browsable after upload.
pub const FOLDERS_NEVER_ZIP: [&str; 2] = ["debug", "ssp_logs"];

fn special_task_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"(^|/)hosts/[^/]+/\d+-[^/]+/?$").expect("special task pattern is valid")
    })
}

pub fn is_invalid_gs_char(c: char) -> bool {
    let code = c as u32;
    INVALID_GS_CHARS.contains(&c)
        || INVALID_GS_CHAR_RANGES
            .iter()
            .any(|&(lo, hi)| code >= lo && code <= hi)
}

/// Replace every rejected character with `%xx`.
pub fn get_sanitized_name(name: &str) -> String {
    let mut sanitized = String::with_capacity(name.len());
    for c in name.chars() {
        if is_invalid_gs_char(c) {
            sanitized.push_str(&format!("%{:02x}", c as u32));
        } else {
            sanitized.push(c);
        }
    }
    sanitized
}

/// Rename everything below `dir` to a sanitized name, deepest entries first.
pub fn sanitize_dir(dir: &Path) -> Result<()> {
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        if entry.file_type()?.is_dir() {
            sanitize_dir(&path)?;
        }
        let name = entry.file_name().to_string_lossy().into_owned();
        let sanitized = get_sanitized_name(&name);
        if sanitized != name {
            let target = dir.join(&sanitized);
            tracing::debug!(from = %path.display(), to = %target.display(), "Renaming invalid name");
            fs::rename(&path, &target)?;
        }
    }
    Ok(())
}

/// Number of entries under `dir`, counting `dir` itself.
pub fn count_entries(dir: &Path) -> Result<usize> {
    let mut count = 1;
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        if entry.file_type()?.is_dir() {
            count += count_entries(&entry.path())?;
        } else {
            count += 1;
        }
    }
    Ok(count)
}

fn zippable_folders(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut folders = Vec::new();
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let name = entry.file_name();
        if entry.file_type()?.is_dir()
            && !FOLDERS_NEVER_ZIP.contains(&name.to_string_lossy().as_ref())
        {
            folders.push(entry.path());
        }
    }
    folders.sort();
    Ok(folders)
}

/// Compress `folder` into `<folder>.tgz` next to it and remove the original.
pub fn compress_folder(folder: &Path) -> Result<PathBuf> {
    let (Some(parent), Some(name)) = (folder.parent(), folder.file_name()) else {
        return Err(DispatchError::Offload(format!(
            "cannot compress {}",
            folder.display()
        )));
    };
    let mut archive_name = name.to_os_string();
    archive_name.push(".tgz");
    let archive = parent.join(archive_name);

    let output = Command::new("tar")
        .arg("-czf")
        .arg(&archive)
        .arg("-C")
        .arg(parent)
        .arg(name)
        .output()?;
    if !output.status.success() {
        return Err(DispatchError::Offload(format!(
            "tar failed for {}: {}",
            folder.display(),
            String::from_utf8_lossy(&output.stderr).trim()
        )));
    }
    fs::remove_dir_all(folder)?;
    Ok(archive)
}

/// Compress result folders when `dir` holds `max_file_count` entries or more.
///
/// For a test job the folders one level below each host directory are
/// compressed so the job's own `debug` stays browsable; a special task is
/// compressed at its first level.
pub fn limit_file_count(dir: &Path, max_file_count: usize) -> Result<()> {
    let count = count_entries(dir)?;
    if count < max_file_count {
        return Ok(());
    }
    tracing::info!(
        dir = %dir.display(),
        count,
        limit = max_file_count,
        "Too many files, compressing result folders"
    );

    let is_special_task = special_task_pattern().is_match(&dir.to_string_lossy());
    let mut folders = zippable_folders(dir)?;
    if !is_special_task {
        let mut subfolders = Vec::new();
        for folder in &folders {
            subfolders.extend(zippable_folders(folder)?);
        }
        folders = subfolders;
    }

    for folder in folders {
        if let Err(e) = compress_folder(&folder) {
            tracing::warn!(folder = %folder.display(), error = %e, "Failed to compress folder");
        }
    }
    Ok(())
}
