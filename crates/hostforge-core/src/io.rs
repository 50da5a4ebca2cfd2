use crate::error::Result;
use regex::Regex;
use std::io::Write;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;
use tracing::{debug, info};

/// Atomically write `data` to `path` using a tempfile in the same directory.
/// Prevents partial writes from corrupting config files.
pub fn atomic_write(path: &Path, data: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let dir = path.parent().unwrap_or(Path::new("."));
    let mut tmp = NamedTempFile::new_in(dir)?;
    tmp.write_all(data)?;
    tmp.persist(path).map_err(|e| e.error)?;
    Ok(())
}

/// Create a directory and all parents, idempotent.
pub fn ensure_dir(path: &Path) -> Result<()> {
    std::fs::create_dir_all(path)?;
    Ok(())
}

pub fn set_mode(path: &Path, mode: u32) -> Result<()> {
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(mode))?;
    Ok(())
}

/// Copy an existing file to `<path>.backup.<YYYYmmdd_HHMMSS>` before it is
/// overwritten. Returns `None` (and logs) when there is nothing to back up.
///
/// Two backups within the same second get `.1`, `.2`, … suffixes so each
/// invocation leaves exactly one new backup.
pub fn backup_if_exists(path: &Path) -> Result<Option<PathBuf>> {
    if !path.is_file() {
        debug!(path = %path.display(), "no existing file, skipping backup");
        return Ok(None);
    }
    let stamp = chrono::Local::now().format("%Y%m%d_%H%M%S");
    let base = format!("{}.backup.{stamp}", path.display());
    let mut candidate = PathBuf::from(&base);
    let mut n = 1;
    while candidate.exists() {
        candidate = PathBuf::from(format!("{base}.{n}"));
        n += 1;
    }
    std::fs::copy(path, &candidate)?;
    info!(path = %path.display(), backup = %candidate.display(), "backed up");
    Ok(Some(candidate))
}

/// Write a config file, backing up any previous version first.
pub fn write_config_file(path: &Path, content: &str, mode: Option<u32>) -> Result<Option<PathBuf>> {
    let backup = backup_if_exists(path)?;
    atomic_write(path, content.as_bytes())?;
    if let Some(mode) = mode {
        set_mode(path, mode)?;
    }
    Ok(backup)
}

/// Set a `Key value` directive in sshd-style text.
///
/// Replaces the first line that sets `key`, commented out or not, and drops
/// any later uncommented duplicates. Appends the directive when no such line
/// exists. Applying the same directive twice yields the same text.
pub fn set_directive(content: &str, key: &str, value: &str) -> String {
    let pattern = format!(r"^\s*#?\s*{}\s+.*$", regex::escape(key));
    let re = Regex::new(&pattern).expect("escaped key is a valid pattern");
    let active = format!(r"^\s*{}\s+", regex::escape(key));
    let active = Regex::new(&active).expect("escaped key is a valid pattern");

    let directive = format!("{key} {value}");
    let mut out = Vec::new();
    let mut replaced = false;
    for line in content.lines() {
        if re.is_match(line) {
            if !replaced {
                out.push(directive.clone());
                replaced = true;
                continue;
            }
            if active.is_match(line) {
                continue;
            }
        }
        out.push(line.to_string());
    }
    if !replaced {
        out.push(directive);
    }
    finish(out)
}

/// Set `key = value` inside `[section]` of ini-style text.
///
/// A commented-out `;key =` or `#key =` line in the section is replaced in
/// place. Otherwise the key is added directly after the section header, and a
/// missing section is appended at the end.
pub fn set_ini_value(content: &str, section: &str, key: &str, value: &str) -> String {
    let pattern = format!(r"^\s*[;#]?\s*{}\s*=", regex::escape(key));
    let key_re = Regex::new(&pattern).expect("escaped key is a valid pattern");
    let header = format!("[{section}]");
    let setting = format!("{key} = {value}");

    let mut lines: Vec<String> = content.lines().map(str::to_string).collect();
    let Some(start) = lines.iter().position(|l| l.trim() == header) else {
        if lines.last().is_some_and(|l| !l.trim().is_empty()) {
            lines.push(String::new());
        }
        lines.push(header);
        lines.push(setting);
        return finish(lines);
    };
    let end = lines[start + 1..]
        .iter()
        .position(|l| l.trim_start().starts_with('['))
        .map(|i| start + 1 + i)
        .unwrap_or(lines.len());

    match (start + 1..end).find(|&i| key_re.is_match(&lines[i])) {
        Some(i) => lines[i] = setting,
        None => lines.insert(start + 1, setting),
    }
    finish(lines)
}

fn finish(lines: Vec<String>) -> String {
    let mut text = lines.join("\n");
    text.push('\n');
    text
}
