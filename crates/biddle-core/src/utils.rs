use std::env;
use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use chrono::Local;

use crate::error::{IoContext, Result};

pub const LOG_FILE: &str = "logs.txt";
pub const HOME_ENV: &str = "BIDDLE_HOME";
pub const DEFAULT_FILE_NAME: &str = "download.xxx";

/// Characters stripped from package names and derived file names.
const UNSAFE_NAME_CHARS: &[char] = &['+', '<', '>', ':', '"', '|', '?', '*', '%'];

/// Returns the tool home. Uses BIDDLE_HOME if set; otherwise ~/.biddle
pub fn home_dir() -> PathBuf {
    if let Ok(dir) = env::var(HOME_ENV) {
        if !dir.trim().is_empty() {
            return PathBuf::from(dir);
        }
    }
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".biddle")
}

pub fn init_home(home: &Path) -> io::Result<()> {
    std::fs::create_dir_all(home)?;

    let log_path = home.join(LOG_FILE);
    if !log_path.exists() {
        File::create(&log_path)?;
    }

    Ok(())
}

pub fn is_quiet() -> bool {
    if env::var("BIDDLE_QUIET")
        .map(|v| v == "1" || v == "true")
        .unwrap_or(false)
    {
        return true;
    }
    env::var("BIDDLE_LOG")
        .map(|v| v.to_lowercase() == "quiet" || v.to_lowercase() == "error")
        .unwrap_or(false)
}

pub fn log(message: &str) {
    let timestamp = Local::now().format("%Y-%m-%d %H:%M:%S");
    let log_message = format!("[{}] {}", timestamp, message);

    if !is_quiet() {
        println!("{}", log_message);
    }

    // Append-only; a missing home just means no log file yet.
    let log_path = home_dir().join(LOG_FILE);
    if let Ok(mut file) = OpenOptions::new().create(true).append(true).open(&log_path) {
        let _ = writeln!(file, "{}", log_message);
    }
}

pub fn log_error(message: &str) {
    eprintln!("{}", message);
    log(message);
}

/// Remove `+ < > : " | ? * %` and whitespace.
pub fn sanitize_name(raw: &str) -> String {
    raw.chars()
        .filter(|c| !c.is_whitespace() && !UNSAFE_NAME_CHARS.contains(c))
        .collect()
}

/// 1234567 -> "1,234,567"
pub fn commas(value: u64) -> String {
    let digits = value.to_string();
    let mut out = String::with_capacity(digits.len() + digits.len() / 3);
    for (i, ch) in digits.chars().enumerate() {
        if i > 0 && (digits.len() - i) % 3 == 0 {
            out.push(',');
        }
        out.push(ch);
    }
    out
}

pub fn is_remote(location: &str) -> bool {
    let lower = location.to_ascii_lowercase();
    lower.starts_with("http://") || lower.starts_with("https://")
}

/// Last path segment of a URL or local path, without scheme or query.
pub fn last_segment(location: &str) -> Option<String> {
    let without_query = location
        .split(['?', '#'])
        .next()
        .unwrap_or(location);
    let path_part = match without_query.find("://") {
        // skip the host
        Some(pos) => match without_query[pos + 3..].find('/') {
            Some(slash) => &without_query[pos + 3 + slash..],
            None => "",
        },
        None => without_query,
    };
    path_part
        .split(['/', '\\'])
        .filter(|s| !s.is_empty())
        .last()
        .map(str::to_string)
}

/// Lowercase, sanitized file name for a fetched location; `download.xxx` when none can be derived.
pub fn file_name_from_location(location: &str) -> String {
    last_segment(location)
        .map(|s| sanitize_name(&s).to_lowercase())
        .filter(|s| !s.is_empty() && s != "." && s != "..")
        .unwrap_or_else(|| DEFAULT_FILE_NAME.to_string())
}

/// The containing directory (local) or URL prefix (remote) of a location, without trailing separator.
pub fn parent_location(location: &str) -> String {
    if is_remote(location) {
        let trimmed = location.split(['?', '#']).next().unwrap_or(location);
        match trimmed.rfind('/') {
            Some(pos) => trimmed[..pos].to_string(),
            None => trimmed.to_string(),
        }
    } else {
        Path::new(location)
            .parent()
            .map(|p| p.display().to_string())
            .unwrap_or_default()
    }
}

/// Join a file name onto a directory path or URL prefix.
pub fn join_location(base: &str, name: &str) -> String {
    if is_remote(base) {
        format!("{}/{}", base.trim_end_matches('/'), name)
    } else {
        Path::new(base).join(name).display().to_string()
    }
}

/// Make a path absolute against the current directory without touching the filesystem.
pub fn absolutize(path: &Path) -> Result<PathBuf> {
    if path.is_absolute() {
        return Ok(path.to_path_buf());
    }
    let cwd = env::current_dir().io_context("current_dir", path)?;
    let mut out = cwd;
    for component in path.components() {
        match component {
            std::path::Component::CurDir => {}
            std::path::Component::ParentDir => {
                out.pop();
            }
            other => out.push(other.as_os_str()),
        }
    }
    Ok(out)
}

/// Remove a file, symlink, or directory tree. A missing path is not an error.
pub async fn remove_path(path: &Path) -> Result<()> {
    let meta = match tokio::fs::symlink_metadata(path).await {
        Ok(m) => m,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(e).io_context("remove", path),
    };
    let res = if meta.is_dir() {
        tokio::fs::remove_dir_all(path).await
    } else {
        tokio::fs::remove_file(path).await
    };
    match res {
        Err(e) if e.kind() != io::ErrorKind::NotFound => Err(e).io_context("remove", path),
        _ => Ok(()),
    }
}

/// Write via a sibling temp file and rename, so readers never see a half-written file.
pub async fn write_atomic(path: &Path, contents: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .io_context("create_dir", parent)?;
    }
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(format!(".{}.tmp", std::process::id()));
    let tmp = PathBuf::from(tmp);
    tokio::fs::write(&tmp, contents).await.io_context("write", &tmp)?;
    if let Err(e) = tokio::fs::rename(&tmp, path).await {
        let _ = tokio::fs::remove_file(&tmp).await;
        return Err(e).io_context("rename", path);
    }
    Ok(())
}
