//! Content integrity: SHA-512 hex digests with binary/text sniffing.

use std::io::SeekFrom;
use std::path::Path;

use sha2::{Digest, Sha512};
use tokio::io::{AsyncReadExt, AsyncSeekExt};

use crate::error::{BiddleError, IoContext, Result};

/// Bytes sampled (after the first byte) to classify a file.
pub const PROBE_WINDOW: u64 = 100;
/// Length of a hex SHA-512 digest.
pub const DIGEST_LEN: usize = 128;

const CHUNK_SIZE: usize = 8192;

/// Which caller is hashing; decides the error reported for a missing file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HashContext {
    Install,
    General,
}

fn is_control(c: char) -> bool {
    ('\u{0002}'..='\u{0008}').contains(&c) || ('\u{000e}'..='\u{001f}').contains(&c)
}

/// Classify a probe sample. Two characters are dropped from each end of the
/// decoded sample so a multi-byte sequence cut by the window does not count.
pub fn looks_binary(sample: &[u8]) -> bool {
    let text = String::from_utf8_lossy(sample);
    let chars: Vec<char> = text.chars().collect();
    if chars.len() <= 4 {
        return false;
    }
    chars[2..chars.len() - 2].iter().any(|c| is_control(*c))
}

pub fn digest_bytes(bytes: &[u8]) -> String {
    let mut hasher = Sha512::new();
    hasher.update(bytes);
    format!("{:x}", hasher.finalize())
}

pub fn digest_str(text: &str) -> String {
    digest_bytes(text.as_bytes())
}

/// Read the probe window of a file and classify it.
pub async fn probe_is_binary(path: &Path) -> Result<bool> {
    let mut file = tokio::fs::File::open(path).await.io_context("open", path)?;
    file.seek(SeekFrom::Start(1)).await.io_context("seek", path)?;
    let mut sample = Vec::with_capacity(PROBE_WINDOW as usize);
    file.take(PROBE_WINDOW)
        .read_to_end(&mut sample)
        .await
        .io_context("read", path)?;
    Ok(looks_binary(&sample))
}

/// SHA-512 hex digest of a file. Binary files and text that is not valid
/// UTF-8 are hashed as raw bytes; other text is hashed as its decoded content.
pub async fn digest_file(path: &Path, context: HashContext) -> Result<String> {
    let missing = || match context {
        HashContext::Install => BiddleError::NotPackageArchive {
            path: path.display().to_string(),
        },
        HashContext::General => BiddleError::NotAFile {
            path: path.display().to_string(),
        },
    };
    match tokio::fs::metadata(path).await {
        Ok(meta) if meta.is_file() => {}
        Ok(_) => return Err(missing()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Err(missing()),
        Err(e) => return Err(e).io_context("stat", path),
    }

    if probe_is_binary(path).await? {
        let mut file = tokio::fs::File::open(path).await.io_context("open", path)?;
        let mut hasher = Sha512::new();
        let mut buffer = vec![0u8; CHUNK_SIZE];
        loop {
            let n = file.read(&mut buffer).await.io_context("read", path)?;
            if n == 0 {
                break;
            }
            hasher.update(&buffer[..n]);
        }
        Ok(format!("{:x}", hasher.finalize()))
    } else {
        let bytes = tokio::fs::read(path).await.io_context("read", path)?;
        // invalid UTF-8 is hashed raw so distinct byte sequences stay distinct
        match std::str::from_utf8(&bytes) {
            Ok(text) => Ok(digest_str(text)),
            Err(_) => Ok(digest_bytes(&bytes)),
        }
    }
}

/// Compare a computed digest with the text of a sidecar file.
pub fn digests_match(expected: &str, actual: &str) -> bool {
    expected.trim().eq_ignore_ascii_case(actual.trim())
}
