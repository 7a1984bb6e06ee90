//! Per-package publish history (`filedata.json`) and the listing page built from it.

use std::fmt::Write as _;
use std::path::Path;

use chrono::{Local, NaiveDate};
use serde::{Deserialize, Serialize};

use crate::error::{BiddleError, IoContext, Result};
use crate::utils::{self, commas};

pub const HISTORY_FILE: &str = "filedata.json";
pub const LISTING_FILE: &str = "index.xhtml";
pub const LATEST_MARKER: &str = "latest.txt";

/// One archive produced by a publish. Never mutated once written.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VersionHistoryRecord {
    /// Calendar day, `YYYYMMDD`.
    pub date: String,
    pub filename: String,
    pub size: u64,
    /// Empty for the primary variant.
    #[serde(default)]
    pub variant: String,
    pub version: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct VersionHistory {
    #[serde(default)]
    pub filedata: Vec<VersionHistoryRecord>,
}

pub fn today() -> String {
    Local::now().format("%Y%m%d").to_string()
}

impl VersionHistory {
    pub async fn load(dir: &Path) -> Result<Self> {
        let path = dir.join(HISTORY_FILE);
        let text = match tokio::fs::read_to_string(&path).await {
            Ok(t) => t,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Self::default()),
            Err(e) => return Err(e).io_context("read_history", &path),
        };
        if text.trim().is_empty() {
            return Ok(Self::default());
        }
        serde_json::from_str(&text).map_err(|e| BiddleError::catalog("read_history", &path, e))
    }

    pub fn append(&mut self, records: impl IntoIterator<Item = VersionHistoryRecord>) {
        self.filedata.extend(records);
    }

    pub async fn save(&self, dir: &Path) -> Result<()> {
        let path = dir.join(HISTORY_FILE);
        let json = serde_json::to_string_pretty(self)
            .map_err(|e| BiddleError::catalog("write_history", &path, e))?;
        utils::write_atomic(&path, json.as_bytes()).await
    }
}

/// "20240315" -> "15 March 2024"; anything unparseable is shown as-is.
fn display_date(date: &str) -> String {
    NaiveDate::parse_from_str(date, "%Y%m%d")
        .map(|d| d.format("%d %B %Y").to_string())
        .unwrap_or_else(|_| date.to_string())
}

fn escape(text: &str) -> String {
    text.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
}

/// Render the listing page, newest archives first.
pub fn render_listing(name: &str, author: Option<&str>, history: &VersionHistory) -> String {
    let name = escape(name);
    let mut page = String::new();
    page.push_str("<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n");
    page.push_str("<!DOCTYPE html>\n<html xmlns=\"http://www.w3.org/1999/xhtml\" xml:lang=\"en\">\n<head>\n");
    let _ = writeln!(page, "<title>{}</title>", name);
    page.push_str("<meta http-equiv=\"Content-Type\" content=\"application/xhtml+xml;charset=UTF-8\"/>\n");
    if let Some(author) = author.filter(|a| !a.trim().is_empty()) {
        let _ = writeln!(page, "<meta name=\"author\" content=\"{}\"/>", escape(author));
    }
    page.push_str("</head>\n<body>\n");
    let _ = writeln!(page, "<h1>{}</h1>", name);
    page.push_str("<table>\n<thead><tr><th>Version</th><th>Date</th><th>Size</th><th>Variant</th><th>File</th></tr></thead>\n<tbody>\n");
    for record in history.filedata.iter().rev() {
        let variant = if record.variant.is_empty() {
            "Full Application".to_string()
        } else {
            escape(&record.variant)
        };
        let file = escape(&record.filename);
        let _ = writeln!(
            page,
            "<tr><td>{}</td><td>{}</td><td>{}</td><td>{}</td><td><a href=\"{}\">{}</a></td></tr>",
            escape(&record.version),
            display_date(&record.date),
            commas(record.size),
            variant,
            file,
            file
        );
    }
    page.push_str("</tbody>\n</table>\n</body>\n</html>\n");
    page
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(version: &str, variant: &str, filename: &str) -> VersionHistoryRecord {
        VersionHistoryRecord {
            date: "20240315".into(),
            filename: filename.into(),
            size: 12345,
            variant: variant.into(),
            version: version.into(),
        }
    }

    #[test]
    fn test_display_date() {
        assert_eq!(display_date("20240315"), "15 March 2024");
        assert_eq!(display_date("garbage"), "garbage");
    }

    #[test]
    fn test_today_format() {
        let t = today();
        assert_eq!(t.len(), 8);
        assert!(t.chars().all(|c| c.is_ascii_digit()));
    }

    #[tokio::test]
    async fn test_history_appends_and_persists() {
        let dir = tempfile::tempdir().unwrap();
        let mut history = VersionHistory::load(dir.path()).await.unwrap();
        assert!(history.filedata.is_empty());

        history.append(vec![record("1.0.0", "", "sample_1.0.0.tgz")]);
        history.save(dir.path()).await.unwrap();

        let mut reloaded = VersionHistory::load(dir.path()).await.unwrap();
        reloaded.append(vec![record("1.1.0", "min", "sample_min_1.1.0.tgz")]);
        reloaded.save(dir.path()).await.unwrap();

        let last = VersionHistory::load(dir.path()).await.unwrap();
        assert_eq!(last.filedata.len(), 2);
        assert_eq!(last.filedata[0].version, "1.0.0");
        assert_eq!(last.filedata[1].variant, "min");
    }

    #[test]
    fn test_render_listing() {
        let mut history = VersionHistory::default();
        history.append(vec![
            record("1.0.0", "", "sample_1.0.0.tgz"),
            record("1.1.0", "min", "sample_min_1.1.0.tgz"),
        ]);
        let page = render_listing("sample", Some("A <Dev>"), &history);

        assert!(page.contains("<meta name=\"author\" content=\"A &lt;Dev&gt;\"/>"));
        assert!(page.contains("Full Application"));
        assert!(page.contains("12,345"));
        assert!(page.contains("15 March 2024"));
        assert!(page.contains("<a href=\"sample_1.0.0.tgz\">"));
        // newest first
        let newer = page.find("sample_min_1.1.0.tgz").unwrap();
        let older = page.find("sample_1.0.0.tgz").unwrap();
        assert!(newer < older);
    }
}
