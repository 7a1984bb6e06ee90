//! Durable records of published and installed packages.
//!
//! The store is loaded once per process and owned by whichever session is
//! mutating it. Each catalog file is rewritten whole after a successful change.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::config::Layout;
use crate::error::{BiddleError, Result};
use crate::utils;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublishedEntry {
    /// Every version ever published, in publish order.
    #[serde(default)]
    pub versions: Vec<String>,
    #[serde(default)]
    pub latest: String,
    /// Absolute path of the package's publish directory.
    #[serde(default)]
    pub directory: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstalledEntry {
    pub location: String,
    pub version: String,
    /// Directory or URL prefix the archive came from; its latest.txt drives status checks.
    #[serde(default)]
    pub published: String,
}

/// Which catalog a listing covers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListKind {
    Installed,
    Published,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ListRow {
    pub name: String,
    pub version: String,
    pub location: String,
}

#[derive(Debug)]
pub struct CatalogStore {
    published_path: PathBuf,
    installed_path: PathBuf,
    published: BTreeMap<String, PublishedEntry>,
    installed: BTreeMap<String, InstalledEntry>,
}

fn read_map<T: DeserializeOwned>(path: &Path) -> Result<BTreeMap<String, T>> {
    let text = match std::fs::read_to_string(path) {
        Ok(t) => t,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(BTreeMap::new()),
        Err(e) => return Err(BiddleError::io("read_catalog", path, e)),
    };
    if text.trim().is_empty() {
        return Ok(BTreeMap::new());
    }
    serde_json::from_str(&text).map_err(|e| BiddleError::catalog("read_catalog", path, e))
}

async fn write_map<T: Serialize>(path: &Path, map: &BTreeMap<String, T>) -> Result<()> {
    let json = serde_json::to_string_pretty(map)
        .map_err(|e| BiddleError::catalog("write_catalog", path, e))?;
    utils::write_atomic(path, json.as_bytes()).await
}

impl CatalogStore {
    /// Read both catalogs. Missing files are empty catalogs; malformed ones are errors.
    pub fn load(layout: &Layout) -> Result<Self> {
        Self::load_from(layout.published_catalog(), layout.installed_catalog())
    }

    pub fn load_from(published_path: PathBuf, installed_path: PathBuf) -> Result<Self> {
        Ok(CatalogStore {
            published: read_map(&published_path)?,
            installed: read_map(&installed_path)?,
            published_path,
            installed_path,
        })
    }

    pub fn published(&self, name: &str) -> Option<&PublishedEntry> {
        self.published.get(name)
    }

    pub fn installed(&self, name: &str) -> Option<&InstalledEntry> {
        self.installed.get(name)
    }

    pub fn published_entries(&self) -> impl Iterator<Item = (&String, &PublishedEntry)> {
        self.published.iter()
    }

    pub fn installed_entries(&self) -> impl Iterator<Item = (&String, &InstalledEntry)> {
        self.installed.iter()
    }

    /// Replace the entry for `name`, returning the previous one.
    pub fn commit_published(&mut self, name: &str, entry: PublishedEntry) -> Option<PublishedEntry> {
        self.published.insert(name.to_string(), entry)
    }

    pub fn remove_published(&mut self, name: &str) -> Option<PublishedEntry> {
        self.published.remove(name)
    }

    pub fn set_installed(&mut self, name: &str, entry: InstalledEntry) -> Option<InstalledEntry> {
        self.installed.insert(name.to_string(), entry)
    }

    pub fn remove_installed(&mut self, name: &str) -> Option<InstalledEntry> {
        self.installed.remove(name)
    }

    /// Put back a published entry after a failed flush.
    pub fn restore_published(&mut self, name: &str, previous: Option<PublishedEntry>) {
        match previous {
            Some(entry) => {
                self.published.insert(name.to_string(), entry);
            }
            None => {
                self.published.remove(name);
            }
        }
    }

    pub fn restore_installed(&mut self, name: &str, previous: Option<InstalledEntry>) {
        match previous {
            Some(entry) => {
                self.installed.insert(name.to_string(), entry);
            }
            None => {
                self.installed.remove(name);
            }
        }
    }

    pub async fn flush_published(&self) -> Result<()> {
        write_map(&self.published_path, &self.published).await
    }

    pub async fn flush_installed(&self) -> Result<()> {
        write_map(&self.installed_path, &self.installed).await
    }

    /// Rows sorted by name: version is the installed version or the published latest.
    pub fn rows(&self, kind: ListKind) -> Vec<ListRow> {
        match kind {
            ListKind::Installed => self
                .installed
                .iter()
                .map(|(name, e)| ListRow {
                    name: name.clone(),
                    version: e.version.clone(),
                    location: e.location.clone(),
                })
                .collect(),
            ListKind::Published => self
                .published
                .iter()
                .map(|(name, e)| ListRow {
                    name: name.clone(),
                    version: e.latest.clone(),
                    location: e.directory.clone(),
                })
                .collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store_in(dir: &Path) -> CatalogStore {
        CatalogStore::load(&Layout::new(dir)).unwrap()
    }

    #[test]
    fn test_missing_catalogs_load_empty() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(dir.path());
        assert!(store.rows(ListKind::Installed).is_empty());
        assert!(store.rows(ListKind::Published).is_empty());
    }

    #[test]
    fn test_malformed_catalog_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("installed.json"), "{broken").unwrap();
        let err = CatalogStore::load(&Layout::new(dir.path())).unwrap_err();
        assert!(matches!(err, BiddleError::Catalog { .. }));
    }

    #[tokio::test]
    async fn test_flush_and_reload() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = store_in(dir.path());
        store.commit_published(
            "sample",
            PublishedEntry {
                versions: vec!["1.0.0".into()],
                latest: "1.0.0".into(),
                directory: "/pubs/sample".into(),
            },
        );
        store.flush_published().await.unwrap();

        let reloaded = store_in(dir.path());
        let entry = reloaded.published("sample").unwrap();
        assert_eq!(entry.latest, "1.0.0");
        assert_eq!(entry.versions, vec!["1.0.0".to_string()]);
        // installed.json untouched
        assert!(!dir.path().join("installed.json").exists());
    }

    #[test]
    fn test_rows_are_sorted() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = store_in(dir.path());
        for name in ["zeta", "alpha", "mid"] {
            store.set_installed(
                name,
                InstalledEntry {
                    location: format!("/apps/{}", name),
                    version: "1.0.0".into(),
                    published: String::new(),
                },
            );
        }
        let names: Vec<_> = store
            .rows(ListKind::Installed)
            .into_iter()
            .map(|r| r.name)
            .collect();
        assert_eq!(names, vec!["alpha", "mid", "zeta"]);
    }
}
