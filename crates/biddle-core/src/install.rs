//! Installing a published archive: fetch, verify against its sidecar, unpack, record.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::archive::{ArchiveTool, ARCHIVE_EXTENSION};
use crate::catalog::{CatalogStore, InstalledEntry};
use crate::config::Layout;
use crate::descriptor::PackageDescriptor;
use crate::error::{BiddleError, Result};
use crate::fetch::Fetcher;
use crate::history::LATEST_MARKER;
use crate::integrity::{self, HashContext};
use crate::publish::HASH_EXTENSION;
use crate::utils::{self, is_remote, join_location, parent_location, sanitize_name};

#[derive(Debug, Clone)]
pub struct InstallReport {
    pub name: String,
    pub version: String,
    pub location: PathBuf,
    /// Where the archive came from; status checks read `latest.txt` here.
    pub published: String,
    pub digest: String,
}

/// Locations derived from the archive address.
#[derive(Debug, Clone, PartialEq, Eq)]
struct ArchiveAddress {
    archive: String,
    sidecar: String,
    marker: String,
    published: String,
    file_name: String,
    stem: String,
}

impl ArchiveAddress {
    fn parse(location: &str) -> Result<Self> {
        let not_archive = || BiddleError::NotPackageArchive {
            path: location.to_string(),
        };
        let archive = if is_remote(location) {
            location.to_string()
        } else {
            utils::absolutize(Path::new(location))?.display().to_string()
        };
        let file_name = utils::last_segment(&archive).ok_or_else(not_archive)?;
        let suffix = format!(".{}", ARCHIVE_EXTENSION);
        let stem = file_name
            .strip_suffix(&suffix)
            .filter(|s| !s.is_empty())
            .ok_or_else(not_archive)?
            .to_string();
        let published = parent_location(&archive);
        Ok(ArchiveAddress {
            sidecar: join_location(&published, &format!("{}.{}", stem, HASH_EXTENSION)),
            marker: join_location(&published, LATEST_MARKER),
            archive,
            published,
            file_name,
            stem,
        })
    }

    /// Version embedded after the last `_`. A `_latest` alias carries none.
    fn file_version(&self) -> Option<String> {
        self.stem
            .rsplit_once('_')
            .map(|(_, v)| v)
            .filter(|v| !v.is_empty() && *v != "latest")
            .map(str::to_string)
    }

    /// Application directory name: the file name up to its first `_`.
    fn app_name(&self) -> String {
        sanitize_name(self.stem.split('_').next().unwrap_or(&self.stem))
    }
}

pub struct InstallSession<'a> {
    layout: &'a Layout,
    store: &'a mut CatalogStore,
    archiver: Arc<dyn ArchiveTool>,
    fetcher: &'a Fetcher,
}

impl<'a> InstallSession<'a> {
    pub fn new(
        layout: &'a Layout,
        store: &'a mut CatalogStore,
        archiver: Arc<dyn ArchiveTool>,
        fetcher: &'a Fetcher,
    ) -> Self {
        InstallSession {
            layout,
            store,
            archiver,
            fetcher,
        }
    }

    /// Install the archive at `location` (URL or path) into `target`, or into
    /// `<applications>/<name>/` when no target is given.
    pub async fn run(&mut self, location: &str, target: Option<&Path>) -> Result<InstallReport> {
        let address = ArchiveAddress::parse(location)?;
        let target = match target {
            Some(t) => utils::absolutize(t)?,
            None => self.layout.applications.join(address.app_name()),
        };
        let target_name = target
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| address.app_name());
        let download = self
            .layout
            .downloads
            .join(utils::file_name_from_location(&address.file_name));

        utils::log(&format!("Installing {} to {}", address.archive, target.display()));
        let (archive, sidecar, marker) = tokio::join!(
            self.fetcher.fetch_to_file(&address.archive, &download),
            self.fetcher.fetch_text(&address.sidecar),
            self.fetcher.fetch_text(&address.marker),
        );

        let latest = marker.ok().map(|m| m.trim().to_string()).filter(|m| !m.is_empty());
        if let (Some(latest), Some(installed)) = (&latest, self.store.installed(&target_name)) {
            if &installed.version == latest {
                let err = BiddleError::AlreadyInstalled {
                    name: target_name.clone(),
                    version: latest.clone(),
                };
                discard(&download).await;
                return Err(err);
            }
        }

        let archive_missing = |e: BiddleError| {
            if e.is_missing_path() {
                BiddleError::NotPackageArchive {
                    path: address.archive.clone(),
                }
            } else {
                e
            }
        };
        if let Err(e) = archive {
            discard(&download).await;
            return Err(archive_missing(e));
        }
        let expected = match sidecar {
            Ok(text) => text.trim().to_string(),
            Err(e) => {
                discard(&download).await;
                return Err(archive_missing(e));
            }
        };

        let digest = integrity::digest_file(&download, HashContext::Install).await?;
        if !integrity::digests_match(&expected, &digest) {
            // the download stays for inspection
            return Err(BiddleError::HashMismatch {
                location: address.archive.clone(),
                expected,
                actual: digest,
            });
        }

        let target_existed = tokio::fs::metadata(&target).await.is_ok();
        let tool = self.archiver.clone();
        let (from, to) = (download.clone(), target.clone());
        let unpacked = tokio::task::spawn_blocking(move || tool.unarchive(&from, &to))
            .await
            .map_err(|e| BiddleError::Archive {
                operation: "unarchive",
                path: download.display().to_string(),
                reason: e.to_string(),
            })
            .and_then(|r| r);
        if let Err(e) = unpacked {
            if !target_existed {
                discard(&target).await;
            }
            return Err(e);
        }

        let (name, version) = match PackageDescriptor::load(&target).await {
            Ok(d) => (d.name, d.version),
            Err(e) => {
                utils::log_error(&format!("{}; recording as {}", e, target_name));
                let version = latest
                    .clone()
                    .or_else(|| address.file_version())
                    .unwrap_or_default();
                (target_name.clone(), version)
            }
        };

        let entry = InstalledEntry {
            location: target.display().to_string(),
            version: version.clone(),
            published: address.published.clone(),
        };
        let previous = self.store.set_installed(&name, entry);
        let (flushed, removed) =
            tokio::join!(self.store.flush_installed(), utils::remove_path(&download));
        if let Err(e) = removed {
            utils::log_error(&format!("Could not remove {}: {}", download.display(), e));
        }
        if let Err(e) = flushed {
            self.store.restore_installed(&name, previous);
            return Err(e);
        }

        utils::log(&format!(
            "Application {} is installed to version {}.",
            name, version
        ));
        Ok(InstallReport {
            name,
            version,
            location: target,
            published: address.published,
            digest,
        })
    }
}

async fn discard(path: &Path) {
    if let Err(e) = utils::remove_path(path).await {
        utils::log_error(&format!("Could not remove {}: {}", path.display(), e));
    }
}

/// Delete an installed application and its catalog entry.
pub async fn uninstall(store: &mut CatalogStore, name: &str) -> Result<InstalledEntry> {
    let entry = store
        .installed(name)
        .cloned()
        .ok_or_else(|| BiddleError::NotFound {
            what: "installed application",
            name: name.to_string(),
        })?;
    if !entry.location.is_empty() {
        utils::remove_path(Path::new(&entry.location)).await?;
    }
    store.remove_installed(name);
    if let Err(e) = store.flush_installed().await {
        store.restore_installed(name, Some(entry));
        return Err(e);
    }
    utils::log(&format!("Application {} is uninstalled.", name));
    Ok(entry)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::archive::TarGzArchiver;
    use crate::publish::PublishSession;
    use crate::tasks::ShellTaskRunner;

    async fn publish_sample(home: &Path, src: &Path, version: &str) -> PathBuf {
        let pkg = src.join("sample");
        std::fs::create_dir_all(&pkg).unwrap();
        std::fs::write(
            pkg.join("package.json"),
            format!(r#"{{"name":"sample","version":"{}"}}"#, version),
        )
        .unwrap();
        std::fs::write(pkg.join("main.js"), "console.log('hi');\n").unwrap();

        let layout = Layout::new(home);
        let mut store = CatalogStore::load(&layout).unwrap();
        let report = PublishSession::new(
            &layout,
            &mut store,
            Arc::new(TarGzArchiver),
            Arc::new(ShellTaskRunner::default()),
        )
        .run(&pkg, None)
        .await
        .unwrap();
        report.directory.join(format!("sample_{}.tgz", version))
    }

    async fn install(home: &Path, archive: &Path) -> Result<InstallReport> {
        let layout = Layout::new(home);
        let mut store = CatalogStore::load(&layout).unwrap();
        let fetcher = Fetcher::new().unwrap();
        InstallSession::new(&layout, &mut store, Arc::new(TarGzArchiver), &fetcher)
            .run(&archive.display().to_string(), None)
            .await
    }

    #[test]
    fn test_archive_address() {
        let a = ArchiveAddress::parse("https://example.com/pubs/sample/sample_min_1.0.0.tgz").unwrap();
        assert_eq!(a.sidecar, "https://example.com/pubs/sample/sample_min_1.0.0.hash");
        assert_eq!(a.marker, "https://example.com/pubs/sample/latest.txt");
        assert_eq!(a.published, "https://example.com/pubs/sample");
        assert_eq!(a.app_name(), "sample");

        assert_eq!(a.file_version().as_deref(), Some("1.0.0"));

        let alias = ArchiveAddress::parse("https://example.com/pubs/sample/sample_latest.tgz").unwrap();
        assert_eq!(alias.file_version(), None);
        let bare = ArchiveAddress::parse("https://example.com/pubs/sample/sample.tgz").unwrap();
        assert_eq!(bare.file_version(), None);

        let err = ArchiveAddress::parse("https://example.com/pubs/sample/readme.md").unwrap_err();
        assert!(matches!(err, BiddleError::NotPackageArchive { .. }));
    }

    #[tokio::test]
    async fn test_install_published_archive() {
        let home = tempfile::tempdir().unwrap();
        let src = tempfile::tempdir().unwrap();
        let archive = publish_sample(home.path(), src.path(), "1.0.0").await;

        let report = install(home.path(), &archive).await.unwrap();
        assert_eq!(report.name, "sample");
        assert_eq!(report.version, "1.0.0");
        let app = home.path().join("applications/sample");
        assert_eq!(report.location, app);
        assert!(app.join("package.json").is_file());
        assert!(app.join("main.js").is_file());
        assert!(!home.path().join("downloads/sample_1.0.0.tgz").exists());

        let store = CatalogStore::load(&Layout::new(home.path())).unwrap();
        let entry = store.installed("sample").unwrap();
        assert_eq!(entry.version, "1.0.0");
        assert_eq!(Path::new(&entry.published), archive.parent().unwrap());
    }

    #[tokio::test]
    async fn test_corrupted_sidecar_blocks_install() {
        let home = tempfile::tempdir().unwrap();
        let src = tempfile::tempdir().unwrap();
        let archive = publish_sample(home.path(), src.path(), "1.0.0").await;
        std::fs::write(archive.with_extension("hash"), "0".repeat(128)).unwrap();

        let err = install(home.path(), &archive).await.unwrap_err();
        match &err {
            BiddleError::HashMismatch { expected, actual, .. } => {
                assert_eq!(expected, &"0".repeat(128));
                assert_eq!(actual.len(), 128);
            }
            other => panic!("unexpected error: {other}"),
        }
        assert!(home.path().join("downloads/sample_1.0.0.tgz").is_file());
        assert!(!home.path().join("applications/sample").exists());
        assert!(!home.path().join("installed.json").exists());
    }

    #[tokio::test]
    async fn test_reinstall_same_version_is_rejected() {
        let home = tempfile::tempdir().unwrap();
        let src = tempfile::tempdir().unwrap();
        let archive = publish_sample(home.path(), src.path(), "1.0.0").await;
        install(home.path(), &archive).await.unwrap();

        let err = install(home.path(), &archive).await.unwrap_err();
        assert!(matches!(err, BiddleError::AlreadyInstalled { .. }));
        assert!(err.to_string().contains("biddle uninstall sample"));
        assert!(!home.path().join("downloads/sample_1.0.0.tgz").exists());
    }

    #[tokio::test]
    async fn test_upgrade_replaces_entry() {
        let home = tempfile::tempdir().unwrap();
        let src = tempfile::tempdir().unwrap();
        let first = publish_sample(home.path(), src.path(), "1.0.0").await;
        install(home.path(), &first).await.unwrap();
        let second = publish_sample(home.path(), src.path(), "1.1.0").await;

        let report = install(home.path(), &second).await.unwrap();
        assert_eq!(report.version, "1.1.0");
        let store = CatalogStore::load(&Layout::new(home.path())).unwrap();
        assert_eq!(store.installed("sample").unwrap().version, "1.1.0");
    }

    #[tokio::test]
    async fn test_missing_sidecar_or_archive() {
        let home = tempfile::tempdir().unwrap();
        let src = tempfile::tempdir().unwrap();
        let archive = publish_sample(home.path(), src.path(), "1.0.0").await;
        std::fs::remove_file(archive.with_extension("hash")).unwrap();

        let err = install(home.path(), &archive).await.unwrap_err();
        assert!(matches!(err, BiddleError::NotPackageArchive { .. }));

        let err = install(home.path(), &src.path().join("ghost_1.0.0.tgz"))
            .await
            .unwrap_err();
        assert!(matches!(err, BiddleError::NotPackageArchive { .. }));
        assert!(!home.path().join("installed.json").exists());
    }

    /// Pack `main.js` alone (no package.json) as `<dir>/<file_name>` with a sidecar.
    async fn pack_without_descriptor(dir: &Path, file_name: &str) -> PathBuf {
        let content = dir.join("content");
        std::fs::create_dir_all(&content).unwrap();
        std::fs::write(content.join("main.js"), "console.log('bare');\n").unwrap();
        let archive = TarGzArchiver.archive(&content, &dir.join(file_name)).unwrap();
        let digest = integrity::digest_file(&archive, HashContext::General).await.unwrap();
        std::fs::write(archive.with_extension(HASH_EXTENSION), digest).unwrap();
        archive
    }

    #[tokio::test]
    async fn test_missing_marker_skips_already_installed_check() {
        let home = tempfile::tempdir().unwrap();
        let src = tempfile::tempdir().unwrap();
        let archive = publish_sample(home.path(), src.path(), "1.0.0").await;
        std::fs::remove_file(archive.parent().unwrap().join(LATEST_MARKER)).unwrap();

        install(home.path(), &archive).await.unwrap();
        let report = install(home.path(), &archive).await.unwrap();
        assert_eq!(report.version, "1.0.0");
        assert!(!home.path().join("downloads/sample_1.0.0.tgz").exists());
    }

    #[tokio::test]
    async fn test_archive_without_descriptor_uses_target_and_file_name() {
        let home = tempfile::tempdir().unwrap();
        let pubs = tempfile::tempdir().unwrap();
        let archive = pack_without_descriptor(pubs.path(), "tool_2.3.0.tgz").await;

        let report = install(home.path(), &archive).await.unwrap();
        assert_eq!(report.name, "tool");
        assert_eq!(report.version, "2.3.0");
        let app = home.path().join("applications/tool");
        assert_eq!(report.location, app);
        assert!(app.join("main.js").is_file());

        let store = CatalogStore::load(&Layout::new(home.path())).unwrap();
        assert_eq!(store.installed("tool").unwrap().version, "2.3.0");
    }

    #[tokio::test]
    async fn test_archive_without_descriptor_prefers_marker() {
        let home = tempfile::tempdir().unwrap();
        let pubs = tempfile::tempdir().unwrap();
        let archive = pack_without_descriptor(pubs.path(), "tool_latest.tgz").await;

        let report = install(home.path(), &archive).await.unwrap();
        assert_eq!(report.version, "");

        std::fs::write(pubs.path().join(LATEST_MARKER), "2.4.0\n").unwrap();
        let report = install(home.path(), &archive).await.unwrap();
        assert_eq!(report.name, "tool");
        assert_eq!(report.version, "2.4.0");
    }

    #[tokio::test]
    async fn test_uninstall() {
        let home = tempfile::tempdir().unwrap();
        let src = tempfile::tempdir().unwrap();
        let archive = publish_sample(home.path(), src.path(), "1.0.0").await;
        let report = install(home.path(), &archive).await.unwrap();

        let layout = Layout::new(home.path());
        let mut store = CatalogStore::load(&layout).unwrap();
        uninstall(&mut store, "sample").await.unwrap();
        assert!(!report.location.exists());
        assert!(CatalogStore::load(&layout).unwrap().installed("sample").is_none());

        let err = uninstall(&mut store, "sample").await.unwrap_err();
        assert!(matches!(err, BiddleError::NotFound { .. }));
    }
}
