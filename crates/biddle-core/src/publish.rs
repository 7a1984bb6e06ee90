//! Publishing: stage each variant, run its tasks, archive, hash, and record.
//!
//! Variants are staged concurrently on a `JoinSet`. Nothing reaches the
//! catalog until every variant has archived cleanly; on failure the session
//! removes what it wrote and leaves the catalog as it found it.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::archive::{ArchiveTool, ARCHIVE_EXTENSION};
use crate::catalog::{CatalogStore, PublishedEntry};
use crate::config::Layout;
use crate::copy;
use crate::descriptor::{PackageDescriptor, Variant};
use crate::error::{BiddleError, IoContext, Result};
use crate::history::{self, VersionHistory, VersionHistoryRecord, LATEST_MARKER, LISTING_FILE};
use crate::integrity::{self, HashContext};
use crate::tasks::TaskRunner;
use crate::utils::{self, commas, sanitize_name};
use crate::version;

pub const HASH_EXTENSION: &str = "hash";
const PRIMARY_STAGE: &str = "primary";
const VARIANT_STAGE: &str = "variants";

#[derive(Debug, Clone)]
pub struct PublishReport {
    pub name: String,
    pub version: String,
    /// This version became the package's latest.
    pub latest: bool,
    pub directory: PathBuf,
    pub archives: Vec<PathBuf>,
    pub records: Vec<VersionHistoryRecord>,
    pub task_failures: usize,
}

/// Per-variant work handed to a staging task.
struct VariantPlan {
    /// Declared variant name; empty for the primary variant.
    label: String,
    source: PathBuf,
    staging: PathBuf,
    exclusions: Vec<String>,
    tasks: Vec<String>,
    archive: PathBuf,
    version: String,
}

struct VariantOutcome {
    label: String,
    archive: PathBuf,
    sidecar: PathBuf,
    record: VersionHistoryRecord,
    task_failures: usize,
}

/// Sidecar path for an archive: same stem, `.hash` extension.
pub fn sidecar_path(archive: &Path) -> PathBuf {
    archive.with_extension(HASH_EXTENSION)
}

fn archive_stem(name: &str, variant: &str) -> String {
    if variant.is_empty() {
        name.to_string()
    } else {
        format!("{}_{}", name, sanitize_name(variant))
    }
}

fn display_variant(label: &str) -> &str {
    if label.is_empty() {
        PRIMARY_STAGE
    } else {
        label
    }
}

pub struct PublishSession<'a> {
    layout: &'a Layout,
    store: &'a mut CatalogStore,
    archiver: Arc<dyn ArchiveTool>,
    tasks: Arc<dyn TaskRunner>,
}

impl<'a> PublishSession<'a> {
    pub fn new(
        layout: &'a Layout,
        store: &'a mut CatalogStore,
        archiver: Arc<dyn ArchiveTool>,
        tasks: Arc<dyn TaskRunner>,
    ) -> Self {
        PublishSession {
            layout,
            store,
            archiver,
            tasks,
        }
    }

    /// Publish the package rooted at `source`. Archives land in
    /// `<destination or publications>/<name>/` unless the package already has
    /// a publish directory.
    pub async fn run(&mut self, source: &Path, destination: Option<&Path>) -> Result<PublishReport> {
        let source = utils::absolutize(source)?;
        let descriptor = PackageDescriptor::load(&source).await?;
        let name = descriptor.name.clone();
        let version_str = descriptor.version.clone();

        let previous = self.store.published(&name).cloned();
        if let Some(existing) = &previous {
            if existing.versions.iter().any(|v| v == &version_str) {
                return Err(BiddleError::DuplicateVersion {
                    name,
                    version: version_str,
                });
            }
        }

        let mut entry = match &previous {
            Some(existing) if !existing.directory.is_empty() => existing.clone(),
            _ => {
                let root = match destination {
                    Some(d) => utils::absolutize(d)?,
                    None => self.layout.publications.clone(),
                };
                PublishedEntry {
                    directory: root.join(&name).display().to_string(),
                    ..previous.clone().unwrap_or_default()
                }
            }
        };
        let pubdir = PathBuf::from(&entry.directory);
        let latest = version::becomes_latest(&version_str, &entry.latest);
        let previous_latest = entry.latest.clone();
        entry.versions.push(version_str.clone());
        if latest {
            entry.latest = version_str.clone();
        }

        utils::log(&format!(
            "Publishing {} {}{}",
            name,
            version_str,
            if latest { " (latest)" } else { "" }
        ));

        let created_pubdir = tokio::fs::metadata(&pubdir).await.is_err();
        tokio::fs::create_dir_all(&pubdir)
            .await
            .io_context("create_dir", &pubdir)?;

        let staging = self.layout.temp.join(&name);
        utils::remove_path(&staging).await?;

        let plans = self.plan_variants(&descriptor, &source, &staging, &pubdir);
        let mut rollback = Rollback {
            staging: staging.clone(),
            pubdir: created_pubdir.then(|| pubdir.clone()),
            files: plans
                .iter()
                .flat_map(|p| [p.archive.clone(), sidecar_path(&p.archive)])
                .collect(),
            aliases: Vec::new(),
            history: None,
            latest_marker: None,
        };

        let outcomes = match self.stage_all(plans).await {
            Ok(o) => o,
            Err(e) => {
                rollback.run().await;
                return Err(e);
            }
        };

        match self
            .finish(&descriptor, &pubdir, entry, latest, &previous_latest, previous, outcomes, &mut rollback)
            .await
        {
            Ok(report) => {
                rollback.discard().await;
                utils::log(&format!("Published {} {} to {}", name, version_str, pubdir.display()));
                Ok(report)
            }
            Err(e) => {
                rollback.run().await;
                Err(e)
            }
        }
    }

    fn plan_variants(
        &self,
        descriptor: &PackageDescriptor,
        source: &Path,
        staging: &Path,
        pubdir: &Path,
    ) -> Vec<VariantPlan> {
        let primary = Variant::default();
        std::iter::once(&primary)
            .chain(descriptor.variants.iter())
            .map(|variant| {
                let stage = if variant.name.is_empty() {
                    staging.join(PRIMARY_STAGE)
                } else {
                    staging.join(VARIANT_STAGE).join(sanitize_name(&variant.name))
                };
                let mut exclusions: Vec<String> = variant
                    .exclusions
                    .iter()
                    .chain(self.layout.ignore.iter())
                    .cloned()
                    .collect();
                exclusions.sort();
                exclusions.dedup();
                let stem = archive_stem(&descriptor.name, &variant.name);
                VariantPlan {
                    label: variant.name.clone(),
                    source: source.to_path_buf(),
                    staging: stage,
                    exclusions,
                    tasks: variant.tasks.clone(),
                    archive: pubdir.join(format!(
                        "{}_{}.{}",
                        stem,
                        sanitize_name(&descriptor.version),
                        ARCHIVE_EXTENSION
                    )),
                    version: descriptor.version.clone(),
                }
            })
            .collect()
    }

    async fn stage_all(&self, plans: Vec<VariantPlan>) -> Result<Vec<VariantOutcome>> {
        let mut set = tokio::task::JoinSet::new();
        for plan in plans {
            set.spawn(stage_variant(plan, self.archiver.clone(), self.tasks.clone()));
        }

        let mut outcomes = Vec::new();
        let mut first_error = None;
        // Drain every variant so no task is still writing when cleanup starts.
        while let Some(joined) = set.join_next().await {
            match joined {
                Ok(Ok(outcome)) => outcomes.push(outcome),
                Ok(Err(e)) => {
                    first_error.get_or_insert(e);
                }
                Err(join_err) => {
                    first_error.get_or_insert(BiddleError::Archive {
                        operation: "stage",
                        path: String::new(),
                        reason: join_err.to_string(),
                    });
                }
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => {
                outcomes.sort_by(|a, b| a.label.cmp(&b.label));
                Ok(outcomes)
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn finish(
        &mut self,
        descriptor: &PackageDescriptor,
        pubdir: &Path,
        entry: PublishedEntry,
        latest: bool,
        previous_latest: &str,
        previous: Option<PublishedEntry>,
        outcomes: Vec<VariantOutcome>,
        rollback: &mut Rollback,
    ) -> Result<PublishReport> {
        let mut archives = Vec::new();
        let mut records = Vec::new();
        let mut task_failures = 0;

        for outcome in outcomes {
            task_failures += outcome.task_failures;
            archives.push(outcome.archive.clone());
            records.push(outcome.record.clone());
            if latest {
                let alias = pubdir.join(format!(
                    "{}_latest.{}",
                    archive_stem(&descriptor.name, &outcome.label),
                    ARCHIVE_EXTENSION
                ));
                replace_alias(&outcome.archive, &alias, rollback).await?;
                replace_alias(&outcome.sidecar, &sidecar_path(&alias), rollback).await?;
                records.push(VersionHistoryRecord {
                    filename: file_name(&alias),
                    ..outcome.record
                });
                archives.push(alias);
            }
        }

        let mut history = VersionHistory::load(pubdir).await?;
        rollback.history = Some(history.clone());
        history.append(records.iter().cloned());
        history.save(pubdir).await?;
        let listing = history::render_listing(&descriptor.name, descriptor.author.as_deref(), &history);
        let listing_path = pubdir.join(LISTING_FILE);
        utils::write_atomic(&listing_path, listing.as_bytes()).await?;

        if latest {
            rollback.latest_marker = Some(previous_latest.to_string());
            utils::write_atomic(&pubdir.join(LATEST_MARKER), descriptor.version.as_bytes()).await?;
        }

        self.store.commit_published(&descriptor.name, entry);
        if let Err(e) = self.store.flush_published().await {
            self.store.restore_published(&descriptor.name, previous);
            return Err(e);
        }

        Ok(PublishReport {
            name: descriptor.name.clone(),
            version: descriptor.version.clone(),
            latest,
            directory: pubdir.to_path_buf(),
            archives,
            records,
            task_failures,
        })
    }
}

fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default()
}

fn with_suffix(path: &Path, suffix: &str) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(suffix);
    PathBuf::from(name)
}

/// Replace `dest` with a copy of `src` without exposing a half-written file.
async fn copy_replace(src: &Path, dest: &Path) -> Result<()> {
    let tmp = with_suffix(dest, ".part");
    tokio::fs::copy(src, &tmp).await.io_context("copy", &tmp)?;
    if let Err(e) = tokio::fs::rename(&tmp, dest).await {
        let _ = tokio::fs::remove_file(&tmp).await;
        return Err(e).io_context("rename", dest);
    }
    Ok(())
}

/// Point a latest alias at `src`, keeping the old alias as `.prev` until the
/// publish commits.
async fn replace_alias(src: &Path, alias: &Path, rollback: &mut Rollback) -> Result<()> {
    let backup = match tokio::fs::metadata(alias).await {
        Ok(_) => {
            let backup = with_suffix(alias, ".prev");
            copy_replace(alias, &backup).await?;
            Some(backup)
        }
        Err(_) => None,
    };
    rollback.aliases.push((alias.to_path_buf(), backup));
    copy_replace(src, alias).await
}

async fn stage_variant(
    plan: VariantPlan,
    archiver: Arc<dyn ArchiveTool>,
    runner: Arc<dyn TaskRunner>,
) -> Result<VariantOutcome> {
    let variant = display_variant(&plan.label).to_string();
    copy::copy(&plan.source, &plan.staging, &plan.exclusions).await?;
    let staged = match plan.source.file_name() {
        Some(base) => plan.staging.join(base),
        None => plan.staging.clone(),
    };

    let mut task_failures = 0;
    for command in &plan.tasks {
        let cmd = command.clone();
        let cwd = staged.clone();
        let task_runner = runner.clone();
        let result = tokio::task::spawn_blocking(move || task_runner.run(&cmd, &cwd)).await;
        let failure = match result {
            Ok(Ok(output)) if output.succeeded() => {
                if !output.stdout.trim().is_empty() {
                    utils::log(output.stdout.trim());
                }
                None
            }
            Ok(Ok(output)) if !output.stderr.trim().is_empty() => {
                Some(output.stderr.trim().to_string())
            }
            Ok(Ok(output)) => Some(match output.status {
                Some(code) => format!("exit status {}", code),
                None => "terminated by signal".to_string(),
            }),
            Ok(Err(BiddleError::Task { reason, .. })) => Some(reason),
            Ok(Err(e)) => Some(e.to_string()),
            Err(join_err) => Some(join_err.to_string()),
        };
        if let Some(reason) = failure {
            task_failures += 1;
            let err = BiddleError::Task {
                variant: variant.clone(),
                command: command.clone(),
                reason,
            };
            utils::log_error(&err.to_string());
        }
    }

    let archive_tool = archiver.clone();
    let (src, out) = (staged.clone(), plan.archive.clone());
    let archive = tokio::task::spawn_blocking(move || archive_tool.archive(&src, &out))
        .await
        .map_err(|e| BiddleError::Archive {
            operation: "archive",
            path: plan.archive.display().to_string(),
            reason: e.to_string(),
        })??;

    let digest = integrity::digest_file(&archive, HashContext::General).await?;
    let sidecar = sidecar_path(&archive);
    tokio::fs::write(&sidecar, &digest)
        .await
        .io_context("write", &sidecar)?;
    let size = tokio::fs::metadata(&archive)
        .await
        .io_context("stat", &archive)?
        .len();
    utils::log(&format!(
        "File {} written at {} bytes.",
        archive.display(),
        commas(size)
    ));

    Ok(VariantOutcome {
        record: VersionHistoryRecord {
            date: history::today(),
            filename: file_name(&archive),
            size,
            variant: plan.label.clone(),
            version: plan.version,
        },
        label: plan.label,
        archive,
        sidecar,
        task_failures,
    })
}

/// Everything a failed publish must undo.
struct Rollback {
    staging: PathBuf,
    /// Set when this session created the publish directory.
    pubdir: Option<PathBuf>,
    files: Vec<PathBuf>,
    /// Latest aliases replaced so far, with the backup of each previous alias.
    aliases: Vec<(PathBuf, Option<PathBuf>)>,
    history: Option<VersionHistory>,
    latest_marker: Option<String>,
}

impl Rollback {
    async fn run(self) {
        let undo = async {
            utils::remove_path(&self.staging).await?;
            if let Some(pubdir) = &self.pubdir {
                return utils::remove_path(pubdir).await;
            }
            for (alias, backup) in &self.aliases {
                match backup {
                    Some(backup) => tokio::fs::rename(backup, alias)
                        .await
                        .io_context("rename", alias)?,
                    None => utils::remove_path(alias).await?,
                }
            }
            for file in &self.files {
                utils::remove_path(file).await?;
            }
            let pubdir = self
                .files
                .first()
                .and_then(|f| f.parent())
                .map(Path::to_path_buf);
            if let Some(dir) = pubdir {
                if let Some(history) = &self.history {
                    history.save(&dir).await?;
                }
                match self.latest_marker.as_deref() {
                    Some("") => utils::remove_path(&dir.join(LATEST_MARKER)).await?,
                    Some(previous) => {
                        utils::write_atomic(&dir.join(LATEST_MARKER), previous.as_bytes()).await?
                    }
                    None => {}
                }
            }
            Ok::<(), BiddleError>(())
        };
        if let Err(e) = undo.await {
            utils::log_error(&format!("Cleanup after failed publish was incomplete: {}", e));
        }
    }

    /// The publish is committed: drop staging and alias backups. Failures here
    /// are logged only.
    async fn discard(self) {
        let backups = self.aliases.iter().filter_map(|(_, backup)| backup.as_ref());
        for path in std::iter::once(&self.staging).chain(backups) {
            if let Err(e) = utils::remove_path(path).await {
                utils::log_error(&format!("Cleanup after publish was incomplete: {}", e));
            }
        }
    }
}

/// Delete a package's publish directory and its catalog entry.
pub async fn unpublish(store: &mut CatalogStore, name: &str) -> Result<PublishedEntry> {
    let entry = store
        .published(name)
        .cloned()
        .ok_or_else(|| BiddleError::NotFound {
            what: "published application",
            name: name.to_string(),
        })?;
    if !entry.directory.is_empty() {
        utils::remove_path(Path::new(&entry.directory)).await?;
    }
    store.remove_published(name);
    if let Err(e) = store.flush_published().await {
        store.restore_published(name, Some(entry));
        return Err(e);
    }
    utils::log(&format!("Application {} is unpublished.", name));
    Ok(entry)
}
