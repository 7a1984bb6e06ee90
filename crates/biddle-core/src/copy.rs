//! Recursive tree copy with exclusions.
//!
//! A single coordinating task owns the session counters. Every file, directory,
//! and symlink is one unit spawned on a `JoinSet`; directory units hand their
//! children back to the coordinator, which spawns them and bumps `started`.
//! The copy completes exactly once, when `finished == started`.

use std::ffi::OsStr;
use std::fs::Metadata;
use std::path::{Path, PathBuf, MAIN_SEPARATOR};
use std::sync::Arc;

use filetime::FileTime;
use tokio::task::JoinSet;

use crate::error::{BiddleError, IoContext, Result};
use crate::utils::{self, absolutize};

/// What a finished copy produced.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CopyCounts {
    pub files: usize,
    pub dirs: usize,
    pub links: usize,
}

#[derive(Debug, Default)]
struct CopySession {
    started: usize,
    finished: usize,
    counts: CopyCounts,
}

enum UnitOutcome {
    File,
    Link,
    Dir { path: PathBuf, children: Vec<PathBuf> },
    Skipped,
    Other,
}

/// Copy `source` to `destination/<basename(source)>`, skipping any item whose
/// destination path matches an exclusion. On the first error no further units
/// are dispatched, the outstanding ones are drained, and the partially written
/// item is removed.
pub async fn copy(source: &Path, destination: &Path, exclusions: &[String]) -> Result<CopyCounts> {
    let source = absolutize(source)?;
    let destination = absolutize(destination)?;
    let name = source
        .file_name()
        .ok_or_else(|| BiddleError::io(
            "copy",
            &source,
            std::io::Error::new(std::io::ErrorKind::InvalidInput, "source has no file name"),
        ))?
        .to_owned();
    let top = destination.join(&name);
    let preexisting = tokio::fs::symlink_metadata(&top).await.is_ok();
    let exclusions: Arc<[String]> = exclusions
        .iter()
        .filter(|e| !e.is_empty())
        .cloned()
        .collect();

    let mut session = CopySession::default();
    let mut units = JoinSet::new();
    session.started += 1;
    units.spawn(copy_unit(source, destination, exclusions.clone(), true));

    while let Some(joined) = units.join_next().await {
        let outcome = match joined {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(e)) => return Err(abort(units, &top, preexisting, e).await),
            Err(join_err) => {
                let e = BiddleError::io(
                    "copy",
                    &top,
                    std::io::Error::new(std::io::ErrorKind::Other, join_err.to_string()),
                );
                return Err(abort(units, &top, preexisting, e).await);
            }
        };
        match outcome {
            UnitOutcome::File => session.counts.files += 1,
            UnitOutcome::Link => session.counts.links += 1,
            UnitOutcome::Dir { path, children } => {
                session.counts.dirs += 1;
                for child in children {
                    session.started += 1;
                    units.spawn(copy_unit(child, path.clone(), exclusions.clone(), false));
                }
            }
            UnitOutcome::Skipped | UnitOutcome::Other => {}
        }
        session.finished += 1;
        if session.finished == session.started {
            break;
        }
    }
    Ok(session.counts)
}

async fn abort(mut units: JoinSet<Result<UnitOutcome>>, top: &Path, preexisting: bool, err: BiddleError) -> BiddleError {
    // Aborting would not stop blocking fs calls already in flight; let them land first.
    while units.join_next().await.is_some() {}
    if !preexisting {
        if let Err(cleanup) = utils::remove_path(top).await {
            utils::log_error(&format!("Could not remove partial copy {}: {}", top.display(), cleanup));
        }
    }
    err
}

async fn copy_unit(item: PathBuf, dest_parent: PathBuf, exclusions: Arc<[String]>, top: bool) -> Result<UnitOutcome> {
    let Some(name) = item.file_name() else {
        return Ok(UnitOutcome::Other);
    };
    let dest = dest_parent.join(name);
    if is_excluded(&dest, name, &exclusions) {
        return Ok(UnitOutcome::Skipped);
    }

    let meta = tokio::fs::symlink_metadata(&item)
        .await
        .io_context("lstat", &item)?;
    let file_type = meta.file_type();

    if top && !file_type.is_dir() {
        tokio::fs::create_dir_all(&dest_parent)
            .await
            .io_context("create_dir", &dest_parent)?;
    }

    if file_type.is_symlink() {
        copy_link(&item, &dest).await?;
        Ok(UnitOutcome::Link)
    } else if file_type.is_dir() {
        tokio::fs::create_dir_all(&dest)
            .await
            .io_context("create_dir", &dest)?;
        let mut children = Vec::new();
        let mut entries = tokio::fs::read_dir(&item).await.io_context("read_dir", &item)?;
        while let Some(entry) = entries.next_entry().await.io_context("read_dir", &item)? {
            children.push(entry.path());
        }
        Ok(UnitOutcome::Dir { path: dest, children })
    } else if file_type.is_file() {
        copy_file(&item, &dest, &meta).await?;
        Ok(UnitOutcome::File)
    } else {
        Ok(UnitOutcome::Other)
    }
}

async fn copy_file(item: &Path, dest: &Path, meta: &Metadata) -> Result<()> {
    let mut reader = tokio::fs::File::open(item).await.io_context("open", item)?;
    let mut writer = tokio::fs::File::create(dest).await.io_context("create", dest)?;
    tokio::io::copy(&mut reader, &mut writer)
        .await
        .io_context("copy", dest)?;
    drop(writer);

    tokio::fs::set_permissions(dest, meta.permissions())
        .await
        .io_context("chmod", dest)?;
    let atime = FileTime::from_last_access_time(meta);
    let mtime = FileTime::from_last_modification_time(meta);
    filetime::set_file_times(dest, atime, mtime).io_context("utimes", dest)?;
    Ok(())
}

async fn copy_link(item: &Path, dest: &Path) -> Result<()> {
    let target = tokio::fs::read_link(item).await.io_context("readlink", item)?;
    let resolved = if target.is_absolute() {
        target
    } else {
        item.parent().unwrap_or(Path::new("/")).join(target)
    };
    let target_meta = tokio::fs::metadata(&resolved)
        .await
        .io_context("stat", &resolved)?;
    link(&resolved, dest, target_meta.is_dir())
        .await
        .io_context("symlink", dest)
}

#[cfg(unix)]
async fn link(target: &Path, dest: &Path, _is_dir: bool) -> std::io::Result<()> {
    tokio::fs::symlink(target, dest).await
}

#[cfg(windows)]
async fn link(target: &Path, dest: &Path, is_dir: bool) -> std::io::Result<()> {
    if is_dir {
        tokio::fs::symlink_dir(target, dest).await
    } else {
        tokio::fs::symlink_file(target, dest).await
    }
}

/// An exclusion matches when the destination path ends with it on a segment
/// boundary and its last segment is the item's own name.
pub fn is_excluded(dest: &Path, name: &OsStr, exclusions: &[String]) -> bool {
    let dest = dest.to_string_lossy();
    let name = name.to_string_lossy();
    exclusions.iter().any(|excl| {
        let excl = excl.trim_end_matches(['/', '\\']);
        if excl.is_empty() || dest.len() <= excl.len() || !dest.ends_with(excl) {
            return false;
        }
        let boundary = dest[..dest.len() - excl.len()].ends_with(['/', '\\', MAIN_SEPARATOR]);
        let last = excl.rsplit(['/', '\\']).next().unwrap_or(excl);
        boundary && last == name
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn build_tree(root: &Path) {
        fs::create_dir_all(root.join("src/nested")).unwrap();
        fs::create_dir_all(root.join("empty")).unwrap();
        fs::create_dir_all(root.join("node_modules/dep")).unwrap();
        fs::write(root.join("package.json"), "{}").unwrap();
        fs::write(root.join("src/main.js"), "console.log(1)").unwrap();
        fs::write(root.join("src/nested/deep.txt"), "deep").unwrap();
        fs::write(root.join("node_modules/dep/index.js"), "x").unwrap();
    }

    #[tokio::test]
    async fn test_copy_tree_is_complete() {
        let src = tempfile::tempdir().unwrap();
        let dst = tempfile::tempdir().unwrap();
        let root = src.path().join("app");
        build_tree(&root);

        let counts = copy(&root, dst.path(), &[]).await.unwrap();
        let out = dst.path().join("app");
        assert_eq!(fs::read_to_string(out.join("src/nested/deep.txt")).unwrap(), "deep");
        assert_eq!(fs::read_to_string(out.join("src/main.js")).unwrap(), "console.log(1)");
        assert!(out.join("empty").is_dir());
        assert_eq!(counts.files, 4);
        // app, src, nested, empty, node_modules, dep
        assert_eq!(counts.dirs, 6);
        assert_eq!(counts.links, 0);
    }

    #[tokio::test]
    async fn test_exclusions_are_respected() {
        let src = tempfile::tempdir().unwrap();
        let dst = tempfile::tempdir().unwrap();
        let root = src.path().join("app");
        build_tree(&root);

        let exclusions = vec!["node_modules".to_string(), format!("src{}nested", MAIN_SEPARATOR)];
        copy(&root, dst.path(), &exclusions).await.unwrap();
        let out = dst.path().join("app");
        assert!(!out.join("node_modules").exists());
        assert!(!out.join("src/nested").exists());
        assert!(out.join("src/main.js").is_file());
    }

    #[test]
    fn test_exclusion_requires_segment_boundary() {
        let excl = vec![format!("a{}b.txt", MAIN_SEPARATOR)];
        let hit = Path::new("/x").join("a").join("b.txt");
        let miss = Path::new("/x").join("ya").join("b.txt");
        assert!(is_excluded(&hit, OsStr::new("b.txt"), &excl));
        assert!(!is_excluded(&miss, OsStr::new("b.txt"), &excl));
        // the whole path is never excluded by itself
        assert!(!is_excluded(Path::new("b.txt"), OsStr::new("b.txt"), &["b.txt".into()]));
    }

    #[tokio::test]
    async fn test_copy_single_file_creates_parent() {
        let src = tempfile::tempdir().unwrap();
        let dst = tempfile::tempdir().unwrap();
        let file = src.path().join("notes.txt");
        fs::write(&file, "hello").unwrap();
        let old = FileTime::from_unix_time(1_000_000_000, 0);
        filetime::set_file_mtime(&file, old).unwrap();

        let target = dst.path().join("not/yet/there");
        let counts = copy(&file, &target, &[]).await.unwrap();
        assert_eq!(counts, CopyCounts { files: 1, dirs: 0, links: 0 });

        let copied = target.join("notes.txt");
        assert_eq!(fs::read_to_string(&copied).unwrap(), "hello");
        let meta = fs::metadata(&copied).unwrap();
        assert_eq!(FileTime::from_last_modification_time(&meta), old);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_symlinks_are_recreated() {
        use std::os::unix::fs::PermissionsExt;

        let src = tempfile::tempdir().unwrap();
        let dst = tempfile::tempdir().unwrap();
        let root = src.path().join("app");
        build_tree(&root);
        std::os::unix::fs::symlink("src/main.js", root.join("entry.js")).unwrap();
        std::os::unix::fs::symlink(root.join("src"), root.join("srclink")).unwrap();
        let script = root.join("run.sh");
        fs::write(&script, "#!/bin/sh\n").unwrap();
        fs::set_permissions(&script, fs::Permissions::from_mode(0o755)).unwrap();

        let counts = copy(&root, dst.path(), &[]).await.unwrap();
        assert_eq!(counts.links, 2);
        let out = dst.path().join("app");
        assert!(fs::symlink_metadata(out.join("entry.js")).unwrap().file_type().is_symlink());
        assert!(fs::symlink_metadata(out.join("srclink")).unwrap().file_type().is_symlink());
        assert_eq!(fs::read_to_string(out.join("entry.js")).unwrap(), "console.log(1)");
        let mode = fs::metadata(out.join("run.sh")).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o755);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_failure_removes_partial_destination() {
        let src = tempfile::tempdir().unwrap();
        let dst = tempfile::tempdir().unwrap();
        let root = src.path().join("app");
        build_tree(&root);
        std::os::unix::fs::symlink(root.join("missing-target"), root.join("dangling")).unwrap();

        let err = copy(&root, dst.path(), &[]).await.unwrap_err();
        assert!(matches!(err, BiddleError::Io { operation: "stat", .. }));
        assert!(!dst.path().join("app").exists());
    }

    #[tokio::test]
    async fn test_missing_source_is_an_error() {
        let dst = tempfile::tempdir().unwrap();
        let err = copy(&dst.path().join("nope"), dst.path(), &[]).await.unwrap_err();
        assert!(err.is_missing_path());
    }
}
