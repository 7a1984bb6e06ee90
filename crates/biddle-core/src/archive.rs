//! Archive codec boundary. Sessions receive an `ArchiveTool` so tests can
//! substitute their own; the default writes gzip-compressed tarballs.

use std::fs::File;
use std::io::{BufReader, BufWriter};
use std::path::{Path, PathBuf};

use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;

use crate::error::{BiddleError, Result};

/// Extension of every archive biddle writes.
pub const ARCHIVE_EXTENSION: &str = "tgz";

/// Packs a directory's contents into one file and unpacks it again.
/// Implementations are blocking; sessions call them through `spawn_blocking`.
pub trait ArchiveTool: Send + Sync {
    /// Archive the contents of `source_dir` (no top-level directory) to `out_path`.
    fn archive(&self, source_dir: &Path, out_path: &Path) -> Result<PathBuf>;

    /// Unpack `archive` into `dest_dir`, creating it if needed.
    fn unarchive(&self, archive: &Path, dest_dir: &Path) -> Result<()>;
}

/// tar + gzip via the `tar` and `flate2` crates.
#[derive(Debug, Default, Clone, Copy)]
pub struct TarGzArchiver;

fn archive_error(operation: &'static str, path: &Path, reason: impl ToString) -> BiddleError {
    BiddleError::Archive {
        operation,
        path: path.display().to_string(),
        reason: reason.to_string(),
    }
}

impl ArchiveTool for TarGzArchiver {
    fn archive(&self, source_dir: &Path, out_path: &Path) -> Result<PathBuf> {
        if !source_dir.is_dir() {
            return Err(archive_error("archive", source_dir, "not a directory"));
        }
        if let Some(parent) = out_path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| archive_error("archive", parent, e))?;
        }
        let file = File::create(out_path).map_err(|e| archive_error("archive", out_path, e))?;
        let encoder = GzEncoder::new(BufWriter::new(file), Compression::default());
        let mut builder = tar::Builder::new(encoder);
        builder.follow_symlinks(true);
        builder
            .append_dir_all(".", source_dir)
            .map_err(|e| archive_error("archive", source_dir, e))?;
        let encoder = builder
            .into_inner()
            .map_err(|e| archive_error("archive", out_path, e))?;
        encoder
            .finish()
            .map_err(|e| archive_error("archive", out_path, e))?;
        Ok(out_path.to_path_buf())
    }

    fn unarchive(&self, archive: &Path, dest_dir: &Path) -> Result<()> {
        let f = File::open(archive).map_err(|e| archive_error("unarchive", archive, e))?;
        let dec = GzDecoder::new(BufReader::new(f));
        let mut tarball = tar::Archive::new(dec);
        tarball.set_preserve_mtime(true);

        std::fs::create_dir_all(dest_dir).map_err(|e| archive_error("unarchive", dest_dir, e))?;

        for entry in tarball
            .entries()
            .map_err(|e| archive_error("unarchive", archive, e))?
        {
            let mut entry = entry.map_err(|e| archive_error("unarchive", archive, e))?;
            // unpack_in refuses entries that would escape dest_dir
            entry
                .unpack_in(dest_dir)
                .map_err(|e| archive_error("unarchive", archive, e))?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn test_archive_then_unarchive_restores_contents() {
        let src = tempfile::tempdir().unwrap();
        fs::create_dir_all(src.path().join("lib")).unwrap();
        fs::write(src.path().join("package.json"), r#"{"name":"sample","version":"1.0.0"}"#).unwrap();
        fs::write(src.path().join("lib/index.js"), "module.exports = 1;").unwrap();

        let out = tempfile::tempdir().unwrap();
        let archive = out.path().join("pubs/sample_1.0.0.tgz");
        let written = TarGzArchiver.archive(src.path(), &archive).unwrap();
        assert_eq!(written, archive);
        assert!(archive.is_file());

        let dest = out.path().join("apps/sample");
        TarGzArchiver.unarchive(&archive, &dest).unwrap();
        assert!(dest.join("package.json").is_file());
        assert_eq!(
            fs::read_to_string(dest.join("lib/index.js")).unwrap(),
            "module.exports = 1;"
        );
    }

    #[test]
    fn test_unarchive_rejects_garbage() {
        let dir = tempfile::tempdir().unwrap();
        let bogus = dir.path().join("bogus.tgz");
        fs::write(&bogus, "this is not gzip").unwrap();
        let err = TarGzArchiver
            .unarchive(&bogus, &dir.path().join("out"))
            .unwrap_err();
        assert!(matches!(err, BiddleError::Archive { operation: "unarchive", .. }));
    }

    #[test]
    fn test_archive_requires_directory() {
        let dir = tempfile::tempdir().unwrap();
        let err = TarGzArchiver
            .archive(&dir.path().join("missing"), &dir.path().join("x.tgz"))
            .unwrap_err();
        assert!(matches!(err, BiddleError::Archive { .. }));
    }
}
