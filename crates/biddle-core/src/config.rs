//! Tool home layout and optional `.biddlerc` (JSON) overrides.

use std::path::{Path, PathBuf, MAIN_SEPARATOR};

use serde::Deserialize;

use crate::utils::{self, LOG_FILE};

pub const RC_FILE: &str = ".biddlerc";
pub const INSTALLED_CATALOG: &str = "installed.json";
pub const PUBLISHED_CATALOG: &str = "published.json";

/// `directories` block of `.biddlerc`.
#[derive(Debug, Default, Clone, Deserialize)]
pub struct RcDirectories {
    pub applications: Option<String>,
    pub downloads: Option<String>,
    pub publications: Option<String>,
}

/// Optional config from `.biddlerc`. Missing or invalid file = default.
#[derive(Debug, Default, Clone, Deserialize)]
pub struct RcConfig {
    #[serde(default)]
    pub directories: RcDirectories,
    #[serde(default)]
    pub exclusions: Vec<String>,
}

/// Load `.biddlerc` from `dir`. A malformed file is reported in the log and ignored.
pub fn load_rc(dir: &Path) -> RcConfig {
    let path = dir.join(RC_FILE);
    if !path.is_file() {
        return RcConfig::default();
    }
    let Ok(s) = std::fs::read_to_string(&path) else {
        return RcConfig::default();
    };
    match serde_json::from_str::<RcConfig>(&s) {
        Ok(rc) => rc,
        Err(e) => {
            utils::log_error(&format!("Ignoring {}: {}", path.display(), e));
            RcConfig::default()
        }
    }
}

/// Where everything lives under the tool home.
#[derive(Debug, Clone)]
pub struct Layout {
    pub home: PathBuf,
    pub applications: PathBuf,
    pub downloads: PathBuf,
    pub publications: PathBuf,
    pub temp: PathBuf,
    /// Global ignore list applied to every staged copy.
    pub ignore: Vec<String>,
}

impl Layout {
    pub fn new(home: impl Into<PathBuf>) -> Self {
        let home = home.into();
        Layout {
            applications: home.join("applications"),
            downloads: home.join("downloads"),
            publications: home.join("publications"),
            temp: home.join("temp"),
            ignore: Vec::new(),
            home,
        }
    }

    /// Layout rooted at `$BIDDLE_HOME` or `~/.biddle`.
    pub fn from_env() -> Self {
        Layout::new(utils::home_dir())
    }

    /// Apply `.biddlerc` overrides. Custom directories resolve against `base`
    /// and are added to the ignore list along with the rc exclusions.
    pub fn with_rc(mut self, rc: &RcConfig, base: &Path) -> Self {
        let dirs = &rc.directories;
        for (value, slot) in [
            (&dirs.applications, &mut self.applications),
            (&dirs.downloads, &mut self.downloads),
            (&dirs.publications, &mut self.publications),
        ] {
            if let Some(v) = value.as_deref().filter(|v| !v.trim().is_empty()) {
                *slot = base.join(v);
                self.ignore.push(normalize_separators(v));
            }
        }
        if !rc.exclusions.is_empty() {
            self.ignore
                .extend(rc.exclusions.iter().map(|e| normalize_separators(e)));
            self.ignore.push(RC_FILE.to_string());
        }
        self
    }

    pub fn installed_catalog(&self) -> PathBuf {
        self.home.join(INSTALLED_CATALOG)
    }

    pub fn published_catalog(&self) -> PathBuf {
        self.home.join(PUBLISHED_CATALOG)
    }

    pub fn log_file(&self) -> PathBuf {
        self.home.join(LOG_FILE)
    }

    /// Create the home and its standard subdirectories.
    pub async fn ensure(&self) -> crate::Result<()> {
        use crate::error::IoContext;
        for dir in [
            &self.home,
            &self.applications,
            &self.downloads,
            &self.publications,
            &self.temp,
        ] {
            tokio::fs::create_dir_all(dir)
                .await
                .io_context("create_dir", dir)?;
        }
        Ok(())
    }
}

fn normalize_separators(value: &str) -> String {
    value
        .trim_end_matches(['/', '\\'])
        .replace(['/', '\\'], &MAIN_SEPARATOR.to_string())
}
