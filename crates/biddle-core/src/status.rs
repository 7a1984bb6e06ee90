//! Compare installed versions with the latest marker at their publish location.

use tokio::task::JoinSet;

use crate::catalog::CatalogStore;
use crate::error::{BiddleError, Result};
use crate::fetch::Fetcher;
use crate::history::LATEST_MARKER;
use crate::utils::join_location;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusReport {
    pub name: String,
    pub installed: String,
    /// Latest published version, or None when the marker could not be read.
    pub published: Option<String>,
}

impl StatusReport {
    pub fn is_current(&self) -> bool {
        self.published.as_deref() == Some(self.installed.as_str())
    }
}

/// Check one installed package, or all of them when `name` is None.
pub async fn status(store: &CatalogStore, fetcher: &Fetcher, name: Option<&str>) -> Result<Vec<StatusReport>> {
    let targets: Vec<(String, String, String)> = match name {
        Some(n) => {
            let entry = store.installed(n).ok_or_else(|| BiddleError::NotFound {
                what: "biddle installed application",
                name: n.to_string(),
            })?;
            vec![(n.to_string(), entry.version.clone(), entry.published.clone())]
        }
        None => store
            .installed_entries()
            .map(|(n, e)| (n.clone(), e.version.clone(), e.published.clone()))
            .collect(),
    };
    if targets.is_empty() {
        return Err(BiddleError::NotFound {
            what: "applications installed by biddle",
            name: "none".to_string(),
        });
    }

    let mut checks = JoinSet::new();
    for (name, installed, published) in targets {
        let fetcher = fetcher.clone();
        checks.spawn(async move {
            let latest = if published.is_empty() {
                None
            } else {
                fetcher
                    .fetch_text(&join_location(&published, LATEST_MARKER))
                    .await
                    .ok()
                    .map(|t| t.trim().to_string())
            };
            StatusReport {
                name,
                installed,
                published: latest,
            }
        });
    }

    let mut reports = Vec::new();
    while let Some(joined) = checks.join_next().await {
        match joined {
            Ok(report) => reports.push(report),
            Err(e) => {
                return Err(BiddleError::network("status", "", e));
            }
        }
    }
    reports.sort_by(|a, b| a.name.cmp(&b.name));
    Ok(reports)
}
