//! `package.json` as read by publish and install.

use std::collections::BTreeMap;
use std::path::Path;

use serde::Deserialize;
use serde_json::Value;

use crate::error::{BiddleError, Result};
use crate::utils::sanitize_name;

pub const DESCRIPTOR_FILE: &str = "package.json";

#[derive(Debug, Default, Deserialize)]
struct RawVariant {
    #[serde(default)]
    exclusions: Vec<String>,
    #[serde(default)]
    tasks: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct RawDescriptor {
    name: Option<Value>,
    version: Option<Value>,
    author: Option<Value>,
    #[serde(default)]
    publication_variants: BTreeMap<String, RawVariant>,
}

/// A named build of the package: its own exclusions and pre-archive tasks.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Variant {
    pub name: String,
    pub exclusions: Vec<String>,
    pub tasks: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PackageDescriptor {
    /// Sanitized name, used as the catalog key.
    pub name: String,
    pub version: String,
    pub author: Option<String>,
    /// Declared variants in name order; the primary variant is implicit.
    pub variants: Vec<Variant>,
}

fn non_empty_string(value: Option<Value>) -> Option<String> {
    match value {
        Some(Value::String(s)) if !s.trim().is_empty() => Some(s.trim().to_string()),
        _ => None,
    }
}

fn author_name(value: Option<Value>) -> Option<String> {
    match value {
        Some(Value::Object(map)) => non_empty_string(map.get("name").cloned()),
        other => non_empty_string(other),
    }
}

impl PackageDescriptor {
    pub fn parse(text: &str, origin: &Path) -> Result<Self> {
        let invalid = |reason: String| BiddleError::DescriptorInvalid {
            path: origin.display().to_string(),
            reason,
        };
        let raw: RawDescriptor =
            serde_json::from_str(text).map_err(|e| invalid(e.to_string()))?;

        let name = non_empty_string(raw.name)
            .map(|n| sanitize_name(&n))
            .filter(|n| !n.is_empty())
            .ok_or_else(|| invalid("missing a name".to_string()))?;
        let version = non_empty_string(raw.version)
            .ok_or_else(|| invalid("missing a version".to_string()))?;

        let variants = raw
            .publication_variants
            .into_iter()
            .filter(|(name, _)| !name.trim().is_empty())
            .map(|(name, v)| Variant {
                name,
                exclusions: v.exclusions,
                tasks: v.tasks,
            })
            .collect();

        Ok(PackageDescriptor {
            name,
            version,
            author: author_name(raw.author),
            variants,
        })
    }

    /// Read `<dir>/package.json`.
    pub async fn load(dir: &Path) -> Result<Self> {
        let path = dir.join(DESCRIPTOR_FILE);
        let text = tokio::fs::read_to_string(&path).await.map_err(|e| {
            BiddleError::DescriptorInvalid {
                path: path.display().to_string(),
                reason: e.to_string(),
            }
        })?;
        Self::parse(&text, &path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(text: &str) -> Result<PackageDescriptor> {
        PackageDescriptor::parse(text, Path::new("package.json"))
    }

    #[test]
    fn test_parse_full_descriptor() {
        let d = parse(
            r#"{
                "name": "my app",
                "version": "1.0.0",
                "author": {"name": "Pat"},
                "publication_variants": {
                    "min": {"exclusions": ["docs"], "tasks": ["npm run build"]},
                    "debug": {}
                }
            }"#,
        )
        .unwrap();
        assert_eq!(d.name, "myapp");
        assert_eq!(d.version, "1.0.0");
        assert_eq!(d.author.as_deref(), Some("Pat"));
        let names: Vec<_> = d.variants.iter().map(|v| v.name.as_str()).collect();
        assert_eq!(names, vec!["debug", "min"]);
        assert_eq!(d.variants[1].tasks, vec!["npm run build".to_string()]);
    }

    #[test]
    fn test_missing_name_or_version() {
        assert!(matches!(
            parse(r#"{"version":"1.0.0"}"#),
            Err(BiddleError::DescriptorInvalid { .. })
        ));
        assert!(matches!(
            parse(r#"{"name":"sample","version":""}"#),
            Err(BiddleError::DescriptorInvalid { .. })
        ));
        assert!(matches!(
            parse(r#"{"name":"%%%","version":"1.0.0"}"#),
            Err(BiddleError::DescriptorInvalid { .. })
        ));
    }

    #[test]
    fn test_malformed_json() {
        let err = parse("{ not json").unwrap_err();
        assert!(err.to_string().contains("Invalid package descriptor"));
    }

    #[tokio::test]
    async fn test_load_missing_descriptor() {
        let dir = tempfile::tempdir().unwrap();
        let err = PackageDescriptor::load(dir.path()).await.unwrap_err();
        assert!(matches!(err, BiddleError::DescriptorInvalid { .. }));
    }

    #[test]
    fn test_string_author() {
        let d = parse(r#"{"name":"s","version":"1","author":"Sam <sam@example.com>"}"#).unwrap();
        assert_eq!(d.author.as_deref(), Some("Sam <sam@example.com>"));
        assert!(d.variants.is_empty());
    }
}
