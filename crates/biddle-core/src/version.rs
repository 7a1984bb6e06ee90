//! Ordering of dotted versions for deciding which publish is "latest".

/// Whether `candidate` should be considered newer than `latest`.
///
/// Components are compared left to right. A candidate that runs out of
/// components first is treated as newer, a latest that runs out first as
/// older. Numeric components compare numerically. A non-numeric latest
/// component makes the candidate older; a non-numeric candidate component
/// against a numeric one is skipped.
pub fn is_newer(candidate: &str, latest: &str) -> bool {
    if latest.is_empty() {
        return true;
    }
    let cand: Vec<&str> = candidate.split('.').collect();
    let last: Vec<&str> = latest.split('.').collect();
    let len = cand.len().max(last.len());

    for i in 0..len {
        let (c, l) = match (cand.get(i), last.get(i)) {
            (None, _) => return true,
            (_, None) => return false,
            (Some(c), Some(l)) => (*c, *l),
        };
        match (c.parse::<u64>(), l.parse::<u64>()) {
            (Ok(cn), Ok(ln)) => {
                if cn > ln {
                    return true;
                }
                if cn < ln {
                    return false;
                }
            }
            (_, Err(_)) => return false,
            _ => {}
        }
    }
    true
}

/// Versions tagged alpha/beta never displace an established latest.
pub fn is_prerelease(version: &str) -> bool {
    let lower = version.to_ascii_lowercase();
    lower.contains("alpha") || lower.contains("beta")
}

/// Decide whether a newly published version becomes the package's latest.
pub fn becomes_latest(candidate: &str, latest: &str) -> bool {
    if latest.is_empty() {
        return true;
    }
    !is_prerelease(candidate) && is_newer(candidate, latest)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_latest() {
        assert!(is_newer("0.0.1", ""));
        assert!(becomes_latest("1.0.0-beta", ""));
    }

    #[test]
    fn test_numeric_not_lexicographic() {
        assert!(is_newer("1.10.0", "1.9.0"));
        assert!(!is_newer("1.9.0", "1.10.0"));
        assert!(is_newer("2.0.0", "1.99.99"));
    }

    #[test]
    fn test_length_mismatch() {
        // the shorter candidate is treated as newer
        assert!(is_newer("1.0", "1.0.0"));
        assert!(!is_newer("1.0.0", "1.0"));
    }

    #[test]
    fn test_equal_versions() {
        assert!(is_newer("1.2.3", "1.2.3"));
    }

    #[test]
    fn test_non_numeric_latest_component() {
        assert!(!is_newer("1.0.5", "1.0.x"));
        assert!(!is_newer("1.x.0", "1.x.0"));
        assert!(is_newer("1.x.1", "1.0.0"));
    }

    #[test]
    fn test_prerelease_never_displaces_latest() {
        assert!(is_prerelease("2.0.0-Beta.1"));
        assert!(is_prerelease("3.0.0alpha"));
        assert!(!becomes_latest("2.0.0-beta", "1.0.0"));
        assert!(becomes_latest("2.0.0", "1.0.0"));
    }

    #[test]
    fn test_latest_is_monotonic_over_a_sequence() {
        let mut latest = String::new();
        for v in ["1.0.0", "1.2.0", "1.1.0", "1.10.0", "1.9.9"] {
            if becomes_latest(v, &latest) {
                latest = v.to_string();
            }
        }
        assert_eq!(latest, "1.10.0");
    }
}
