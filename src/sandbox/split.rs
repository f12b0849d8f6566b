//! Split-rule categorisation.
//!
//! Split rules partition an artifact tree into named domains (`runtime`,
//! `devel`, ...) by glob over sandbox-absolute paths. Domains drive the
//! compose and filter element kinds and are recorded in the artifact proto.

use glob::{MatchOptions, Pattern};
use std::collections::BTreeMap;

fn match_options() -> MatchOptions {
    MatchOptions {
        case_sensitive: true,
        require_literal_separator: true,
        require_literal_leading_dot: false,
    }
}

/// Maps each domain to the files it claims. `files` are sandbox-absolute
/// paths; rules are variable-expanded glob lists per domain. A file may land
/// in several domains; files claimed by none are orphans.
pub fn compute_splits(
    rules: &BTreeMap<String, Vec<String>>,
    files: &[String],
) -> BTreeMap<String, Vec<String>> {
    let mut out = BTreeMap::new();
    for (domain, globs) in rules {
        let patterns: Vec<Pattern> =
            globs.iter().filter_map(|g| Pattern::new(g).ok()).collect();
        let mut matched: Vec<String> = files
            .iter()
            .filter(|file| patterns.iter().any(|p| p.matches_with(file, match_options())))
            .cloned()
            .collect();
        matched.sort();
        out.insert(domain.clone(), matched);
    }
    out
}

/// Files claimed by none of the domains.
pub fn orphans(splits: &BTreeMap<String, Vec<String>>, files: &[String]) -> Vec<String> {
    let mut orphans: Vec<String> = files
        .iter()
        .filter(|f| !splits.values().any(|claimed| claimed.contains(f)))
        .cloned()
        .collect();
    orphans.sort();
    orphans
}

/// Selects the file set for a domain request: the union of `include` (all
/// domains when empty) minus `exclude`, plus orphans when requested.
pub fn select(
    splits: &BTreeMap<String, Vec<String>>,
    files: &[String],
    include: &[String],
    exclude: &[String],
    include_orphans: bool,
) -> Vec<String> {
    let mut selected: Vec<String> = Vec::new();
    let included: Vec<&String> = if include.is_empty() {
        splits.keys().collect()
    } else {
        include.iter().collect()
    };
    for domain in included {
        if let Some(claimed) = splits.get(domain) {
            selected.extend(claimed.iter().cloned());
        }
    }
    if include_orphans {
        selected.extend(orphans(splits, files));
    }
    let mut excluded: Vec<&String> = Vec::new();
    for domain in exclude {
        if let Some(claimed) = splits.get(domain) {
            excluded.extend(claimed.iter());
        }
    }
    selected.retain(|f| !excluded.contains(&f));
    selected.sort();
    selected.dedup();
    selected
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn rules() -> BTreeMap<String, Vec<String>> {
        let mut rules = BTreeMap::new();
        rules.insert(
            "runtime".to_string(),
            vec!["/usr/bin".to_string(), "/usr/bin/*".to_string(), "/usr/lib/lib*.so*".to_string()],
        );
        rules.insert(
            "devel".to_string(),
            vec!["/usr/include".to_string(), "/usr/include/**".to_string(), "/usr/lib/lib*.a".to_string()],
        );
        rules
    }

    fn files() -> Vec<String> {
        [
            "/usr/bin/tool",
            "/usr/lib/libfoo.so.1",
            "/usr/lib/libfoo.a",
            "/usr/include/foo.h",
            "/usr/include/bar/baz.h",
            "/usr/share/doc/README",
        ]
        .iter()
        .map(|s| s.to_string())
        .collect()
    }

    #[test]
    fn domains_claim_their_files() {
        let splits = compute_splits(&rules(), &files());
        assert_eq!(splits["runtime"], vec!["/usr/bin/tool", "/usr/lib/libfoo.so.1"]);
        assert_eq!(
            splits["devel"],
            vec!["/usr/include/bar/baz.h", "/usr/include/foo.h", "/usr/lib/libfoo.a"]
        );
    }

    #[test]
    fn unclaimed_files_are_orphans() {
        let splits = compute_splits(&rules(), &files());
        assert_eq!(orphans(&splits, &files()), vec!["/usr/share/doc/README"]);
    }

    #[test]
    fn selection_includes_excludes_and_orphans() {
        let splits = compute_splits(&rules(), &files());
        let runtime_only = select(&splits, &files(), &["runtime".to_string()], &[], false);
        assert_eq!(runtime_only, vec!["/usr/bin/tool", "/usr/lib/libfoo.so.1"]);

        let all_minus_devel = select(&splits, &files(), &[], &["devel".to_string()], true);
        assert!(all_minus_devel.contains(&"/usr/bin/tool".to_string()));
        assert!(all_minus_devel.contains(&"/usr/share/doc/README".to_string()));
        assert!(!all_minus_devel.contains(&"/usr/include/foo.h".to_string()));
    }
}
