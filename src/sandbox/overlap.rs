//! Overlap detection during staging.
//!
//! While dependency trees are staged into the sandbox the ledger records
//! which element owns each path. Writing a path that another element already
//! owns with *different* contents is an overlap: permitted with a warning
//! when the incoming element's whitelist covers the path, fatal otherwise.
//! Identical bytes at the same path are never an overlap.

use crate::cas::Digest;
use crate::element::ElementId;
use crate::error::SandboxError;
use glob::{MatchOptions, Pattern};
use std::collections::HashMap;

#[derive(Clone, Debug)]
pub struct OverlapWarning {
    pub path: String,
    pub first: String,
    pub second: String,
}

#[derive(Debug, Default)]
pub struct OverlapLedger {
    /// Sandbox-absolute path -> (owner, content digest).
    owners: HashMap<String, (ElementId, Digest)>,
    warnings: Vec<OverlapWarning>,
}

fn match_options() -> MatchOptions {
    MatchOptions {
        case_sensitive: true,
        require_literal_separator: true,
        require_literal_leading_dot: false,
    }
}

impl OverlapLedger {
    /// Records that `element` stages `digest` at `path` (sandbox-absolute).
    ///
    /// `whitelist` is the incoming element's overlap whitelist, already
    /// variable-expanded. Returns whether the file should actually be
    /// written (the previous owner keeps identical contents untouched).
    pub fn record(
        &mut self,
        path: &str,
        digest: Digest,
        element: ElementId,
        element_name: &str,
        first_name: impl Fn(ElementId) -> String,
        whitelist: &[String],
    ) -> Result<bool, SandboxError> {
        match self.owners.get(path) {
            None => {
                self.owners.insert(path.to_string(), (element, digest));
                Ok(true)
            }
            Some((_, existing)) if *existing == digest => Ok(false),
            Some((owner, _)) => {
                let first = first_name(*owner);
                let whitelisted = whitelist.iter().any(|pattern| {
                    Pattern::new(pattern)
                        .map(|p| p.matches_with(path, match_options()))
                        .unwrap_or(false)
                });
                if !whitelisted {
                    return Err(SandboxError::Overlap {
                        path: path.to_string(),
                        first,
                        second: element_name.to_string(),
                    });
                }
                self.warnings.push(OverlapWarning {
                    path: path.to_string(),
                    first,
                    second: element_name.to_string(),
                });
                self.owners.insert(path.to_string(), (element, digest));
                Ok(true)
            }
        }
    }

    /// The element owning a path after staging, if any.
    pub fn owner(&self, path: &str) -> Option<ElementId> {
        self.owners.get(path).map(|(id, _)| *id)
    }

    pub fn warnings(&self) -> &[OverlapWarning] {
        &self.warnings
    }

    pub fn paths(&self) -> impl Iterator<Item = (&str, ElementId)> {
        self.owners.iter().map(|(path, (id, _))| (path.as_str(), *id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn digest(content: &str) -> Digest {
        Digest::of_bytes(content.as_bytes())
    }

    fn name(_: ElementId) -> String {
        "base.bst".to_string()
    }

    #[test]
    fn identical_content_is_not_an_overlap() {
        let mut ledger = OverlapLedger::default();
        ledger
            .record("/usr/bin/foo", digest("same"), ElementId(0), "base.bst", name, &[])
            .unwrap();
        let write = ledger
            .record("/usr/bin/foo", digest("same"), ElementId(1), "other.bst", name, &[])
            .unwrap();
        assert!(!write);
        assert!(ledger.warnings().is_empty());
    }

    #[test]
    fn conflicting_content_is_fatal_without_whitelist() {
        let mut ledger = OverlapLedger::default();
        ledger
            .record("/usr/bin/foo", digest("a"), ElementId(0), "base.bst", name, &[])
            .unwrap();
        let err = ledger
            .record("/usr/bin/foo", digest("b"), ElementId(1), "tool.bst", name, &[])
            .unwrap_err();
        let message = err.to_string();
        assert!(message.contains("/usr/bin/foo"));
        assert!(message.contains("base.bst"));
        assert!(message.contains("tool.bst"));
    }

    #[test]
    fn whitelisted_overlap_warns_and_wins() {
        let mut ledger = OverlapLedger::default();
        ledger
            .record("/usr/bin/foo", digest("a"), ElementId(0), "base.bst", name, &[])
            .unwrap();
        let write = ledger
            .record(
                "/usr/bin/foo",
                digest("b"),
                ElementId(1),
                "tool.bst",
                name,
                &["/usr/bin/*".to_string()],
            )
            .unwrap();
        assert!(write);
        assert_eq!(ledger.warnings().len(), 1);
        assert_eq!(ledger.owner("/usr/bin/foo"), Some(ElementId(1)));
    }

    #[test]
    fn whitelist_globs_do_not_cross_separators() {
        let mut ledger = OverlapLedger::default();
        ledger
            .record("/usr/lib/deep/file", digest("a"), ElementId(0), "base.bst", name, &[])
            .unwrap();
        assert!(ledger
            .record(
                "/usr/lib/deep/file",
                digest("b"),
                ElementId(1),
                "tool.bst",
                name,
                &["/usr/lib/*".to_string()],
            )
            .is_err());
    }
}
