//! Compose element: the domain-filtered union of its build dependencies.
//!
//! Every build-scope dependency is staged, integration commands run (unless
//! disabled), then each staged file is attributed to the element that owns
//! it in the overlap ledger and filtered through that element's split rules.

use crate::element::ElementId;
use crate::error::Result;
use crate::node::Node;
use crate::plugin::ElementPlugin;
use crate::sandbox::{split, BuildContext, Sandbox};
use std::collections::HashMap;

#[derive(Debug, Default)]
pub struct ComposeElement {
    integrate: bool,
    include: Vec<String>,
    exclude: Vec<String>,
    include_orphans: bool,
}

impl ElementPlugin for ComposeElement {
    fn configure(&mut self, node: &Node) -> Result<()> {
        node.validate_keys(&["integrate", "include", "exclude", "include-orphans"])?;
        self.integrate = node.get_bool("integrate", true)?;
        self.include = node.get_str_list_opt("include")?;
        self.exclude = node.get_str_list_opt("exclude")?;
        self.include_orphans = node.get_bool("include-orphans", true)?;
        Ok(())
    }

    fn unique_key(&self) -> serde_json::Value {
        serde_json::json!({
            "integrate": self.integrate,
            "include": self.include,
            "exclude": self.exclude,
            "include-orphans": self.include_orphans,
        })
    }

    fn configure_sandbox(&self, build: &BuildContext<'_>, sandbox: &mut Sandbox) -> Result<()> {
        sandbox.mark_directory(&build.variable("install-root")?)
    }

    fn stage(&self, build: &BuildContext<'_>, sandbox: &mut Sandbox) -> Result<()> {
        build.stage_dependencies(sandbox)?;
        if self.integrate {
            build.integrate(sandbox)?;
        }
        Ok(())
    }

    fn assemble(&self, build: &BuildContext<'_>, sandbox: &mut Sandbox) -> Result<String> {
        let install_root = build.variable("install-root")?;
        let dest_root = sandbox.host_path(&install_root);

        // Attribute staged files to their owning element, then apply each
        // owner's split rules to the domain selection.
        let mut by_owner: HashMap<ElementId, Vec<String>> = HashMap::new();
        for (path, owner) in sandbox.ledger.paths() {
            by_owner.entry(owner).or_default().push(path.to_string());
        }

        for (owner, mut files) in by_owner {
            files.sort();
            let rules = build.graph.get(owner).split_rules()?;
            let splits = split::compute_splits(&rules, &files);
            let selected =
                split::select(&splits, &files, &self.include, &self.exclude, self.include_orphans);
            for path in selected {
                let src = sandbox.host_path(&path);
                if !src.exists() && src.symlink_metadata().is_err() {
                    // Integration may have rewritten or removed staged files.
                    continue;
                }
                let dest = dest_root.join(path.trim_start_matches('/'));
                crate::utils::copy_entry(&src, &dest)?;
            }
        }
        Ok(install_root)
    }
}
