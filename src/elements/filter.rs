//! Filter element: exactly one build dependency, reduced to selected
//! domains.

use crate::error::{Error, Result};
use crate::node::Node;
use crate::plugin::ElementPlugin;
use crate::sandbox::{split, BuildContext, Sandbox};

#[derive(Debug, Default)]
pub struct FilterElement {
    include: Vec<String>,
    exclude: Vec<String>,
    include_orphans: bool,
}

impl FilterElement {
    fn single_dependency(&self, build: &BuildContext<'_>) -> Result<crate::element::ElementId> {
        let element = build.element();
        let deps: Vec<_> = element.direct_deps(true).collect();
        if deps.len() != 1 {
            return Err(Error::User(format!(
                "filter element '{}' requires exactly one build dependency, found {}",
                element.name,
                deps.len()
            )));
        }
        Ok(deps[0].target)
    }
}

impl ElementPlugin for FilterElement {
    fn configure(&mut self, node: &Node) -> Result<()> {
        node.validate_keys(&["include", "exclude", "include-orphans"])?;
        self.include = node.get_str_list_opt("include")?;
        self.exclude = node.get_str_list_opt("exclude")?;
        self.include_orphans = node.get_bool("include-orphans", false)?;
        Ok(())
    }

    fn unique_key(&self) -> serde_json::Value {
        serde_json::json!({
            "include": self.include,
            "exclude": self.exclude,
            "include-orphans": self.include_orphans,
        })
    }

    fn configure_sandbox(&self, build: &BuildContext<'_>, sandbox: &mut Sandbox) -> Result<()> {
        sandbox.mark_directory(&build.variable("install-root")?)
    }

    fn stage(&self, build: &BuildContext<'_>, sandbox: &mut Sandbox) -> Result<()> {
        let dep = self.single_dependency(build)?;
        build.stage_artifact(sandbox, dep, "/")
    }

    fn assemble(&self, build: &BuildContext<'_>, sandbox: &mut Sandbox) -> Result<String> {
        let dep = self.single_dependency(build)?;
        let install_root = build.variable("install-root")?;
        let dest_root = sandbox.host_path(&install_root);

        let mut files: Vec<String> =
            sandbox.ledger.paths().map(|(path, _)| path.to_string()).collect();
        files.sort();
        let rules = build.graph.get(dep).split_rules()?;
        let splits = split::compute_splits(&rules, &files);
        let selected =
            split::select(&splits, &files, &self.include, &self.exclude, self.include_orphans);
        for path in selected {
            let src = sandbox.host_path(&path);
            let dest = dest_root.join(path.trim_start_matches('/'));
            crate::utils::copy_entry(&src, &dest)?;
        }
        Ok(install_root)
    }
}
