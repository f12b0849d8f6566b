//! Import element: a subtree of the staged sources becomes the artifact.

use crate::error::{IoResultExt, Result, SandboxError};
use crate::node::Node;
use crate::plugin::ElementPlugin;
use crate::sandbox::{BuildContext, Sandbox};

const INPUT_ROOT: &str = "/buildstream-import-input";

#[derive(Debug)]
pub struct ImportElement {
    source: String,
    target: String,
}

impl Default for ImportElement {
    fn default() -> Self {
        Self { source: "/".to_string(), target: "/".to_string() }
    }
}

impl ElementPlugin for ImportElement {
    fn configure(&mut self, node: &Node) -> Result<()> {
        node.validate_keys(&["source", "target"])?;
        self.source = node.get_str_opt("source")?.unwrap_or("/").to_string();
        self.target = node.get_str_opt("target")?.unwrap_or("/").to_string();
        Ok(())
    }

    fn unique_key(&self) -> serde_json::Value {
        serde_json::json!({ "source": self.source, "target": self.target })
    }

    fn configure_sandbox(&self, build: &BuildContext<'_>, sandbox: &mut Sandbox) -> Result<()> {
        sandbox.mark_directory(INPUT_ROOT)?;
        sandbox.mark_directory(&build.variable("install-root")?)
    }

    fn stage(&self, build: &BuildContext<'_>, sandbox: &mut Sandbox) -> Result<()> {
        build.stage_sources(sandbox, INPUT_ROOT)
    }

    fn assemble(&self, build: &BuildContext<'_>, sandbox: &mut Sandbox) -> Result<String> {
        let element = build.element();
        let source_host = sandbox
            .host_path(INPUT_ROOT)
            .join(self.source.trim_start_matches('/'));
        if !source_host.is_dir() {
            return Err(SandboxError::Collect {
                element: element.name.clone(),
                path: self.source.clone(),
                message: "import source subtree does not exist in the staged sources".to_string(),
            }
            .into());
        }
        let install_root = build.variable("install-root")?;
        let target_host = sandbox
            .host_path(&install_root)
            .join(self.target.trim_start_matches('/'));
        std::fs::create_dir_all(&target_host).map_err_path(&target_host)?;

        for entry in walkdir::WalkDir::new(&source_host).min_depth(1) {
            let entry = entry.map_err(|e| SandboxError::Collect {
                element: element.name.clone(),
                path: self.source.clone(),
                message: e.to_string(),
            })?;
            let rel = entry
                .path()
                .strip_prefix(&source_host)
                .expect("walkdir stays under its root");
            let dest = target_host.join(rel);
            if entry.file_type().is_dir() {
                std::fs::create_dir_all(&dest).map_err_path(&dest)?;
            } else {
                crate::utils::copy_entry(entry.path(), &dest)?;
            }
        }
        Ok(install_root)
    }
}
