//! Stack element: a dependency-grouping alias with an empty artifact.
//!
//! The loader promotes every stack dependency to both build and runtime;
//! sources are rejected there too. All that remains here is producing the
//! empty artifact root.

use crate::error::{IoResultExt, Result};
use crate::node::Node;
use crate::plugin::ElementPlugin;
use crate::sandbox::{BuildContext, Sandbox};

#[derive(Debug, Default)]
pub struct StackElement;

impl ElementPlugin for StackElement {
    fn configure(&mut self, node: &Node) -> Result<()> {
        node.validate_keys(&[])?;
        Ok(())
    }

    fn configure_sandbox(&self, build: &BuildContext<'_>, sandbox: &mut Sandbox) -> Result<()> {
        sandbox.mark_directory(&build.variable("install-root")?)
    }

    fn stage(&self, _build: &BuildContext<'_>, _sandbox: &mut Sandbox) -> Result<()> {
        Ok(())
    }

    fn assemble(&self, build: &BuildContext<'_>, sandbox: &mut Sandbox) -> Result<String> {
        let install_root = build.variable("install-root")?;
        let host = sandbox.host_path(&install_root);
        std::fs::create_dir_all(&host).map_err_path(&host)?;
        Ok(install_root)
    }
}
