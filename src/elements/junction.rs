//! Junction element: imports a subproject.
//!
//! Junctions are consumed entirely by the loader, which stages their sources
//! and loads the subproject; they never enter the build graph and can never
//! be built. The plugin exists so the kind is registered, configuration is
//! validated uniformly, and third parties can look it up.

use crate::error::{Error, Result};
use crate::node::Node;
use crate::plugin::ElementPlugin;
use crate::sandbox::{BuildContext, Sandbox};

#[derive(Debug, Default)]
pub struct JunctionElement;

impl ElementPlugin for JunctionElement {
    fn configure(&mut self, node: &Node) -> Result<()> {
        node.validate_keys(&["options", "overrides"])?;
        Ok(())
    }

    fn configure_sandbox(&self, _build: &BuildContext<'_>, _sandbox: &mut Sandbox) -> Result<()> {
        Err(Error::User("junction elements cannot be built".to_string()))
    }

    fn stage(&self, _build: &BuildContext<'_>, _sandbox: &mut Sandbox) -> Result<()> {
        Err(Error::User("junction elements cannot be built".to_string()))
    }

    fn assemble(&self, _build: &BuildContext<'_>, _sandbox: &mut Sandbox) -> Result<String> {
        Err(Error::User("junction elements cannot be built".to_string()))
    }
}
