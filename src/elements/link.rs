//! Link element: a symbolic forward to another element.
//!
//! Links resolve in the loader (the target replaces the link in every
//! context, including junction targets) and never enter the build graph.

use crate::error::{Error, Result};
use crate::node::Node;
use crate::plugin::ElementPlugin;
use crate::sandbox::{BuildContext, Sandbox};

#[derive(Debug, Default)]
pub struct LinkElement;

impl ElementPlugin for LinkElement {
    fn configure(&mut self, node: &Node) -> Result<()> {
        node.validate_keys(&["target"])?;
        node.get_node("target")?;
        Ok(())
    }

    fn configure_sandbox(&self, _build: &BuildContext<'_>, _sandbox: &mut Sandbox) -> Result<()> {
        Err(Error::User("link elements cannot be built".to_string()))
    }

    fn stage(&self, _build: &BuildContext<'_>, _sandbox: &mut Sandbox) -> Result<()> {
        Err(Error::User("link elements cannot be built".to_string()))
    }

    fn assemble(&self, _build: &BuildContext<'_>, _sandbox: &mut Sandbox) -> Result<String> {
        Err(Error::User("link elements cannot be built".to_string()))
    }
}
