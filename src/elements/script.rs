//! Script element: user commands over a layout of staged dependencies.
//!
//! Dependencies stage at their per-edge `location`; the commands then shape
//! `%{install-root}` themselves.

use crate::error::Result;
use crate::node::Node;
use crate::plugin::ElementPlugin;
use crate::sandbox::{BuildContext, Sandbox};

#[derive(Debug, Default)]
pub struct ScriptElement {
    commands: Vec<String>,
    root_read_only: bool,
}

impl ElementPlugin for ScriptElement {
    fn configure(&mut self, node: &Node) -> Result<()> {
        node.validate_keys(&["commands", "root-read-only"])?;
        self.commands = node.get_str_list_opt("commands")?;
        self.root_read_only = node.get_bool("root-read-only", false)?;
        Ok(())
    }

    fn unique_key(&self) -> serde_json::Value {
        serde_json::json!({
            "commands": self.commands,
            "root-read-only": self.root_read_only,
        })
    }

    fn configure_sandbox(&self, build: &BuildContext<'_>, sandbox: &mut Sandbox) -> Result<()> {
        sandbox.mark_directory(&build.variable("build-root")?)?;
        sandbox.mark_directory(&build.variable("install-root")?)
    }

    fn stage(&self, build: &BuildContext<'_>, sandbox: &mut Sandbox) -> Result<()> {
        build.stage_dependencies(sandbox)?;
        build.integrate(sandbox)?;
        Ok(())
    }

    fn assemble(&self, build: &BuildContext<'_>, sandbox: &mut Sandbox) -> Result<String> {
        let build_root = build.variable("build-root")?;
        sandbox.run_group("commands", &self.commands, &build_root)?;
        build.variable("install-root")
    }

    fn generate_script(&self, _build: &BuildContext<'_>) -> Option<String> {
        let mut script = String::from("#!/bin/sh\nset -e\n\n");
        for command in &self.commands {
            script.push_str(command);
            script.push('\n');
        }
        Some(script)
    }
}
