//! The build-element base: ordered command groups in a staged sandbox.
//!
//! `manual` is the bare form of this element; kinds like autotools or cmake
//! are the same machinery with different command-group defaults, provided by
//! plugin default YAML rather than code.

use crate::error::{Result, SandboxError};
use crate::node::Node;
use crate::plugin::ElementPlugin;
use crate::sandbox::{BuildContext, Sandbox};

const COMMAND_GROUPS: [&str; 4] =
    ["configure-commands", "build-commands", "install-commands", "strip-commands"];

#[derive(Debug, Default)]
pub struct BuildElement {
    groups: Vec<(String, Vec<String>)>,
}

impl ElementPlugin for BuildElement {
    fn configure(&mut self, node: &Node) -> Result<()> {
        node.validate_keys(&COMMAND_GROUPS)?;
        self.groups.clear();
        for group in COMMAND_GROUPS {
            self.groups.push((group.to_string(), node.get_str_list_opt(group)?));
        }
        Ok(())
    }

    fn unique_key(&self) -> serde_json::Value {
        serde_json::Value::Object(
            self.groups
                .iter()
                .map(|(name, commands)| {
                    (name.clone(), serde_json::json!(commands))
                })
                .collect(),
        )
    }

    fn configure_sandbox(&self, build: &BuildContext<'_>, sandbox: &mut Sandbox) -> Result<()> {
        sandbox.mark_directory(&build.variable("build-root")?)?;
        sandbox.mark_directory(&build.variable("install-root")?)?;
        Ok(())
    }

    fn stage(&self, build: &BuildContext<'_>, sandbox: &mut Sandbox) -> Result<()> {
        build.stage_dependencies(sandbox)?;
        build.integrate(sandbox)?;
        build.stage_sources(sandbox, &build.variable("build-root")?)?;
        Ok(())
    }

    fn assemble(&self, build: &BuildContext<'_>, sandbox: &mut Sandbox) -> Result<String> {
        let build_root = build.variable("build-root")?;
        let subdir = build
            .variables()
            .get("command-subdir")
            .unwrap_or(".")
            .to_string();
        if !crate::utils::is_contained_relative(&subdir) {
            return Err(SandboxError::BadCommandSubdir {
                element: build.element().name.clone(),
                subdir,
            }
            .into());
        }
        let cwd = if subdir == "." {
            build_root
        } else {
            format!("{build_root}/{subdir}")
        };

        // One command proto: the groups concatenated in declaration order,
        // halting on the first non-zero exit.
        let commands: Vec<String> =
            self.groups.iter().flat_map(|(_, commands)| commands.clone()).collect();
        sandbox.run_group("assemble", &commands, &cwd)?;
        build.variable("install-root")
    }

    fn generate_script(&self, build: &BuildContext<'_>) -> Option<String> {
        let mut script = String::from("#!/bin/sh\nset -e\n\n");
        let build_root = build.variables().get("build-root")?;
        script.push_str(&format!("cd \"{build_root}\"\n"));
        for (group, commands) in &self.groups {
            if commands.is_empty() {
                continue;
            }
            script.push_str(&format!("\n# {group}\n"));
            for command in commands {
                script.push_str(command);
                script.push('\n');
            }
        }
        Some(script)
    }
}
