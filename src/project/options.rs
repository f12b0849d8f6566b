//! Typed project options.
//!
//! Options are declared in `project.conf` and drive `(?)` conditionals. The
//! `arch` and `os` kinds always default to host-detected values and may not
//! carry a default in the project file; `element-mask` values are element
//! names and are validated against the loaded project, not here.

use crate::error::{LoadError, Result};
use crate::node::{
    expression::{ExprScope, ExprValue},
    Node, Provenance,
};
use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::BTreeMap;

static SYMBOL_NAME: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Za-z][A-Za-z0-9_-]*$").unwrap());

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum OptionKind {
    Bool,
    Enum,
    Flags,
    Arch,
    Os,
    ElementMask,
}

impl OptionKind {
    fn parse(s: &str, provenance: &Provenance) -> Result<Self, LoadError> {
        Ok(match s {
            "bool" => Self::Bool,
            "enum" => Self::Enum,
            "flags" => Self::Flags,
            "arch" => Self::Arch,
            "os" => Self::Os,
            "element-mask" => Self::ElementMask,
            other => {
                return Err(load_error!(
                    BadOptionValue,
                    provenance.clone(),
                    "unknown option type '{other}'"
                ))
            }
        })
    }
}

#[derive(Clone, Debug)]
pub struct OptionDecl {
    pub name: String,
    pub kind: OptionKind,
    pub description: String,
    /// Exports the option's current value as this variable.
    pub variable: Option<String>,
    /// Legal values for enum/flags/arch options.
    pub values: Vec<String>,
    provenance: Provenance,
}

#[derive(Clone, Debug, Default)]
pub struct OptionPool {
    options: BTreeMap<String, (OptionDecl, ExprValue)>,
}

impl OptionPool {
    /// Parses the `options:` mapping of a `project.conf`.
    pub fn load(node: Option<&Node>) -> Result<Self> {
        let mut pool = Self::default();
        let Some(node) = node else { return Ok(pool) };
        for (name, decl_node) in node.expect_mapping()? {
            if !SYMBOL_NAME.is_match(name) {
                return Err(load_error!(
                    InvalidSymbolName,
                    decl_node.provenance().clone(),
                    "'{name}' is not a valid option name"
                )
                .into());
            }
            let kind =
                OptionKind::parse(decl_node.get_str("type")?, decl_node.provenance())?;
            decl_node.validate_keys(&["type", "description", "variable", "values", "default"])?;
            let values = decl_node.get_str_list_opt("values")?;
            match kind {
                OptionKind::Enum | OptionKind::Flags | OptionKind::Arch if values.is_empty() => {
                    return Err(load_error!(
                        MissingKey,
                        decl_node.provenance().clone(),
                        "option '{name}' requires a 'values' list"
                    )
                    .into())
                }
                _ => {}
            }
            let decl = OptionDecl {
                name: name.clone(),
                kind,
                description: decl_node.get_str_opt("description")?.unwrap_or_default().into(),
                variable: decl_node.get_str_opt("variable")?.map(str::to_string),
                values,
                provenance: decl_node.provenance().clone(),
            };
            let default = Self::default_value(&decl, decl_node)?;
            pool.options.insert(name.clone(), (decl, default));
        }
        Ok(pool)
    }

    fn default_value(decl: &OptionDecl, node: &Node) -> Result<ExprValue> {
        let default_node = node.get("default");
        match decl.kind {
            OptionKind::Arch | OptionKind::Os => {
                if default_node.is_some() {
                    return Err(load_error!(
                        BadOptionValue,
                        node.provenance().clone(),
                        "'{}' options default to the host value and cannot be defaulted",
                        if decl.kind == OptionKind::Arch { "arch" } else { "os" }
                    )
                    .into());
                }
                Ok(ExprValue::Str(if decl.kind == OptionKind::Arch {
                    host_arch()
                } else {
                    host_os()
                }))
            }
            OptionKind::Bool => match default_node {
                Some(n) => Ok(ExprValue::Bool(n.parse_bool()?)),
                None => Err(load_error!(
                    MissingKey,
                    node.provenance().clone(),
                    "bool option '{}' requires a default",
                    decl.name
                )
                .into()),
            },
            OptionKind::Enum => match default_node {
                Some(n) => {
                    let value = n.expect_scalar()?.to_string();
                    Self::check_enum(decl, &value, n.provenance())?;
                    Ok(ExprValue::Str(value))
                }
                None => Err(load_error!(
                    MissingKey,
                    node.provenance().clone(),
                    "enum option '{}' requires a default",
                    decl.name
                )
                .into()),
            },
            OptionKind::Flags => {
                let mut selected = Vec::new();
                if let Some(n) = default_node {
                    for item in n.expect_sequence()? {
                        let value = item.expect_scalar()?.to_string();
                        Self::check_enum(decl, &value, item.provenance())?;
                        selected.push(value);
                    }
                }
                Ok(ExprValue::List(selected))
            }
            OptionKind::ElementMask => Ok(ExprValue::List(Vec::new())),
        }
    }

    fn check_enum(decl: &OptionDecl, value: &str, provenance: &Provenance) -> Result<()> {
        if !decl.values.iter().any(|v| v == value) {
            return Err(load_error!(
                BadOptionValue,
                provenance.clone(),
                "'{value}' is not a valid value for option '{}' (expected one of: {})",
                decl.name,
                decl.values.join(", ")
            )
            .into());
        }
        Ok(())
    }

    /// Applies user-supplied overrides (command line or configuration file).
    /// Values arrive in their string form; flags and masks are comma
    /// separated.
    pub fn apply_overrides(&mut self, overrides: &BTreeMap<String, String>) -> Result<()> {
        for (name, raw) in overrides {
            let Some((decl, value)) = self.options.get_mut(name) else {
                return Err(load_error!(
                    UndefinedOption,
                    Provenance::synthetic("user configuration"),
                    "unknown option '{name}'"
                )
                .into());
            };
            *value = match decl.kind {
                OptionKind::Bool => match raw.as_str() {
                    "true" | "True" => ExprValue::Bool(true),
                    "false" | "False" => ExprValue::Bool(false),
                    other => {
                        return Err(load_error!(
                            BadOptionValue,
                            decl.provenance.clone(),
                            "'{other}' is not a boolean value for option '{name}'"
                        )
                        .into())
                    }
                },
                OptionKind::Enum | OptionKind::Arch => {
                    Self::check_enum(decl, raw, &decl.provenance)?;
                    ExprValue::Str(raw.clone())
                }
                OptionKind::Os => ExprValue::Str(raw.clone()),
                OptionKind::Flags => {
                    let mut selected = Vec::new();
                    for part in raw.split(',').map(str::trim).filter(|s| !s.is_empty()) {
                        Self::check_enum(decl, part, &decl.provenance)?;
                        selected.push(part.to_string());
                    }
                    ExprValue::List(selected)
                }
                OptionKind::ElementMask => ExprValue::List(
                    raw.split(',')
                        .map(str::trim)
                        .filter(|s| !s.is_empty())
                        .map(str::to_string)
                        .collect(),
                ),
            };
        }
        Ok(())
    }

    /// Validates values that depend on the host, after overrides applied.
    /// An `arch` option whose effective value is not in `values` is an
    /// error even when the value came from host detection.
    pub fn validate(&self) -> Result<()> {
        for (decl, value) in self.options.values() {
            if decl.kind == OptionKind::Arch {
                if let ExprValue::Str(v) = value {
                    Self::check_enum(decl, v, &decl.provenance)?;
                }
            }
        }
        Ok(())
    }

    /// Exports option values into a variables map for options declaring
    /// `variable:`.
    pub fn export_variables(&self, variables: &mut BTreeMap<String, String>) {
        for (decl, value) in self.options.values() {
            if let Some(var) = &decl.variable {
                let rendered = match value {
                    ExprValue::Bool(b) => b.to_string(),
                    ExprValue::Str(s) => s.clone(),
                    ExprValue::List(items) => items.join(" "),
                };
                variables.insert(var.clone(), rendered);
            }
        }
    }

    pub fn get(&self, name: &str) -> Option<&ExprValue> {
        self.options.get(name).map(|(_, v)| v)
    }

    pub fn declarations(&self) -> impl Iterator<Item = &OptionDecl> {
        self.options.values().map(|(d, _)| d)
    }
}

impl ExprScope for OptionPool {
    fn lookup(&self, name: &str) -> Option<ExprValue> {
        self.get(name).cloned()
    }
}

/// Host machine architecture, in `uname -m` vocabulary.
pub fn host_arch() -> String {
    match std::env::consts::ARCH {
        "x86" => "i686".to_string(),
        "arm" => "armv7".to_string(),
        other => other.to_string(),
    }
}

/// Host operating system, in `uname -s` vocabulary.
pub fn host_os() -> String {
    match std::env::consts::OS {
        "linux" => "Linux".to_string(),
        "macos" => "Darwin".to_string(),
        "freebsd" => "FreeBSD".to_string(),
        "netbsd" => "NetBSD".to_string(),
        "openbsd" => "OpenBSD".to_string(),
        other => other.to_string(),
    }
}
