//! Late-binding variable resolution.
//!
//! Any string value an element consumes may contain `%{name}` tokens which
//! substitute from the element's variables map. The map itself is resolved
//! once, eagerly, with cycle and undefined-reference detection; substitution
//! of other strings then needs a single pass because resolved values contain
//! no tokens. Re-resolution is idempotent.

use crate::error::{LoadError, Result};
use crate::node::{Node, Provenance};
use once_cell::sync::Lazy;
use regex::{Captures, Regex};
use std::collections::BTreeMap;

static VAR_TOKEN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"%\{([A-Za-z][A-Za-z0-9_-]*)\}").unwrap());

/// Variables legal only inside alias and mirror declarations; an element
/// referencing them is a load error.
const PROTECTED: [&str; 4] =
    ["project-root", "project-root-uri", "toplevel-root", "toplevel-root-uri"];

#[derive(Clone, Debug, Default)]
pub struct Variables {
    values: BTreeMap<String, String>,
}

enum ResolveState {
    InProgress,
    Done(String),
}

impl Variables {
    /// Builds the resolved map from a composited `variables:` node and the
    /// reserved values the core provides (`element-name`, `project-name`,
    /// `max-jobs`).
    pub fn new(node: &Node, reserved: BTreeMap<String, String>) -> Result<Self> {
        let mut raw: BTreeMap<String, (String, Provenance)> = BTreeMap::new();
        for (name, value) in node.expect_mapping()? {
            raw.insert(
                name.clone(),
                (value.expect_scalar()?.to_string(), value.provenance().clone()),
            );
        }
        for (name, value) in reserved {
            raw.insert(name.clone(), (value, Provenance::synthetic("core")));
        }

        let mut states: BTreeMap<String, ResolveState> = BTreeMap::new();
        let mut values = BTreeMap::new();
        for name in raw.keys() {
            let resolved = resolve_one(name, &raw, &mut states, &mut Vec::new())?;
            values.insert(name.clone(), resolved);
        }
        Ok(Self { values })
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.values.get(name).map(String::as_str)
    }

    /// Substitutes every token in `text`, failing on undefined references.
    pub fn subst(&self, text: &str, provenance: &Provenance) -> Result<String, LoadError> {
        let mut error: Option<LoadError> = None;
        let result = VAR_TOKEN.replace_all(text, |caps: &Captures<'_>| {
            let name = &caps[1];
            match self.values.get(name) {
                Some(value) => value.clone(),
                None => {
                    error.get_or_insert_with(|| undefined_error(name, provenance));
                    String::new()
                }
            }
        });
        match error {
            Some(err) => Err(err),
            None => Ok(result.into_owned()),
        }
    }

    /// Substitutes every scalar of a node tree in place.
    pub fn subst_node(&self, node: &mut Node) -> Result<(), LoadError> {
        match node.value() {
            crate::node::Value::Scalar(s) => {
                let replaced = self.subst(s, node.provenance())?;
                *node = Node::scalar(replaced, node.provenance().clone());
                Ok(())
            }
            crate::node::Value::Sequence(_) => {
                let crate::node::Value::Sequence(items) = node.value_mut() else { unreachable!() };
                let mut items_taken = std::mem::take(items);
                for item in &mut items_taken {
                    self.subst_node(item)?;
                }
                *node.value_mut() = crate::node::Value::Sequence(items_taken);
                Ok(())
            }
            crate::node::Value::Mapping(_) => {
                let crate::node::Value::Mapping(map) = node.value_mut() else { unreachable!() };
                let mut map_taken = std::mem::take(map);
                for child in map_taken.values_mut() {
                    self.subst_node(child)?;
                }
                *node.value_mut() = crate::node::Value::Mapping(map_taken);
                Ok(())
            }
        }
    }

    pub fn to_json(&self) -> serde_json::Value {
        serde_json::Value::Object(
            self.values
                .iter()
                .map(|(k, v)| (k.clone(), serde_json::Value::String(v.clone())))
                .collect(),
        )
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.values.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }
}

fn undefined_error(name: &str, provenance: &Provenance) -> LoadError {
    if PROTECTED.contains(&name) {
        load_error!(
            ProtectedVariable,
            provenance.clone(),
            "'%{{{name}}}' is only valid in alias and mirror declarations"
        )
    } else {
        load_error!(UndefinedVariable, provenance.clone(), "reference to undefined variable '{name}'")
    }
}

fn resolve_one(
    name: &str,
    raw: &BTreeMap<String, (String, Provenance)>,
    states: &mut BTreeMap<String, ResolveState>,
    chain: &mut Vec<String>,
) -> Result<String, LoadError> {
    if let Some(state) = states.get(name) {
        match state {
            ResolveState::Done(value) => return Ok(value.clone()),
            ResolveState::InProgress => {
                let (_, provenance) = &raw[name];
                return Err(load_error!(
                    CyclicVariable,
                    provenance.clone(),
                    "circular reference to variable '{name}': {}",
                    chain.join(" -> ")
                ));
            }
        }
    }
    let Some((template, _)) = raw.get(name) else {
        let provenance = chain
            .last()
            .and_then(|n| raw.get(n))
            .map(|(_, p)| p.clone())
            .unwrap_or_else(|| Provenance::synthetic("variables"));
        return Err(undefined_error(name, &provenance));
    };

    states.insert(name.to_string(), ResolveState::InProgress);
    chain.push(name.to_string());

    let mut error: Option<LoadError> = None;
    let resolved = VAR_TOKEN.replace_all(template, |caps: &Captures<'_>| {
        if error.is_some() {
            return String::new();
        }
        match resolve_one(&caps[1], raw, states, chain) {
            Ok(value) => value,
            Err(e) => {
                error = Some(e);
                String::new()
            }
        }
    });
    let resolved = resolved.into_owned();

    chain.pop();
    if let Some(err) = error {
        return Err(err);
    }
    states.insert(name.to_string(), ResolveState::Done(resolved.clone()));
    Ok(resolved)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::load_string;
    use pretty_assertions::assert_eq;

    fn variables(yaml: &str) -> Result<Variables> {
        let node = load_string(yaml, "vars.yml").unwrap();
        Variables::new(node.get("variables").unwrap(), BTreeMap::new())
    }

    #[test]
    fn chained_resolution() {
        let vars = variables(
            "variables:\n  prefix: /usr\n  bindir: \"%{prefix}/bin\"\n  tool: \"%{bindir}/tool\"\n",
        )
        .unwrap();
        assert_eq!(vars.get("tool"), Some("/usr/bin/tool"));
    }

    #[test]
    fn cycles_are_fatal() {
        let err = variables("variables:\n  a: \"%{b}\"\n  b: \"%{a}\"\n").unwrap_err();
        assert!(err.to_string().contains("circular"));
    }

    #[test]
    fn undefined_references_are_fatal() {
        let err = variables("variables:\n  a: \"%{nope}\"\n").unwrap_err();
        assert!(err.to_string().contains("nope"));
    }

    #[test]
    fn protected_names_have_a_dedicated_error() {
        let err = variables("variables:\n  a: \"%{project-root}/files\"\n").unwrap_err();
        assert!(err.to_string().contains("alias and mirror"));
    }

    #[test]
    fn reserved_values_are_available() {
        let node = load_string("variables:\n  greeting: \"hello %{element-name}\"\n", "v.yml")
            .unwrap();
        let mut reserved = BTreeMap::new();
        reserved.insert("element-name".to_string(), "core/base.bst".to_string());
        let vars = Variables::new(node.get("variables").unwrap(), reserved).unwrap();
        assert_eq!(vars.get("greeting"), Some("hello core/base.bst"));
    }

    #[test]
    fn subst_is_a_single_pass_over_resolved_values() {
        let vars = variables("variables:\n  prefix: /usr\n  bindir: \"%{prefix}/bin\"\n").unwrap();
        let out = vars
            .subst("install into %{bindir}", &Provenance::synthetic("test"))
            .unwrap();
        assert_eq!(out, "install into /usr/bin");
    }
}
