//! Composition of YAML fragments.
//!
//! Two cooperating pieces live here. [`resolve_directives`] realises the
//! `(@)` include, `(?)` conditional and `(!)` assertion directives on a
//! freshly loaded tree, in the option context of the project that declared
//! the file. [`compose`] merges one resolved tree onto another, honouring the
//! `(<)`, `(>)` and `(=)` list directives; it is applied repeatedly to stack
//! the composition layers (builtin defaults, project defaults, plugin
//! defaults, project overrides, element declaration).

use crate::error::{LoadError, Result};
use crate::node::{
    expression::{self, ExprScope},
    Node, Provenance, Value,
};
use std::collections::BTreeMap;

pub const PREPEND: &str = "(<)";
pub const APPEND: &str = "(>)";
pub const OVERWRITE: &str = "(=)";
pub const INCLUDE: &str = "(@)";
pub const CONDITIONAL: &str = "(?)";
pub const ASSERTION: &str = "(!)";

const LIST_DIRECTIVES: [&str; 3] = [PREPEND, OVERWRITE, APPEND];

/// Resolves `(@)` include references on behalf of [`resolve_directives`].
///
/// Implementations load the referenced file and return it with its own
/// directives already resolved, so conditionals in files included across a
/// junction evaluate against the subproject's options.
pub trait IncludeResolver {
    fn resolve(
        &self,
        reference: &str,
        provenance: &Provenance,
        stack: &mut Vec<String>,
    ) -> Result<Node>;
}

/// Include resolver for contexts where includes are not allowed.
pub struct NoIncludes;

impl IncludeResolver for NoIncludes {
    fn resolve(
        &self,
        reference: &str,
        provenance: &Provenance,
        _stack: &mut Vec<String>,
    ) -> Result<Node> {
        Err(load_error!(
            IncludeNotFound,
            provenance.clone(),
            "includes are not allowed here: '{reference}'"
        )
        .into())
    }
}

/// Realises `(@)`, `(?)` and `(!)` on `node`, recursively.
pub fn resolve_directives(
    node: &mut Node,
    scope: &dyn ExprScope,
    includes: &dyn IncludeResolver,
    stack: &mut Vec<String>,
) -> Result<()> {
    match node.value() {
        Value::Mapping(_) => resolve_mapping(node, scope, includes, stack),
        Value::Sequence(_) => {
            let Value::Sequence(items) = node_value_mut(node) else { unreachable!() };
            let mut items = std::mem::take(items);
            for item in &mut items {
                resolve_directives(item, scope, includes, stack)?;
            }
            *node_value_mut(node) = Value::Sequence(items);
            Ok(())
        }
        Value::Scalar(_) => Ok(()),
    }
}

fn node_value_mut(node: &mut Node) -> &mut Value {
    node.value_mut()
}

fn resolve_mapping(
    node: &mut Node,
    scope: &dyn ExprScope,
    includes: &dyn IncludeResolver,
    stack: &mut Vec<String>,
) -> Result<()> {
    // Includes first: merge each included (already resolved) file under the
    // including mapping, includer wins per key.
    if let Some(refs_node) = node.remove(INCLUDE) {
        let references: Vec<(String, Provenance)> = match refs_node.value() {
            Value::Scalar(s) => vec![(s.clone(), refs_node.provenance().clone())],
            Value::Sequence(items) => {
                let mut refs = Vec::new();
                for item in items {
                    refs.push((item.expect_scalar()?.to_string(), item.provenance().clone()));
                }
                refs
            }
            Value::Mapping(_) => {
                return Err(load_error!(
                    ExpectedSequence,
                    refs_node.provenance().clone(),
                    "(@) expects a file reference or a list of file references"
                )
                .into())
            }
        };
        let mut base = Node::mapping(BTreeMap::new(), node.provenance().clone());
        for (reference, provenance) in references {
            if stack.contains(&reference) {
                return Err(load_error!(
                    IncludeCycle,
                    provenance,
                    "include of '{reference}' creates a cycle: {}",
                    stack.join(" -> ")
                )
                .into());
            }
            stack.push(reference.clone());
            let included = includes.resolve(&reference, &provenance, stack)?;
            stack.pop();
            compose(&mut base, &included)?;
        }
        compose(&mut base, node)?;
        *node = base;
    }

    // Conditionals, repeatedly: a truthful branch composites onto this
    // mapping immediately, and may itself introduce another (?).
    while let Some(conditions) = node.remove(CONDITIONAL) {
        for arm in conditions.expect_sequence()? {
            let map = arm.expect_mapping()?;
            if map.len() != 1 {
                return Err(load_error!(
                    ExpectedMapping,
                    arm.provenance().clone(),
                    "(?) arms must be single-key mappings of expression to branch"
                )
                .into());
            }
            let (expr, branch) = map.iter().next().expect("len checked");
            if expression::evaluate(expr, scope, arm.provenance())? {
                let mut branch = branch.clone();
                resolve_directives(&mut branch, scope, includes, stack)?;
                compose(node, &branch)?;
            }
        }
    }

    if let Some(assertion) = node.remove(ASSERTION) {
        return Err(load_error!(
            AssertionFired,
            assertion.provenance().clone(),
            "{}",
            assertion.expect_scalar().unwrap_or("assertion failed")
        )
        .into());
    }

    // Recurse into remaining children.
    let Value::Mapping(map) = node_value_mut(node) else { unreachable!() };
    let mut map_taken = std::mem::take(map);
    for child in map_taken.values_mut() {
        resolve_directives(child, scope, includes, stack)?;
    }
    *node_value_mut(node) = Value::Mapping(map_taken);
    Ok(())
}

/// True when the mapping node consists purely of list directives.
fn is_list_directive(node: &Node) -> Result<bool, LoadError> {
    let Some(map) = node.as_mapping() else { return Ok(false) };
    if map.is_empty() || !map.keys().any(|k| LIST_DIRECTIVES.contains(&k.as_str())) {
        return Ok(false);
    }
    for (key, child) in map {
        if !LIST_DIRECTIVES.contains(&key.as_str()) {
            return Err(load_error!(
                UnsupportedDirective,
                child.provenance().clone(),
                "'{key}' cannot be mixed with list directives"
            ));
        }
    }
    Ok(true)
}

fn directive_list(node: &Node, key: &str) -> Result<Option<Vec<Node>>, LoadError> {
    match node.get(key) {
        Some(child) => Ok(Some(child.expect_sequence()?.to_vec())),
        None => Ok(None),
    }
}

/// Composes `overlay` onto `base`; overlay wins, mappings merge recursively,
/// lists replace unless the overlay carries list directives.
pub fn compose(base: &mut Node, overlay: &Node) -> Result<(), LoadError> {
    let overlay_map = overlay.expect_mapping()?;
    let base_map = match node_value_mut(base) {
        Value::Mapping(map) => map,
        _ => {
            return Err(load_error!(
                IllegalComposite,
                overlay.provenance().clone(),
                "cannot compose a mapping onto a {}",
                kind_name(base)
            ))
        }
    };

    for (key, overlay_child) in overlay_map {
        if is_list_directive(overlay_child)? {
            compose_list(base_map, key, overlay_child)?;
            continue;
        }
        match base_map.get_mut(key) {
            None => {
                base_map.insert(key.clone(), overlay_child.clone());
            }
            Some(base_child) => {
                let base_pending = is_list_directive(base_child)?;
                let compatible = match overlay_child.value() {
                    Value::Mapping(_) if base_child.is_mapping() && !base_pending => {
                        compose(base_child, overlay_child)?;
                        true
                    }
                    Value::Scalar(_) if base_child.as_scalar().is_some() => {
                        *base_child = overlay_child.clone();
                        true
                    }
                    // A plain list replaces an existing list and also any
                    // directives still pending from earlier layers.
                    Value::Sequence(_) if base_child.is_sequence() || base_pending => {
                        *base_child = overlay_child.clone();
                        true
                    }
                    _ => false,
                };
                if !compatible {
                    return Err(load_error!(
                        IllegalComposite,
                        overlay_child.provenance().clone(),
                        "cannot compose a {} onto the {} at {}",
                        kind_name(overlay_child),
                        kind_name(base_child),
                        base_child.provenance()
                    ));
                }
            }
        }
    }
    Ok(())
}

fn kind_name(node: &Node) -> &'static str {
    match node.value() {
        Value::Scalar(_) => "scalar",
        Value::Sequence(_) => "list",
        Value::Mapping(_) => "mapping",
    }
}

fn compose_list(
    base_map: &mut BTreeMap<String, Node>,
    key: &str,
    directive: &Node,
) -> Result<(), LoadError> {
    let prepend = directive_list(directive, PREPEND)?;
    let append = directive_list(directive, APPEND)?;
    let overwrite = directive_list(directive, OVERWRITE)?;

    match base_map.get_mut(key) {
        Some(base_child) if base_child.is_sequence() => {
            let existing = base_child.as_sequence().expect("checked").to_vec();
            let mut items = prepend.unwrap_or_default();
            items.extend(overwrite.unwrap_or(existing));
            items.extend(append.unwrap_or_default());
            *base_child = Node::sequence(items, directive.provenance().clone());
            Ok(())
        }
        Some(base_child) if is_list_directive(base_child)? => {
            // Both layers are still pending; fold the new directive into the
            // accumulated one so a later concrete list resolves both.
            let base_pre = directive_list(base_child, PREPEND)?.unwrap_or_default();
            let base_app = directive_list(base_child, APPEND)?.unwrap_or_default();
            let base_over = directive_list(base_child, OVERWRITE)?;
            let provenance = directive.provenance().clone();
            let mut merged = BTreeMap::new();
            if let Some(over) = overwrite {
                if let Some(pre) = prepend {
                    merged.insert(PREPEND.to_string(), Node::sequence(pre, provenance.clone()));
                }
                merged.insert(OVERWRITE.to_string(), Node::sequence(over, provenance.clone()));
                if let Some(app) = append {
                    merged.insert(APPEND.to_string(), Node::sequence(app, provenance.clone()));
                }
            } else {
                let mut pre = prepend.unwrap_or_default();
                pre.extend(base_pre);
                let mut app = base_app;
                app.extend(append.unwrap_or_default());
                if !pre.is_empty() {
                    merged.insert(PREPEND.to_string(), Node::sequence(pre, provenance.clone()));
                }
                if let Some(over) = base_over {
                    merged.insert(OVERWRITE.to_string(), Node::sequence(over, provenance.clone()));
                }
                if !app.is_empty() {
                    merged.insert(APPEND.to_string(), Node::sequence(app, provenance.clone()));
                }
            }
            *base_child = Node::mapping(merged, provenance);
            Ok(())
        }
        Some(base_child) => Err(load_error!(
            IllegalComposite,
            directive.provenance().clone(),
            "list directives cannot apply to the {} at {}",
            kind_name(base_child),
            base_child.provenance()
        )),
        None => {
            // No underlying list yet; the directive stays pending until a
            // later layer provides one or final resolution runs.
            base_map.insert(key.to_string(), directive.clone());
            Ok(())
        }
    }
}

/// Final resolution pass: concretizes list directives that never met an
/// underlying list. `(=)` with nothing to overwrite is an error.
pub fn resolve_pending_lists(node: &mut Node) -> Result<(), LoadError> {
    match node.value() {
        Value::Mapping(_) => {
            let Value::Mapping(map) = node_value_mut(node) else { unreachable!() };
            let mut map_taken = std::mem::take(map);
            for child in map_taken.values_mut() {
                if is_list_directive(child)? {
                    if child.get(OVERWRITE).is_some() {
                        return Err(load_error!(
                            IllegalComposite,
                            child.provenance().clone(),
                            "(=) has no underlying list to overwrite"
                        ));
                    }
                    let mut items = directive_list(child, PREPEND)?.unwrap_or_default();
                    items.extend(directive_list(child, APPEND)?.unwrap_or_default());
                    *child = Node::sequence(items, child.provenance().clone());
                }
                resolve_pending_lists(child)?;
            }
            *node_value_mut(node) = Value::Mapping(map_taken);
            Ok(())
        }
        Value::Sequence(_) => {
            let Value::Sequence(items) = node_value_mut(node) else { unreachable!() };
            let mut items_taken = std::mem::take(items);
            for item in &mut items_taken {
                resolve_pending_lists(item)?;
            }
            *node_value_mut(node) = Value::Sequence(items_taken);
            Ok(())
        }
        Value::Scalar(_) => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::{expression::ExprValue, load_string};
    use pretty_assertions::assert_eq;

    struct TestScope;

    impl ExprScope for TestScope {
        fn lookup(&self, name: &str) -> Option<ExprValue> {
            match name {
                "debug" => Some(ExprValue::Bool(true)),
                "arch" => Some(ExprValue::Str("x86_64".into())),
                _ => None,
            }
        }
    }

    fn resolve(yaml: &str) -> Result<Node> {
        let mut node = load_string(yaml, "test.yml")?;
        resolve_directives(&mut node, &TestScope, &NoIncludes, &mut Vec::new())?;
        Ok(node)
    }

    #[test]
    fn mappings_merge_scalars_replace() {
        let mut base = load_string("a: 1\nnested:\n  x: old\n  y: kept\n", "base.yml").unwrap();
        let overlay = load_string("b: 2\nnested:\n  x: new\n", "overlay.yml").unwrap();
        compose(&mut base, &overlay).unwrap();
        assert_eq!(base.get_str("a").unwrap(), "1");
        assert_eq!(base.get_str("b").unwrap(), "2");
        assert_eq!(base.get("nested").unwrap().get_str("x").unwrap(), "new");
        assert_eq!(base.get("nested").unwrap().get_str("y").unwrap(), "kept");
    }

    #[test]
    fn lists_replace_by_default() {
        let mut base = load_string("cmds:\n- one\n- two\n", "base.yml").unwrap();
        let overlay = load_string("cmds:\n- three\n", "overlay.yml").unwrap();
        compose(&mut base, &overlay).unwrap();
        let items: Vec<_> =
            base.get("cmds").unwrap().as_sequence().unwrap().iter().collect();
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].as_scalar().unwrap(), "three");
    }

    #[test]
    fn list_directives_modify_the_base() {
        let mut base = load_string("cmds:\n- b\n", "base.yml").unwrap();
        let overlay =
            load_string("cmds:\n  (<):\n  - a\n  (>):\n  - c\n", "overlay.yml").unwrap();
        compose(&mut base, &overlay).unwrap();
        let items: Vec<_> = base
            .get("cmds")
            .unwrap()
            .as_sequence()
            .unwrap()
            .iter()
            .map(|n| n.as_scalar().unwrap().to_string())
            .collect();
        assert_eq!(items, vec!["a", "b", "c"]);
    }

    #[test]
    fn overwrite_replaces_the_base() {
        let mut base = load_string("cmds:\n- old\n", "base.yml").unwrap();
        let overlay = load_string("cmds:\n  (=):\n  - new\n", "overlay.yml").unwrap();
        compose(&mut base, &overlay).unwrap();
        let items: Vec<_> = base
            .get("cmds")
            .unwrap()
            .as_sequence()
            .unwrap()
            .iter()
            .map(|n| n.as_scalar().unwrap().to_string())
            .collect();
        assert_eq!(items, vec!["new"]);
    }

    #[test]
    fn overwrite_without_base_is_fatal() {
        let mut node = load_string("cmds:\n  (=):\n  - new\n", "lone.yml").unwrap();
        let err = resolve_pending_lists(&mut node).unwrap_err();
        assert!(err.to_string().contains("overwrite"));
    }

    #[test]
    fn pending_append_concretizes() {
        let mut node = load_string("cmds:\n  (>):\n  - extra\n", "lone.yml").unwrap();
        resolve_pending_lists(&mut node).unwrap();
        assert_eq!(node.get("cmds").unwrap().as_sequence().unwrap().len(), 1);
    }

    #[test]
    fn conditionals_composite_in_order() {
        let node = resolve(
            "value: base\n(?):\n- debug:\n    value: debug-on\n- arch == 'x86_64':\n    extra: x86\n",
        )
        .unwrap();
        assert_eq!(node.get_str("value").unwrap(), "debug-on");
        assert_eq!(node.get_str("extra").unwrap(), "x86");
    }

    #[test]
    fn false_branches_do_not_composite() {
        let node = resolve("value: base\n(?):\n- arch == 'aarch64':\n    value: never\n").unwrap();
        assert_eq!(node.get_str("value").unwrap(), "base");
    }

    #[test]
    fn branches_may_assert() {
        let err = resolve("(?):\n- debug:\n    (!): debug builds are unsupported\n").unwrap_err();
        assert!(err.to_string().contains("debug builds are unsupported"));
    }

    #[test]
    fn undefined_option_in_condition_is_fatal() {
        assert!(resolve("(?):\n- nope:\n    a: b\n").is_err());
    }

    #[test]
    fn directive_idempotence() {
        let mut node = resolve("value: base\n(?):\n- debug:\n    value: on\n").unwrap();
        let snapshot = node.clone();
        resolve_directives(&mut node, &TestScope, &NoIncludes, &mut Vec::new()).unwrap();
        assert_eq!(node, snapshot);
    }

    #[test]
    fn disjoint_composition_commutes() {
        let a = load_string("alpha:\n  x: 1\n", "a.yml").unwrap();
        let b = load_string("beta:\n  y: 2\n", "b.yml").unwrap();
        let mut ab = a.clone();
        compose(&mut ab, &b).unwrap();
        let mut ba = b.clone();
        compose(&mut ba, &a).unwrap();
        assert_eq!(ab, ba);
    }
}
