//! The builtin element kinds.
//!
//! These are the kinds with structural graph semantics the core cannot do
//! without: the `manual` build element, dependency grouping (`stack`),
//! artifact composition (`import`, `compose`, `filter`), scripted assembly
//! (`script`), and the project-composition kinds (`junction`, `link`) which
//! never enter the build graph. Third-party kinds register through the same
//! [`PluginRegistry`].

use crate::plugin::{ElementKindDecl, PluginRegistry};

mod build_element;
mod compose;
mod filter;
mod import;
mod junction;
mod link;
mod script;
mod stack;

pub use build_element::BuildElement;
pub use compose::ComposeElement;
pub use filter::FilterElement;
pub use import::ImportElement;
pub use junction::JunctionElement;
pub use link::LinkElement;
pub use script::ScriptElement;
pub use stack::StackElement;

pub fn register_builtins(registry: &mut PluginRegistry) {
    let decls = [
        ElementKindDecl {
            kind: "manual".to_string(),
            version: 0,
            defaults: Some(include_str!("manual.yaml")),
            deprecated: None,
            create: Box::new(|| Box::new(BuildElement::default())),
        },
        ElementKindDecl {
            kind: "stack".to_string(),
            version: 0,
            defaults: None,
            deprecated: None,
            create: Box::new(|| Box::new(StackElement::default())),
        },
        ElementKindDecl {
            kind: "import".to_string(),
            version: 0,
            defaults: Some(include_str!("import.yaml")),
            deprecated: None,
            create: Box::new(|| Box::new(ImportElement::default())),
        },
        ElementKindDecl {
            kind: "compose".to_string(),
            version: 0,
            defaults: Some(include_str!("compose.yaml")),
            deprecated: None,
            create: Box::new(|| Box::new(ComposeElement::default())),
        },
        ElementKindDecl {
            kind: "script".to_string(),
            version: 0,
            defaults: Some(include_str!("script.yaml")),
            deprecated: None,
            create: Box::new(|| Box::new(ScriptElement::default())),
        },
        ElementKindDecl {
            kind: "filter".to_string(),
            version: 0,
            defaults: Some(include_str!("filter.yaml")),
            deprecated: None,
            create: Box::new(|| Box::new(FilterElement::default())),
        },
        ElementKindDecl {
            kind: "junction".to_string(),
            version: 0,
            defaults: None,
            deprecated: None,
            create: Box::new(|| Box::new(JunctionElement::default())),
        },
        ElementKindDecl {
            kind: "link".to_string(),
            version: 0,
            defaults: None,
            deprecated: None,
            create: Box::new(|| Box::new(LinkElement::default())),
        },
    ];
    for decl in decls {
        registry.register_element(decl).expect("builtin kinds are unique");
    }
}
