//! The plugin contract.
//!
//! Element and source kinds are implemented behind the [`ElementPlugin`] and
//! [`SourcePlugin`] traits. The core ships the element kinds with structural
//! graph semantics (see [`crate::elements`]); production source kinds are
//! provided by the embedder through the [`PluginRegistry`]. Every kind
//! carries an integer version which participates in cache keys.

use crate::error::{PluginError, Result};
use crate::node::Node;
use crate::sandbox::{BuildContext, Sandbox};
use std::{collections::BTreeMap, fmt, path::Path};

/// Host-side services available to a source plugin during fetch, stage and
/// track. URL translation applies the project's alias and mirror
/// configuration under the user's source policy.
pub struct SourceContext<'a> {
    /// Element path of the owning element, for error messages.
    pub element: &'a str,
    /// Plugin-private download area, keyed per source kind.
    pub sourcedir: &'a Path,
    pub(crate) translator: &'a dyn Fn(&str, bool) -> Vec<String>,
}

impl SourceContext<'_> {
    /// Candidate URLs for fetching, in contact order.
    pub fn translate(&self, url: &str) -> Vec<String> {
        (self.translator)(url, false)
    }

    /// Candidate URLs for tracking; mirrors scan in reverse order.
    pub fn translate_for_track(&self, url: &str) -> Vec<String> {
        (self.translator)(url, true)
    }
}

impl fmt::Debug for SourceContext<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SourceContext").field("element", &self.element).finish()
    }
}

/// One input fragment of an element.
pub trait SourcePlugin: fmt::Debug + Send + Sync {
    /// Validates the plugin's subtree of the source declaration and stores
    /// resolved state. Unknown keys are fatal here.
    fn configure(&mut self, node: &Node) -> Result<()>;

    /// Checks host prerequisites without touching sources.
    fn preflight(&self) -> Result<()> {
        Ok(())
    }

    /// A value deterministically identifying the source contents, or `None`
    /// while the source has no ref and cannot be keyed.
    fn unique_key(&self) -> Option<serde_json::Value>;

    /// When true, this source's cache-key contribution also covers the
    /// unique keys of all earlier sources of the element (a patch depends on
    /// what it patches).
    fn requires_previous_sources(&self) -> bool {
        false
    }

    /// The current ref in its YAML form, if any.
    fn get_ref(&self) -> Option<Node> {
        None
    }

    /// Applies a new ref produced by tracking.
    fn set_ref(&mut self, node: &Node) -> Result<()> {
        let _ = node;
        Ok(())
    }

    /// Obtains the source contents from upstream, honouring mirrors.
    fn fetch(&self, ctx: &SourceContext<'_>) -> Result<()>;

    /// Stages the fetched contents into `directory`.
    fn stage(&self, ctx: &SourceContext<'_>, directory: &Path) -> Result<()>;

    /// Scans upstream for a new ref. `None` means tracking is not supported
    /// for this kind.
    fn track(&self, ctx: &SourceContext<'_>) -> Result<Option<Node>> {
        let _ = ctx;
        Ok(None)
    }
}

/// One buildable node of the graph.
pub trait ElementPlugin: fmt::Debug + Send + Sync {
    fn configure(&mut self, node: &Node) -> Result<()>;

    fn preflight(&self) -> Result<()> {
        Ok(())
    }

    /// The kind-specific contribution to the element's cache key.
    fn unique_key(&self) -> serde_json::Value {
        serde_json::Value::Null
    }

    /// Declares writable areas and any other sandbox preparation.
    fn configure_sandbox(&self, build: &BuildContext<'_>, sandbox: &mut Sandbox) -> Result<()>;

    /// Arranges dependency and source content inside the sandbox.
    fn stage(&self, build: &BuildContext<'_>, sandbox: &mut Sandbox) -> Result<()>;

    /// Runs the build and returns the sandbox-absolute path of the collected
    /// artifact root.
    fn assemble(&self, build: &BuildContext<'_>, sandbox: &mut Sandbox) -> Result<String>;

    /// An equivalent shell script, for kinds that can express one.
    fn generate_script(&self, build: &BuildContext<'_>) -> Option<String> {
        let _ = build;
        None
    }
}

type ElementFactory = Box<dyn Fn() -> Box<dyn ElementPlugin> + Send + Sync>;
type SourceFactory = Box<dyn Fn() -> Box<dyn SourcePlugin> + Send + Sync>;

pub struct ElementKindDecl {
    pub kind: String,
    pub version: u32,
    /// Kind-specific default YAML, composited beneath the element
    /// declaration.
    pub defaults: Option<&'static str>,
    pub deprecated: Option<String>,
    pub create: ElementFactory,
}

pub struct SourceKindDecl {
    pub kind: String,
    pub version: u32,
    /// Kind-specific default YAML, composited beneath each declaration.
    pub defaults: Option<&'static str>,
    pub deprecated: Option<String>,
    pub create: SourceFactory,
}

/// Maps kind names to plugin factories.
///
/// Kinds registered here are the resolution targets for the plugin origins a
/// project declares; a name registered twice is fatal, matching the
/// origin-collision rule.
pub struct PluginRegistry {
    elements: BTreeMap<String, ElementKindDecl>,
    sources: BTreeMap<String, SourceKindDecl>,
}

impl fmt::Debug for PluginRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PluginRegistry")
            .field("elements", &self.elements.keys().collect::<Vec<_>>())
            .field("sources", &self.sources.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl PluginRegistry {
    pub fn new() -> Self {
        Self { elements: BTreeMap::new(), sources: BTreeMap::new() }
    }

    /// A registry with the builtin element kinds registered.
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        crate::elements::register_builtins(&mut registry);
        registry
    }

    pub fn register_element(&mut self, decl: ElementKindDecl) -> Result<()> {
        if self.elements.contains_key(&decl.kind) {
            return Err(
                PluginError::Duplicate { kind_type: "element", kind: decl.kind.clone() }.into()
            );
        }
        self.elements.insert(decl.kind.clone(), decl);
        Ok(())
    }

    pub fn register_source(&mut self, decl: SourceKindDecl) -> Result<()> {
        if self.sources.contains_key(&decl.kind) {
            return Err(
                PluginError::Duplicate { kind_type: "source", kind: decl.kind.clone() }.into()
            );
        }
        self.sources.insert(decl.kind.clone(), decl);
        Ok(())
    }

    pub fn element_decl(&self, kind: &str) -> Result<&ElementKindDecl> {
        self.elements.get(kind).ok_or_else(|| {
            PluginError::UnknownKind { kind_type: "element", kind: kind.to_string() }.into()
        })
    }

    pub fn source_decl(&self, kind: &str) -> Result<&SourceKindDecl> {
        self.sources.get(kind).ok_or_else(|| {
            PluginError::UnknownKind { kind_type: "source", kind: kind.to_string() }.into()
        })
    }

    pub fn create_element(&self, kind: &str) -> Result<Box<dyn ElementPlugin>> {
        Ok((self.element_decl(kind)?.create)())
    }

    pub fn create_source(&self, kind: &str) -> Result<Box<dyn SourcePlugin>> {
        Ok((self.source_decl(kind)?.create)())
    }

    /// The kind's default YAML, parsed.
    pub fn element_defaults(&self, kind: &str) -> Result<Option<Node>> {
        match self.element_decl(kind)?.defaults {
            Some(text) => Ok(Some(
                crate::node::load_string(text, &format!("{kind} plugin defaults"))
                    .map_err(crate::error::Error::from)?,
            )),
            None => Ok(None),
        }
    }

    pub fn source_defaults(&self, kind: &str) -> Result<Option<Node>> {
        match self.source_decl(kind)?.defaults {
            Some(text) => Ok(Some(
                crate::node::load_string(text, &format!("{kind} plugin defaults"))
                    .map_err(crate::error::Error::from)?,
            )),
            None => Ok(None),
        }
    }
}

impl Default for PluginRegistry {
    fn default() -> Self {
        Self::with_builtins()
    }
}
