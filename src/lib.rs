//! Core engine for declarative, cache-driven build pipelines.
//!
//! `bst-core` loads YAML element definitions into a resolved project graph,
//! computes deterministic cache keys over every build input, schedules
//! fetch/pull/build/push work across the graph, and assembles artifacts in a
//! staged sandbox backed by a content-addressable store. Frontends drive it
//! through [`Stream`]; plugins extend it through [`plugin::PluginRegistry`].
//!
//! ```no_run
//! use bst_core::{Context, Stream, UserConfig};
//! use std::sync::Arc;
//!
//! let context = Arc::new(Context::new(UserConfig::default())?);
//! let stream = Stream::new(context);
//! let pipeline = stream.load("my-project".as_ref(), &["app.bst"])?;
//! let report = stream.build(&pipeline)?;
//! assert!(report.success);
//! # Ok::<(), bst_core::Error>(())
//! ```

#![warn(rustdoc::all)]
#![cfg_attr(not(test), warn(unused_crate_dependencies))]
#![deny(unused_must_use, rust_2018_idioms)]

#[macro_use]
extern crate tracing;

#[macro_use]
pub mod error;

pub mod node;

pub mod project;

pub mod plugin;

pub mod element;

pub mod cachekey;

pub mod cas;

pub mod artifact;

pub mod sourcecache;

pub mod remote;

pub mod sandbox;

pub mod scheduler;

pub mod pipeline;

pub mod elements;

pub mod config;
pub use config::{CacheBuildTrees, Context, UserConfig};

mod stream;
pub use stream::{ElementReport, LoadedPipeline, Stream, TrackedRef};

pub use artifact::{ArtifactName, ArtifactProto};
pub use cas::{CasStore, Digest};
pub use element::{CacheState, ElementGraph, ElementId, Scope};
pub use error::{Error, ErrorClass, Result};
pub use node::{Node, Provenance};
pub use scheduler::{CancelToken, SchedulerReport, TaskState};

pub mod utils;
