//! wx core crate.
//!
//! Layers, leaves first:
//!
//! - `bundler` + `vm`: seams to the external bundler and script VM, with
//!   process-backed defaults (`esbuild`, `node`).
//! - `compiler`: turns each component source into a [`CompiledView`] holding a
//!   browser bundle, a server bundle and the extracted stylesheet, each
//!   addressed by a content hash.
//! - `pool` + `renderer`: a fixed set of render workers per view, each owning
//!   one script VM with the view's server bundle loaded.
//! - `engine`: registry from view identity to worker pool; the entry point for
//!   request handlers.
//! - `generator`: embeds compiled views into Rust source for release builds.

pub mod bundler;
pub mod compiler;
pub mod config;
pub mod engine;
pub mod error;
pub mod generator;
pub mod hash;
pub mod pool;
pub mod renderer;
pub mod ssr;
pub mod view;
pub mod vm;

#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use bundler::{BundleError, Bundler, CommandBundler, Target};
pub use compiler::Compiler;
pub use config::{CONFIG_FILE, CommandConfig, EngineConfig, WxConfig};
pub use engine::RenderEngine;
pub use error::{Error, Result, Stage};
pub use generator::Generator;
pub use hash::content_hash;
pub use pool::{Close, Pool, Pooled};
pub use renderer::RenderWorker;
pub use ssr::{Props, SsrOutput};
pub use view::{CompiledView, StaticView, View, ViewCss, ViewDom, ViewRef, ViewSsr};
pub use vm::{NodeVm, NodeVmFactory, ScriptError, ScriptHandle, ScriptVm, VmFactory};
