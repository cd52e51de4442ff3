//! Stratus — declarative cloud resource graphs.
//!
//! Typed components declare infrastructure as a dependency DAG; a wave
//! scheduler reconciles the graph against persisted stack state through
//! pluggable resource providers, and stacks exchange outputs through
//! persisted cross-stack references.

pub mod cli;
pub mod core;
pub mod error;
pub mod hasher;
pub mod provider;
pub mod resources;
pub mod stacks;

pub use error::{Error, ErrorKind, Result};
