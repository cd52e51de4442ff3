//! Stack entry points — one per independently deployable unit, routed by
//! `<stack>-<env>` name. Each builder decides environment defaults
//! (dev/test cheap, prod HA and protected), layers per-stack config
//! overrides on top, composes components and exports outputs.

pub mod addons;
pub mod cluster;
pub mod edge;
pub mod network;
pub mod registry;
pub mod storage;

use crate::core::config::StackConfig;
use crate::core::stack::{Environment, Stack};
use crate::core::state::StateBackend;
use crate::error::{Error, Result};

pub const STACK_NAMES: [&str; 6] = ["network", "cluster", "addons", "edge", "storage", "registry"];

/// Construct the declared graph for one stack.
pub fn build(
    name: &str,
    env: Environment,
    cfg: &StackConfig,
    backend: &StateBackend,
) -> Result<Stack> {
    match name {
        "network" => network::build(env, cfg),
        "cluster" => cluster::build(env, cfg, backend),
        "addons" => addons::build(env, cfg, backend),
        "edge" => edge::build(env, cfg),
        "storage" => storage::build(env, cfg),
        "registry" => registry::build(env, cfg),
        other => Err(Error::Config(format!(
            "unknown stack '{}'; available: {}",
            other,
            STACK_NAMES.join(", ")
        ))),
    }
}
