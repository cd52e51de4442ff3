//! Add-ons stack: binds managed add-ons to an already-applied cluster stack.

use crate::core::config::StackConfig;
use crate::core::graph::ResourceOptions;
use crate::core::reference::StackReference;
use crate::core::stack::{Environment, Stack};
use crate::core::state::StateBackend;
use crate::error::Result;
use crate::resources::addons::{Addon, ClusterAddons, ClusterAddonsArgs};

pub fn build(env: Environment, cfg: &StackConfig, backend: &StateBackend) -> Result<Stack> {
    let mut stack = Stack::new("addons", env);

    let cluster_ref = cfg.str_or("clusterRef", format!("cluster-{}", env));
    let cluster = StackReference::open(backend, &cluster_ref)?;

    let names = cfg.str_list_or("addons", &["vpc-cni", "coredns", "kube-proxy"]);
    let addons = ClusterAddons::new(
        stack.context(),
        "addons",
        ClusterAddonsArgs {
            cluster_name: cluster.output("clusterName")?,
            addons: names.into_iter().map(Addon::latest).collect(),
        },
        ResourceOptions::default(),
    )?;

    stack.export("addonNames", addons.addon_names.clone());
    Ok(stack)
}
