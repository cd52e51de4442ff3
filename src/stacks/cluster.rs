//! Cluster stack: consumes the network stack's exports through a stack
//! reference and provisions the managed cluster on top.
//!
//! prod keeps the control-plane endpoint private; dev/test leave it public
//! for convenience.

use indexmap::IndexMap;

use crate::core::config::StackConfig;
use crate::core::graph::ResourceOptions;
use crate::core::reference::StackReference;
use crate::core::stack::{Environment, Stack};
use crate::core::state::StateBackend;
use crate::core::value::literal;
use crate::error::Result;
use crate::resources::cluster::{Cluster, ClusterArgs};

pub fn build(env: Environment, cfg: &StackConfig, backend: &StateBackend) -> Result<Stack> {
    let mut stack = Stack::new("cluster", env);
    let is_prod = env.is_prod();

    let net_ref = cfg.str_or("netRef", format!("network-{}", env));
    let net = StackReference::open(backend, &net_ref)?;

    let mut tags = IndexMap::new();
    tags.insert("app".to_string(), "chatbot".to_string());
    tags.insert("env".to_string(), env.to_string());

    let cluster = Cluster::new(
        stack.context(),
        "eks",
        ClusterArgs {
            cluster_name: net.output("clusterName")?,
            vpc_id: net.output("vpcId")?,
            private_subnet_ids: net.output("privateSubnetIds")?,
            k8s_version: cfg.str_or("version", "1.29"),
            endpoint_public_access: cfg.bool_or("endpointPublic", !is_prod),
            endpoint_private_access: true,
            instance_types: cfg.str_list_or("instanceTypes", &["t3.large"]),
            desired_size: cfg.u64_or("desired", 2),
            min_size: cfg.u64_or("min", 1),
            max_size: cfg.u64_or("max", 3),
            tags,
        },
        ResourceOptions::default(),
    )?;

    stack.export("env", literal(env.to_string()));
    stack.export("clusterName", cluster.cluster_name.clone());
    stack.export("clusterArn", cluster.cluster_arn.clone());
    stack.export("nodeGroupName", cluster.node_group_name.clone());
    stack.export("oidcProviderArn", cluster.oidc_provider_arn.clone());
    // Already tainted secret by the component.
    stack.export("kubeconfig", cluster.kubeconfig.clone());
    Ok(stack)
}
