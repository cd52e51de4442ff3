//! Network stack: environment-sized VPC networking for the cluster.
//!
//! dev/test default to 2 AZs with a single NAT gateway (cheap); prod defaults
//! to 3 AZs with one NAT per AZ (HA). Every default can be overridden by the
//! stack's config file.

use indexmap::IndexMap;

use crate::core::config::StackConfig;
use crate::core::graph::ResourceOptions;
use crate::core::stack::{Environment, Stack};
use crate::core::value::literal;
use crate::error::Result;
use crate::resources::network::{Network, NetworkArgs};

pub fn build(env: Environment, cfg: &StackConfig) -> Result<Stack> {
    let mut stack = Stack::new("network", env);
    let is_prod = env.is_prod();

    let az_count = cfg.usize_or("azCount", if is_prod { 3 } else { 2 });
    let enable_ha_nat = cfg.bool_or("enableHaNat", is_prod);
    let enable_endpoints = cfg.bool_or("enableEndpoints", true);
    let cluster_name = cfg.str_or("clusterName", format!("eks-{}", env));
    let vpc_cidr = cfg.str_or("vpcCidr", "10.0.0.0/16");
    let region = cfg.str_or("region", "us-east-1");

    let mut tags = IndexMap::new();
    tags.insert("app".to_string(), "chatbot".to_string());
    tags.insert("env".to_string(), env.to_string());
    tags.insert("stack".to_string(), stack.id());

    let net = Network::new(
        stack.context(),
        "net",
        NetworkArgs {
            cluster_name: cluster_name.clone(),
            vpc_cidr,
            region,
            az_count,
            enable_ha_nat,
            enable_endpoints,
            tags,
            ..Default::default()
        },
        ResourceOptions::default(),
    )?;

    // Consumed by the cluster stack through a stack reference.
    stack.export("clusterName", literal(cluster_name));
    stack.export("vpcId", net.vpc_id.clone());
    stack.export("publicSubnetIds", net.public_subnet_ids.clone());
    stack.export("privateSubnetIds", net.private_subnet_ids.clone());
    Ok(stack)
}
