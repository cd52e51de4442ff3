//! Managed cluster component: control-plane and node IAM roles with policy
//! attachments, a control-plane security group, the cluster itself, a managed
//! node group and an OIDC provider. The kubeconfig output is secret.

use indexmap::IndexMap;
use serde_json::json;

use crate::core::component::{Component, ComponentOutputs};
use crate::core::graph::{Context, NodeId, ResourceOptions};
use crate::core::value::{literal, Cell, Input};
use crate::error::Result;
use crate::resources::{input_map, tag_value};

pub struct ClusterArgs {
    pub cluster_name: Input,
    pub vpc_id: Input,
    pub private_subnet_ids: Input,
    pub k8s_version: String,
    pub endpoint_public_access: bool,
    pub endpoint_private_access: bool,
    pub instance_types: Vec<String>,
    pub desired_size: u64,
    pub min_size: u64,
    pub max_size: u64,
    pub tags: IndexMap<String, String>,
}

pub struct Cluster {
    pub cluster_name: Input,
    pub cluster_arn: Input,
    pub node_group_name: Input,
    pub oidc_provider_arn: Input,
    /// Secret: rendered credentials for talking to the control plane.
    pub kubeconfig: Input,
    outputs: ComponentOutputs,
}

const CLUSTER_POLICIES: [&str; 2] = [
    "arn:aws:iam::aws:policy/AmazonEKSClusterPolicy",
    "arn:aws:iam::aws:policy/AmazonEKSServicePolicy",
];

const NODE_POLICIES: [&str; 3] = [
    "arn:aws:iam::aws:policy/AmazonEKSWorkerNodePolicy",
    "arn:aws:iam::aws:policy/AmazonEKS_CNI_Policy",
    "arn:aws:iam::aws:policy/AmazonEC2ContainerRegistryReadOnly",
];

fn assume_role_policy(service: &str) -> Input {
    literal(
        json!({
            "version": "2012-10-17",
            "statement": [{
                "action": "sts:AssumeRole",
                "effect": "Allow",
                "principal": {"service": service},
            }],
        })
        .to_string(),
    )
}

impl Cluster {
    pub fn new(ctx: &Context, name: &str, args: ClusterArgs, opts: ResourceOptions) -> Result<Self> {
        let mut component = Component::new(ctx, "pkg:compute:Cluster", name, opts)?;
        let tags = tag_value(&args.tags, &[]);

        let cluster_role = ctx.declare(
            "aws:iam:Role",
            "cluster-role",
            input_map([
                ("assumeRolePolicy", assume_role_policy("eks.amazonaws.com")),
                ("tags", tags.clone()),
            ]),
            component.child_opts(),
        )?;
        for policy in CLUSTER_POLICIES {
            let short = policy.rsplit('/').next().unwrap_or(policy);
            ctx.declare(
                "aws:iam:RolePolicyAttachment",
                &format!("cluster-{}", short),
                input_map([
                    ("role", cluster_role.output("id")),
                    ("policyArn", literal(policy)),
                ]),
                component.child_opts(),
            )?;
        }

        let cluster_sg = ctx.declare(
            "aws:ec2:SecurityGroup",
            "cluster-sg",
            input_map([
                ("vpcId", args.vpc_id.clone()),
                ("description", literal("control-plane security group")),
                (
                    "egress",
                    literal(json!([{
                        "protocol": "-1",
                        "fromPort": 0,
                        "toPort": 0,
                        "cidrBlocks": ["0.0.0.0/0"],
                    }])),
                ),
                ("tags", tags.clone()),
            ]),
            component.child_opts(),
        )?;

        let cluster = ctx.declare(
            "aws:eks:Cluster",
            "cluster",
            input_map([
                ("name", args.cluster_name.clone()),
                ("roleArn", cluster_role.output("arn")),
                ("version", literal(args.k8s_version.clone())),
                // Nodes live in private subnets; load balancers find the
                // public ones through subnet tags.
                ("subnetIds", args.private_subnet_ids.clone()),
                ("securityGroupIds", cluster_sg.output("id").map(|id| json!([id]))),
                ("endpointPublicAccess", literal(args.endpoint_public_access)),
                ("endpointPrivateAccess", literal(args.endpoint_private_access)),
                ("tags", tags.clone()),
            ]),
            component.child_opts(),
        )?;

        let node_role = ctx.declare(
            "aws:iam:Role",
            "node-role",
            input_map([
                ("assumeRolePolicy", assume_role_policy("ec2.amazonaws.com")),
                ("tags", tags.clone()),
            ]),
            component.child_opts(),
        )?;
        for policy in NODE_POLICIES {
            let short = policy.rsplit('/').next().unwrap_or(policy);
            ctx.declare(
                "aws:iam:RolePolicyAttachment",
                &format!("node-{}", short),
                input_map([
                    ("role", node_role.output("id")),
                    ("policyArn", literal(policy)),
                ]),
                component.child_opts(),
            )?;
        }

        let node_group = ctx.declare(
            "aws:eks:NodeGroup",
            "nodes",
            input_map([
                ("clusterName", cluster.output("name")),
                ("nodeGroupName", literal(format!("{}-nodes", name))),
                ("nodeRoleArn", node_role.output("arn")),
                ("subnetIds", args.private_subnet_ids.clone()),
                ("instanceTypes", literal(json!(args.instance_types))),
                (
                    "scalingConfig",
                    literal(json!({
                        "desiredSize": args.desired_size,
                        "minSize": args.min_size,
                        "maxSize": args.max_size,
                    })),
                ),
                ("tags", tags.clone()),
            ]),
            component.child_opts(),
        )?;

        let oidc = ctx.declare(
            "aws:iam:OidcProvider",
            "oidc",
            input_map([
                ("url", cluster.output("oidcIssuer")),
                ("clientIdList", literal(json!(["sts.amazonaws.com"]))),
                ("tags", tags.clone()),
            ]),
            component.child_opts(),
        )?;

        let kubeconfig = Cell::combine(&[
            cluster.output("name"),
            cluster.output("endpoint"),
            cluster.output("certificateAuthority"),
        ])
        .map(|parts| {
            let get = |i: usize| {
                parts
                    .get(i)
                    .and_then(|v: &serde_json::Value| v.as_str())
                    .unwrap_or_default()
                    .to_string()
            };
            json!(render_kubeconfig(&get(0), &get(1), &get(2)))
        })
        .secret();

        let cluster_name = cluster.output("name");
        let cluster_arn = cluster.output("arn");
        let node_group_name = node_group.output("nodeGroupName");
        let oidc_provider_arn = oidc.output("arn");

        component.expose("clusterName", cluster_name.clone())?;
        component.expose("clusterArn", cluster_arn.clone())?;
        component.expose("nodeGroupName", node_group_name.clone())?;
        component.expose("oidcProviderArn", oidc_provider_arn.clone())?;
        component.expose("kubeconfig", kubeconfig.clone())?;
        let outputs = component.finish();

        Ok(Self {
            cluster_name,
            cluster_arn,
            node_group_name,
            oidc_provider_arn,
            kubeconfig,
            outputs,
        })
    }

    pub fn node(&self) -> NodeId {
        self.outputs.node()
    }

    pub fn outputs(&self) -> &ComponentOutputs {
        &self.outputs
    }
}

fn render_kubeconfig(cluster_name: &str, endpoint: &str, certificate: &str) -> String {
    format!(
        "apiVersion: v1\nkind: Config\nclusters:\n- name: {name}\n  cluster:\n    server: {endpoint}\n    certificate-authority-data: {cert}\ncontexts:\n- name: {name}\n  context:\n    cluster: {name}\n    user: {name}\ncurrent-context: {name}\n",
        name = cluster_name,
        endpoint = endpoint,
        cert = certificate,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::value::literal;

    fn args() -> ClusterArgs {
        ClusterArgs {
            cluster_name: literal("eks-dev"),
            vpc_id: literal("vpc-123"),
            private_subnet_ids: literal(json!(["subnet-1", "subnet-2"])),
            k8s_version: "1.29".to_string(),
            endpoint_public_access: true,
            endpoint_private_access: true,
            instance_types: vec!["t3.large".to_string()],
            desired_size: 2,
            min_size: 1,
            max_size: 3,
            tags: IndexMap::new(),
        }
    }

    #[test]
    fn test_cluster_children_and_contract() {
        let ctx = Context::new("cluster-dev");
        let cluster = Cluster::new(&ctx, "eks", args(), ResourceOptions::default()).unwrap();

        let graph = ctx.build().unwrap();
        let count = |ty: &str| graph.nodes.iter().filter(|n| n.ty == ty).count();
        assert_eq!(count("aws:iam:Role"), 2);
        assert_eq!(count("aws:iam:RolePolicyAttachment"), 5);
        assert_eq!(count("aws:eks:Cluster"), 1);
        assert_eq!(count("aws:eks:NodeGroup"), 1);

        let names: Vec<&str> = cluster.outputs().names().collect();
        assert_eq!(
            names,
            vec!["clusterName", "clusterArn", "nodeGroupName", "oidcProviderArn", "kubeconfig"]
        );
        assert!(cluster.outputs().get("cluster-role").is_none());
    }

    #[test]
    fn test_kubeconfig_is_secret() {
        let ctx = Context::new("cluster-dev");
        let cluster = Cluster::new(&ctx, "eks", args(), ResourceOptions::default()).unwrap();
        assert!(cluster.kubeconfig.is_secret());
        assert!(!cluster.cluster_name.is_secret());
    }

    #[test]
    fn test_node_group_waits_for_cluster() {
        let ctx = Context::new("cluster-dev");
        Cluster::new(&ctx, "eks", args(), ResourceOptions::default()).unwrap();
        let graph = ctx.build().unwrap();
        let find = |ty: &str| graph.nodes.iter().find(|n| n.ty == ty).unwrap().id;
        let cluster = find("aws:eks:Cluster");
        let nodes = find("aws:eks:NodeGroup");
        assert!(graph.deps[nodes.0].contains(&cluster));
    }

    #[test]
    fn test_render_kubeconfig_mentions_endpoint() {
        let cfg = render_kubeconfig("eks-dev", "https://api.example", "Y2E=");
        assert!(cfg.contains("server: https://api.example"));
        assert!(cfg.contains("current-context: eks-dev"));
    }
}
