//! HA network component: VPC, public/private subnets across availability
//! zones, internet gateway, NAT (per-AZ or single), route tables and optional
//! service endpoints.
//!
//! Subnet CIDRs are carved out of the VPC block as /24s: the first `az_count`
//! for public subnets, the next `az_count` for private ones, so the VPC CIDR
//! must be wide enough for `2 * az_count` /24 blocks.

use indexmap::IndexMap;
use serde_json::json;

use crate::core::component::{Component, ComponentOutputs};
use crate::core::graph::{Context, NodeId, ResourceOptions};
use crate::core::value::{literal, Cell, Input};
use crate::error::{Error, Result};
use crate::resources::{input_map, tag_value};

pub struct NetworkArgs {
    pub cluster_name: String,
    pub vpc_cidr: String,
    pub region: String,
    pub az_count: usize,
    /// true: NAT gateway per AZ (HA); false: single NAT (cost saving)
    pub enable_ha_nat: bool,
    /// Gateway endpoint for object storage + interface endpoints below
    pub enable_endpoints: bool,
    pub interface_endpoints: Vec<String>,
    pub tags: IndexMap<String, String>,
}

impl Default for NetworkArgs {
    fn default() -> Self {
        Self {
            cluster_name: "eks-dev".to_string(),
            vpc_cidr: "10.0.0.0/16".to_string(),
            region: "us-east-1".to_string(),
            az_count: 3,
            enable_ha_nat: true,
            enable_endpoints: true,
            interface_endpoints: ["ecr.api", "ecr.dkr", "logs", "sts"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
            tags: IndexMap::new(),
        }
    }
}

pub struct Network {
    pub vpc_id: Input,
    pub public_subnet_ids: Input,
    pub private_subnet_ids: Input,
    outputs: ComponentOutputs,
}

impl Network {
    pub fn new(ctx: &Context, name: &str, args: NetworkArgs, opts: ResourceOptions) -> Result<Self> {
        let mut component = Component::new(ctx, "pkg:network:Network", name, opts)?;
        let tags = |name_tag: &str| {
            tag_value(
                &args.tags,
                &[("name", &format!("{}-{}", args.cluster_name, name_tag))],
            )
        };

        let azs = availability_zones(&args.region, args.az_count);
        let (public_cidrs, private_cidrs) = derive_subnet_cidrs(&args.vpc_cidr, azs.len(), 24)?;

        let vpc = ctx.declare(
            "aws:ec2:Vpc",
            "vpc",
            input_map([
                ("cidrBlock", literal(args.vpc_cidr.clone())),
                ("enableDnsSupport", literal(true)),
                ("enableDnsHostnames", literal(true)),
                ("tags", tags("vpc")),
            ]),
            component.child_opts(),
        )?;

        let igw = ctx.declare(
            "aws:ec2:InternetGateway",
            "igw",
            input_map([("vpcId", vpc.output("id")), ("tags", tags("igw"))]),
            component.child_opts(),
        )?;

        let public_rt = ctx.declare(
            "aws:ec2:RouteTable",
            "public-rt",
            input_map([
                ("vpcId", vpc.output("id")),
                (
                    "routes",
                    igw.output("id")
                        .map(|id| json!([{"cidrBlock": "0.0.0.0/0", "gatewayId": id}])),
                ),
                ("tags", tags("public-rt")),
            ]),
            component.child_opts(),
        )?;

        let mut public_subnets = Vec::new();
        let mut private_subnets = Vec::new();
        for (i, az) in azs.iter().enumerate() {
            let public = ctx.declare(
                "aws:ec2:Subnet",
                &format!("public-{}", i),
                input_map([
                    ("vpcId", vpc.output("id")),
                    ("availabilityZone", literal(az.clone())),
                    ("cidrBlock", literal(public_cidrs[i].clone())),
                    ("mapPublicIpOnLaunch", literal(true)),
                    ("tags", tags(&format!("public-{}", az))),
                ]),
                component.child_opts(),
            )?;
            ctx.declare(
                "aws:ec2:RouteTableAssociation",
                &format!("public-rta-{}", i),
                input_map([
                    ("subnetId", public.output("id")),
                    ("routeTableId", public_rt.output("id")),
                ]),
                component.child_opts(),
            )?;
            public_subnets.push(public);

            let private = ctx.declare(
                "aws:ec2:Subnet",
                &format!("private-{}", i),
                input_map([
                    ("vpcId", vpc.output("id")),
                    ("availabilityZone", literal(az.clone())),
                    ("cidrBlock", literal(private_cidrs[i].clone())),
                    ("mapPublicIpOnLaunch", literal(false)),
                    ("tags", tags(&format!("private-{}", az))),
                ]),
                component.child_opts(),
            )?;
            private_subnets.push(private);
        }

        // NAT gateways: one per AZ when HA, otherwise a single shared one.
        let nat_count = if args.enable_ha_nat { azs.len() } else { 1 };
        let mut nat_gateways = Vec::new();
        for i in 0..nat_count {
            let eip = ctx.declare(
                "aws:ec2:Eip",
                &format!("nat-eip-{}", i),
                input_map([("domain", literal("vpc")), ("tags", tags(&format!("nat-eip-{}", i)))]),
                component.child_opts(),
            )?;
            let nat = ctx.declare(
                "aws:ec2:NatGateway",
                &format!("natgw-{}", i),
                input_map([
                    ("allocationId", eip.output("id")),
                    ("subnetId", public_subnets[i].output("id")),
                    ("tags", tags(&format!("natgw-{}", i))),
                ]),
                component.child_opts(),
            )?;
            nat_gateways.push(nat);
        }

        let mut private_rts = Vec::new();
        for (i, private) in private_subnets.iter().enumerate() {
            let nat_index = if args.enable_ha_nat { i } else { 0 };
            let rt = ctx.declare(
                "aws:ec2:RouteTable",
                &format!("private-rt-{}", i),
                input_map([
                    ("vpcId", vpc.output("id")),
                    (
                        "routes",
                        nat_gateways[nat_index]
                            .output("id")
                            .map(|id| json!([{"cidrBlock": "0.0.0.0/0", "natGatewayId": id}])),
                    ),
                    ("tags", tags(&format!("private-rt-{}", i))),
                ]),
                component.child_opts(),
            )?;
            ctx.declare(
                "aws:ec2:RouteTableAssociation",
                &format!("private-rta-{}", i),
                input_map([
                    ("subnetId", private.output("id")),
                    ("routeTableId", rt.output("id")),
                ]),
                component.child_opts(),
            )?;
            private_rts.push(rt);
        }

        if args.enable_endpoints {
            let rt_ids = Cell::combine(
                &private_rts.iter().map(|rt| rt.output("id")).collect::<Vec<_>>(),
            )
            .map(|ids| json!(ids));
            ctx.declare(
                "aws:ec2:VpcEndpoint",
                "vpce-s3",
                input_map([
                    ("vpcId", vpc.output("id")),
                    ("vpcEndpointType", literal("Gateway")),
                    (
                        "serviceName",
                        literal(format!("com.amazonaws.{}.s3", args.region)),
                    ),
                    ("routeTableIds", rt_ids),
                    ("tags", tags("vpce-s3")),
                ]),
                component.child_opts(),
            )?;

            let vpce_sg = ctx.declare(
                "aws:ec2:SecurityGroup",
                "vpce-sg",
                input_map([
                    ("vpcId", vpc.output("id")),
                    ("description", literal("endpoint SG (443 from within the VPC)")),
                    (
                        "ingress",
                        literal(json!([{
                            "protocol": "tcp",
                            "fromPort": 443,
                            "toPort": 443,
                            "cidrBlocks": [args.vpc_cidr.clone()],
                        }])),
                    ),
                    (
                        "egress",
                        literal(json!([{
                            "protocol": "-1",
                            "fromPort": 0,
                            "toPort": 0,
                            "cidrBlocks": ["0.0.0.0/0"],
                        }])),
                    ),
                    ("tags", tags("vpce-sg")),
                ]),
                component.child_opts(),
            )?;

            let subnet_ids = Cell::combine(
                &private_subnets
                    .iter()
                    .map(|s| s.output("id"))
                    .collect::<Vec<_>>(),
            )
            .map(|ids| json!(ids));
            for svc in &args.interface_endpoints {
                ctx.declare(
                    "aws:ec2:VpcEndpoint",
                    &format!("vpce-{}", svc.replace('.', "-")),
                    input_map([
                        ("vpcId", vpc.output("id")),
                        ("vpcEndpointType", literal("Interface")),
                        (
                            "serviceName",
                            literal(format!("com.amazonaws.{}.{}", args.region, svc)),
                        ),
                        ("subnetIds", subnet_ids.clone()),
                        ("privateDnsEnabled", literal(true)),
                        (
                            "securityGroupIds",
                            vpce_sg.output("id").map(|id| json!([id])),
                        ),
                        ("tags", tags(&format!("vpce-{}", svc))),
                    ]),
                    component.child_opts(),
                )?;
            }
        }

        let public_subnet_ids = Cell::combine(
            &public_subnets
                .iter()
                .map(|s| s.output("id"))
                .collect::<Vec<_>>(),
        )
        .map(|ids| json!(ids));
        let private_subnet_ids = Cell::combine(
            &private_subnets
                .iter()
                .map(|s| s.output("id"))
                .collect::<Vec<_>>(),
        )
        .map(|ids| json!(ids));
        let vpc_id = vpc.output("id");

        component.expose("vpcId", vpc_id.clone())?;
        component.expose("publicSubnetIds", public_subnet_ids.clone())?;
        component.expose("privateSubnetIds", private_subnet_ids.clone())?;
        let outputs = component.finish();

        Ok(Self {
            vpc_id,
            public_subnet_ids,
            private_subnet_ids,
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

/// `region` plus a letter suffix per zone, capped at six.
fn availability_zones(region: &str, count: usize) -> Vec<String> {
    (0..count.clamp(1, 6))
        .map(|i| format!("{}{}", region, (b'a' + i as u8) as char))
        .collect()
}

/// Split `vpc_cidr` into /`new_prefix` blocks: the first `az_count` are
/// public, the next `az_count` private.
pub fn derive_subnet_cidrs(
    vpc_cidr: &str,
    az_count: usize,
    new_prefix: u8,
) -> Result<(Vec<String>, Vec<String>)> {
    let (base, prefix) = parse_cidr(vpc_cidr)?;
    if new_prefix < prefix {
        return Err(Error::Config(format!(
            "subnet prefix /{} must be >= vpc prefix /{}",
            new_prefix, prefix
        )));
    }
    let available = 1u64 << (new_prefix - prefix);
    let needed = (2 * az_count) as u64;
    if available < needed {
        return Err(Error::Config(format!(
            "vpc cidr {} cannot provide {} subnets of /{}",
            vpc_cidr, needed, new_prefix
        )));
    }

    let block = 1u32 << (32 - new_prefix);
    let subnet = |i: usize| format_cidr(base + (i as u32) * block, new_prefix);
    let public = (0..az_count).map(subnet).collect();
    let private = (az_count..2 * az_count).map(subnet).collect();
    Ok((public, private))
}

fn parse_cidr(cidr: &str) -> Result<(u32, u8)> {
    let invalid = || Error::Config(format!("invalid CIDR '{}'", cidr));
    let (addr, prefix) = cidr.split_once('/').ok_or_else(invalid)?;
    let prefix: u8 = prefix.parse().map_err(|_| invalid())?;
    if prefix > 32 {
        return Err(invalid());
    }
    let mut value: u32 = 0;
    let mut octets = 0;
    for part in addr.split('.') {
        let octet: u8 = part.parse().map_err(|_| invalid())?;
        value = (value << 8) | octet as u32;
        octets += 1;
    }
    if octets != 4 {
        return Err(invalid());
    }
    Ok((value, prefix))
}

fn format_cidr(addr: u32, prefix: u8) -> String {
    format!(
        "{}.{}.{}.{}/{}",
        (addr >> 24) & 0xff,
        (addr >> 16) & 0xff,
        (addr >> 8) & 0xff,
        addr & 0xff,
        prefix
    )
}
