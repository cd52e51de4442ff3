//! Cluster add-ons — named managed add-ons pinned to a cluster, optionally
//! version-pinned.

use serde_json::json;

use crate::core::component::{Component, ComponentOutputs};
use crate::core::graph::{Context, NodeId, ResourceOptions};
use crate::core::value::{literal, Input};
use crate::error::Result;
use crate::resources::input_map;

#[derive(Debug, Clone)]
pub struct Addon {
    pub name: String,
    pub version: Option<String>,
}

impl Addon {
    pub fn latest(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            version: None,
        }
    }

    pub fn pinned(name: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            version: Some(version.into()),
        }
    }
}

pub struct ClusterAddonsArgs {
    pub cluster_name: Input,
    pub addons: Vec<Addon>,
}

#[derive(Debug)]
pub struct ClusterAddons {
    pub addon_names: Input,
    outputs: ComponentOutputs,
}

impl ClusterAddons {
    pub fn new(
        ctx: &Context,
        name: &str,
        args: ClusterAddonsArgs,
        opts: ResourceOptions,
    ) -> Result<Self> {
        let mut component = Component::new(ctx, "pkg:compute:ClusterAddons", name, opts)?;

        for addon in &args.addons {
            let version = addon
                .version
                .clone()
                .map(literal)
                .unwrap_or_else(|| literal("latest"));
            ctx.declare(
                "aws:eks:Addon",
                &addon.name,
                input_map([
                    ("clusterName", args.cluster_name.clone()),
                    ("addonName", literal(addon.name.clone())),
                    ("addonVersion", version),
                ]),
                component.child_opts(),
            )?;
        }

        let names: Vec<String> = args.addons.iter().map(|a| a.name.clone()).collect();
        let addon_names = literal(json!(names));
        component.expose("addonNames", addon_names.clone())?;
        let outputs = component.finish();

        Ok(Self {
            addon_names,
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

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_addons_declared_per_entry() {
        let ctx = Context::new("addons-dev");
        let addons = ClusterAddons::new(
            &ctx,
            "addons",
            ClusterAddonsArgs {
                cluster_name: literal("eks-dev"),
                addons: vec![
                    Addon::latest("vpc-cni"),
                    Addon::pinned("coredns", "v1.11.1"),
                    Addon::latest("kube-proxy"),
                ],
            },
            ResourceOptions::default(),
        )
        .unwrap();

        let graph = ctx.build().unwrap();
        let declared: Vec<&str> = graph
            .nodes
            .iter()
            .filter(|n| n.ty == "aws:eks:Addon")
            .map(|n| n.name.as_str())
            .collect();
        assert_eq!(declared, vec!["vpc-cni", "coredns", "kube-proxy"]);
        assert_eq!(
            addons.addon_names.try_get(),
            Some(Ok(json!(["vpc-cni", "coredns", "kube-proxy"])))
        );
    }

    #[test]
    fn test_duplicate_addon_name_is_rejected() {
        let ctx = Context::new("addons-dev");
        let err = ClusterAddons::new(
            &ctx,
            "addons",
            ClusterAddonsArgs {
                cluster_name: literal("eks-dev"),
                addons: vec![Addon::latest("coredns"), Addon::latest("coredns")],
            },
            ResourceOptions::default(),
        )
        .unwrap_err();
        assert!(matches!(err, crate::error::Error::DuplicateIdentity { .. }));
    }
}
