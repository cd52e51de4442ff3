//! Image registry component — a repository with scan-on-push and a lifecycle
//! policy that expires untagged images.

use serde_json::json;

use crate::core::component::{Component, ComponentOutputs};
use crate::core::graph::{Context, NodeId, ResourceOptions};
use crate::core::value::{literal, Input};
use crate::error::Result;
use crate::resources::input_map;

pub struct ImageRegistryArgs {
    /// Physical repository name.
    pub repository_name: String,
    /// Days before untagged images expire.
    pub untagged_expiry_days: u32,
}

pub struct ImageRegistry {
    pub repository_url: Input,
    outputs: ComponentOutputs,
}

impl ImageRegistry {
    pub fn new(
        ctx: &Context,
        name: &str,
        args: ImageRegistryArgs,
        opts: ResourceOptions,
    ) -> Result<Self> {
        let mut component = Component::new(ctx, "pkg:registry:ImageRegistry", name, opts)?;

        let repo = ctx.declare(
            "aws:ecr:Repository",
            "repo",
            input_map([
                ("name", literal(args.repository_name.clone())),
                (
                    "imageScanningConfiguration",
                    literal(json!({"scanOnPush": true})),
                ),
                ("forceDelete", literal(true)),
            ]),
            component.child_opts(),
        )?;

        let policy = json!({
            "rules": [{
                "rulePriority": 1,
                "description": "Expire untagged images",
                "selection": {
                    "tagStatus": "untagged",
                    "countType": "sinceImagePushed",
                    "countNumber": args.untagged_expiry_days,
                    "countUnit": "days",
                },
                "action": {"type": "expire"},
            }],
        });
        let mut lifecycle_opts = component.child_opts();
        lifecycle_opts.depends_on = vec![repo.id()];
        ctx.declare(
            "aws:ecr:LifecyclePolicy",
            "lifecycle",
            input_map([
                ("repository", repo.output("name")),
                ("policy", literal(policy.to_string())),
            ]),
            lifecycle_opts,
        )?;

        let repository_url = repo.output("repositoryUrl");
        component.expose("repositoryUrl", repository_url.clone())?;
        let outputs = component.finish();

        Ok(Self {
            repository_url,
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

    #[test]
    fn test_lifecycle_depends_on_repo() {
        let ctx = Context::new("registry-dev");
        ImageRegistry::new(
            &ctx,
            "chatbot-app",
            ImageRegistryArgs {
                repository_name: "chatbot-app-dev".to_string(),
                untagged_expiry_days: 7,
            },
            ResourceOptions::default(),
        )
        .unwrap();

        let graph = ctx.build().unwrap();
        let repo = graph
            .nodes
            .iter()
            .find(|n| n.ty == "aws:ecr:Repository")
            .unwrap()
            .id;
        let lifecycle = graph
            .nodes
            .iter()
            .find(|n| n.ty == "aws:ecr:LifecyclePolicy")
            .unwrap();
        assert!(graph.deps[lifecycle.id.0].contains(&repo));

        let policy = lifecycle
            .inputs
            .iter()
            .find(|(k, _)| k == "policy")
            .unwrap()
            .1
            .try_get()
            .unwrap()
            .unwrap();
        assert!(policy.as_str().unwrap().contains("sinceImagePushed"));
    }

    #[test]
    fn test_contract_exposes_repository_url_only() {
        let ctx = Context::new("registry-dev");
        let registry = ImageRegistry::new(
            &ctx,
            "chatbot-app",
            ImageRegistryArgs {
                repository_name: "chatbot-app-dev".to_string(),
                untagged_expiry_days: 7,
            },
            ResourceOptions::default(),
        )
        .unwrap();
        let names: Vec<&str> = registry.outputs().names().collect();
        assert_eq!(names, vec!["repositoryUrl"]);
    }
}
