//! Registry stack: the application image repository.

use crate::core::config::StackConfig;
use crate::core::graph::ResourceOptions;
use crate::core::stack::{Environment, Stack};
use crate::error::Result;
use crate::resources::registry::{ImageRegistry, ImageRegistryArgs};

pub fn build(env: Environment, cfg: &StackConfig) -> Result<Stack> {
    let mut stack = Stack::new("registry", env);
    let name = cfg.str_or("repositoryName", format!("chatbot-app-{}", env));

    let registry = ImageRegistry::new(
        stack.context(),
        "chatbot-app",
        ImageRegistryArgs {
            repository_name: name,
            untagged_expiry_days: cfg.usize_or("untaggedExpiryDays", 7) as u32,
        },
        ResourceOptions {
            protect: env.is_prod(),
            ..Default::default()
        },
    )?;

    stack.export("ecr_repo_url", registry.repository_url.clone());
    Ok(stack)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::config::ConfigMap;
    use serde_json::json;

    #[test]
    fn test_repository_name_follows_environment() {
        let cfg = StackConfig::resolve(Environment::Test, ConfigMap::default());
        let stack = build(Environment::Test, &cfg).unwrap();
        let graph = stack.context().build().unwrap();
        let repo = graph
            .nodes
            .iter()
            .find(|n| n.ty == "aws:ecr:Repository")
            .unwrap();
        let name = repo
            .inputs
            .iter()
            .find(|(k, _)| k == "name")
            .unwrap()
            .1
            .try_get()
            .unwrap()
            .unwrap();
        assert_eq!(name, json!("chatbot-app-test"));
    }

    #[test]
    fn test_single_export() {
        let cfg = StackConfig::resolve(Environment::Dev, ConfigMap::default());
        let stack = build(Environment::Dev, &cfg).unwrap();
        let names: Vec<_> = stack.exports().keys().cloned().collect();
        assert_eq!(names, vec!["ecr_repo_url"]);
    }
}
