//! Cross-stack references — read another stack's persisted exported outputs.
//!
//! A reference binds to the state snapshot captured when it is opened, never
//! to a live resource subtree. Referencing a stack that has no completed
//! apply, or an output it never exported, is a resolution error rather than a
//! silent default.

use indexmap::IndexMap;

use crate::core::state::{OutputSnapshot, StateBackend};
use crate::core::value::{Cell, Input};
use crate::error::{Error, Result};

#[derive(Debug)]
pub struct StackReference {
    stack_id: String,
    outputs: IndexMap<String, OutputSnapshot>,
}

impl StackReference {
    /// Snapshot the exported outputs of an already-applied stack.
    pub fn open(backend: &StateBackend, stack_id: &str) -> Result<Self> {
        let state = backend
            .load(stack_id)?
            .ok_or_else(|| Error::StackNeverApplied(stack_id.to_string()))?;
        if state.last_apply.is_none() {
            return Err(Error::StackNeverApplied(stack_id.to_string()));
        }
        Ok(Self {
            stack_id: stack_id.to_string(),
            outputs: state.outputs,
        })
    }

    pub fn stack_id(&self) -> &str {
        &self.stack_id
    }

    /// A named output as a resolved value cell. Secret snapshots stay secret.
    pub fn output(&self, name: &str) -> Result<Input> {
        let snapshot = self
            .outputs
            .get(name)
            .ok_or_else(|| Error::MissingStackOutput {
                stack: self.stack_id.clone(),
                output: name.to_string(),
            })?;
        let cell = Cell::of(snapshot.value.clone());
        if snapshot.secret {
            cell.mark_secret();
        }
        Ok(cell)
    }

    pub fn output_names(&self) -> impl Iterator<Item = &str> {
        self.outputs.keys().map(String::as_str)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::executor::{apply, ApplyOptions};
    use crate::core::graph::ResourceOptions;
    use crate::core::stack::{Environment, Stack};
    use crate::core::value::literal;
    use crate::provider::sim::SimCloud;
    use crate::provider::ProviderRegistry;
    use indexmap::IndexMap as Map;
    use serde_json::json;
    use std::sync::Arc;

    fn providers() -> ProviderRegistry {
        let mut registry = ProviderRegistry::new();
        registry.register(Arc::new(SimCloud::new("aws")));
        registry
    }

    fn network_stack() -> Stack {
        let mut stack = Stack::new("network", Environment::Dev);
        let mut inputs = Map::new();
        inputs.insert("cidrBlock".to_string(), literal("10.0.0.0/16"));
        let vpc = stack
            .context()
            .declare("aws:ec2:Vpc", "vpc", inputs, ResourceOptions::default())
            .unwrap();
        stack.export("vpcId", vpc.output("id"));
        stack
    }

    #[test]
    fn test_reference_before_any_apply_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let backend = StateBackend::new(dir.path());
        let err = StackReference::open(&backend, "network-dev").unwrap_err();
        assert!(matches!(err, Error::StackNeverApplied(_)));
    }

    #[tokio::test]
    async fn test_consumer_resolves_producer_output_after_apply() {
        let dir = tempfile::tempdir().unwrap();
        let backend = StateBackend::new(dir.path());

        apply(&network_stack(), &providers(), &backend, &ApplyOptions::default())
            .await
            .unwrap();

        let net = StackReference::open(&backend, "network-dev").unwrap();
        let vpc_id = net.output("vpcId").unwrap();
        let value = vpc_id.try_get().unwrap().unwrap();
        assert!(value.as_str().unwrap().starts_with("vpc-"));

        // The consumer stack uses the reference as a plain input.
        let cluster = Stack::new("cluster", Environment::Dev);
        let mut inputs = Map::new();
        inputs.insert("vpcId".to_string(), vpc_id);
        inputs.insert("name".to_string(), literal("eks-dev"));
        cluster
            .context()
            .declare("aws:eks:Cluster", "eks", inputs, ResourceOptions::default())
            .unwrap();
        let report = apply(&cluster, &providers(), &backend, &ApplyOptions::default())
            .await
            .unwrap();
        assert!(!report.failed);

        let state = backend.load("cluster-dev").unwrap().unwrap();
        let entry = state.resources.values().next().unwrap();
        assert_eq!(entry.inputs["vpcId"], state_vpc_id(&backend));
    }

    fn state_vpc_id(backend: &StateBackend) -> serde_json::Value {
        backend
            .load("network-dev")
            .unwrap()
            .unwrap()
            .outputs["vpcId"]
            .value
            .clone()
    }

    #[test]
    fn test_missing_output_name_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let backend = StateBackend::new(dir.path());
        let mut state = crate::core::state::new_state("network-dev");
        state.last_apply = Some("2026-02-16T14:00:00Z".to_string());
        state.outputs.insert(
            "vpcId".to_string(),
            OutputSnapshot {
                value: json!("vpc-123"),
                secret: false,
            },
        );
        backend.save(&state).unwrap();

        let net = StackReference::open(&backend, "network-dev").unwrap();
        assert_eq!(
            net.output("vpcId").unwrap().try_get(),
            Some(Ok(json!("vpc-123")))
        );
        let err = net.output("subnetIds").unwrap_err();
        assert!(matches!(err, Error::MissingStackOutput { .. }));
    }

    #[test]
    fn test_saved_but_never_applied_state_is_not_referencable() {
        let dir = tempfile::tempdir().unwrap();
        let backend = StateBackend::new(dir.path());
        backend
            .save(&crate::core::state::new_state("network-dev"))
            .unwrap();
        assert!(matches!(
            StackReference::open(&backend, "network-dev"),
            Err(Error::StackNeverApplied(_))
        ));
    }

    #[test]
    fn test_secret_snapshot_stays_secret() {
        let dir = tempfile::tempdir().unwrap();
        let backend = StateBackend::new(dir.path());
        let mut state = crate::core::state::new_state("cluster-dev");
        state.last_apply = Some("2026-02-16T14:00:00Z".to_string());
        state.outputs.insert(
            "kubeconfig".to_string(),
            OutputSnapshot {
                value: json!("apiVersion: v1"),
                secret: true,
            },
        );
        backend.save(&state).unwrap();

        let reference = StackReference::open(&backend, "cluster-dev").unwrap();
        let cell = reference.output("kubeconfig").unwrap();
        assert!(cell.is_secret());
        assert!(cell.map(|v| v).is_secret(), "taint survives derivation");
    }
}
