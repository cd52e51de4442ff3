//! Plan generation — diff the declared graph against persisted stack state
//! without touching any provider.
//!
//! Nodes whose inputs are fully known and unchanged are reported as no-ops
//! and their output cells are replayed from state, which in turn makes
//! downstream inputs computable. A node whose inputs hang off a changing
//! upstream resource is conservatively planned as an update.

use std::fmt;

use serde_json::Value;

use crate::core::graph::{BuiltGraph, NodeKind};
use crate::core::state::StackState;
use crate::core::value::Input;
use crate::error::Result;
use crate::hasher;
use crate::provider::{PropertyMap, ProviderRegistry};

/// Action to take on a node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlanAction {
    Create,
    Update,
    Replace,
    Delete,
    NoOp,
}

impl fmt::Display for PlanAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Create => write!(f, "CREATE"),
            Self::Update => write!(f, "UPDATE"),
            Self::Replace => write!(f, "REPLACE"),
            Self::Delete => write!(f, "DELETE"),
            Self::NoOp => write!(f, "NO-OP"),
        }
    }
}

/// A single planned change.
#[derive(Debug, Clone)]
pub struct PlannedChange {
    pub urn: String,
    pub ty: String,
    pub action: PlanAction,
    pub detail: String,
}

/// Full preview of an apply.
#[derive(Debug, Clone)]
pub struct Plan {
    pub stack: String,
    pub changes: Vec<PlannedChange>,
    pub to_create: u32,
    pub to_update: u32,
    pub to_replace: u32,
    pub to_delete: u32,
    pub unchanged: u32,
}

impl Plan {
    pub fn has_changes(&self) -> bool {
        self.to_create + self.to_update + self.to_replace + self.to_delete > 0
    }
}

/// Inputs if every cell has already resolved; `None` while any is pending or
/// rejected.
pub fn resolved_inputs(inputs: &[(String, Input)]) -> Option<PropertyMap> {
    let mut map = PropertyMap::new();
    for (name, cell) in inputs {
        match cell.try_get() {
            Some(Ok(value)) => {
                map.insert(name.clone(), value);
            }
            _ => return None,
        }
    }
    Some(map)
}

/// Keys whose value differs between the stored inputs and the desired ones.
pub fn changed_keys(stored: &Value, desired: &PropertyMap) -> Vec<String> {
    let empty = serde_json::Map::new();
    let stored = stored.as_object().unwrap_or(&empty);
    let mut keys: Vec<String> = Vec::new();
    for (k, v) in desired {
        if stored.get(k) != Some(v) {
            keys.push(k.clone());
        }
    }
    for k in stored.keys() {
        if !desired.contains_key(k) && !keys.contains(k) {
            keys.push(k.clone());
        }
    }
    keys
}

/// A change to any create-only property forces replacement.
pub fn replace_required(create_only: &[&str], changed: &[String]) -> bool {
    changed.iter().any(|k| create_only.contains(&k.as_str()))
}

/// Replay a node's registered output cells from its stored outputs.
pub(crate) fn replay_outputs(outputs: &[(String, Input)], stored: &Value, id: &str) {
    let empty = serde_json::Map::new();
    let stored = stored.as_object().unwrap_or(&empty);
    for (name, cell) in outputs {
        let value = if name == "id" && !stored.contains_key("id") {
            Value::String(id.to_string())
        } else {
            stored.get(name).cloned().unwrap_or(Value::Null)
        };
        cell.settle(Ok(value));
    }
}

/// Compute the planned operations for a graph against persisted state.
pub fn plan(
    graph: &BuiltGraph,
    state: Option<&StackState>,
    providers: &ProviderRegistry,
) -> Result<Plan> {
    let stack = state.map(|s| s.stack.clone()).unwrap_or_default();
    let mut changes = Vec::new();
    let mut to_create = 0u32;
    let mut to_update = 0u32;
    let mut to_replace = 0u32;
    let mut to_delete = 0u32;
    let mut unchanged = 0u32;

    for &id in &graph.order {
        let node = &graph.nodes[id.0];
        let prior = state.and_then(|s| s.resources.get(&node.urn));

        if node.kind == NodeKind::Component {
            let action = if prior.is_some() {
                unchanged += 1;
                PlanAction::NoOp
            } else {
                to_create += 1;
                PlanAction::Create
            };
            changes.push(PlannedChange {
                urn: node.urn.clone(),
                ty: node.ty.clone(),
                action,
                detail: "component".to_string(),
            });
            continue;
        }

        let (action, detail) = match (prior, resolved_inputs(&node.inputs)) {
            (None, _) => (PlanAction::Create, format!("create {}", node.name)),
            (Some(p), Some(inputs)) => {
                let fp = hasher::fingerprint(&node.ty, &inputs);
                if fp == p.inputs_hash && !p.id.is_empty() {
                    replay_outputs(&node.outputs, &p.outputs, &p.id);
                    (PlanAction::NoOp, "no changes".to_string())
                } else {
                    let changed = changed_keys(&p.inputs, &inputs);
                    let provider = providers.for_type(&node.ty)?;
                    if replace_required(provider.create_only(&node.ty), &changed) {
                        (
                            PlanAction::Replace,
                            format!("changed: {}", changed.join(", ")),
                        )
                    } else {
                        (
                            PlanAction::Update,
                            format!("changed: {}", changed.join(", ")),
                        )
                    }
                }
            }
            (Some(_), None) => (
                PlanAction::Update,
                "inputs depend on changed resources".to_string(),
            ),
        };

        match action {
            PlanAction::Create => to_create += 1,
            PlanAction::Update => to_update += 1,
            PlanAction::Replace => to_replace += 1,
            PlanAction::NoOp => unchanged += 1,
            PlanAction::Delete => {}
        }
        changes.push(PlannedChange {
            urn: node.urn.clone(),
            ty: node.ty.clone(),
            action,
            detail,
        });
    }

    // Orphans: persisted nodes no longer declared, deleted in reverse order.
    if let Some(state) = state {
        let declared: Vec<&str> = graph.nodes.iter().map(|n| n.urn.as_str()).collect();
        for (urn, entry) in state.resources.iter().rev() {
            if !declared.contains(&urn.as_str()) {
                to_delete += 1;
                changes.push(PlannedChange {
                    urn: urn.clone(),
                    ty: entry.ty.clone(),
                    action: PlanAction::Delete,
                    detail: "no longer declared".to_string(),
                });
            }
        }
    }

    Ok(Plan {
        stack,
        changes,
        to_create,
        to_update,
        to_replace,
        to_delete,
        unchanged,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::graph::{Context, ResourceOptions};
    use crate::core::state::{new_state, ResourceState};
    use crate::core::value::literal;
    use crate::provider::sim::SimCloud;
    use indexmap::IndexMap;
    use serde_json::json;
    use std::sync::Arc;

    fn providers() -> ProviderRegistry {
        let mut registry = ProviderRegistry::new();
        registry.register(Arc::new(SimCloud::new("aws")));
        registry
    }

    fn vpc_graph(cidr: &str) -> BuiltGraph {
        let ctx = Context::new("network-dev");
        let mut inputs = IndexMap::new();
        inputs.insert("cidrBlock".to_string(), literal(cidr));
        ctx.declare("aws:ec2:Vpc", "vpc", inputs, ResourceOptions::default())
            .unwrap();
        ctx.build().unwrap()
    }

    fn stored_vpc(cidr: &str) -> ResourceState {
        let mut inputs = PropertyMap::new();
        inputs.insert("cidrBlock".to_string(), json!(cidr));
        ResourceState {
            ty: "aws:ec2:Vpc".to_string(),
            component: false,
            id: "vpc-123".to_string(),
            inputs_hash: hasher::fingerprint("aws:ec2:Vpc", &inputs),
            inputs: Value::Object(inputs),
            outputs: json!({"id": "vpc-123", "cidrBlock": cidr}),
            protect: false,
            dependencies: vec![],
            applied_at: None,
            duration_seconds: None,
        }
    }

    #[test]
    fn test_plan_all_create_on_fresh_state() {
        let graph = vpc_graph("10.0.0.0/16");
        let plan = plan(&graph, None, &providers()).unwrap();
        assert_eq!(plan.to_create, 1);
        assert_eq!(plan.unchanged, 0);
        assert!(plan.has_changes());
    }

    #[test]
    fn test_plan_noop_when_fingerprint_matches() {
        let graph = vpc_graph("10.0.0.0/16");
        let mut state = new_state("network-dev");
        state.resources.insert(
            graph.nodes[0].urn.clone(),
            stored_vpc("10.0.0.0/16"),
        );

        let plan = plan(&graph, Some(&state), &providers()).unwrap();
        assert_eq!(plan.unchanged, 1);
        assert!(!plan.has_changes());
    }

    #[test]
    fn test_plan_noop_replays_outputs() {
        let ctx = Context::new("network-dev");
        let mut inputs = IndexMap::new();
        inputs.insert("cidrBlock".to_string(), literal("10.0.0.0/16"));
        let vpc = ctx
            .declare("aws:ec2:Vpc", "vpc", inputs, ResourceOptions::default())
            .unwrap();
        let id_cell = vpc.output("id");
        let graph = ctx.build().unwrap();

        let mut state = new_state("network-dev");
        state
            .resources
            .insert(graph.nodes[0].urn.clone(), stored_vpc("10.0.0.0/16"));

        plan(&graph, Some(&state), &providers()).unwrap();
        assert_eq!(id_cell.try_get(), Some(Ok(json!("vpc-123"))));
    }

    #[test]
    fn test_plan_update_on_changed_updatable_input() {
        let ctx = Context::new("network-dev");
        let mut inputs = IndexMap::new();
        inputs.insert("cidrBlock".to_string(), literal("10.0.0.0/16"));
        inputs.insert("enableDnsSupport".to_string(), literal(false));
        ctx.declare("aws:ec2:Vpc", "vpc", inputs, ResourceOptions::default())
            .unwrap();
        let graph = ctx.build().unwrap();

        let mut stored_inputs = PropertyMap::new();
        stored_inputs.insert("cidrBlock".to_string(), json!("10.0.0.0/16"));
        stored_inputs.insert("enableDnsSupport".to_string(), json!(true));
        let mut entry = stored_vpc("10.0.0.0/16");
        entry.inputs_hash = hasher::fingerprint("aws:ec2:Vpc", &stored_inputs);
        entry.inputs = Value::Object(stored_inputs);

        let mut state = new_state("network-dev");
        state.resources.insert(graph.nodes[0].urn.clone(), entry);

        let plan = plan(&graph, Some(&state), &providers()).unwrap();
        assert_eq!(plan.to_update, 1);
        assert!(plan.changes[0].detail.contains("enableDnsSupport"));
    }

    #[test]
    fn test_plan_replace_on_create_only_change() {
        let graph = vpc_graph("10.9.0.0/16");
        let mut state = new_state("network-dev");
        state
            .resources
            .insert(graph.nodes[0].urn.clone(), stored_vpc("10.0.0.0/16"));

        let plan = plan(&graph, Some(&state), &providers()).unwrap();
        assert_eq!(plan.to_replace, 1);
        assert_eq!(plan.changes[0].action, PlanAction::Replace);
    }

    #[test]
    fn test_plan_marks_orphans_for_delete() {
        let graph = vpc_graph("10.0.0.0/16");
        let mut state = new_state("network-dev");
        state
            .resources
            .insert(graph.nodes[0].urn.clone(), stored_vpc("10.0.0.0/16"));
        state.resources.insert(
            "urn:network-dev::aws:ec2:Subnet::gone".to_string(),
            ResourceState {
                ty: "aws:ec2:Subnet".to_string(),
                component: false,
                id: "subnet-9".to_string(),
                inputs_hash: "blake3:zzz".to_string(),
                inputs: json!({}),
                outputs: json!({}),
                protect: false,
                dependencies: vec![],
                applied_at: None,
                duration_seconds: None,
            },
        );

        let plan = plan(&graph, Some(&state), &providers()).unwrap();
        assert_eq!(plan.to_delete, 1);
        let delete = plan
            .changes
            .iter()
            .find(|c| c.action == PlanAction::Delete)
            .unwrap();
        assert!(delete.urn.ends_with("gone"));
    }

    #[test]
    fn test_plan_dependent_of_changed_node_is_update() {
        let ctx = Context::new("network-dev");
        let mut vpc_inputs = IndexMap::new();
        vpc_inputs.insert("cidrBlock".to_string(), literal("10.9.0.0/16"));
        let vpc = ctx
            .declare("aws:ec2:Vpc", "vpc", vpc_inputs, ResourceOptions::default())
            .unwrap();
        let mut subnet_inputs = IndexMap::new();
        subnet_inputs.insert("vpcId".to_string(), vpc.output("id"));
        ctx.declare(
            "aws:ec2:Subnet",
            "public-0",
            subnet_inputs,
            ResourceOptions::default(),
        )
        .unwrap();
        let graph = ctx.build().unwrap();

        let mut state = new_state("network-dev");
        state
            .resources
            .insert(graph.nodes[0].urn.clone(), stored_vpc("10.0.0.0/16"));
        state.resources.insert(
            graph.nodes[1].urn.clone(),
            ResourceState {
                ty: "aws:ec2:Subnet".to_string(),
                component: false,
                id: "subnet-1".to_string(),
                inputs_hash: "blake3:old".to_string(),
                inputs: json!({"vpcId": "vpc-123"}),
                outputs: json!({}),
                protect: false,
                dependencies: vec![graph.nodes[0].urn.clone()],
                applied_at: None,
                duration_seconds: None,
            },
        );

        let plan = plan(&graph, Some(&state), &providers()).unwrap();
        // VPC replaces; the subnet's vpcId is unknowable until apply.
        assert_eq!(plan.to_replace, 1);
        let subnet = &plan.changes[1];
        assert_eq!(subnet.action, PlanAction::Update);
        assert!(subnet.detail.contains("depend"));
    }

    #[test]
    fn test_changed_keys_covers_removed_and_added() {
        let stored = json!({"a": 1, "b": 2});
        let mut desired = PropertyMap::new();
        desired.insert("a".to_string(), json!(1));
        desired.insert("c".to_string(), json!(3));
        let mut keys = changed_keys(&stored, &desired);
        keys.sort();
        assert_eq!(keys, vec!["b", "c"]);
    }

    #[test]
    fn test_replace_required() {
        assert!(replace_required(
            &["cidrBlock"],
            &["cidrBlock".to_string(), "tags".to_string()]
        ));
        assert!(!replace_required(&["cidrBlock"], &["tags".to_string()]));
    }
}
