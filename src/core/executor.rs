//! Wave scheduler — executes create/update/replace/delete operations in
//! dependency order.
//!
//! Nodes with all dependencies satisfied form a wave and run concurrently
//! under a global semaphore; a node never starts before every transitive
//! dependency has fully finished and populated its outputs. Failures are
//! isolated to the failing node's downstream closure; independent branches
//! keep going. An apply may be cancelled between waves: in-flight operations
//! finish, the rest of the graph is skipped, and the partially applied state
//! is persisted.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use indexmap::IndexMap;
use serde_json::Value;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{info, warn};

use crate::core::graph::{NodeExec, NodeKind};
use crate::core::journal::{self, RunEvent};
use crate::core::planner;
use crate::core::stack::Stack;
use crate::core::state::{new_state, OutputSnapshot, ResourceState, StateBackend};
use crate::core::value::CellError;
use crate::error::{Error, Result};
use crate::hasher;
use crate::provider::{PropertyMap, ProviderRegistry, ReplaceStrategy, ResourceProvider};

/// Cooperative cancellation, observed between waves only.
#[derive(Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Knobs for one apply/destroy run.
#[derive(Clone)]
pub struct ApplyOptions {
    /// Global cap on concurrent provider operations.
    pub concurrency: usize,
    /// Per-operation timeout; a hit marks the node failed, distinctly tagged.
    pub op_timeout: Duration,
    pub cancel: CancelFlag,
}

impl Default for ApplyOptions {
    fn default() -> Self {
        Self {
            concurrency: 8,
            op_timeout: Duration::from_secs(60),
            cancel: CancelFlag::new(),
        }
    }
}

/// Final disposition of one node in a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeStatus {
    Created,
    Updated,
    Replaced,
    Unchanged,
    Deleted,
    Failed,
    Blocked,
    Skipped,
}

impl NodeStatus {
    pub fn succeeded(self) -> bool {
        matches!(
            self,
            Self::Created | Self::Updated | Self::Replaced | Self::Unchanged | Self::Deleted
        )
    }
}

impl std::fmt::Display for NodeStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Created => "created",
            Self::Updated => "updated",
            Self::Replaced => "replaced",
            Self::Unchanged => "unchanged",
            Self::Deleted => "deleted",
            Self::Failed => "failed",
            Self::Blocked => "blocked",
            Self::Skipped => "skipped",
        };
        write!(f, "{}", s)
    }
}

#[derive(Debug, Clone)]
pub struct NodeReport {
    pub urn: String,
    pub status: NodeStatus,
    pub error: Option<String>,
}

#[derive(Debug)]
pub struct ApplyReport {
    pub stack: String,
    pub run_id: String,
    pub nodes: Vec<NodeReport>,
    pub failed: bool,
    pub duration: Duration,
}

impl ApplyReport {
    pub fn count(&self, status: NodeStatus) -> usize {
        self.nodes.iter().filter(|n| n.status == status).count()
    }

    pub fn status_of(&self, urn: &str) -> Option<NodeStatus> {
        self.nodes.iter().find(|n| n.urn == urn).map(|n| n.status)
    }
}

struct NodeOutcome {
    status: NodeStatus,
    entry: Option<ResourceState>,
    error: Option<Error>,
    duration: f64,
}

/// Apply a stack's declared graph against its persisted state.
pub async fn apply(
    stack: &Stack,
    providers: &ProviderRegistry,
    backend: &StateBackend,
    opts: &ApplyOptions,
) -> Result<ApplyReport> {
    let started = Instant::now();
    let stack_id = stack.id();
    let graph = stack.context().build()?;

    // Resolve every provider up front so a missing binding aborts before any
    // remote call.
    let node_providers: Vec<Option<Arc<dyn ResourceProvider>>> = graph
        .nodes
        .iter()
        .map(|n| match n.kind {
            NodeKind::Custom => providers.for_type(&n.ty).map(Some),
            NodeKind::Component => Ok(None),
        })
        .collect::<Result<_>>()?;

    let _guard = backend.lock(&stack_id)?;
    let mut state = backend.load(&stack_id)?.unwrap_or_else(|| new_state(&stack_id));

    let run_id = journal::generate_run_id();
    let _ = journal::append_event(
        backend.root(),
        &stack_id,
        RunEvent::ApplyStarted {
            stack: stack_id.clone(),
            run_id: run_id.clone(),
            version: env!("CARGO_PKG_VERSION").to_string(),
        },
    );
    info!(stack = %stack_id, nodes = graph.nodes.len(), "apply started");

    let n = graph.nodes.len();
    let mut statuses: Vec<Option<NodeStatus>> = vec![None; n];
    let mut errors: Vec<Option<String>> = vec![None; n];
    let semaphore = Arc::new(Semaphore::new(opts.concurrency.max(1)));
    let mut remaining: Vec<usize> = graph.order.iter().map(|id| id.0).collect();

    while !remaining.is_empty() {
        if opts.cancel.is_cancelled() {
            for &i in &remaining {
                statuses[i] = Some(NodeStatus::Skipped);
                reject_outputs(&graph.nodes[i], "apply cancelled");
            }
            warn!(stack = %stack_id, skipped = remaining.len(), "apply cancelled between waves");
            break;
        }

        // Cascade blocks from already-failed dependencies.
        let mut progressed = true;
        while progressed {
            progressed = false;
            let mut still = Vec::with_capacity(remaining.len());
            for &i in &remaining {
                let blocked = graph.deps[i]
                    .iter()
                    .any(|d| matches!(statuses[d.0], Some(s) if !s.succeeded()));
                if blocked {
                    statuses[i] = Some(NodeStatus::Blocked);
                    errors[i] = Some("blocked by failed dependency".to_string());
                    reject_outputs(&graph.nodes[i], "blocked by failed dependency");
                    let _ = journal::append_event(
                        backend.root(),
                        &stack_id,
                        RunEvent::NodeFinished {
                            stack: stack_id.clone(),
                            urn: graph.nodes[i].urn.clone(),
                            status: NodeStatus::Blocked.to_string(),
                            duration_seconds: 0.0,
                        },
                    );
                    progressed = true;
                } else {
                    still.push(i);
                }
            }
            remaining = still;
        }

        let wave: Vec<usize> = remaining
            .iter()
            .copied()
            .filter(|&i| {
                graph.deps[i]
                    .iter()
                    .all(|d| statuses[d.0].is_some_and(NodeStatus::succeeded))
            })
            .collect();
        if wave.is_empty() {
            break;
        }
        remaining.retain(|i| !wave.contains(i));

        let mut join = JoinSet::new();
        for i in wave {
            let node = graph.nodes[i].clone();
            let provider = node_providers[i].clone();
            let prior = state.resources.get(&node.urn).cloned();
            let dep_urns: Vec<String> = graph.deps[i]
                .iter()
                .map(|d| graph.nodes[d.0].urn.clone())
                .collect();
            let semaphore = Arc::clone(&semaphore);
            let op_timeout = opts.op_timeout;
            let _ = journal::append_event(
                backend.root(),
                &stack_id,
                RunEvent::NodeStarted {
                    stack: stack_id.clone(),
                    urn: node.urn.clone(),
                    action: "apply".to_string(),
                },
            );
            join.spawn(async move {
                let _permit = semaphore.acquire_owned().await.ok();
                let outcome = apply_node(&node, provider, prior, dep_urns, op_timeout).await;
                (i, outcome)
            });
        }

        while let Some(joined) = join.join_next().await {
            let (i, outcome) =
                joined.map_err(|e| Error::State(format!("apply task panicked: {}", e)))?;
            let urn = graph.nodes[i].urn.clone();
            statuses[i] = Some(outcome.status);
            if let Some(entry) = outcome.entry {
                state.resources.insert(urn.clone(), entry);
            }
            match outcome.error {
                Some(err) => {
                    errors[i] = Some(err.to_string());
                    let _ = journal::append_event(
                        backend.root(),
                        &stack_id,
                        RunEvent::NodeFailed {
                            stack: stack_id.clone(),
                            urn,
                            error: err.to_string(),
                        },
                    );
                }
                None => {
                    let _ = journal::append_event(
                        backend.root(),
                        &stack_id,
                        RunEvent::NodeFinished {
                            stack: stack_id.clone(),
                            urn,
                            status: outcome.status.to_string(),
                            duration_seconds: outcome.duration,
                        },
                    );
                }
            }
        }

        // Persist progress after every wave so cancellation and crashes leave
        // a well-defined partially-applied state behind.
        state.generated_at = journal::now_iso8601();
        backend.save(&state)?;
    }

    let mut reports: Vec<NodeReport> = graph
        .order
        .iter()
        .map(|id| NodeReport {
            urn: graph.nodes[id.0].urn.clone(),
            status: statuses[id.0].unwrap_or(NodeStatus::Skipped),
            error: errors[id.0].clone(),
        })
        .collect();

    if !opts.cancel.is_cancelled() {
        delete_orphans(&graph_urns(&graph.nodes), &mut state, providers, opts, &mut reports).await;
    }

    // Snapshot exports, carrying forward values that did not resolve this run.
    let mut outputs = IndexMap::new();
    for (name, cell) in stack.exports() {
        match cell.try_get() {
            Some(Ok(value)) => {
                outputs.insert(
                    name.clone(),
                    OutputSnapshot {
                        value,
                        secret: cell.is_secret(),
                    },
                );
            }
            _ => {
                if let Some(previous) = state.outputs.get(name) {
                    outputs.insert(name.clone(), previous.clone());
                } else {
                    warn!(stack = %stack_id, output = %name, "export did not resolve");
                }
            }
        }
    }
    state.outputs = outputs;
    if !opts.cancel.is_cancelled() {
        state.last_apply = Some(journal::now_iso8601());
    }
    state.generated_at = journal::now_iso8601();
    backend.save(&state)?;

    let failed = reports.iter().any(|r| r.status == NodeStatus::Failed);
    let changed = reports
        .iter()
        .filter(|r| {
            matches!(
                r.status,
                NodeStatus::Created | NodeStatus::Updated | NodeStatus::Replaced | NodeStatus::Deleted
            )
        })
        .count() as u32;
    let _ = journal::append_event(
        backend.root(),
        &stack_id,
        RunEvent::ApplyCompleted {
            stack: stack_id.clone(),
            run_id: run_id.clone(),
            changed,
            unchanged: reports
                .iter()
                .filter(|r| r.status == NodeStatus::Unchanged)
                .count() as u32,
            failed: reports.iter().filter(|r| r.status == NodeStatus::Failed).count() as u32,
            blocked: reports.iter().filter(|r| r.status == NodeStatus::Blocked).count() as u32,
            total_seconds: started.elapsed().as_secs_f64(),
        },
    );
    info!(stack = %stack_id, failed, "apply finished");

    Ok(ApplyReport {
        stack: stack_id,
        run_id,
        nodes: reports,
        failed,
        duration: started.elapsed(),
    })
}

fn graph_urns(nodes: &[NodeExec]) -> HashSet<String> {
    nodes.iter().map(|n| n.urn.clone()).collect()
}

async fn delete_orphans(
    declared: &HashSet<String>,
    state: &mut crate::core::state::StackState,
    providers: &ProviderRegistry,
    opts: &ApplyOptions,
    reports: &mut Vec<NodeReport>,
) {
    let orphans: Vec<String> = state
        .resources
        .keys()
        .rev()
        .filter(|urn| !declared.contains(*urn))
        .cloned()
        .collect();

    for urn in orphans {
        let Some(entry) = state.resources.get(&urn).cloned() else {
            continue;
        };
        if entry.component {
            state.resources.shift_remove(&urn);
            reports.push(NodeReport {
                urn,
                status: NodeStatus::Deleted,
                error: None,
            });
            continue;
        }
        if entry.protect {
            let err = Error::Protected {
                urn: urn.clone(),
                action: "delete".to_string(),
            };
            reports.push(NodeReport {
                urn,
                status: NodeStatus::Failed,
                error: Some(err.to_string()),
            });
            continue;
        }
        let result = match providers.for_type(&entry.ty) {
            Ok(provider) => {
                with_timeout(&urn, opts.op_timeout, provider.delete(&entry.ty, &entry.id)).await
            }
            Err(e) => Err(e),
        };
        match result {
            Ok(()) => {
                state.resources.shift_remove(&urn);
                reports.push(NodeReport {
                    urn,
                    status: NodeStatus::Deleted,
                    error: None,
                });
            }
            Err(e) => reports.push(NodeReport {
                urn,
                status: NodeStatus::Failed,
                error: Some(e.to_string()),
            }),
        }
    }
}

async fn apply_node(
    node: &NodeExec,
    provider: Option<Arc<dyn ResourceProvider>>,
    prior: Option<ResourceState>,
    dep_urns: Vec<String>,
    op_timeout: Duration,
) -> NodeOutcome {
    let started = Instant::now();

    if node.kind == NodeKind::Component {
        let status = if prior.is_some() {
            NodeStatus::Unchanged
        } else {
            NodeStatus::Created
        };
        let entry = ResourceState {
            ty: node.ty.clone(),
            component: true,
            id: String::new(),
            inputs_hash: hasher::fingerprint(&node.ty, &PropertyMap::new()),
            inputs: Value::Object(serde_json::Map::new()),
            outputs: Value::Object(serde_json::Map::new()),
            protect: node.protect,
            dependencies: dep_urns,
            applied_at: Some(journal::now_iso8601()),
            duration_seconds: Some(started.elapsed().as_secs_f64()),
        };
        return NodeOutcome {
            status,
            entry: Some(entry),
            error: None,
            duration: started.elapsed().as_secs_f64(),
        };
    }

    let Some(provider) = provider else {
        let err = Error::UnknownProvider(node.ty.clone());
        reject_outputs(node, &err.to_string());
        return NodeOutcome {
            status: NodeStatus::Failed,
            entry: None,
            error: Some(err),
            duration: started.elapsed().as_secs_f64(),
        };
    };

    // A node's operation cannot start until every input cell is resolved.
    let mut inputs = PropertyMap::new();
    for (name, cell) in &node.inputs {
        match cell.wait().await {
            Ok(value) => {
                inputs.insert(name.clone(), value);
            }
            Err(e) => {
                let err = Error::Provider {
                    provider: provider.name().to_string(),
                    urn: node.urn.clone(),
                    message: format!("input '{}' rejected: {}", name, e),
                };
                reject_outputs(node, &err.to_string());
                return NodeOutcome {
                    status: NodeStatus::Failed,
                    entry: None,
                    error: Some(err),
                    duration: started.elapsed().as_secs_f64(),
                };
            }
        }
    }

    let fp = hasher::fingerprint(&node.ty, &inputs);

    if let Some(p) = &prior {
        if p.inputs_hash == fp && !p.id.is_empty() {
            planner::replay_outputs(&node.outputs, &p.outputs, &p.id);
            let mut entry = p.clone();
            entry.protect = node.protect;
            entry.dependencies = dep_urns;
            return NodeOutcome {
                status: NodeStatus::Unchanged,
                entry: Some(entry),
                error: None,
                duration: started.elapsed().as_secs_f64(),
            };
        }
    }

    let result = match &prior {
        None => with_timeout(
            &node.urn,
            op_timeout,
            provider.create(&node.ty, &node.name, &inputs),
        )
        .await
        .map(|created| (NodeStatus::Created, created.id, created.outputs)),
        Some(p) => {
            let changed = planner::changed_keys(&p.inputs, &inputs);
            if planner::replace_required(provider.create_only(&node.ty), &changed) {
                if node.protect || p.protect {
                    Err(Error::Protected {
                        urn: node.urn.clone(),
                        action: "replace".to_string(),
                    })
                } else {
                    let delete_first = node.delete_before_replace.unwrap_or(matches!(
                        provider.replace_strategy(&node.ty),
                        ReplaceStrategy::DeleteBeforeCreate
                    ));
                    replace_node(node, provider.as_ref(), p, &inputs, delete_first, op_timeout)
                        .await
                        .map(|(id, outputs)| (NodeStatus::Replaced, id, outputs))
                }
            } else {
                with_timeout(
                    &node.urn,
                    op_timeout,
                    provider.update(&node.ty, &p.id, &inputs),
                )
                .await
                .map(|outputs| (NodeStatus::Updated, p.id.clone(), outputs))
            }
        }
    };

    match result {
        Ok((status, id, mut outputs)) => {
            outputs
                .entry("id".to_string())
                .or_insert_with(|| Value::String(id.clone()));
            let stored = Value::Object(outputs.clone());
            planner::replay_outputs(&node.outputs, &stored, &id);
            let entry = ResourceState {
                ty: node.ty.clone(),
                component: false,
                id,
                inputs_hash: fp,
                inputs: Value::Object(inputs),
                outputs: stored,
                protect: node.protect,
                dependencies: dep_urns,
                applied_at: Some(journal::now_iso8601()),
                duration_seconds: Some(started.elapsed().as_secs_f64()),
            };
            NodeOutcome {
                status,
                entry: Some(entry),
                error: None,
                duration: started.elapsed().as_secs_f64(),
            }
        }
        Err(err) => {
            reject_outputs(node, &err.to_string());
            NodeOutcome {
                status: NodeStatus::Failed,
                entry: None,
                error: Some(err),
                duration: started.elapsed().as_secs_f64(),
            }
        }
    }
}

async fn replace_node(
    node: &NodeExec,
    provider: &dyn ResourceProvider,
    old: &ResourceState,
    inputs: &PropertyMap,
    delete_first: bool,
    op_timeout: Duration,
) -> Result<(String, PropertyMap)> {
    if delete_first {
        with_timeout(&node.urn, op_timeout, provider.delete(&node.ty, &old.id)).await?;
        let created = with_timeout(
            &node.urn,
            op_timeout,
            provider.create(&node.ty, &node.name, inputs),
        )
        .await?;
        Ok((created.id, created.outputs))
    } else {
        let created = with_timeout(
            &node.urn,
            op_timeout,
            provider.create(&node.ty, &node.name, inputs),
        )
        .await?;
        with_timeout(&node.urn, op_timeout, provider.delete(&node.ty, &old.id)).await?;
        Ok((created.id, created.outputs))
    }
}

async fn with_timeout<T>(
    urn: &str,
    limit: Duration,
    fut: impl std::future::Future<Output = Result<T>>,
) -> Result<T> {
    match tokio::time::timeout(limit, fut).await {
        Ok(result) => result,
        Err(_) => Err(Error::Timeout {
            urn: urn.to_string(),
            seconds: limit.as_secs(),
        }),
    }
}

fn reject_outputs(node: &NodeExec, message: &str) {
    for (_, cell) in &node.outputs {
        cell.settle(Err(CellError::new(message)));
    }
}

/// Tear down a stack from its persisted state, in reverse creation order.
///
/// Protected entries refuse deletion; entries that a surviving node still
/// depends on are blocked rather than deleted out from under it.
pub async fn destroy(
    stack_id: &str,
    providers: &ProviderRegistry,
    backend: &StateBackend,
    opts: &ApplyOptions,
) -> Result<ApplyReport> {
    let started = Instant::now();
    let _guard = backend.lock(stack_id)?;
    let run_id = journal::generate_run_id();

    let Some(mut state) = backend.load(stack_id)? else {
        return Ok(ApplyReport {
            stack: stack_id.to_string(),
            run_id,
            nodes: Vec::new(),
            failed: false,
            duration: started.elapsed(),
        });
    };

    let _ = journal::append_event(
        backend.root(),
        stack_id,
        RunEvent::DestroyStarted {
            stack: stack_id.to_string(),
            run_id: run_id.clone(),
        },
    );
    info!(stack = %stack_id, resources = state.resources.len(), "destroy started");

    let entries: Vec<(String, ResourceState)> = state
        .resources
        .iter()
        .rev()
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect();

    let mut reports = Vec::new();
    // URNs that surviving entries still depend on; grows as survivors appear.
    let mut needed: HashSet<String> = HashSet::new();

    for (urn, entry) in entries {
        if entry.protect {
            let err = Error::Protected {
                urn: urn.clone(),
                action: "delete".to_string(),
            };
            needed.extend(entry.dependencies.iter().cloned());
            reports.push(NodeReport {
                urn,
                status: NodeStatus::Failed,
                error: Some(err.to_string()),
            });
            continue;
        }
        if needed.contains(&urn) {
            needed.extend(entry.dependencies.iter().cloned());
            reports.push(NodeReport {
                urn,
                status: NodeStatus::Blocked,
                error: Some("still required by an undeleted resource".to_string()),
            });
            continue;
        }
        if entry.component {
            state.resources.shift_remove(&urn);
            reports.push(NodeReport {
                urn,
                status: NodeStatus::Deleted,
                error: None,
            });
            continue;
        }
        let result = match providers.for_type(&entry.ty) {
            Ok(provider) => {
                with_timeout(&urn, opts.op_timeout, provider.delete(&entry.ty, &entry.id)).await
            }
            Err(e) => Err(e),
        };
        match result {
            Ok(()) => {
                state.resources.shift_remove(&urn);
                let _ = journal::append_event(
                    backend.root(),
                    stack_id,
                    RunEvent::NodeFinished {
                        stack: stack_id.to_string(),
                        urn: urn.clone(),
                        status: NodeStatus::Deleted.to_string(),
                        duration_seconds: 0.0,
                    },
                );
                reports.push(NodeReport {
                    urn,
                    status: NodeStatus::Deleted,
                    error: None,
                });
            }
            Err(e) => {
                needed.extend(entry.dependencies.iter().cloned());
                let _ = journal::append_event(
                    backend.root(),
                    stack_id,
                    RunEvent::NodeFailed {
                        stack: stack_id.to_string(),
                        urn: urn.clone(),
                        error: e.to_string(),
                    },
                );
                reports.push(NodeReport {
                    urn,
                    status: NodeStatus::Failed,
                    error: Some(e.to_string()),
                });
            }
        }
    }

    if state.resources.is_empty() {
        state.outputs.clear();
    }
    state.generated_at = journal::now_iso8601();
    backend.save(&state)?;

    let failed = reports.iter().any(|r| r.status == NodeStatus::Failed);
    let _ = journal::append_event(
        backend.root(),
        stack_id,
        RunEvent::DestroyCompleted {
            stack: stack_id.to_string(),
            run_id: run_id.clone(),
            deleted: reports.iter().filter(|r| r.status == NodeStatus::Deleted).count() as u32,
            failed: reports.iter().filter(|r| r.status == NodeStatus::Failed).count() as u32,
            total_seconds: started.elapsed().as_secs_f64(),
        },
    );
    info!(stack = %stack_id, failed, "destroy finished");

    Ok(ApplyReport {
        stack: stack_id.to_string(),
        run_id,
        nodes: reports,
        failed,
        duration: started.elapsed(),
    })
}
