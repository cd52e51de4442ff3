//! CLI subcommands — preview, apply, destroy, output, state.
//!
//! Stacks are addressed as `<name>-<env>` (e.g. `network-dev`). Exit status
//! is zero only when every node succeeded; failures print a structured
//! per-node error list.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use clap::Subcommand;

use crate::core::config::{ConfigMap, StackConfig};
use crate::core::executor::{self, ApplyOptions, ApplyReport, NodeStatus};
use crate::core::planner;
use crate::core::stack::{parse_stack_id, Stack};
use crate::core::state::{StateBackend, StackState};
use crate::error::{Error, Result};
use crate::provider::sim::SimCloud;
use crate::provider::ProviderRegistry;
use crate::stacks;

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Show planned operations without executing them
    Preview {
        /// Stack to plan, as <name>-<env>
        #[arg(short, long)]
        stack: String,

        /// State directory
        #[arg(long, default_value = "state")]
        state_dir: PathBuf,

        /// Per-stack config directory
        #[arg(long, default_value = "config")]
        config_dir: PathBuf,
    },

    /// Apply a stack's declared resources
    Apply {
        /// Stack to apply, as <name>-<env>
        #[arg(short, long)]
        stack: String,

        /// State directory
        #[arg(long, default_value = "state")]
        state_dir: PathBuf,

        /// Per-stack config directory
        #[arg(long, default_value = "config")]
        config_dir: PathBuf,

        /// Max concurrent provider operations
        #[arg(long, default_value_t = 8)]
        concurrency: usize,

        /// Per-operation timeout in seconds
        #[arg(long, default_value_t = 60)]
        timeout_secs: u64,
    },

    /// Tear a stack down in reverse dependency order
    Destroy {
        /// Stack to destroy, as <name>-<env>
        #[arg(short, long)]
        stack: String,

        /// State directory
        #[arg(long, default_value = "state")]
        state_dir: PathBuf,

        /// Per-operation timeout in seconds
        #[arg(long, default_value_t = 60)]
        timeout_secs: u64,
    },

    /// Print a stack's exported outputs (secrets stay masked)
    Output {
        /// Stack to read, as <name>-<env>
        #[arg(short, long)]
        stack: String,

        /// A single output name; all outputs when omitted
        name: Option<String>,

        /// State directory
        #[arg(long, default_value = "state")]
        state_dir: PathBuf,
    },

    /// Show per-resource state for a stack
    State {
        /// Stack to inspect, as <name>-<env>
        #[arg(short, long)]
        stack: String,

        /// State directory
        #[arg(long, default_value = "state")]
        state_dir: PathBuf,
    },
}

/// Dispatch a CLI command.
pub fn dispatch(cmd: Commands) -> Result<()> {
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;

    match cmd {
        Commands::Preview {
            stack,
            state_dir,
            config_dir,
        } => cmd_preview(&stack, &state_dir, &config_dir),
        Commands::Apply {
            stack,
            state_dir,
            config_dir,
            concurrency,
            timeout_secs,
        } => runtime.block_on(cmd_apply(
            &stack,
            &state_dir,
            &config_dir,
            concurrency,
            timeout_secs,
        )),
        Commands::Destroy {
            stack,
            state_dir,
            timeout_secs,
        } => runtime.block_on(cmd_destroy(&stack, &state_dir, timeout_secs)),
        Commands::Output {
            stack,
            name,
            state_dir,
        } => cmd_output(&stack, name.as_deref(), &state_dir),
        Commands::State { stack, state_dir } => cmd_state(&stack, &state_dir),
    }
}

fn providers_for(state_dir: &Path) -> Result<ProviderRegistry> {
    let mut registry = ProviderRegistry::new();
    registry.register(Arc::new(SimCloud::with_persistence(
        "aws",
        state_dir.join("providers").join("aws.json"),
    )?));
    Ok(registry)
}

fn build_stack(stack_id: &str, state_dir: &Path, config_dir: &Path) -> Result<(Stack, StateBackend)> {
    let (name, env) = parse_stack_id(stack_id)?;
    let backend = StateBackend::new(state_dir);
    let overrides = ConfigMap::load(&config_dir.join(format!("{}.yaml", stack_id)))?;
    let cfg = StackConfig::resolve(env, overrides);
    let stack = stacks::build(&name, env, &cfg, &backend)?;
    Ok((stack, backend))
}

fn cmd_preview(stack_id: &str, state_dir: &Path, config_dir: &Path) -> Result<()> {
    let (stack, backend) = build_stack(stack_id, state_dir, config_dir)?;
    let providers = providers_for(state_dir)?;
    let graph = stack.context().build()?;
    let state = backend.load(stack_id)?;
    let plan = planner::plan(&graph, state.as_ref(), &providers)?;

    println!("Plan for {}:", stack_id);
    for change in &plan.changes {
        println!("  {:8} {}  ({})", change.action.to_string(), change.urn, change.detail);
    }
    println!(
        "\n{} to create, {} to update, {} to replace, {} to delete, {} unchanged",
        plan.to_create, plan.to_update, plan.to_replace, plan.to_delete, plan.unchanged
    );
    Ok(())
}

async fn cmd_apply(
    stack_id: &str,
    state_dir: &Path,
    config_dir: &Path,
    concurrency: usize,
    timeout_secs: u64,
) -> Result<()> {
    let (stack, backend) = build_stack(stack_id, state_dir, config_dir)?;
    let providers = providers_for(state_dir)?;
    let opts = ApplyOptions {
        concurrency,
        op_timeout: Duration::from_secs(timeout_secs),
        ..Default::default()
    };

    let report = executor::apply(&stack, &providers, &backend, &opts).await?;
    print_report(&report);

    if let Some(state) = backend.load(stack_id)? {
        if !state.outputs.is_empty() {
            println!("\nOutputs:");
            for (name, snapshot) in &state.outputs {
                println!("  {} = {}", name, render_output(&snapshot.value, snapshot.secret));
            }
        }
    }

    finish(report)
}

async fn cmd_destroy(stack_id: &str, state_dir: &Path, timeout_secs: u64) -> Result<()> {
    parse_stack_id(stack_id)?;
    let backend = StateBackend::new(state_dir);
    let providers = providers_for(state_dir)?;
    let opts = ApplyOptions {
        op_timeout: Duration::from_secs(timeout_secs),
        ..Default::default()
    };

    let report = executor::destroy(stack_id, &providers, &backend, &opts).await?;
    print_report(&report);
    finish(report)
}

fn cmd_output(stack_id: &str, name: Option<&str>, state_dir: &Path) -> Result<()> {
    let backend = StateBackend::new(state_dir);
    let state = load_applied(&backend, stack_id)?;

    match name {
        Some(name) => {
            let snapshot = state
                .outputs
                .get(name)
                .ok_or_else(|| Error::MissingStackOutput {
                    stack: stack_id.to_string(),
                    output: name.to_string(),
                })?;
            println!("{}", render_output(&snapshot.value, snapshot.secret));
        }
        None => {
            for (name, snapshot) in &state.outputs {
                println!("{} = {}", name, render_output(&snapshot.value, snapshot.secret));
            }
        }
    }
    Ok(())
}

fn cmd_state(stack_id: &str, state_dir: &Path) -> Result<()> {
    let backend = StateBackend::new(state_dir);
    let state = load_applied(&backend, stack_id)?;

    println!(
        "Stack {} — last apply {}",
        state.stack,
        state.last_apply.as_deref().unwrap_or("never")
    );
    for (urn, entry) in &state.resources {
        let id = if entry.component { "<component>" } else { entry.id.as_str() };
        let protect = if entry.protect { " [protected]" } else { "" };
        println!("  {}  {}{}", urn, id, protect);
    }
    Ok(())
}

fn load_applied(backend: &StateBackend, stack_id: &str) -> Result<StackState> {
    backend
        .load(stack_id)?
        .ok_or_else(|| Error::StackNeverApplied(stack_id.to_string()))
}

fn print_report(report: &ApplyReport) {
    for node in &report.nodes {
        match &node.error {
            Some(error) => println!("  {:9} {}  ({})", node.status.to_string(), node.urn, error),
            None => println!("  {:9} {}", node.status.to_string(), node.urn),
        }
    }
    println!(
        "\n{} changed, {} unchanged, {} failed, {} blocked in {:.1}s",
        report.count(NodeStatus::Created)
            + report.count(NodeStatus::Updated)
            + report.count(NodeStatus::Replaced)
            + report.count(NodeStatus::Deleted),
        report.count(NodeStatus::Unchanged),
        report.count(NodeStatus::Failed),
        report.count(NodeStatus::Blocked),
        report.duration.as_secs_f64()
    );
}

fn finish(report: ApplyReport) -> Result<()> {
    if report.failed {
        Err(Error::ApplyFailed(report.count(NodeStatus::Failed)))
    } else {
        Ok(())
    }
}

/// Secrets are never rendered verbatim.
fn render_output(value: &serde_json::Value, secret: bool) -> String {
    if secret {
        "[secret]".to_string()
    } else {
        value.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_render_output_masks_secrets() {
        assert_eq!(render_output(&json!("kubeconfig-data"), true), "[secret]");
        assert_eq!(render_output(&json!("vpc-123"), false), "\"vpc-123\"");
    }

    #[tokio::test]
    async fn test_apply_then_output_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let state_dir = dir.path().join("state");
        let config_dir = dir.path().join("config");

        cmd_apply("storage-dev", &state_dir, &config_dir, 4, 30)
            .await
            .unwrap();
        cmd_output("storage-dev", Some("table_name"), &state_dir).unwrap();
        cmd_state("storage-dev", &state_dir).unwrap();

        // A second apply through the persisted provider is a no-op.
        cmd_apply("storage-dev", &state_dir, &config_dir, 4, 30)
            .await
            .unwrap();
    }

    #[test]
    fn test_preview_fresh_stack() {
        let dir = tempfile::tempdir().unwrap();
        cmd_preview(
            "registry-dev",
            &dir.path().join("state"),
            &dir.path().join("config"),
        )
        .unwrap();
    }

    #[test]
    fn test_output_of_unapplied_stack_fails() {
        let dir = tempfile::tempdir().unwrap();
        let err = cmd_output("network-dev", None, &dir.path().join("state")).unwrap_err();
        assert!(matches!(err, Error::StackNeverApplied(_)));
    }

    #[test]
    fn test_config_overrides_reach_the_graph() {
        let dir = tempfile::tempdir().unwrap();
        let config_dir = dir.path().join("config");
        std::fs::create_dir_all(&config_dir).unwrap();
        std::fs::write(config_dir.join("network-dev.yaml"), "azCount: 1\n").unwrap();

        let (stack, _) = build_stack("network-dev", &dir.path().join("state"), &config_dir).unwrap();
        let graph = stack.context().build().unwrap();
        let subnets = graph
            .nodes
            .iter()
            .filter(|n| n.ty == "aws:ec2:Subnet")
            .count();
        assert_eq!(subnets, 2, "one AZ yields one public + one private subnet");
    }
}
