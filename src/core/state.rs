//! Persisted stack state — load, save (atomic), single-writer lock.
//!
//! One YAML document per stack under `<state_dir>/<stack-id>/state.yaml`:
//! node entries in creation order (the order destroy reverses), exported
//! output snapshots, and the last-apply timestamp. The stack state is a
//! single-writer resource; a lock file serializes concurrent applies of the
//! same stack while applies of different stacks proceed independently.

use std::path::{Path, PathBuf};

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::core::journal::now_iso8601;
use crate::error::{Error, Result};

/// Per-stack persisted state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StackState {
    /// Schema version
    pub schema: String,

    /// Stack identity, `<name>-<env>`
    pub stack: String,

    /// When this document was written
    pub generated_at: String,

    /// Generator version
    pub generator: String,

    /// Timestamp of the last completed apply, if any
    #[serde(default)]
    pub last_apply: Option<String>,

    /// Per-node state keyed by URN, in creation order
    #[serde(default)]
    pub resources: IndexMap<String, ResourceState>,

    /// Exported output snapshots
    #[serde(default)]
    pub outputs: IndexMap<String, OutputSnapshot>,
}

/// Persisted record of one applied node.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourceState {
    /// Resource type token
    #[serde(rename = "type")]
    pub ty: String,

    /// True for component (grouping-only) nodes
    #[serde(default)]
    pub component: bool,

    /// Provider-assigned identifier (empty for components)
    #[serde(default)]
    pub id: String,

    /// BLAKE3 fingerprint of the applied inputs
    pub inputs_hash: String,

    /// The applied inputs, kept for change-key diffing
    #[serde(default)]
    pub inputs: serde_json::Value,

    /// Provider-reported outputs from the last apply
    #[serde(default)]
    pub outputs: serde_json::Value,

    /// Refuse destroy/replace while set
    #[serde(default)]
    pub protect: bool,

    /// URNs this node depended on at apply time
    #[serde(default)]
    pub dependencies: Vec<String>,

    #[serde(default)]
    pub applied_at: Option<String>,

    #[serde(default)]
    pub duration_seconds: Option<f64>,
}

/// Snapshot of one exported output.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutputSnapshot {
    pub value: serde_json::Value,
    #[serde(default)]
    pub secret: bool,
}

/// Create a fresh, never-applied state document.
pub fn new_state(stack_id: &str) -> StackState {
    StackState {
        schema: "1.0".to_string(),
        stack: stack_id.to_string(),
        generated_at: now_iso8601(),
        generator: format!("stratus {}", env!("CARGO_PKG_VERSION")),
        last_apply: None,
        resources: IndexMap::new(),
        outputs: IndexMap::new(),
    }
}

/// Filesystem state backend.
pub struct StateBackend {
    root: PathBuf,
}

impl StateBackend {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn state_path(&self, stack_id: &str) -> PathBuf {
        self.root.join(stack_id).join("state.yaml")
    }

    fn lock_path(&self, stack_id: &str) -> PathBuf {
        self.root.join(stack_id).join(".lock")
    }

    /// Load a stack's state. `None` if it has never been saved.
    pub fn load(&self, stack_id: &str) -> Result<Option<StackState>> {
        let path = self.state_path(stack_id);
        if !path.exists() {
            return Ok(None);
        }
        let content = std::fs::read_to_string(&path)?;
        let state: StackState = serde_yaml_ng::from_str(&content)
            .map_err(|e| Error::State(format!("invalid state file {}: {}", path.display(), e)))?;
        Ok(Some(state))
    }

    /// Save atomically: write to a temp file, then rename over the target.
    pub fn save(&self, state: &StackState) -> Result<()> {
        let path = self.state_path(&state.stack);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let yaml = serde_yaml_ng::to_string(state)?;
        let tmp_path = path.with_extension("yaml.tmp");
        std::fs::write(&tmp_path, &yaml)?;
        std::fs::rename(&tmp_path, &path)?;
        debug!(stack = %state.stack, resources = state.resources.len(), "state saved");
        Ok(())
    }

    /// Take the single-writer lock for a stack. Fails with `StackLocked` when
    /// another apply holds it.
    pub fn lock(&self, stack_id: &str) -> Result<StateLockGuard> {
        let path = self.lock_path(stack_id);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        match std::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)
        {
            Ok(mut file) => {
                use std::io::Write;
                let _ = writeln!(file, "{}", std::process::id());
                Ok(StateLockGuard { path })
            }
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                Err(Error::StackLocked(stack_id.to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }
}

/// Held for the duration of an apply/destroy; releases the lock on drop.
pub struct StateLockGuard {
    path: PathBuf,
}

impl Drop for StateLockGuard {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn make_state() -> StackState {
        let mut state = new_state("network-dev");
        state.resources.insert(
            "urn:network-dev::aws:ec2:Vpc::net/vpc".to_string(),
            ResourceState {
                ty: "aws:ec2:Vpc".to_string(),
                component: false,
                id: "vpc-0a1b".to_string(),
                inputs_hash: "blake3:abc".to_string(),
                inputs: json!({"cidrBlock": "10.0.0.0/16"}),
                outputs: json!({"id": "vpc-0a1b"}),
                protect: false,
                dependencies: vec![],
                applied_at: Some("2026-02-16T14:00:00Z".to_string()),
                duration_seconds: Some(0.2),
            },
        );
        state.outputs.insert(
            "vpcId".to_string(),
            OutputSnapshot {
                value: json!("vpc-0a1b"),
                secret: false,
            },
        );
        state
    }

    #[test]
    fn test_save_and_load_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let backend = StateBackend::new(dir.path());
        backend.save(&make_state()).unwrap();

        let loaded = backend.load("network-dev").unwrap().unwrap();
        assert_eq!(loaded.stack, "network-dev");
        assert_eq!(loaded.resources.len(), 1);
        assert_eq!(loaded.outputs["vpcId"].value, json!("vpc-0a1b"));
    }

    #[test]
    fn test_load_missing_returns_none() {
        let dir = tempfile::tempdir().unwrap();
        let backend = StateBackend::new(dir.path());
        assert!(backend.load("ghost-dev").unwrap().is_none());
    }

    #[test]
    fn test_atomic_write_leaves_no_temp_file() {
        let dir = tempfile::tempdir().unwrap();
        let backend = StateBackend::new(dir.path());
        backend.save(&make_state()).unwrap();

        let tmp = dir.path().join("network-dev").join("state.yaml.tmp");
        assert!(!tmp.exists());
        assert!(backend.state_path("network-dev").exists());
    }

    #[test]
    fn test_round_trip_preserves_resource_order() {
        let dir = tempfile::tempdir().unwrap();
        let backend = StateBackend::new(dir.path());
        let mut state = make_state();
        state.resources.insert(
            "urn:network-dev::aws:ec2:Subnet::net/public-0".to_string(),
            ResourceState {
                ty: "aws:ec2:Subnet".to_string(),
                component: false,
                id: "subnet-1".to_string(),
                inputs_hash: "blake3:def".to_string(),
                inputs: json!({}),
                outputs: json!({}),
                protect: false,
                dependencies: vec!["urn:network-dev::aws:ec2:Vpc::net/vpc".to_string()],
                applied_at: None,
                duration_seconds: None,
            },
        );
        backend.save(&state).unwrap();

        let loaded = backend.load("network-dev").unwrap().unwrap();
        let keys: Vec<_> = loaded.resources.keys().cloned().collect();
        assert!(keys[0].ends_with("net/vpc"));
        assert!(keys[1].ends_with("net/public-0"));
    }

    #[test]
    fn test_lock_is_exclusive_per_stack() {
        let dir = tempfile::tempdir().unwrap();
        let backend = StateBackend::new(dir.path());

        let guard = backend.lock("network-dev").unwrap();
        assert!(matches!(
            backend.lock("network-dev"),
            Err(Error::StackLocked(_))
        ));
        // A different stack locks independently.
        let _other = backend.lock("edge-dev").unwrap();

        drop(guard);
        backend.lock("network-dev").unwrap();
    }

    #[test]
    fn test_new_state_has_no_apply_record() {
        let state = new_state("cluster-prod");
        assert!(state.last_apply.is_none());
        assert!(state.resources.is_empty());
        assert!(state.generated_at.contains('T'));
    }
}
