//! Simulated cloud provider — deterministic ids, synthesized attributes, an
//! inspectable call log, and optional JSON persistence.
//!
//! Stands in for a real cloud SDK in tests and local runs. Ids derive from
//! the logical name plus the input fingerprint, so a retried create is a
//! dedup hit while a replacement mints a fresh id that can coexist with the
//! old object.

use std::path::PathBuf;
use std::sync::Mutex;

use async_trait::async_trait;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::debug;

use crate::error::{Error, Result};
use crate::hasher;
use crate::provider::{CreatedResource, PropertyMap, ReplaceStrategy, ResourceProvider};

#[derive(Debug, Clone, Serialize, Deserialize)]
struct SimResource {
    ty: String,
    name: String,
    inputs: PropertyMap,
    outputs: PropertyMap,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct SimState {
    resources: IndexMap<String, SimResource>,
}

pub struct SimCloud {
    name: String,
    state: Mutex<SimState>,
    calls: Mutex<Vec<String>>,
    persist: Option<PathBuf>,
}

impl SimCloud {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            state: Mutex::new(SimState::default()),
            calls: Mutex::new(Vec::new()),
            persist: None,
        }
    }

    /// Load/store the simulated resource table from a JSON file so CLI runs
    /// survive process restarts.
    pub fn with_persistence(name: impl Into<String>, path: PathBuf) -> Result<Self> {
        let state = if path.exists() {
            let text = std::fs::read_to_string(&path)?;
            serde_json::from_str(&text)
                .map_err(|e| Error::State(format!("invalid provider state {}: {}", path.display(), e)))?
        } else {
            SimState::default()
        };
        Ok(Self {
            name: name.into(),
            state: Mutex::new(state),
            calls: Mutex::new(Vec::new()),
            persist: Some(path),
        })
    }

    fn persist(&self, state: &SimState) -> Result<()> {
        if let Some(path) = &self.persist {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            std::fs::write(path, serde_json::to_string_pretty(state)?)?;
        }
        Ok(())
    }

    fn log(&self, line: String) {
        debug!(provider = %self.name, "{}", line);
        self.calls.lock().expect("call log poisoned").push(line);
    }

    /// Number of remote calls made so far.
    pub fn call_count(&self) -> usize {
        self.calls.lock().expect("call log poisoned").len()
    }

    /// The remote calls made so far, oldest first.
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().expect("call log poisoned").clone()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.state
            .lock()
            .expect("sim state poisoned")
            .resources
            .contains_key(id)
    }

    pub fn resource_count(&self) -> usize {
        self.state.lock().expect("sim state poisoned").resources.len()
    }

    fn id_for(ty: &str, name: &str, inputs: &PropertyMap) -> String {
        let prefix = ty
            .rsplit(':')
            .next()
            .unwrap_or("res")
            .to_ascii_lowercase();
        let digest = hasher::fingerprint(ty, inputs);
        let tail = digest.trim_start_matches("blake3:");
        format!("{}-{}{}", prefix, &hasher::hash_string(name)[7..11], &tail[..8])
    }

    fn synthesize(ty: &str, name: &str, id: &str, inputs: &PropertyMap) -> PropertyMap {
        let mut outputs = inputs.clone();
        outputs.insert("id".to_string(), json!(id));

        let family = ty.rsplit(':').next().unwrap_or("");
        let service = ty.split(':').nth(1).unwrap_or("sim");
        let physical = outputs
            .get("name")
            .and_then(Value::as_str)
            .map(str::to_string)
            .unwrap_or_else(|| format!("{}-{}", name, &id[id.len().saturating_sub(6)..]));

        outputs
            .entry("arn".to_string())
            .or_insert_with(|| json!(format!("arn:sim:{}:::{}", service, id)));

        match family {
            "Bucket" => {
                outputs.insert("bucket".to_string(), json!(physical.clone()));
                outputs.insert(
                    "bucketDomainName".to_string(),
                    json!(format!("{}.s3.sim.example", physical)),
                );
                outputs.insert(
                    "bucketRegionalDomainName".to_string(),
                    json!(format!("{}.s3.region.sim.example", physical)),
                );
            }
            "Distribution" => {
                outputs.insert(
                    "domainName".to_string(),
                    json!(format!("{}.cdn.sim.example", id)),
                );
            }
            "Table" => {
                outputs.insert("name".to_string(), json!(physical));
            }
            "Cluster" => {
                outputs.insert(
                    "endpoint".to_string(),
                    json!(format!("https://{}.cluster.sim.example", id)),
                );
                outputs.insert(
                    "certificateAuthority".to_string(),
                    json!(hasher::hash_string(id).trim_start_matches("blake3:")),
                );
                outputs.insert(
                    "oidcIssuer".to_string(),
                    json!(format!("https://oidc.sim.example/{}", id)),
                );
            }
            "Repository" => {
                outputs.insert(
                    "repositoryUrl".to_string(),
                    json!(format!("registry.sim.example/{}", physical)),
                );
            }
            _ => {}
        }
        outputs
    }
}

#[async_trait]
impl ResourceProvider for SimCloud {
    fn name(&self) -> &str {
        &self.name
    }

    async fn create(&self, ty: &str, name: &str, inputs: &PropertyMap) -> Result<CreatedResource> {
        self.log(format!("create {} {}", ty, name));
        let id = Self::id_for(ty, name, inputs);

        let mut state = self.state.lock().expect("sim state poisoned");
        if let Some(existing) = state.resources.get(&id) {
            // Retried create with the same dedup key: return the prior result.
            return Ok(CreatedResource {
                id,
                outputs: existing.outputs.clone(),
            });
        }

        let outputs = Self::synthesize(ty, name, &id, inputs);
        state.resources.insert(
            id.clone(),
            SimResource {
                ty: ty.to_string(),
                name: name.to_string(),
                inputs: inputs.clone(),
                outputs: outputs.clone(),
            },
        );
        self.persist(&state)?;
        Ok(CreatedResource { id, outputs })
    }

    async fn read(&self, _ty: &str, id: &str) -> Result<Option<PropertyMap>> {
        self.log(format!("read {}", id));
        let state = self.state.lock().expect("sim state poisoned");
        Ok(state.resources.get(id).map(|r| r.outputs.clone()))
    }

    async fn update(&self, ty: &str, id: &str, inputs: &PropertyMap) -> Result<PropertyMap> {
        self.log(format!("update {} {}", ty, id));
        let mut state = self.state.lock().expect("sim state poisoned");
        let resource = state.resources.get_mut(id).ok_or_else(|| Error::Provider {
            provider: self.name.clone(),
            urn: id.to_string(),
            message: "update of unknown resource".to_string(),
        })?;
        let name = resource.name.clone();
        resource.inputs = inputs.clone();
        resource.outputs = Self::synthesize(ty, &name, id, inputs);
        let outputs = resource.outputs.clone();
        self.persist(&state)?;
        Ok(outputs)
    }

    async fn delete(&self, _ty: &str, id: &str) -> Result<()> {
        self.log(format!("delete {}", id));
        let mut state = self.state.lock().expect("sim state poisoned");
        state.resources.shift_remove(id);
        self.persist(&state)?;
        Ok(())
    }

    fn create_only(&self, ty: &str) -> &[&str] {
        match ty {
            "aws:ec2:Vpc" => &["cidrBlock"],
            "aws:ec2:Subnet" => &["cidrBlock", "availabilityZone", "vpcId"],
            "aws:dynamodb:Table" => &["name", "hashKey", "rangeKey"],
            "aws:eks:Cluster" => &["name", "roleArn"],
            "aws:ssm:Parameter" => &["name"],
            "aws:ecr:Repository" => &["name"],
            _ => &[],
        }
    }

    fn replace_strategy(&self, ty: &str) -> ReplaceStrategy {
        // Types whose physical name is fixed cannot exist twice.
        match ty {
            "aws:ssm:Parameter" | "aws:dynamodb:Table" | "aws:ecr:Repository" => {
                ReplaceStrategy::DeleteBeforeCreate
            }
            _ => ReplaceStrategy::CreateBeforeDelete,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn inputs(pairs: &[(&str, Value)]) -> PropertyMap {
        let mut map = PropertyMap::new();
        for (k, v) in pairs {
            map.insert(k.to_string(), v.clone());
        }
        map
    }

    #[tokio::test]
    async fn test_create_is_deterministic_and_idempotent() {
        let cloud = SimCloud::new("aws");
        let ins = inputs(&[("cidrBlock", json!("10.0.0.0/16"))]);

        let first = cloud.create("aws:ec2:Vpc", "vpc", &ins).await.unwrap();
        let second = cloud.create("aws:ec2:Vpc", "vpc", &ins).await.unwrap();
        assert_eq!(first.id, second.id);
        assert_eq!(cloud.resource_count(), 1);
        assert!(first.id.starts_with("vpc-"));
    }

    #[tokio::test]
    async fn test_changed_inputs_mint_a_new_id() {
        let cloud = SimCloud::new("aws");
        let a = cloud
            .create("aws:ec2:Vpc", "vpc", &inputs(&[("cidrBlock", json!("10.0.0.0/16"))]))
            .await
            .unwrap();
        let b = cloud
            .create("aws:ec2:Vpc", "vpc", &inputs(&[("cidrBlock", json!("10.1.0.0/16"))]))
            .await
            .unwrap();
        assert_ne!(a.id, b.id);
        // Both coexist, as create-before-delete replacement requires.
        assert!(cloud.contains(&a.id));
        assert!(cloud.contains(&b.id));
    }

    #[tokio::test]
    async fn test_outputs_echo_inputs_plus_synthesized() {
        let cloud = SimCloud::new("aws");
        let created = cloud
            .create(
                "aws:cloudfront:Distribution",
                "cdn",
                &inputs(&[("enabled", json!(true))]),
            )
            .await
            .unwrap();
        assert_eq!(created.outputs["enabled"], json!(true));
        assert!(created.outputs["domainName"]
            .as_str()
            .unwrap()
            .ends_with(".cdn.sim.example"));
    }

    #[tokio::test]
    async fn test_update_and_delete() {
        let cloud = SimCloud::new("aws");
        let created = cloud
            .create("aws:s3:Bucket", "assets", &inputs(&[("forceDestroy", json!(true))]))
            .await
            .unwrap();

        let updated = cloud
            .update(
                "aws:s3:Bucket",
                &created.id,
                &inputs(&[("forceDestroy", json!(false))]),
            )
            .await
            .unwrap();
        assert_eq!(updated["forceDestroy"], json!(false));

        cloud.delete("aws:s3:Bucket", &created.id).await.unwrap();
        assert!(!cloud.contains(&created.id));
        assert_eq!(
            cloud.read("aws:s3:Bucket", &created.id).await.unwrap(),
            None
        );
    }

    #[tokio::test]
    async fn test_update_unknown_resource_fails() {
        let cloud = SimCloud::new("aws");
        let err = cloud
            .update("aws:s3:Bucket", "bucket-missing", &PropertyMap::new())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Provider { .. }));
    }

    #[tokio::test]
    async fn test_call_log_records_operations() {
        let cloud = SimCloud::new("aws");
        let created = cloud
            .create("aws:ec2:Vpc", "vpc", &PropertyMap::new())
            .await
            .unwrap();
        cloud.delete("aws:ec2:Vpc", &created.id).await.unwrap();

        let calls = cloud.calls();
        assert_eq!(calls.len(), 2);
        assert!(calls[0].starts_with("create aws:ec2:Vpc"));
        assert!(calls[1].starts_with("delete vpc-"));
    }

    #[tokio::test]
    async fn test_persistence_survives_reload() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("aws.json");

        let created = {
            let cloud = SimCloud::with_persistence("aws", path.clone()).unwrap();
            cloud
                .create("aws:ec2:Vpc", "vpc", &PropertyMap::new())
                .await
                .unwrap()
        };

        let reloaded = SimCloud::with_persistence("aws", path).unwrap();
        assert!(reloaded.contains(&created.id));
    }

    #[test]
    fn test_replace_strategy_per_type() {
        let cloud = SimCloud::new("aws");
        assert_eq!(
            cloud.replace_strategy("aws:ssm:Parameter"),
            ReplaceStrategy::DeleteBeforeCreate
        );
        assert_eq!(
            cloud.replace_strategy("aws:ec2:Vpc"),
            ReplaceStrategy::CreateBeforeDelete
        );
        assert!(cloud.create_only("aws:ec2:Vpc").contains(&"cidrBlock"));
    }
}
