//! Resource provider capability — create/read/update/delete of typed remote
//! objects, consumed by the scheduler as an opaque capability.

pub mod sim;

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;

use crate::error::{Error, Result};

/// Resolved resource inputs/outputs. `serde_json::Map` keeps keys sorted, so
/// serializing one is already canonical for fingerprinting.
pub type PropertyMap = serde_json::Map<String, serde_json::Value>;

/// How a forced replacement is sequenced for a resource type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplaceStrategy {
    /// Create the replacement first, then delete the old object. Requires the
    /// provider to tolerate a transient duplicate identity.
    CreateBeforeDelete,
    /// Delete the old object before creating the replacement, for types with
    /// fixed physical names.
    DeleteBeforeCreate,
}

/// Result of a create call.
#[derive(Debug, Clone)]
pub struct CreatedResource {
    pub id: String,
    pub outputs: PropertyMap,
}

/// A remote provider of typed resources.
///
/// Calls must be idempotent when retried with the same logical operation; the
/// dedup key is the node's name plus its input fingerprint.
#[async_trait]
pub trait ResourceProvider: Send + Sync {
    /// Provider token, matched against the `<provider>:` prefix of type
    /// tokens such as `aws:ec2:Vpc`.
    fn name(&self) -> &str;

    async fn create(&self, ty: &str, name: &str, inputs: &PropertyMap) -> Result<CreatedResource>;

    async fn read(&self, ty: &str, id: &str) -> Result<Option<PropertyMap>>;

    async fn update(&self, ty: &str, id: &str, inputs: &PropertyMap) -> Result<PropertyMap>;

    async fn delete(&self, ty: &str, id: &str) -> Result<()>;

    /// Properties that cannot change in place; a changed value forces
    /// replacement.
    fn create_only(&self, _ty: &str) -> &[&str] {
        &[]
    }

    /// Required per-type replacement sequencing. Deliberately without a
    /// default: every provider must state its choice per resource type.
    fn replace_strategy(&self, ty: &str) -> ReplaceStrategy;
}

/// Extract the provider token from a type token (`aws:ec2:Vpc` → `aws`).
pub fn provider_token(ty: &str) -> &str {
    ty.split(':').next().unwrap_or(ty)
}

/// Maps provider tokens to provider instances.
#[derive(Default, Clone)]
pub struct ProviderRegistry {
    providers: HashMap<String, Arc<dyn ResourceProvider>>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, provider: Arc<dyn ResourceProvider>) {
        self.providers
            .insert(provider.name().to_string(), provider);
    }

    pub fn get(&self, token: &str) -> Result<Arc<dyn ResourceProvider>> {
        self.providers
            .get(token)
            .cloned()
            .ok_or_else(|| Error::UnknownProvider(token.to_string()))
    }

    /// Provider responsible for a type token.
    pub fn for_type(&self, ty: &str) -> Result<Arc<dyn ResourceProvider>> {
        self.get(provider_token(ty))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_provider_token() {
        assert_eq!(provider_token("aws:ec2:Vpc"), "aws");
        assert_eq!(provider_token("pkg:network:Network"), "pkg");
        assert_eq!(provider_token("bare"), "bare");
    }

    #[test]
    fn test_registry_lookup() {
        let mut registry = ProviderRegistry::new();
        registry.register(Arc::new(sim::SimCloud::new("aws")));
        assert!(registry.for_type("aws:ec2:Vpc").is_ok());
        assert!(matches!(
            registry.for_type("gcp:compute:Instance"),
            Err(Error::UnknownProvider(_))
        ));
    }
}
