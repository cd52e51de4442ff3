//! Error types for graph construction, reference resolution and apply runs.

use thiserror::Error;

/// Coarse classification used for propagation policy and retry decisions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Invalid graph: aborts before any remote call.
    Construction,
    /// Unresolvable cross-stack input: aborts before apply.
    Resolution,
    /// Remote call failed: the node fails, dependents are blocked.
    Provider,
    /// Remote call timed out: propagates like a provider failure but is
    /// distinctly tagged for retry policy.
    Timeout,
    /// Protected node refused a destroy/replace: fatal for that node only.
    Protection,
    /// Everything else (state backend, config, serialization).
    Internal,
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("duplicate resource: '{ty}' named '{name}' already declared under {parent}")]
    DuplicateIdentity {
        ty: String,
        name: String,
        parent: String,
    },

    #[error("invalid resource name '{0}': must start with a letter and contain only letters, digits, '.', '_' or '-'")]
    InvalidName(String),

    #[error("dependency cycle: {}", chain.join(" -> "))]
    DependencyCycle { chain: Vec<String> },

    #[error("component '{component}' cannot expose '{output}': value does not originate in its subtree")]
    ForeignOutput { component: String, output: String },

    #[error("component '{component}' exposes no output named '{output}'")]
    MissingComponentOutput { component: String, output: String },

    #[error("stack '{0}' has never been applied")]
    StackNeverApplied(String),

    #[error("stack '{stack}' exports no output named '{output}'")]
    MissingStackOutput { stack: String, output: String },

    #[error("provider '{provider}' failed on {urn}: {message}")]
    Provider {
        provider: String,
        urn: String,
        message: String,
    },

    #[error("operation on {urn} timed out after {seconds}s")]
    Timeout { urn: String, seconds: u64 },

    #[error("{urn} is protected; refusing to {action}")]
    Protected { urn: String, action: String },

    #[error("no provider registered for '{0}'")]
    UnknownProvider(String),

    #[error("stack '{0}' is locked by another apply")]
    StackLocked(String),

    #[error("state backend: {0}")]
    State(String),

    #[error("config: {0}")]
    Config(String),

    #[error("apply completed with {0} failed node(s)")]
    ApplyFailed(usize),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("yaml: {0}")]
    Yaml(#[from] serde_yaml_ng::Error),

    #[error("json: {0}")]
    Json(#[from] serde_json::Error),
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::DuplicateIdentity { .. }
            | Self::InvalidName(_)
            | Self::DependencyCycle { .. }
            | Self::ForeignOutput { .. }
            | Self::MissingComponentOutput { .. } => ErrorKind::Construction,
            Self::StackNeverApplied(_) | Self::MissingStackOutput { .. } => ErrorKind::Resolution,
            Self::Provider { .. } | Self::UnknownProvider(_) | Self::ApplyFailed(_) => {
                ErrorKind::Provider
            }
            Self::Timeout { .. } => ErrorKind::Timeout,
            Self::Protected { .. } => ErrorKind::Protection,
            Self::StackLocked(_)
            | Self::State(_)
            | Self::Config(_)
            | Self::Io(_)
            | Self::Yaml(_)
            | Self::Json(_) => ErrorKind::Internal,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cycle_message_renders_chain() {
        let e = Error::DependencyCycle {
            chain: vec!["a".into(), "b".into(), "a".into()],
        };
        assert_eq!(e.to_string(), "dependency cycle: a -> b -> a");
        assert_eq!(e.kind(), ErrorKind::Construction);
    }

    #[test]
    fn test_kind_classification() {
        assert_eq!(
            Error::StackNeverApplied("net-dev".into()).kind(),
            ErrorKind::Resolution
        );
        assert_eq!(
            Error::Timeout {
                urn: "urn:x".into(),
                seconds: 30
            }
            .kind(),
            ErrorKind::Timeout
        );
        assert_eq!(
            Error::Protected {
                urn: "urn:x".into(),
                action: "delete".into()
            }
            .kind(),
            ErrorKind::Protection
        );
        assert_eq!(
            Error::Provider {
                provider: "aws".into(),
                urn: "urn:x".into(),
                message: "boom".into()
            }
            .kind(),
            ErrorKind::Provider
        );
    }

    #[test]
    fn test_protected_message() {
        let e = Error::Protected {
            urn: "urn:edge-prod::cdn::aws:s3:Bucket::assets".into(),
            action: "replace".into(),
        };
        assert!(e.to_string().contains("refusing to replace"));
    }
}
