//! Stacks — independently applied, environment-scoped units of declared
//! infrastructure with named exported outputs.

use std::fmt;
use std::str::FromStr;

use indexmap::IndexMap;

use crate::core::graph::Context;
use crate::core::value::Input;
use crate::error::{Error, Result};

/// Deployment environment. `dev`/`test` default cheap, `prod` defaults HA and
/// protected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Environment {
    Dev,
    Test,
    Prod,
}

impl Environment {
    pub fn is_prod(self) -> bool {
        self == Self::Prod
    }
}

impl fmt::Display for Environment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Dev => write!(f, "dev"),
            Self::Test => write!(f, "test"),
            Self::Prod => write!(f, "prod"),
        }
    }
}

impl FromStr for Environment {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "dev" => Ok(Self::Dev),
            "test" => Ok(Self::Test),
            "prod" => Ok(Self::Prod),
            other => Err(Error::Config(format!(
                "env must be one of dev, test, prod; got '{}'",
                other
            ))),
        }
    }
}

/// Split `<stack>-<env>` into its parts, e.g. `network-dev`.
pub fn parse_stack_id(stack_id: &str) -> Result<(String, Environment)> {
    let (name, env) = stack_id.split_once('-').ok_or_else(|| {
        Error::Config(format!(
            "stack must be named <component>-<env>, got '{}'",
            stack_id
        ))
    })?;
    Ok((name.to_string(), env.parse()?))
}

/// A named, environment-scoped unit of declared infrastructure.
#[derive(Debug)]
pub struct Stack {
    name: String,
    environment: Environment,
    ctx: Context,
    exports: IndexMap<String, Input>,
}

impl Stack {
    pub fn new(name: impl Into<String>, environment: Environment) -> Self {
        let name = name.into();
        let ctx = Context::new(format!("{}-{}", name, environment));
        Self {
            name,
            environment,
            ctx,
            exports: IndexMap::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn environment(&self) -> Environment {
        self.environment
    }

    /// Stack identity as used by the state backend and cross-stack refs.
    pub fn id(&self) -> String {
        format!("{}-{}", self.name, self.environment)
    }

    pub fn context(&self) -> &Context {
        &self.ctx
    }

    /// Export a named output; snapshotted into state after a successful apply.
    pub fn export(&mut self, name: impl Into<String>, cell: Input) {
        self.exports.insert(name.into(), cell);
    }

    pub fn exports(&self) -> &IndexMap<String, Input> {
        &self.exports
    }
}
