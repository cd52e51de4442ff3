//! Component nodes — composite resources that own a subgraph of children and
//! present a curated output contract.
//!
//! A component never represents a remote object itself; its apply is ordering
//! only. Construction code declares children with the component as parent,
//! exposes a chosen subset of their outputs, then freezes the contract with
//! `finish()`. Only the frozen mapping escapes, so unexposed children stay
//! unreachable from the outside.

use indexmap::IndexMap;

use crate::core::graph::{Context, NodeId, ResourceOptions};
use crate::core::value::Input;
use crate::error::{Error, Result};

pub struct Component {
    ctx: Context,
    id: NodeId,
    name: String,
    outputs: IndexMap<String, Input>,
}

impl Component {
    pub fn new(ctx: &Context, ty: &str, name: &str, opts: ResourceOptions) -> Result<Self> {
        let id = ctx.declare_component(ty, name, opts)?;
        Ok(Self {
            ctx: ctx.clone(),
            id,
            name: name.to_string(),
            outputs: IndexMap::new(),
        })
    }

    pub fn node(&self) -> NodeId {
        self.id
    }

    pub fn urn(&self) -> String {
        self.ctx.urn(self.id)
    }

    /// Options for declaring a child inside this component.
    pub fn child_opts(&self) -> ResourceOptions {
        ResourceOptions {
            parent: Some(self.id),
            ..Default::default()
        }
    }

    /// Expose one output. The cell must originate inside this component's
    /// subtree (literals are fine); anything else is a construction error.
    pub fn expose(&mut self, name: &str, cell: Input) -> Result<()> {
        let subtree = self.ctx.subtree(self.id);
        for dep in cell.provenance() {
            if !subtree.contains(dep) {
                return Err(Error::ForeignOutput {
                    component: self.name.clone(),
                    output: name.to_string(),
                });
            }
        }
        self.outputs.insert(name.to_string(), cell);
        Ok(())
    }

    /// Freeze the contract. Consuming `self` is what prevents later exposure.
    pub fn finish(self) -> ComponentOutputs {
        ComponentOutputs {
            id: self.id,
            name: self.name,
            outputs: self.outputs,
        }
    }
}

/// The frozen external contract of a component.
#[derive(Clone, Debug)]
pub struct ComponentOutputs {
    id: NodeId,
    name: String,
    outputs: IndexMap<String, Input>,
}

impl ComponentOutputs {
    /// For `depends_on` edges onto the whole component subtree.
    pub fn node(&self) -> NodeId {
        self.id
    }

    pub fn get(&self, name: &str) -> Option<Input> {
        self.outputs.get(name).cloned()
    }

    pub fn require(&self, name: &str) -> Result<Input> {
        self.outputs
            .get(name)
            .cloned()
            .ok_or_else(|| Error::MissingComponentOutput {
                component: self.name.clone(),
                output: name.to_string(),
            })
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.outputs.keys().map(String::as_str)
    }
}
