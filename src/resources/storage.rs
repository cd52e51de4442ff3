//! Conversation table component — the chat application's session store.
//!
//! Partition key `session_id`, sort key `message_index`, plus a
//! `user_id`/`created_at` global secondary index for listing a user's
//! sessions newest-first. TTL is optional (non-production stacks expire old
//! conversations), point-in-time recovery is optional (production enables
//! it), server-side encryption is always on.

use indexmap::IndexMap;
use serde_json::json;

use crate::core::component::{Component, ComponentOutputs};
use crate::core::graph::{Context, NodeId, ResourceOptions};
use crate::core::value::{literal, Input};
use crate::error::Result;
use crate::resources::{input_map, tag_value};

pub struct ConversationTableArgs {
    /// Environment label folded into the physical table name.
    pub env_label: String,
    pub enable_ttl: bool,
    pub ttl_days: u32,
    pub enable_pitr: bool,
    pub tags: IndexMap<String, String>,
}

pub struct ConversationTable {
    pub table_name: Input,
    pub table_arn: Input,
    pub table_id: Input,
    outputs: ComponentOutputs,
}

impl ConversationTable {
    pub fn new(
        ctx: &Context,
        name: &str,
        args: ConversationTableArgs,
        opts: ResourceOptions,
    ) -> Result<Self> {
        let mut component = Component::new(ctx, "pkg:storage:ConversationTable", name, opts)?;

        let ttl = if args.enable_ttl {
            json!({"enabled": true, "attributeName": "ttl_timestamp", "days": args.ttl_days})
        } else {
            json!({"enabled": false})
        };

        let table = ctx.declare(
            "aws:dynamodb:Table",
            "table",
            input_map([
                (
                    "name",
                    literal(format!("chatbot-conversations-{}", args.env_label)),
                ),
                // On-demand capacity; no provisioning to size.
                ("billingMode", literal("PAY_PER_REQUEST")),
                ("hashKey", literal("session_id")),
                ("rangeKey", literal("message_index")),
                (
                    "attributes",
                    literal(json!([
                        {"name": "session_id", "type": "S"},
                        {"name": "message_index", "type": "N"},
                        {"name": "user_id", "type": "S"},
                        {"name": "created_at", "type": "S"},
                    ])),
                ),
                (
                    "globalSecondaryIndexes",
                    literal(json!([{
                        "name": "user_id-created_at-index",
                        "hashKey": "user_id",
                        "rangeKey": "created_at",
                        "projectionType": "ALL",
                    }])),
                ),
                ("ttl", literal(ttl)),
                (
                    "pointInTimeRecovery",
                    literal(json!({"enabled": args.enable_pitr})),
                ),
                (
                    "serverSideEncryption",
                    literal(json!({"enabled": true})),
                ),
                (
                    "tags",
                    tag_value(&args.tags, &[("component", "storage")]),
                ),
            ]),
            component.child_opts(),
        )?;

        let table_name = table.output("name");
        let table_arn = table.output("arn");
        let table_id = table.output("id");

        component.expose("tableName", table_name.clone())?;
        component.expose("tableArn", table_arn.clone())?;
        component.expose("tableId", table_id.clone())?;
        let outputs = component.finish();

        Ok(Self {
            table_name,
            table_arn,
            table_id,
            outputs,
        })
    }

    pub fn node(&self) -> NodeId {
        self.outputs.node()
    }

    pub fn outputs(&self) -> &ComponentOutputs {
        &self.outputs
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(enable_ttl: bool, enable_pitr: bool) -> ConversationTableArgs {
        ConversationTableArgs {
            env_label: "dev".to_string(),
            enable_ttl,
            ttl_days: 30,
            enable_pitr,
            tags: IndexMap::new(),
        }
    }

    #[test]
    fn test_table_schema_inputs() {
        let ctx = Context::new("storage-dev");
        ConversationTable::new(&ctx, "conversations", args(true, false), ResourceOptions::default())
            .unwrap();

        let graph = ctx.build().unwrap();
        let table = graph
            .nodes
            .iter()
            .find(|n| n.ty == "aws:dynamodb:Table")
            .unwrap();
        let input = |key: &str| {
            table
                .inputs
                .iter()
                .find(|(k, _)| k == key)
                .unwrap()
                .1
                .try_get()
                .unwrap()
                .unwrap()
        };
        assert_eq!(input("hashKey"), json!("session_id"));
        assert_eq!(input("rangeKey"), json!("message_index"));
        assert_eq!(input("ttl")["enabled"], json!(true));
        assert_eq!(input("pointInTimeRecovery")["enabled"], json!(false));
        assert_eq!(
            input("globalSecondaryIndexes")[0]["name"],
            json!("user_id-created_at-index")
        );
    }

    #[test]
    fn test_ttl_disabled_drops_attribute_config() {
        let ctx = Context::new("storage-prod");
        ConversationTable::new(&ctx, "conversations", args(false, true), ResourceOptions::default())
            .unwrap();
        let graph = ctx.build().unwrap();
        let table = graph
            .nodes
            .iter()
            .find(|n| n.ty == "aws:dynamodb:Table")
            .unwrap();
        let ttl = table
            .inputs
            .iter()
            .find(|(k, _)| k == "ttl")
            .unwrap()
            .1
            .try_get()
            .unwrap()
            .unwrap();
        assert_eq!(ttl, json!({"enabled": false}));
    }

    #[test]
    fn test_contract_is_name_arn_id() {
        let ctx = Context::new("storage-dev");
        let table =
            ConversationTable::new(&ctx, "conversations", args(true, false), ResourceOptions::default())
                .unwrap();
        let names: Vec<&str> = table.outputs().names().collect();
        assert_eq!(names, vec!["tableName", "tableArn", "tableId"]);
    }
}
