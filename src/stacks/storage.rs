//! Storage stack: the conversation table plus a config parameter telling the
//! chat application which table to use.
//!
//! Non-production conversations expire via TTL; production keeps them and
//! enables point-in-time recovery and protection instead.

use indexmap::IndexMap;

use crate::core::config::StackConfig;
use crate::core::graph::ResourceOptions;
use crate::core::stack::{Environment, Stack};
use crate::core::value::literal;
use crate::error::Result;
use crate::resources::input_map;
use crate::resources::storage::{ConversationTable, ConversationTableArgs};

pub fn build(env: Environment, cfg: &StackConfig) -> Result<Stack> {
    let mut stack = Stack::new("storage", env);
    let protect = env.is_prod();

    let mut tags = IndexMap::new();
    tags.insert("app".to_string(), "chatbot".to_string());
    tags.insert("env".to_string(), env.to_string());

    let table = ConversationTable::new(
        stack.context(),
        "conversations",
        ConversationTableArgs {
            env_label: env.to_string(),
            enable_ttl: cfg.bool_or("enableTtl", !env.is_prod()),
            ttl_days: cfg.usize_or("ttlDays", 30) as u32,
            enable_pitr: cfg.bool_or("enablePitr", env.is_prod()),
            tags,
        },
        ResourceOptions {
            protect,
            ..Default::default()
        },
    )?;

    let param = stack.context().declare(
        "aws:ssm:Parameter",
        "table-name",
        input_map([
            (
                "name",
                literal(format!("/chatbot/{}/dynamodb_table_name", env)),
            ),
            ("type", literal("String")),
            ("value", table.table_name.clone()),
        ]),
        ResourceOptions {
            protect,
            depends_on: vec![table.node()],
            ..Default::default()
        },
    )?;

    stack.export("table_name", table.table_name.clone());
    stack.export("table_arn", table.table_arn.clone());
    stack.export("table_id", table.table_id.clone());
    stack.export("table_name_param", param.output("name"));
    Ok(stack)
}
