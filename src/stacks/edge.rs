//! Edge stack: rate-limit firewall + static-assets CDN + a config parameter
//! that hands the public URL to the chat application. Production applies with
//! protection on.

use indexmap::IndexMap;

use crate::core::config::StackConfig;
use crate::core::graph::ResourceOptions;
use crate::core::stack::{Environment, Stack};
use crate::core::value::literal;
use crate::error::Result;
use crate::resources::edge::{CdnFirewall, CdnFirewallArgs, StaticSiteCdn, StaticSiteCdnArgs};
use crate::resources::input_map;

pub fn build(env: Environment, cfg: &StackConfig) -> Result<Stack> {
    let mut stack = Stack::new("edge", env);
    let protect = env.is_prod();
    let protected = || ResourceOptions {
        protect,
        ..Default::default()
    };

    let mut tags = IndexMap::new();
    tags.insert("app".to_string(), "chatbot".to_string());
    tags.insert("env".to_string(), env.to_string());

    let firewall = CdnFirewall::new(
        stack.context(),
        &format!("chatbot-cdn-{}", env),
        CdnFirewallArgs {
            rate_limit: cfg.u64_or("rateLimit", 30),
            evaluation_window_sec: cfg.u64_or("rateWindowSec", 300),
            scope_down_path_prefix: None,
        },
        protected(),
    )?;

    let assets = StaticSiteCdn::new(
        stack.context(),
        &format!("chatbot-assets-{}", env),
        StaticSiteCdnArgs {
            folder_path: cfg.str_or("assetsPath", "app/static"),
            web_acl_arn: Some(firewall.web_acl_arn.clone()),
            tags,
            ..Default::default()
        },
        protected(),
    )?;

    let param = stack.context().declare(
        "aws:ssm:Parameter",
        "cloudfront-url",
        input_map([
            ("name", literal(format!("/chatbot/{}/cloudfront_url", env))),
            ("type", literal("String")),
            ("value", assets.base_url.clone()),
        ]),
        ResourceOptions {
            protect,
            // Conservative but sturdy: wait for the whole CDN subtree.
            depends_on: vec![assets.node()],
            ..Default::default()
        },
    )?;

    stack.export("cloudfront_url_param", param.output("name"));
    stack.export("cloudfront_url", assets.base_url.clone());
    stack.export("distribution_id", assets.distribution_id.clone());
    stack.export("bucket_name", assets.bucket_name.clone());
    stack.export("waf_web_acl_arn", firewall.web_acl_arn.clone());
    Ok(stack)
}
