//! Edge components: a private-bucket CDN for static assets and a rate-limit
//! web ACL in front of it.
//!
//! The CDN keeps both buckets private (ownership controls + public access
//! blocks), syncs a local folder keyed by its content hash, and lets only the
//! distribution read objects via a bucket policy scoped to its ARN. Only the
//! curated outputs escape the component; the buckets themselves do not.

use std::path::Path;

use indexmap::IndexMap;
use serde_json::json;

use crate::core::component::{Component, ComponentOutputs};
use crate::core::graph::{Context, NodeId, ResourceOptions};
use crate::core::value::{literal, Cell, Input};
use crate::error::Result;
use crate::hasher;
use crate::resources::{input_map, tag_value};

pub struct CdnFirewallArgs {
    /// Per-IP request ceiling within the evaluation window.
    pub rate_limit: u64,
    /// Window length in seconds (60/120/300/600).
    pub evaluation_window_sec: u64,
    /// Restrict rate limiting to one path prefix, e.g. "/api".
    pub scope_down_path_prefix: Option<String>,
}

impl Default for CdnFirewallArgs {
    fn default() -> Self {
        Self {
            rate_limit: 300,
            evaluation_window_sec: 300,
            scope_down_path_prefix: None,
        }
    }
}

pub struct CdnFirewall {
    pub web_acl_arn: Input,
    outputs: ComponentOutputs,
}

impl CdnFirewall {
    pub fn new(
        ctx: &Context,
        name: &str,
        args: CdnFirewallArgs,
        opts: ResourceOptions,
    ) -> Result<Self> {
        let mut component = Component::new(ctx, "pkg:edge:CdnFirewall", name, opts)?;

        let mut rate_statement = json!({
            "limit": args.rate_limit,
            "aggregateKeyType": "IP",
            "evaluationWindowSec": args.evaluation_window_sec,
        });
        if let Some(prefix) = &args.scope_down_path_prefix {
            rate_statement["scopeDownStatement"] = json!({
                "byteMatchStatement": {
                    "fieldToMatch": {"uriPath": {}},
                    "positionalConstraint": "STARTS_WITH",
                    "searchString": prefix,
                },
            });
        }

        let web_acl = ctx.declare(
            "aws:wafv2:WebAcl",
            "web-acl",
            input_map([
                ("scope", literal("CLOUDFRONT")),
                ("defaultAction", literal(json!({"allow": {}}))),
                (
                    "rules",
                    literal(json!([{
                        "name": "rate-limit-per-ip",
                        "priority": 1,
                        "action": {"block": {}},
                        "statement": {"rateBasedStatement": rate_statement},
                    }])),
                ),
            ]),
            component.child_opts(),
        )?;

        let web_acl_arn = web_acl.output("arn");
        component.expose("webAclArn", web_acl_arn.clone())?;
        let outputs = component.finish();

        Ok(Self {
            web_acl_arn,
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

pub struct StaticSiteCdnArgs {
    /// Local folder whose contents are synced into the assets bucket.
    pub folder_path: String,
    pub web_acl_arn: Option<Input>,
    pub default_root_object: Option<String>,
    pub force_destroy: bool,
    pub tags: IndexMap<String, String>,
}

impl Default for StaticSiteCdnArgs {
    fn default() -> Self {
        Self {
            folder_path: "app/static".to_string(),
            web_acl_arn: None,
            default_root_object: None,
            force_destroy: true,
            tags: IndexMap::new(),
        }
    }
}

pub struct StaticSiteCdn {
    pub base_url: Input,
    pub bucket_name: Input,
    pub distribution_id: Input,
    outputs: ComponentOutputs,
}

impl StaticSiteCdn {
    pub fn new(
        ctx: &Context,
        name: &str,
        args: StaticSiteCdnArgs,
        opts: ResourceOptions,
    ) -> Result<Self> {
        let mut component = Component::new(ctx, "pkg:edge:StaticSiteCdn", name, opts)?;
        let tags = tag_value(&args.tags, &[]);
        let origin_id = format!("{}-s3-origin", name);

        let bucket = ctx.declare(
            "aws:s3:Bucket",
            "bucket",
            input_map([
                ("forceDestroy", literal(args.force_destroy)),
                ("tags", tags.clone()),
            ]),
            component.child_opts(),
        )?;
        let log_bucket = ctx.declare(
            "aws:s3:Bucket",
            "cf-logs",
            input_map([("forceDestroy", literal(true)), ("tags", tags.clone())]),
            component.child_opts(),
        )?;

        let mut guards = Vec::new();
        for (bucket_label, target) in [("bucket", &bucket), ("cf-logs", &log_bucket)] {
            let ownership = ctx.declare(
                "aws:s3:BucketOwnershipControls",
                &format!("{}-ownership", bucket_label),
                input_map([
                    ("bucket", target.output("id")),
                    (
                        "rule",
                        literal(json!({"objectOwnership": "BucketOwnerPreferred"})),
                    ),
                ]),
                component.child_opts(),
            )?;
            let access_block = ctx.declare(
                "aws:s3:BucketPublicAccessBlock",
                &format!("{}-public-access-block", bucket_label),
                input_map([
                    ("bucket", target.output("id")),
                    ("blockPublicAcls", literal(true)),
                    ("ignorePublicAcls", literal(true)),
                    ("blockPublicPolicy", literal(true)),
                    ("restrictPublicBuckets", literal(true)),
                ]),
                component.child_opts(),
            )?;
            if bucket_label == "bucket" {
                guards.push(ownership.id());
                guards.push(access_block.id());
            }
        }

        // Re-sync whenever the folder content changes.
        let content_hash = folder_content_hash(&args.folder_path);
        let mut sync_opts = component.child_opts();
        sync_opts.depends_on = guards;
        ctx.declare(
            "aws:s3:BucketFolder",
            "sync",
            input_map([
                ("bucketName", bucket.output("bucket")),
                ("path", literal(args.folder_path.clone())),
                ("contentHash", literal(content_hash)),
                ("acl", literal("private")),
            ]),
            sync_opts,
        )?;

        let oac = ctx.declare(
            "aws:cloudfront:OriginAccessControl",
            "oac",
            input_map([
                ("name", literal(format!("{}-oac", name))),
                ("originAccessControlOriginType", literal("s3")),
                ("signingBehavior", literal("always")),
                ("signingProtocol", literal("sigv4")),
            ]),
            component.child_opts(),
        )?;

        let cache_policy = ctx.declare(
            "aws:cloudfront:CachePolicy",
            "cache-policy",
            input_map([
                ("name", literal(format!("{}-static-cache", name))),
                ("defaultTtl", literal(86_400)),
                ("maxTtl", literal(31_536_000)),
                ("minTtl", literal(0)),
                (
                    "parametersInCacheKeyAndForwardedToOrigin",
                    literal(json!({
                        "cookiesConfig": {"cookieBehavior": "none"},
                        "headersConfig": {"headerBehavior": "none"},
                        "queryStringsConfig": {"queryStringBehavior": "none"},
                        "enableAcceptEncodingBrotli": true,
                        "enableAcceptEncodingGzip": true,
                    })),
                ),
            ]),
            component.child_opts(),
        )?;

        let origins = Cell::combine(&[
            bucket.output("bucketRegionalDomainName"),
            oac.output("id"),
        ])
        .map({
            let origin_id = origin_id.clone();
            move |parts| {
                json!([{
                    "domainName": parts.first().cloned().unwrap_or_default(),
                    "originId": origin_id,
                    "originAccessControlId": parts.get(1).cloned().unwrap_or_default(),
                }])
            }
        });

        let mut distribution_inputs = input_map([
            ("enabled", literal(true)),
            ("origins", origins),
            (
                "defaultCacheBehavior",
                cache_policy.output("id").map({
                    let origin_id = origin_id.clone();
                    move |policy_id| {
                        json!({
                            "targetOriginId": origin_id,
                            "viewerProtocolPolicy": "redirect-to-https",
                            "allowedMethods": ["GET", "HEAD", "OPTIONS"],
                            "cachedMethods": ["GET", "HEAD"],
                            "compress": true,
                            "cachePolicyId": policy_id,
                        })
                    }
                }),
            ),
            (
                "restrictions",
                literal(json!({"geoRestriction": {"restrictionType": "none"}})),
            ),
            (
                "viewerCertificate",
                literal(json!({"cloudfrontDefaultCertificate": true})),
            ),
            (
                "loggingConfig",
                log_bucket.output("bucketDomainName").map({
                    let prefix = format!("{}/", name);
                    move |domain| {
                        json!({
                            "bucket": domain,
                            "includeCookies": false,
                            "prefix": prefix,
                        })
                    }
                }),
            ),
            ("tags", tags.clone()),
        ]);
        if let Some(root) = &args.default_root_object {
            distribution_inputs.insert("defaultRootObject".to_string(), literal(root.clone()));
        }
        if let Some(web_acl) = &args.web_acl_arn {
            distribution_inputs.insert("webAclId".to_string(), web_acl.clone());
        }
        let distribution = ctx.declare(
            "aws:cloudfront:Distribution",
            "cdn",
            distribution_inputs,
            component.child_opts(),
        )?;

        // Only the distribution may read the origin bucket.
        let policy = Cell::combine(&[bucket.output("arn"), distribution.output("arn")]).map(
            |arns| {
                let bucket_arn = arns
                    .first()
                    .and_then(|v| v.as_str())
                    .unwrap_or_default()
                    .to_string();
                let dist_arn = arns.get(1).and_then(|v| v.as_str()).unwrap_or_default();
                let doc = json!({
                    "version": "2012-10-17",
                    "statement": [{
                        "sid": "AllowDistributionRead",
                        "effect": "Allow",
                        "principal": {"service": "cloudfront.amazonaws.com"},
                        "action": "s3:GetObject",
                        "resource": format!("{}/*", bucket_arn),
                        "condition": {"stringEquals": {"aws:SourceArn": dist_arn}},
                    }],
                });
                json!(doc.to_string())
            },
        );
        ctx.declare(
            "aws:s3:BucketPolicy",
            "bucket-policy",
            input_map([("bucket", bucket.output("bucket")), ("policy", policy)]),
            component.child_opts(),
        )?;

        let base_url = distribution
            .output("domainName")
            .map(|domain| json!(format!("https://{}", domain.as_str().unwrap_or_default())));
        let bucket_name = bucket.output("bucket");
        let distribution_id = distribution.output("id");

        component.expose("baseUrl", base_url.clone())?;
        component.expose("bucketName", bucket_name.clone())?;
        component.expose("distributionId", distribution_id.clone())?;
        let outputs = component.finish();

        Ok(Self {
            base_url,
            bucket_name,
            distribution_id,
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

/// Directory hash when the folder exists, else a hash of the path itself so
/// missing assets still fingerprint deterministically.
fn folder_content_hash(folder: &str) -> String {
    let path = Path::new(folder);
    if path.is_dir() {
        hasher::hash_directory(path).unwrap_or_else(|_| hasher::hash_string(folder))
    } else {
        hasher::hash_string(folder)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cdn_exposes_only_curated_outputs() {
        let ctx = Context::new("edge-dev");
        let cdn = StaticSiteCdn::new(
            &ctx,
            "chatbot-assets",
            StaticSiteCdnArgs::default(),
            ResourceOptions::default(),
        )
        .unwrap();

        let names: Vec<&str> = cdn.outputs().names().collect();
        assert_eq!(names, vec!["baseUrl", "bucketName", "distributionId"]);
        // The origin bucket is internal: not reachable through the contract.
        assert!(cdn.outputs().get("bucket").is_none());
        assert!(cdn.outputs().get("cf-logs").is_none());
        assert!(cdn.outputs().require("bucket").is_err());
    }

    #[test]
    fn test_base_url_derives_from_distribution_domain() {
        let ctx = Context::new("edge-dev");
        let cdn = StaticSiteCdn::new(
            &ctx,
            "chatbot-assets",
            StaticSiteCdnArgs::default(),
            ResourceOptions::default(),
        )
        .unwrap();

        let graph = ctx.build().unwrap();
        let dist = graph
            .nodes
            .iter()
            .find(|n| n.ty == "aws:cloudfront:Distribution")
            .unwrap();
        let domain = dist
            .outputs
            .iter()
            .find(|(k, _)| k == "domainName")
            .unwrap()
            .1
            .clone();
        domain.settle(Ok(json!("d111.cdn.sim.example")));
        assert_eq!(
            cdn.base_url.try_get(),
            Some(Ok(json!("https://d111.cdn.sim.example")))
        );
    }

    #[test]
    fn test_sync_waits_for_bucket_guards() {
        let ctx = Context::new("edge-dev");
        StaticSiteCdn::new(
            &ctx,
            "chatbot-assets",
            StaticSiteCdnArgs::default(),
            ResourceOptions::default(),
        )
        .unwrap();

        let graph = ctx.build().unwrap();
        let find = |ty: &str, name: &str| {
            graph
                .nodes
                .iter()
                .find(|n| n.ty == ty && n.name == name)
                .unwrap()
                .id
        };
        let sync = find("aws:s3:BucketFolder", "sync");
        assert!(graph.deps[sync.0].contains(&find("aws:s3:BucketOwnershipControls", "bucket-ownership")));
        assert!(graph.deps[sync.0]
            .contains(&find("aws:s3:BucketPublicAccessBlock", "bucket-public-access-block")));
    }

    #[test]
    fn test_firewall_scope_down_prefix() {
        let ctx = Context::new("edge-dev");
        CdnFirewall::new(
            &ctx,
            "chatbot-cdn",
            CdnFirewallArgs {
                rate_limit: 30,
                evaluation_window_sec: 300,
                scope_down_path_prefix: Some("/api".to_string()),
            },
            ResourceOptions::default(),
        )
        .unwrap();

        let graph = ctx.build().unwrap();
        let acl = graph
            .nodes
            .iter()
            .find(|n| n.ty == "aws:wafv2:WebAcl")
            .unwrap();
        let rules = acl
            .inputs
            .iter()
            .find(|(k, _)| k == "rules")
            .unwrap()
            .1
            .try_get()
            .unwrap()
            .unwrap();
        let statement = &rules[0]["statement"]["rateBasedStatement"];
        assert_eq!(statement["limit"], json!(30));
        assert_eq!(
            statement["scopeDownStatement"]["byteMatchStatement"]["searchString"],
            json!("/api")
        );
    }

    #[test]
    fn test_folder_hash_falls_back_for_missing_dir() {
        let h1 = folder_content_hash("does/not/exist");
        let h2 = folder_content_hash("does/not/exist");
        assert_eq!(h1, h2);
        assert!(h1.starts_with("blake3:"));
    }

    #[test]
    fn test_folder_hash_tracks_content() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("index.html"), "v1").unwrap();
        let p = dir.path().to_string_lossy().to_string();
        let h1 = folder_content_hash(&p);
        std::fs::write(dir.path().join("index.html"), "v2").unwrap();
        let h2 = folder_content_hash(&p);
        assert_ne!(h1, h2);
    }
}
