//! End-to-end reconciliation tests against the in-memory remote.

mod common;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use common::{Harness, desired};
use converge_core::{
    DesiredRule, Error, MemoryRemote, Mutation, Payload, Phase, PolicyTable, RemoteError,
    Removal, RuleTypePolicy, StateMutator, SubResourceKind, TagSemantics, reconcile,
};
use serde_json::{Value, json};

// =============================================================================
// Present
// =============================================================================

#[tokio::test]
async fn test_creates_missing_resource_then_is_idempotent() {
    let h = Harness::new();
    let state = desired(json!({
        "name": "assets",
        "versioning": true,
        "requester_pays": true,
        "policy": { "Version": "2012-10-17", "Statement": [] },
        "tags": { "env": "prod" },
        "website": {},
        "lifecycle_rules": [{ "prefix": "logs/", "expiration_days": 30 }],
        "cors_rules": [{ "allowed_methods": ["get"], "allowed_origins": ["*"] }],
        "routing_rules": [{ "key_prefix": "docs/", "replace_key_prefix_with": "documents/" }]
    }));

    let outcome = h.reconciler.reconcile(&state).await.unwrap();
    assert!(outcome.changed);
    let ops: Vec<_> = outcome.mutations.iter().map(|m| m.mutation.name()).collect();
    assert_eq!(
        ops,
        vec![
            "create_resource",
            "set_versioning",
            "set_requester_pays",
            "put_policy",
            "put_tags",
            "put_website",
            "replace_rules",
            "replace_rules",
            "replace_rules",
        ]
    );

    let fin = &outcome.final_state;
    assert_eq!(fin.exists, Some(true));
    assert_eq!(fin.tags.as_ref().unwrap()["env"], "prod");
    assert_eq!(
        fin.website.as_ref().unwrap().index_suffix.as_deref(),
        Some("index.html")
    );
    let cors = &fin.rules(SubResourceKind::CorsRules).unwrap()[0];
    assert_eq!(cors.payload.get("max_age_seconds"), Some(&json!(3000)));

    let again = h.reconciler.reconcile(&state).await.unwrap();
    assert!(!again.changed);
    assert!(again.mutations.is_empty());
    assert_eq!(h.remote.mutation_count().await, 9);
}

#[tokio::test]
async fn test_full_replace_removes_unlisted_rules() {
    let h = Harness::new();
    h.remote.seed_resource("assets").await;
    h.remote
        .seed(
            "assets",
            SubResourceKind::LifecycleRules,
            json!({ "Rules": [
                { "ID": "a", "Prefix": "logs/", "Status": "Enabled", "Expiration": { "Days": 7 } },
                { "ID": "b", "Prefix": "tmp/", "Status": "Enabled", "Expiration": { "Days": 1 } }
            ]}),
        )
        .await;
    let state = desired(json!({
        "name": "assets",
        "lifecycle_rules": [{ "prefix": "logs/", "expiration_days": 30 }]
    }));

    let outcome = h.reconciler.reconcile(&state).await.unwrap();
    assert_eq!(outcome.mutations.len(), 1);
    assert_eq!(
        h.remote
            .body("assets", SubResourceKind::LifecycleRules)
            .await
            .unwrap(),
        json!({ "Rules": [
            { "ID": "a", "Prefix": "logs/", "Status": "Enabled", "Expiration": { "Days": 30 } }
        ]})
    );
    let rules = outcome
        .final_state
        .rules(SubResourceKind::LifecycleRules)
        .unwrap();
    assert_eq!(rules.len(), 1);
    assert_eq!(rules[0].id.as_deref(), Some("a"));
}

#[tokio::test]
async fn test_ambiguous_match_fails_before_mutating() {
    let h = Harness::new();
    h.remote.seed_resource("assets").await;
    h.remote
        .seed(
            "assets",
            SubResourceKind::LifecycleRules,
            json!({ "Rules": [
                { "Prefix": "logs/", "Status": "Enabled", "Expiration": { "Days": 7 } },
                { "Prefix": "logs/", "Status": "Enabled", "Expiration": { "Days": 9 } }
            ]}),
        )
        .await;
    let state = desired(json!({
        "name": "assets",
        "tags": { "env": "prod" },
        "lifecycle_rules": [{ "prefix": "logs/", "expiration_days": 30 }]
    }));

    let failure = h.reconciler.reconcile(&state).await.unwrap_err();
    assert_eq!(failure.phase, Phase::Diffing);
    assert_eq!(failure.mutations_applied, 0);
    assert!(matches!(failure.source, Error::AmbiguousMatch { .. }));
    assert_eq!(h.remote.mutation_count().await, 0);
}

#[tokio::test]
async fn test_tag_merge_and_replace() {
    for (semantics, expected) in [
        (TagSemantics::Merge, vec!["env", "owner"]),
        (TagSemantics::Replace, vec!["env"]),
    ] {
        let policies = PolicyTable::default()
            .with(
                SubResourceKind::Tags,
                RuleTypePolicy::by_id().with_tag_semantics(semantics),
            )
            .unwrap();
        let h = Harness::with_policies(policies);
        h.remote.seed_resource("assets").await;
        h.remote
            .seed(
                "assets",
                SubResourceKind::Tags,
                json!({ "TagSet": [{ "Key": "owner", "Value": "ops" }] }),
            )
            .await;

        let state = desired(json!({ "name": "assets", "tags": { "env": "prod" } }));
        let outcome = h.reconciler.reconcile(&state).await.unwrap();
        let keys: Vec<_> = outcome
            .final_state
            .tags
            .unwrap()
            .into_keys()
            .collect();
        assert_eq!(keys, expected);
    }
}

#[tokio::test]
async fn test_routing_rule_order_is_enforced() {
    let h = Harness::new();
    h.remote.seed_resource("site").await;
    h.remote
        .seed(
            "site",
            SubResourceKind::RoutingRules,
            json!({ "RoutingRules": [
                { "Condition": { "KeyPrefixEquals": "b/" }, "Redirect": { "HostName": "x.com" } },
                { "Condition": { "KeyPrefixEquals": "a/" }, "Redirect": { "HostName": "x.com" } }
            ]}),
        )
        .await;
    let state = desired(json!({
        "name": "site",
        "routing_rules": [
            { "key_prefix": "a/", "hostname": "x.com" },
            { "key_prefix": "b/", "hostname": "x.com" }
        ]
    }));

    let outcome = h.reconciler.reconcile(&state).await.unwrap();
    assert!(outcome.changed);
    let prefixes: Vec<_> = outcome
        .final_state
        .rules(SubResourceKind::RoutingRules)
        .unwrap()
        .iter()
        .map(|r| r.payload.get("key_prefix").cloned().unwrap_or(Value::Null))
        .collect();
    assert_eq!(prefixes, vec![json!("a/"), json!("b/")]);

    assert!(!h.reconciler.reconcile(&state).await.unwrap().changed);
}

#[tokio::test]
async fn test_scalar_facets_compare_semantically() {
    let h = Harness::new();
    h.remote.seed_resource("assets").await;
    h.remote
        .seed(
            "assets",
            SubResourceKind::Policy,
            json!({ "Policy": "{\"Version\":\"2012-10-17\",\"Statement\":[]}" }),
        )
        .await;
    let state = desired(json!({
        "name": "assets",
        "versioning": false,
        "requester_pays": false,
        "policy": { "Statement": [], "Version": "2012-10-17" }
    }));

    let outcome = h.reconciler.reconcile(&state).await.unwrap();
    assert!(!outcome.changed);
    assert_eq!(h.remote.mutation_count().await, 0);
}

#[tokio::test]
async fn test_dhcp_options_keep_omitted_fields() {
    let h = Harness::new();
    h.remote.seed_resource("vpc-1").await;
    h.remote
        .seed(
            "vpc-1",
            SubResourceKind::DhcpOptions,
            json!({ "DhcpConfigurations": [
                { "Key": "domain-name", "Values": [{ "Value": "corp.local" }] },
                { "Key": "ntp-servers", "Values": [{ "Value": "10.0.0.1" }] }
            ]}),
        )
        .await;
    let state = desired(json!({
        "name": "vpc-1",
        "dhcp_options": { "domain_name": "example.internal" }
    }));

    let outcome = h.reconciler.reconcile(&state).await.unwrap();
    assert!(outcome.changed);
    let options = outcome.final_state.dhcp_options.unwrap();
    assert_eq!(options.domain_name.as_deref(), Some("example.internal"));
    assert_eq!(options.ntp_servers, Some(vec!["10.0.0.1".to_string()]));
}

#[tokio::test]
async fn test_empty_error_key_removes_error_document() {
    let h = Harness::new();
    h.remote.seed_resource("site").await;
    h.remote
        .seed(
            "site",
            SubResourceKind::Website,
            json!({
                "IndexDocument": { "Suffix": "index.html" },
                "ErrorDocument": { "Key": "err.html" }
            }),
        )
        .await;
    let state = desired(json!({
        "name": "site",
        "website": { "index_suffix": "index.html", "error_key": "" }
    }));

    let outcome = h.reconciler.reconcile(&state).await.unwrap();
    assert!(outcome.changed);
    assert_eq!(
        h.remote.body("site", SubResourceKind::Website).await,
        Some(json!({ "IndexDocument": { "Suffix": "index.html" } }))
    );
    assert!(outcome.final_state.website.unwrap().error_key.is_none());

    assert!(!h.reconciler.reconcile(&state).await.unwrap().changed);
}

#[tokio::test]
async fn test_rewritten_cors_rules_keep_missing_max_age() {
    let h = Harness::new();
    h.remote.seed_resource("assets").await;
    h.remote
        .seed(
            "assets",
            SubResourceKind::CorsRules,
            json!({ "CORSRules": [
                { "AllowedMethods": ["GET"], "AllowedOrigins": ["*"] },
                { "AllowedMethods": ["PUT"], "AllowedOrigins": ["https://a.com"] }
            ]}),
        )
        .await;
    let state = desired(json!({
        "name": "assets",
        "cors_rules": [{ "allowed_methods": ["GET"], "allowed_origins": ["*"] }]
    }));

    let outcome = h.reconciler.reconcile(&state).await.unwrap();
    assert!(outcome.changed);
    assert_eq!(
        h.remote.body("assets", SubResourceKind::CorsRules).await,
        Some(json!({ "CORSRules": [{ "AllowedMethods": ["GET"], "AllowedOrigins": ["*"] }] }))
    );

    assert!(!h.reconciler.reconcile(&state).await.unwrap().changed);
}

#[tokio::test]
async fn test_logging_target_converges() {
    let h = Harness::new();
    h.remote.seed_resource("assets").await;
    let state = desired(json!({
        "name": "assets",
        "logging": { "target_bucket": "access-logs" }
    }));

    let outcome = h.reconciler.reconcile(&state).await.unwrap();
    let ops: Vec<_> = outcome.mutations.iter().map(|m| m.mutation.name()).collect();
    assert_eq!(ops, vec!["put_logging"]);
    assert_eq!(
        h.remote.body("assets", SubResourceKind::Logging).await,
        Some(json!({ "LoggingEnabled": { "TargetBucket": "access-logs", "TargetPrefix": "" } }))
    );
    assert!(!h.reconciler.reconcile(&state).await.unwrap().changed);

    let moved = desired(json!({
        "name": "assets",
        "logging": { "target_bucket": "access-logs", "target_prefix": "assets/" }
    }));
    let outcome = h.reconciler.reconcile(&moved).await.unwrap();
    assert!(outcome.changed);
    assert_eq!(
        outcome.final_state.logging.unwrap().target_prefix,
        "assets/"
    );
}

#[tokio::test]
async fn test_role_trust_policy_and_managed_policies() {
    let read_only = "arn:aws:iam::aws:policy/ReadOnlyAccess";
    let admin = "arn:aws:iam::aws:policy/AdministratorAccess";
    let h = Harness::new();
    h.remote.seed_resource("deploy").await;
    h.remote
        .seed(
            "deploy",
            SubResourceKind::AssumeRolePolicy,
            json!({ "AssumeRolePolicyDocument": "{\"Version\": \"2012-10-17\", \"Statement\": [{\"Effect\": \"Allow\", \"Principal\": {\"Service\": \"ec2.amazonaws.com\"}, \"Action\": \"sts:AssumeRole\"}]}" }),
        )
        .await;
    h.remote
        .seed(
            "deploy",
            SubResourceKind::ManagedPolicies,
            json!({ "AttachedPolicies": [{ "PolicyName": "AdministratorAccess", "PolicyArn": admin }] }),
        )
        .await;
    let state = desired(json!({
        "name": "deploy",
        "assume_role_policy": {
            "Statement": [{
                "Action": "sts:AssumeRole",
                "Principal": { "Service": "ec2.amazonaws.com" },
                "Effect": "Allow"
            }],
            "Version": "2012-10-17"
        },
        "managed_policies": [read_only]
    }));

    let outcome = h.reconciler.reconcile(&state).await.unwrap();
    let ops: Vec<_> = outcome.mutations.iter().map(|m| m.mutation.clone()).collect();
    assert_eq!(
        ops,
        vec![
            Mutation::AttachPolicy {
                arn: read_only.to_string()
            },
            Mutation::DetachPolicy {
                arn: admin.to_string()
            },
        ]
    );
    let attached = outcome.final_state.managed_policies.unwrap();
    assert_eq!(attached.into_iter().collect::<Vec<_>>(), vec![read_only.to_string()]);

    assert!(!h.reconciler.reconcile(&state).await.unwrap().changed);
}

#[tokio::test]
async fn test_single_kind_reconcile_per_item() {
    let remote = Arc::new(MemoryRemote::new());
    remote.seed_resource("assets").await;
    remote
        .seed(
            "assets",
            SubResourceKind::CorsRules,
            json!({ "CORSRules": [{
                "AllowedMethods": ["PUT"],
                "AllowedOrigins": ["https://a.com"],
                "MaxAgeSeconds": 100
            }]}),
        )
        .await;
    let rule = DesiredRule::new(
        Payload::new()
            .with("allowed_methods", json!(["GET"]))
            .with("allowed_origins", json!(["*"])),
    )
    .with_default("max_age_seconds", 3000);
    let policy = RuleTypePolicy::for_kind(SubResourceKind::CorsRules).per_item();

    let outcome = reconcile(
        "assets",
        SubResourceKind::CorsRules,
        vec![rule],
        &policy,
        remote.clone(),
        remote.clone(),
    )
    .await
    .unwrap();

    let ops: Vec<_> = outcome.mutations.iter().map(|m| m.mutation.name()).collect();
    assert_eq!(ops, vec!["put_rule", "delete_rule"]);
    assert_eq!(
        remote.body("assets", SubResourceKind::CorsRules).await.unwrap(),
        json!({ "CORSRules": [{
            "AllowedMethods": ["GET"],
            "AllowedOrigins": ["*"],
            "MaxAgeSeconds": 3000
        }]})
    );
}

// =============================================================================
// Absent
// =============================================================================

#[tokio::test]
async fn test_absent_on_missing_resource_is_noop() {
    let h = Harness::new();

    let outcome = h
        .reconciler
        .remove("ghost", &Removal::Resource { force: false })
        .await
        .unwrap();
    assert!(!outcome.changed);
    assert_eq!(outcome.final_state.exists, Some(false));

    let outcome = h
        .reconciler
        .remove(
            "ghost",
            &Removal::SubResources(vec![SubResourceKind::Tags, SubResourceKind::CorsRules]),
        )
        .await
        .unwrap();
    assert!(!outcome.changed);
    assert_eq!(h.remote.mutation_count().await, 0);
}

#[tokio::test]
async fn test_absent_removes_sub_resources() {
    let h = Harness::new();
    h.remote.seed_resource("assets").await;
    h.remote
        .seed(
            "assets",
            SubResourceKind::Tags,
            json!({ "TagSet": [{ "Key": "env", "Value": "prod" }] }),
        )
        .await;
    h.remote
        .seed(
            "assets",
            SubResourceKind::CorsRules,
            json!({ "CORSRules": [{ "AllowedMethods": ["GET"], "AllowedOrigins": ["*"] }] }),
        )
        .await;

    let outcome = h
        .reconciler
        .remove(
            "assets",
            &Removal::SubResources(vec![
                SubResourceKind::CorsRules,
                SubResourceKind::Policy,
                SubResourceKind::Tags,
            ]),
        )
        .await
        .unwrap();

    assert!(outcome.changed);
    let ops: Vec<_> = outcome.mutations.iter().map(|m| m.mutation.clone()).collect();
    assert_eq!(ops, vec![Mutation::DeleteTags, Mutation::DeleteRules]);
    assert!(h.remote.body("assets", SubResourceKind::Tags).await.is_none());
    assert!(h.remote.body("assets", SubResourceKind::Resource).await.is_some());
    assert!(outcome.final_state.tags.unwrap().is_empty());
}

#[tokio::test]
async fn test_absent_disables_logging_and_detaches_policies() {
    let h = Harness::new();
    h.remote.seed_resource("deploy").await;
    h.remote
        .seed(
            "deploy",
            SubResourceKind::Logging,
            json!({ "LoggingEnabled": { "TargetBucket": "logs", "TargetPrefix": "deploy/" } }),
        )
        .await;
    h.remote
        .seed(
            "deploy",
            SubResourceKind::ManagedPolicies,
            json!({ "AttachedPolicies": [
                { "PolicyArn": "arn:aws:iam::aws:policy/A" },
                { "PolicyArn": "arn:aws:iam::aws:policy/B" }
            ]}),
        )
        .await;

    let removal = Removal::SubResources(vec![
        SubResourceKind::ManagedPolicies,
        SubResourceKind::Logging,
    ]);
    let outcome = h.reconciler.remove("deploy", &removal).await.unwrap();
    let ops: Vec<_> = outcome.mutations.iter().map(|m| m.mutation.name()).collect();
    assert_eq!(ops, vec!["delete_logging", "detach_policy", "detach_policy"]);
    assert!(outcome.final_state.logging.is_none());
    assert!(outcome.final_state.managed_policies.unwrap().is_empty());

    let again = h.reconciler.remove("deploy", &removal).await.unwrap();
    assert!(!again.changed);
}

#[tokio::test]
async fn test_absent_deletes_resource() {
    let h = Harness::new();
    h.remote.seed_resource("assets").await;

    let outcome = h
        .reconciler
        .remove("assets", &Removal::Resource { force: true })
        .await
        .unwrap();
    assert!(outcome.changed);
    assert_eq!(
        outcome.mutations[0].mutation,
        Mutation::DeleteResource { force: true }
    );
    assert_eq!(outcome.final_state.exists, Some(false));
}

#[tokio::test]
async fn test_absent_rejects_resource_kind_in_sub_resources() {
    let h = Harness::new();
    let failure = h
        .reconciler
        .remove("assets", &Removal::SubResources(vec![SubResourceKind::Resource]))
        .await
        .unwrap_err();
    assert!(matches!(failure.source, Error::InvalidConfig(_)));
}

// =============================================================================
// Failures
// =============================================================================

#[tokio::test(start_paused = true)]
async fn test_slow_remote_times_out() {
    let h = Harness::new().with_timeout(Duration::from_secs(1));
    h.remote.set_delay(Some(Duration::from_secs(60))).await;

    let state = desired(json!({ "name": "assets" }));
    let failure = h.reconciler.reconcile(&state).await.unwrap_err();
    assert_eq!(failure.phase, Phase::Fetching);
    assert!(matches!(failure.source, Error::Timeout { .. }));
    assert!(failure.source.is_retryable());
}

#[tokio::test]
async fn test_partial_convergence_reports_applied_count() {
    let h = Harness::new();
    h.remote.seed_resource("assets").await;
    h.remote
        .fail_apply_at(1, RemoteError::Transient("throttled".into()))
        .await;
    let state = desired(json!({
        "name": "assets",
        "versioning": true,
        "tags": { "env": "prod" }
    }));

    let failure = h.reconciler.reconcile(&state).await.unwrap_err();
    assert_eq!(failure.phase, Phase::Converging);
    assert_eq!(failure.mutations_applied, 1);
    assert!(failure.is_partial());
    assert!(matches!(failure.source, Error::Transient(_)));

    // Re-running converges the rest without repeating the first mutation.
    let outcome = h.reconciler.reconcile(&state).await.unwrap();
    assert_eq!(outcome.mutations.len(), 1);
    assert_eq!(outcome.mutations[0].kind, SubResourceKind::Tags);
}

#[tokio::test]
async fn test_malformed_observed_state_fails_diffing() {
    let h = Harness::new();
    h.remote.seed_resource("assets").await;
    h.remote
        .seed("assets", SubResourceKind::Tags, json!({ "TagSet": "oops" }))
        .await;

    let state = desired(json!({ "name": "assets", "tags": {} }));
    let failure = h.reconciler.reconcile(&state).await.unwrap_err();
    assert_eq!(failure.phase, Phase::Diffing);
    assert!(matches!(
        failure.source,
        Error::MalformedState {
            kind: SubResourceKind::Tags,
            ..
        }
    ));
    assert_eq!(h.remote.mutation_count().await, 0);
}

#[tokio::test]
async fn test_auth_failure_is_not_swallowed() {
    let h = Harness::new();
    h.remote.seed_resource("assets").await;
    h.remote
        .fail_fetch(SubResourceKind::Policy, RemoteError::Auth("denied".into()))
        .await;

    let state = desired(json!({ "name": "assets", "policy": { "Version": "2012-10-17" } }));
    let failure = h.reconciler.reconcile(&state).await.unwrap_err();
    assert!(matches!(failure.source, Error::Auth(_)));
}

// =============================================================================
// Concurrent writers
// =============================================================================

/// Mutator that lets another writer add a tag right after each call.
struct Meddler {
    remote: Arc<MemoryRemote>,
}

#[async_trait]
impl StateMutator for Meddler {
    async fn apply(
        &self,
        resource: &str,
        kind: SubResourceKind,
        mutation: &Mutation,
    ) -> Result<(), RemoteError> {
        self.remote.apply(resource, kind, mutation).await?;
        self.remote
            .seed(
                resource,
                SubResourceKind::Tags,
                json!({ "TagSet": [
                    { "Key": "env", "Value": "prod" },
                    { "Key": "intruder", "Value": "yes" }
                ]}),
            )
            .await;
        Ok(())
    }
}

#[tokio::test]
async fn test_concurrent_write_is_reported_not_flagged() {
    let remote = Arc::new(MemoryRemote::new());
    remote.seed_resource("assets").await;
    let meddler = Arc::new(Meddler {
        remote: remote.clone(),
    });
    let reconciler =
        converge_core::Reconciler::new(remote.clone(), meddler, PolicyTable::default());

    let state = desired(json!({ "name": "assets", "tags": { "env": "prod" } }));
    let outcome = reconciler.reconcile(&state).await.unwrap();
    assert!(outcome.changed);
    assert!(outcome.final_state.tags.unwrap().contains_key("intruder"));
}
