//! Wire shapes of each sub-resource kind.
//!
//! Rule kinds are described by field tables mapping a payload field to its
//! path in the remote's JSON body, so decoding and encoding share one
//! definition.

use serde_json::{Map, Value, json};

use crate::error::{Error, Result};
use crate::kind::SubResourceKind;
use crate::model::{
    DhcpOptions, LoggingConfig, ObservedRule, Payload, PolicyArnSet, TagMap, VersioningStatus,
    WebsiteConfig,
};
use crate::remote::Mutation;

use super::observed::{ObservedFacet, parse_observed};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Shape {
    Text,
    Number,
    /// List of strings whose order carries no meaning; kept sorted.
    TextSet,
}

#[derive(Debug)]
pub(crate) struct FieldSpec {
    pub field: &'static str,
    pub path: &'static [&'static str],
    pub shape: Shape,
    /// A missing value reads as the empty string.
    pub missing_as_empty: bool,
}

const fn field(field: &'static str, path: &'static [&'static str], shape: Shape) -> FieldSpec {
    FieldSpec {
        field,
        path,
        shape,
        missing_as_empty: false,
    }
}

#[derive(Debug)]
pub(crate) struct RuleFormat {
    pub kind: SubResourceKind,
    pub collection_key: &'static str,
    pub id_key: Option<&'static str>,
    pub fields: &'static [FieldSpec],
}

static LIFECYCLE: RuleFormat = RuleFormat {
    kind: SubResourceKind::LifecycleRules,
    collection_key: "Rules",
    id_key: Some("ID"),
    fields: &[
        FieldSpec {
            field: "prefix",
            path: &["Prefix"],
            shape: Shape::Text,
            missing_as_empty: true,
        },
        field("status", &["Status"], Shape::Text),
        field("expiration_days", &["Expiration", "Days"], Shape::Number),
        field("transition_days", &["Transition", "Days"], Shape::Number),
        field("storage_class", &["Transition", "StorageClass"], Shape::Text),
    ],
};

static CORS: RuleFormat = RuleFormat {
    kind: SubResourceKind::CorsRules,
    collection_key: "CORSRules",
    id_key: Some("ID"),
    fields: &[
        field("allowed_headers", &["AllowedHeaders"], Shape::TextSet),
        field("allowed_methods", &["AllowedMethods"], Shape::TextSet),
        field("allowed_origins", &["AllowedOrigins"], Shape::TextSet),
        field("expose_headers", &["ExposeHeaders"], Shape::TextSet),
        field("max_age_seconds", &["MaxAgeSeconds"], Shape::Number),
    ],
};

static ROUTING: RuleFormat = RuleFormat {
    kind: SubResourceKind::RoutingRules,
    collection_key: "RoutingRules",
    id_key: None,
    fields: &[
        field("key_prefix", &["Condition", "KeyPrefixEquals"], Shape::Text),
        field(
            "http_error_code",
            &["Condition", "HttpErrorCodeReturnedEquals"],
            Shape::Text,
        ),
        field("hostname", &["Redirect", "HostName"], Shape::Text),
        field("protocol", &["Redirect", "Protocol"], Shape::Text),
        field(
            "replace_key_prefix_with",
            &["Redirect", "ReplaceKeyPrefixWith"],
            Shape::Text,
        ),
        field("replace_key_with", &["Redirect", "ReplaceKeyWith"], Shape::Text),
        field("http_redirect_code", &["Redirect", "HttpRedirectCode"], Shape::Text),
    ],
};

pub(crate) fn rule_format(kind: SubResourceKind) -> Option<&'static RuleFormat> {
    match kind {
        SubResourceKind::LifecycleRules => Some(&LIFECYCLE),
        SubResourceKind::CorsRules => Some(&CORS),
        SubResourceKind::RoutingRules => Some(&ROUTING),
        _ => None,
    }
}

fn require_format(kind: SubResourceKind) -> Result<&'static RuleFormat> {
    rule_format(kind).ok_or_else(|| Error::invalid(format!("{} does not hold rules", kind)))
}

/// Bring a field value into the canonical form used for comparison.
pub(crate) fn canonical(
    kind: SubResourceKind,
    spec: &FieldSpec,
    value: &Value,
) -> Result<Option<Value>> {
    let bad = |expected: &str| {
        Error::malformed(
            kind,
            format!("field {} must be {}, got {}", spec.field, expected, value),
        )
    };
    match (spec.shape, value) {
        (_, Value::Null) => Ok(None),
        (Shape::Text, Value::String(s)) => Ok(Some(Value::String(s.clone()))),
        (Shape::Text, Value::Number(n)) => Ok(Some(Value::String(n.to_string()))),
        (Shape::Text, _) => Err(bad("a string")),
        (Shape::Number, Value::Number(n)) => n
            .as_u64()
            .map(|n| Some(Value::from(n)))
            .ok_or_else(|| bad("a non-negative integer")),
        (Shape::Number, Value::String(s)) => s
            .parse::<u64>()
            .map(|n| Some(Value::from(n)))
            .map_err(|_| bad("a non-negative integer")),
        (Shape::Number, _) => Err(bad("a non-negative integer")),
        (Shape::TextSet, Value::Array(items)) => {
            let mut set = items
                .iter()
                .map(|v| v.as_str().map(str::to_string).ok_or_else(|| bad("a list of strings")))
                .collect::<Result<Vec<_>>>()?;
            set.sort();
            set.dedup();
            if set.is_empty() {
                Ok(None)
            } else {
                Ok(Some(Value::from(set)))
            }
        }
        // A single string stands for a one-element list.
        (Shape::TextSet, Value::String(s)) => Ok(Some(json!([s]))),
        (Shape::TextSet, _) => Err(bad("a list of strings")),
    }
}

fn lookup<'a>(value: &'a Value, path: &[&str]) -> Option<&'a Value> {
    path.iter().try_fold(value, |v, seg| v.get(*seg))
}

fn insert_path(target: &mut Map<String, Value>, path: &[&str], value: Value) {
    let Some((last, parents)) = path.split_last() else {
        return;
    };
    let mut cursor = target;
    for seg in parents {
        let entry = cursor
            .entry(seg.to_string())
            .or_insert_with(|| Value::Object(Map::new()));
        if !entry.is_object() {
            *entry = Value::Object(Map::new());
        }
        cursor = match entry.as_object_mut() {
            Some(map) => map,
            None => return,
        };
    }
    cursor.insert(last.to_string(), value);
}

pub(crate) fn decode_rule(format: &RuleFormat, value: &Value) -> Result<ObservedRule> {
    if !value.is_object() {
        return Err(Error::malformed(format.kind, "rule is not an object"));
    }
    let id = match format.id_key.and_then(|k| value.get(k)) {
        None | Some(Value::Null) => None,
        Some(Value::String(s)) => Some(s.clone()),
        Some(other) => {
            return Err(Error::malformed(
                format.kind,
                format!("rule id must be a string, got {}", other),
            ));
        }
    };
    let mut payload = Payload::new();
    for spec in format.fields {
        match lookup(value, spec.path) {
            Some(raw) => {
                if let Some(v) = canonical(format.kind, spec, raw)? {
                    payload.insert(spec.field, v);
                } else if spec.missing_as_empty {
                    payload.insert(spec.field, "");
                }
            }
            None if spec.missing_as_empty => payload.insert(spec.field, ""),
            None => {}
        }
    }
    Ok(ObservedRule { id, payload })
}

pub(crate) fn decode_rules(kind: SubResourceKind, raw: &Value) -> Result<Vec<ObservedRule>> {
    let format = require_format(kind)?;
    let items = raw
        .get(format.collection_key)
        .and_then(Value::as_array)
        .ok_or_else(|| {
            Error::malformed(kind, format!("expected a {} array", format.collection_key))
        })?;
    items.iter().map(|item| decode_rule(format, item)).collect()
}

pub(crate) fn encode_rule(format: &RuleFormat, rule: &ObservedRule) -> Value {
    let mut out = Map::new();
    if let (Some(key), Some(id)) = (format.id_key, &rule.id) {
        out.insert(key.to_string(), Value::String(id.clone()));
    }
    for spec in format.fields {
        if let Some(v) = rule.payload.get(spec.field) {
            insert_path(&mut out, spec.path, v.clone());
        }
    }
    Value::Object(out)
}

/// Render a rule into the wire shape of `kind`.
pub fn encode_rule_for(kind: SubResourceKind, rule: &ObservedRule) -> Result<Value> {
    Ok(encode_rule(require_format(kind)?, rule))
}

pub(crate) fn encode_rules(kind: SubResourceKind, rules: &[Value]) -> Result<Value> {
    let format = require_format(kind)?;
    let mut out = Map::new();
    out.insert(format.collection_key.to_string(), Value::from(rules.to_vec()));
    Ok(Value::Object(out))
}

pub(crate) fn encode_tags(tags: &TagMap) -> Value {
    let set: Vec<Value> = tags
        .iter()
        .map(|(k, v)| json!({ "Key": k, "Value": v }))
        .collect();
    json!({ "TagSet": set })
}

pub(crate) fn encode_versioning(status: VersioningStatus) -> Value {
    match status {
        VersioningStatus::Enabled => json!({ "Status": "Enabled" }),
        VersioningStatus::Suspended => json!({ "Status": "Suspended" }),
        VersioningStatus::Disabled => json!({}),
    }
}

pub(crate) fn encode_requester_pays(enabled: bool) -> Value {
    json!({ "Payer": if enabled { "Requester" } else { "BucketOwner" } })
}

pub(crate) fn encode_website(config: &WebsiteConfig) -> Value {
    let mut out = Map::new();
    if let Some(suffix) = &config.index_suffix {
        out.insert("IndexDocument".into(), json!({ "Suffix": suffix }));
    }
    if let Some(key) = &config.error_key {
        out.insert("ErrorDocument".into(), json!({ "Key": key }));
    }
    if let Some(host) = &config.redirect_all_requests_to {
        out.insert("RedirectAllRequestsTo".into(), json!({ "HostName": host }));
    }
    Value::Object(out)
}

pub(crate) fn encode_logging(config: &LoggingConfig) -> Value {
    json!({
        "LoggingEnabled": {
            "TargetBucket": config.target_bucket,
            "TargetPrefix": config.target_prefix,
        }
    })
}

pub(crate) fn encode_attached_policies(arns: &PolicyArnSet) -> Value {
    let attached: Vec<Value> = arns
        .iter()
        .map(|arn| {
            let name = arn.rsplit('/').next().unwrap_or(arn);
            json!({ "PolicyName": name, "PolicyArn": arn })
        })
        .collect();
    json!({ "AttachedPolicies": attached })
}

pub(crate) const DHCP_DOMAIN_NAME: &str = "domain-name";
pub(crate) const DHCP_DOMAIN_NAME_SERVERS: &str = "domain-name-servers";
pub(crate) const DHCP_NTP_SERVERS: &str = "ntp-servers";
pub(crate) const DHCP_NETBIOS_NAME_SERVERS: &str = "netbios-name-servers";
pub(crate) const DHCP_NETBIOS_NODE_TYPE: &str = "netbios-node-type";

pub(crate) fn encode_dhcp_options(options: &DhcpOptions) -> Value {
    let mut configs = Vec::new();
    let mut push = |key: &str, values: Vec<String>| {
        let values: Vec<Value> = values.into_iter().map(|v| json!({ "Value": v })).collect();
        configs.push(json!({ "Key": key, "Values": values }));
    };
    if let Some(name) = &options.domain_name {
        push(DHCP_DOMAIN_NAME, vec![name.clone()]);
    }
    if let Some(servers) = &options.domain_name_servers {
        push(DHCP_DOMAIN_NAME_SERVERS, servers.clone());
    }
    if let Some(servers) = &options.ntp_servers {
        push(DHCP_NTP_SERVERS, servers.clone());
    }
    if let Some(servers) = &options.netbios_name_servers {
        push(DHCP_NETBIOS_NAME_SERVERS, servers.clone());
    }
    if let Some(node_type) = options.netbios_node_type {
        push(DHCP_NETBIOS_NODE_TYPE, vec![node_type.to_string()]);
    }
    json!({ "DhcpConfigurations": configs })
}

/// Project a mutation onto the stored wire body of one kind.
///
/// Returns the new body, or `None` when the sub-resource no longer exists.
/// Used by remotes that keep wire bodies locally.
pub fn project(
    resource: &str,
    kind: SubResourceKind,
    current: Option<&Value>,
    mutation: &Mutation,
) -> Result<Option<Value>> {
    let mismatch = || {
        Error::invalid(format!(
            "mutation {} does not apply to {}",
            mutation.name(),
            kind
        ))
    };
    let body = match (kind, mutation) {
        (SubResourceKind::Resource, Mutation::CreateResource) => Some(json!({ "Name": resource })),
        (SubResourceKind::Resource, Mutation::DeleteResource { .. }) => None,
        (SubResourceKind::Versioning, Mutation::SetVersioning { status }) => {
            Some(encode_versioning(*status))
        }
        (SubResourceKind::RequesterPays, Mutation::SetRequesterPays { enabled }) => {
            Some(encode_requester_pays(*enabled))
        }
        (SubResourceKind::Policy, Mutation::PutPolicy { document }) => {
            Some(json!({ "Policy": document.to_string() }))
        }
        (SubResourceKind::Policy, Mutation::DeletePolicy) => None,
        (SubResourceKind::Tags, Mutation::PutTags { tags }) => Some(encode_tags(tags)),
        (SubResourceKind::Tags, Mutation::DeleteTags) => None,
        (SubResourceKind::Website, Mutation::PutWebsite { config }) => Some(encode_website(config)),
        (SubResourceKind::Website, Mutation::DeleteWebsite) => None,
        (SubResourceKind::Logging, Mutation::PutLogging { config }) => Some(encode_logging(config)),
        // A bucket always reports its logging status, disabled or not.
        (SubResourceKind::Logging, Mutation::DeleteLogging) => Some(json!({})),
        (SubResourceKind::DhcpOptions, Mutation::PutDhcpOptions { options }) => {
            Some(encode_dhcp_options(options))
        }
        (SubResourceKind::DhcpOptions, Mutation::DeleteDhcpOptions) => None,
        (SubResourceKind::AssumeRolePolicy, Mutation::PutAssumeRolePolicy { document }) => {
            Some(json!({ "AssumeRolePolicyDocument": document.to_string() }))
        }
        (SubResourceKind::ManagedPolicies, Mutation::AttachPolicy { arn }) => {
            let mut arns = current_policies(current)?;
            arns.insert(arn.clone());
            Some(encode_attached_policies(&arns))
        }
        (SubResourceKind::ManagedPolicies, Mutation::DetachPolicy { arn }) => {
            let mut arns = current_policies(current)?;
            if !arns.remove(arn) {
                return Err(Error::invalid(format!("policy {} is not attached", arn)));
            }
            Some(encode_attached_policies(&arns))
        }
        (k, Mutation::ReplaceRules { rules }) if k.is_rule_collection() => {
            Some(encode_rules(k, rules)?)
        }
        (k, Mutation::DeleteRules) if k.is_rule_collection() => None,
        (k, Mutation::PutRule { rule, replaces }) if k.is_rule_collection() => {
            let format = require_format(k)?;
            let mut rules = current_rules(format, current)?;
            if let Some(old) = replaces {
                remove_rule(format, &mut rules, old)?;
            }
            rules.push(rule.clone());
            Some(encode_rules(k, &rules)?)
        }
        (k, Mutation::DeleteRule { rule }) if k.is_rule_collection() => {
            let format = require_format(k)?;
            let mut rules = current_rules(format, current)?;
            remove_rule(format, &mut rules, rule)?;
            if rules.is_empty() {
                None
            } else {
                Some(encode_rules(k, &rules)?)
            }
        }
        _ => return Err(mismatch()),
    };
    Ok(body)
}

fn current_policies(current: Option<&Value>) -> Result<PolicyArnSet> {
    match current {
        None => Ok(PolicyArnSet::new()),
        Some(body) => match parse_observed(SubResourceKind::ManagedPolicies, body)? {
            ObservedFacet::ManagedPolicies(arns) => Ok(arns),
            other => Err(Error::malformed(
                SubResourceKind::ManagedPolicies,
                format!("unexpected facet {:?}", other.kind()),
            )),
        },
    }
}

fn current_rules(format: &RuleFormat, current: Option<&Value>) -> Result<Vec<Value>> {
    match current {
        None => Ok(Vec::new()),
        Some(body) => body
            .get(format.collection_key)
            .and_then(Value::as_array)
            .cloned()
            .ok_or_else(|| {
                Error::malformed(
                    format.kind,
                    format!("expected a {} array", format.collection_key),
                )
            }),
    }
}

fn remove_rule(format: &RuleFormat, rules: &mut Vec<Value>, target: &Value) -> Result<()> {
    let target = decode_rule(format, target)?;
    let mut kept = Vec::with_capacity(rules.len());
    for raw in rules.drain(..) {
        if !decode_rule(format, &raw)?.structurally_equal(&target) {
            kept.push(raw);
        }
    }
    *rules = kept;
    Ok(())
}
