//! User-declared configuration and its normalization into a [`DesiredState`].

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{Error, Result};
use crate::kind::SubResourceKind;
use crate::model::{
    DesiredRule, DesiredState, DhcpOptions, LoggingConfig, Payload, PolicyArnSet,
    PolicyDocument, TagMap, VersioningStatus, WebsiteConfig,
};

/// Browser pre-flight cache time written when a CORS rule omits it.
pub const DEFAULT_MAX_AGE_SECONDS: u64 = 3000;
pub const DEFAULT_INDEX_SUFFIX: &str = "index.html";
pub const DEFAULT_STORAGE_CLASS: &str = "GLACIER";

const MAX_TAGS: usize = 50;
const MAX_TAG_KEY_LEN: usize = 128;
const MAX_TAG_VALUE_LEN: usize = 256;
const MAX_RULE_ID_LEN: usize = 255;

const STORAGE_CLASSES: &[&str] = &[
    "GLACIER",
    "STANDARD_IA",
    "ONEZONE_IA",
    "INTELLIGENT_TIERING",
    "DEEP_ARCHIVE",
];
const CORS_METHODS: &[&str] = &["GET", "PUT", "HEAD", "POST", "DELETE"];

/// Declared configuration of one resource, as read from a JSON document.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ResourceConfig {
    pub name: String,
    /// Create the resource when it does not exist.
    #[serde(default = "default_true")]
    pub ensure_exists: bool,
    #[serde(default)]
    pub versioning: Option<bool>,
    #[serde(default)]
    pub requester_pays: Option<bool>,
    /// Policy document, inline or as JSON text.
    #[serde(default)]
    pub policy: Option<Value>,
    #[serde(default)]
    pub tags: Option<TagMap>,
    #[serde(default)]
    pub website: Option<WebsiteSpec>,
    #[serde(default)]
    pub logging: Option<LoggingSpec>,
    #[serde(default)]
    pub dhcp_options: Option<DhcpOptionsSpec>,
    /// Trust policy of a role, inline or as JSON text.
    #[serde(default)]
    pub assume_role_policy: Option<Value>,
    /// ARNs of the managed policies that must be attached, and no others.
    #[serde(default)]
    pub managed_policies: Option<Vec<String>>,
    #[serde(default)]
    pub lifecycle_rules: Option<Vec<LifecycleRuleSpec>>,
    #[serde(default)]
    pub cors_rules: Option<Vec<CorsRuleSpec>>,
    #[serde(default)]
    pub routing_rules: Option<Vec<RoutingRuleSpec>>,
}

fn default_true() -> bool {
    true
}

impl ResourceConfig {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ensure_exists: true,
            versioning: None,
            requester_pays: None,
            policy: None,
            tags: None,
            website: None,
            logging: None,
            dhcp_options: None,
            assume_role_policy: None,
            managed_policies: None,
            lifecycle_rules: None,
            cors_rules: None,
            routing_rules: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RuleStatus {
    #[default]
    Enabled,
    Disabled,
}

impl RuleStatus {
    fn wire(self) -> &'static str {
        match self {
            RuleStatus::Enabled => "Enabled",
            RuleStatus::Disabled => "Disabled",
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LifecycleRuleSpec {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub prefix: Option<String>,
    #[serde(default)]
    pub status: Option<RuleStatus>,
    #[serde(default)]
    pub expiration_days: Option<u64>,
    #[serde(default)]
    pub transition_days: Option<u64>,
    #[serde(default)]
    pub storage_class: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CorsRuleSpec {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub allowed_headers: Vec<String>,
    pub allowed_methods: Vec<String>,
    pub allowed_origins: Vec<String>,
    #[serde(default)]
    pub expose_headers: Vec<String>,
    #[serde(default)]
    pub max_age_seconds: Option<u64>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RoutingRuleSpec {
    #[serde(default)]
    pub key_prefix: Option<String>,
    #[serde(default)]
    pub http_error_code: Option<u16>,
    #[serde(default)]
    pub protocol: Option<String>,
    #[serde(default)]
    pub hostname: Option<String>,
    #[serde(default)]
    pub replace_key_prefix_with: Option<String>,
    #[serde(default)]
    pub replace_key_with: Option<String>,
    #[serde(default)]
    pub http_redirect_code: Option<u16>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct WebsiteSpec {
    #[serde(default, alias = "suffix")]
    pub index_suffix: Option<String>,
    #[serde(default)]
    pub error_key: Option<String>,
    #[serde(default)]
    pub redirect_all_requests_to: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LoggingSpec {
    pub target_bucket: String,
    #[serde(default)]
    pub target_prefix: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DhcpOptionsSpec {
    #[serde(default)]
    pub domain_name: Option<String>,
    #[serde(default)]
    pub domain_name_servers: Option<Vec<String>>,
    #[serde(default)]
    pub ntp_servers: Option<Vec<String>>,
    #[serde(default)]
    pub netbios_name_servers: Option<Vec<String>>,
    #[serde(default)]
    pub netbios_node_type: Option<u8>,
}

/// Validate a declared configuration and normalize it into a desired state,
/// filling defaults.
pub fn normalize_desired(config: &ResourceConfig) -> Result<DesiredState> {
    if config.name.trim().is_empty() {
        return Err(Error::invalid("resource name must not be empty"));
    }

    let mut state = DesiredState::new(config.name.clone());
    state.exists = config.ensure_exists.then_some(true);
    state.versioning = config.versioning.map(VersioningStatus::from_flag);
    state.requester_pays = config.requester_pays;
    state.policy = config.policy.as_ref().map(normalize_policy).transpose()?;
    state.assume_role_policy = config
        .assume_role_policy
        .as_ref()
        .map(normalize_policy)
        .transpose()?;
    state.managed_policies = config
        .managed_policies
        .as_deref()
        .map(normalize_policy_arns)
        .transpose()?;
    state.tags = config.tags.as_ref().map(normalize_tags).transpose()?;
    state.website = config.website.as_ref().map(normalize_website).transpose()?;
    state.logging = config.logging.as_ref().map(normalize_logging).transpose()?;
    state.dhcp_options = config
        .dhcp_options
        .as_ref()
        .map(normalize_dhcp_options)
        .transpose()?;

    if let Some(rules) = &config.lifecycle_rules {
        let rules = rules.iter().map(normalize_lifecycle_rule).collect::<Result<_>>()?;
        state.set_rules(SubResourceKind::LifecycleRules, rules);
    }
    if let Some(rules) = &config.cors_rules {
        let rules = rules.iter().map(normalize_cors_rule).collect::<Result<_>>()?;
        state.set_rules(SubResourceKind::CorsRules, rules);
    }
    if let Some(rules) = &config.routing_rules {
        let rules = rules.iter().map(normalize_routing_rule).collect::<Result<_>>()?;
        state.set_rules(SubResourceKind::RoutingRules, rules);
    }

    Ok(state)
}

fn normalize_policy(policy: &Value) -> Result<PolicyDocument> {
    match policy {
        Value::String(text) => PolicyDocument::parse(text)
            .map_err(|e| Error::invalid(format!("policy is not valid JSON: {}", e))),
        Value::Object(_) => Ok(PolicyDocument::new(policy.clone())),
        other => Err(Error::invalid(format!(
            "policy must be an object or JSON text, got {}",
            other
        ))),
    }
}

fn normalize_tags(tags: &TagMap) -> Result<TagMap> {
    if tags.len() > MAX_TAGS {
        return Err(Error::invalid(format!(
            "at most {} tags are allowed, got {}",
            MAX_TAGS,
            tags.len()
        )));
    }
    for (key, value) in tags {
        if key.is_empty() || key.len() > MAX_TAG_KEY_LEN {
            return Err(Error::invalid(format!(
                "tag key {:?} must be 1-{} characters",
                key, MAX_TAG_KEY_LEN
            )));
        }
        if value.len() > MAX_TAG_VALUE_LEN {
            return Err(Error::invalid(format!(
                "tag {} value exceeds {} characters",
                key, MAX_TAG_VALUE_LEN
            )));
        }
    }
    Ok(tags.clone())
}

fn normalize_website(spec: &WebsiteSpec) -> Result<WebsiteConfig> {
    // An empty error key is kept: it removes the error document.
    let error_key = spec.error_key.clone();

    if let Some(host) = &spec.redirect_all_requests_to {
        if spec.index_suffix.is_some() || error_key.as_deref().is_some_and(|k| !k.is_empty()) {
            return Err(Error::invalid(
                "website redirect_all_requests_to excludes index_suffix and error_key",
            ));
        }
        if host.is_empty() {
            return Err(Error::invalid("website redirect host must not be empty"));
        }
        return Ok(WebsiteConfig {
            redirect_all_requests_to: Some(host.clone()),
            ..Default::default()
        });
    }

    let suffix = spec
        .index_suffix
        .clone()
        .unwrap_or_else(|| DEFAULT_INDEX_SUFFIX.to_string());
    if suffix.is_empty() || suffix.contains('/') {
        return Err(Error::invalid(format!(
            "website index suffix {:?} must be non-empty and contain no '/'",
            suffix
        )));
    }
    Ok(WebsiteConfig {
        index_suffix: Some(suffix),
        error_key,
        redirect_all_requests_to: None,
    })
}

fn normalize_logging(spec: &LoggingSpec) -> Result<LoggingConfig> {
    if spec.target_bucket.trim().is_empty() {
        return Err(Error::invalid("logging target_bucket must not be empty"));
    }
    Ok(LoggingConfig {
        target_bucket: spec.target_bucket.clone(),
        target_prefix: spec.target_prefix.clone().unwrap_or_default(),
    })
}

fn normalize_policy_arns(arns: &[String]) -> Result<PolicyArnSet> {
    if let Some(bad) = arns
        .iter()
        .find(|arn| !arn.starts_with("arn:") || !arn.contains(":policy/"))
    {
        return Err(Error::invalid(format!("{:?} is not a managed policy ARN", bad)));
    }
    Ok(arns.iter().cloned().collect())
}

fn normalize_dhcp_options(spec: &DhcpOptionsSpec) -> Result<DhcpOptions> {
    if let Some(node_type) = spec.netbios_node_type {
        if ![1, 2, 4, 8].contains(&node_type) {
            return Err(Error::invalid(format!(
                "netbios_node_type must be 1, 2, 4 or 8, got {}",
                node_type
            )));
        }
    }
    let options = DhcpOptions {
        domain_name: spec.domain_name.clone(),
        domain_name_servers: spec.domain_name_servers.clone(),
        ntp_servers: spec.ntp_servers.clone(),
        netbios_name_servers: spec.netbios_name_servers.clone(),
        netbios_node_type: spec.netbios_node_type,
    };
    if options == DhcpOptions::default() {
        return Err(Error::invalid("dhcp_options must set at least one option"));
    }
    Ok(options)
}

fn normalize_rule_id(id: &Option<String>) -> Result<Option<String>> {
    match id {
        Some(id) if id.is_empty() || id.len() > MAX_RULE_ID_LEN => Err(Error::invalid(format!(
            "rule id must be 1-{} characters",
            MAX_RULE_ID_LEN
        ))),
        other => Ok(other.clone()),
    }
}

fn normalize_lifecycle_rule(spec: &LifecycleRuleSpec) -> Result<DesiredRule> {
    if spec.expiration_days.is_none() && spec.transition_days.is_none() {
        return Err(Error::invalid(
            "lifecycle rule needs expiration_days or transition_days",
        ));
    }
    if spec.expiration_days == Some(0) || spec.transition_days == Some(0) {
        return Err(Error::invalid("lifecycle rule days must be positive"));
    }
    if spec.storage_class.is_some() && spec.transition_days.is_none() {
        return Err(Error::invalid(
            "lifecycle storage_class requires transition_days",
        ));
    }

    let mut payload = Payload::new()
        .with("prefix", spec.prefix.clone().unwrap_or_default())
        .with("status", spec.status.unwrap_or_default().wire());
    if let Some(days) = spec.expiration_days {
        payload.insert("expiration_days", days);
    }
    if let Some(days) = spec.transition_days {
        let class = spec
            .storage_class
            .as_deref()
            .unwrap_or(DEFAULT_STORAGE_CLASS)
            .to_uppercase();
        if !STORAGE_CLASSES.contains(&class.as_str()) {
            return Err(Error::invalid(format!("unknown storage class {}", class)));
        }
        payload.insert("transition_days", days);
        payload.insert("storage_class", class);
    }

    Ok(DesiredRule {
        id: normalize_rule_id(&spec.id)?,
        payload,
        defaults: Payload::new(),
    })
}

fn text_set(values: &[String]) -> Option<Vec<String>> {
    let mut set: Vec<String> = values.to_vec();
    set.sort();
    set.dedup();
    (!set.is_empty()).then_some(set)
}

fn normalize_cors_rule(spec: &CorsRuleSpec) -> Result<DesiredRule> {
    let methods: Vec<String> = spec.allowed_methods.iter().map(|m| m.to_uppercase()).collect();
    if methods.is_empty() {
        return Err(Error::invalid("CORS rule needs at least one allowed method"));
    }
    if let Some(bad) = methods.iter().find(|m| !CORS_METHODS.contains(&m.as_str())) {
        return Err(Error::invalid(format!("unsupported CORS method {}", bad)));
    }
    if spec.allowed_origins.is_empty() {
        return Err(Error::invalid("CORS rule needs at least one allowed origin"));
    }
    for value in spec.allowed_origins.iter().chain(&spec.allowed_headers) {
        if value.matches('*').count() > 1 {
            return Err(Error::invalid(format!(
                "{:?} may contain at most one '*' wildcard",
                value
            )));
        }
    }

    let mut payload = Payload::new();
    for (field, values) in [
        ("allowed_headers", &spec.allowed_headers),
        ("allowed_methods", &methods),
        ("allowed_origins", &spec.allowed_origins),
        ("expose_headers", &spec.expose_headers),
    ] {
        if let Some(set) = text_set(values) {
            payload.insert(field, set);
        }
    }

    let mut rule = DesiredRule {
        id: normalize_rule_id(&spec.id)?,
        payload,
        defaults: Payload::new(),
    };
    match spec.max_age_seconds {
        Some(age) => rule.payload.insert("max_age_seconds", age),
        None => rule.defaults.insert("max_age_seconds", DEFAULT_MAX_AGE_SECONDS),
    }
    Ok(rule)
}

fn normalize_routing_rule(spec: &RoutingRuleSpec) -> Result<DesiredRule> {
    if spec.replace_key_prefix_with.is_some() && spec.replace_key_with.is_some() {
        return Err(Error::invalid(
            "routing rule cannot set both replace_key_prefix_with and replace_key_with",
        ));
    }
    if spec.hostname.is_none()
        && spec.protocol.is_none()
        && spec.replace_key_prefix_with.is_none()
        && spec.replace_key_with.is_none()
        && spec.http_redirect_code.is_none()
    {
        return Err(Error::invalid("routing rule needs at least one redirect field"));
    }
    let protocol = spec.protocol.as_ref().map(|p| p.to_lowercase());
    if let Some(p) = &protocol {
        if p != "http" && p != "https" {
            return Err(Error::invalid(format!(
                "routing rule protocol must be http or https, got {}",
                p
            )));
        }
    }
    if let Some(code) = spec.http_error_code {
        if !(400..600).contains(&code) {
            return Err(Error::invalid(format!(
                "http_error_code must be 4xx or 5xx, got {}",
                code
            )));
        }
    }
    if let Some(code) = spec.http_redirect_code {
        if !(300..400).contains(&code) {
            return Err(Error::invalid(format!(
                "http_redirect_code must be 3xx, got {}",
                code
            )));
        }
    }

    let mut payload = Payload::new();
    let text_fields = [
        ("key_prefix", spec.key_prefix.clone()),
        ("http_error_code", spec.http_error_code.map(|c| c.to_string())),
        ("hostname", spec.hostname.clone()),
        ("protocol", protocol),
        ("replace_key_prefix_with", spec.replace_key_prefix_with.clone()),
        ("replace_key_with", spec.replace_key_with.clone()),
        ("http_redirect_code", spec.http_redirect_code.map(|c| c.to_string())),
    ];
    for (field, value) in text_fields {
        if let Some(value) = value {
            payload.insert(field, value);
        }
    }
    Ok(DesiredRule::new(payload))
}
