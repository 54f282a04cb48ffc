//! Desired and observed resource descriptors.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::kind::SubResourceKind;

/// Tag map. Keys are unique and iterate in sorted order.
pub type TagMap = BTreeMap<String, String>;

/// ARNs of the managed policies attached to a role.
pub type PolicyArnSet = BTreeSet<String>;

/// Every configurable field of one rule, keyed by field name.
///
/// Compare payloads with [`Payload::structurally_equal`].
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Payload(BTreeMap<String, Value>);

impl Payload {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, field: &str, value: impl Into<Value>) -> Self {
        self.insert(field, value);
        self
    }

    pub fn insert(&mut self, field: &str, value: impl Into<Value>) {
        self.0.insert(field.to_string(), value.into());
    }

    pub fn get(&self, field: &str) -> Option<&Value> {
        self.0.get(field)
    }

    pub fn contains(&self, field: &str) -> bool {
        self.0.contains_key(field)
    }

    pub fn fields(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Deep structural equality of two payloads: same field set, and each
    /// field's JSON value equal (objects compare without regard to key
    /// order, arrays element by element).
    pub fn structurally_equal(&self, other: &Payload) -> bool {
        self.0.len() == other.0.len()
            && self
                .0
                .iter()
                .all(|(k, v)| other.0.get(k).is_some_and(|o| o == v))
    }
}

/// Tuple of significant field values identifying a rule.
///
/// Values are kept in their canonical JSON text so the key can be hashed.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MatchKey(Vec<String>);

impl MatchKey {
    pub fn from_payload(payload: &Payload, fields: &[String]) -> Self {
        MatchKey(
            fields
                .iter()
                .map(|f| payload.get(f).unwrap_or(&Value::Null).to_string())
                .collect(),
        )
    }
}

impl fmt::Display for MatchKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({})", self.0.join(", "))
    }
}

/// Common view of desired and observed rules.
pub trait Rule {
    fn id(&self) -> Option<&str>;
    fn payload(&self) -> &Payload;

    fn match_key(&self, fields: &[String]) -> MatchKey {
        MatchKey::from_payload(self.payload(), fields)
    }
}

/// A rule as declared by the user.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DesiredRule {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub payload: Payload,
    /// Fields the user omitted that are written on create only and never
    /// compared on update.
    #[serde(default, skip_serializing_if = "Payload::is_empty")]
    pub defaults: Payload,
}

impl DesiredRule {
    pub fn new(payload: Payload) -> Self {
        Self {
            id: None,
            payload,
            defaults: Payload::new(),
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn with_default(mut self, field: &str, value: impl Into<Value>) -> Self {
        self.defaults.insert(field, value);
        self
    }
}

impl Rule for DesiredRule {
    fn id(&self) -> Option<&str> {
        self.id.as_deref()
    }

    fn payload(&self) -> &Payload {
        &self.payload
    }
}

/// A rule as it exists on the remote. `id` may be server-assigned.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ObservedRule {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub payload: Payload,
}

impl ObservedRule {
    pub fn new(payload: Payload) -> Self {
        Self { id: None, payload }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn structurally_equal(&self, other: &ObservedRule) -> bool {
        self.id == other.id && self.payload.structurally_equal(&other.payload)
    }
}

impl Rule for ObservedRule {
    fn id(&self) -> Option<&str> {
        self.id.as_deref()
    }

    fn payload(&self) -> &Payload {
        &self.payload
    }
}

/// Opaque JSON policy document, compared by parsed structure.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PolicyDocument(Value);

impl PolicyDocument {
    pub fn new(document: Value) -> Self {
        Self(document)
    }

    /// Parse a document from its text form.
    pub fn parse(text: &str) -> serde_json::Result<Self> {
        serde_json::from_str(text).map(Self)
    }

    pub fn as_value(&self) -> &Value {
        &self.0
    }

    /// Equality of the parsed documents; whitespace and key order are
    /// irrelevant.
    pub fn semantically_equal(&self, other: &PolicyDocument) -> bool {
        self.0 == other.0
    }
}

/// Bucket versioning status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum VersioningStatus {
    Enabled,
    Suspended,
    /// Never configured. Once enabled, versioning can only be suspended.
    Disabled,
}

impl VersioningStatus {
    pub fn from_flag(enabled: bool) -> Self {
        if enabled {
            VersioningStatus::Enabled
        } else {
            VersioningStatus::Suspended
        }
    }

    pub fn is_enabled(self) -> bool {
        self == VersioningStatus::Enabled
    }

    /// Whether an observed status already satisfies this desired status.
    pub fn satisfied_by(self, observed: VersioningStatus) -> bool {
        match self {
            VersioningStatus::Enabled => observed.is_enabled(),
            VersioningStatus::Suspended | VersioningStatus::Disabled => !observed.is_enabled(),
        }
    }
}

/// Static website hosting configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WebsiteConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub index_suffix: Option<String>,
    /// In a desired state, `Some("")` removes the error document.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub redirect_all_requests_to: Option<String>,
}

impl WebsiteConfig {
    fn clears_error_document(&self) -> bool {
        self.error_key.as_deref() == Some("")
    }

    /// Fields set here must equal the observed ones; unset fields are not
    /// compared, except that a redirect target may not linger when only
    /// documents are declared.
    pub fn satisfied_by(&self, observed: &WebsiteConfig) -> bool {
        let error_document = if self.clears_error_document() {
            observed.error_key.is_none()
        } else {
            field_satisfied(&self.error_key, &observed.error_key)
        };
        field_satisfied(&self.index_suffix, &observed.index_suffix)
            && error_document
            && (self.redirect_all_requests_to.is_some()
                || self.index_suffix.is_none()
                || observed.redirect_all_requests_to.is_none())
            && field_satisfied(
                &self.redirect_all_requests_to,
                &observed.redirect_all_requests_to,
            )
    }

    /// The configuration to write: declared fields win, omitted document
    /// fields keep their observed values.
    pub fn merged_over(&self, observed: Option<&WebsiteConfig>) -> WebsiteConfig {
        if self.redirect_all_requests_to.is_some() {
            return WebsiteConfig {
                redirect_all_requests_to: self.redirect_all_requests_to.clone(),
                ..Default::default()
            };
        }
        let observed = observed.cloned().unwrap_or_default();
        let error_key = if self.clears_error_document() {
            None
        } else {
            self.error_key.clone().or(observed.error_key)
        };
        WebsiteConfig {
            index_suffix: self.index_suffix.clone().or(observed.index_suffix),
            error_key,
            redirect_all_requests_to: None,
        }
    }
}

/// Server access logging target of a bucket.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoggingConfig {
    pub target_bucket: String,
    #[serde(default)]
    pub target_prefix: String,
}

/// VPC DHCP option set.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DhcpOptions {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub domain_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub domain_name_servers: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ntp_servers: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub netbios_name_servers: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub netbios_node_type: Option<u8>,
}

impl DhcpOptions {
    pub fn satisfied_by(&self, observed: &DhcpOptions) -> bool {
        field_satisfied(&self.domain_name, &observed.domain_name)
            && field_satisfied(&self.domain_name_servers, &observed.domain_name_servers)
            && field_satisfied(&self.ntp_servers, &observed.ntp_servers)
            && field_satisfied(&self.netbios_name_servers, &observed.netbios_name_servers)
            && field_satisfied(&self.netbios_node_type, &observed.netbios_node_type)
    }

    /// Option sets are immutable remotely, so a change writes a complete set
    /// that keeps the observed values of omitted fields.
    pub fn merged_over(&self, observed: Option<&DhcpOptions>) -> DhcpOptions {
        let observed = observed.cloned().unwrap_or_default();
        DhcpOptions {
            domain_name: self.domain_name.clone().or(observed.domain_name),
            domain_name_servers: self
                .domain_name_servers
                .clone()
                .or(observed.domain_name_servers),
            ntp_servers: self.ntp_servers.clone().or(observed.ntp_servers),
            netbios_name_servers: self
                .netbios_name_servers
                .clone()
                .or(observed.netbios_name_servers),
            netbios_node_type: self.netbios_node_type.or(observed.netbios_node_type),
        }
    }
}

fn field_satisfied<T: PartialEq>(desired: &Option<T>, observed: &Option<T>) -> bool {
    desired.is_none() || desired == observed
}

/// Aggregate of sub-resource configurations for one named resource.
///
/// In a [`DesiredState`] a `None` facet is not managed. In an
/// [`ObservedState`] a `None` facet was either not fetched or does not exist
/// remotely.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourceState<R> {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exists: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub versioning: Option<VersioningStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub requester_pays: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub policy: Option<PolicyDocument>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tags: Option<TagMap>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub website: Option<WebsiteConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub logging: Option<LoggingConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dhcp_options: Option<DhcpOptions>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub assume_role_policy: Option<PolicyDocument>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub managed_policies: Option<PolicyArnSet>,
    #[serde(default = "BTreeMap::new", skip_serializing_if = "BTreeMap::is_empty")]
    pub rules: BTreeMap<SubResourceKind, Vec<R>>,
}

pub type DesiredState = ResourceState<DesiredRule>;
pub type ObservedState = ResourceState<ObservedRule>;

impl<R> ResourceState<R> {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            exists: None,
            versioning: None,
            requester_pays: None,
            policy: None,
            tags: None,
            website: None,
            logging: None,
            dhcp_options: None,
            assume_role_policy: None,
            managed_policies: None,
            rules: BTreeMap::new(),
        }
    }

    pub fn rules(&self, kind: SubResourceKind) -> Option<&[R]> {
        self.rules.get(&kind).map(Vec::as_slice)
    }

    pub fn set_rules(&mut self, kind: SubResourceKind, rules: Vec<R>) {
        self.rules.insert(kind, rules);
    }

    /// Kinds carried by this state, in convergence order.
    pub fn declared_kinds(&self) -> Vec<SubResourceKind> {
        SubResourceKind::ALL
            .into_iter()
            .filter(|&kind| match kind {
                SubResourceKind::Resource => self.exists.is_some(),
                SubResourceKind::Versioning => self.versioning.is_some(),
                SubResourceKind::RequesterPays => self.requester_pays.is_some(),
                SubResourceKind::Policy => self.policy.is_some(),
                SubResourceKind::Tags => self.tags.is_some(),
                SubResourceKind::Website => self.website.is_some(),
                SubResourceKind::Logging => self.logging.is_some(),
                SubResourceKind::DhcpOptions => self.dhcp_options.is_some(),
                SubResourceKind::AssumeRolePolicy => self.assume_role_policy.is_some(),
                SubResourceKind::ManagedPolicies => self.managed_policies.is_some(),
                _ => self.rules.contains_key(&kind),
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_payload_structural_equality() {
        let a = Payload::new()
            .with("prefix", "logs/")
            .with("expiration_days", 30);
        let b = Payload::new()
            .with("expiration_days", 30)
            .with("prefix", "logs/");
        assert!(a.structurally_equal(&b));

        let c = b.clone().with("status", "Enabled");
        assert!(!a.structurally_equal(&c));
        assert!(!c.structurally_equal(&a));
    }

    #[test]
    fn test_match_key_missing_field_is_null() {
        let fields = vec!["key_prefix".to_string(), "http_error_code".to_string()];
        let a = Payload::new().with("key_prefix", "docs/");
        let b = Payload::new()
            .with("key_prefix", "docs/")
            .with("http_error_code", Value::Null);
        assert_eq!(
            MatchKey::from_payload(&a, &fields),
            MatchKey::from_payload(&b, &fields)
        );
    }

    #[test]
    fn test_policy_semantic_equality() {
        let a = PolicyDocument::parse(r#"{"Version":"2012-10-17","Statement":[]}"#).unwrap();
        let b = PolicyDocument::new(json!({ "Statement": [], "Version": "2012-10-17" }));
        assert!(a.semantically_equal(&b));
    }

    #[test]
    fn test_versioning_cannot_return_to_disabled() {
        let desired = VersioningStatus::from_flag(false);
        assert!(desired.satisfied_by(VersioningStatus::Disabled));
        assert!(desired.satisfied_by(VersioningStatus::Suspended));
        assert!(!desired.satisfied_by(VersioningStatus::Enabled));
        assert!(!VersioningStatus::Enabled.satisfied_by(VersioningStatus::Suspended));
    }

    #[test]
    fn test_website_omitted_fields_not_compared() {
        let desired = WebsiteConfig {
            index_suffix: Some("index.html".into()),
            ..Default::default()
        };
        let observed = WebsiteConfig {
            index_suffix: Some("index.html".into()),
            error_key: Some("error.html".into()),
            redirect_all_requests_to: None,
        };
        assert!(desired.satisfied_by(&observed));
        assert_eq!(desired.merged_over(Some(&observed)), observed);
    }

    #[test]
    fn test_website_empty_error_key_clears_document() {
        let desired = WebsiteConfig {
            index_suffix: Some("index.html".into()),
            error_key: Some(String::new()),
            redirect_all_requests_to: None,
        };
        let observed = WebsiteConfig {
            index_suffix: Some("index.html".into()),
            error_key: Some("err.html".into()),
            redirect_all_requests_to: None,
        };
        assert!(!desired.satisfied_by(&observed));

        let written = desired.merged_over(Some(&observed));
        assert_eq!(written.error_key, None);
        assert_eq!(written.index_suffix.as_deref(), Some("index.html"));
        assert!(desired.satisfied_by(&written));
    }

    #[test]
    fn test_declared_kinds() {
        let mut state: DesiredState = ResourceState::new("bucket");
        state.tags = Some(TagMap::new());
        state.set_rules(SubResourceKind::CorsRules, vec![]);
        state.managed_policies = Some(PolicyArnSet::new());
        state.logging = Some(LoggingConfig::default());
        assert_eq!(
            state.declared_kinds(),
            vec![
                SubResourceKind::Tags,
                SubResourceKind::Logging,
                SubResourceKind::ManagedPolicies,
                SubResourceKind::CorsRules
            ]
        );
    }
}
