//! Parsing of observed wire bodies.

use serde_json::Value;

use super::wire::{self, decode_rules};
use crate::error::{Error, Result};
use crate::kind::SubResourceKind;
use crate::model::{
    DhcpOptions, LoggingConfig, ObservedRule, ObservedState, PolicyArnSet, PolicyDocument,
    TagMap, VersioningStatus, WebsiteConfig,
};

/// One parsed sub-resource of an observed resource.
#[derive(Debug, Clone)]
pub enum ObservedFacet {
    Existence(bool),
    Versioning(VersioningStatus),
    RequesterPays(bool),
    Policy(Option<PolicyDocument>),
    Tags(TagMap),
    Website(Option<WebsiteConfig>),
    /// `None` while logging is disabled.
    Logging(Option<LoggingConfig>),
    DhcpOptions(Option<DhcpOptions>),
    AssumeRolePolicy(Option<PolicyDocument>),
    ManagedPolicies(PolicyArnSet),
    Rules(SubResourceKind, Vec<ObservedRule>),
}

impl ObservedFacet {
    pub fn kind(&self) -> SubResourceKind {
        match self {
            ObservedFacet::Existence(_) => SubResourceKind::Resource,
            ObservedFacet::Versioning(_) => SubResourceKind::Versioning,
            ObservedFacet::RequesterPays(_) => SubResourceKind::RequesterPays,
            ObservedFacet::Policy(_) => SubResourceKind::Policy,
            ObservedFacet::Tags(_) => SubResourceKind::Tags,
            ObservedFacet::Website(_) => SubResourceKind::Website,
            ObservedFacet::Logging(_) => SubResourceKind::Logging,
            ObservedFacet::DhcpOptions(_) => SubResourceKind::DhcpOptions,
            ObservedFacet::AssumeRolePolicy(_) => SubResourceKind::AssumeRolePolicy,
            ObservedFacet::ManagedPolicies(_) => SubResourceKind::ManagedPolicies,
            ObservedFacet::Rules(kind, _) => *kind,
        }
    }

    /// The facet reported for a sub-resource the remote does not have.
    pub fn missing(kind: SubResourceKind) -> Self {
        match kind {
            SubResourceKind::Resource => ObservedFacet::Existence(false),
            SubResourceKind::Versioning => ObservedFacet::Versioning(VersioningStatus::Disabled),
            SubResourceKind::RequesterPays => ObservedFacet::RequesterPays(false),
            SubResourceKind::Policy => ObservedFacet::Policy(None),
            SubResourceKind::Tags => ObservedFacet::Tags(TagMap::new()),
            SubResourceKind::Website => ObservedFacet::Website(None),
            SubResourceKind::Logging => ObservedFacet::Logging(None),
            SubResourceKind::DhcpOptions => ObservedFacet::DhcpOptions(None),
            SubResourceKind::AssumeRolePolicy => ObservedFacet::AssumeRolePolicy(None),
            SubResourceKind::ManagedPolicies => ObservedFacet::ManagedPolicies(PolicyArnSet::new()),
            rules => ObservedFacet::Rules(rules, Vec::new()),
        }
    }

    /// Whether there is nothing left to delete.
    pub fn is_empty(&self) -> bool {
        match self {
            ObservedFacet::Existence(exists) => !exists,
            ObservedFacet::Versioning(status) => !status.is_enabled(),
            ObservedFacet::RequesterPays(enabled) => !enabled,
            ObservedFacet::Policy(doc) => doc.is_none(),
            ObservedFacet::Tags(tags) => tags.is_empty(),
            ObservedFacet::Website(config) => config.is_none(),
            ObservedFacet::Logging(config) => config.is_none(),
            ObservedFacet::DhcpOptions(options) => options.is_none(),
            ObservedFacet::AssumeRolePolicy(doc) => doc.is_none(),
            ObservedFacet::ManagedPolicies(arns) => arns.is_empty(),
            ObservedFacet::Rules(_, rules) => rules.is_empty(),
        }
    }
}

impl ObservedState {
    /// Fold a parsed facet into this state, replacing what was there.
    pub fn absorb(&mut self, facet: ObservedFacet) {
        match facet {
            ObservedFacet::Existence(exists) => self.exists = Some(exists),
            ObservedFacet::Versioning(status) => self.versioning = Some(status),
            ObservedFacet::RequesterPays(enabled) => self.requester_pays = Some(enabled),
            ObservedFacet::Policy(doc) => self.policy = doc,
            ObservedFacet::Tags(tags) => self.tags = Some(tags),
            ObservedFacet::Website(config) => self.website = config,
            ObservedFacet::Logging(config) => self.logging = config,
            ObservedFacet::DhcpOptions(options) => self.dhcp_options = options,
            ObservedFacet::AssumeRolePolicy(doc) => self.assume_role_policy = doc,
            ObservedFacet::ManagedPolicies(arns) => self.managed_policies = Some(arns),
            ObservedFacet::Rules(kind, rules) => self.set_rules(kind, rules),
        }
    }
}

/// Parse the raw wire body of one sub-resource kind.
///
/// Unexpected shapes are reported as [`Error::MalformedState`]; nothing is
/// defaulted silently.
pub fn parse_observed(kind: SubResourceKind, raw: &Value) -> Result<ObservedFacet> {
    if !raw.is_object() {
        return Err(Error::malformed(kind, format!("expected an object, got {}", raw)));
    }
    match kind {
        SubResourceKind::Resource => match raw.get("Exists") {
            None => Ok(ObservedFacet::Existence(true)),
            Some(Value::Bool(exists)) => Ok(ObservedFacet::Existence(*exists)),
            Some(other) => Err(Error::malformed(kind, format!("Exists must be a bool, got {}", other))),
        },
        SubResourceKind::Versioning => parse_versioning(raw).map(ObservedFacet::Versioning),
        SubResourceKind::RequesterPays => {
            match raw.get("Payer").and_then(Value::as_str) {
                Some("Requester") => Ok(ObservedFacet::RequesterPays(true)),
                Some("BucketOwner") => Ok(ObservedFacet::RequesterPays(false)),
                _ => Err(Error::malformed(kind, "Payer must be Requester or BucketOwner")),
            }
        }
        SubResourceKind::Policy => {
            parse_document(kind, raw, "Policy").map(|doc| ObservedFacet::Policy(Some(doc)))
        }
        SubResourceKind::Tags => parse_tags(raw).map(ObservedFacet::Tags),
        SubResourceKind::Website => parse_website(raw).map(|c| ObservedFacet::Website(Some(c))),
        SubResourceKind::Logging => parse_logging(raw).map(ObservedFacet::Logging),
        SubResourceKind::DhcpOptions => {
            parse_dhcp_options(raw).map(|o| ObservedFacet::DhcpOptions(Some(o)))
        }
        SubResourceKind::AssumeRolePolicy => parse_document(kind, raw, "AssumeRolePolicyDocument")
            .map(|doc| ObservedFacet::AssumeRolePolicy(Some(doc))),
        SubResourceKind::ManagedPolicies => {
            parse_attached_policies(raw).map(ObservedFacet::ManagedPolicies)
        }
        rules => decode_rules(rules, raw).map(|r| ObservedFacet::Rules(rules, r)),
    }
}

fn parse_versioning(raw: &Value) -> Result<VersioningStatus> {
    match raw.get("Status") {
        None | Some(Value::Null) => Ok(VersioningStatus::Disabled),
        Some(Value::String(s)) if s == "Enabled" => Ok(VersioningStatus::Enabled),
        Some(Value::String(s)) if s == "Suspended" => Ok(VersioningStatus::Suspended),
        Some(other) => Err(Error::malformed(
            SubResourceKind::Versioning,
            format!("unknown versioning status {}", other),
        )),
    }
}

fn parse_document(kind: SubResourceKind, raw: &Value, key: &str) -> Result<PolicyDocument> {
    match raw.get(key) {
        // The remote usually returns the document as an escaped string.
        Some(Value::String(text)) => PolicyDocument::parse(text)
            .map_err(|e| Error::malformed(kind, format!("{} is not valid JSON: {}", key, e))),
        Some(doc @ Value::Object(_)) => Ok(PolicyDocument::new(doc.clone())),
        _ => Err(Error::malformed(kind, format!("missing {} document", key))),
    }
}

fn parse_tags(raw: &Value) -> Result<TagMap> {
    let kind = SubResourceKind::Tags;
    let set = raw
        .get("TagSet")
        .and_then(Value::as_array)
        .ok_or_else(|| Error::malformed(kind, "expected a TagSet array"))?;
    let mut tags = TagMap::new();
    for tag in set {
        let key = tag.get("Key").and_then(Value::as_str);
        let value = tag.get("Value").and_then(Value::as_str);
        let (Some(key), Some(value)) = (key, value) else {
            return Err(Error::malformed(kind, format!("invalid tag {}", tag)));
        };
        if tags.insert(key.to_string(), value.to_string()).is_some() {
            return Err(Error::malformed(kind, format!("duplicate tag key {}", key)));
        }
    }
    Ok(tags)
}

fn nested_text(kind: SubResourceKind, raw: &Value, outer: &str, inner: &str) -> Result<Option<String>> {
    match raw.get(outer) {
        None | Some(Value::Null) => Ok(None),
        Some(obj) => obj
            .get(inner)
            .and_then(Value::as_str)
            .map(|s| Some(s.to_string()))
            .ok_or_else(|| Error::malformed(kind, format!("{}.{} must be a string", outer, inner))),
    }
}

fn parse_website(raw: &Value) -> Result<WebsiteConfig> {
    let kind = SubResourceKind::Website;
    Ok(WebsiteConfig {
        index_suffix: nested_text(kind, raw, "IndexDocument", "Suffix")?,
        error_key: nested_text(kind, raw, "ErrorDocument", "Key")?,
        redirect_all_requests_to: nested_text(kind, raw, "RedirectAllRequestsTo", "HostName")?,
    })
}

fn parse_logging(raw: &Value) -> Result<Option<LoggingConfig>> {
    let kind = SubResourceKind::Logging;
    let enabled = match raw.get("LoggingEnabled") {
        None | Some(Value::Null) => return Ok(None),
        Some(enabled) => enabled,
    };
    let target_bucket = enabled
        .get("TargetBucket")
        .and_then(Value::as_str)
        .ok_or_else(|| Error::malformed(kind, "LoggingEnabled.TargetBucket must be a string"))?;
    let target_prefix = match enabled.get("TargetPrefix") {
        None | Some(Value::Null) => "",
        Some(Value::String(prefix)) => prefix,
        Some(other) => {
            return Err(Error::malformed(
                kind,
                format!("LoggingEnabled.TargetPrefix must be a string, got {}", other),
            ));
        }
    };
    Ok(Some(LoggingConfig {
        target_bucket: target_bucket.to_string(),
        target_prefix: target_prefix.to_string(),
    }))
}

fn parse_attached_policies(raw: &Value) -> Result<PolicyArnSet> {
    let kind = SubResourceKind::ManagedPolicies;
    let attached = raw
        .get("AttachedPolicies")
        .and_then(Value::as_array)
        .ok_or_else(|| Error::malformed(kind, "expected an AttachedPolicies array"))?;
    let mut arns = PolicyArnSet::new();
    for policy in attached {
        let arn = policy
            .get("PolicyArn")
            .and_then(Value::as_str)
            .ok_or_else(|| Error::malformed(kind, format!("attached policy without PolicyArn: {}", policy)))?;
        if !arns.insert(arn.to_string()) {
            return Err(Error::malformed(kind, format!("policy {} attached twice", arn)));
        }
    }
    Ok(arns)
}

fn parse_dhcp_options(raw: &Value) -> Result<DhcpOptions> {
    let kind = SubResourceKind::DhcpOptions;
    let configs = raw
        .get("DhcpConfigurations")
        .and_then(Value::as_array)
        .ok_or_else(|| Error::malformed(kind, "expected a DhcpConfigurations array"))?;

    let mut options = DhcpOptions::default();
    for config in configs {
        let key = config
            .get("Key")
            .and_then(Value::as_str)
            .ok_or_else(|| Error::malformed(kind, format!("configuration without Key: {}", config)))?;
        let values = config
            .get("Values")
            .and_then(Value::as_array)
            .ok_or_else(|| Error::malformed(kind, format!("{} has no Values", key)))?
            .iter()
            .map(|v| match v {
                Value::String(s) => Ok(s.clone()),
                other => other
                    .get("Value")
                    .and_then(Value::as_str)
                    .map(str::to_string)
                    .ok_or_else(|| Error::malformed(kind, format!("bad value for {}", key))),
            })
            .collect::<Result<Vec<String>>>()?;

        match key {
            wire::DHCP_DOMAIN_NAME => options.domain_name = Some(values.join(" ")),
            wire::DHCP_DOMAIN_NAME_SERVERS => options.domain_name_servers = Some(values),
            wire::DHCP_NTP_SERVERS => options.ntp_servers = Some(values),
            wire::DHCP_NETBIOS_NAME_SERVERS => options.netbios_name_servers = Some(values),
            wire::DHCP_NETBIOS_NODE_TYPE => {
                let node_type = values
                    .first()
                    .and_then(|v| v.parse::<u8>().ok())
                    .ok_or_else(|| Error::malformed(kind, "netbios-node-type must be a number"))?;
                options.netbios_node_type = Some(node_type);
            }
            // Options this engine does not manage are left alone.
            _ => {}
        }
    }
    Ok(options)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_tags() {
        let facet = parse_observed(
            SubResourceKind::Tags,
            &json!({ "TagSet": [{ "Key": "env", "Value": "prod" }] }),
        )
        .unwrap();
        let ObservedFacet::Tags(tags) = facet else {
            panic!("expected tags");
        };
        assert_eq!(tags.get("env").map(String::as_str), Some("prod"));
    }

    #[test]
    fn test_duplicate_tag_is_malformed() {
        let raw = json!({ "TagSet": [
            { "Key": "env", "Value": "a" },
            { "Key": "env", "Value": "b" }
        ] });
        assert!(matches!(
            parse_observed(SubResourceKind::Tags, &raw),
            Err(Error::MalformedState { .. })
        ));
    }

    #[test]
    fn test_policy_string_and_object_agree() {
        let a = parse_observed(
            SubResourceKind::Policy,
            &json!({ "Policy": "{\"Version\": \"2012-10-17\"}" }),
        )
        .unwrap();
        let b = parse_observed(
            SubResourceKind::Policy,
            &json!({ "Policy": { "Version": "2012-10-17" } }),
        )
        .unwrap();
        match (a, b) {
            (ObservedFacet::Policy(Some(a)), ObservedFacet::Policy(Some(b))) => {
                assert!(a.semantically_equal(&b))
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_parse_logging() {
        let facet = parse_observed(
            SubResourceKind::Logging,
            &json!({ "LoggingEnabled": { "TargetBucket": "logs" } }),
        )
        .unwrap();
        let ObservedFacet::Logging(Some(config)) = facet else {
            panic!("expected logging");
        };
        assert_eq!(config.target_bucket, "logs");
        assert_eq!(config.target_prefix, "");

        let disabled = parse_observed(SubResourceKind::Logging, &json!({})).unwrap();
        assert!(disabled.is_empty());
        assert!(
            parse_observed(
                SubResourceKind::Logging,
                &json!({ "LoggingEnabled": { "TargetPrefix": "x/" } })
            )
            .is_err()
        );
    }

    #[test]
    fn test_parse_role_facets() {
        let trust = parse_observed(
            SubResourceKind::AssumeRolePolicy,
            &json!({ "AssumeRolePolicyDocument": "{\"Version\": \"2012-10-17\"}" }),
        )
        .unwrap();
        assert!(matches!(trust, ObservedFacet::AssumeRolePolicy(Some(_))));

        let attached = parse_observed(
            SubResourceKind::ManagedPolicies,
            &json!({ "AttachedPolicies": [
                { "PolicyName": "ReadOnlyAccess", "PolicyArn": "arn:aws:iam::aws:policy/ReadOnlyAccess" }
            ] }),
        )
        .unwrap();
        let ObservedFacet::ManagedPolicies(arns) = attached else {
            panic!("expected managed policies");
        };
        assert!(arns.contains("arn:aws:iam::aws:policy/ReadOnlyAccess"));

        let twice = json!({ "AttachedPolicies": [
            { "PolicyArn": "arn:aws:iam::aws:policy/A" },
            { "PolicyArn": "arn:aws:iam::aws:policy/A" }
        ] });
        assert!(parse_observed(SubResourceKind::ManagedPolicies, &twice).is_err());
    }

    #[test]
    fn test_versioning_without_status_is_disabled() {
        let facet = parse_observed(SubResourceKind::Versioning, &json!({})).unwrap();
        assert!(matches!(
            facet,
            ObservedFacet::Versioning(VersioningStatus::Disabled)
        ));
        assert!(parse_observed(SubResourceKind::Versioning, &json!({ "Status": "On" })).is_err());
    }

    #[test]
    fn test_parse_dhcp_options_both_value_shapes() {
        let raw = json!({ "DhcpConfigurations": [
            { "Key": "domain-name", "Values": [{ "Value": "corp.example" }] },
            { "Key": "domain-name-servers", "Values": ["10.0.0.2", "10.0.0.3"] },
            { "Key": "netbios-node-type", "Values": [{ "Value": "2" }] }
        ] });
        let ObservedFacet::DhcpOptions(Some(options)) =
            parse_observed(SubResourceKind::DhcpOptions, &raw).unwrap()
        else {
            panic!("expected dhcp options");
        };
        assert_eq!(options.domain_name.as_deref(), Some("corp.example"));
        assert_eq!(
            options.domain_name_servers,
            Some(vec!["10.0.0.2".to_string(), "10.0.0.3".to_string()])
        );
        assert_eq!(options.netbios_node_type, Some(2));
        assert!(options.ntp_servers.is_none());
    }

    #[test]
    fn test_non_object_is_malformed() {
        for kind in SubResourceKind::ALL {
            assert!(parse_observed(kind, &json!([1, 2])).is_err(), "{}", kind);
        }
    }

    #[test]
    fn test_rules_require_collection() {
        assert!(parse_observed(SubResourceKind::CorsRules, &json!({ "Rules": [] })).is_err());
        let facet = parse_observed(SubResourceKind::CorsRules, &json!({ "CORSRules": [] })).unwrap();
        assert!(facet.is_empty());
    }

    #[test]
    fn test_absorb_overwrites_facet() {
        let mut state = ObservedState::new("bucket");
        state.absorb(ObservedFacet::Tags(TagMap::from([("a".into(), "1".into())])));
        state.absorb(ObservedFacet::missing(SubResourceKind::Tags));
        assert_eq!(state.tags, Some(TagMap::new()));
    }
}
