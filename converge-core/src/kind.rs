//! Sub-resource kinds.

use std::fmt;

use serde::{Deserialize, Serialize};

/// A named configurable facet of a cloud resource.
///
/// `Resource` stands for the existence of the resource itself; every other
/// kind is fetched and mutated independently.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubResourceKind {
    Resource,
    Versioning,
    RequesterPays,
    Policy,
    Tags,
    Website,
    Logging,
    DhcpOptions,
    /// Trust policy of an IAM role.
    AssumeRolePolicy,
    /// Managed policies attached to an IAM role.
    ManagedPolicies,
    LifecycleRules,
    CorsRules,
    RoutingRules,
}

impl SubResourceKind {
    /// Every kind, in the order the driver fetches and converges them.
    pub const ALL: [SubResourceKind; 13] = [
        SubResourceKind::Resource,
        SubResourceKind::Versioning,
        SubResourceKind::RequesterPays,
        SubResourceKind::Policy,
        SubResourceKind::Tags,
        SubResourceKind::Website,
        SubResourceKind::Logging,
        SubResourceKind::DhcpOptions,
        SubResourceKind::AssumeRolePolicy,
        SubResourceKind::ManagedPolicies,
        SubResourceKind::LifecycleRules,
        SubResourceKind::CorsRules,
        SubResourceKind::RoutingRules,
    ];

    /// Kinds that hold a list of rules.
    pub const RULE_COLLECTIONS: [SubResourceKind; 3] = [
        SubResourceKind::LifecycleRules,
        SubResourceKind::CorsRules,
        SubResourceKind::RoutingRules,
    ];

    pub fn is_rule_collection(self) -> bool {
        Self::RULE_COLLECTIONS.contains(&self)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            SubResourceKind::Resource => "resource",
            SubResourceKind::Versioning => "versioning",
            SubResourceKind::RequesterPays => "requester_pays",
            SubResourceKind::Policy => "policy",
            SubResourceKind::Tags => "tags",
            SubResourceKind::Website => "website",
            SubResourceKind::Logging => "logging",
            SubResourceKind::DhcpOptions => "dhcp_options",
            SubResourceKind::AssumeRolePolicy => "assume_role_policy",
            SubResourceKind::ManagedPolicies => "managed_policies",
            SubResourceKind::LifecycleRules => "lifecycle_rules",
            SubResourceKind::CorsRules => "cors_rules",
            SubResourceKind::RoutingRules => "routing_rules",
        }
    }
}

impl fmt::Display for SubResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for SubResourceKind {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|k| k.as_str() == s.replace('-', "_"))
            .ok_or_else(|| format!("unknown sub-resource kind: {}", s))
    }
}
