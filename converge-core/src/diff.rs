//! Diff engine: decides what has to change for each facet of a resource.
//!
//! Everything here is a pure function of the desired and observed states.

use tracing::debug;

use crate::error::Result;
use crate::kind::SubResourceKind;
use crate::matcher::{RulePair, match_rules};
use crate::model::{
    DesiredRule, DesiredState, DhcpOptions, LoggingConfig, ObservedRule, ObservedState, Payload,
    PolicyArnSet, PolicyDocument, TagMap, VersioningStatus, WebsiteConfig,
};
use crate::policy::{PolicyTable, RuleTypePolicy, TagSemantics};

/// Decision for one rule slot.
#[derive(Debug, Clone)]
pub enum RuleDecision {
    Keep {
        desired: DesiredRule,
        observed: ObservedRule,
    },
    Replace {
        desired: DesiredRule,
        observed: ObservedRule,
    },
    Create {
        desired: DesiredRule,
    },
    Delete {
        observed: ObservedRule,
    },
}

impl RuleDecision {
    pub fn label(&self) -> &'static str {
        match self {
            RuleDecision::Keep { .. } => "keep",
            RuleDecision::Replace { .. } => "replace",
            RuleDecision::Create { .. } => "create",
            RuleDecision::Delete { .. } => "delete",
        }
    }

    pub fn is_keep(&self) -> bool {
        matches!(self, RuleDecision::Keep { .. })
    }

    /// The rule as it will exist remotely after this decision, or `None`
    /// for a delete.
    ///
    /// A desired rule without an id inherits the id of its observed match.
    /// Create-only default fields are written on create; an existing rule
    /// keeps whatever value it holds for them, including none.
    pub fn written_rule(&self) -> Option<ObservedRule> {
        match self {
            RuleDecision::Keep { desired, observed } | RuleDecision::Replace { desired, observed } => {
                Some(ObservedRule {
                    id: desired.id.clone().or_else(|| observed.id.clone()),
                    payload: written_payload(desired, Some(&observed.payload)),
                })
            }
            RuleDecision::Create { desired } => Some(ObservedRule {
                id: desired.id.clone(),
                payload: written_payload(desired, None),
            }),
            RuleDecision::Delete { .. } => None,
        }
    }
}

fn written_payload(desired: &DesiredRule, observed: Option<&Payload>) -> Payload {
    let mut payload = desired.payload.clone();
    for (field, default) in desired.defaults.fields() {
        if payload.contains(field) {
            continue;
        }
        let value = match observed {
            Some(observed) => observed.get(field),
            None => Some(default),
        };
        if let Some(value) = value {
            payload.insert(field, value.clone());
        }
    }
    payload
}

/// Whether an observed rule already satisfies a desired rule.
///
/// Fields the user omitted and normalization filled as create-only
/// defaults are not compared. An explicit desired id must be the observed
/// one.
pub fn rule_satisfied(desired: &DesiredRule, observed: &ObservedRule) -> bool {
    if desired.id.is_some() && desired.id != observed.id {
        return false;
    }
    let mut relevant = Payload::new();
    for (field, value) in observed.payload.fields() {
        if desired.payload.contains(field) || !desired.defaults.contains(field) {
            relevant.insert(field, value.clone());
        }
    }
    desired.payload.structurally_equal(&relevant)
}

/// Per-rule decisions for one rule collection.
#[derive(Debug, Clone)]
pub struct Changeset {
    pub kind: SubResourceKind,
    /// KEEP/REPLACE/CREATE in desired order, then DELETE in observed order.
    pub decisions: Vec<RuleDecision>,
    pub changed: bool,
    /// Matched rules appear in a different order than desired.
    pub reordered: bool,
}

impl Changeset {
    /// Changeset removing every observed rule.
    pub fn delete_all(kind: SubResourceKind, observed: &[ObservedRule]) -> Self {
        Self {
            kind,
            decisions: observed
                .iter()
                .map(|o| RuleDecision::Delete {
                    observed: o.clone(),
                })
                .collect(),
            changed: !observed.is_empty(),
            reordered: false,
        }
    }

    /// The complete collection after applying this changeset, in desired
    /// order.
    pub fn written_rules(&self) -> Vec<ObservedRule> {
        self.decisions
            .iter()
            .filter_map(RuleDecision::written_rule)
            .collect()
    }

    pub fn count(&self, label: &str) -> usize {
        self.decisions.iter().filter(|d| d.label() == label).count()
    }
}

/// Decide KEEP/REPLACE/CREATE/DELETE for every matched pair.
pub fn diff_rules(kind: SubResourceKind, policy: &RuleTypePolicy, pairs: Vec<RulePair>) -> Changeset {
    let mut decisions = Vec::with_capacity(pairs.len());
    let mut matched_indices = Vec::new();

    for pair in pairs {
        let decision = match (pair.desired, pair.observed) {
            (Some(desired), Some(observed)) => {
                if let Some(i) = pair.observed_index {
                    matched_indices.push(i);
                }
                if rule_satisfied(&desired, &observed) {
                    RuleDecision::Keep { desired, observed }
                } else {
                    RuleDecision::Replace { desired, observed }
                }
            }
            (Some(desired), None) => RuleDecision::Create { desired },
            (None, Some(observed)) => RuleDecision::Delete { observed },
            (None, None) => continue,
        };
        decisions.push(decision);
    }

    let reordered = policy.order_significant && matched_indices.windows(2).any(|w| w[0] >= w[1]);
    let changed = reordered || decisions.iter().any(|d| !d.is_keep());

    debug!(
        %kind,
        decisions = decisions.len(),
        changed,
        reordered,
        "Computed rule changeset"
    );

    Changeset {
        kind,
        decisions,
        changed,
        reordered,
    }
}

/// Tag changes under merge or replace semantics.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TagChange {
    /// Tag map to write.
    pub final_tags: TagMap,
    pub changed: bool,
}

pub fn diff_tags(desired: &TagMap, observed: &TagMap, semantics: TagSemantics) -> TagChange {
    let final_tags = match semantics {
        TagSemantics::Replace => desired.clone(),
        TagSemantics::Merge => {
            let mut merged = observed.clone();
            merged.extend(desired.iter().map(|(k, v)| (k.clone(), v.clone())));
            merged
        }
    };
    let changed = final_tags != *observed;
    TagChange {
        final_tags,
        changed,
    }
}

/// An unfetched versioning status counts as never configured.
pub fn diff_versioning(
    desired: Option<VersioningStatus>,
    observed: Option<VersioningStatus>,
) -> Option<VersioningStatus> {
    let desired = desired?;
    let observed = observed.unwrap_or(VersioningStatus::Disabled);
    (!desired.satisfied_by(observed)).then_some(desired)
}

pub fn diff_requester_pays(desired: Option<bool>, observed: Option<bool>) -> Option<bool> {
    let desired = desired?;
    (desired != observed.unwrap_or(false)).then_some(desired)
}

pub fn diff_policy(
    desired: Option<&PolicyDocument>,
    observed: Option<&PolicyDocument>,
) -> Option<PolicyDocument> {
    let desired = desired?;
    match observed {
        Some(observed) if desired.semantically_equal(observed) => None,
        _ => Some(desired.clone()),
    }
}

pub fn diff_website(
    desired: Option<&WebsiteConfig>,
    observed: Option<&WebsiteConfig>,
) -> Option<WebsiteConfig> {
    let desired = desired?;
    match observed {
        Some(observed) if desired.satisfied_by(observed) => None,
        _ => Some(desired.merged_over(observed)),
    }
}

pub fn diff_dhcp_options(
    desired: Option<&DhcpOptions>,
    observed: Option<&DhcpOptions>,
) -> Option<DhcpOptions> {
    let desired = desired?;
    match observed {
        Some(observed) if desired.satisfied_by(observed) => None,
        _ => Some(desired.merged_over(observed)),
    }
}

pub fn diff_logging(
    desired: Option<&LoggingConfig>,
    observed: Option<&LoggingConfig>,
) -> Option<LoggingConfig> {
    let desired = desired?;
    (observed != Some(desired)).then(|| desired.clone())
}

/// Attach and detach calls that leave exactly the desired policies attached.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PolicyAttachmentChange {
    pub attach: Vec<String>,
    pub detach: Vec<String>,
}

impl PolicyAttachmentChange {
    pub fn is_empty(&self) -> bool {
        self.attach.is_empty() && self.detach.is_empty()
    }
}

/// Managed policies are a full-replace set: unlisted ones are detached.
pub fn diff_managed_policies(
    desired: Option<&PolicyArnSet>,
    observed: Option<&PolicyArnSet>,
) -> Option<PolicyAttachmentChange> {
    let desired = desired?;
    let empty = PolicyArnSet::new();
    let observed = observed.unwrap_or(&empty);
    let change = PolicyAttachmentChange {
        attach: desired.difference(observed).cloned().collect(),
        detach: observed.difference(desired).cloned().collect(),
    };
    (!change.is_empty()).then_some(change)
}

/// All facet changes for one resource.
#[derive(Debug, Clone)]
pub struct Plan {
    pub resource: String,
    pub create_resource: bool,
    pub versioning: Option<VersioningStatus>,
    pub requester_pays: Option<bool>,
    pub policy: Option<PolicyDocument>,
    /// Present only when the tags differ.
    pub tags: Option<TagChange>,
    pub website: Option<WebsiteConfig>,
    pub logging: Option<LoggingConfig>,
    pub dhcp_options: Option<DhcpOptions>,
    pub assume_role_policy: Option<PolicyDocument>,
    pub managed_policies: Option<PolicyAttachmentChange>,
    /// One changeset per declared rule kind, changed or not.
    pub rules: Vec<Changeset>,
}

impl Plan {
    pub fn changed(&self) -> bool {
        self.create_resource
            || self.versioning.is_some()
            || self.requester_pays.is_some()
            || self.policy.is_some()
            || self.tags.is_some()
            || self.website.is_some()
            || self.logging.is_some()
            || self.dhcp_options.is_some()
            || self.assume_role_policy.is_some()
            || self.managed_policies.is_some()
            || self.rules.iter().any(|c| c.changed)
    }

    pub fn changeset(&self, kind: SubResourceKind) -> Option<&Changeset> {
        self.rules.iter().find(|c| c.kind == kind)
    }
}

/// Diff a desired state against an observed state.
///
/// Fails with [`crate::Error::AmbiguousMatch`] or
/// [`crate::Error::InvalidConfig`] before anything is decided, so a failed
/// plan never leads to mutations.
pub fn plan(desired: &DesiredState, observed: &ObservedState, policies: &PolicyTable) -> Result<Plan> {
    let create_resource = desired.exists == Some(true) && observed.exists != Some(true);

    let tags = desired.tags.as_ref().and_then(|tags| {
        let empty = TagMap::new();
        let change = diff_tags(
            tags,
            observed.tags.as_ref().unwrap_or(&empty),
            policies.tag_semantics(),
        );
        change.changed.then_some(change)
    });

    let mut rules = Vec::new();
    for (&kind, desired_rules) in &desired.rules {
        let policy = policies.get(kind);
        policy.validate(kind)?;
        let observed_rules = observed.rules(kind).unwrap_or(&[]);
        let pairs = match_rules(kind, policy, desired_rules, observed_rules)?;
        rules.push(diff_rules(kind, policy, pairs));
    }

    Ok(Plan {
        resource: desired.name.clone(),
        create_resource,
        versioning: diff_versioning(desired.versioning, observed.versioning),
        requester_pays: diff_requester_pays(desired.requester_pays, observed.requester_pays),
        policy: diff_policy(desired.policy.as_ref(), observed.policy.as_ref()),
        tags,
        website: diff_website(desired.website.as_ref(), observed.website.as_ref()),
        logging: diff_logging(desired.logging.as_ref(), observed.logging.as_ref()),
        dhcp_options: diff_dhcp_options(desired.dhcp_options.as_ref(), observed.dhcp_options.as_ref()),
        assume_role_policy: diff_policy(
            desired.assume_role_policy.as_ref(),
            observed.assume_role_policy.as_ref(),
        ),
        managed_policies: diff_managed_policies(
            desired.managed_policies.as_ref(),
            observed.managed_policies.as_ref(),
        ),
        rules,
    })
}
