//! Turns a [`Plan`] into remote mutations and issues them.

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tracing::{info, warn};

use crate::descriptor::{ObservedFacet, wire};
use crate::diff::{Changeset, Plan, RuleDecision};
use crate::error::{Error, Result};
use crate::kind::SubResourceKind;
use crate::model::VersioningStatus;
use crate::policy::PolicyTable;
use crate::remote::{Mutation, StateMutator, with_deadline};

/// One mutation call together with the kind it targets.
#[derive(Debug, Clone, PartialEq)]
pub struct PlannedMutation {
    pub kind: SubResourceKind,
    pub mutation: Mutation,
}

impl PlannedMutation {
    fn new(kind: SubResourceKind, mutation: Mutation) -> Self {
        Self { kind, mutation }
    }
}

/// Mutations issued before a failure stopped convergence.
#[derive(Debug, Error)]
#[error("stopped after {applied} mutation(s): {source}")]
pub struct PartialConvergence {
    pub applied: usize,
    #[source]
    pub source: Error,
}

/// Translate a plan into mutation calls.
///
/// Resource creation comes first, then one call per differing facet in
/// kind order. Rule collections are written whole or rule by rule depending
/// on the kind's policy.
pub fn plan_mutations(plan: &Plan, policies: &PolicyTable) -> Result<Vec<PlannedMutation>> {
    let mut out = Vec::new();

    if plan.create_resource {
        out.push(PlannedMutation::new(
            SubResourceKind::Resource,
            Mutation::CreateResource,
        ));
    }
    if let Some(status) = plan.versioning {
        out.push(PlannedMutation::new(
            SubResourceKind::Versioning,
            Mutation::SetVersioning { status },
        ));
    }
    if let Some(enabled) = plan.requester_pays {
        out.push(PlannedMutation::new(
            SubResourceKind::RequesterPays,
            Mutation::SetRequesterPays { enabled },
        ));
    }
    if let Some(policy) = &plan.policy {
        out.push(PlannedMutation::new(
            SubResourceKind::Policy,
            Mutation::PutPolicy {
                document: policy.as_value().clone(),
            },
        ));
    }
    if let Some(change) = &plan.tags {
        let mutation = if change.final_tags.is_empty() {
            Mutation::DeleteTags
        } else {
            Mutation::PutTags {
                tags: change.final_tags.clone(),
            }
        };
        out.push(PlannedMutation::new(SubResourceKind::Tags, mutation));
    }
    if let Some(config) = &plan.website {
        out.push(PlannedMutation::new(
            SubResourceKind::Website,
            Mutation::PutWebsite {
                config: config.clone(),
            },
        ));
    }
    if let Some(config) = &plan.logging {
        out.push(PlannedMutation::new(
            SubResourceKind::Logging,
            Mutation::PutLogging {
                config: config.clone(),
            },
        ));
    }
    if let Some(options) = &plan.dhcp_options {
        out.push(PlannedMutation::new(
            SubResourceKind::DhcpOptions,
            Mutation::PutDhcpOptions {
                options: options.clone(),
            },
        ));
    }
    if let Some(document) = &plan.assume_role_policy {
        out.push(PlannedMutation::new(
            SubResourceKind::AssumeRolePolicy,
            Mutation::PutAssumeRolePolicy {
                document: document.as_value().clone(),
            },
        ));
    }
    if let Some(change) = &plan.managed_policies {
        // Attachments come before detachments.
        let attach = change.attach.iter().map(|arn| Mutation::AttachPolicy { arn: arn.clone() });
        let detach = change.detach.iter().map(|arn| Mutation::DetachPolicy { arn: arn.clone() });
        out.extend(
            attach
                .chain(detach)
                .map(|m| PlannedMutation::new(SubResourceKind::ManagedPolicies, m)),
        );
    }

    for changeset in plan.rules.iter().filter(|c| c.changed) {
        if policies.get(changeset.kind).replace_whole_collection {
            out.push(whole_collection(changeset)?);
        } else {
            out.extend(per_item(changeset)?);
        }
    }

    Ok(out)
}

/// Mutations that remove everything an observed facet holds.
///
/// An empty facet needs no call. Versioning cannot be removed once enabled,
/// so it is suspended instead. A role's trust policy only goes away with
/// the role.
pub fn removal_mutations(
    facet: &ObservedFacet,
    policies: &PolicyTable,
) -> Result<Vec<PlannedMutation>> {
    if facet.is_empty() {
        return Ok(Vec::new());
    }
    let mutation = match facet {
        ObservedFacet::Existence(_) => {
            return Err(Error::invalid(
                "the resource itself is removed as a whole, not as a sub-resource",
            ));
        }
        ObservedFacet::AssumeRolePolicy(_) => {
            return Err(Error::invalid(
                "a role's assume-role policy is removed together with the role",
            ));
        }
        ObservedFacet::ManagedPolicies(arns) => {
            return Ok(arns
                .iter()
                .map(|arn| {
                    PlannedMutation::new(
                        SubResourceKind::ManagedPolicies,
                        Mutation::DetachPolicy { arn: arn.clone() },
                    )
                })
                .collect());
        }
        ObservedFacet::Versioning(_) => Mutation::SetVersioning {
            status: VersioningStatus::Suspended,
        },
        ObservedFacet::RequesterPays(_) => Mutation::SetRequesterPays { enabled: false },
        ObservedFacet::Policy(_) => Mutation::DeletePolicy,
        ObservedFacet::Tags(_) => Mutation::DeleteTags,
        ObservedFacet::Website(_) => Mutation::DeleteWebsite,
        ObservedFacet::Logging(_) => Mutation::DeleteLogging,
        ObservedFacet::DhcpOptions(_) => Mutation::DeleteDhcpOptions,
        ObservedFacet::Rules(kind, rules) => {
            let changeset = Changeset::delete_all(*kind, rules);
            return if policies.get(*kind).replace_whole_collection {
                Ok(vec![whole_collection(&changeset)?])
            } else {
                per_item(&changeset)
            };
        }
    };
    Ok(vec![PlannedMutation::new(facet.kind(), mutation)])
}

fn whole_collection(changeset: &Changeset) -> Result<PlannedMutation> {
    let rules = changeset
        .written_rules()
        .iter()
        .map(|rule| wire::encode_rule_for(changeset.kind, rule))
        .collect::<Result<Vec<_>>>()?;
    let mutation = if rules.is_empty() {
        Mutation::DeleteRules
    } else {
        Mutation::ReplaceRules { rules }
    };
    Ok(PlannedMutation::new(changeset.kind, mutation))
}

fn per_item(changeset: &Changeset) -> Result<Vec<PlannedMutation>> {
    let kind = changeset.kind;
    let mut out = Vec::new();
    for decision in &changeset.decisions {
        let mutation = match decision {
            RuleDecision::Keep { .. } => continue,
            RuleDecision::Replace { observed, .. } => Mutation::PutRule {
                rule: written(kind, decision)?,
                replaces: Some(wire::encode_rule_for(kind, observed)?),
            },
            RuleDecision::Create { .. } => Mutation::PutRule {
                rule: written(kind, decision)?,
                replaces: None,
            },
            RuleDecision::Delete { observed } => Mutation::DeleteRule {
                rule: wire::encode_rule_for(kind, observed)?,
            },
        };
        out.push(PlannedMutation::new(kind, mutation));
    }
    Ok(out)
}

fn written(kind: SubResourceKind, decision: &RuleDecision) -> Result<serde_json::Value> {
    match decision.written_rule() {
        Some(rule) => wire::encode_rule_for(kind, &rule),
        None => Err(Error::invalid(format!(
            "{} decision {} writes no rule",
            kind,
            decision.label()
        ))),
    }
}

/// Issues planned mutations against a [`StateMutator`].
pub struct Converger {
    mutator: Arc<dyn StateMutator>,
    call_timeout: Duration,
}

impl Converger {
    pub fn new(mutator: Arc<dyn StateMutator>, call_timeout: Duration) -> Self {
        Self {
            mutator,
            call_timeout,
        }
    }

    /// Issue every mutation in order, each exactly once.
    ///
    /// Stops at the first failure. Nothing is retried or rolled back; the
    /// error reports how many mutations took effect before it.
    pub async fn apply(
        &self,
        resource: &str,
        mutations: &[PlannedMutation],
    ) -> std::result::Result<usize, PartialConvergence> {
        for (applied, planned) in mutations.iter().enumerate() {
            let call = self
                .mutator
                .apply(resource, planned.kind, &planned.mutation);
            let result = with_deadline(
                || format!("{} {} {}", planned.mutation.name(), resource, planned.kind),
                self.call_timeout,
                call,
            )
            .await;

            if let Err(source) = result {
                warn!(
                    resource,
                    kind = %planned.kind,
                    op = planned.mutation.name(),
                    applied,
                    error = %source,
                    "Mutation failed, stopping"
                );
                return Err(PartialConvergence { applied, source });
            }
            info!(
                resource,
                kind = %planned.kind,
                op = planned.mutation.name(),
                "Applied mutation"
            );
        }
        Ok(mutations.len())
    }
}
