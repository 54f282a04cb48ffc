//! Reconciliation driver.
//!
//! One call walks FETCHING → DIFFING → CONVERGING → CONFIRMING → DONE. A
//! failure in any phase ends in FAILED and is reported as a
//! [`ReconcileFailure`] naming the phase and the number of mutations that
//! already took effect.

use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::converger::{Converger, PlannedMutation, plan_mutations, removal_mutations};
use crate::descriptor::{ObservedFacet, parse_observed};
use crate::diff::{self, Plan};
use crate::error::Error;
use crate::kind::SubResourceKind;
use crate::model::{DesiredRule, DesiredState, ObservedState};
use crate::policy::{PolicyTable, RuleTypePolicy};
use crate::remote::{StateMutator, StateSource, fetch_optional};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Fetching,
    Diffing,
    Converging,
    Confirming,
    Done,
    Failed,
}

impl Phase {
    pub fn is_terminal(self) -> bool {
        matches!(self, Phase::Done | Phase::Failed)
    }

    /// Legal moves of the state machine.
    ///
    /// `Fetching → Converging` is taken by removals, which do not diff.
    /// `→ Done` straight from `Fetching` or `Diffing` means nothing to do.
    pub fn can_advance_to(self, next: Phase) -> bool {
        use Phase::*;
        match (self, next) {
            (from, Failed) => !from.is_terminal(),
            (Fetching, Diffing | Converging | Done) => true,
            (Diffing, Converging | Done) => true,
            (Converging, Confirming) => true,
            (Confirming, Done) => true,
            _ => false,
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Phase::Fetching => "fetching",
            Phase::Diffing => "diffing",
            Phase::Converging => "converging",
            Phase::Confirming => "confirming",
            Phase::Done => "done",
            Phase::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// A reconciliation call that ended in FAILED.
#[derive(Debug, Error)]
#[error("reconciling {resource} failed while {phase} after {mutations_applied} mutation(s): {source}")]
pub struct ReconcileFailure {
    pub resource: String,
    pub phase: Phase,
    /// Mutations that took effect before the failure. Nothing is rolled back.
    pub mutations_applied: usize,
    #[source]
    pub source: Error,
}

impl ReconcileFailure {
    /// Some but not all mutations were applied.
    pub fn is_partial(&self) -> bool {
        self.mutations_applied > 0
    }
}

#[derive(Debug, Clone)]
pub struct ReconcilerConfig {
    /// Deadline for each individual remote call.
    pub call_timeout: Duration,
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self {
            call_timeout: Duration::from_secs(30),
        }
    }
}

/// Result of a successful call.
#[derive(Debug, Clone)]
pub struct Outcome {
    /// Observed state after convergence. Kinds that received a mutation are
    /// re-fetched, whatever a concurrent writer left there is reported as is.
    pub final_state: ObservedState,
    pub changed: bool,
    pub mutations: Vec<PlannedMutation>,
}

/// What to remove in an `absent` call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Removal {
    /// Delete the resource itself.
    Resource { force: bool },
    /// Remove the contents of the listed sub-resource kinds.
    SubResources(Vec<SubResourceKind>),
}

/// Tracks the phase of one call.
struct Run<'a> {
    resource: &'a str,
    phase: Phase,
    applied: usize,
}

impl<'a> Run<'a> {
    fn new(resource: &'a str) -> Self {
        Self {
            resource,
            phase: Phase::Fetching,
            applied: 0,
        }
    }

    fn advance(&mut self, next: Phase) -> Result<(), ReconcileFailure> {
        if !self.phase.can_advance_to(next) {
            let from = self.phase;
            return Err(self.fail(Error::InvalidTransition { from, to: next }));
        }
        debug!(resource = self.resource, from = %self.phase, to = %next, "Phase transition");
        self.phase = next;
        Ok(())
    }

    fn fail(&mut self, source: Error) -> ReconcileFailure {
        let phase = self.phase;
        warn!(
            resource = self.resource,
            %phase,
            applied = self.applied,
            error = %source,
            "Reconciliation failed"
        );
        self.phase = Phase::Failed;
        ReconcileFailure {
            resource: self.resource.to_string(),
            phase,
            mutations_applied: self.applied,
            source,
        }
    }
}

/// Drives `present` and `absent` calls against injected collaborators.
pub struct Reconciler {
    source: Arc<dyn StateSource>,
    mutator: Arc<dyn StateMutator>,
    policies: PolicyTable,
    config: ReconcilerConfig,
}

impl Reconciler {
    pub fn new(
        source: Arc<dyn StateSource>,
        mutator: Arc<dyn StateMutator>,
        policies: PolicyTable,
    ) -> Self {
        Self {
            source,
            mutator,
            policies,
            config: ReconcilerConfig::default(),
        }
    }

    pub fn with_config(mut self, config: ReconcilerConfig) -> Self {
        self.config = config;
        self
    }

    pub fn policies(&self) -> &PolicyTable {
        &self.policies
    }

    /// Fetch and parse the given kinds into a fresh observed state.
    ///
    /// A missing sub-resource becomes its empty facet.
    pub async fn observe(
        &self,
        resource: &str,
        kinds: &[SubResourceKind],
    ) -> crate::Result<ObservedState> {
        let raw = self.fetch_raw(resource, kinds).await?;
        let mut state = ObservedState::new(resource);
        absorb_raw(&mut state, raw)?;
        Ok(state)
    }

    /// Fetch raw wire bodies. `None` stands for a missing sub-resource.
    ///
    /// Once the resource itself is known to be missing, the remaining kinds
    /// are not fetched.
    async fn fetch_raw(
        &self,
        resource: &str,
        kinds: &[SubResourceKind],
    ) -> crate::Result<Vec<(SubResourceKind, Option<Value>)>> {
        let mut raw = Vec::with_capacity(kinds.len());
        let mut resource_missing = false;
        for &kind in kinds {
            if resource_missing {
                raw.push((kind, None));
                continue;
            }
            let body =
                fetch_optional(self.source.as_ref(), resource, kind, self.config.call_timeout)
                    .await?;
            resource_missing = kind == SubResourceKind::Resource && body.is_none();
            raw.push((kind, body));
        }
        Ok(raw)
    }

    /// Observe the declared kinds and compute the plan without mutating.
    pub async fn plan(
        &self,
        desired: &DesiredState,
    ) -> crate::Result<(ObservedState, Plan, Vec<PlannedMutation>)> {
        let observed = self.observe(&desired.name, &desired.declared_kinds()).await?;
        let plan = diff::plan(desired, &observed, &self.policies)?;
        let mutations = plan_mutations(&plan, &self.policies)?;
        Ok((observed, plan, mutations))
    }

    /// Converge the remote towards `desired` (`present`).
    pub async fn reconcile(&self, desired: &DesiredState) -> Result<Outcome, ReconcileFailure> {
        let mut run = Run::new(&desired.name);
        info!(resource = %desired.name, "Reconciling");

        let raw = match self.fetch_raw(&desired.name, &desired.declared_kinds()).await {
            Ok(raw) => raw,
            Err(e) => return Err(run.fail(e)),
        };

        run.advance(Phase::Diffing)?;
        let mut observed = ObservedState::new(desired.name.clone());
        let mutations = absorb_raw(&mut observed, raw)
            .and_then(|()| diff::plan(desired, &observed, &self.policies))
            .and_then(|plan| plan_mutations(&plan, &self.policies));
        let mutations = match mutations {
            Ok(mutations) => mutations,
            Err(e) => return Err(run.fail(e)),
        };

        if mutations.is_empty() {
            run.advance(Phase::Done)?;
            info!(resource = %desired.name, "Already converged");
            return Ok(Outcome {
                final_state: observed,
                changed: false,
                mutations,
            });
        }

        run.advance(Phase::Converging)?;
        self.converge(&mut run, &mut observed, mutations).await
    }

    /// Remove the resource or some of its sub-resources (`absent`).
    pub async fn remove(&self, resource: &str, removal: &Removal) -> Result<Outcome, ReconcileFailure> {
        let mut run = Run::new(resource);
        info!(resource, ?removal, "Removing");

        let kinds = match removal {
            Removal::Resource { .. } => vec![SubResourceKind::Resource],
            Removal::SubResources(kinds) => {
                if kinds.contains(&SubResourceKind::Resource) {
                    return Err(run.fail(Error::InvalidConfig(
                        "use Removal::Resource to delete the resource itself".into(),
                    )));
                }
                kinds.iter().copied().collect::<BTreeSet<_>>().into_iter().collect()
            }
        };

        let raw = match self.fetch_raw(resource, &kinds).await {
            Ok(raw) => raw,
            Err(e) => return Err(run.fail(e)),
        };

        let mut observed = ObservedState::new(resource);
        let mut mutations = Vec::new();
        for (kind, body) in raw {
            let facet = match body.map(|b| parse_observed(kind, &b)).transpose() {
                Ok(Some(facet)) => facet,
                Ok(None) => ObservedFacet::missing(kind),
                Err(e) => return Err(run.fail(e)),
            };
            let planned = match removal {
                Removal::Resource { force } if !facet.is_empty() => {
                    vec![PlannedMutation {
                        kind,
                        mutation: crate::remote::Mutation::DeleteResource { force: *force },
                    }]
                }
                Removal::Resource { .. } => Vec::new(),
                Removal::SubResources(_) => match removal_mutations(&facet, &self.policies) {
                    Ok(planned) => planned,
                    Err(e) => return Err(run.fail(e)),
                },
            };
            observed.absorb(facet);
            mutations.extend(planned);
        }

        if mutations.is_empty() {
            run.advance(Phase::Done)?;
            info!(resource, "Nothing to remove");
            return Ok(Outcome {
                final_state: observed,
                changed: false,
                mutations,
            });
        }

        run.advance(Phase::Converging)?;
        self.converge(&mut run, &mut observed, mutations).await
    }

    /// Apply mutations, then re-fetch every kind they touched.
    async fn converge(
        &self,
        run: &mut Run<'_>,
        observed: &mut ObservedState,
        mutations: Vec<PlannedMutation>,
    ) -> Result<Outcome, ReconcileFailure> {
        let converger = Converger::new(self.mutator.clone(), self.config.call_timeout);
        match converger.apply(run.resource, &mutations).await {
            Ok(applied) => run.applied = applied,
            Err(partial) => {
                run.applied = partial.applied;
                return Err(run.fail(partial.source));
            }
        }

        run.advance(Phase::Confirming)?;
        let touched: Vec<SubResourceKind> = mutations
            .iter()
            .map(|m| m.kind)
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();
        let confirmed = match self.fetch_raw(run.resource, &touched).await {
            Ok(raw) => absorb_raw(observed, raw),
            Err(e) => Err(e),
        };
        if let Err(e) = confirmed {
            return Err(run.fail(e));
        }

        run.advance(Phase::Done)?;
        info!(
            resource = run.resource,
            mutations = mutations.len(),
            "Converged"
        );
        Ok(Outcome {
            final_state: observed.clone(),
            changed: true,
            mutations,
        })
    }
}

/// Parse fetched bodies into `state`, replacing the facets they cover.
fn absorb_raw(
    state: &mut ObservedState,
    raw: Vec<(SubResourceKind, Option<Value>)>,
) -> crate::Result<()> {
    for (kind, body) in raw {
        let facet = match body {
            Some(body) => parse_observed(kind, &body)?,
            None => ObservedFacet::missing(kind),
        };
        state.absorb(facet);
    }
    Ok(())
}

/// Reconcile a single rule collection of `resource`.
///
/// Convenience wrapper around [`Reconciler::reconcile`] for callers that
/// manage exactly one rule kind under an explicit policy.
pub async fn reconcile(
    resource: &str,
    kind: SubResourceKind,
    desired: Vec<DesiredRule>,
    policy: &RuleTypePolicy,
    source: Arc<dyn StateSource>,
    mutator: Arc<dyn StateMutator>,
) -> Result<Outcome, ReconcileFailure> {
    let policies = match PolicyTable::default().with(kind, policy.clone()) {
        Ok(policies) => policies,
        Err(e) => return Err(Run::new(resource).fail(e)),
    };
    let mut state = DesiredState::new(resource);
    state.set_rules(kind, desired);
    Reconciler::new(source, mutator, policies)
        .reconcile(&state)
        .await
}
