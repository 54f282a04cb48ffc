//! converge-core: declarative reconciliation of cloud sub-resources.
//!
//! Compares a declared [`DesiredState`] with the [`ObservedState`] fetched
//! from a remote, computes the minimal set of mutations and applies them
//! through injected collaborators:
//! - [`StateSource`]: fetches the raw wire body of one sub-resource kind
//! - [`StateMutator`]: issues exactly one mutation call
//!
//! # Example
//! ```ignore
//! use std::sync::Arc;
//! use converge_core::{MemoryRemote, PolicyTable, Reconciler, ResourceConfig, normalize_desired};
//!
//! let remote = Arc::new(MemoryRemote::new());
//! let reconciler = Reconciler::new(remote.clone(), remote, PolicyTable::default());
//! let desired = normalize_desired(&config)?;
//! let outcome = reconciler.reconcile(&desired).await?;
//! println!("changed: {}", outcome.changed);
//! ```

pub mod converger;
pub mod descriptor;
pub mod diff;
pub mod driver;
pub mod error;
pub mod kind;
pub mod matcher;
pub mod model;
pub mod platform;
pub mod policy;
pub mod remote;

pub use converger::{
    Converger, PartialConvergence, PlannedMutation, plan_mutations, removal_mutations,
};
pub use descriptor::{
    CorsRuleSpec, DhcpOptionsSpec, LifecycleRuleSpec, LoggingSpec, ObservedFacet, ResourceConfig,
    RoutingRuleSpec, WebsiteSpec, normalize_desired, parse_observed,
};
pub use diff::{Changeset, Plan, PolicyAttachmentChange, RuleDecision, TagChange};
pub use driver::{Outcome, Phase, ReconcileFailure, Reconciler, ReconcilerConfig, Removal, reconcile};
pub use error::{Error, RemoteError, Result, RuleSide};
pub use kind::SubResourceKind;
pub use model::{
    DesiredRule, DesiredState, DhcpOptions, LoggingConfig, MatchKey, ObservedRule, ObservedState,
    Payload, PolicyArnSet, PolicyDocument, ResourceState, TagMap, VersioningStatus, WebsiteConfig,
};
pub use platform::{AgentPackage, CommandSpec, Linux, Platform, PlatformOps, Windows};
pub use policy::{MatchStrategy, PolicyTable, RuleTypePolicy, TagSemantics};
pub use remote::{MemoryRemote, Mutation, StateMutator, StateSource};
