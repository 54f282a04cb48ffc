//! Per-kind reconciliation policies.
//!
//! A [`RuleTypePolicy`] is declared once per sub-resource kind and fixes how
//! rules are matched, whether their order matters and which mutation API
//! shape the remote offers. The matching strategy never changes within one
//! reconciliation call.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::kind::SubResourceKind;

/// How desired rules are paired with observed rules.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchStrategy {
    /// Pair by explicit `id`. Rules without an id never match.
    ById,
    /// Pair by the tuple of `match_key_fields`.
    ByStructuralKey,
}

/// How desired tags combine with observed tags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TagSemantics {
    /// Desired tags are upserted, other observed tags are kept.
    Merge,
    /// Exactly the desired tags remain.
    #[default]
    Replace,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuleTypePolicy {
    pub matching: MatchStrategy,
    #[serde(default)]
    pub match_key_fields: Vec<String>,
    #[serde(default)]
    pub order_significant: bool,
    #[serde(default = "default_true")]
    pub replace_whole_collection: bool,
    #[serde(default)]
    pub tag_semantics: TagSemantics,
}

fn default_true() -> bool {
    true
}

impl RuleTypePolicy {
    pub fn by_structural_key(fields: &[&str]) -> Self {
        Self {
            matching: MatchStrategy::ByStructuralKey,
            match_key_fields: fields.iter().map(|f| f.to_string()).collect(),
            order_significant: false,
            replace_whole_collection: true,
            tag_semantics: TagSemantics::Replace,
        }
    }

    pub fn by_id() -> Self {
        Self {
            matching: MatchStrategy::ById,
            match_key_fields: Vec::new(),
            order_significant: false,
            replace_whole_collection: true,
            tag_semantics: TagSemantics::Replace,
        }
    }

    pub fn ordered(mut self) -> Self {
        self.order_significant = true;
        self
    }

    /// Remote supports creating and deleting single rules.
    pub fn per_item(mut self) -> Self {
        self.replace_whole_collection = false;
        self
    }

    pub fn with_tag_semantics(mut self, semantics: TagSemantics) -> Self {
        self.tag_semantics = semantics;
        self
    }

    /// Statically declared policy for a kind.
    pub fn for_kind(kind: SubResourceKind) -> Self {
        match kind {
            SubResourceKind::LifecycleRules => Self::by_structural_key(&["prefix"]),
            SubResourceKind::CorsRules => {
                Self::by_structural_key(&["allowed_origins", "allowed_methods"])
            }
            // Routing rules are evaluated top to bottom.
            SubResourceKind::RoutingRules => {
                Self::by_structural_key(&["key_prefix", "http_error_code"]).ordered()
            }
            _ => Self::by_id(),
        }
    }

    pub fn validate(&self, kind: SubResourceKind) -> Result<()> {
        if self.matching == MatchStrategy::ByStructuralKey && self.match_key_fields.is_empty() {
            return Err(Error::invalid(format!(
                "{}: structural matching requires at least one match key field",
                kind
            )));
        }
        if self.order_significant && !self.replace_whole_collection {
            return Err(Error::invalid(format!(
                "{}: rule order can only be enforced when the whole collection is replaced",
                kind
            )));
        }
        Ok(())
    }
}

/// Policies for every sub-resource kind.
#[derive(Debug, Clone)]
pub struct PolicyTable {
    policies: BTreeMap<SubResourceKind, RuleTypePolicy>,
}

impl Default for PolicyTable {
    fn default() -> Self {
        let policies = SubResourceKind::ALL
            .into_iter()
            .map(|k| (k, RuleTypePolicy::for_kind(k)))
            .collect();
        Self { policies }
    }
}

impl PolicyTable {
    pub fn get(&self, kind: SubResourceKind) -> &RuleTypePolicy {
        // Every kind is inserted by Default and set() never removes one.
        &self.policies[&kind]
    }

    pub fn set(&mut self, kind: SubResourceKind, policy: RuleTypePolicy) -> Result<()> {
        policy.validate(kind)?;
        self.policies.insert(kind, policy);
        Ok(())
    }

    /// Builder-style variant of [`PolicyTable::set`].
    pub fn with(mut self, kind: SubResourceKind, policy: RuleTypePolicy) -> Result<Self> {
        self.set(kind, policy)?;
        Ok(self)
    }

    /// Apply overrides, e.g. loaded from a JSON document keyed by kind name.
    pub fn with_overrides(
        mut self,
        overrides: BTreeMap<SubResourceKind, RuleTypePolicy>,
    ) -> Result<Self> {
        for (kind, policy) in overrides {
            self.set(kind, policy)?;
        }
        Ok(self)
    }

    pub fn tag_semantics(&self) -> TagSemantics {
        self.get(SubResourceKind::Tags).tag_semantics
    }
}
