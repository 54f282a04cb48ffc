//! Pairing of desired rules with observed rules.

use std::collections::HashMap;
use std::collections::hash_map::Entry;

use crate::error::{Error, Result, RuleSide};
use crate::kind::SubResourceKind;
use crate::model::{DesiredRule, MatchKey, ObservedRule, Rule};
use crate::policy::{MatchStrategy, RuleTypePolicy};

/// One slot of a match: a desired rule, an observed rule, or both.
#[derive(Debug, Clone)]
pub struct RulePair {
    pub desired: Option<DesiredRule>,
    pub observed: Option<ObservedRule>,
    /// Position of the observed rule in the observed collection.
    pub observed_index: Option<usize>,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum Key {
    Id(String),
    Structural(MatchKey),
}

impl std::fmt::Display for Key {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Key::Id(id) => write!(f, "id {}", id),
            Key::Structural(key) => write!(f, "{}", key),
        }
    }
}

fn key_of<R: Rule>(rule: &R, policy: &RuleTypePolicy) -> Option<Key> {
    match policy.matching {
        MatchStrategy::ById => rule.id().map(|id| Key::Id(id.to_string())),
        MatchStrategy::ByStructuralKey => {
            Some(Key::Structural(rule.match_key(&policy.match_key_fields)))
        }
    }
}

/// Index rules by key, rejecting duplicates.
fn index<R: Rule>(
    kind: SubResourceKind,
    side: RuleSide,
    rules: &[R],
    policy: &RuleTypePolicy,
) -> Result<HashMap<Key, usize>> {
    let mut by_key = HashMap::with_capacity(rules.len());
    for (i, rule) in rules.iter().enumerate() {
        let Some(key) = key_of(rule, policy) else {
            continue;
        };
        match by_key.entry(key) {
            Entry::Occupied(entry) => {
                return Err(Error::AmbiguousMatch {
                    kind,
                    side,
                    key: entry.key().to_string(),
                });
            }
            Entry::Vacant(entry) => {
                entry.insert(i);
            }
        }
    }
    Ok(by_key)
}

/// Pair desired rules with observed rules under `policy`.
///
/// Pairs come out in desired order, followed by unmatched observed rules in
/// observed order. Several rules sharing a key on either side is an
/// [`Error::AmbiguousMatch`]; no pairing is guessed.
pub fn match_rules(
    kind: SubResourceKind,
    policy: &RuleTypePolicy,
    desired: &[DesiredRule],
    observed: &[ObservedRule],
) -> Result<Vec<RulePair>> {
    index(kind, RuleSide::Desired, desired, policy)?;
    let observed_by_key = index(kind, RuleSide::Observed, observed, policy)?;

    let mut claimed = vec![false; observed.len()];
    let mut pairs = Vec::with_capacity(desired.len() + observed.len());

    for rule in desired {
        let hit = key_of(rule, policy).and_then(|k| observed_by_key.get(&k).copied());
        if let Some(i) = hit {
            claimed[i] = true;
        }
        pairs.push(RulePair {
            desired: Some(rule.clone()),
            observed: hit.map(|i| observed[i].clone()),
            observed_index: hit,
        });
    }

    for (i, rule) in observed.iter().enumerate() {
        if !claimed[i] {
            pairs.push(RulePair {
                desired: None,
                observed: Some(rule.clone()),
                observed_index: Some(i),
            });
        }
    }

    Ok(pairs)
}
