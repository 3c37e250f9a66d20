//! Indexed store of compiled rule entries.
//!
//! Primary key is the rule ID; secondary indices map flow cookies back to
//! rules (observability) and policy names to their rules (policy-deletion
//! cleanup). Index maintenance is internal: callers only upsert and
//! remove whole entries.

use std::collections::{BTreeSet, HashMap};

use crate::common::entity::RuleId;
use crate::common::error::DatapathError;

use super::entity::RuleEntry;

#[derive(Debug, Default)]
pub struct RuleStore {
    entries: HashMap<RuleId, RuleEntry>,
    by_flow_id: HashMap<u64, RuleId>,
    by_policy: HashMap<String, BTreeSet<RuleId>>,
}

impl RuleStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, id: &RuleId) -> Option<&RuleEntry> {
        self.entries.get(id)
    }

    /// Insert or replace the entry for its rule ID, keeping both secondary
    /// indices consistent.
    pub fn upsert(&mut self, entry: RuleEntry) {
        let id = entry.rule.id.clone();
        if let Some(old) = self.entries.remove(&id) {
            self.unindex(&old);
        }
        self.index(&entry);
        self.entries.insert(id, entry);
    }

    /// Remove the entry for `id`. Returns `StoreInconsistency` when the
    /// entry does not exist; callers log and converge.
    pub fn remove(&mut self, id: &RuleId) -> Result<RuleEntry, DatapathError> {
        match self.entries.remove(id) {
            Some(entry) => {
                self.unindex(&entry);
                Ok(entry)
            }
            None => Err(DatapathError::StoreInconsistency(format!(
                "removing unknown rule {id}"
            ))),
        }
    }

    pub fn get_by_flow_id(&self, flow_id: u64) -> Option<&RuleEntry> {
        let id = self.by_flow_id.get(&flow_id)?;
        self.entries.get(id)
    }

    /// Rules referenced by the `namespace/name` policy key.
    pub fn rules_for_policy(&self, policy_key: &str) -> Vec<&RuleEntry> {
        match self.by_policy.get(policy_key) {
            Some(ids) => ids.iter().filter_map(|id| self.entries.get(id)).collect(),
            None => Vec::new(),
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = &RuleEntry> {
        self.entries.values()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn index(&mut self, entry: &RuleEntry) {
        for flow_id in entry.flow_ids() {
            self.by_flow_id.insert(flow_id, entry.rule.id.clone());
        }
        for key in entry.policy_keys() {
            self.by_policy
                .entry(key)
                .or_default()
                .insert(entry.rule.id.clone());
        }
    }

    fn unindex(&mut self, entry: &RuleEntry) {
        for flow_id in entry.flow_ids() {
            self.by_flow_id.remove(&flow_id);
        }
        for key in entry.policy_keys() {
            if let Some(set) = self.by_policy.get_mut(&key) {
                set.remove(&entry.rule.id);
                if set.is_empty() {
                    self.by_policy.remove(&key);
                }
            }
        }
    }
}
