//! Ordering Policy: a total order over view states for display.

use std::collections::{HashMap, HashSet};

use serde::{Deserialize, Serialize};

use crate::models::SensorId;
use crate::view::SensorViewState;

// ---

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", content = "ids", rename_all = "snake_case")]
pub enum SortOrder {
    /// Case-insensitive by name, ties by insertion.
    #[default]
    Alphabetical,
    /// Explicit persisted list of ids; unlisted ids follow in insertion order.
    Manual(Vec<SensorId>),
}

impl SortOrder {
    // ---
    pub fn is_manual(&self) -> bool {
        matches!(self, SortOrder::Manual(_))
    }

    /// Put a newly registered sensor at the front of a manual order. An id
    /// that already has a place keeps it.
    pub fn prepend(&mut self, id: &SensorId) -> bool {
        // ---
        let SortOrder::Manual(ids) = self else {
            return false;
        };
        if ids.contains(id) {
            return false;
        }
        ids.insert(0, id.clone());
        true
    }

    /// Forget a removed sensor so the manual list never accumulates stale ids.
    pub fn forget(&mut self, id: &SensorId) -> bool {
        // ---
        let SortOrder::Manual(ids) = self else {
            return false;
        };
        let before = ids.len();
        ids.retain(|existing| existing != id);
        ids.len() != before
    }
}

/// Order `states` for display. Duplicate ids keep their first occurrence.
pub fn order(mut states: Vec<SensorViewState>, sort: &SortOrder) -> Vec<SensorViewState> {
    // ---
    let mut seen = HashSet::new();
    states.retain(|state| seen.insert(state.id.clone()));

    match sort {
        SortOrder::Alphabetical => {
            states.sort_by_cached_key(|state| (state.name.to_lowercase(), state.seq));
        }
        SortOrder::Manual(ids) => {
            let mut rank: HashMap<&SensorId, usize> = HashMap::with_capacity(ids.len());
            for (position, id) in ids.iter().enumerate() {
                rank.entry(id).or_insert(position);
            }
            states.sort_by_key(|state| {
                (
                    rank.get(&state.id).copied().unwrap_or(usize::MAX),
                    state.seq,
                )
            });
        }
    }
    states
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::SensorIdentity;

    fn state(id: &str, name: &str, seq: u64) -> SensorViewState {
        SensorViewState::new(
            SensorId::from(id),
            SensorIdentity::local(id),
            name.to_string(),
            false,
            seq,
        )
    }

    fn ids(states: &[SensorViewState]) -> Vec<&str> {
        states.iter().map(|s| s.id.as_str()).collect()
    }

    #[test]
    fn alphabetical_ignores_case_and_breaks_ties_by_insertion() {
        let states = vec![
            state("3", "beta", 3),
            state("1", "Alpha", 1),
            state("4", "alpha", 0),
            state("2", "Beta", 2),
        ];
        let ordered = order(states, &SortOrder::Alphabetical);
        assert_eq!(ids(&ordered), vec!["4", "1", "2", "3"]);
    }

    #[test]
    fn manual_follows_list_then_appends_unlisted() {
        let states = vec![
            state("A", "a", 1),
            state("B", "b", 2),
            state("C", "c", 3),
            state("D", "d", 4),
        ];
        let sort = SortOrder::Manual(vec!["C".into(), "gone".into(), "A".into()]);
        let ordered = order(states, &sort);
        assert_eq!(ids(&ordered), vec!["C", "A", "B", "D"]);
    }

    #[test]
    fn duplicates_are_removed_before_sorting() {
        let states = vec![state("A", "a", 1), state("A", "a", 1), state("B", "b", 2)];
        assert_eq!(ids(&order(states, &SortOrder::Alphabetical)), vec!["A", "B"]);
    }

    #[test]
    fn prepend_and_forget_maintain_manual_list() {
        let mut sort = SortOrder::Manual(vec!["B".into(), "A".into()]);
        assert!(sort.prepend(&"C".into()));
        assert_eq!(sort, SortOrder::Manual(vec!["C".into(), "B".into(), "A".into()]));
        assert!(!sort.prepend(&"A".into()));
        assert!(sort.forget(&"B".into()));
        assert_eq!(sort, SortOrder::Manual(vec!["C".into(), "A".into()]));

        let mut alphabetical = SortOrder::Alphabetical;
        assert!(!alphabetical.prepend(&"C".into()));
    }

    #[test]
    fn manual_order_serializes_with_mode_tag() {
        let json = serde_json::to_value(SortOrder::Manual(vec!["A".into()])).unwrap();
        assert_eq!(json, serde_json::json!({"mode": "manual", "ids": ["A"]}));
        let back: SortOrder =
            serde_json::from_value(serde_json::json!({"mode": "alphabetical"})).unwrap();
        assert_eq!(back, SortOrder::Alphabetical);
    }
}
