//! Filtered, paginated queries over cached events

use serde::{Deserialize, Serialize};

use crate::model::{CachedEvent, ControlValue};

/// Comparison operator for value filters
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ValueOperator {
    /// Equal
    Eq,
    /// Not equal
    Neq,
    /// Less than (numeric only)
    Lt,
    /// Less than or equal (numeric only)
    Lte,
    /// Greater than (numeric only)
    Gt,
    /// Greater than or equal (numeric only)
    Gte,
}

/// Value predicate applied to each event
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValueFilter {
    /// Comparison operator
    pub operator: ValueOperator,
    /// Right-hand side
    pub value: ControlValue,
}

impl ValueFilter {
    /// Whether an event's value passes the filter.
    /// Ordering operators apply to numeric values only; non-numeric events
    /// never match them.
    pub fn matches(&self, value: &ControlValue) -> bool {
        match self.operator {
            ValueOperator::Eq => value == &self.value,
            ValueOperator::Neq => value != &self.value,
            ValueOperator::Lt | ValueOperator::Lte | ValueOperator::Gt | ValueOperator::Gte => {
                let (Some(lhs), Some(rhs)) = (value.as_number(), self.value.as_number()) else {
                    return false;
                };
                match self.operator {
                    ValueOperator::Lt => lhs < rhs,
                    ValueOperator::Lte => lhs <= rhs,
                    ValueOperator::Gt => lhs > rhs,
                    ValueOperator::Gte => lhs >= rhs,
                    _ => unreachable!(),
                }
            }
        }
    }
}

/// A query over one group's events
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventQuery {
    /// Group to query (required)
    pub group_id: String,
    /// Restrict to these control names
    #[serde(default)]
    pub control_names: Option<Vec<String>>,
    /// Inclusive lower bound, milliseconds
    #[serde(default)]
    pub start_time: Option<i64>,
    /// Inclusive upper bound, milliseconds
    #[serde(default)]
    pub end_time: Option<i64>,
    /// Value predicate
    #[serde(default)]
    pub value_filter: Option<ValueFilter>,
    /// Results to skip after filtering; 0 is equivalent to omitting it
    #[serde(default)]
    pub offset: usize,
    /// Maximum results after the offset
    #[serde(default)]
    pub limit: Option<usize>,
}

impl EventQuery {
    /// Query for everything in one group
    pub fn for_group(group_id: impl Into<String>) -> Self {
        Self {
            group_id: group_id.into(),
            control_names: None,
            start_time: None,
            end_time: None,
            value_filter: None,
            offset: 0,
            limit: None,
        }
    }

    fn passes_filters(&self, event: &CachedEvent) -> bool {
        if let Some(names) = &self.control_names {
            if !names.iter().any(|name| name == &event.control_name) {
                return false;
            }
        }
        if let Some(start) = self.start_time {
            if event.timestamp_ms < start {
                return false;
            }
        }
        if let Some(end) = self.end_time {
            if event.timestamp_ms > end {
                return false;
            }
        }
        if let Some(filter) = &self.value_filter {
            if !filter.matches(&event.value) {
                return false;
            }
        }
        true
    }
}

/// Apply a query to a candidate set: filter, sort by
/// `(timestamp_ns, sequence_number)` ascending, then paginate.
///
/// `offset` past the filtered count yields an empty page; `offset + limit`
/// past it yields a short one. Pages from consecutive offsets over a stable
/// snapshot are disjoint and contiguous.
pub fn apply(mut events: Vec<CachedEvent>, query: &EventQuery) -> Vec<CachedEvent> {
    events.retain(|event| query.passes_filters(event));
    events.sort_by(|a, b| {
        a.timestamp_ns
            .cmp(&b.timestamp_ns)
            .then(a.sequence_number.cmp(&b.sequence_number))
    });

    if query.offset >= events.len() {
        return Vec::new();
    }
    let events = events.split_off(query.offset);
    match query.limit {
        Some(limit) => events.into_iter().take(limit).collect(),
        None => events,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::EventKind;

    fn event(seq: u64, ts_ms: i64, name: &str, value: ControlValue) -> CachedEvent {
        CachedEvent {
            group_id: "g".to_string(),
            control_name: name.to_string(),
            value,
            string_value: None,
            timestamp_ns: ts_ms * 1_000_000,
            timestamp_ms: ts_ms,
            sequence_number: seq,
            previous_value: None,
            delta: None,
            event_kind: EventKind::Change,
        }
    }

    fn numbered(count: u64) -> Vec<CachedEvent> {
        (1..=count)
            .map(|i| event(i, i as i64 * 10, "gain", ControlValue::Number(i as f64)))
            .collect()
    }

    #[test]
    fn test_pagination_pages_are_disjoint_and_contiguous() {
        let events = numbered(100);

        let mut query = EventQuery::for_group("g");
        query.offset = 20;
        query.limit = Some(10);
        let page1 = apply(events.clone(), &query);

        query.offset = 30;
        let page2 = apply(events.clone(), &query);

        let seqs1: Vec<u64> = page1.iter().map(|e| e.sequence_number).collect();
        let seqs2: Vec<u64> = page2.iter().map(|e| e.sequence_number).collect();
        assert_eq!(seqs1, (21..=30).collect::<Vec<_>>());
        assert_eq!(seqs2, (31..=40).collect::<Vec<_>>());
    }

    #[test]
    fn test_offset_at_total_returns_empty() {
        let events = numbered(10);
        let mut query = EventQuery::for_group("g");
        query.offset = 10;
        assert!(apply(events, &query).is_empty());
    }

    #[test]
    fn test_offset_plus_limit_past_total_returns_short_page() {
        let events = numbered(10);
        let mut query = EventQuery::for_group("g");
        query.offset = 8;
        query.limit = Some(10);
        let page = apply(events, &query);
        assert_eq!(page.len(), 2);
    }

    #[test]
    fn test_time_range_is_inclusive() {
        let events = numbered(10);
        let mut query = EventQuery::for_group("g");
        query.start_time = Some(30);
        query.end_time = Some(50);
        let page = apply(events, &query);
        let seqs: Vec<u64> = page.iter().map(|e| e.sequence_number).collect();
        assert_eq!(seqs, vec![3, 4, 5]);
    }

    #[test]
    fn test_control_name_filter() {
        let events = vec![
            event(1, 10, "gain", ControlValue::Number(1.0)),
            event(2, 20, "mute", ControlValue::Bool(true)),
            event(3, 30, "gain", ControlValue::Number(2.0)),
        ];
        let mut query = EventQuery::for_group("g");
        query.control_names = Some(vec!["gain".to_string()]);
        let page = apply(events, &query);
        assert_eq!(page.len(), 2);
    }

    #[test]
    fn test_value_filter_operators() {
        let gt = ValueFilter {
            operator: ValueOperator::Gt,
            value: ControlValue::Number(5.0),
        };
        assert!(gt.matches(&ControlValue::Number(6.0)));
        assert!(!gt.matches(&ControlValue::Number(5.0)));
        // Ordering never matches non-numeric values.
        assert!(!gt.matches(&ControlValue::Bool(true)));

        let eq = ValueFilter {
            operator: ValueOperator::Eq,
            value: ControlValue::Bool(true),
        };
        assert!(eq.matches(&ControlValue::Bool(true)));
        assert!(!eq.matches(&ControlValue::Bool(false)));

        let neq = ValueFilter {
            operator: ValueOperator::Neq,
            value: ControlValue::Text("Input 1".to_string()),
        };
        assert!(neq.matches(&ControlValue::Text("Input 2".to_string())));
    }

    #[test]
    fn test_sort_is_stable_under_equal_timestamps() {
        // Same timestamp, distinct sequence numbers: sequence breaks the tie.
        let events = vec![
            event(2, 10, "gain", ControlValue::Number(2.0)),
            event(1, 10, "gain", ControlValue::Number(1.0)),
            event(3, 10, "gain", ControlValue::Number(3.0)),
        ];
        let page = apply(events, &EventQuery::for_group("g"));
        let seqs: Vec<u64> = page.iter().map(|e| e.sequence_number).collect();
        assert_eq!(seqs, vec![1, 2, 3]);
    }
}
