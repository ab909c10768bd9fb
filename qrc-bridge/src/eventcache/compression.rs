//! Significance compression of event history
//!
//! Older history is thinned per control: everything recent is kept, the
//! medium window keeps only significant movement, the ancient window keeps
//! only state transitions, and anything older is dropped.

use std::collections::HashMap;

use crate::config::CompressionConfig;
use crate::model::{CachedEvent, ControlValue, EventKind};

/// Whether an event marks a state transition (boolean flip or sign change)
fn is_state_transition(event: &CachedEvent) -> bool {
    if event.event_kind == EventKind::StateTransition {
        return true;
    }
    match (&event.previous_value, &event.value) {
        (Some(ControlValue::Bool(prev)), ControlValue::Bool(next)) => prev != next,
        (Some(ControlValue::Number(prev)), ControlValue::Number(next)) => {
            (*prev < 0.0) != (*next < 0.0) && *prev != 0.0 && *next != 0.0
        }
        _ => false,
    }
}

/// Percent change of the event against its previous value
fn percent_change(event: &CachedEvent) -> Option<f64> {
    let delta = event.delta?;
    let previous = event.previous_value.as_ref()?.as_number()?;
    if previous == 0.0 {
        return None;
    }
    Some((delta / previous).abs() * 100.0)
}

/// Compress a time-ordered event slice, returning the events to keep
/// (still time-ordered).
///
/// Windows, measured back from `now_ms`:
/// - younger than `recent_window_ms`: kept unconditionally;
/// - within `medium_window_ms`: kept when already tagged
///   significant/state_transition/threshold_crossed, or when the percent
///   change is at or above `significant_change_percent` AND at least
///   `min_time_between_events_ms` passed since the last kept event of the
///   same control;
/// - within `ancient_window_ms`: only state transitions;
/// - older: dropped.
pub fn compress_events(
    events: &[CachedEvent],
    config: &CompressionConfig,
    now_ms: i64,
) -> Vec<CachedEvent> {
    let mut kept: Vec<CachedEvent> = Vec::with_capacity(events.len());
    let mut last_kept_ms: HashMap<&str, i64> = HashMap::new();

    for event in events {
        let age_ms = now_ms.saturating_sub(event.timestamp_ms);

        let keep = if age_ms < config.recent_window_ms as i64 {
            true
        } else if age_ms < config.medium_window_ms as i64 {
            let tagged = matches!(
                event.event_kind,
                EventKind::SignificantChange
                    | EventKind::StateTransition
                    | EventKind::ThresholdCrossed
            );
            let significant_enough = percent_change(event)
                .map(|pct| pct >= config.significant_change_percent)
                .unwrap_or(false);
            let spaced = last_kept_ms
                .get(event.control_name.as_str())
                .map(|last| {
                    event.timestamp_ms.saturating_sub(*last)
                        >= config.min_time_between_events_ms as i64
                })
                .unwrap_or(true);
            tagged || (significant_enough && spaced)
        } else if age_ms < config.ancient_window_ms as i64 {
            is_state_transition(event)
        } else {
            false
        };

        if keep {
            last_kept_ms.insert(event.control_name.as_str(), event.timestamp_ms);
            kept.push(event.clone());
        }
    }

    kept
}
