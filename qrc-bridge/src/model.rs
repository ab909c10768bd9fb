//! Core data model: control values, cached descriptors, change groups, events

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

use crate::error::{Error, Result};

/// A control value as the Core reports it: number, boolean, or string.
///
/// Variant order matters for untagged deserialization: booleans must be
/// tried before numbers so `true` does not decode as `1.0`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ControlValue {
    /// Boolean control (mute, bypass, ...)
    Bool(bool),
    /// Numeric control (gain, level, position, ...)
    Number(f64),
    /// String control (selections, labels, ...)
    Text(String),
}

impl ControlValue {
    /// Numeric view; `None` for booleans and strings
    pub fn as_number(&self) -> Option<f64> {
        match self {
            Self::Number(n) => Some(*n),
            _ => None,
        }
    }

    /// Boolean view; `None` for numbers and strings
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Bool(b) => Some(*b),
            _ => None,
        }
    }

    /// Decode from a JSON value. `null` and structured values yield `None`.
    pub fn from_json(value: &serde_json::Value) -> Option<Self> {
        match value {
            serde_json::Value::Bool(b) => Some(Self::Bool(*b)),
            serde_json::Value::Number(n) => n.as_f64().map(Self::Number),
            serde_json::Value::String(s) => Some(Self::Text(s.clone())),
            _ => None,
        }
    }

    /// Encode to a JSON value for the wire
    pub fn to_json(&self) -> serde_json::Value {
        match self {
            Self::Bool(b) => serde_json::Value::Bool(*b),
            Self::Number(n) => serde_json::json!(n),
            Self::Text(s) => serde_json::Value::String(s.clone()),
        }
    }
}

impl fmt::Display for ControlValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Bool(b) => write!(f, "{}", b),
            Self::Number(n) => write!(f, "{}", n),
            Self::Text(s) => write!(f, "{}", s),
        }
    }
}

/// Where a stored control state came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StateSource {
    /// Written by a frontend client
    User,
    /// Reported by the Core (poll or read)
    Qsys,
    /// Served from cache
    Cache,
    /// Seeded at startup or restore
    Initial,
}

/// A control's current value as held by the state cache
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ControlState {
    /// Fully qualified control name
    pub name: String,
    /// Current value; never null once stored
    pub value: ControlValue,
    /// Wall-clock instant of last update
    pub timestamp: DateTime<Utc>,
    /// Origin of the value
    pub source: StateSource,
}

impl ControlState {
    /// New state stamped now
    pub fn new(name: impl Into<String>, value: ControlValue, source: StateSource) -> Self {
        Self {
            name: name.into(),
            value,
            timestamp: Utc::now(),
            source,
        }
    }
}

/// A fully-qualified control name split into its component and control path.
///
/// The grammar splits at the FIRST dot: everything after it belongs to the
/// control path, so `"A.b.c"` is component `"A"`, control `"b.c"`. A name
/// with no dot is a named control with an empty component.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ControlAddress {
    /// Component name; empty for named (bare) controls
    pub component: String,
    /// Control path within the component
    pub control: String,
}

impl ControlAddress {
    /// Parse a fully-qualified control name.
    ///
    /// Empty or whitespace-only names are invalid, as is a trailing dot with
    /// no control path (`"Mixer."`).
    pub fn parse(name: &str) -> Result<Self> {
        if name.trim().is_empty() {
            return Err(Error::Validation(
                "control name must not be empty".to_string(),
            ));
        }
        match name.find('.') {
            Some(idx) => {
                let component = &name[..idx];
                let control = &name[idx + 1..];
                if control.is_empty() {
                    return Err(Error::Validation(format!(
                        "control name '{}' has no control path after the component",
                        name
                    )));
                }
                Ok(Self {
                    component: component.to_string(),
                    control: control.to_string(),
                })
            }
            None => Ok(Self {
                component: String::new(),
                control: name.to_string(),
            }),
        }
    }

    /// True when this names a control outside any component
    pub fn is_bare(&self) -> bool {
        self.component.is_empty()
    }

    /// Reassemble the fully-qualified form
    pub fn qualified(&self) -> String {
        if self.is_bare() {
            self.control.clone()
        } else {
            format!("{}.{}", self.component, self.control)
        }
    }
}

impl fmt::Display for ControlAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.qualified())
    }
}

/// A component known to the discovery cache (name and type only)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CachedComponent {
    /// Component name as the Core reports it
    pub name: String,
    /// Core component type (e.g. `mixer`, `gain`)
    pub component_type: String,
    /// When the component list containing this entry was fetched
    pub cached_at: DateTime<Utc>,
}

/// Control kind inferred from name patterns and the Core's Type field
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ControlKind {
    /// Level/gain-style numeric control
    Gain,
    /// Boolean mute-style control
    Mute,
    /// Selection control
    Select,
    /// Anything we could not classify
    Unknown,
}

/// Infer a control's kind from its name and the Core-provided Type.
pub fn infer_control_kind(name: &str, value_type: Option<&str>) -> ControlKind {
    let lower = name.to_ascii_lowercase();
    if lower.contains("gain") || lower.contains("level") {
        ControlKind::Gain
    } else if lower.contains("mute") {
        ControlKind::Mute
    } else if lower.contains("select") {
        ControlKind::Select
    } else if value_type == Some("Boolean") {
        ControlKind::Mute
    } else {
        ControlKind::Unknown
    }
}

/// Kind filter accepted by `list_controls`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ControlFilter {
    /// No filtering
    All,
    /// Gain-style controls
    Gain,
    /// Mute-style controls
    Mute,
    /// Selects whose name marks them as input-side
    InputSelect,
    /// Selects whose name marks them as output-side
    OutputSelect,
}

impl ControlFilter {
    /// Check whether a cached control passes this filter
    pub fn matches(&self, control: &CachedControl) -> bool {
        let lower = control.name.to_ascii_lowercase();
        match self {
            Self::All => true,
            Self::Gain => control.kind == ControlKind::Gain,
            Self::Mute => control.kind == ControlKind::Mute,
            Self::InputSelect => control.kind == ControlKind::Select && lower.contains("input"),
            Self::OutputSelect => control.kind == ControlKind::Select && lower.contains("output"),
        }
    }
}

/// Metadata the Core reports for a control descriptor
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ControlMetadata {
    /// Minimum numeric value
    #[serde(skip_serializing_if = "Option::is_none")]
    pub value_min: Option<f64>,
    /// Maximum numeric value
    #[serde(skip_serializing_if = "Option::is_none")]
    pub value_max: Option<f64>,
    /// Engineering units (dB, Hz, ...)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub units: Option<String>,
    /// Step size for numeric controls
    #[serde(skip_serializing_if = "Option::is_none")]
    pub step: Option<f64>,
    /// Read/write direction
    #[serde(skip_serializing_if = "Option::is_none")]
    pub direction: Option<String>,
    /// Normalized position in [0, 1]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub position: Option<f64>,
    /// String rendering of the minimum
    #[serde(skip_serializing_if = "Option::is_none")]
    pub string_min: Option<String>,
    /// String rendering of the maximum
    #[serde(skip_serializing_if = "Option::is_none")]
    pub string_max: Option<String>,
    /// Core value type (Float, Boolean, Text, ...)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub value_type: Option<String>,
}

/// A control descriptor held by the discovery cache
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CachedControl {
    /// Control name within its component
    pub name: String,
    /// Owning component; empty for named controls
    pub component_name: String,
    /// Inferred kind
    pub kind: ControlKind,
    /// Core-provided metadata
    pub metadata: ControlMetadata,
    /// When this descriptor was fetched
    pub cached_at: DateTime<Utc>,
    /// How long the descriptor stays fresh
    #[serde(with = "duration_ms")]
    pub ttl: Duration,
}

impl CachedControl {
    /// Whether the descriptor is still fresh
    pub fn is_fresh(&self, now: DateTime<Utc>) -> bool {
        let age = now.signed_duration_since(self.cached_at);
        age.num_milliseconds() >= 0 && (age.num_milliseconds() as u128) < self.ttl.as_millis()
    }
}

mod duration_ms {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        (d.as_millis() as u64).serialize(s)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(d)?))
    }
}

/// One write within a change group
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ControlWrite {
    /// Fully qualified control name
    pub name: String,
    /// Target value
    pub value: ControlValue,
    /// Optional fade time in seconds, valid range (0, 300]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ramp: Option<f64>,
}

/// Lifecycle status of a change group. Transitions are monotonic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ChangeGroupStatus {
    /// Created, not yet dispatched
    Pending,
    /// Writes in flight
    Applying,
    /// All writes succeeded
    Completed,
    /// At least one write failed (or the group was cancelled)
    Failed,
}

impl ChangeGroupStatus {
    /// Whether moving to `next` respects the monotonic lifecycle
    pub fn can_transition_to(self, next: ChangeGroupStatus) -> bool {
        use ChangeGroupStatus::*;
        matches!(
            (self, next),
            (Pending, Applying) | (Pending, Failed) | (Applying, Completed) | (Applying, Failed)
        )
    }

    /// Terminal statuses never change again
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

/// A batch-write intent tracked by the repository
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChangeGroup {
    /// Opaque unique identifier
    pub id: String,
    /// Writes in submission order
    pub controls: Vec<ControlWrite>,
    /// Creation instant
    pub created_at: DateTime<Utc>,
    /// Free-form originator tag
    pub source: String,
    /// Current lifecycle status
    pub status: ChangeGroupStatus,
}

impl ChangeGroup {
    /// New pending group with a fresh id
    pub fn new(controls: Vec<ControlWrite>, source: impl Into<String>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            controls,
            created_at: Utc::now(),
            source: source.into(),
            status: ChangeGroupStatus::Pending,
        }
    }
}

/// Outcome of a single control write within a batch
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ControlChangeResult {
    /// Fully qualified control name
    pub name: String,
    /// Value the write targeted
    pub target_value: ControlValue,
    /// Whether the write succeeded
    pub success: bool,
    /// Failure detail when `success` is false
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Wall-clock duration of the write
    pub duration_ms: u64,
    /// Value captured before the write, when available
    #[serde(skip_serializing_if = "Option::is_none")]
    pub previous_value: Option<ControlValue>,
    /// Ramp applied, if any
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ramp: Option<f64>,
}

/// Aggregate outcome of a change-group execution
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChangeGroupExecutionResult {
    /// Group this result belongs to
    pub group_id: String,
    /// Number of writes submitted
    pub total_controls: usize,
    /// Writes that succeeded
    pub success_count: usize,
    /// Writes that failed (including aborted dispatches)
    pub failure_count: usize,
    /// Total execution time
    pub execution_ms: u64,
    /// Per-control outcomes in submission order
    pub results: Vec<ControlChangeResult>,
    /// Whether successful writes were rolled back after a failure
    pub rollback_performed: bool,
}

/// Classification of an observed change event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    /// Plain value change
    Change,
    /// Value crossed a configured threshold
    ThresholdCrossed,
    /// Numeric delta exceeded the significance percentage
    SignificantChange,
    /// Boolean flip or sign change
    StateTransition,
}

/// An observed change retained by the event cache
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CachedEvent {
    /// Change group the event belongs to
    pub group_id: String,
    /// Control that changed
    pub control_name: String,
    /// New value
    pub value: ControlValue,
    /// Core-provided string rendering, when present
    #[serde(skip_serializing_if = "Option::is_none")]
    pub string_value: Option<String>,
    /// Nanosecond timestamp (authoritative ordering domain)
    pub timestamp_ns: i64,
    /// Millisecond timestamp (JSON-friendly)
    pub timestamp_ms: i64,
    /// Strictly increasing per group
    pub sequence_number: u64,
    /// Prior value of the same control, when derivable
    #[serde(skip_serializing_if = "Option::is_none")]
    pub previous_value: Option<ControlValue>,
    /// Numeric delta against the prior value, when derivable
    #[serde(skip_serializing_if = "Option::is_none")]
    pub delta: Option<f64>,
    /// Inferred classification
    pub event_kind: EventKind,
}

/// Running cache counters surfaced through `get_statistics`
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CacheStatistics {
    /// Reads served from cache
    pub hits: u64,
    /// Reads that missed
    pub misses: u64,
    /// Entries evicted (any reason)
    pub evictions: u64,
    /// Estimated memory footprint in bytes
    pub memory_usage_bytes: u64,
    /// Time since the repository was initialized
    pub uptime_ms: u64,
    /// hits / (hits + misses); 0 when no reads yet
    pub hit_ratio: f64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_component_scoped_name() {
        let addr = ControlAddress::parse("MainMixer.gain").unwrap();
        assert_eq!(addr.component, "MainMixer");
        assert_eq!(addr.control, "gain");
        assert!(!addr.is_bare());
        assert_eq!(addr.qualified(), "MainMixer.gain");
    }

    #[test]
    fn test_parse_splits_at_first_dot_only() {
        let addr = ControlAddress::parse("A.b.c").unwrap();
        assert_eq!(addr.component, "A");
        assert_eq!(addr.control, "b.c");
    }

    #[test]
    fn test_parse_bare_name() {
        let addr = ControlAddress::parse("x").unwrap();
        assert_eq!(addr.component, "");
        assert_eq!(addr.control, "x");
        assert!(addr.is_bare());
        assert_eq!(addr.qualified(), "x");
    }

    #[test]
    fn test_parse_rejects_empty_and_whitespace() {
        assert!(ControlAddress::parse("").is_err());
        assert!(ControlAddress::parse("   ").is_err());
        assert!(ControlAddress::parse("\t\n").is_err());
    }

    #[test]
    fn test_parse_rejects_trailing_dot() {
        assert!(ControlAddress::parse("Mixer.").is_err());
    }

    #[test]
    fn test_control_value_untagged_decoding() {
        let v: ControlValue = serde_json::from_str("true").unwrap();
        assert_eq!(v, ControlValue::Bool(true));
        let v: ControlValue = serde_json::from_str("-10.5").unwrap();
        assert_eq!(v, ControlValue::Number(-10.5));
        let v: ControlValue = serde_json::from_str("\"Input 3\"").unwrap();
        assert_eq!(v, ControlValue::Text("Input 3".into()));
    }

    #[test]
    fn test_control_value_from_json_rejects_null() {
        assert!(ControlValue::from_json(&serde_json::Value::Null).is_none());
        assert!(ControlValue::from_json(&serde_json::json!([1, 2])).is_none());
    }

    #[test]
    fn test_status_transitions_are_monotonic() {
        use ChangeGroupStatus::*;
        assert!(Pending.can_transition_to(Applying));
        assert!(Applying.can_transition_to(Completed));
        assert!(Applying.can_transition_to(Failed));
        assert!(Pending.can_transition_to(Failed));

        assert!(!Completed.can_transition_to(Applying));
        assert!(!Completed.can_transition_to(Failed));
        assert!(!Failed.can_transition_to(Pending));
        assert!(!Applying.can_transition_to(Pending));
    }

    #[test]
    fn test_infer_control_kind() {
        assert_eq!(infer_control_kind("gain", None), ControlKind::Gain);
        assert_eq!(infer_control_kind("input.level", None), ControlKind::Gain);
        assert_eq!(infer_control_kind("mute", None), ControlKind::Mute);
        assert_eq!(infer_control_kind("input_select", None), ControlKind::Select);
        assert_eq!(
            infer_control_kind("bypass", Some("Boolean")),
            ControlKind::Mute
        );
        assert_eq!(infer_control_kind("label", Some("Text")), ControlKind::Unknown);
    }

    #[test]
    fn test_control_filter_select_sides() {
        let mk = |name: &str| CachedControl {
            name: name.to_string(),
            component_name: "Router".to_string(),
            kind: infer_control_kind(name, None),
            metadata: ControlMetadata::default(),
            cached_at: Utc::now(),
            ttl: Duration::from_secs(60),
        };

        assert!(ControlFilter::InputSelect.matches(&mk("input_select")));
        assert!(!ControlFilter::InputSelect.matches(&mk("output_select")));
        assert!(ControlFilter::OutputSelect.matches(&mk("output_select")));
        assert!(ControlFilter::All.matches(&mk("anything")));
    }

    #[test]
    fn test_cached_control_freshness() {
        let mut control = CachedControl {
            name: "gain".to_string(),
            component_name: "Mixer".to_string(),
            kind: ControlKind::Gain,
            metadata: ControlMetadata::default(),
            cached_at: Utc::now(),
            ttl: Duration::from_secs(60),
        };
        assert!(control.is_fresh(Utc::now()));

        control.cached_at = Utc::now() - chrono::Duration::seconds(120);
        assert!(!control.is_fresh(Utc::now()));
    }
}
