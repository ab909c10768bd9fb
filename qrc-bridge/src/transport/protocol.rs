//! JSON-RPC 2.0 framing and narrow parsers for QRC payloads
//!
//! The Core's responses are shape-validated here and projected into typed
//! structs; unexpected fields are preserved in `extras` maps rather than
//! discarded, so raw-command consumers lose nothing.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{Error, Result};

/// WebSocket path of the QRC public API
pub const QRC_ENDPOINT_PATH: &str = "/qrc-public-api/v0";

/// QRC method identifiers (bit-exact)
pub mod methods {
    /// Authenticate the session
    pub const LOGON: &str = "Logon";
    /// Application-level keepalive
    pub const NO_OP: &str = "NoOp";
    /// List components in the running design
    pub const COMPONENT_GET_COMPONENTS: &str = "Component.GetComponents";
    /// Read named controls of one component
    pub const COMPONENT_GET: &str = "Component.Get";
    /// Write controls of one component
    pub const COMPONENT_SET: &str = "Component.Set";
    /// List all controls of one component
    pub const COMPONENT_GET_CONTROLS: &str = "Component.GetControls";
    /// Read one named control
    pub const CONTROL_GET: &str = "Control.Get";
    /// Read several named controls
    pub const CONTROL_GET_VALUES: &str = "Control.GetValues";
    /// Write several named controls
    pub const CONTROL_SET: &str = "Control.Set";
    /// Write one named control
    pub const CONTROL_SET_VALUE: &str = "Control.SetValue";
    /// Subscribe a named control into a change group
    pub const CHANGE_GROUP_ADD_CONTROL: &str = "ChangeGroup.AddControl";
    /// Subscribe a component control into a change group
    pub const CHANGE_GROUP_ADD_COMPONENT_CONTROL: &str = "ChangeGroup.AddComponentControl";
    /// Remove controls from a change group
    pub const CHANGE_GROUP_REMOVE: &str = "ChangeGroup.Remove";
    /// Drop a change group
    pub const CHANGE_GROUP_CLEAR: &str = "ChangeGroup.Clear";
    /// Reset a change group so every control reports on next poll
    pub const CHANGE_GROUP_INVALIDATE: &str = "ChangeGroup.Invalidate";
    /// Fetch pending changes for a change group
    pub const CHANGE_GROUP_POLL: &str = "ChangeGroup.Poll";
    /// Ask the Core to push poll results at a fixed rate
    pub const CHANGE_GROUP_AUTO_POLL: &str = "ChangeGroup.AutoPoll";
    /// Core status snapshot
    pub const STATUS_GET: &str = "Status.Get";
}

/// Largest correlation id we will allocate; wraps back to 1 past this.
/// Chosen below 2^53−1 so ids survive JSON number round-trips.
pub const MAX_SAFE_ID: u64 = (1 << 53) - 1;

/// An outbound JSON-RPC request or notification
#[derive(Debug, Serialize)]
pub struct RpcRequest<'a> {
    /// Always "2.0"
    pub jsonrpc: &'static str,
    /// Method identifier
    pub method: &'a str,
    /// Parameters; omitted when null
    #[serde(skip_serializing_if = "Value::is_null")]
    pub params: Value,
    /// Correlation id; absent for notifications
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<u64>,
}

impl<'a> RpcRequest<'a> {
    /// A call expecting a response
    pub fn call(method: &'a str, params: Value, id: u64) -> Self {
        Self {
            jsonrpc: "2.0",
            method,
            params,
            id: Some(id),
        }
    }

    /// A fire-and-forget notification
    pub fn notification(method: &'a str, params: Value) -> Self {
        Self {
            jsonrpc: "2.0",
            method,
            params,
            id: None,
        }
    }

    /// Encode as one WebSocket text frame
    pub fn encode(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }
}

/// JSON-RPC error object
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcError {
    /// Numeric error code
    pub code: i64,
    /// Error message
    pub message: String,
    /// Optional structured detail
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

/// One inbound frame: response, error, or server-initiated notification.
///
/// Some Core firmware omits or nulls the `id` on responses; the decoder
/// keeps the raw id value so the client can fall back to FIFO matching.
#[derive(Debug, Deserialize)]
pub struct RpcFrame {
    /// Protocol version marker, when present
    #[serde(default)]
    pub jsonrpc: Option<String>,
    /// Raw correlation id; may be null or missing
    #[serde(default)]
    pub id: Option<Value>,
    /// Method name on notifications
    #[serde(default)]
    pub method: Option<String>,
    /// Notification parameters
    #[serde(default)]
    pub params: Option<Value>,
    /// Call result
    #[serde(default)]
    pub result: Option<Value>,
    /// Call error
    #[serde(default)]
    pub error: Option<RpcError>,
}

impl RpcFrame {
    /// Decode one text frame
    pub fn decode(text: &str) -> Result<Self> {
        Ok(serde_json::from_str(text)?)
    }

    /// Whether this frame answers a pending call (as opposed to a
    /// server-initiated notification)
    pub fn is_response(&self) -> bool {
        self.result.is_some() || self.error.is_some()
    }

    /// Correlation id as u64, when present and numeric
    pub fn id_u64(&self) -> Option<u64> {
        match &self.id {
            Some(Value::Number(n)) => n.as_u64(),
            Some(Value::String(s)) => s.parse().ok(),
            _ => None,
        }
    }
}

/// A component as reported by `Component.GetComponents`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComponentInfo {
    /// Component name
    #[serde(rename = "Name")]
    pub name: String,
    /// Component type
    #[serde(rename = "Type", default)]
    pub component_type: String,
    /// Design-time properties
    #[serde(rename = "Properties", default)]
    pub properties: Vec<Value>,
    /// Fields we do not model
    #[serde(flatten)]
    pub extras: serde_json::Map<String, Value>,
}

/// A control as it appears in `Component.Get`, `Component.GetControls`,
/// and `Control.GetValues` results
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WireControl {
    /// Control name
    #[serde(rename = "Name")]
    pub name: String,
    /// Raw value
    #[serde(rename = "Value", default)]
    pub value: Value,
    /// String rendering
    #[serde(rename = "String", default)]
    pub string: Option<String>,
    /// Normalized position
    #[serde(rename = "Position", default)]
    pub position: Option<f64>,
    /// Numeric minimum
    #[serde(rename = "ValueMin", default)]
    pub value_min: Option<f64>,
    /// Numeric maximum
    #[serde(rename = "ValueMax", default)]
    pub value_max: Option<f64>,
    /// String rendering of the minimum
    #[serde(rename = "StringMin", default)]
    pub string_min: Option<String>,
    /// String rendering of the maximum
    #[serde(rename = "StringMax", default)]
    pub string_max: Option<String>,
    /// Read/write direction
    #[serde(rename = "Direction", default)]
    pub direction: Option<String>,
    /// Core value type
    #[serde(rename = "Type", default)]
    pub value_type: Option<String>,
    /// Fields we do not model
    #[serde(flatten)]
    pub extras: serde_json::Map<String, Value>,
}

/// `Status.Get` result
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoreStatus {
    /// Hardware platform
    #[serde(rename = "Platform", default)]
    pub platform: String,
    /// Firmware version
    #[serde(rename = "Version", default)]
    pub version: String,
    /// Running design name
    #[serde(rename = "DesignName", default)]
    pub design_name: String,
    /// Status block; shape varies by firmware
    #[serde(rename = "Status", default)]
    pub status: Option<Value>,
    /// Fields we do not model
    #[serde(flatten)]
    pub extras: serde_json::Map<String, Value>,
}

/// One change inside a `ChangeGroup.Poll` result
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PollChange {
    /// Control name; component controls also carry `Component`
    #[serde(rename = "Name")]
    pub name: String,
    /// Owning component for component controls
    #[serde(rename = "Component", default)]
    pub component: Option<String>,
    /// New value
    #[serde(rename = "Value", default)]
    pub value: Value,
    /// String rendering
    #[serde(rename = "String", default)]
    pub string: Option<String>,
    /// Fields we do not model
    #[serde(flatten)]
    pub extras: serde_json::Map<String, Value>,
}

impl PollChange {
    /// Fully-qualified control name in our grammar
    pub fn qualified_name(&self) -> String {
        match &self.component {
            Some(component) if !component.is_empty() => {
                format!("{}.{}", component, self.name)
            }
            _ => self.name.clone(),
        }
    }
}

/// `ChangeGroup.Poll` result
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PollResult {
    /// Group id as the Core reports it
    #[serde(rename = "Id", default)]
    pub id: Value,
    /// Changes since the last poll
    #[serde(rename = "Changes", default)]
    pub changes: Vec<PollChange>,
    /// Fields we do not model
    #[serde(flatten)]
    pub extras: serde_json::Map<String, Value>,
}

impl PollResult {
    /// Group id rendered as a string
    pub fn id_string(&self) -> String {
        match &self.id {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        }
    }
}

/// Parse a `Component.GetComponents` result
pub fn parse_components(result: &Value) -> Result<Vec<ComponentInfo>> {
    let array = match result {
        Value::Array(items) => items.clone(),
        Value::Object(map) => match map.get("Components") {
            Some(Value::Array(items)) => items.clone(),
            _ => {
                return Err(Error::CommandFailed {
                    method: methods::COMPONENT_GET_COMPONENTS.to_string(),
                    code: -1,
                    message: "result is not a component array".to_string(),
                })
            }
        },
        _ => {
            return Err(Error::CommandFailed {
                method: methods::COMPONENT_GET_COMPONENTS.to_string(),
                code: -1,
                message: "result is not a component array".to_string(),
            })
        }
    };

    array
        .into_iter()
        .map(|item| serde_json::from_value(item).map_err(Error::from))
        .collect()
}

/// Parse controls out of a `Component.Get` / `Component.GetControls` result
pub fn parse_component_controls(method: &str, result: &Value) -> Result<Vec<WireControl>> {
    let controls = result.get("Controls").cloned().unwrap_or(Value::Null);
    match controls {
        Value::Array(items) => items
            .into_iter()
            .map(|item| serde_json::from_value(item).map_err(Error::from))
            .collect(),
        _ => Err(Error::CommandFailed {
            method: method.to_string(),
            code: -1,
            message: "result carries no Controls array".to_string(),
        }),
    }
}

/// Parse a `Control.GetValues` (or `Control.Get`) result.
///
/// Depending on firmware the result is either a bare array of controls or
/// an object wrapping one.
pub fn parse_control_values(result: &Value) -> Result<Vec<WireControl>> {
    match result {
        Value::Array(items) => items
            .iter()
            .cloned()
            .map(|item| serde_json::from_value(item).map_err(Error::from))
            .collect(),
        Value::Object(map) => match map.get("Controls") {
            Some(Value::Array(items)) => items
                .iter()
                .cloned()
                .map(|item| serde_json::from_value(item).map_err(Error::from))
                .collect(),
            // A single-control read may come back as one object
            _ => Ok(vec![serde_json::from_value(result.clone())?]),
        },
        _ => Err(Error::CommandFailed {
            method: methods::CONTROL_GET_VALUES.to_string(),
            code: -1,
            message: "result is not a control array".to_string(),
        }),
    }
}

/// Parse a `Status.Get` result
pub fn parse_core_status(result: &Value) -> Result<CoreStatus> {
    Ok(serde_json::from_value(result.clone())?)
}

/// Parse a `ChangeGroup.Poll` result
pub fn parse_poll_result(result: &Value) -> Result<PollResult> {
    Ok(serde_json::from_value(result.clone())?)
}
