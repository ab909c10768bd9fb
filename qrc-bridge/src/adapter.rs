//! Semantic adapter: frontend operations over the QRC wire protocol
//!
//! Translates named operations into QRC calls, serving reads from the state
//! cache when fresh and grouping writes by component. The raw-command path
//! is gated by a deny-list so nothing can power-cycle the Core through the
//! bridge.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use regex::Regex;
use serde_json::{json, Value};
use tokio::sync::Mutex;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::cache::discovery::DiscoveryCache;
use crate::error::{Error, Result};
use crate::model::{
    infer_control_kind, CachedComponent, CachedControl, ChangeGroupExecutionResult,
    ControlAddress, ControlFilter, ControlMetadata, ControlState, ControlValue, ControlWrite,
    StateSource,
};
use crate::state::{ControlRepository, StateRepository};
use crate::transport::{methods, protocol, ComponentInfo, QrcPort, TransportEvent, WireControl};

/// Most names accepted by one `get_control_values` call
pub const MAX_CONTROLS_PER_READ: usize = 100;

/// How long a Core status snapshot stays fresh
const STATUS_TTL: Duration = Duration::from_secs(10);

/// Frontend-facing operations
pub struct SemanticAdapter {
    port: Arc<dyn QrcPort>,
    repo: Arc<StateRepository>,
    discovery: Mutex<DiscoveryCache>,
    deny_list: Vec<String>,
    status_cache: Mutex<Option<(protocol::CoreStatus, Instant)>>,
}

impl SemanticAdapter {
    /// Adapter over the given port and repository
    pub fn new(
        port: Arc<dyn QrcPort>,
        repo: Arc<StateRepository>,
        deny_list: Vec<String>,
    ) -> Arc<Self> {
        Arc::new(Self {
            port,
            repo,
            discovery: Mutex::new(DiscoveryCache::default()),
            deny_list,
            status_cache: Mutex::new(None),
        })
    }

    /// List components in the running design.
    ///
    /// Served from the discovery cache while fresh, unless properties are
    /// requested (the cache stores name and type only).
    pub async fn list_components(
        &self,
        filter: Option<&str>,
        include_properties: bool,
    ) -> Result<Vec<ComponentInfo>> {
        let regex = filter
            .map(Regex::new)
            .transpose()
            .map_err(|e| Error::Validation(format!("invalid component filter: {}", e)))?;

        if !include_properties {
            let discovery = self.discovery.lock().await;
            if let Some(cached) = discovery.components() {
                let components = cached
                    .iter()
                    .filter(|c| regex.as_ref().map_or(true, |r| r.is_match(&c.name)))
                    .map(|c| ComponentInfo {
                        name: c.name.clone(),
                        component_type: c.component_type.clone(),
                        properties: Vec::new(),
                        extras: serde_json::Map::new(),
                    })
                    .collect();
                return Ok(components);
            }
        }

        let result = self
            .port
            .send_command(methods::COMPONENT_GET_COMPONENTS, json!({}))
            .await?;
        let mut components = protocol::parse_components(&result)?;

        {
            let now = Utc::now();
            let mut discovery = self.discovery.lock().await;
            discovery.store_components(
                components
                    .iter()
                    .map(|c| CachedComponent {
                        name: c.name.clone(),
                        component_type: c.component_type.clone(),
                        cached_at: now,
                    })
                    .collect(),
            );
        }

        components.retain(|c| regex.as_ref().map_or(true, |r| r.is_match(&c.name)));
        if !include_properties {
            for component in &mut components {
                component.properties.clear();
            }
        }
        Ok(components)
    }

    /// Read named controls of one component
    pub async fn component_get(
        &self,
        component: &str,
        control_names: &[String],
    ) -> Result<Vec<ControlState>> {
        if component.trim().is_empty() {
            return Err(Error::Validation(
                "component name must not be empty".to_string(),
            ));
        }
        let controls: Vec<Value> = control_names
            .iter()
            .map(|name| json!({ "Name": name }))
            .collect();
        let result = self
            .port
            .send_command(
                methods::COMPONENT_GET,
                json!({ "Name": component, "Controls": controls }),
            )
            .await
            .map_err(|err| classify_component_error(err, component))?;

        let wire = protocol::parse_component_controls(methods::COMPONENT_GET, &result)?;
        let states = self.cache_wire_controls(component, &wire).await;
        Ok(states)
    }

    /// List controls, optionally restricted to one component and a kind
    pub async fn list_controls(
        &self,
        component: Option<&str>,
        filter: ControlFilter,
    ) -> Result<Vec<CachedControl>> {
        let targets: Vec<String> = match component {
            Some(name) => vec![name.to_string()],
            None => self
                .list_components(None, false)
                .await?
                .into_iter()
                .map(|c| c.name)
                .collect(),
        };

        let mut out = Vec::new();
        for target in targets {
            let cached: Option<Vec<CachedControl>> = {
                let mut discovery = self.discovery.lock().await;
                discovery
                    .controls(&target)
                    .map(|set| set.values().cloned().collect())
            };

            let controls = match cached {
                Some(controls) => controls,
                None => {
                    let result = self
                        .port
                        .send_command(
                            methods::COMPONENT_GET_CONTROLS,
                            json!({ "Name": target }),
                        )
                        .await
                        .map_err(|err| classify_component_error(err, &target))?;
                    let wire = protocol::parse_component_controls(
                        methods::COMPONENT_GET_CONTROLS,
                        &result,
                    )?;

                    let mut discovery = self.discovery.lock().await;
                    let ttl = discovery.control_ttl();
                    let now = Utc::now();
                    let descriptors: Vec<CachedControl> = wire
                        .iter()
                        .map(|control| CachedControl {
                            name: control.name.clone(),
                            component_name: target.clone(),
                            kind: infer_control_kind(
                                &control.name,
                                control.value_type.as_deref(),
                            ),
                            metadata: metadata_from_wire(control),
                            cached_at: now,
                            ttl,
                        })
                        .collect();
                    discovery.store_controls(&target, descriptors.clone());
                    descriptors
                }
            };

            out.extend(controls.into_iter().filter(|c| filter.matches(c)));
        }

        out.sort_by(|a, b| {
            a.component_name
                .cmp(&b.component_name)
                .then(a.name.cmp(&b.name))
        });
        Ok(out)
    }

    /// Read up to 100 controls by fully-qualified name, cache-first
    pub async fn get_control_values(&self, names: &[String]) -> Result<Vec<ControlState>> {
        if names.len() > MAX_CONTROLS_PER_READ {
            return Err(Error::Validation(format!(
                "at most {} control names per read, got {}",
                MAX_CONTROLS_PER_READ,
                names.len()
            )));
        }

        let mut resolved: std::collections::HashMap<String, ControlState> =
            std::collections::HashMap::new();
        let mut bare_misses: Vec<String> = Vec::new();
        let mut component_misses: std::collections::HashMap<String, Vec<String>> =
            std::collections::HashMap::new();

        for name in names {
            let address = ControlAddress::parse(name)?;
            if let Some(mut state) = self.repo.get_state(name).await {
                state.source = StateSource::Cache;
                resolved.insert(name.clone(), state);
            } else if address.is_bare() {
                bare_misses.push(address.control);
            } else {
                component_misses
                    .entry(address.component)
                    .or_default()
                    .push(address.control);
            }
        }

        if !bare_misses.is_empty() {
            let result = self
                .port
                .send_command(
                    methods::CONTROL_GET_VALUES,
                    json!({ "Names": bare_misses }),
                )
                .await?;
            let wire = protocol::parse_control_values(&result)?;
            for state in self.cache_wire_controls("", &wire).await {
                resolved.insert(state.name.clone(), state);
            }
        }

        for (component, controls) in component_misses {
            let control_names: Vec<Value> = controls
                .iter()
                .map(|name| json!({ "Name": name }))
                .collect();
            let result = self
                .port
                .send_command(
                    methods::COMPONENT_GET,
                    json!({ "Name": component, "Controls": control_names }),
                )
                .await
                .map_err(|err| classify_component_error(err, &component))?;
            let wire = protocol::parse_component_controls(methods::COMPONENT_GET, &result)?;
            for state in self.cache_wire_controls(&component, &wire).await {
                resolved.insert(state.name.clone(), state);
            }
        }

        names
            .iter()
            .map(|name| {
                resolved
                    .remove(name)
                    .ok_or_else(|| Error::InvalidControl(name.clone()))
            })
            .collect()
    }

    /// Write controls as one change group, with an optional shared ramp
    pub async fn set_control_values(
        &self,
        values: Vec<(String, ControlValue)>,
        ramp: Option<f64>,
    ) -> Result<ChangeGroupExecutionResult> {
        let writes: Vec<ControlWrite> = values
            .into_iter()
            .map(|(name, value)| ControlWrite { name, value, ramp })
            .collect();
        let group = self.repo.create_change_group(writes, "adapter").await?;
        self.repo.execute_change_group(&group.id, None).await
    }

    /// Core status snapshot, cached briefly
    pub async fn query_core_status(
        &self,
        include_details: bool,
        include_network: bool,
        include_performance: bool,
    ) -> Result<Value> {
        let status = {
            let cached = self.status_cache.lock().await;
            match &*cached {
                Some((status, fetched_at)) if fetched_at.elapsed() < STATUS_TTL => {
                    Some(status.clone())
                }
                _ => None,
            }
        };

        let status = match status {
            Some(status) => status,
            None => {
                let result = self.port.send_command(methods::STATUS_GET, json!({})).await?;
                let status = protocol::parse_core_status(&result)?;
                *self.status_cache.lock().await = Some((status.clone(), Instant::now()));
                status
            }
        };

        let mut out = json!({
            "Platform": status.platform,
            "Version": status.version,
            "DesignName": status.design_name,
            "Status": status.status,
        });
        let object = out.as_object_mut().expect("literal object");

        if include_details {
            for (key, value) in &status.extras {
                object.insert(key.clone(), value.clone());
            }
        } else {
            if include_network {
                for (key, value) in extras_matching(&status, &["network", "interface", "lan"]) {
                    object.insert(key, value);
                }
            }
            if include_performance {
                for (key, value) in
                    extras_matching(&status, &["performance", "cpu", "memory", "fan", "temperature"])
                {
                    object.insert(key, value);
                }
            }
        }

        Ok(out)
    }

    /// Send an arbitrary QRC command, subject to the deny-list.
    ///
    /// Denied methods are rejected before anything reaches the socket.
    pub async fn send_raw_command(
        &self,
        method: &str,
        params: Value,
        timeout: Option<Duration>,
    ) -> Result<Value> {
        let method = method.trim();
        if method.is_empty() {
            return Err(Error::Validation("method must not be empty".to_string()));
        }
        if self
            .deny_list
            .iter()
            .any(|denied| denied.eq_ignore_ascii_case(method))
        {
            return Err(Error::Validation(format!(
                "method '{}' is deny-listed",
                method
            )));
        }

        match timeout {
            Some(timeout) => {
                self.port
                    .send_command_with_timeout(method, params, timeout)
                    .await
            }
            None => self.port.send_command(method, params).await,
        }
    }

    /// Forget cached discovery; it rebuilds on the next request
    pub async fn invalidate_discovery(&self) {
        self.discovery.lock().await.invalidate_all();
        *self.status_cache.lock().await = None;
    }

    /// React to transport lifecycle: clear discovery on every close, and
    /// clear control state after an outage long enough to make it stale
    pub fn watch_transport(
        self: &Arc<Self>,
        mut events: tokio::sync::broadcast::Receiver<TransportEvent>,
    ) -> CancellationToken {
        let adapter = Arc::clone(self);
        let cancel = CancellationToken::new();
        let token = cancel.clone();

        tokio::spawn(async move {
            loop {
                let event = tokio::select! {
                    _ = token.cancelled() => break,
                    received = events.recv() => match received {
                        Ok(event) => event,
                        Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
                        Err(_) => break,
                    }
                };
                match event {
                    TransportEvent::Disconnected { .. } => {
                        adapter.invalidate_discovery().await;
                    }
                    TransportEvent::Connected {
                        requires_cache_invalidation: true,
                        downtime_ms,
                    } => {
                        tracing::info!(
                            downtime_ms,
                            "Long outage; clearing control-state cache"
                        );
                        adapter.repo.clear().await;
                    }
                    _ => {}
                }
            }
        });

        cancel
    }

    /// Store wire controls into the repository and return them as states
    async fn cache_wire_controls(
        &self,
        component: &str,
        wire: &[WireControl],
    ) -> Vec<ControlState> {
        let mut states = Vec::with_capacity(wire.len());
        for control in wire {
            let Some(value) = ControlValue::from_json(&control.value) else {
                tracing::debug!(control = %control.name, "Skipping control with no value");
                continue;
            };
            let name = if component.is_empty() {
                control.name.clone()
            } else {
                format!("{}.{}", component, control.name)
            };
            let state = ControlState::new(&name, value, StateSource::Qsys);
            if let Err(e) = self.repo.set_state(state.clone()).await {
                tracing::warn!(control = %name, "Cache write failed: {}", e);
            }
            states.push(state);
        }
        states
    }
}

fn metadata_from_wire(control: &WireControl) -> ControlMetadata {
    ControlMetadata {
        value_min: control.value_min,
        value_max: control.value_max,
        units: None,
        step: None,
        direction: control.direction.clone(),
        position: control.position,
        string_min: control.string_min.clone(),
        string_max: control.string_max.clone(),
        value_type: control.value_type.clone(),
    }
}

fn extras_matching(status: &protocol::CoreStatus, needles: &[&str]) -> Vec<(String, Value)> {
    status
        .extras
        .iter()
        .filter(|(key, _)| {
            let lower = key.to_ascii_lowercase();
            needles.iter().any(|needle| lower.contains(needle))
        })
        .map(|(key, value)| (key.clone(), value.clone()))
        .collect()
}

/// Map a Core rejection of a component-scoped call onto the taxonomy
fn classify_component_error(err: Error, component: &str) -> Error {
    match &err {
        Error::CommandFailed { message, .. } => {
            let lower = message.to_ascii_lowercase();
            if lower.contains("component") && (lower.contains("unknown") || lower.contains("not found")) {
                Error::InvalidComponent(component.to_string())
            } else if lower.contains("control") && (lower.contains("unknown") || lower.contains("not found")) {
                Error::InvalidControl(component.to_string())
            } else {
                err
            }
        }
        _ => err,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::changegroup::{ChangeGroupExecutor, ChangeGroupOptions};
    use crate::config::CacheConfig;
    use crate::transport::testing::MockQrcPort;

    async fn adapter_with(port: Arc<MockQrcPort>) -> Arc<SemanticAdapter> {
        let executor =
            ChangeGroupExecutor::new(Arc::clone(&port) as Arc<dyn QrcPort>, ChangeGroupOptions::default());
        let repo = StateRepository::new(executor);
        repo.initialize(CacheConfig::default()).await.unwrap();
        SemanticAdapter::new(
            port,
            repo,
            vec!["Core.Reboot".to_string(), "Core.FactoryReset".to_string()],
        )
    }

    fn happy_port() -> Arc<MockQrcPort> {
        Arc::new(MockQrcPort::with_responder(|method, params| match method {
            methods::COMPONENT_GET_COMPONENTS => Ok(json!([
                {"Name": "MainMixer", "Type": "mixer", "Properties": [{"Name": "size", "Value": "8x8"}]},
                {"Name": "Delay1", "Type": "delay", "Properties": []}
            ])),
            methods::COMPONENT_GET => Ok(json!({
                "Name": params["Name"],
                "Controls": [{"Name": "gain", "Value": -10.5, "String": "-10.5dB", "Position": 0.42}]
            })),
            methods::COMPONENT_GET_CONTROLS => Ok(json!({
                "Controls": [
                    {"Name": "gain", "Value": -10.5, "Type": "Float", "ValueMin": -100.0, "ValueMax": 20.0},
                    {"Name": "mute", "Value": false, "Type": "Boolean"},
                    {"Name": "input_select", "Value": 3.0, "Type": "Float"}
                ]
            })),
            methods::CONTROL_GET_VALUES => Ok(json!([
                {"Name": "master_volume", "Value": 0.8, "String": "80%"}
            ])),
            methods::STATUS_GET => Ok(json!({
                "Platform": "Core 110f",
                "Version": "9.10.1",
                "DesignName": "Lobby",
                "Status": {"Code": 0, "String": "OK"},
                "NetworkInterface": {"Ip": "10.0.0.5"},
                "CpuUsage": 12.5
            })),
            _ => Ok(Value::Null),
        }))
    }

    #[tokio::test]
    async fn test_happy_read_then_cache_hit() {
        let port = happy_port();
        let adapter = adapter_with(Arc::clone(&port)).await;

        let states = adapter
            .get_control_values(&["MainMixer.gain".to_string()])
            .await
            .unwrap();
        assert_eq!(states.len(), 1);
        assert_eq!(states[0].name, "MainMixer.gain");
        assert_eq!(states[0].value, ControlValue::Number(-10.5));
        assert_eq!(port.calls_for(methods::COMPONENT_GET).len(), 1);

        // Second read within TTL: served from cache, no further QRC traffic.
        let states = adapter
            .get_control_values(&["MainMixer.gain".to_string()])
            .await
            .unwrap();
        assert_eq!(states[0].source, StateSource::Cache);
        assert_eq!(port.calls_for(methods::COMPONENT_GET).len(), 1);
    }

    #[tokio::test]
    async fn test_get_control_values_rejects_over_100() {
        let adapter = adapter_with(happy_port()).await;
        let names: Vec<String> = (0..101).map(|i| format!("c{}", i)).collect();
        let result = adapter.get_control_values(&names).await;
        assert!(matches!(result, Err(Error::Validation(_))));
    }

    #[tokio::test]
    async fn test_bare_names_use_control_get_values() {
        let port = happy_port();
        let adapter = adapter_with(Arc::clone(&port)).await;

        let states = adapter
            .get_control_values(&["master_volume".to_string()])
            .await
            .unwrap();
        assert_eq!(states[0].value, ControlValue::Number(0.8));
        assert_eq!(port.calls_for(methods::CONTROL_GET_VALUES).len(), 1);
        assert!(port.calls_for(methods::COMPONENT_GET).is_empty());
    }

    #[tokio::test]
    async fn test_list_components_caches_and_filters() {
        let port = happy_port();
        let adapter = adapter_with(Arc::clone(&port)).await;

        let all = adapter.list_components(None, false).await.unwrap();
        assert_eq!(all.len(), 2);

        // Filtered call is served from the discovery cache.
        let mixers = adapter.list_components(Some("Mixer"), false).await.unwrap();
        assert_eq!(mixers.len(), 1);
        assert_eq!(mixers[0].name, "MainMixer");
        assert_eq!(port.calls_for(methods::COMPONENT_GET_COMPONENTS).len(), 1);

        // Properties force a live fetch.
        let detailed = adapter.list_components(None, true).await.unwrap();
        assert!(!detailed[0].properties.is_empty());
        assert_eq!(port.calls_for(methods::COMPONENT_GET_COMPONENTS).len(), 2);
    }

    #[tokio::test]
    async fn test_list_controls_filters_by_kind() {
        let adapter = adapter_with(happy_port()).await;

        let all = adapter
            .list_controls(Some("MainMixer"), ControlFilter::All)
            .await
            .unwrap();
        assert_eq!(all.len(), 3);

        let gains = adapter
            .list_controls(Some("MainMixer"), ControlFilter::Gain)
            .await
            .unwrap();
        assert_eq!(gains.len(), 1);
        assert_eq!(gains[0].name, "gain");
        assert_eq!(gains[0].metadata.value_min, Some(-100.0));

        let selects = adapter
            .list_controls(Some("MainMixer"), ControlFilter::InputSelect)
            .await
            .unwrap();
        assert_eq!(selects.len(), 1);
        assert_eq!(selects[0].name, "input_select");
    }

    #[tokio::test]
    async fn test_set_control_values_routes_through_change_group() {
        let port = happy_port();
        let adapter = adapter_with(Arc::clone(&port)).await;

        let result = adapter
            .set_control_values(
                vec![("MainMixer.gain".to_string(), ControlValue::Number(-6.0))],
                Some(1.5),
            )
            .await
            .unwrap();

        assert_eq!(result.success_count, 1);
        let sets = port.calls_for(methods::COMPONENT_SET);
        assert_eq!(sets.len(), 1);
        assert_eq!(sets[0]["Controls"][0]["Ramp"], 1.5);
    }

    #[tokio::test]
    async fn test_raw_command_deny_list_sends_nothing() {
        let port = happy_port();
        let adapter = adapter_with(Arc::clone(&port)).await;

        let result = adapter
            .send_raw_command("Core.Reboot", json!({}), None)
            .await;
        assert!(matches!(result, Err(Error::Validation(_))));
        // Case-insensitive match.
        let result = adapter
            .send_raw_command("core.reboot", json!({}), None)
            .await;
        assert!(matches!(result, Err(Error::Validation(_))));

        assert!(port.calls().is_empty());
    }

    #[tokio::test]
    async fn test_raw_command_passthrough() {
        let port = happy_port();
        let adapter = adapter_with(Arc::clone(&port)).await;

        adapter
            .send_raw_command("Snapshot.Load", json!({"Name": "Scene 1", "Bank": 1}), None)
            .await
            .unwrap();
        assert_eq!(port.calls_for("Snapshot.Load").len(), 1);
    }

    #[tokio::test]
    async fn test_query_core_status_shapes_output() {
        let adapter = adapter_with(happy_port()).await;

        let basic = adapter.query_core_status(false, false, false).await.unwrap();
        assert_eq!(basic["Platform"], "Core 110f");
        assert!(basic.get("NetworkInterface").is_none());
        assert!(basic.get("CpuUsage").is_none());

        let network = adapter.query_core_status(false, true, false).await.unwrap();
        assert!(network.get("NetworkInterface").is_some());
        assert!(network.get("CpuUsage").is_none());

        let detailed = adapter.query_core_status(true, false, false).await.unwrap();
        assert!(detailed.get("NetworkInterface").is_some());
        assert!(detailed.get("CpuUsage").is_some());
    }

    #[tokio::test]
    async fn test_unknown_component_maps_to_invalid_component() {
        let port = Arc::new(MockQrcPort::with_responder(|method, _| {
            if method == methods::COMPONENT_GET {
                Err(Error::CommandFailed {
                    method: method.to_string(),
                    code: 8,
                    message: "Unknown component name".to_string(),
                })
            } else {
                Ok(Value::Null)
            }
        }));
        let adapter = adapter_with(port).await;

        let result = adapter
            .get_control_values(&["Ghost.gain".to_string()])
            .await;
        assert!(matches!(result, Err(Error::InvalidComponent(name)) if name == "Ghost"));
    }

    #[tokio::test]
    async fn test_disconnect_event_clears_discovery() {
        let port = happy_port();
        let adapter = adapter_with(Arc::clone(&port)).await;

        adapter.list_components(None, false).await.unwrap();
        assert_eq!(port.calls_for(methods::COMPONENT_GET_COMPONENTS).len(), 1);

        let hub: crate::events::EventHub<TransportEvent> = crate::events::EventHub::new();
        let token = adapter.watch_transport(hub.subscribe());
        tokio::task::yield_now().await;

        hub.emit(TransportEvent::Disconnected {
            reason: "test".to_string(),
        });
        // Give the watcher a chance to process.
        for _ in 0..5 {
            tokio::task::yield_now().await;
        }

        // Discovery is cold again: the next list hits the wire.
        adapter.list_components(None, false).await.unwrap();
        assert_eq!(port.calls_for(methods::COMPONENT_GET_COMPONENTS).len(), 2);
        token.cancel();
    }
}
