//! Change-group transaction engine
//!
//! Executes a batch of control writes with bounded concurrency, per-write
//! timeouts, optional capture-and-rollback, and progress events. Per-write
//! failures are captured in the aggregate result, never thrown from the
//! dispatcher; only pre-validation fails the operation as a whole.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use serde_json::{json, Value};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::config::ChangeGroupConfig;
use crate::error::{Error, Result};
use crate::events::{ChangeProgressEvent, EventHub};
use crate::model::{
    ChangeGroup, ChangeGroupExecutionResult, ChangeGroupStatus, ControlAddress,
    ControlChangeResult, ControlValue, ControlWrite,
};
use crate::transport::{methods, protocol, QrcPort};

/// Upper ramp bound in seconds (exclusive below at 0, inclusive at 300)
pub const MAX_RAMP_SECONDS: f64 = 300.0;

/// Per-execution options
#[derive(Debug, Clone)]
pub struct ChangeGroupOptions {
    /// Roll successful writes back to captured values when any write fails
    pub rollback_on_failure: bool,
    /// Keep dispatching after the first failure
    pub continue_on_error: bool,
    /// Maximum writes in flight at once
    pub max_concurrent_changes: usize,
    /// Per-write deadline
    pub timeout: Duration,
    /// Validate the whole batch before dispatching anything
    pub validate_before_execution: bool,
}

impl Default for ChangeGroupOptions {
    fn default() -> Self {
        Self {
            rollback_on_failure: true,
            continue_on_error: false,
            max_concurrent_changes: 10,
            timeout: Duration::from_secs(30),
            validate_before_execution: true,
        }
    }
}

impl From<&ChangeGroupConfig> for ChangeGroupOptions {
    fn from(config: &ChangeGroupConfig) -> Self {
        Self {
            rollback_on_failure: config.rollback_on_failure,
            continue_on_error: config.continue_on_error,
            max_concurrent_changes: config.max_concurrent_changes,
            timeout: Duration::from_millis(config.timeout_ms),
            validate_before_execution: config.validate_before_execution,
        }
    }
}

/// Executes change groups against the Core
pub struct ChangeGroupExecutor {
    port: Arc<dyn QrcPort>,
    defaults: ChangeGroupOptions,
    events: EventHub<ChangeProgressEvent>,
    active: DashMap<String, CancellationToken>,
}

impl ChangeGroupExecutor {
    /// Executor speaking through the given port
    pub fn new(port: Arc<dyn QrcPort>, defaults: ChangeGroupOptions) -> Self {
        Self {
            port,
            defaults,
            events: EventHub::new(),
            active: DashMap::new(),
        }
    }

    /// Subscribe to per-control progress events
    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<ChangeProgressEvent> {
        self.events.subscribe()
    }

    /// The executor's default options
    pub fn defaults(&self) -> &ChangeGroupOptions {
        &self.defaults
    }

    /// Validate a batch without executing it
    pub fn validate(&self, group: &ChangeGroup) -> Result<()> {
        if !self.port.is_connected() {
            return Err(Error::ConnectionClosed(
                "cannot execute change group: not connected".to_string(),
            ));
        }
        for write in &group.controls {
            ControlAddress::parse(&write.name)?;
            if let Some(ramp) = write.ramp {
                if !(ramp > 0.0 && ramp <= MAX_RAMP_SECONDS) {
                    return Err(Error::Validation(format!(
                        "ramp for '{}' must be in (0, {}] seconds, got {}",
                        write.name, MAX_RAMP_SECONDS, ramp
                    )));
                }
            }
        }
        Ok(())
    }

    /// Number of groups currently executing
    pub fn active_count(&self) -> usize {
        self.active.len()
    }

    /// Best-effort cancellation: aborts writes not yet dispatched.
    ///
    /// Writes already on the wire are not interrupted.
    pub fn cancel(&self, group_id: &str) -> bool {
        match self.active.remove(group_id) {
            Some((_, token)) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    /// Execute the group, mutating its status through
    /// PENDING → APPLYING → COMPLETED | FAILED.
    pub async fn execute(
        &self,
        group: &mut ChangeGroup,
        options: Option<ChangeGroupOptions>,
    ) -> Result<ChangeGroupExecutionResult> {
        let options = options.unwrap_or_else(|| self.defaults.clone());
        let started = std::time::Instant::now();

        if options.validate_before_execution {
            if let Err(err) = self.validate(group) {
                group.status = ChangeGroupStatus::Failed;
                return Err(err);
            }
        }

        group.status = ChangeGroupStatus::Applying;
        let cancel = CancellationToken::new();
        self.active.insert(group.id.clone(), cancel.clone());

        let total = group.controls.len();
        let semaphore = Arc::new(Semaphore::new(options.max_concurrent_changes.max(1)));

        // Capture previous values; these drive rollback and are reported
        // per control either way.
        let previous = self
            .capture_previous(&group.controls, &semaphore, options.timeout)
            .await;

        let mut slots: Vec<Option<ControlChangeResult>> = Vec::with_capacity(total);
        slots.resize_with(total, || None);

        let mut join_set: JoinSet<(usize, ControlChangeResult)> = JoinSet::new();
        for (idx, write) in group.controls.iter().cloned().enumerate() {
            let port = Arc::clone(&self.port);
            let semaphore = Arc::clone(&semaphore);
            let cancel = cancel.clone();
            let previous_value = previous.get(idx).cloned().flatten();
            let timeout = options.timeout;
            let continue_on_error = options.continue_on_error;

            join_set.spawn(async move {
                let aborted = |write: &ControlWrite| ControlChangeResult {
                    name: write.name.clone(),
                    target_value: write.value.clone(),
                    success: false,
                    error: Some("aborted after earlier failure".to_string()),
                    duration_ms: 0,
                    previous_value: None,
                    ramp: write.ramp,
                };

                if cancel.is_cancelled() {
                    return (idx, aborted(&write));
                }
                let Ok(_permit) = semaphore.acquire_owned().await else {
                    return (idx, aborted(&write));
                };
                if cancel.is_cancelled() {
                    return (idx, aborted(&write));
                }

                let write_started = std::time::Instant::now();
                let outcome = dispatch_write(port.as_ref(), &write, timeout).await;
                let duration_ms = write_started.elapsed().as_millis() as u64;

                let result = match outcome {
                    Ok(()) => ControlChangeResult {
                        name: write.name.clone(),
                        target_value: write.value.clone(),
                        success: true,
                        error: None,
                        duration_ms,
                        previous_value,
                        ramp: write.ramp,
                    },
                    Err(err) => {
                        // Abort outstanding dispatch before the permit frees,
                        // so queued writes observe the failure first.
                        if !continue_on_error {
                            cancel.cancel();
                        }
                        ControlChangeResult {
                            name: write.name.clone(),
                            target_value: write.value.clone(),
                            success: false,
                            error: Some(err.to_string()),
                            duration_ms,
                            previous_value,
                            ramp: write.ramp,
                        }
                    }
                };
                (idx, result)
            });
        }

        while let Some(joined) = join_set.join_next().await {
            let Ok((idx, result)) = joined else {
                continue;
            };
            if result.success {
                self.events.emit(ChangeProgressEvent::ControlChanged {
                    group_id: group.id.clone(),
                    name: result.name.clone(),
                    value: result.target_value.clone(),
                });
            } else {
                self.events.emit(ChangeProgressEvent::ControlFailed {
                    group_id: group.id.clone(),
                    name: result.name.clone(),
                    error: result.error.clone().unwrap_or_default(),
                });
            }
            slots[idx] = Some(result);
        }

        // Results in submission order
        let results: Vec<ControlChangeResult> = slots
            .into_iter()
            .enumerate()
            .map(|(idx, slot)| {
                slot.unwrap_or_else(|| {
                    let write = &group.controls[idx];
                    ControlChangeResult {
                        name: write.name.clone(),
                        target_value: write.value.clone(),
                        success: false,
                        error: Some("write task did not complete".to_string()),
                        duration_ms: 0,
                        previous_value: None,
                        ramp: write.ramp,
                    }
                })
            })
            .collect();

        let success_count = results.iter().filter(|r| r.success).count();
        let failure_count = total - success_count;

        let mut rollback_performed = false;
        if failure_count > 0 && options.rollback_on_failure && success_count > 0 {
            rollback_performed = true;
            self.rollback(&group.id, &results, options.timeout).await;
        }

        group.status = if failure_count == 0 {
            ChangeGroupStatus::Completed
        } else {
            ChangeGroupStatus::Failed
        };
        self.active.remove(&group.id);

        Ok(ChangeGroupExecutionResult {
            group_id: group.id.clone(),
            total_controls: total,
            success_count,
            failure_count,
            execution_ms: started.elapsed().as_millis() as u64,
            results,
            rollback_performed,
        })
    }

    async fn capture_previous(
        &self,
        writes: &[ControlWrite],
        semaphore: &Arc<Semaphore>,
        timeout: Duration,
    ) -> Vec<Option<ControlValue>> {
        let reads = writes.iter().map(|write| {
            let port = Arc::clone(&self.port);
            let semaphore = Arc::clone(semaphore);
            let name = write.name.clone();
            async move {
                let Ok(_permit) = semaphore.acquire_owned().await else {
                    return None;
                };
                match read_current(port.as_ref(), &name, timeout).await {
                    Ok(value) => value,
                    Err(err) => {
                        tracing::debug!(control = %name, "Previous-value capture failed: {}", err);
                        None
                    }
                }
            }
        });
        futures::future::join_all(reads).await
    }

    /// Undo successful writes in strict reverse submission order.
    /// Rollback errors are logged and never stop later rollbacks.
    async fn rollback(&self, group_id: &str, results: &[ControlChangeResult], timeout: Duration) {
        for result in results.iter().rev().filter(|r| r.success) {
            let Some(previous) = &result.previous_value else {
                tracing::warn!(
                    group = group_id,
                    control = %result.name,
                    "No captured value; cannot roll back"
                );
                continue;
            };
            let write = ControlWrite {
                name: result.name.clone(),
                value: previous.clone(),
                ramp: None,
            };
            if let Err(err) = dispatch_write(self.port.as_ref(), &write, timeout).await {
                tracing::error!(
                    group = group_id,
                    control = %result.name,
                    "Rollback write failed: {}",
                    err
                );
            } else {
                tracing::info!(
                    group = group_id,
                    control = %result.name,
                    "Rolled back to previous value"
                );
            }
        }
    }
}

/// Issue one write, choosing `Component.Set` for component-scoped controls
/// and `Control.SetValue` for named controls.
async fn dispatch_write(port: &dyn QrcPort, write: &ControlWrite, timeout: Duration) -> Result<()> {
    let address = ControlAddress::parse(&write.name)?;
    let (method, params) = write_request(&address, &write.value, write.ramp);
    port.send_command_with_timeout(method, params, timeout)
        .await?;
    Ok(())
}

fn write_request(
    address: &ControlAddress,
    value: &ControlValue,
    ramp: Option<f64>,
) -> (&'static str, Value) {
    let mut control = json!({
        "Name": address.control,
        "Value": value.to_json(),
    });
    if let Some(ramp) = ramp {
        control["Ramp"] = json!(ramp);
    }

    if address.is_bare() {
        (methods::CONTROL_SET_VALUE, control)
    } else {
        (
            methods::COMPONENT_SET,
            json!({
                "Name": address.component,
                "Controls": [control],
            }),
        )
    }
}

/// Read a control's current value through the read path matching its scope
async fn read_current(
    port: &dyn QrcPort,
    name: &str,
    timeout: Duration,
) -> Result<Option<ControlValue>> {
    let address = ControlAddress::parse(name)?;
    let (method, params) = if address.is_bare() {
        (
            methods::CONTROL_GET,
            json!({ "Name": address.control }),
        )
    } else {
        (
            methods::COMPONENT_GET,
            json!({
                "Name": address.component,
                "Controls": [{ "Name": address.control }],
            }),
        )
    };

    let result = port.send_command_with_timeout(method, params, timeout).await?;
    let controls = if address.is_bare() {
        protocol::parse_control_values(&result)?
    } else {
        protocol::parse_component_controls(method, &result)?
    };
    Ok(controls
        .first()
        .and_then(|control| ControlValue::from_json(&control.value)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::testing::MockQrcPort;

    fn write(name: &str, value: f64) -> ControlWrite {
        ControlWrite {
            name: name.to_string(),
            value: ControlValue::Number(value),
            ramp: None,
        }
    }

    fn options_serial() -> ChangeGroupOptions {
        ChangeGroupOptions {
            max_concurrent_changes: 1,
            ..ChangeGroupOptions::default()
        }
    }

    /// Mock that answers reads with a fixed previous value and fails writes
    /// whose params mention the given control name.
    fn port_failing_writes_to(failing: &'static str) -> Arc<MockQrcPort> {
        Arc::new(MockQrcPort::with_responder(move |method, params| {
            let text = params.to_string();
            match method {
                methods::COMPONENT_GET | methods::CONTROL_GET => Ok(serde_json::json!({
                    "Name": "Mixer",
                    "Controls": [{"Name": "x", "Value": -20.0, "String": "-20dB"}]
                })),
                methods::COMPONENT_SET | methods::CONTROL_SET_VALUE => {
                    if text.contains(failing) {
                        Err(Error::Timeout(Duration::from_secs(30)))
                    } else {
                        Ok(Value::Null)
                    }
                }
                _ => Ok(Value::Null),
            }
        }))
    }

    #[tokio::test]
    async fn test_all_writes_succeed() {
        let port = Arc::new(MockQrcPort::with_responder(|method, _| match method {
            methods::COMPONENT_GET | methods::CONTROL_GET => Ok(serde_json::json!({
                "Controls": [{"Name": "gain", "Value": -10.0}]
            })),
            _ => Ok(Value::Null),
        }));
        let executor = ChangeGroupExecutor::new(port, ChangeGroupOptions::default());

        let mut group = ChangeGroup::new(
            vec![write("Mixer.gain", -5.0), write("Mixer.mute", 0.0), write("master", 1.0)],
            "test",
        );
        let result = executor.execute(&mut group, None).await.unwrap();

        assert_eq!(result.total_controls, 3);
        assert_eq!(result.success_count, 3);
        assert_eq!(result.failure_count, 0);
        assert!(!result.rollback_performed);
        assert_eq!(group.status, ChangeGroupStatus::Completed);
        // Results keep submission order.
        let names: Vec<&str> = result.results.iter().map(|r| r.name.as_str()).collect();
        assert_eq!(names, vec!["Mixer.gain", "Mixer.mute", "master"]);
    }

    #[tokio::test]
    async fn test_counts_always_total() {
        let port = port_failing_writes_to("\"b\"");
        let executor = ChangeGroupExecutor::new(port, ChangeGroupOptions::default());

        let mut group = ChangeGroup::new(
            vec![write("M.a", 1.0), write("M.b", 2.0), write("M.c", 3.0)],
            "test",
        );
        let result = executor
            .execute(&mut group, Some(ChangeGroupOptions {
                continue_on_error: true,
                rollback_on_failure: false,
                ..options_serial()
            }))
            .await
            .unwrap();

        assert_eq!(result.success_count + result.failure_count, result.total_controls);
        assert_eq!(result.failure_count, 1);
        assert_eq!(group.status, ChangeGroupStatus::Failed);
    }

    #[tokio::test]
    async fn test_middle_failure_aborts_and_rolls_back() {
        let port = port_failing_writes_to("\"b\"");
        let executor = ChangeGroupExecutor::new(Arc::clone(&port) as Arc<dyn QrcPort>, options_serial());

        let mut group = ChangeGroup::new(
            vec![write("M.a", 1.0), write("M.b", 2.0), write("M.c", 3.0)],
            "test",
        );
        let result = executor.execute(&mut group, None).await.unwrap();

        assert_eq!(result.success_count, 1);
        assert_eq!(result.failure_count, 2);
        assert!(result.rollback_performed);
        assert_eq!(group.status, ChangeGroupStatus::Failed);

        // The aborted third write carries the abort marker.
        assert_eq!(
            result.results[2].error.as_deref(),
            Some("aborted after earlier failure")
        );

        // The successful first write was rolled back to its captured value.
        let sets = port.calls_for(methods::COMPONENT_SET);
        let rollback = sets.last().unwrap();
        assert_eq!(rollback["Controls"][0]["Name"], "a");
        assert_eq!(rollback["Controls"][0]["Value"], -20.0);
    }

    #[tokio::test]
    async fn test_rollback_runs_in_reverse_order() {
        // All writes succeed except the last.
        let port = port_failing_writes_to("\"d\"");
        let executor = ChangeGroupExecutor::new(Arc::clone(&port) as Arc<dyn QrcPort>, options_serial());

        let mut group = ChangeGroup::new(
            vec![write("M.a", 1.0), write("M.b", 2.0), write("M.c", 3.0), write("M.d", 4.0)],
            "test",
        );
        let result = executor.execute(&mut group, None).await.unwrap();
        assert_eq!(result.success_count, 3);
        assert!(result.rollback_performed);

        // Rollback writes target c, then b, then a.
        let sets = port.calls_for(methods::COMPONENT_SET);
        let rollback_names: Vec<String> = sets[sets.len() - 3..]
            .iter()
            .map(|p| p["Controls"][0]["Name"].as_str().unwrap().to_string())
            .collect();
        assert_eq!(rollback_names, vec!["c", "b", "a"]);
    }

    #[tokio::test]
    async fn test_ramp_validation_bounds() {
        let port = Arc::new(MockQrcPort::new());
        let executor = ChangeGroupExecutor::new(port, ChangeGroupOptions::default());

        let ramp_group = |ramp: f64| {
            ChangeGroup::new(
                vec![ControlWrite {
                    name: "M.gain".to_string(),
                    value: ControlValue::Number(0.0),
                    ramp: Some(ramp),
                }],
                "test",
            )
        };

        assert!(executor.validate(&ramp_group(0.0)).is_err());
        assert!(executor.validate(&ramp_group(-1.0)).is_err());
        assert!(executor.validate(&ramp_group(300.0)).is_ok());
        assert!(executor.validate(&ramp_group(300.0001)).is_err());
        assert!(executor.validate(&ramp_group(2.5)).is_ok());
    }

    #[tokio::test]
    async fn test_empty_name_fails_validation() {
        let port = Arc::new(MockQrcPort::new());
        let executor = ChangeGroupExecutor::new(port, ChangeGroupOptions::default());

        let mut group = ChangeGroup::new(vec![write("  ", 1.0)], "test");
        let result = executor.execute(&mut group, None).await;
        assert!(matches!(result, Err(Error::Validation(_))));
        assert_eq!(group.status, ChangeGroupStatus::Failed);
    }

    #[tokio::test]
    async fn test_disconnected_port_fails_validation() {
        let port = Arc::new(MockQrcPort::new());
        port.set_connected(false);
        let executor = ChangeGroupExecutor::new(port, ChangeGroupOptions::default());

        let mut group = ChangeGroup::new(vec![write("M.gain", 1.0)], "test");
        let result = executor.execute(&mut group, None).await;
        assert!(matches!(result, Err(Error::ConnectionClosed(_))));
    }

    #[tokio::test]
    async fn test_bare_names_use_control_set_value() {
        let port = Arc::new(MockQrcPort::with_responder(|method, _| match method {
            methods::CONTROL_GET => Ok(serde_json::json!([{"Name": "master", "Value": 0.5}])),
            _ => Ok(Value::Null),
        }));
        let executor = ChangeGroupExecutor::new(
            Arc::clone(&port) as Arc<dyn QrcPort>,
            ChangeGroupOptions::default(),
        );

        let mut group = ChangeGroup::new(vec![write("master", 1.0)], "test");
        executor.execute(&mut group, None).await.unwrap();

        assert_eq!(port.calls_for(methods::CONTROL_SET_VALUE).len(), 1);
        assert!(port.calls_for(methods::COMPONENT_SET).is_empty());
    }

    #[tokio::test]
    async fn test_cancel_marks_group_inactive() {
        let port = Arc::new(MockQrcPort::new());
        let executor = ChangeGroupExecutor::new(port, ChangeGroupOptions::default());
        assert!(!executor.cancel("nope"));
    }
}
