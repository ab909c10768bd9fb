//! Poll/subscribe loop driving `ChangeGroup.Poll`
//!
//! Owns the Core-side change-group subscriptions: controls are added through
//! here, every registered group is polled on a fixed cadence, and each
//! non-empty poll is emitted as a `ChangeGroupChanges` batch for the event
//! cache. Per-group sequence numbers are monotonic and reset only on
//! `ChangeGroup.Invalidate`.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use chrono::Utc;
use dashmap::DashMap;
use serde_json::json;
use tokio_util::sync::CancellationToken;

use crate::error::Result;
use crate::events::{ChangeGroupChanges, ControlChange, EventHub};
use crate::model::{ControlAddress, ControlValue};
use crate::transport::{methods, protocol, QrcPort, RpcNotification};

struct GroupSub {
    seq: AtomicU64,
}

/// Drives change-group polling against the Core
pub struct ChangeGroupPoller {
    port: Arc<dyn QrcPort>,
    interval: Duration,
    groups: DashMap<String, GroupSub>,
    changes: EventHub<ChangeGroupChanges>,
    poll_task: StdMutex<Option<CancellationToken>>,
}

impl ChangeGroupPoller {
    /// Poller with the given cadence
    pub fn new(port: Arc<dyn QrcPort>, interval: Duration) -> Arc<Self> {
        Arc::new(Self {
            port,
            interval,
            groups: DashMap::new(),
            changes: EventHub::new(),
            poll_task: StdMutex::new(None),
        })
    }

    /// Subscribe to per-group change batches
    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<ChangeGroupChanges> {
        self.changes.subscribe()
    }

    /// Ids of groups currently registered
    pub fn group_ids(&self) -> Vec<String> {
        self.groups.iter().map(|entry| entry.key().clone()).collect()
    }

    /// Subscribe controls into a change group, creating it on the Core as a
    /// side effect. Component controls batch into one
    /// `ChangeGroup.AddComponentControl` per component; named controls go
    /// through `ChangeGroup.AddControl`.
    pub async fn add_controls(&self, group_id: &str, names: &[String]) -> Result<()> {
        let mut bare: Vec<String> = Vec::new();
        let mut by_component: HashMap<String, Vec<String>> = HashMap::new();
        for name in names {
            let address = ControlAddress::parse(name)?;
            if address.is_bare() {
                bare.push(address.control);
            } else {
                by_component
                    .entry(address.component)
                    .or_default()
                    .push(address.control);
            }
        }

        if !bare.is_empty() {
            self.port
                .send_command(
                    methods::CHANGE_GROUP_ADD_CONTROL,
                    json!({ "Id": group_id, "Controls": bare }),
                )
                .await?;
        }
        for (component, controls) in by_component {
            let controls: Vec<_> = controls
                .into_iter()
                .map(|name| json!({ "Name": name }))
                .collect();
            self.port
                .send_command(
                    methods::CHANGE_GROUP_ADD_COMPONENT_CONTROL,
                    json!({
                        "Id": group_id,
                        "Component": { "Name": component, "Controls": controls },
                    }),
                )
                .await?;
        }

        self.groups
            .entry(group_id.to_string())
            .or_insert_with(|| GroupSub {
                seq: AtomicU64::new(0),
            });
        Ok(())
    }

    /// Remove controls from a group
    pub async fn remove_controls(&self, group_id: &str, names: &[String]) -> Result<()> {
        self.port
            .send_command(
                methods::CHANGE_GROUP_REMOVE,
                json!({ "Id": group_id, "Controls": names }),
            )
            .await?;
        Ok(())
    }

    /// Drop a group on the Core and locally
    pub async fn clear_group(&self, group_id: &str) -> Result<()> {
        self.port
            .send_command(methods::CHANGE_GROUP_CLEAR, json!({ "Id": group_id }))
            .await?;
        self.groups.remove(group_id);
        Ok(())
    }

    /// Invalidate a group so every control reports on the next poll.
    /// This is the only operation that resets the group's sequence numbers.
    pub async fn invalidate(&self, group_id: &str) -> Result<()> {
        self.port
            .send_command(methods::CHANGE_GROUP_INVALIDATE, json!({ "Id": group_id }))
            .await?;
        if let Some(sub) = self.groups.get(group_id) {
            sub.seq.store(0, Ordering::SeqCst);
        }
        Ok(())
    }

    /// Ask the Core to push poll results at the given rate
    pub async fn auto_poll(&self, group_id: &str, rate: Duration) -> Result<()> {
        self.port
            .send_command(
                methods::CHANGE_GROUP_AUTO_POLL,
                json!({ "Id": group_id, "Rate": rate.as_secs_f64() }),
            )
            .await?;
        self.groups
            .entry(group_id.to_string())
            .or_insert_with(|| GroupSub {
                seq: AtomicU64::new(0),
            });
        Ok(())
    }

    /// Poll one group immediately; returns how many changes were emitted
    pub async fn poll_once(&self, group_id: &str) -> Result<usize> {
        let result = self
            .port
            .send_command(methods::CHANGE_GROUP_POLL, json!({ "Id": group_id }))
            .await?;
        let poll = protocol::parse_poll_result(&result)?;
        Ok(self.emit_changes(group_id, &poll.changes))
    }

    /// Start the polling loop; returns a token that stops it
    pub fn start(self: &Arc<Self>) -> CancellationToken {
        let poller = Arc::clone(self);
        let cancel = CancellationToken::new();
        let token = cancel.clone();

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(poller.interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {}
                }
                if !poller.port.is_connected() {
                    continue;
                }
                let group_ids = poller.group_ids();
                for group_id in group_ids {
                    if let Err(err) = poller.poll_once(&group_id).await {
                        tracing::debug!(group = %group_id, "Poll failed: {}", err);
                    }
                }
            }
        });

        {
            let mut slot = self.poll_task.lock().expect("poll task lock poisoned");
            if let Some(previous) = slot.take() {
                previous.cancel();
            }
            *slot = Some(cancel.clone());
        }
        cancel
    }

    /// Stop the polling loop
    pub fn stop(&self) {
        if let Some(token) = self
            .poll_task
            .lock()
            .expect("poll task lock poisoned")
            .take()
        {
            token.cancel();
        }
    }

    /// Route AutoPoll pushes (server-initiated `ChangeGroup.Poll`
    /// notifications) into the same change stream as timed polls
    pub fn attach_notifications(
        self: &Arc<Self>,
        mut notifications: tokio::sync::broadcast::Receiver<RpcNotification>,
    ) -> CancellationToken {
        let poller = Arc::clone(self);
        let cancel = CancellationToken::new();
        let token = cancel.clone();

        tokio::spawn(async move {
            loop {
                let notification = tokio::select! {
                    _ = token.cancelled() => break,
                    received = notifications.recv() => match received {
                        Ok(notification) => notification,
                        Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                            tracing::warn!(skipped, "Notification stream lagged");
                            continue;
                        }
                        Err(_) => break,
                    }
                };
                if notification.method != methods::CHANGE_GROUP_POLL {
                    continue;
                }
                match protocol::parse_poll_result(&notification.params) {
                    Ok(poll) => {
                        let group_id = poll.id_string();
                        poller.emit_changes(&group_id, &poll.changes);
                    }
                    Err(err) => {
                        tracing::warn!("Undecodable AutoPoll push: {}", err);
                    }
                }
            }
        });

        cancel
    }

    fn emit_changes(&self, group_id: &str, changes: &[protocol::PollChange]) -> usize {
        if changes.is_empty() {
            return 0;
        }

        let sub = self
            .groups
            .entry(group_id.to_string())
            .or_insert_with(|| GroupSub {
                seq: AtomicU64::new(0),
            });
        let sequence_number = sub.seq.fetch_add(1, Ordering::SeqCst) + 1;

        let mapped: Vec<ControlChange> = changes
            .iter()
            .filter_map(|change| {
                let value = ControlValue::from_json(&change.value)?;
                Some(ControlChange {
                    name: change.qualified_name(),
                    value,
                    string_value: change.string.clone(),
                })
            })
            .collect();
        if mapped.is_empty() {
            return 0;
        }

        let now = Utc::now();
        let count = mapped.len();
        self.changes.emit(ChangeGroupChanges {
            group_id: group_id.to_string(),
            changes: mapped,
            timestamp: now,
            timestamp_ms: now.timestamp_millis(),
            sequence_number,
        });
        count
    }
}
