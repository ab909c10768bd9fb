//! QRC transport: framed JSON-RPC client and its wire dialect

pub mod client;
pub mod protocol;

pub use client::{QrcClient, RpcNotification, TransportEvent};
pub use protocol::{
    methods, ComponentInfo, CoreStatus, PollChange, PollResult, RpcError, RpcFrame, RpcRequest,
    WireControl, MAX_SAFE_ID, QRC_ENDPOINT_PATH,
};

use std::time::Duration;

use serde_json::Value;

use crate::error::Result;

/// The seam between the transport and everything above it.
///
/// The adapter, change-group engine, and poll loop speak to the Core only
/// through this trait, so they can be exercised against an in-memory
/// implementation.
#[async_trait::async_trait]
pub trait QrcPort: Send + Sync {
    /// Send a command with the transport's default timeout
    async fn send_command(&self, method: &str, params: Value) -> Result<Value>;

    /// Send a command with an explicit timeout
    async fn send_command_with_timeout(
        &self,
        method: &str,
        params: Value,
        timeout: Duration,
    ) -> Result<Value>;

    /// Whether a session is currently up
    fn is_connected(&self) -> bool;
}

#[cfg(test)]
pub(crate) mod testing {
    //! In-memory [`QrcPort`] for exercising the layers above the transport

    use super::*;
    use crate::error::Error;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Mutex;

    type Responder = Box<dyn FnMut(&str, &Value) -> Result<Value> + Send>;

    /// Scriptable QRC port: records calls, answers from a responder closure,
    /// and can simulate per-method latency for timeout tests.
    pub struct MockQrcPort {
        connected: AtomicBool,
        calls: Mutex<Vec<(String, Value)>>,
        responder: Mutex<Responder>,
        delays: Mutex<HashMap<String, Duration>>,
    }

    impl MockQrcPort {
        /// Port that answers every command with `null`
        pub fn new() -> Self {
            Self::with_responder(|_, _| Ok(Value::Null))
        }

        /// Port answering through the given closure
        pub fn with_responder<F>(responder: F) -> Self
        where
            F: FnMut(&str, &Value) -> Result<Value> + Send + 'static,
        {
            Self {
                connected: AtomicBool::new(true),
                calls: Mutex::new(Vec::new()),
                responder: Mutex::new(Box::new(responder)),
                delays: Mutex::new(HashMap::new()),
            }
        }

        /// Simulate latency for one method
        pub fn set_delay(&self, method: &str, delay: Duration) {
            self.delays
                .lock()
                .unwrap()
                .insert(method.to_string(), delay);
        }

        /// Flip the connected flag
        pub fn set_connected(&self, connected: bool) {
            self.connected.store(connected, Ordering::SeqCst);
        }

        /// All calls recorded so far
        pub fn calls(&self) -> Vec<(String, Value)> {
            self.calls.lock().unwrap().clone()
        }

        /// Calls to one method
        pub fn calls_for(&self, method: &str) -> Vec<Value> {
            self.calls
                .lock()
                .unwrap()
                .iter()
                .filter(|(m, _)| m == method)
                .map(|(_, params)| params.clone())
                .collect()
        }
    }

    #[async_trait::async_trait]
    impl QrcPort for MockQrcPort {
        async fn send_command(&self, method: &str, params: Value) -> Result<Value> {
            self.send_command_with_timeout(method, params, Duration::from_secs(30))
                .await
        }

        async fn send_command_with_timeout(
            &self,
            method: &str,
            params: Value,
            timeout: Duration,
        ) -> Result<Value> {
            if !self.is_connected() {
                return Err(Error::ConnectionClosed("mock disconnected".to_string()));
            }
            self.calls
                .lock()
                .unwrap()
                .push((method.to_string(), params.clone()));

            let delay = self.delays.lock().unwrap().get(method).copied();
            if let Some(delay) = delay {
                if delay >= timeout {
                    tokio::time::sleep(timeout).await;
                    return Err(Error::Timeout(timeout));
                }
                tokio::time::sleep(delay).await;
            }

            (self.responder.lock().unwrap())(method, &params)
        }

        fn is_connected(&self) -> bool {
            self.connected.load(Ordering::SeqCst)
        }
    }
}
