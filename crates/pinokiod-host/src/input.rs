//! Broker for `input` steps: the engine parks a oneshot here, the RPC
//! surface resolves it when the client replies.

use crate::cancel::CancelToken;
use crate::events::EventBus;
use parking_lot::Mutex;
use pinokiod_core::{EventKind, HostError, HostResult, InputParams};
use rand::Rng;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::oneshot;

#[derive(Clone)]
pub struct InputBroker {
    pending: Arc<Mutex<HashMap<String, oneshot::Sender<Option<Value>>>>>,
    events: EventBus,
}

impl InputBroker {
    pub fn new(events: EventBus) -> Self {
        Self {
            pending: Arc::new(Mutex::new(HashMap::new())),
            events,
        }
    }

    /// Emit an `input-request` event and block the calling frame until a
    /// client replies, the request is cancelled, or the operation's cancel
    /// token fires.
    pub async fn request(
        &self,
        app_id: &str,
        params: &InputParams,
        command: Option<String>,
        cancel: &CancelToken,
    ) -> HostResult<Value> {
        let request_id = generate_request_id();
        let (tx, rx) = oneshot::channel();
        self.pending.lock().insert(request_id.clone(), tx);

        self.events.emit(
            EventKind::InputRequest {
                app_id: app_id.to_string(),
                request_id: request_id.clone(),
                kind: format!("{:?}", params.kind).to_lowercase(),
                title: params.title.clone(),
                options: params.options.clone(),
            },
            command,
        );

        let reply = tokio::select! {
            reply = rx => reply,
            _ = cancel.cancelled() => {
                self.pending.lock().remove(&request_id);
                return Err(HostError::Cancelled);
            }
        };

        match reply {
            Ok(Some(value)) => {
                if params.kind == pinokiod_core::InputKind::Select
                    && !params.options.is_empty()
                    && !params
                        .options
                        .iter()
                        .any(|opt| Value::String(opt.clone()) == value)
                {
                    return Err(HostError::InputCancelled);
                }
                Ok(value)
            }
            Ok(None) | Err(_) => Err(HostError::InputCancelled),
        }
    }

    /// Resolve a pending request. `None` cancels it.
    pub fn reply(&self, request_id: &str, value: Option<Value>) -> HostResult<()> {
        let sender = self
            .pending
            .lock()
            .remove(request_id)
            .ok_or_else(|| HostError::illegal(format!("no pending input '{request_id}'")))?;
        let _ = sender.send(value);
        Ok(())
    }
}

fn generate_request_id() -> String {
    let value: u64 = rand::rng().random();
    format!("inp-{value:016x}")
}
