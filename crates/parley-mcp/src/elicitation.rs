//! Server-initiated requests for structured user input
//!
//! A tool server may send `elicitation/create` while we talk to it. The
//! broker turns that into a `tool-directory-request` fragment on the session
//! currently using the server, then waits a bounded time for an answer posted
//! back through the gateway. Unanswered requests resolve to `cancel`.

use dashmap::DashMap;
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

use crate::protocol::{ElicitRequestParams, ElicitResult};
use parley_core::{ElicitationPrompt, FragmentWriter, PropertySchema, SessionEvent};

struct Attachment {
    id: u64,
    writer: Arc<FragmentWriter>,
}

/// Routes elicitations to sessions and answers back to servers
pub struct ElicitationBroker {
    attachments: DashMap<String, Vec<Attachment>>,
    pending: DashMap<String, oneshot::Sender<ElicitResult>>,
    next_attachment: AtomicU64,
    timeout: Duration,
}

impl ElicitationBroker {
    pub fn new(timeout: Duration) -> Self {
        Self {
            attachments: DashMap::new(),
            pending: DashMap::new(),
            next_attachment: AtomicU64::new(1),
            timeout,
        }
    }

    /// Route elicitations from `uri` to `writer` until the guard is dropped.
    ///
    /// When several sessions use the same server, the most recent live one
    /// receives the request.
    pub fn attach(self: &Arc<Self>, uri: &str, writer: Arc<FragmentWriter>) -> AttachGuard {
        let id = self.next_attachment.fetch_add(1, Ordering::Relaxed);
        self.attachments
            .entry(uri.to_string())
            .or_default()
            .push(Attachment { id, writer });
        AttachGuard {
            broker: Arc::clone(self),
            uri: uri.to_string(),
            id,
        }
    }

    fn detach(&self, uri: &str, id: u64) {
        if let Some(mut list) = self.attachments.get_mut(uri) {
            list.retain(|a| a.id != id);
        }
        self.attachments.remove_if(uri, |_, list| list.is_empty());
    }

    fn current_writer(&self, uri: &str) -> Option<Arc<FragmentWriter>> {
        self.attachments.get(uri).and_then(|list| {
            list.iter()
                .rev()
                .find(|a| !a.writer.is_closed())
                .map(|a| Arc::clone(&a.writer))
        })
    }

    /// Surface an elicitation and wait for its answer
    pub async fn request(
        &self,
        server_name: &str,
        uri: &str,
        params: ElicitRequestParams,
    ) -> ElicitResult {
        let Some(writer) = self.current_writer(uri) else {
            warn!(
                "Elicitation from '{}' with no attached session, cancelling",
                server_name
            );
            return ElicitResult::cancel();
        };

        let id = uuid::Uuid::new_v4().to_string();
        let (tx, rx) = oneshot::channel();
        self.pending.insert(id.clone(), tx);
        let _cleanup = PendingCleanup {
            pending: &self.pending,
            id: id.clone(),
        };

        let prompt = ElicitationPrompt {
            id: id.clone(),
            message: params.message,
            fields: convert_schema(&params.requested_schema.properties),
        };
        info!(elicitation_id = %id, server = %server_name, "Elicitation requested");
        writer.emit(SessionEvent::Elicitation {
            server: server_name.to_string(),
            prompt,
        });

        match tokio::time::timeout(self.timeout, rx).await {
            Ok(Ok(result)) => {
                debug!(elicitation_id = %id, "Elicitation answered: {:?}", result.action);
                result
            }
            Ok(Err(_)) => ElicitResult::cancel(),
            Err(_) => {
                info!(
                    elicitation_id = %id,
                    "Elicitation unanswered after {}s, cancelling",
                    self.timeout.as_secs()
                );
                ElicitResult::cancel()
            }
        }
    }

    /// Deliver an answer; false if nothing is waiting under `id`
    pub fn respond(&self, id: &str, result: ElicitResult) -> bool {
        match self.pending.remove(id) {
            Some((_, tx)) => tx.send(result).is_ok(),
            None => false,
        }
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }
}

struct PendingCleanup<'a> {
    pending: &'a DashMap<String, oneshot::Sender<ElicitResult>>,
    id: String,
}

impl Drop for PendingCleanup<'_> {
    fn drop(&mut self) {
        self.pending.remove(&self.id);
    }
}

/// Keeps a session attached to a server's elicitations
pub struct AttachGuard {
    broker: Arc<ElicitationBroker>,
    uri: String,
    id: u64,
}

impl Drop for AttachGuard {
    fn drop(&mut self) {
        self.broker.detach(&self.uri, self.id);
    }
}

/// What a client uses to answer `elicitation/create` for one server
#[derive(Clone)]
pub struct ElicitationHandle {
    broker: Option<Arc<ElicitationBroker>>,
    server_name: String,
    uri: String,
}

impl ElicitationHandle {
    pub fn new(broker: Arc<ElicitationBroker>, server_name: &str, uri: &str) -> Self {
        Self {
            broker: Some(broker),
            server_name: server_name.to_string(),
            uri: uri.to_string(),
        }
    }

    /// A handle that cancels every request
    pub fn detached(server_name: &str) -> Self {
        Self {
            broker: None,
            server_name: server_name.to_string(),
            uri: String::new(),
        }
    }

    pub async fn elicit(&self, params: ElicitRequestParams) -> ElicitResult {
        match &self.broker {
            Some(broker) => broker.request(&self.server_name, &self.uri, params).await,
            None => ElicitResult::cancel(),
        }
    }
}

/// Map requested JSON-schema properties onto typed field schemas
pub fn convert_schema(properties: &BTreeMap<String, Value>) -> BTreeMap<String, PropertySchema> {
    properties
        .iter()
        .map(|(name, schema)| (name.clone(), convert_property(schema)))
        .collect()
}

fn convert_property(schema: &Value) -> PropertySchema {
    let str_field = |key: &str| schema.get(key).and_then(|v| v.as_str()).map(String::from);
    let title = str_field("title");
    let description = str_field("description");

    if let Some(values) = schema.get("enum").and_then(|v| v.as_array()) {
        let enum_names = schema.get("enumNames").and_then(|v| v.as_array()).map(|names| {
            names
                .iter()
                .filter_map(|n| n.as_str().map(String::from))
                .collect()
        });
        return PropertySchema::Enum {
            title,
            description,
            values: values
                .iter()
                .filter_map(|v| v.as_str().map(String::from))
                .collect(),
            enum_names,
        };
    }

    match schema.get("type").and_then(|t| t.as_str()) {
        Some("number") | Some("integer") => PropertySchema::Number {
            title,
            description,
            minimum: schema.get("minimum").and_then(|v| v.as_f64()),
            maximum: schema.get("maximum").and_then(|v| v.as_f64()),
        },
        Some("boolean") => PropertySchema::Boolean {
            title,
            description,
            default: schema.get("default").and_then(|v| v.as_bool()),
        },
        _ => PropertySchema::String {
            title,
            description,
            min_length: schema.get("minLength").and_then(|v| v.as_u64()),
            max_length: schema.get("maxLength").and_then(|v| v.as_u64()),
            format: str_field("format"),
        },
    }
}
