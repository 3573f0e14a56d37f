//! JSON-RPC 1.0 message model and codec.
//!
//! Each [`Message`] variant carries exactly the fields its type permits,
//! so an ill-shaped message cannot be constructed in memory. Decoding
//! enforces the same rules against incoming JSON and reports violations
//! as readable diagnostics.
//!
//! On the wire, the unused slots of a reply, error, or notification are
//! explicit `null`s (the 1.0 convention); the decoder collapses those
//! nulls back to absence, so a round trip is the identity.

use std::sync::atomic::{AtomicU64, Ordering};

use serde_json::{Map, Value};

/// Request id allocator. Uniqueness is only required among requests in
/// flight on a single connection; a process-wide counter satisfies that.
static NEXT_ID: AtomicU64 = AtomicU64::new(0);

/// A JSON-RPC 1.0 message.
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    /// A call expecting a response, correlated by `id`.
    Request {
        method: String,
        params: Vec<Value>,
        id: Value,
    },
    /// A fire-and-forget call.
    Notify { method: String, params: Vec<Value> },
    /// A successful response.
    Reply { result: Value, id: Value },
    /// A failed response.
    Error { error: Value, id: Value },
}

impl Message {
    /// Create a request with a freshly allocated integer id.
    pub fn request(method: impl Into<String>, params: Vec<Value>) -> Message {
        Message::Request {
            method: method.into(),
            params,
            id: Value::from(NEXT_ID.fetch_add(1, Ordering::Relaxed)),
        }
    }

    /// Create a notification.
    pub fn notify(method: impl Into<String>, params: Vec<Value>) -> Message {
        Message::Notify {
            method: method.into(),
            params,
        }
    }

    /// Create a reply to the request carrying `id`.
    pub fn reply(result: Value, id: &Value) -> Message {
        Message::Reply {
            result,
            id: id.clone(),
        }
    }

    /// Create an error response to the request carrying `id`.
    pub fn error(error: Value, id: &Value) -> Message {
        Message::Error {
            error,
            id: id.clone(),
        }
    }

    /// The correlation id, if this message type carries one.
    pub fn id(&self) -> Option<&Value> {
        match self {
            Message::Request { id, .. } | Message::Reply { id, .. } | Message::Error { id, .. } => {
                Some(id)
            }
            Message::Notify { .. } => None,
        }
    }

    /// The method name, if this message type carries one.
    pub fn method(&self) -> Option<&str> {
        match self {
            Message::Request { method, .. } | Message::Notify { method, .. } => Some(method),
            Message::Reply { .. } | Message::Error { .. } => None,
        }
    }

    /// A short noun for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            Message::Request { .. } => "request",
            Message::Notify { .. } => "notification",
            Message::Reply { .. } => "reply",
            Message::Error { .. } => "error",
        }
    }

    /// Encode into a JSON object.
    ///
    /// A reply emits `"error": null`, an error `"result": null`, and a
    /// notification `"id": null`; a request omits `result` and `error`
    /// entirely.
    pub fn into_value(self) -> Value {
        let mut obj = Map::new();
        match self {
            Message::Request { method, params, id } => {
                obj.insert("method".to_string(), Value::String(method));
                obj.insert("params".to_string(), Value::Array(params));
                obj.insert("id".to_string(), id);
            }
            Message::Notify { method, params } => {
                obj.insert("method".to_string(), Value::String(method));
                obj.insert("params".to_string(), Value::Array(params));
                obj.insert("id".to_string(), Value::Null);
            }
            Message::Reply { result, id } => {
                obj.insert("result".to_string(), result);
                obj.insert("error".to_string(), Value::Null);
                obj.insert("id".to_string(), id);
            }
            Message::Error { error, id } => {
                obj.insert("result".to_string(), Value::Null);
                obj.insert("error".to_string(), error);
                obj.insert("id".to_string(), id);
            }
        }
        Value::Object(obj)
    }

    /// Decode a JSON value into a message.
    ///
    /// The type is inferred from which fields are present, first match
    /// wins: `result` means reply, `error` means error, `id` means
    /// request, otherwise notification. A `null` in any of `params`,
    /// `result`, `error`, or `id` counts as absent. Unknown members and
    /// shape violations fail with a diagnostic naming the offender.
    pub fn from_value(value: Value) -> Result<Message, String> {
        let Value::Object(mut obj) = value else {
            return Err("message is not a JSON object".to_string());
        };

        let method = match obj.remove("method") {
            None => None,
            Some(Value::String(method)) => Some(method),
            Some(_) => return Err("\"method\" is not a JSON string".to_string()),
        };
        let params = take(&mut obj, "params");
        let result = take(&mut obj, "result");
        let error = take(&mut obj, "error");
        let id = take(&mut obj, "id");

        if let Some(extra) = obj.keys().next() {
            return Err(format!("message has unexpected member \"{extra}\""));
        }

        let params = match params {
            None => None,
            Some(Value::Array(params)) => Some(params),
            Some(_) => return Err("\"params\" must be a JSON array".to_string()),
        };

        match (result, error) {
            (Some(result), error) => {
                refuse(method.is_some(), "reply", "method")?;
                refuse(params.is_some(), "reply", "params")?;
                refuse(error.is_some(), "reply", "error")?;
                let id = need(id, "reply", "id")?;
                Ok(Message::Reply { result, id })
            }
            (None, Some(error)) => {
                refuse(method.is_some(), "error", "method")?;
                refuse(params.is_some(), "error", "params")?;
                let id = need(id, "error", "id")?;
                Ok(Message::Error { error, id })
            }
            (None, None) => match id {
                Some(id) => Ok(Message::Request {
                    method: need(method, "request", "method")?,
                    params: need(params, "request", "params")?,
                    id,
                }),
                None => Ok(Message::Notify {
                    method: need(method, "notification", "method")?,
                    params: need(params, "notification", "params")?,
                }),
            },
        }
    }
}

/// Remove `key` from `obj`, treating an explicit `null` as absent.
fn take(obj: &mut Map<String, Value>, key: &str) -> Option<Value> {
    match obj.remove(key) {
        Some(Value::Null) | None => None,
        value => value,
    }
}

fn need<T>(field: Option<T>, kind: &str, name: &str) -> Result<T, String> {
    field.ok_or_else(|| format!("{kind} must have \"{name}\""))
}

fn refuse(present: bool, kind: &str, name: &str) -> Result<(), String> {
    if present {
        Err(format!("{kind} must not have \"{name}\""))
    } else {
        Ok(())
    }
}
