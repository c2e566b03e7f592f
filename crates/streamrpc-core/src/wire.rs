//! Errors on the wire.
//!
//! A failed call is answered with one `ResponseError` whose `error.data`
//! carries an [`ErrorRecord`]:
//!
//! ```text
//! {"type": "<kind>", "data": {"message": ..., "stack"?: ..., "data"?: ..., "cause"?: {...}}}
//! ```
//!
//! The receiving side rebuilds a typed [`RpcError`] through an
//! [`ErrorRegistry`] and wraps it in [`RpcError::Remote`].

use std::collections::HashMap;
use std::error::Error as StdError;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use streamrpc_frame::{JsonRpcError, JsonRpcResponseError};

use crate::error::{ApplicationError, RpcError};

/// Kind name used for plain `std::error::Error` causes.
const FOREIGN_KIND: &str = "Error";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorRecord {
    #[serde(rename = "type")]
    pub kind: String,
    pub data: ErrorRecordData,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorRecordData {
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stack: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cause: Option<Box<ErrorRecord>>,
}

impl ErrorRecord {
    /// Describe `err` and its cause chain. `sensitive` omits `stack`.
    pub fn from_error(err: &RpcError, sensitive: bool) -> Self {
        Self {
            kind: err.type_name().to_string(),
            data: ErrorRecordData {
                message: err.detail(),
                exit_code: err.exit_code(),
                stack: (!sensitive).then(|| format!("{err:?}")),
                data: err.data(),
                cause: cause_record(err, sensitive),
            },
        }
    }
}

fn cause_record(err: &(dyn StdError + 'static), sensitive: bool) -> Option<Box<ErrorRecord>> {
    let source = err.source()?;
    let rpc = source
        .downcast_ref::<RpcError>()
        .or_else(|| source.downcast_ref::<Box<RpcError>>().map(|boxed| &**boxed));
    let record = match rpc {
        Some(rpc) => ErrorRecord::from_error(rpc, sensitive),
        None => ErrorRecord {
            kind: FOREIGN_KIND.to_string(),
            data: ErrorRecordData {
                message: source.to_string(),
                exit_code: None,
                stack: (!sensitive).then(|| format!("{source:?}")),
                data: None,
                cause: cause_record(source, sensitive),
            },
        },
    };
    Some(Box::new(record))
}

/// Build the single error response sent for a failed call.
pub fn to_response_error(err: &RpcError, sensitive: bool) -> JsonRpcResponseError {
    let record = ErrorRecord::from_error(err, sensitive);
    JsonRpcResponseError::new(JsonRpcError {
        code: err.code(),
        message: err.to_string(),
        data: serde_json::to_value(record).ok(),
    })
}

/// Fields of a wire error handed to a registered constructor.
#[derive(Debug)]
pub struct DecodedError {
    pub kind: String,
    pub message: String,
    pub exit_code: Option<i32>,
    pub data: Option<Value>,
    pub cause: Option<RpcError>,
}

type Constructor = Arc<dyn Fn(DecodedError) -> RpcError + Send + Sync>;

/// Maps wire kind names back to typed errors.
///
/// The built-in kinds are always known. Application kinds must be registered
/// by the consumer; anything else decodes to [`RpcError::Unknown`].
#[derive(Clone)]
pub struct ErrorRegistry {
    constructors: HashMap<String, Constructor>,
}

impl ErrorRegistry {
    pub fn new() -> Self {
        let mut registry = Self {
            constructors: HashMap::new(),
        };
        registry.register_builtin();
        registry
    }

    /// Register a custom constructor for `kind`.
    pub fn register<F>(&mut self, kind: impl Into<String>, constructor: F) -> &mut Self
    where
        F: Fn(DecodedError) -> RpcError + Send + Sync + 'static,
    {
        self.constructors.insert(kind.into(), Arc::new(constructor));
        self
    }

    /// Rebuild errors of `kind` as [`ApplicationError`]s.
    pub fn register_application(&mut self, kind: impl Into<String>) -> &mut Self {
        self.register(kind, |err| {
            RpcError::Application(ApplicationError {
                kind: err.kind,
                message: err.message,
                exit_code: err.exit_code,
                data: err.data,
            })
        })
    }

    pub fn is_registered(&self, kind: &str) -> bool {
        self.constructors.contains_key(kind)
    }

    /// Turn a received `error` member into `RpcError::Remote`.
    pub fn decode(&self, error: JsonRpcError) -> RpcError {
        let record = error.data.and_then(|data| match data {
            Value::String(text) => serde_json::from_str::<ErrorRecord>(&text).ok(),
            other => serde_json::from_value::<ErrorRecord>(other).ok(),
        });
        let cause = match record {
            Some(record) => self.from_record(record),
            None => RpcError::Unknown {
                kind: String::new(),
                message: error.message.clone(),
                data: None,
                cause: None,
            },
        };
        RpcError::Remote {
            code: error.code,
            message: error.message,
            cause: Box::new(cause),
        }
    }

    /// Rebuild a typed error from a record, recursing through its causes.
    pub fn from_record(&self, record: ErrorRecord) -> RpcError {
        let ErrorRecord { kind, data } = record;
        let decoded = DecodedError {
            message: data.message,
            exit_code: data.exit_code,
            data: data.data,
            cause: data.cause.map(|cause| self.from_record(*cause)),
            kind,
        };
        match self.constructors.get(&decoded.kind) {
            Some(constructor) => constructor(decoded),
            None => RpcError::Unknown {
                kind: decoded.kind,
                message: decoded.message,
                data: decoded.data,
                cause: decoded.cause.map(Box::new),
            },
        }
    }

    fn register_builtin(&mut self) {
        self.register("Parse", |e| RpcError::Parse(e.message));
        self.register("InvalidParams", |e| RpcError::InvalidParams(e.message));
        self.register("MessageLength", |e| RpcError::MessageLength {
            size: data_u64(&e.data, "size") as usize,
            max: data_u64(&e.data, "max") as usize,
        });
        self.register("Timeout", |e| {
            RpcError::Timeout(Duration::from_millis(data_u64(&e.data, "timeout_ms")))
        });
        self.register("HandlerMissing", |e| RpcError::HandlerMissing(e.message));
        self.register("HandlerFailed", |e| RpcError::HandlerFailed(e.message));
        self.register("MissingResponse", |_| RpcError::MissingResponse);
        self.register("StreamEnded", |e| RpcError::StreamEnded(e.message));
        self.register("Aborted", |e| RpcError::Aborted(e.message));
        self.register("Destroyed", |e| RpcError::Destroyed(e.message));
        self.register("NotRunning", |_| RpcError::NotRunning);
        self.register("Config", |e| RpcError::Config(e.message));
        self.register("Transport", |e| RpcError::Io(std::io::Error::other(e.message)));
        self.register("Remote", |e| RpcError::Remote {
            code: e
                .data
                .as_ref()
                .and_then(|data| data.get("code"))
                .and_then(Value::as_i64)
                .unwrap_or(crate::error::codes::REMOTE),
            cause: Box::new(e.cause.unwrap_or_else(|| RpcError::Unknown {
                kind: String::new(),
                message: e.message.clone(),
                data: None,
                cause: None,
            })),
            message: e.message,
        });
    }
}

fn data_u64(data: &Option<Value>, key: &str) -> u64 {
    data.as_ref()
        .and_then(|data| data.get(key))
        .and_then(Value::as_u64)
        .unwrap_or_default()
}

impl Default for ErrorRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for ErrorRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut kinds: Vec<&str> = self.constructors.keys().map(String::as_str).collect();
        kinds.sort_unstable();
        f.debug_struct("ErrorRegistry").field("kinds", &kinds).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{codes, ErrorKind};
    use serde_json::json;

    fn round_trip(err: &RpcError, registry: &ErrorRegistry) -> RpcError {
        let response = to_response_error(err, false);
        let text = serde_json::to_string(&response).unwrap();
        let value: Value = serde_json::from_str(&text).unwrap();
        let parsed = streamrpc_frame::parse_response_error(value).unwrap();
        registry.decode(parsed.error)
    }

    #[test]
    fn test_record_shape() {
        let err = RpcError::HandlerFailed("boom".into());
        let record = serde_json::to_value(ErrorRecord::from_error(&err, false)).unwrap();
        assert_eq!(record["type"], "HandlerFailed");
        assert_eq!(record["data"]["message"], "boom");
        assert!(record["data"]["stack"].is_string());
        assert!(record["data"].get("cause").is_none());
    }

    #[test]
    fn test_sensitive_omits_stack() {
        let err = RpcError::HandlerFailed("secret path /etc/key".into());
        let record = ErrorRecord::from_error(&err, true);
        assert!(record.data.stack.is_none());
        let response = to_response_error(&err, true);
        let data = response.error.data.unwrap();
        assert!(data["data"].get("stack").is_none());
    }

    #[test]
    fn test_builtin_kinds_rebuild_typed_errors() {
        let registry = ErrorRegistry::new();
        let err = round_trip(&RpcError::HandlerMissing("missing".into()), &registry);
        match &err {
            RpcError::Remote { code, cause, .. } => {
                assert_eq!(*code, codes::METHOD_NOT_FOUND);
                assert!(matches!(**cause, RpcError::HandlerMissing(ref m) if m == "missing"));
            }
            other => panic!("expected remote error, got {other:?}"),
        }
        assert_eq!(err.kind(), ErrorKind::HandlerFailed);

        let err = round_trip(&RpcError::MessageLength { size: 10, max: 4 }, &registry);
        assert!(matches!(
            err.remote_cause(),
            Some(RpcError::MessageLength { size: 10, max: 4 })
        ));

        let err = round_trip(&RpcError::Timeout(Duration::from_millis(1500)), &registry);
        assert!(matches!(err.remote_cause(), Some(RpcError::Timeout(d)) if *d == Duration::from_millis(1500)));
        assert!(err.is_cancellation());
    }

    #[test]
    fn test_registered_application_kind_keeps_exit_code_and_data() {
        let mut registry = ErrorRegistry::new();
        registry.register_application("VaultLocked");
        let origin = RpcError::from(
            ApplicationError::new("VaultLocked", "vault is locked")
                .with_exit_code(77)
                .with_data(json!({"vault": "main"})),
        );
        let err = round_trip(&origin, &registry);
        assert_eq!(err.exit_code(), Some(77));
        match err.remote_cause() {
            Some(RpcError::Application(app)) => {
                assert_eq!(app.kind, "VaultLocked");
                assert_eq!(app.message, "vault is locked");
                assert_eq!(app.data, Some(json!({"vault": "main"})));
            }
            other => panic!("expected application error, got {other:?}"),
        }
    }

    #[test]
    fn test_unknown_kind_keeps_message_and_cause_chain() {
        let registry = ErrorRegistry::new();
        let record = ErrorRecord {
            kind: "DiskFull".into(),
            data: ErrorRecordData {
                message: "no space left".into(),
                exit_code: None,
                stack: None,
                data: Some(json!({"free": 0})),
                cause: Some(Box::new(ErrorRecord {
                    kind: "Error".into(),
                    data: ErrorRecordData {
                        message: "ENOSPC".into(),
                        exit_code: None,
                        stack: None,
                        data: None,
                        cause: None,
                    },
                })),
            },
        };
        match registry.from_record(record) {
            RpcError::Unknown {
                kind,
                message,
                data,
                cause,
            } => {
                assert_eq!(kind, "DiskFull");
                assert_eq!(message, "no space left");
                assert_eq!(data, Some(json!({"free": 0})));
                let cause = cause.expect("cause should survive");
                assert!(matches!(*cause, RpcError::Unknown { ref message, .. } if message == "ENOSPC"));
            }
            other => panic!("expected unknown error, got {other:?}"),
        }
    }

    #[test]
    fn test_nested_remote_errors_are_preserved() {
        let registry = ErrorRegistry::new();
        let inner = registry.decode(to_response_error(&RpcError::StreamEnded("eof".into()), false).error);
        let outer = round_trip(&inner, &registry);
        let first = outer.remote_cause().expect("outer cause");
        let second = first.remote_cause().expect("inner cause");
        assert!(matches!(second, RpcError::StreamEnded(m) if m == "eof"));
    }

    #[test]
    fn test_record_as_json_string_is_accepted() {
        let registry = ErrorRegistry::new();
        let record = ErrorRecord::from_error(&RpcError::Parse("bad".into()), true);
        let err = registry.decode(JsonRpcError {
            code: codes::PARSE_ERROR,
            message: "parse error: bad".into(),
            data: Some(Value::String(serde_json::to_string(&record).unwrap())),
        });
        assert!(matches!(err.remote_cause(), Some(RpcError::Parse(m)) if m == "bad"));
    }

    #[test]
    fn test_missing_record_decodes_to_unknown() {
        let registry = ErrorRegistry::new();
        let err = registry.decode(JsonRpcError {
            code: -1,
            message: "opaque".into(),
            data: None,
        });
        assert_eq!(err.kind(), ErrorKind::Unknown);
        assert_eq!(err.to_string(), "remote error -1: opaque");
    }

    #[test]
    fn test_foreign_source_chain_is_encoded() {
        let io = std::io::Error::new(std::io::ErrorKind::BrokenPipe, "pipe closed");
        let err = RpcError::Remote {
            code: codes::REMOTE,
            message: "wrapped".into(),
            cause: Box::new(RpcError::Io(io)),
        };
        let record = ErrorRecord::from_error(&err, true);
        let cause = record.data.cause.expect("cause present");
        assert_eq!(cause.kind, "Transport");
        assert_eq!(cause.data.message, "stream I/O error: pipe closed");
        let foreign = cause.data.cause.expect("io source present");
        assert_eq!(foreign.kind, FOREIGN_KIND);
        assert_eq!(foreign.data.message, "pipe closed");
    }
}
