use serde::Serialize;
use serde_json::{Map, Value};

use crate::error::{FrameError, Result};

/// The only protocol version this crate speaks.
pub const JSONRPC_VERSION: &str = "2.0";

/// The `jsonrpc` member. Always serializes as `"2.0"`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Version;

impl Serialize for Version {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(JSONRPC_VERSION)
    }
}

/// A request or response id.
///
/// Calls never multiplex on one stream, so every message this crate creates
/// uses [`RequestId::Null`].
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(untagged)]
pub enum RequestId {
    String(String),
    Number(serde_json::Number),
    #[default]
    Null,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct JsonRpcRequest {
    pub jsonrpc: Version,
    pub method: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
    pub id: RequestId,
}

impl JsonRpcRequest {
    pub fn new(method: impl Into<String>, params: Option<Value>) -> Self {
        Self {
            jsonrpc: Version,
            method: method.into(),
            params,
            id: RequestId::Null,
        }
    }

    /// Drop the method name for transmission after the header.
    pub fn into_input(self) -> JsonRpcInput {
        JsonRpcInput {
            jsonrpc: Version,
            params: self.params,
            id: self.id,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct JsonRpcNotification {
    pub jsonrpc: Version,
    pub method: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

/// A call input sent after the header request.
///
/// The method is implied by the header, so it is never written. A `method`
/// member on an incoming input is tolerated and ignored.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct JsonRpcInput {
    pub jsonrpc: Version,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
    pub id: RequestId,
}

impl JsonRpcInput {
    pub fn new(params: Option<Value>) -> Self {
        Self {
            jsonrpc: Version,
            params,
            id: RequestId::Null,
        }
    }

    /// Name this input after the method carried by the call's header.
    pub fn into_request(self, method: impl Into<String>) -> JsonRpcRequest {
        JsonRpcRequest {
            jsonrpc: Version,
            method: method.into(),
            params: self.params,
            id: self.id,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct JsonRpcResponseResult {
    pub jsonrpc: Version,
    pub result: Value,
    pub id: RequestId,
}

impl JsonRpcResponseResult {
    pub fn new(result: Value) -> Self {
        Self {
            jsonrpc: Version,
            result,
            id: RequestId::Null,
        }
    }
}

/// The `error` member of an error response.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct JsonRpcError {
    pub code: i64,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct JsonRpcResponseError {
    pub jsonrpc: Version,
    pub error: JsonRpcError,
    pub id: RequestId,
}

impl JsonRpcResponseError {
    pub fn new(error: JsonRpcError) -> Self {
        Self {
            jsonrpc: Version,
            error,
            id: RequestId::Null,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum JsonRpcResponse {
    Result(JsonRpcResponseResult),
    Error(JsonRpcResponseError),
}

impl From<JsonRpcResponseResult> for JsonRpcResponse {
    fn from(value: JsonRpcResponseResult) -> Self {
        Self::Result(value)
    }
}

impl From<JsonRpcResponseError> for JsonRpcResponse {
    fn from(value: JsonRpcResponseError) -> Self {
        Self::Error(value)
    }
}

/// Any of the four JSON-RPC message variants.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum JsonRpcMessage {
    Request(JsonRpcRequest),
    Notification(JsonRpcNotification),
    ResponseResult(JsonRpcResponseResult),
    ResponseError(JsonRpcResponseError),
}

/// Narrow an arbitrary JSON value into a typed message.
pub trait ParseMessage: Sized {
    fn parse(value: Value) -> Result<Self>;
}

pub fn parse_request(value: Value) -> Result<JsonRpcRequest> {
    let mut obj = object(value, "request")?;
    check_version(&obj)?;
    let method = take_method(&mut obj)?;
    let id = take_id(&mut obj)?;
    Ok(JsonRpcRequest {
        jsonrpc: Version,
        method,
        params: obj.remove("params"),
        id,
    })
}

pub fn parse_notification(value: Value) -> Result<JsonRpcNotification> {
    let mut obj = object(value, "notification")?;
    check_version(&obj)?;
    if obj.contains_key("id") {
        return Err(parse_err("notification must not have an `id` property"));
    }
    Ok(JsonRpcNotification {
        jsonrpc: Version,
        method: take_method(&mut obj)?,
        params: obj.remove("params"),
    })
}

pub fn parse_input(value: Value) -> Result<JsonRpcInput> {
    let mut obj = object(value, "input")?;
    check_version(&obj)?;
    if obj.contains_key("result") || obj.contains_key("error") {
        return Err(parse_err("input must not be a response"));
    }
    if let Some(method) = obj.get("method") {
        if !method.is_string() {
            return Err(parse_err("`method` property must be a string"));
        }
    }
    let id = take_id(&mut obj)?;
    Ok(JsonRpcInput {
        jsonrpc: Version,
        params: obj.remove("params"),
        id,
    })
}

pub fn parse_response_result(value: Value) -> Result<JsonRpcResponseResult> {
    let mut obj = object(value, "response")?;
    check_version(&obj)?;
    if obj.contains_key("error") {
        return Err(parse_err("result response must not have an `error` property"));
    }
    let result = obj
        .remove("result")
        .ok_or_else(|| parse_err("`result` property must be defined"))?;
    Ok(JsonRpcResponseResult {
        jsonrpc: Version,
        result,
        id: take_id(&mut obj)?,
    })
}

pub fn parse_response_error(value: Value) -> Result<JsonRpcResponseError> {
    let mut obj = object(value, "response")?;
    check_version(&obj)?;
    if obj.contains_key("result") {
        return Err(parse_err("error response must not have a `result` property"));
    }
    let error = match obj.remove("error") {
        Some(Value::Object(error)) => parse_error_object(error)?,
        Some(_) => return Err(parse_err("`error` property must be an object")),
        None => return Err(parse_err("`error` property must be defined")),
    };
    Ok(JsonRpcResponseError {
        jsonrpc: Version,
        error,
        id: take_id(&mut obj)?,
    })
}

pub fn parse_response(value: Value) -> Result<JsonRpcResponse> {
    let obj = value
        .as_object()
        .ok_or_else(|| parse_err("response must be a JSON object"))?;
    if obj.contains_key("result") {
        parse_response_result(value).map(JsonRpcResponse::Result)
    } else if obj.contains_key("error") {
        parse_response_error(value).map(JsonRpcResponse::Error)
    } else {
        Err(parse_err("response must have either a `result` or an `error` property"))
    }
}

pub fn parse_message(value: Value) -> Result<JsonRpcMessage> {
    let obj = value
        .as_object()
        .ok_or_else(|| parse_err("message must be a JSON object"))?;
    if obj.contains_key("method") {
        if obj.contains_key("id") {
            parse_request(value).map(JsonRpcMessage::Request)
        } else {
            parse_notification(value).map(JsonRpcMessage::Notification)
        }
    } else {
        Ok(match parse_response(value)? {
            JsonRpcResponse::Result(result) => JsonRpcMessage::ResponseResult(result),
            JsonRpcResponse::Error(error) => JsonRpcMessage::ResponseError(error),
        })
    }
}

fn parse_error_object(mut error: Map<String, Value>) -> Result<JsonRpcError> {
    let code = error
        .get("code")
        .and_then(Value::as_i64)
        .ok_or_else(|| parse_err("`error.code` property must be an integer"))?;
    let message = match error.remove("message") {
        Some(Value::String(message)) => message,
        _ => return Err(parse_err("`error.message` property must be a string")),
    };
    Ok(JsonRpcError {
        code,
        message,
        data: error.remove("data"),
    })
}

fn object(value: Value, what: &str) -> Result<Map<String, Value>> {
    match value {
        Value::Object(obj) => Ok(obj),
        other => Err(parse_err(format!(
            "{what} must be a JSON object, got {}",
            type_name(&other)
        ))),
    }
}

fn check_version(obj: &Map<String, Value>) -> Result<()> {
    match obj.get("jsonrpc") {
        Some(Value::String(v)) if v == JSONRPC_VERSION => Ok(()),
        Some(_) => Err(parse_err("`jsonrpc` property must be \"2.0\"")),
        None => Err(parse_err("`jsonrpc` property must be defined")),
    }
}

fn take_method(obj: &mut Map<String, Value>) -> Result<String> {
    match obj.remove("method") {
        Some(Value::String(method)) => Ok(method),
        Some(_) => Err(parse_err("`method` property must be a string")),
        None => Err(parse_err("`method` property must be defined")),
    }
}

fn take_id(obj: &mut Map<String, Value>) -> Result<RequestId> {
    match obj.remove("id") {
        Some(Value::String(id)) => Ok(RequestId::String(id)),
        Some(Value::Number(id)) => Ok(RequestId::Number(id)),
        Some(Value::Null) => Ok(RequestId::Null),
        Some(_) => Err(parse_err("`id` property must be a string, number or null")),
        None => Err(parse_err("`id` property must be defined")),
    }
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

fn parse_err(message: impl Into<String>) -> FrameError {
    FrameError::Parse(message.into())
}

macro_rules! impl_parse_message {
    ($($ty:ty => $parse:path),* $(,)?) => {
        $(
            impl ParseMessage for $ty {
                fn parse(value: Value) -> Result<Self> {
                    $parse(value)
                }
            }
        )*
    };
}

impl_parse_message! {
    JsonRpcRequest => parse_request,
    JsonRpcNotification => parse_notification,
    JsonRpcInput => parse_input,
    JsonRpcResponseResult => parse_response_result,
    JsonRpcResponseError => parse_response_error,
    JsonRpcResponse => parse_response,
    JsonRpcMessage => parse_message,
}

impl ParseMessage for Value {
    fn parse(value: Value) -> Result<Self> {
        Ok(value)
    }
}
