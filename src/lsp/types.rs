use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;

pub const JSONRPC_VERSION: &str = "2.0";

/// Request identifier: JSON-RPC allows either an integer or a string.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RequestId {
    Number(i64),
    String(String),
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RequestId::Number(n) => write!(f, "{}", n),
            RequestId::String(s) => write!(f, "\"{}\"", s),
        }
    }
}

impl From<i64> for RequestId {
    fn from(id: i64) -> Self {
        RequestId::Number(id)
    }
}

impl From<String> for RequestId {
    fn from(id: String) -> Self {
        RequestId::String(id)
    }
}

impl From<&str> for RequestId {
    fn from(id: &str) -> Self {
        RequestId::String(id.to_string())
    }
}

/// Standard JSON-RPC error codes.
pub struct ErrorCode;

impl ErrorCode {
    pub const INVALID_REQUEST: i64 = -32600;
    pub const METHOD_NOT_FOUND: i64 = -32601;
    pub const INVALID_PARAMS: i64 = -32602;
    pub const INTERNAL_ERROR: i64 = -32603;
}

/// Error object carried by a failed response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResponseError {
    pub code: i64,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl ResponseError {
    pub fn new(code: i64, message: impl Into<String>) -> Self {
        ResponseError {
            code,
            message: message.into(),
            data: None,
        }
    }

    pub fn with_data(mut self, data: Value) -> Self {
        self.data = Some(data);
        self
    }

    pub fn invalid_request(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::INVALID_REQUEST, message)
    }

    pub fn method_not_found(method: &str) -> Self {
        Self::new(
            ErrorCode::METHOD_NOT_FOUND,
            format!("method not found: {}", method),
        )
    }

    pub fn invalid_params(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::INVALID_PARAMS, message)
    }

    pub fn internal_error(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::INTERNAL_ERROR, message)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Request {
    pub id: RequestId,
    pub method: String,
    pub params: Value,
}

impl Request {
    pub fn new(id: RequestId, method: impl Into<String>, params: Value) -> Self {
        Request {
            id,
            method: method.into(),
            params,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Notification {
    pub method: String,
    pub params: Value,
}

impl Notification {
    pub fn new(method: impl Into<String>, params: Value) -> Self {
        Notification {
            method: method.into(),
            params,
        }
    }
}

/// Either the result of a request or the error it failed with.
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    Success(Value),
    Failure(ResponseError),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Response {
    pub id: RequestId,
    pub outcome: Outcome,
}

impl Response {
    pub fn success(id: RequestId, result: Value) -> Self {
        Response {
            id,
            outcome: Outcome::Success(result),
        }
    }

    pub fn failure(id: RequestId, error: ResponseError) -> Self {
        Response {
            id,
            outcome: Outcome::Failure(error),
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self.outcome, Outcome::Success(_))
    }
}

/// One decoded JSON-RPC message.
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    Request(Request),
    Notification(Notification),
    Response(Response),
}

impl Message {
    /// Method name for requests and notifications.
    pub fn method(&self) -> Option<&str> {
        match self {
            Message::Request(r) => Some(&r.method),
            Message::Notification(n) => Some(&n.method),
            Message::Response(_) => None,
        }
    }

    /// Build the wire object. `null` params are omitted; a `null` result is kept.
    pub fn to_value(&self) -> Value {
        let mut object = Map::new();
        object.insert("jsonrpc".to_string(), Value::from(JSONRPC_VERSION));

        match self {
            Message::Request(request) => {
                object.insert("id".to_string(), id_value(&request.id));
                object.insert("method".to_string(), Value::from(request.method.as_str()));
                if !request.params.is_null() {
                    object.insert("params".to_string(), request.params.clone());
                }
            }
            Message::Notification(notification) => {
                object.insert(
                    "method".to_string(),
                    Value::from(notification.method.as_str()),
                );
                if !notification.params.is_null() {
                    object.insert("params".to_string(), notification.params.clone());
                }
            }
            Message::Response(response) => {
                object.insert("id".to_string(), id_value(&response.id));
                match &response.outcome {
                    Outcome::Success(result) => {
                        object.insert("result".to_string(), result.clone());
                    }
                    Outcome::Failure(error) => {
                        let error = serde_json::to_value(error).unwrap_or(Value::Null);
                        object.insert("error".to_string(), error);
                    }
                }
            }
        }

        Value::Object(object)
    }

    pub fn to_vec(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(&self.to_value())
    }
}

impl From<Request> for Message {
    fn from(request: Request) -> Self {
        Message::Request(request)
    }
}

impl From<Notification> for Message {
    fn from(notification: Notification) -> Self {
        Message::Notification(notification)
    }
}

impl From<Response> for Message {
    fn from(response: Response) -> Self {
        Message::Response(response)
    }
}

fn id_value(id: &RequestId) -> Value {
    match id {
        RequestId::Number(n) => Value::from(*n),
        RequestId::String(s) => Value::from(s.as_str()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_request_omits_null_params() {
        let request = Message::Request(Request::new(RequestId::Number(2), "shutdown", Value::Null));
        assert_eq!(
            request.to_value(),
            json!({"jsonrpc": "2.0", "id": 2, "method": "shutdown"})
        );
    }

    #[test]
    fn test_notification_has_no_id() {
        let notification = Message::Notification(Notification::new("exit", Value::Null));
        let value = notification.to_value();
        assert!(value.get("id").is_none());
        assert_eq!(value["method"], "exit");
    }

    #[test]
    fn test_success_keeps_null_result() {
        let response = Message::Response(Response::success("abc".into(), Value::Null));
        assert_eq!(
            response.to_value(),
            json!({"jsonrpc": "2.0", "id": "abc", "result": null})
        );
    }

    #[test]
    fn test_failure_serializes_error_object() {
        let error = ResponseError::method_not_found("foo").with_data(json!({"hint": 1}));
        let response = Message::Response(Response::failure(RequestId::Number(7), error));
        let value = response.to_value();
        assert_eq!(value["error"]["code"], ErrorCode::METHOD_NOT_FOUND);
        assert_eq!(value["error"]["data"]["hint"], 1);
        assert!(value.get("result").is_none());
    }

    #[test]
    fn test_request_id_display() {
        assert_eq!(RequestId::Number(5).to_string(), "5");
        assert_eq!(RequestId::from("a").to_string(), "\"a\"");
    }
}
