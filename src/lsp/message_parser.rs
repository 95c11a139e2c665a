use crate::lsp::error::Error;
use crate::lsp::types::{
    Message, Notification, Outcome, Request, RequestId, Response, ResponseError, JSONRPC_VERSION,
};
use serde_json::Value;

/// Parse a frame body into a `Message`.
///
/// `method` with an `id` is a request, `method` without one is a notification,
/// and `id` without `method` is a response.
pub fn parse_message_from_slice(body: &[u8]) -> Result<Message, Error> {
    let json: Value = serde_json::from_slice(body).map_err(Error::Deserialize)?;
    parse_message(json)
}

pub fn parse_message(json: Value) -> Result<Message, Error> {
    let Value::Object(mut object) = json else {
        return Err(Error::InvalidMessage("message is not an object".into()));
    };

    match object.get("jsonrpc") {
        Some(Value::String(v)) if v == JSONRPC_VERSION => {}
        Some(other) => {
            return Err(Error::InvalidMessage(format!(
                "unsupported jsonrpc version {}",
                other
            )))
        }
        None => return Err(Error::InvalidMessage("missing jsonrpc field".into())),
    }

    let id = match object.remove("id") {
        None | Some(Value::Null) => None,
        Some(id) => Some(parse_id(id)?),
    };

    if let Some(method) = object.remove("method") {
        let Value::String(method) = method else {
            return Err(Error::InvalidMessage("method is not a string".into()));
        };
        let params = object.remove("params").unwrap_or(Value::Null);
        return Ok(match id {
            Some(id) => Message::Request(Request { id, method, params }),
            None => Message::Notification(Notification { method, params }),
        });
    }

    let Some(id) = id else {
        return Err(Error::InvalidMessage(
            "message has neither method nor id".into(),
        ));
    };

    let outcome = match (object.remove("result"), object.remove("error")) {
        (Some(result), None) => Outcome::Success(result),
        (None, Some(error)) => {
            let error: ResponseError = serde_json::from_value(error).map_err(Error::Deserialize)?;
            Outcome::Failure(error)
        }
        (Some(_), Some(_)) => {
            return Err(Error::InvalidMessage(format!(
                "response {} has both result and error",
                id
            )))
        }
        (None, None) => {
            return Err(Error::InvalidMessage(format!(
                "response {} has neither result nor error",
                id
            )))
        }
    };

    Ok(Message::Response(Response { id, outcome }))
}

fn parse_id(id: Value) -> Result<RequestId, Error> {
    match id {
        Value::Number(n) => n
            .as_i64()
            .map(RequestId::Number)
            .ok_or_else(|| Error::InvalidMessage(format!("id {} is not an integer", n))),
        Value::String(s) => Ok(RequestId::String(s)),
        other => Err(Error::InvalidMessage(format!("invalid id {}", other))),
    }
}
