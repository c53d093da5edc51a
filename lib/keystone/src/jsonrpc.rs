use serde::{Deserialize, Serialize};
use serde_json::Value;

pub const PARSE_ERROR: i64 = -32700;
pub const INVALID_REQUEST: i64 = -32600;
pub const METHOD_NOT_FOUND: i64 = -32601;
pub const INVALID_PARAMS: i64 = -32602;
pub const INTERNAL_ERROR: i64 = -32603;

/// JSON-RPC request id: number, string, or explicit null.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RequestId {
    Num(i64),
    Str(String),
    Null,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcError {
    pub code: i64,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl RpcError {
    pub fn new(code: i64, message: &str) -> RpcError {
        RpcError {
            code,
            message: message.to_string(),
            data: None,
        }
    }

    pub fn with_data(mut self, data: Value) -> RpcError {
        self.data = Some(data);
        self
    }

    pub fn parse_error() -> RpcError {
        RpcError::new(PARSE_ERROR, "Parse error")
    }

    pub fn invalid_request() -> RpcError {
        RpcError::new(INVALID_REQUEST, "Invalid Request")
    }

    pub fn method_not_found(method: &str) -> RpcError {
        RpcError::new(METHOD_NOT_FOUND, "Method not found")
            .with_data(Value::String(method.to_string()))
    }

    pub fn invalid_params(detail: &str) -> RpcError {
        RpcError::new(INVALID_PARAMS, "Invalid params").with_data(Value::String(detail.to_string()))
    }

    pub fn internal(detail: &str) -> RpcError {
        RpcError::new(INTERNAL_ERROR, "Internal error").with_data(Value::String(detail.to_string()))
    }
}

/// A classified inbound message: requests expect a response, notifications
/// do not.
#[derive(Debug, Clone, PartialEq)]
pub enum Incoming {
    Call {
        id: RequestId,
        method: String,
        params: Option<Value>,
    },
    Notification {
        method: String,
        params: Option<Value>,
    },
}

/// Parses one JSON-RPC 2.0 message. Batches (arrays) are not accepted.
pub fn parse(body: &[u8]) -> Result<Incoming, RpcError> {
    let value: Value = serde_json::from_slice(body).map_err(|_| RpcError::parse_error())?;

    let object = match value.as_object() {
        Some(object) => object,
        None => return Err(RpcError::invalid_request()),
    };

    if object.get("jsonrpc").and_then(Value::as_str) != Some("2.0") {
        return Err(RpcError::invalid_request());
    }

    let method = match object.get("method").and_then(Value::as_str) {
        Some(method) => method.to_string(),
        None => return Err(RpcError::invalid_request()),
    };

    let params = object.get("params").cloned();

    match object.get("id") {
        None => Ok(Incoming::Notification { method, params }),
        Some(Value::Null) => Ok(Incoming::Call {
            id: RequestId::Null,
            method,
            params,
        }),
        Some(Value::Number(number)) => match number.as_i64() {
            Some(number) => Ok(Incoming::Call {
                id: RequestId::Num(number),
                method,
                params,
            }),
            None => Err(RpcError::invalid_request()),
        },
        Some(Value::String(text)) => Ok(Incoming::Call {
            id: RequestId::Str(text.clone()),
            method,
            params,
        }),
        Some(_) => Err(RpcError::invalid_request()),
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Response {
    jsonrpc: String,
    pub id: RequestId,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<RpcError>,
}

impl Response {
    pub fn result(id: RequestId, result: Value) -> Response {
        Response {
            jsonrpc: "2.0".to_string(),
            id,
            result: Some(result),
            error: None,
        }
    }

    pub fn error(id: RequestId, error: RpcError) -> Response {
        Response {
            jsonrpc: "2.0".to_string(),
            id,
            result: None,
            error: Some(error),
        }
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(self).expect("response serializes")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_request() {
        let incoming = parse(br#"{"jsonrpc":"2.0","id":1,"method":"ping"}"#).unwrap();

        assert_eq!(
            incoming,
            Incoming::Call {
                id: RequestId::Num(1),
                method: "ping".to_string(),
                params: None,
            }
        );
    }

    #[test]
    fn test_parse_notification() {
        let incoming =
            parse(br#"{"jsonrpc":"2.0","method":"notifications/progress","params":{"p":1}}"#)
                .unwrap();

        match incoming {
            Incoming::Notification { method, params } => {
                assert_eq!(method, "notifications/progress");
                assert_eq!(params, Some(json!({"p": 1})));
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_null_and_string_ids() {
        let null = parse(br#"{"jsonrpc":"2.0","id":null,"method":"m"}"#).unwrap();

        assert!(matches!(null, Incoming::Call { id: RequestId::Null, .. }));

        let text = parse(br#"{"jsonrpc":"2.0","id":"abc","method":"m"}"#).unwrap();

        assert!(
            matches!(text, Incoming::Call { id: RequestId::Str(ref s), .. } if s == "abc")
        );
    }

    #[test]
    fn test_parse_error() {
        assert_eq!(parse(b"{not json").unwrap_err().code, PARSE_ERROR);
    }

    #[test]
    fn test_invalid_request() {
        assert_eq!(parse(b"[1,2]").unwrap_err().code, INVALID_REQUEST);
        assert_eq!(
            parse(br#"{"jsonrpc":"1.0","id":1,"method":"m"}"#).unwrap_err().code,
            INVALID_REQUEST
        );
        assert_eq!(
            parse(br#"{"jsonrpc":"2.0","id":1}"#).unwrap_err().code,
            INVALID_REQUEST
        );
        assert_eq!(
            parse(br#"{"jsonrpc":"2.0","id":true,"method":"m"}"#).unwrap_err().code,
            INVALID_REQUEST
        );
    }

    #[test]
    fn test_response_serialization() {
        let ok = Response::result(RequestId::Num(7), json!({"sum": 8}));

        assert_eq!(ok.to_json(), r#"{"jsonrpc":"2.0","id":7,"result":{"sum":8}}"#);

        let err = Response::error(RequestId::Null, RpcError::parse_error());

        assert_eq!(
            err.to_json(),
            r#"{"jsonrpc":"2.0","id":null,"error":{"code":-32700,"message":"Parse error"}}"#
        );
    }
}
