//! JSON-RPC 2.0 wire envelope. Parsing is deliberately staged through a
//! bare `serde_json::Value` rather than one `#[derive(Deserialize)]`
//! struct, because each failure mode along the way maps to a *different*
//! JSON-RPC error code (parse error vs. invalid request vs. missing
//! method). Collapsing them into a single `Err` would lose that
//! distinction.

use serde_json::{json, Value};

/// A successfully-parsed request line. `id: None` means the line was a
/// notification (no `id` field means no response is sent back);
/// `id: Some(Value::Null)` means the client sent an explicit `"id":
/// null`, which still gets a response.
#[derive(Debug)]
pub struct RawRequest {
    pub id: Option<Value>,
    pub method: String,
    pub params: Value,
}

/// Outcome of parsing one input line, before dispatch. Carries whatever
/// `id` could be salvaged even on error, so the error response echoes it
/// where possible.
pub enum ParseOutcome {
    Request(RawRequest),
    Error { id: Option<Value>, code: i64, message: String },
}

pub fn parse_line(line: &str) -> ParseOutcome {
    let value: Value = match serde_json::from_str(line) {
        Ok(v) => v,
        Err(e) => {
            return ParseOutcome::Error {
                id: None,
                code: -32700,
                message: format!("parse error: {}", e),
            }
        }
    };

    let obj = match value.as_object() {
        Some(o) => o,
        None => {
            return ParseOutcome::Error {
                id: None,
                code: -32600,
                message: "invalid request: must be a JSON object".to_string(),
            }
        }
    };

    let id = obj.get("id").cloned();

    let method = match obj.get("method").and_then(|m| m.as_str()) {
        Some(m) => m.to_string(),
        None => {
            return ParseOutcome::Error {
                id,
                code: -32600,
                message: "invalid request: missing 'method'".to_string(),
            }
        }
    };

    let params = obj.get("params").cloned().unwrap_or(Value::Null);
    ParseOutcome::Request(RawRequest { id, method, params })
}

pub fn success_response(id: &Value, result: Value) -> Value {
    json!({ "jsonrpc": "2.0", "result": result, "id": id })
}

pub fn error_response(id: &Value, code: i64, message: &str) -> Value {
    json!({ "jsonrpc": "2.0", "error": { "code": code, "message": message }, "id": id })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn malformed_json_is_parse_error_with_no_id() {
        match parse_line("{not json") {
            ParseOutcome::Error { id, code, .. } => {
                assert_eq!(code, -32700);
                assert_eq!(id, None);
            }
            _ => panic!("expected Error"),
        }
    }

    #[test]
    fn non_object_root_is_invalid_request() {
        match parse_line("[1,2,3]") {
            ParseOutcome::Error { code, .. } => assert_eq!(code, -32600),
            _ => panic!("expected Error"),
        }
    }

    #[test]
    fn missing_method_is_invalid_request_but_keeps_id() {
        match parse_line(r#"{"id":7,"params":{}}"#) {
            ParseOutcome::Error { code, id, .. } => {
                assert_eq!(code, -32600);
                assert_eq!(id, Some(json!(7)));
            }
            _ => panic!("expected Error"),
        }
    }

    #[test]
    fn absent_id_is_a_notification() {
        match parse_line(r#"{"method":"ping"}"#) {
            ParseOutcome::Request(req) => assert_eq!(req.id, None),
            _ => panic!("expected Request"),
        }
    }

    #[test]
    fn explicit_null_id_is_preserved_not_treated_as_absent() {
        match parse_line(r#"{"method":"ping","id":null}"#) {
            ParseOutcome::Request(req) => assert_eq!(req.id, Some(Value::Null)),
            _ => panic!("expected Request"),
        }
    }

    #[test]
    fn string_id_is_preserved_exactly() {
        match parse_line(r#"{"method":"ping","id":"abc-123"}"#) {
            ParseOutcome::Request(req) => assert_eq!(req.id, Some(json!("abc-123"))),
            _ => panic!("expected Request"),
        }
    }
}
