// Copyright (c) Unifra Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Parser stage (spec §4.1): parses the request body as JSON-RPC 2.0
//! (single or batch) and extracts the logical network from the Host
//! header.

use async_trait::async_trait;
use serde_json::Value;

use crate::context::{network_from_host, var_keys, Context, ParsedRpc, RpcId};
use crate::error::{JsonRpcError, StageOutcome};
use crate::pipeline::Stage;

pub const PRIORITY: i32 = 26000;

const MAX_BODY_BYTES: usize = 1024 * 1024;
const MAX_BATCH_LEN: usize = 100;

pub struct ParserStage;

#[async_trait]
impl Stage for ParserStage {
    fn name(&self) -> &'static str {
        "Parser"
    }

    fn priority(&self) -> i32 {
        PRIORITY
    }

    async fn run(&self, ctx: &mut Context) -> StageOutcome {
        if should_skip(ctx) {
            return StageOutcome::Continue;
        }

        match parse_body(&ctx.body) {
            Ok(parsed) => {
                ctx.vars.set(var_keys::JSONRPC_METHOD, parsed.primary_method());
                ctx.vars.set(
                    var_keys::JSONRPC_METHODS,
                    parsed.methods.join(","),
                );
                ctx.vars.set(var_keys::JSONRPC_IS_BATCH, parsed.is_batch.to_string());
                ctx.vars.set(var_keys::JSONRPC_COUNT, parsed.count().to_string());

                let network = ctx
                    .route
                    .parser
                    .network
                    .clone()
                    .or_else(|| ctx.host_header.as_deref().map(network_from_host))
                    .unwrap_or_default();
                ctx.vars.set(var_keys::UNIFRA_NETWORK, network.clone());
                ctx.network = Some(network);
                ctx.parsed = Some(parsed);
                StageOutcome::Continue
            }
            Err(err) => StageOutcome::Reject(err),
        }
    }
}

/// Skip (no-op) for non-POST, websocket-upgrade, or non-JSON requests
/// (spec §4.1).
fn should_skip(ctx: &Context) -> bool {
    if !ctx.http_method.eq_ignore_ascii_case("POST") {
        return true;
    }
    if ctx
        .upgrade_header
        .as_deref()
        .map(|h| h.eq_ignore_ascii_case("websocket"))
        .unwrap_or(false)
    {
        return true;
    }
    !ctx
        .content_type
        .as_deref()
        .map(|ct| ct.contains("application/json"))
        .unwrap_or(false)
}

/// Parses `body` into a `ParsedRpc`, applying every rejection rule from
/// spec §4.1.
pub fn parse_body(body: &[u8]) -> Result<ParsedRpc, JsonRpcError> {
    if body.is_empty() {
        return Err(JsonRpcError::parse_error("empty body"));
    }
    if body.len() > MAX_BODY_BYTES {
        return Err(JsonRpcError::parse_error("body too large"));
    }

    let value: Value =
        serde_json::from_slice(body).map_err(|e| JsonRpcError::parse_error(format!("parse error: {e}")))?;

    match value {
        Value::Array(elements) => {
            if elements.is_empty() {
                return Err(JsonRpcError::invalid_request("empty batch"));
            }
            if elements.len() > MAX_BATCH_LEN {
                return Err(JsonRpcError::invalid_request("batch too large"));
            }
            let mut methods = Vec::with_capacity(elements.len());
            let mut ids = Vec::with_capacity(elements.len());
            for el in &elements {
                let (method, id) = parse_element(el)?;
                methods.push(method);
                ids.push(id);
            }
            Ok(ParsedRpc {
                is_batch: true,
                methods,
                ids,
            })
        }
        single => {
            let (method, id) = parse_element(&single)?;
            Ok(ParsedRpc {
                is_batch: false,
                methods: vec![method],
                ids: vec![id],
            })
        }
    }
}

fn parse_element(value: &Value) -> Result<(String, RpcId), JsonRpcError> {
    let method = value
        .get("method")
        .and_then(Value::as_str)
        .filter(|m| !m.is_empty())
        .ok_or_else(|| JsonRpcError::invalid_request("missing or empty method"))?
        .to_string();
    let id = match value.get("id") {
        None | Some(Value::Null) => RpcId::Null,
        Some(Value::Number(n)) => match n.as_i64() {
            Some(i) => RpcId::Number(i),
            None => RpcId::Raw(n.clone()),
        },
        Some(Value::String(s)) => RpcId::String(s.clone()),
        Some(_) => RpcId::Null,
    };
    Ok((method, id))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_single_request_preserving_id() {
        let body = br#"{"jsonrpc":"2.0","method":"eth_blockNumber","id":1}"#;
        let parsed = parse_body(body).unwrap();
        assert!(!parsed.is_batch);
        assert_eq!(parsed.methods, vec!["eth_blockNumber"]);
        assert_eq!(parsed.ids, vec![RpcId::Number(1)]);
        assert_eq!(parsed.primary_method(), "eth_blockNumber");
    }

    #[test]
    fn parses_batch_preserving_submission_order() {
        let body = br#"[{"method":"eth_blockNumber","id":1},{"method":"eth_call","id":2},{"method":"eth_blockNumber","id":3}]"#;
        let parsed = parse_body(body).unwrap();
        assert!(parsed.is_batch);
        assert_eq!(
            parsed.methods,
            vec!["eth_blockNumber", "eth_call", "eth_blockNumber"]
        );
        assert_eq!(parsed.primary_method(), "batch");
        assert_eq!(parsed.count(), 3);
    }

    #[test]
    fn notification_without_id_records_null() {
        let body = br#"{"jsonrpc":"2.0","method":"eth_subscribe"}"#;
        let parsed = parse_body(body).unwrap();
        assert_eq!(parsed.ids, vec![RpcId::Null]);
    }

    #[test]
    fn non_i64_numeric_id_round_trips_instead_of_collapsing_to_zero() {
        let body = br#"{"jsonrpc":"2.0","method":"eth_subscribe","id":1.5}"#;
        let parsed = parse_body(body).unwrap();
        assert_eq!(parsed.first_id(), Some(serde_json::json!(1.5)));

        let body = br#"{"jsonrpc":"2.0","method":"eth_subscribe","id":18446744073709551615}"#;
        let parsed = parse_body(body).unwrap();
        assert_eq!(
            parsed.first_id(),
            Some(serde_json::json!(18446744073709551615u64))
        );
    }

    #[test]
    fn rejects_empty_body() {
        let err = parse_body(b"").unwrap_err();
        assert_eq!(err.code, -32700);
    }

    #[test]
    fn rejects_body_too_large() {
        let body = vec![b' '; MAX_BODY_BYTES + 1];
        let err = parse_body(&body).unwrap_err();
        assert_eq!(err.code, -32700);
        assert_eq!(err.message, "body too large");
    }

    #[test]
    fn rejects_malformed_json() {
        let err = parse_body(b"{not json").unwrap_err();
        assert_eq!(err.code, -32700);
    }

    #[test]
    fn rejects_empty_batch() {
        let err = parse_body(b"[]").unwrap_err();
        assert_eq!(err.code, -32600);
        assert_eq!(err.message, "empty batch");
    }

    #[test]
    fn rejects_batch_too_large() {
        let mut elements = Vec::new();
        for i in 0..101 {
            elements.push(format!(r#"{{"method":"m","id":{i}}}"#));
        }
        let body = format!("[{}]", elements.join(","));
        let err = parse_body(body.as_bytes()).unwrap_err();
        assert_eq!(err.code, -32600);
        assert_eq!(err.message, "batch too large");
    }

    #[test]
    fn rejects_element_missing_method() {
        let err = parse_body(br#"{"jsonrpc":"2.0","id":1}"#).unwrap_err();
        assert_eq!(err.code, -32600);
    }

    #[test]
    fn rejects_element_with_empty_method() {
        let err = parse_body(br#"{"jsonrpc":"2.0","method":"","id":1}"#).unwrap_err();
        assert_eq!(err.code, -32600);
    }
}
