use chrono::{SecondsFormat, Utc};
use log::{debug, error};
use serde_json::{json, Value};
use warp::http::StatusCode;
use warp::Reply;

use crate::error_handling::types::ApiError;

pub fn now_iso() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Success envelope: `{success: true, timestamp, ...payload}`.
pub fn success(payload: Value) -> warp::reply::Response {
    let mut body = match payload {
        Value::Object(map) => Value::Object(map),
        other => json!({ "result": other }),
    };
    if let Value::Object(map) = &mut body {
        // A payload that already carries `success` (command results do) wins.
        map.entry("success").or_insert(Value::Bool(true));
        map.insert("timestamp".to_string(), Value::String(now_iso()));
    }
    warp::reply::with_status(warp::reply::json(&body), StatusCode::OK).into_response()
}

/// Error envelope: `{success: false, error, code, details?, timestamp}`.
///
/// 4xx outcomes are expected and logged at debug; 5xx are not and logged at
/// error.
pub fn failure(err: &ApiError) -> warp::reply::Response {
    if err.is_server_error() {
        error!("Request failed: {}", err);
    } else {
        debug!("Request rejected: {}", err);
    }

    let mut body = json!({
        "success": false,
        "error": err.message,
        "code": err.code,
        "timestamp": now_iso(),
    });
    if let Some(details) = &err.details {
        body["details"] = details.clone();
    }
    warp::reply::with_status(warp::reply::json(&body), err.status).into_response()
}

/// Collapses a handler result into the wire response.
pub fn respond(result: Result<Value, ApiError>) -> warp::reply::Response {
    match result {
        Ok(payload) => success(payload),
        Err(err) => failure(&err),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use warp::Filter;

    #[tokio::test]
    async fn success_envelope_carries_payload_and_timestamp() {
        let filter = warp::any().map(|| success(json!({ "sessionId": "s1" })));
        let response = warp::test::request().reply(&filter).await;

        assert_eq!(response.status(), StatusCode::OK);
        let body: Value = serde_json::from_slice(response.body()).unwrap();
        assert_eq!(body["success"], true);
        assert_eq!(body["sessionId"], "s1");
        assert!(body["timestamp"].is_string());
    }

    #[tokio::test]
    async fn failure_envelope_carries_code_and_status() {
        let filter = warp::any().map(|| {
            failure(&ApiError::from(
                crate::error_handling::types::PortError::NotExposed(9999),
            ))
        });
        let response = warp::test::request().reply(&filter).await;

        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        let body: Value = serde_json::from_slice(response.body()).unwrap();
        assert_eq!(body["success"], false);
        assert_eq!(body["code"], "PORT_NOT_EXPOSED");
        assert_eq!(body["details"]["port"], 9999);
    }
}
