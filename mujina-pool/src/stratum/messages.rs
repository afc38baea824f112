//! Stratum v1 wire messages, server side.
//!
//! Every message is one JSON object per line. Requests carry an `id`, a
//! `method` and `params`; responses echo the `id` with a `result` and an
//! `error`, which is `null` or `[code, message, null]`. Notifications are
//! requests with a `null` id that expect no answer.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use strum::{Display, EnumString, IntoStaticStr};

/// Methods the pool understands or emits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, EnumString, IntoStaticStr)]
pub enum StratumMethod {
    #[strum(serialize = "mining.subscribe")]
    Subscribe,
    #[strum(serialize = "mining.authorize")]
    Authorize,
    #[strum(serialize = "mining.submit")]
    Submit,
    #[strum(serialize = "mining.suggest_difficulty")]
    SuggestDifficulty,
    #[strum(serialize = "mining.extranonce.subscribe")]
    ExtranonceSubscribe,
    #[strum(serialize = "mining.notify")]
    Notify,
    #[strum(serialize = "mining.set_difficulty")]
    SetDifficulty,
}

/// Error codes reported in responses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StratumErrorCode {
    Other = 20,
    JobNotFound = 21,
    DuplicateShare = 22,
    LowDifficultyShare = 23,
    UnauthorizedWorker = 24,
    NotSubscribed = 25,
}

impl StratumErrorCode {
    pub fn code(self) -> i32 {
        self as i32
    }
}

/// A client request.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct Request {
    #[serde(default)]
    pub id: Value,
    pub method: String,
    #[serde(default)]
    pub params: Value,
}

impl Request {
    /// The method, if it is one the pool knows.
    pub fn known_method(&self) -> Option<StratumMethod> {
        self.method.parse().ok()
    }

    /// Positional parameter `index`, when params is an array.
    pub fn param(&self, index: usize) -> Option<&Value> {
        self.params.as_array().and_then(|params| params.get(index))
    }

    /// Positional string parameter `index`.
    pub fn str_param(&self, index: usize) -> Option<&str> {
        self.param(index).and_then(Value::as_str)
    }
}

/// A response to a client request.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Response {
    pub id: Value,
    pub result: Value,
    pub error: Value,
}

impl Response {
    pub fn ok(id: Value, result: Value) -> Self {
        Self {
            id,
            result,
            error: Value::Null,
        }
    }

    pub fn error(id: Value, code: StratumErrorCode, message: impl Into<String>) -> Self {
        Self {
            id,
            result: Value::Null,
            error: json!([code.code(), message.into(), null]),
        }
    }
}

/// A server-initiated message.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Notification {
    pub id: Value,
    pub method: &'static str,
    pub params: Value,
}

impl Notification {
    pub fn new(method: StratumMethod, params: Value) -> Self {
        Self {
            id: Value::Null,
            method: method.into(),
            params,
        }
    }

    pub fn set_difficulty(difficulty: f64) -> Self {
        Self::new(StratumMethod::SetDifficulty, json!([difficulty]))
    }

    pub fn notify(params: Value) -> Self {
        Self::new(StratumMethod::Notify, params)
    }
}

/// Parse one line into a request. Anything that is not a JSON object with a
/// string `method` is junk.
pub fn parse_request(line: &str) -> serde_json::Result<Request> {
    serde_json::from_str(line)
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    #[test_case("mining.subscribe", Some(StratumMethod::Subscribe))]
    #[test_case("mining.submit", Some(StratumMethod::Submit))]
    #[test_case("mining.extranonce.subscribe", Some(StratumMethod::ExtranonceSubscribe))]
    #[test_case("mining.get_transactions", None)]
    fn test_known_method(method: &str, expected: Option<StratumMethod>) {
        let request = Request {
            id: json!(1),
            method: method.into(),
            params: json!([]),
        };
        assert_eq!(request.known_method(), expected);
    }

    #[test]
    fn test_parse_request() {
        let request =
            parse_request(r#"{"id": 4, "method": "mining.authorize", "params": ["miner.rig", "x"]}"#)
                .unwrap();
        assert_eq!(request.id, json!(4));
        assert_eq!(request.str_param(0), Some("miner.rig"));
        assert_eq!(request.str_param(1), Some("x"));
        assert_eq!(request.str_param(2), None);
    }

    #[test]
    fn test_parse_request_without_params() {
        let request = parse_request(r#"{"id": "a", "method": "mining.subscribe"}"#).unwrap();
        assert_eq!(request.params, Value::Null);
        assert_eq!(request.param(0), None);
    }

    #[test_case("not json" ; "garbage")]
    #[test_case("[1, 2, 3]" ; "array")]
    #[test_case(r#"{"id": 1, "params": []}"# ; "missing method")]
    fn test_parse_junk(line: &str) {
        assert!(parse_request(line).is_err());
    }

    #[test]
    fn test_error_response_shape() {
        let response = Response::error(json!(7), StratumErrorCode::NotSubscribed, "not subscribed");
        assert_eq!(
            serde_json::to_value(&response).unwrap(),
            json!({"id": 7, "result": null, "error": [25, "not subscribed", null]})
        );
    }

    #[test]
    fn test_notification_shape() {
        let note = Notification::set_difficulty(16.0);
        assert_eq!(
            serde_json::to_value(&note).unwrap(),
            json!({"id": null, "method": "mining.set_difficulty", "params": [16.0]})
        );
    }
}
