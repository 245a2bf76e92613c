use crate::net::Endpoint;
use serde::Serialize;
use serde_json::{Map, Value};
use time::OffsetDateTime;

pub const OK_STATUS: &str = "OK";
pub const ERROR_STATUS: &str = "Error";

/// One completed transaction, shaped for a publisher sink.
///
/// The protocol-specific sub-map lands under the protocol's own name via
/// `details` (for example `"http": {"code": 200, ...}`).
#[derive(Debug, Clone, Serialize)]
pub struct Event {
    #[serde(with = "time::serde::rfc3339")]
    pub timestamp: OffsetDateTime,
    #[serde(rename = "type")]
    pub kind: &'static str,
    pub status: &'static str,
    pub responsetime: i64,
    pub method: String,
    pub path: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub query: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request_raw: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response_raw: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub real_ip: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bytes_in: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bytes_out: Option<u64>,
    pub src: Endpoint,
    pub dst: Endpoint,
    #[serde(flatten)]
    pub details: Map<String, Value>,
}

impl Event {
    pub fn new(
        kind: &'static str,
        timestamp: OffsetDateTime,
        src: Endpoint,
        dst: Endpoint,
    ) -> Self {
        Self {
            timestamp,
            kind,
            status: OK_STATUS,
            responsetime: 0,
            method: String::new(),
            path: String::new(),
            query: None,
            request_raw: None,
            response_raw: None,
            real_ip: None,
            bytes_in: None,
            bytes_out: None,
            src,
            dst,
            details: Map::new(),
        }
    }

    pub fn set_status(&mut self, ok: bool) {
        self.status = if ok { OK_STATUS } else { ERROR_STATUS };
    }
}
