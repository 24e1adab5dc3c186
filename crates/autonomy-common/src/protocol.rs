//! RPC protocol messages between the autonomy core and external transports.
//!
//! The transport itself (ubus, HTTP, unix socket) is an external
//! collaborator; it serializes these types and hands requests to the
//! core's dispatcher. All messages are JSON-encoded.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::models::{
    DetectMode, Event, MemberClass, MemberState, MeteredMode, Sample, Score,
};

// ── Requests ────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionCmd {
    Failover,
    Restore,
    Recheck,
    Promote,
    RecheckMetered,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

impl LogLevel {
    pub fn as_str(self) -> &'static str {
        match self {
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
        }
    }
}

/// Every method the RPC surface can invoke on the core.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "method", content = "params", rename_all = "snake_case")]
pub enum RpcRequest {
    Status,
    Members,
    Telemetry {
        #[serde(default)]
        member: Option<String>,
        #[serde(default)]
        since: Option<DateTime<Utc>>,
    },
    Events {
        #[serde(default)]
        since: Option<DateTime<Utc>>,
        #[serde(default)]
        limit: Option<usize>,
    },
    Failover {
        member: String,
    },
    Restore,
    Recheck {
        #[serde(default)]
        member: Option<String>,
    },
    Action {
        cmd: ActionCmd,
        #[serde(default)]
        member: Option<String>,
    },
    Setlog {
        level: LogLevel,
    },
    Config,
    Info,
}

// ── Responses ───────────────────────────────────────────────────────

/// Uniform response envelope. Failed calls carry `success = false` and a
/// message; no partial state is exposed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcResponse {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "serde_json::Value::is_null")]
    pub data: serde_json::Value,
}

impl RpcResponse {
    pub fn ok(data: impl Serialize) -> Self {
        RpcResponse {
            success: true,
            error: None,
            data: serde_json::to_value(data).unwrap_or(serde_json::Value::Null),
        }
    }

    pub fn ok_empty() -> Self {
        RpcResponse {
            success: true,
            error: None,
            data: serde_json::Value::Null,
        }
    }

    pub fn err(message: impl Into<String>) -> Self {
        RpcResponse {
            success: false,
            error: Some(message.into()),
            data: serde_json::Value::Null,
        }
    }
}

// ── Payloads ────────────────────────────────────────────────────────

/// Per-member line in `status` and `members` responses.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemberStatus {
    pub name: String,
    pub iface: String,
    pub class: MemberClass,
    pub state: MemberState,
    pub eligible: bool,
    pub detect: DetectMode,
    pub weight: u8,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub score: Option<Score>,
    pub last_seen: DateTime<Utc>,
}

/// Field-wise health of the core's sub-components. `status` reports these
/// best-effort even when a sub-component is unhealthy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComponentHealth {
    pub store: bool,
    pub registry: bool,
    pub controller: bool,
    pub predictor: bool,
    pub metered: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusPayload {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub primary: Option<String>,
    pub members: Vec<MemberStatus>,
    pub metered_mode: MeteredMode,
    pub uptime_s: u64,
    pub tick_count: u64,
    pub skipped_ticks: u64,
    pub health: ComponentHealth,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelemetryPayload {
    pub samples: Vec<Sample>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventsPayload {
    pub events: Vec<Event>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InfoPayload {
    pub version: String,
    pub started_at: DateTime<Utc>,
    pub tick_count: u64,
    pub skipped_ticks: u64,
    pub memory_usage_bytes: usize,
    pub dry_run: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_tagged_serialization() {
        let req = RpcRequest::Failover {
            member: "cell_a".into(),
        };
        let json = serde_json::to_string(&req).unwrap();
        assert!(json.contains("\"method\":\"failover\""));
        assert!(json.contains("cell_a"));

        let back: RpcRequest = serde_json::from_str(&json).unwrap();
        assert_eq!(back, req);
    }

    #[test]
    fn request_without_params_parses() {
        let req: RpcRequest = serde_json::from_str(r#"{"method":"status"}"#).unwrap();
        assert_eq!(req, RpcRequest::Status);
    }

    #[test]
    fn telemetry_params_default_to_none() {
        let req: RpcRequest =
            serde_json::from_str(r#"{"method":"telemetry","params":{}}"#).unwrap();
        assert_eq!(
            req,
            RpcRequest::Telemetry {
                member: None,
                since: None
            }
        );
    }

    #[test]
    fn action_cmd_wire_form() {
        let req: RpcRequest = serde_json::from_str(
            r#"{"method":"action","params":{"cmd":"recheck_metered"}}"#,
        )
        .unwrap();
        assert_eq!(
            req,
            RpcRequest::Action {
                cmd: ActionCmd::RecheckMetered,
                member: None
            }
        );
    }

    #[test]
    fn error_response_shape() {
        let resp = RpcResponse::err("no such member");
        let json = serde_json::to_string(&resp).unwrap();
        assert!(json.contains("\"success\":false"));
        assert!(json.contains("no such member"));
        // Null data is omitted from the wire form
        assert!(!json.contains("\"data\""));
    }

    #[test]
    fn ok_response_carries_data() {
        let resp = RpcResponse::ok(serde_json::json!({"primary": "starlink"}));
        assert!(resp.success);
        assert_eq!(resp.data["primary"], "starlink");
    }
}
