use serde::{Deserialize, Serialize};
use serde_json::Value;

/// One request per connection, sent as a single JSON line.
///
/// Numeric parameters travel as signed integers so that out-of-range values
/// reach validation instead of failing deserialization.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ClientCommand {
    Ping,
    Start {
        service: Option<String>,
    },
    Stop {
        service: Option<String>,
    },
    Status {
        #[serde(default)]
        service: Option<String>,
    },
    Log {
        service: Option<String>,
        lines: Option<i64>,
    },
    SetupProxy {
        local_port: Option<i64>,
        target_address: Option<String>,
        target_port: Option<i64>,
    },
    ClearProxy {
        local_port: Option<i64>,
    },
    ListProxies,
    ProxyStatus {
        local_port: Option<i64>,
    },
    GuestStatus {
        #[serde(default)]
        service: Option<String>,
    },
    /// Keeps the connection open and streams events as JSON lines.
    Subscribe,
    Shutdown,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandReply {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<Value>,
}

impl CommandReply {
    pub fn ok() -> Self {
        Self {
            success: true,
            message: None,
            payload: None,
        }
    }

    pub fn ok_with(message: impl Into<String>) -> Self {
        Self {
            message: Some(message.into()),
            ..Self::ok()
        }
    }

    pub fn failure(message: impl Into<String>) -> Self {
        Self {
            success: false,
            message: Some(message.into()),
            payload: None,
        }
    }

    pub fn with_payload(mut self, payload: Value) -> Self {
        self.payload = Some(payload);
        self
    }
}
