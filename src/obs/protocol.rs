//! obs-websocket v5 message types.
//!
//! Only the subset needed to identify, list scenes and switch the program
//! scene. Every message is `{"op": <opcode>, "d": <data>}`.

use serde::{Deserialize, Serialize};
use serde_json::Value;

pub const RPC_VERSION: u32 = 1;

pub const OP_HELLO: u8 = 0;
pub const OP_IDENTIFY: u8 = 1;
pub const OP_IDENTIFIED: u8 = 2;
pub const OP_EVENT: u8 = 5;
pub const OP_REQUEST: u8 = 6;
pub const OP_REQUEST_RESPONSE: u8 = 7;

/// Close code sent by the server when the Identify authentication is wrong.
pub const CLOSE_AUTHENTICATION_FAILED: u16 = 4009;
/// Request status code for a missing resource, such as an unknown scene.
pub const STATUS_RESOURCE_NOT_FOUND: u16 = 600;

/// Any message, with the data left undecoded until the opcode is known.
#[derive(Debug, Deserialize)]
pub struct RawMessage {
    pub op: u8,
    #[serde(default)]
    pub d: Value,
}

#[derive(Debug, Serialize)]
pub struct Outgoing<T: Serialize> {
    pub op: u8,
    pub d: T,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Hello {
    #[serde(default)]
    pub obs_web_socket_version: String,
    pub rpc_version: u32,
    pub authentication: Option<AuthChallenge>,
}

#[derive(Debug, Deserialize)]
pub struct AuthChallenge {
    pub challenge: String,
    pub salt: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Identify {
    pub rpc_version: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub authentication: Option<String>,
    /// Bitmask of event categories; 0 subscribes to none
    pub event_subscriptions: u32,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Identified {
    pub negotiated_rpc_version: u32,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Request<'a> {
    pub request_type: &'a str,
    pub request_id: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request_data: Option<Value>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestResponse {
    pub request_type: String,
    pub request_id: String,
    pub request_status: RequestStatus,
    #[serde(default)]
    pub response_data: Option<Value>,
}

#[derive(Debug, Deserialize)]
pub struct RequestStatus {
    pub result: bool,
    pub code: u16,
    #[serde(default)]
    pub comment: Option<String>,
}

/// `GetSceneList` response data.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SceneListData {
    #[serde(default)]
    pub current_program_scene_name: Option<String>,
    pub scenes: Vec<SceneEntry>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SceneEntry {
    pub scene_name: String,
}

/// Scene names as OBS reports them, plus the current program scene.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SceneList {
    pub scenes: Vec<String>,
    pub current: Option<String>,
}

impl From<SceneListData> for SceneList {
    fn from(data: SceneListData) -> Self {
        Self {
            scenes: data.scenes.into_iter().map(|s| s.scene_name).collect(),
            current: data.current_program_scene_name.filter(|s| !s.is_empty()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_hello_with_auth() {
        let raw: RawMessage = serde_json::from_value(json!({
            "op": 0,
            "d": {
                "obsWebSocketVersion": "5.1.0",
                "rpcVersion": 1,
                "authentication": {"challenge": "c", "salt": "s"}
            }
        }))
        .unwrap();
        assert_eq!(raw.op, OP_HELLO);
        let hello: Hello = serde_json::from_value(raw.d).unwrap();
        assert_eq!(hello.rpc_version, 1);
        assert_eq!(hello.authentication.unwrap().salt, "s");
    }

    #[test]
    fn test_identify_omits_missing_auth() {
        let msg = Outgoing {
            op: OP_IDENTIFY,
            d: Identify {
                rpc_version: RPC_VERSION,
                authentication: None,
                event_subscriptions: 0,
            },
        };
        let value = serde_json::to_value(&msg).unwrap();
        assert_eq!(
            value,
            json!({"op": 1, "d": {"rpcVersion": 1, "eventSubscriptions": 0}})
        );
    }

    #[test]
    fn test_scene_list_keeps_obs_order() {
        let data: SceneListData = serde_json::from_value(json!({
            "currentProgramSceneName": "Live",
            "currentPreviewSceneName": null,
            "scenes": [
                {"sceneIndex": 2, "sceneName": "Death"},
                {"sceneIndex": 1, "sceneName": "Map"},
                {"sceneIndex": 0, "sceneName": "Live"}
            ]
        }))
        .unwrap();
        let list = SceneList::from(data);
        assert_eq!(list.scenes, vec!["Death", "Map", "Live"]);
        assert_eq!(list.current.as_deref(), Some("Live"));
    }

    #[test]
    fn test_parse_failed_request_response() {
        let response: RequestResponse = serde_json::from_value(json!({
            "requestType": "SetCurrentProgramScene",
            "requestId": "3",
            "requestStatus": {"result": false, "code": 600, "comment": "No source was found"}
        }))
        .unwrap();
        assert!(!response.request_status.result);
        assert_eq!(response.request_status.code, STATUS_RESOURCE_NOT_FOUND);
        assert!(response.response_data.is_none());
    }
}
