//! Blocking obs-websocket v5 client.
//!
//! Connects with a bounded timeout, performs the Hello/Identify handshake and
//! then exchanges one request at a time. No reconnect loop: a dropped
//! connection is reported and left to the user.

use serde::Serialize;
use serde_json::{Value, json};
use std::io::ErrorKind;
use std::net::{TcpStream, ToSocketAddrs};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};
use tungstenite::handshake::HandshakeError;
use tungstenite::http::Uri;
use tungstenite::{Message, WebSocket};

use super::auth::auth_response;
use super::protocol::{
    CLOSE_AUTHENTICATION_FAILED, Hello, Identified, Identify, OP_EVENT, OP_HELLO, OP_IDENTIFIED,
    OP_IDENTIFY, OP_REQUEST, OP_REQUEST_RESPONSE, Outgoing, RPC_VERSION, RawMessage, Request,
    RequestResponse, STATUS_RESOURCE_NOT_FOUND, SceneList, SceneListData,
};
use crate::config::ObsSettings;
use crate::error::{ConnectError, ListError, SwitchError};
use crate::monitor::SceneSink;

/// Upper bound of a single blocking read, so deadlines are checked regularly.
const READ_SLICE: Duration = Duration::from_millis(100);

/// Builds the websocket URL for a host/port pair.
///
/// A host that already starts with `ws://` or `wss://` is used verbatim.
pub fn endpoint_url(host: &str, port: u32) -> Result<String, ConnectError> {
    let host = host.trim();
    if host.is_empty() {
        return Err(ConnectError::InvalidEndpoint("host is empty".to_string()));
    }
    if host.starts_with("ws://") || host.starts_with("wss://") {
        return Ok(host.to_string());
    }
    if !(1..=65535).contains(&port) {
        return Err(ConnectError::InvalidEndpoint(format!(
            "port must be between 1 and 65535, got {}",
            port
        )));
    }
    if host.contains(':') && !host.starts_with('[') {
        // Bare IPv6 literal
        return Ok(format!("ws://[{}]:{}", host, port));
    }
    Ok(format!("ws://{}:{}", host, port))
}

/// Why a request did not produce a response.
#[derive(Debug)]
enum RequestFailure {
    NotConnected,
    TimedOut,
    Transport(String),
    Malformed(String),
    Status { code: u16, comment: String },
}

/// Something went wrong below the request layer.
#[derive(Debug)]
enum TransportFailure {
    TimedOut,
    Io(String),
    Malformed(String),
}

impl std::fmt::Display for TransportFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TransportFailure::TimedOut => write!(f, "timed out waiting for OBS"),
            TransportFailure::Io(msg) => write!(f, "{}", msg),
            TransportFailure::Malformed(msg) => write!(f, "malformed message: {}", msg),
        }
    }
}

enum Incoming {
    Message(RawMessage),
    Closed { code: Option<u16>, reason: String },
}

/// An identified connection to OBS.
pub struct ObsClient {
    socket: WebSocket<TcpStream>,
    url: String,
    server_version: String,
    next_request_id: u64,
    request_timeout: Duration,
    connected: bool,
}

impl std::fmt::Debug for ObsClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ObsClient")
            .field("url", &self.url)
            .field("server_version", &self.server_version)
            .field("connected", &self.connected)
            .finish()
    }
}

impl ObsClient {
    /// Opens the websocket and identifies, all within `connect_timeout_ms`.
    pub fn connect(settings: &ObsSettings) -> Result<Self, ConnectError> {
        let timeout = Duration::from_millis(settings.connect_timeout_ms.max(1));
        let deadline = Instant::now() + timeout;
        let url = endpoint_url(&settings.host, settings.port)?;
        info!("Connecting to OBS at {}", url);

        let stream = open_tcp(&url, timeout)?;
        stream
            .set_read_timeout(Some(READ_SLICE))
            .and_then(|_| stream.set_write_timeout(Some(timeout)))
            .and_then(|_| stream.set_nodelay(true))
            .map_err(|e| ConnectError::Handshake(e.to_string()))?;

        let mut attempt = tungstenite::client(url.as_str(), stream);
        let socket = loop {
            match attempt {
                Ok((socket, _response)) => break socket,
                Err(HandshakeError::Interrupted(mid)) => {
                    if Instant::now() >= deadline {
                        return Err(ConnectError::Timeout(url));
                    }
                    attempt = mid.handshake();
                }
                Err(HandshakeError::Failure(e)) => {
                    return Err(ConnectError::Handshake(e.to_string()));
                }
            }
        };

        let mut client = Self {
            socket,
            url,
            server_version: String::new(),
            next_request_id: 0,
            request_timeout: timeout,
            connected: true,
        };
        client.identify(&settings.password, deadline)?;
        Ok(client)
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// obs-websocket version reported in the Hello message.
    pub fn server_version(&self) -> &str {
        &self.server_version
    }

    /// False once the transport has failed or the server closed.
    pub fn is_connected(&self) -> bool {
        self.connected
    }

    /// Scene names in the order OBS reports them, and the program scene.
    pub fn list_scenes(&mut self) -> Result<SceneList, ListError> {
        let data = self
            .request("GetSceneList", None)
            .map_err(|failure| match failure {
                RequestFailure::NotConnected => ListError::NotConnected,
                RequestFailure::TimedOut => ListError::Transport(TransportFailure::TimedOut.to_string()),
                RequestFailure::Transport(msg) => ListError::Transport(msg),
                RequestFailure::Malformed(msg) => ListError::Malformed(msg),
                RequestFailure::Status { code, comment } => ListError::Rejected { code, comment },
            })?
            .ok_or_else(|| ListError::Malformed("response has no data".to_string()))?;
        let data: SceneListData =
            serde_json::from_value(data).map_err(|e| ListError::Malformed(e.to_string()))?;
        Ok(SceneList::from(data))
    }

    /// Makes `scene` the program scene.
    pub fn switch_scene(&mut self, scene: &str) -> Result<(), SwitchError> {
        self.request("SetCurrentProgramScene", Some(json!({ "sceneName": scene })))
            .map(|_| ())
            .map_err(|failure| match failure {
                RequestFailure::NotConnected => SwitchError::NotConnected,
                RequestFailure::TimedOut => {
                    SwitchError::Transport(TransportFailure::TimedOut.to_string())
                }
                RequestFailure::Transport(msg) | RequestFailure::Malformed(msg) => {
                    SwitchError::Transport(msg)
                }
                RequestFailure::Status {
                    code: STATUS_RESOURCE_NOT_FOUND,
                    ..
                } => SwitchError::UnknownScene(scene.to_string()),
                RequestFailure::Status { code, comment } => SwitchError::Rejected { code, comment },
            })
    }

    /// Sends a close frame and waits briefly for the server to acknowledge.
    pub fn disconnect(mut self) {
        if !self.connected {
            return;
        }
        if let Err(e) = self.socket.close(None) {
            debug!("Close frame not sent: {}", e);
            return;
        }
        let deadline = Instant::now() + Duration::from_millis(500);
        while Instant::now() < deadline {
            match self.socket.read() {
                Ok(_) => continue,
                Err(tungstenite::Error::Io(e)) if is_timeout(e.kind()) => continue,
                Err(_) => break,
            }
        }
        info!("Disconnected from OBS at {}", self.url);
    }

    fn identify(&mut self, password: &str, deadline: Instant) -> Result<(), ConnectError> {
        let hello = match self.next_message(deadline) {
            Ok(Incoming::Message(msg)) if msg.op == OP_HELLO => {
                serde_json::from_value::<Hello>(msg.d)
                    .map_err(|e| ConnectError::Protocol(format!("bad Hello: {}", e)))?
            }
            Ok(Incoming::Message(msg)) => {
                return Err(ConnectError::Protocol(format!(
                    "expected Hello, got opcode {}",
                    msg.op
                )));
            }
            Ok(Incoming::Closed { reason, .. }) => {
                return Err(ConnectError::Handshake(format!("server closed: {}", reason)));
            }
            Err(TransportFailure::TimedOut) => return Err(ConnectError::Timeout(self.url.clone())),
            Err(e) => return Err(ConnectError::Handshake(e.to_string())),
        };

        if hello.rpc_version < RPC_VERSION {
            return Err(ConnectError::Protocol(format!(
                "server speaks RPC version {}, need {}",
                hello.rpc_version, RPC_VERSION
            )));
        }
        self.server_version = hello.obs_web_socket_version;

        let authentication = match &hello.authentication {
            Some(_) if password.is_empty() => return Err(ConnectError::PasswordRequired),
            Some(challenge) => Some(auth_response(password, &challenge.salt, &challenge.challenge)),
            None => None,
        };

        self.send(
            OP_IDENTIFY,
            Identify {
                rpc_version: RPC_VERSION,
                authentication,
                event_subscriptions: 0,
            },
        )
        .map_err(|e| ConnectError::Handshake(e.to_string()))?;

        match self.next_message(deadline) {
            Ok(Incoming::Message(msg)) if msg.op == OP_IDENTIFIED => {
                let identified: Identified = serde_json::from_value(msg.d)
                    .map_err(|e| ConnectError::Protocol(format!("bad Identified: {}", e)))?;
                info!(
                    "Connected to obs-websocket {} (RPC {})",
                    self.server_version, identified.negotiated_rpc_version
                );
                Ok(())
            }
            Ok(Incoming::Message(msg)) => Err(ConnectError::Protocol(format!(
                "expected Identified, got opcode {}",
                msg.op
            ))),
            Ok(Incoming::Closed {
                code: Some(CLOSE_AUTHENTICATION_FAILED),
                reason,
            }) => Err(ConnectError::AuthFailed(if reason.is_empty() {
                "wrong password".to_string()
            } else {
                reason
            })),
            Ok(Incoming::Closed { code, reason }) => Err(ConnectError::Handshake(format!(
                "server closed ({:?}): {}",
                code, reason
            ))),
            Err(TransportFailure::TimedOut) => Err(ConnectError::Timeout(self.url.clone())),
            Err(e) => Err(ConnectError::Handshake(e.to_string())),
        }
    }

    fn request(
        &mut self,
        request_type: &str,
        data: Option<Value>,
    ) -> Result<Option<Value>, RequestFailure> {
        if !self.connected {
            return Err(RequestFailure::NotConnected);
        }
        self.next_request_id += 1;
        let id = self.next_request_id.to_string();
        let result = self.exchange(request_type, &id, data);
        if let Err(RequestFailure::Transport(msg)) = &result {
            warn!("OBS connection lost: {}", msg);
            self.connected = false;
        }
        result
    }

    fn exchange(
        &mut self,
        request_type: &str,
        id: &str,
        data: Option<Value>,
    ) -> Result<Option<Value>, RequestFailure> {
        self.send(
            OP_REQUEST,
            Request {
                request_type,
                request_id: id,
                request_data: data,
            },
        )
        .map_err(|e| RequestFailure::Transport(e.to_string()))?;

        let deadline = Instant::now() + self.request_timeout;
        loop {
            let msg = match self.next_message(deadline) {
                Ok(Incoming::Message(msg)) => msg,
                Ok(Incoming::Closed { reason, .. }) => {
                    return Err(RequestFailure::Transport(format!("connection closed: {}", reason)));
                }
                Err(TransportFailure::TimedOut) => return Err(RequestFailure::TimedOut),
                Err(TransportFailure::Malformed(msg)) => return Err(RequestFailure::Malformed(msg)),
                Err(e) => return Err(RequestFailure::Transport(e.to_string())),
            };
            match msg.op {
                OP_REQUEST_RESPONSE => {
                    let response: RequestResponse = serde_json::from_value(msg.d)
                        .map_err(|e| RequestFailure::Malformed(e.to_string()))?;
                    if response.request_id != id {
                        debug!("Dropping stale response {}", response.request_id);
                        continue;
                    }
                    if !response.request_status.result {
                        return Err(RequestFailure::Status {
                            code: response.request_status.code,
                            comment: response.request_status.comment.unwrap_or_default(),
                        });
                    }
                    debug!("{} ok", response.request_type);
                    return Ok(response.response_data);
                }
                OP_EVENT => continue,
                op => debug!("Ignoring opcode {}", op),
            }
        }
    }

    fn send<T: Serialize>(&mut self, op: u8, d: T) -> Result<(), TransportFailure> {
        let text = serde_json::to_string(&Outgoing { op, d })
            .map_err(|e| TransportFailure::Malformed(e.to_string()))?;
        self.socket
            .send(Message::Text(text))
            .map_err(|e| TransportFailure::Io(e.to_string()))
    }

    fn next_message(&mut self, deadline: Instant) -> Result<Incoming, TransportFailure> {
        loop {
            if Instant::now() >= deadline {
                return Err(TransportFailure::TimedOut);
            }
            match self.socket.read() {
                Ok(Message::Text(text)) => {
                    return serde_json::from_str::<RawMessage>(&text)
                        .map(Incoming::Message)
                        .map_err(|e| TransportFailure::Malformed(e.to_string()));
                }
                Ok(Message::Close(frame)) => {
                    self.connected = false;
                    let (code, reason) = match frame {
                        Some(frame) => (Some(u16::from(frame.code)), frame.reason.to_string()),
                        None => (None, String::new()),
                    };
                    return Ok(Incoming::Closed { code, reason });
                }
                Ok(_) => continue,
                Err(tungstenite::Error::Io(e)) if is_timeout(e.kind()) => continue,
                Err(tungstenite::Error::ConnectionClosed | tungstenite::Error::AlreadyClosed) => {
                    self.connected = false;
                    return Ok(Incoming::Closed {
                        code: None,
                        reason: "connection closed".to_string(),
                    });
                }
                Err(e) => {
                    self.connected = false;
                    return Err(TransportFailure::Io(e.to_string()));
                }
            }
        }
    }
}

impl SceneSink for ObsClient {
    fn switch_to(&mut self, scene: &str) -> Result<(), SwitchError> {
        self.switch_scene(scene)
    }
}

fn is_timeout(kind: ErrorKind) -> bool {
    matches!(kind, ErrorKind::WouldBlock | ErrorKind::TimedOut)
}

/// Resolves the URL's host and connects with a timeout per address.
fn open_tcp(url: &str, timeout: Duration) -> Result<TcpStream, ConnectError> {
    let uri: Uri = url
        .parse()
        .map_err(|e| ConnectError::InvalidEndpoint(format!("{}: {}", url, e)))?;
    match uri.scheme_str() {
        Some("ws") => {}
        Some("wss") => {
            return Err(ConnectError::InvalidEndpoint(
                "wss:// endpoints are not supported, use ws://".to_string(),
            ));
        }
        _ => return Err(ConnectError::InvalidEndpoint(format!("{} is not a ws:// URL", url))),
    }
    let host = uri
        .host()
        .ok_or_else(|| ConnectError::InvalidEndpoint(format!("{} has no host", url)))?
        .trim_start_matches('[')
        .trim_end_matches(']');
    let port = uri.port_u16().unwrap_or(80);

    let addrs = (host, port)
        .to_socket_addrs()
        .map_err(|source| ConnectError::Unreachable {
            url: url.to_string(),
            source,
        })?;

    let mut last_error = None;
    for addr in addrs {
        match TcpStream::connect_timeout(&addr, timeout) {
            Ok(stream) => return Ok(stream),
            Err(e) if is_timeout(e.kind()) => return Err(ConnectError::Timeout(url.to_string())),
            Err(e) => {
                debug!("Connect to {} failed: {}", addr, e);
                last_error = Some(e);
            }
        }
    }
    Err(ConnectError::Unreachable {
        url: url.to_string(),
        source: last_error
            .unwrap_or_else(|| std::io::Error::new(ErrorKind::NotFound, "no address resolved")),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::TcpListener;
    use std::thread::{self, JoinHandle};
    use tungstenite::protocol::CloseFrame;
    use tungstenite::protocol::frame::coding::CloseCode;

    const SALT: &str = "lM1GncleQOaCu9lT1yeUZhFYnqhsLLP1G5lAGo3ixaI=";
    const CHALLENGE: &str = "+IxH4CnCiqpX1rM9scsNynZzbOe4KhDeYcTNS3PDaeY=";

    fn settings(port: u16, password: &str) -> ObsSettings {
        ObsSettings {
            host: "127.0.0.1".to_string(),
            port: port as u32,
            password: password.to_string(),
            connect_timeout_ms: 2000,
        }
    }

    /// Runs a one-connection websocket server on an ephemeral port.
    fn spawn_server<F>(handler: F) -> (u16, JoinHandle<()>)
    where
        F: FnOnce(WebSocket<TcpStream>) + Send + 'static,
    {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let handle = thread::spawn(move || {
            let (stream, _) = listener.accept().unwrap();
            let ws = tungstenite::accept(stream).unwrap();
            handler(ws);
        });
        (port, handle)
    }

    fn read_json(ws: &mut WebSocket<TcpStream>) -> Option<Value> {
        loop {
            match ws.read() {
                Ok(Message::Text(text)) => return serde_json::from_str(&text).ok(),
                Ok(Message::Close(_)) | Err(_) => return None,
                Ok(_) => continue,
            }
        }
    }

    fn send_json(ws: &mut WebSocket<TcpStream>, value: Value) {
        ws.send(Message::Text(value.to_string())).unwrap();
    }

    fn hello(ws: &mut WebSocket<TcpStream>, with_auth: bool) {
        let mut d = json!({"obsWebSocketVersion": "5.4.2", "rpcVersion": 1});
        if with_auth {
            d["authentication"] = json!({"challenge": CHALLENGE, "salt": SALT});
        }
        send_json(ws, json!({"op": 0, "d": d}));
    }

    fn drain(mut ws: WebSocket<TcpStream>) {
        while ws.read().is_ok() {}
    }

    #[test]
    fn test_endpoint_url() {
        assert_eq!(endpoint_url("127.0.0.1", 4455).unwrap(), "ws://127.0.0.1:4455");
        assert_eq!(
            endpoint_url("wss://obs.example:443/ws", 1).unwrap(),
            "wss://obs.example:443/ws"
        );
        assert_eq!(endpoint_url("::1", 4455).unwrap(), "ws://[::1]:4455");
        assert!(endpoint_url("  ", 4455).is_err());
        assert!(endpoint_url("localhost", 0).is_err());
        assert!(endpoint_url("localhost", 65536).is_err());
    }

    #[test]
    fn test_authenticated_session() {
        let (port, server) = spawn_server(|mut ws| {
            hello(&mut ws, true);
            let identify = read_json(&mut ws).unwrap();
            assert_eq!(identify["op"], 1);
            assert_eq!(
                identify["d"]["authentication"],
                "1Ct943GAT+6YQUUX47Ia/ncufilbe6+oD6lY+5kaCu4="
            );
            send_json(&mut ws, json!({"op": 2, "d": {"negotiatedRpcVersion": 1}}));

            let list = read_json(&mut ws).unwrap();
            assert_eq!(list["d"]["requestType"], "GetSceneList");
            let id = list["d"]["requestId"].clone();
            // An unrelated event arrives before the response
            send_json(&mut ws, json!({"op": 5, "d": {"eventType": "ExitStarted"}}));
            send_json(
                &mut ws,
                json!({"op": 7, "d": {
                    "requestType": "GetSceneList",
                    "requestId": id,
                    "requestStatus": {"result": true, "code": 100},
                    "responseData": {
                        "currentProgramSceneName": "Live",
                        "scenes": [{"sceneName": "Map"}, {"sceneName": "Live"}]
                    }
                }}),
            );

            let switch = read_json(&mut ws).unwrap();
            assert_eq!(switch["d"]["requestData"]["sceneName"], "Map");
            send_json(
                &mut ws,
                json!({"op": 7, "d": {
                    "requestType": "SetCurrentProgramScene",
                    "requestId": switch["d"]["requestId"].clone(),
                    "requestStatus": {"result": true, "code": 100}
                }}),
            );

            let missing = read_json(&mut ws).unwrap();
            send_json(
                &mut ws,
                json!({"op": 7, "d": {
                    "requestType": "SetCurrentProgramScene",
                    "requestId": missing["d"]["requestId"].clone(),
                    "requestStatus": {"result": false, "code": 600, "comment": "No source was found"}
                }}),
            );
            drain(ws);
        });

        let mut client = ObsClient::connect(&settings(port, "supersecretpassword")).unwrap();
        assert_eq!(client.server_version(), "5.4.2");

        let list = client.list_scenes().unwrap();
        assert_eq!(list.scenes, vec!["Map", "Live"]);
        assert_eq!(list.current.as_deref(), Some("Live"));

        client.switch_scene("Map").unwrap();
        assert!(matches!(
            client.switch_scene("Nope"),
            Err(SwitchError::UnknownScene(name)) if name == "Nope"
        ));
        assert!(client.is_connected());
        client.disconnect();
        server.join().unwrap();
    }

    #[test]
    fn test_scene_name_is_sent_verbatim() {
        let (port, server) = spawn_server(|mut ws| {
            hello(&mut ws, false);
            let identify = read_json(&mut ws).unwrap();
            assert!(identify["d"].get("authentication").is_none());
            send_json(&mut ws, json!({"op": 2, "d": {"negotiatedRpcVersion": 1}}));

            let switch = read_json(&mut ws).unwrap();
            assert_eq!(switch["d"]["requestData"]["sceneName"], " Map ");
            send_json(
                &mut ws,
                json!({"op": 7, "d": {
                    "requestType": "SetCurrentProgramScene",
                    "requestId": switch["d"]["requestId"].clone(),
                    "requestStatus": {"result": true, "code": 100}
                }}),
            );
            drain(ws);
        });

        let mut client = ObsClient::connect(&settings(port, "")).unwrap();
        client.switch_scene(" Map ").unwrap();
        client.disconnect();
        server.join().unwrap();
    }

    #[test]
    fn test_wrong_password_is_auth_failure() {
        let (port, server) = spawn_server(|mut ws| {
            hello(&mut ws, true);
            let _identify = read_json(&mut ws);
            let _ = ws.close(Some(CloseFrame {
                code: CloseCode::from(CLOSE_AUTHENTICATION_FAILED),
                reason: "Authentication failed.".into(),
            }));
            drain(ws);
        });

        let err = ObsClient::connect(&settings(port, "wrong")).unwrap_err();
        assert!(matches!(err, ConnectError::AuthFailed(_)), "{err:?}");
        server.join().unwrap();
    }

    #[test]
    fn test_missing_password_is_reported() {
        let (port, server) = spawn_server(|mut ws| {
            hello(&mut ws, true);
            drain(ws);
        });

        let err = ObsClient::connect(&settings(port, "")).unwrap_err();
        assert!(matches!(err, ConnectError::PasswordRequired));
        server.join().unwrap();
    }

    #[test]
    fn test_closed_port_is_unreachable() {
        let port = {
            let listener = TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap().port()
        };
        let err = ObsClient::connect(&settings(port, "")).unwrap_err();
        assert!(matches!(err, ConnectError::Unreachable { .. }), "{err:?}");
    }

    #[test]
    fn test_wss_is_rejected() {
        let mut s = settings(4455, "");
        s.host = "wss://127.0.0.1:4455".to_string();
        assert!(matches!(
            ObsClient::connect(&s),
            Err(ConnectError::InvalidEndpoint(_))
        ));
    }
}
