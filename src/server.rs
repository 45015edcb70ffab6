//! Connection manager: UDP dispatch, periodic sweep, rendezvous and the
//! application-facing event surface.
//!
//! A single manager task owns every piece of mutable protocol state
//! (connection table, cookie registry, endpoint and peer indices,
//! groups) and multiplexes three inputs with `tokio::select!`: inbound
//! datagrams, the sweep timer, and the control channel that carries
//! application decisions and command results back into the serialized
//! send path.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::net::UdpSocket;
use tokio::sync::mpsc;

use crate::amf::Amf0Value;
use crate::connection::{ConnState, Connection, PendingMessage, LATENCY_UNKNOWN};
use crate::crypto::{
    self, CbcPacketCipher, CryptoError, EcdhKeyExchange, PacketCipher, HANDSHAKE_KEY,
    SERVER_SIGNATURE,
};
use crate::group::GroupRegistry;
use crate::message::{self, FlowHeader, Message, PeerEndpoint};
use crate::packet::{self, Packet, CHECKSUM_OFFSET, CIPHER_BLOCK_SIZE, MIN_PACKET_SIZE};
use crate::DEFAULT_RTMFP_PORT;

const SUCCESS_CODE: &str = "NetConnection.Connect.Success";
const REJECTED_CODE: &str = "NetConnection.Connect.Rejected";

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerSettings {
    pub port: u16,
    pub address: String,
    /// Sweep period.
    pub manage_interval: Duration,
    /// Idle time after which a connection is closed.
    pub connection_timeout: Duration,
    /// Lifetime of an unconsumed handshake cookie.
    pub handshake_timeout: Duration,
    /// Idle time after which an empty group is discarded.
    pub group_timeout: Duration,
    /// Idle time before the server starts sending keepalives.
    pub keepalive_interval: Duration,
    /// Keepalives sent without a reply before giving up.
    pub max_keepalives: u32,
    /// Keepalive intervals advertised to the client, milliseconds.
    pub server_keepalive_ms: u32,
    pub client_keepalive_ms: u32,
    /// Require an explicit accept before completing a session.
    pub auth: bool,
}

impl Default for ServerSettings {
    fn default() -> Self {
        ServerSettings {
            port: DEFAULT_RTMFP_PORT,
            address: "0.0.0.0".to_string(),
            manage_interval: Duration::from_secs(60),
            connection_timeout: Duration::from_secs(120),
            handshake_timeout: Duration::from_secs(10),
            group_timeout: Duration::from_secs(360),
            keepalive_interval: Duration::from_secs(60),
            max_keepalives: 3,
            server_keepalive_ms: 60_000,
            client_keepalive_ms: 60_000,
            auth: false,
        }
    }
}

/// Server error
#[derive(Debug)]
pub enum ServerError {
    BindError(std::io::Error),
}

impl fmt::Display for ServerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ServerError::BindError(e) => write!(f, "Failed to bind UDP port: {}", e),
        }
    }
}

impl std::error::Error for ServerError {}

/// Outcome of the application's connect callback.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectDecision {
    /// Complete the session open.
    Accept,
    /// Refuse with a description echoed to the peer.
    Reject(String),
    /// Signal "connect failed, retry" to the peer.
    Fail,
    /// Suspend message handling until a `ServerHandle` decision arrives.
    Wait,
}

/// Application callbacks for session lifecycle events.
///
/// Invoked from the manager task; implementations must not block.
pub trait SessionHandler: Send {
    fn on_start(&mut self) {}
    fn on_stop(&mut self) {}
    /// A handshake request arrived. Return false to ignore it.
    fn on_handshake(&mut self, _url: &str, _from: SocketAddr) -> bool {
        true
    }
    /// A session open request arrived with its command arguments.
    fn on_connect(&mut self, _connection: &mut Connection, _params: &[Amf0Value]) -> ConnectDecision {
        ConnectDecision::Accept
    }
    /// The peer completed its address exchange.
    fn on_address(&mut self, _connection: &mut Connection) {}
    fn on_disconnect(&mut self, _connection: &Connection) {}
}

/// Handler that accepts everything and ignores every event.
pub struct DefaultHandler;

impl SessionHandler for DefaultHandler {}

/// A registered command callback: connection id and arguments in,
/// result value or error description out. Runs on a spawned task.
pub type CommandHandler =
    Arc<dyn Fn(u32, Vec<Amf0Value>) -> Result<Amf0Value, String> + Send + Sync>;

enum Control {
    Accept { connection: u32, description: Option<String> },
    Reject { connection: u32, description: String },
    Fail { connection: u32 },
    Close { connection: u32 },
    CommandCompleted {
        connection: u32,
        header: FlowHeader,
        handle: f64,
        echo_time: u16,
        result: Result<Amf0Value, String>,
    },
    Stop,
}

/// Clonable handle for resolving waiting connections and stopping the
/// server from outside the manager task.
#[derive(Clone)]
pub struct ServerHandle {
    tx: mpsc::UnboundedSender<Control>,
}

impl ServerHandle {
    pub fn accept(&self, connection: u32, description: Option<String>) {
        let _ = self.tx.send(Control::Accept { connection, description });
    }

    pub fn reject(&self, connection: u32, description: impl Into<String>) {
        let _ = self.tx.send(Control::Reject { connection, description: description.into() });
    }

    pub fn fail(&self, connection: u32) {
        let _ = self.tx.send(Control::Fail { connection });
    }

    pub fn close(&self, connection: u32) {
        let _ = self.tx.send(Control::Close { connection });
    }

    pub fn stop(&self) {
        let _ = self.tx.send(Control::Stop);
    }
}

/// The RTMFP server.
pub struct RtmfpServer {
    settings: ServerSettings,
    handler: Box<dyn SessionHandler>,
    commands: HashMap<String, CommandHandler>,
    cipher: Arc<dyn PacketCipher>,
    control_tx: mpsc::UnboundedSender<Control>,
    control_rx: mpsc::UnboundedReceiver<Control>,
}

impl RtmfpServer {
    pub fn new(settings: ServerSettings) -> Self {
        let (control_tx, control_rx) = mpsc::unbounded_channel();
        RtmfpServer {
            settings,
            handler: Box::new(DefaultHandler),
            commands: HashMap::new(),
            cipher: Arc::new(CbcPacketCipher),
            control_tx,
            control_rx,
        }
    }

    /// Install the application's session handler.
    pub fn with_handler(mut self, handler: impl SessionHandler + 'static) -> Self {
        self.handler = Box::new(handler);
        self
    }

    /// Register a named command callable by clients.
    pub fn command(
        mut self,
        name: impl Into<String>,
        handler: impl Fn(u32, Vec<Amf0Value>) -> Result<Amf0Value, String> + Send + Sync + 'static,
    ) -> Self {
        self.commands.insert(name.into(), Arc::new(handler));
        self
    }

    /// A handle usable from other tasks while the server runs.
    pub fn handle(&self) -> ServerHandle {
        ServerHandle { tx: self.control_tx.clone() }
    }

    /// Bind the socket without starting the dispatch loop.
    ///
    /// Useful when the caller needs the bound address (for example with
    /// port 0) before the server starts serving.
    pub async fn bind(self) -> Result<BoundServer, ServerError> {
        let addr = format!("{}:{}", self.settings.address, self.settings.port);
        let socket = UdpSocket::bind(&addr).await.map_err(ServerError::BindError)?;
        log::info!("RTMFP server listening on {}", addr);
        Ok(BoundServer { server: self, socket: Arc::new(socket) })
    }

    /// Bind the socket and run until stopped.
    pub async fn run(self) -> Result<(), ServerError> {
        self.bind().await?.run().await
    }
}

/// A server with its socket bound but not yet serving.
pub struct BoundServer {
    server: RtmfpServer,
    socket: Arc<UdpSocket>,
}

impl BoundServer {
    /// The address the socket is actually bound to.
    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    /// Run the dispatch loop until stopped.
    pub async fn run(self) -> Result<(), ServerError> {
        let BoundServer { server, socket } = self;
        let RtmfpServer { settings, handler, commands, cipher, control_tx, mut control_rx } = server;

        let mut state = ServerState::new(settings, socket.clone(), cipher, handler, commands, control_tx);

        state.handler.on_start();

        let period = state.settings.manage_interval;
        let mut sweep = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
        let mut buf = vec![0u8; 2048];

        loop {
            tokio::select! {
                received = socket.recv_from(&mut buf) => {
                    match received {
                        Ok((len, from)) => state.handle_datagram(&buf[..len], from),
                        Err(e) => log::error!("Socket receive error: {}", e),
                    }
                }
                _ = sweep.tick() => {
                    state.sweep();
                }
                control = control_rx.recv() => {
                    match control {
                        Some(Control::Stop) | None => break,
                        Some(control) => state.handle_control(control),
                    }
                }
            }
        }

        state.shutdown();
        Ok(())
    }
}

struct CookieEntry {
    connection: u32,
    created: Instant,
}

struct ServerState {
    settings: ServerSettings,
    socket: Arc<UdpSocket>,
    cipher: Arc<dyn PacketCipher>,
    handler: Box<dyn SessionHandler>,
    commands: Arc<HashMap<String, CommandHandler>>,
    control_tx: mpsc::UnboundedSender<Control>,
    connections: BTreeMap<u32, Connection>,
    cookies: BTreeMap<Vec<u8>, CookieEntry>,
    endpoints: BTreeMap<SocketAddr, u32>,
    peers: BTreeMap<[u8; 32], u32>,
    groups: GroupRegistry,
    connection_counter: u32,
}

impl ServerState {
    fn new(
        settings: ServerSettings,
        socket: Arc<UdpSocket>,
        cipher: Arc<dyn PacketCipher>,
        handler: Box<dyn SessionHandler>,
        commands: HashMap<String, CommandHandler>,
        control_tx: mpsc::UnboundedSender<Control>,
    ) -> Self {
        ServerState {
            settings,
            socket,
            cipher,
            handler,
            commands: Arc::new(commands),
            control_tx,
            connections: BTreeMap::new(),
            cookies: BTreeMap::new(),
            endpoints: BTreeMap::new(),
            peers: BTreeMap::new(),
            groups: GroupRegistry::new(),
            connection_counter: 0,
        }
    }

    fn next_connection_id(&mut self) -> u32 {
        self.connection_counter += 1;
        self.connection_counter
    }

    /// Decode, decrypt and dispatch one inbound datagram.
    fn handle_datagram(&mut self, data: &[u8], from: SocketAddr) {
        if data.len() < MIN_PACKET_SIZE || (data.len() - CHECKSUM_OFFSET) % CIPHER_BLOCK_SIZE != 0 {
            log::trace!("Undersized or unaligned datagram from {}", from);
            return;
        }

        let mut pkt = Packet::from_bytes(data.to_vec());
        let id = match packet::decode_connection_id(&mut pkt) {
            Ok(id) => id,
            Err(_) => return,
        };

        let conn_id = if id != 0 {
            let key = match self.connections.get(&id) {
                Some(conn) if conn.state() != ConnState::Closing => match conn.decrypt_key() {
                    Some(key) => *key,
                    None => return,
                },
                _ => return,
            };
            if !crypto::open_packet(self.cipher.as_ref(), &mut pkt, &key) {
                log::warn!("Decryption failed for connection {}", id);
                return;
            }
            if let Some(conn) = self.connections.get_mut(&id) {
                conn.touch();
            }
            Some(id)
        } else {
            if !crypto::open_packet(self.cipher.as_ref(), &mut pkt, &HANDSHAKE_KEY) {
                log::warn!("Handshake decryption failed from {}", from);
                return;
            }
            None
        };

        let frame = match message::read_packet(&mut pkt) {
            Ok(frame) => frame,
            Err(e) => {
                log::warn!("Dropping datagram from {}: {}", from, e);
                return;
            }
        };

        for msg in frame.messages {
            self.handle_message(conn_id, msg, frame.sent_time, frame.latency, from);
        }
    }

    fn handle_message(
        &mut self,
        conn_id: Option<u32>,
        msg: Message,
        sent_time: u16,
        latency: Option<u32>,
        from: SocketAddr,
    ) {
        if let Some(id) = conn_id {
            match self.connections.get_mut(&id) {
                Some(conn) => {
                    if let Some(latency) = latency {
                        if latency > 0 {
                            conn.set_latency(latency);
                        }
                    }
                    if conn.waiting() {
                        log::debug!("Connection {} is waiting, message deferred", id);
                        return;
                    }
                }
                None => return,
            }
        }

        match msg {
            Message::HandshakeRequest { url, tag } => self.on_handshake_request(url, tag, from),
            Message::KeyRequest { initiator_id, cookie, signature, public_key, certificate } => {
                self.on_key_request(initiator_id, cookie, signature, public_key, certificate, from);
            }
            Message::RendezvousRequest { peer_ids, tag } => {
                self.on_rendezvous(peer_ids, tag, sent_time, from);
            }
            Message::SessionOpen { header, prelude, handle, params } => {
                if let Some(id) = conn_id {
                    self.on_session_open(id, header, prelude, handle, params, sent_time, from);
                }
            }
            Message::Addresses { header, endpoints, .. } => {
                if let Some(id) = conn_id {
                    self.on_addresses(id, header, endpoints, sent_time, from);
                }
            }
            Message::Command { header, name, handle, params, .. } => {
                if let Some(id) = conn_id {
                    self.on_command(id, header, name, handle, params, sent_time, from);
                }
            }
            Message::GroupJoin { header, group_id, .. } => {
                if let Some(id) = conn_id {
                    self.on_group_join(id, header, group_id, sent_time, from);
                }
            }
            Message::GroupLeave { header } => {
                if let Some(id) = conn_id {
                    self.on_group_leave(id, header, sent_time, from);
                }
            }
            Message::Ack { flow, stage } => {
                if let Some(conn) = conn_id.and_then(|id| self.connections.get_mut(&id)) {
                    conn.clear_acked(flow, stage);
                }
            }
            Message::Nack { flow, stage } => {
                log::debug!("Negative ack for flow {} stage {}", flow, stage);
            }
            Message::Keepalive => {
                if let Some(id) = conn_id {
                    self.send_to_connection(id, &Message::KeepaliveReply, None, sent_time, Some(from));
                }
            }
            Message::KeepaliveReply => {
                // the connection was already touched on receive
            }
            Message::Close | Message::CloseAck => {
                if let Some(id) = conn_id {
                    self.close_connection(id);
                }
            }
            Message::FlowException { flow } => {
                if let Some(id) = conn_id {
                    let reply = Message::FlowRetry { flow, stage: 1 };
                    self.send_to_connection(id, &reply, None, sent_time, Some(from));
                }
            }
            Message::FlowRetry { .. } => {}
            other => {
                log::debug!("Ignoring unexpected inbound message: {:?}", other);
            }
        }
    }

    fn on_handshake_request(&mut self, url: String, tag: Vec<u8>, from: SocketAddr) {
        log::debug!("Handshake request for {} from {}", url, from);
        if !self.handler.on_handshake(&url, from) {
            return;
        }

        let id = self.next_connection_id();
        let mut conn = Connection::new(id, Box::new(EcdhKeyExchange::new()));
        let cookie = crypto::make_cookie();
        conn.set_cookie(cookie.clone());
        let certificate = conn.certificate().to_vec();

        self.cookies.insert(cookie.clone(), CookieEntry { connection: id, created: Instant::now() });
        self.connections.insert(id, conn);

        let response = Message::HandshakeResponse { tag, cookie, certificate };
        self.send_handshake(&response, from);
    }

    fn on_key_request(
        &mut self,
        initiator_id: u32,
        cookie: Vec<u8>,
        signature: Vec<u8>,
        public_key: Vec<u8>,
        certificate: Vec<u8>,
        from: SocketAddr,
    ) {
        let id = match self.cookies.get(&cookie) {
            Some(entry) => entry.connection,
            None => {
                log::warn!("Handshake cookie not found for key request from {}", from);
                return;
            }
        };
        let conn = match self.connections.get_mut(&id) {
            Some(conn) if conn.state() == ConnState::Handshake => conn,
            _ => return,
        };

        conn.set_initiator_id(initiator_id);

        let mut key_material = signature.clone();
        key_material.extend_from_slice(&public_key);
        conn.set_peer_id(crypto::compute_peer_id(&key_material));

        if conn.endpoints().is_empty() {
            conn.push_endpoint(from);
        }

        let server_public = conn.public_key();
        if let Err(e) = conn.compute_shared_secret(&public_key) {
            log::error!("Key agreement failed for connection {}: {}", id, e);
            return;
        }
        let responder_nonce = crypto::responder_nonce(&server_public);
        if let Err(e) = conn.derive_keys(&certificate, &responder_nonce) {
            log::error!("Key derivation failed for connection {}: {}", id, e);
            return;
        }
        let peer_id = conn.peer_id().unwrap_or([0u8; 32]);
        self.endpoints.insert(from, id);

        log::debug!("Connection {} keyed, peer id {}", id, hex::encode(peer_id));

        let response = Message::KeyResponse {
            connection_id: id,
            signature: SERVER_SIGNATURE.to_vec(),
            public_key: server_public,
        };
        // still handshake traffic: fixed key, initiator-declared id
        match pack_message(self.cipher.as_ref(), &response, None, 0, &HANDSHAKE_KEY, initiator_id) {
            Ok(bytes) => self.send(&bytes, from),
            Err(e) => log::error!("Failed to pack key response: {}", e),
        }
    }

    fn on_session_open(
        &mut self,
        id: u32,
        header: FlowHeader,
        prelude: [u8; 6],
        handle: f64,
        params: Vec<Amf0Value>,
        sent_time: u16,
        from: SocketAddr,
    ) {
        {
            let conn = match self.connections.get_mut(&id) {
                Some(conn) => conn,
                None => return,
            };
            if conn.state() != ConnState::Handshake {
                log::debug!("Ignoring session open for connection {} in {:?}", id, conn.state());
                return;
            }
            conn.set_state(ConnState::Connecting);
            if let Some(cookie) = conn.take_cookie() {
                self.cookies.remove(&cookie);
            }
        }

        let decision = {
            let conn = self.connections.get_mut(&id).expect("connection checked above");
            self.handler.on_connect(conn, &params)
        };

        match decision {
            ConnectDecision::Accept => {
                if let Some(conn) = self.connections.get_mut(&id) {
                    conn.set_authenticated(true);
                }
                self.finish_open(id, header, prelude, handle, sent_time, "Connection succeeded", Some(from));
            }
            ConnectDecision::Wait => {
                if let Some(conn) = self.connections.get_mut(&id) {
                    conn.set_waiting(true);
                    conn.set_pending_open(
                        Message::SessionOpen { header, prelude, handle, params },
                        sent_time,
                    );
                }
            }
            ConnectDecision::Reject(description) => {
                self.reject_open(id, header, prelude, handle, sent_time, &description, Some(from));
            }
            ConnectDecision::Fail => {
                self.fail_open(id, header, sent_time, Some(from));
            }
        }
    }

    /// Send the success acknowledgment and retain it for retransmission.
    fn finish_open(
        &mut self,
        id: u32,
        header: FlowHeader,
        prelude: [u8; 6],
        handle: f64,
        echo_time: u16,
        description: &str,
        fallback: Option<SocketAddr>,
    ) {
        let response = Message::SessionOpenAck {
            header: FlowHeader {
                flag: header.flag,
                flow: header.flow,
                stage: header.stage,
                delta: 0x01,
                signature: header.signature.clone(),
            },
            prelude,
            handle,
            code: SUCCESS_CODE.to_string(),
            description: description.to_string(),
        };
        self.send_to_connection(id, &response, Some((header.flow, header.stage)), echo_time, fallback);
        if let Some(conn) = self.connections.get_mut(&id) {
            conn.set_last_message(PendingMessage {
                flow: header.flow,
                stage: header.stage,
                echo_time,
                message: response,
            });
        }
    }

    fn reject_open(
        &mut self,
        id: u32,
        header: FlowHeader,
        prelude: [u8; 6],
        handle: f64,
        echo_time: u16,
        description: &str,
        fallback: Option<SocketAddr>,
    ) {
        if let Some(conn) = self.connections.get_mut(&id) {
            conn.set_state(ConnState::Rejected);
        }
        let response = Message::SessionOpenAck {
            header: FlowHeader {
                flag: header.flag,
                flow: header.flow,
                stage: header.stage,
                delta: 0x01,
                signature: header.signature.clone(),
            },
            prelude,
            handle,
            code: REJECTED_CODE.to_string(),
            description: description.to_string(),
        };
        self.send_to_connection(id, &response, Some((header.flow, header.stage)), echo_time, fallback);
        self.close_connection(id);
    }

    fn fail_open(&mut self, id: u32, header: FlowHeader, echo_time: u16, fallback: Option<SocketAddr>) {
        if let Some(conn) = self.connections.get_mut(&id) {
            conn.set_state(ConnState::Failed);
        }
        let response = Message::FlowRetry { flow: header.flow, stage: header.stage };
        self.send_to_connection(id, &response, None, echo_time, fallback);
        self.close_connection(id);
    }

    fn on_addresses(
        &mut self,
        id: u32,
        header: FlowHeader,
        extra: Vec<SocketAddr>,
        sent_time: u16,
        from: SocketAddr,
    ) {
        let authenticated = match self.connections.get(&id) {
            Some(conn) => conn.authenticated(),
            None => return,
        };
        if self.settings.auth && !authenticated {
            log::warn!("Closing unauthenticated connection {}", id);
            self.close_connection(id);
            return;
        }

        {
            let conn = match self.connections.get_mut(&id) {
                Some(conn) => conn,
                None => return,
            };

            // rebuild the endpoint list: observed source first
            for endpoint in conn.endpoints().to_vec() {
                if self.endpoints.get(&endpoint) == Some(&id) {
                    self.endpoints.remove(&endpoint);
                }
            }
            let mut endpoints = vec![from];
            endpoints.extend(extra);
            conn.set_endpoints(endpoints.clone());
            for endpoint in endpoints {
                self.endpoints.insert(endpoint, id);
            }

            self.handler.on_address(conn);
        }

        let mut needs_ack_slot = false;
        if let Some(conn) = self.connections.get_mut(&id) {
            if conn.state() == ConnState::Connecting {
                let next = if self.settings.auth { ConnState::Accepted } else { ConnState::Connected };
                conn.set_state(next);
                if let Some(peer_id) = conn.peer_id() {
                    self.peers.insert(peer_id, id);
                }
                needs_ack_slot = true;
            }
        }

        if header.stage == 0x02 {
            let response = Message::AddressesAck {
                header: FlowHeader::response(header.flow, header.stage),
                server_keepalive_ms: self.settings.server_keepalive_ms,
                client_keepalive_ms: self.settings.client_keepalive_ms,
            };
            self.send_to_connection(id, &response, Some((header.flow, header.stage)), sent_time, Some(from));
            if needs_ack_slot {
                if let Some(conn) = self.connections.get_mut(&id) {
                    conn.set_last_message(PendingMessage {
                        flow: header.flow,
                        stage: header.stage,
                        echo_time: sent_time,
                        message: response,
                    });
                }
            }
        } else {
            let ack = Message::Ack { flow: header.flow, stage: header.stage };
            self.send_to_connection(id, &ack, None, sent_time, Some(from));
        }
    }

    fn on_command(
        &mut self,
        id: u32,
        header: FlowHeader,
        name: String,
        handle: f64,
        params: Vec<Amf0Value>,
        sent_time: u16,
        from: SocketAddr,
    ) {
        // acknowledge receipt before the handler runs
        let ack = Message::Ack { flow: header.flow, stage: header.stage };
        self.send_to_connection(id, &ack, None, sent_time, Some(from));

        match self.commands.get(&name) {
            Some(handler) => {
                let handler = handler.clone();
                let tx = self.control_tx.clone();
                let response_header = FlowHeader::response(header.flow, header.stage);
                tokio::spawn(async move {
                    let result = handler(id, params);
                    let _ = tx.send(Control::CommandCompleted {
                        connection: id,
                        header: response_header,
                        handle,
                        echo_time: sent_time,
                        result,
                    });
                });
            }
            None => {
                log::debug!("Command {:?} not registered", name);
                let response = Message::CommandError {
                    header: FlowHeader::response(header.flow, header.stage),
                    handle,
                    description: "Command not found".to_string(),
                };
                self.send_to_connection(id, &response, None, sent_time, Some(from));
            }
        }
    }

    fn on_group_join(
        &mut self,
        id: u32,
        header: FlowHeader,
        group_id: Vec<u8>,
        sent_time: u16,
        from: SocketAddr,
    ) {
        let peer_ids: Vec<[u8; 32]> = {
            let connections = &self.connections;
            let group = self.groups.get_or_create(&group_id);
            let ordered = group.fastest(id, |member| {
                connections.get(&member).map(|c| c.latency()).unwrap_or(LATENCY_UNKNOWN)
            });
            group.add(id);
            ordered
                .into_iter()
                .filter_map(|member| connections.get(&member).and_then(|c| c.peer_id()))
                .collect()
        };

        if let Some(conn) = self.connections.get_mut(&id) {
            conn.join(header.flow, group_id);
        }

        if peer_ids.is_empty() {
            let ack = Message::Ack { flow: header.flow, stage: header.stage };
            self.send_to_connection(id, &ack, None, sent_time, Some(from));
            return;
        }

        let response = Message::GroupPeers {
            header: FlowHeader {
                flag: header.flag,
                flow: header.flow,
                stage: header.stage,
                delta: header.delta,
                signature: header.signature.clone(),
            },
            prelude: [0x00, 0x00],
            peer_ids,
        };
        self.send_to_connection(id, &response, Some((header.flow, header.stage)), sent_time, Some(from));
        if let Some(conn) = self.connections.get_mut(&id) {
            conn.set_last_message(PendingMessage {
                flow: header.flow,
                stage: header.stage,
                echo_time: sent_time,
                message: response,
            });
        }
    }

    fn on_group_leave(&mut self, id: u32, header: FlowHeader, sent_time: u16, from: SocketAddr) {
        if let Some(conn) = self.connections.get_mut(&id) {
            if let Some(group_id) = conn.leave(header.flow) {
                self.groups.remove_member(&group_id, id);
            } else {
                log::debug!("Group leave for unknown flow {} on connection {}", header.flow, id);
            }
        }
        let ack = Message::Ack { flow: header.flow, stage: header.stage };
        self.send_to_connection(id, &ack, None, sent_time, Some(from));
    }

    fn on_rendezvous(
        &mut self,
        peer_ids: Vec<[u8; 32]>,
        tag: Vec<u8>,
        sent_time: u16,
        from: SocketAddr,
    ) {
        for peer_id in peer_ids {
            let target_id = match self.peers.get(&peer_id) {
                Some(&target_id) => target_id,
                None => continue, // unresolvable ids are skipped silently
            };

            // snapshot of the target before any requester mutation
            let (target_endpoints, target_key, target_initiator_id) = match self
                .connections
                .get(&target_id)
            {
                Some(target) if !target.endpoints().is_empty() => (
                    target.endpoints().to_vec(),
                    target.encrypt_key().copied(),
                    target.initiator_id(),
                ),
                _ => continue,
            };

            log::debug!("Rendezvous: peer {} found for {}", hex::encode(peer_id), from);

            let endpoints: Vec<PeerEndpoint> = target_endpoints
                .iter()
                .enumerate()
                .map(|(i, &addr)| PeerEndpoint { addr, public: i == 0 })
                .collect();
            let response = Message::RendezvousResponse { tag: tag.clone(), endpoints };
            self.send_handshake(&response, from);

            // introduce the requester to the target with one candidate
            let target_primary = target_endpoints[0];
            let requester_id = self.endpoints.get(&from).copied();
            let (newcomer_id, candidate) = match requester_id
                .and_then(|rid| self.connections.get_mut(&rid))
            {
                Some(requester) => {
                    let mut candidate = requester.next_endpoint(&tag);
                    if candidate.map(|c| c.ip()) == Some(target_primary.ip()) {
                        // likely behind the same NAT, offer the next one
                        candidate = requester.next_endpoint(&tag);
                    }
                    (requester.peer_id().unwrap_or([0u8; 32]), candidate)
                }
                None => ([0u8; 32], Some(from)),
            };

            let (candidate, target_key) = match (candidate, target_key) {
                (Some(candidate), Some(target_key)) => (candidate, target_key),
                _ => continue,
            };

            let newcomer = Message::RendezvousNewcomer {
                peer_id: newcomer_id,
                endpoint: PeerEndpoint { addr: candidate, public: true },
                tag: tag.clone(),
            };
            match pack_message(
                self.cipher.as_ref(),
                &newcomer,
                None,
                sent_time,
                &target_key,
                target_initiator_id,
            ) {
                Ok(bytes) => self.send(&bytes, target_primary),
                Err(e) => log::error!("Failed to pack newcomer message: {}", e),
            }
        }
    }

    fn handle_control(&mut self, control: Control) {
        match control {
            Control::Accept { connection, description } => {
                let pending = match self.connections.get_mut(&connection) {
                    Some(conn) => {
                        conn.set_waiting(false);
                        conn.set_authenticated(true);
                        conn.take_pending_open()
                    }
                    None => return,
                };
                if let Some((Message::SessionOpen { header, prelude, handle, .. }, echo_time)) = pending
                {
                    let description = description.unwrap_or_else(|| "Connection succeeded".to_string());
                    self.finish_open(connection, header, prelude, handle, echo_time, &description, None);
                }
            }
            Control::Reject { connection, description } => {
                let pending = match self.connections.get_mut(&connection) {
                    Some(conn) => {
                        conn.set_waiting(false);
                        conn.take_pending_open()
                    }
                    None => return,
                };
                match pending {
                    Some((Message::SessionOpen { header, prelude, handle, .. }, echo_time)) => {
                        self.reject_open(connection, header, prelude, handle, echo_time, &description, None);
                    }
                    _ => self.close_connection(connection),
                }
            }
            Control::Fail { connection } => {
                let pending = match self.connections.get_mut(&connection) {
                    Some(conn) => {
                        conn.set_waiting(false);
                        conn.take_pending_open()
                    }
                    None => return,
                };
                match pending {
                    Some((Message::SessionOpen { header, .. }, echo_time)) => {
                        self.fail_open(connection, header, echo_time, None);
                    }
                    _ => self.close_connection(connection),
                }
            }
            Control::Close { connection } => self.close_connection(connection),
            Control::CommandCompleted { connection, header, handle, echo_time, result } => {
                let response = match result {
                    Ok(value) => Message::CommandResult { header, handle, value: Some(value) },
                    Err(description) => Message::CommandError { header, handle, description },
                };
                self.send_to_connection(connection, &response, None, echo_time, None);
            }
            // stop is intercepted by the run loop
            Control::Stop => {}
        }
    }

    /// The periodic maintenance pass: timeouts, keepalives,
    /// retransmission and garbage collection. Failures are isolated per
    /// entry so one bad connection cannot abort the cycle.
    fn sweep(&mut self) {
        let started = Instant::now();
        let ids: Vec<u32> = self.connections.keys().copied().collect();
        let mut closing = Vec::new();

        for id in ids {
            let (keepalive, resend) = match self.connections.get_mut(&id) {
                Some(conn) => {
                    let idle = conn.idle();
                    if idle > self.settings.connection_timeout {
                        closing.push(id);
                        continue;
                    }
                    let keepalive = idle > self.settings.keepalive_interval
                        && conn.keepalives() < self.settings.max_keepalives
                        && conn.encrypt_key().is_some();
                    if keepalive {
                        conn.keepalive();
                    }
                    (keepalive, conn.last_message().cloned())
                }
                None => continue,
            };

            if keepalive {
                self.send_to_connection(id, &Message::Keepalive, None, 0, None);
            }
            if let Some(pending) = resend {
                log::debug!("Resending unacknowledged message for connection {}", id);
                self.send_to_connection(
                    id,
                    &pending.message,
                    Some((pending.flow, pending.stage)),
                    pending.echo_time,
                    None,
                );
            }
        }

        let closed = closing.len();
        for id in closing {
            self.close_connection(id);
        }

        let expired: Vec<Vec<u8>> = self
            .cookies
            .iter()
            .filter(|(_, entry)| entry.created.elapsed() > self.settings.handshake_timeout)
            .map(|(cookie, _)| cookie.clone())
            .collect();
        let stale_cookies = expired.len();
        for cookie in expired {
            if let Some(entry) = self.cookies.remove(&cookie) {
                // discard the connection too if key exchange never completed
                if let Some(conn) = self.connections.get(&entry.connection) {
                    if conn.state() == ConnState::Handshake && conn.decrypt_key().is_none() {
                        self.connections.remove(&entry.connection);
                    }
                }
            }
        }

        let stale_groups = self.groups.sweep(self.settings.group_timeout);

        log::debug!(
            "Sweep: {} connections, {} closed, {} stale cookies, {} stale groups, took {:?}",
            self.connections.len(),
            closed,
            stale_cookies,
            stale_groups,
            started.elapsed(),
        );
    }

    /// Remove a connection from every index and notify the peer.
    /// Closing an already-removed connection is a no-op.
    fn close_connection(&mut self, id: u32) {
        let mut conn = match self.connections.remove(&id) {
            Some(conn) => conn,
            None => return,
        };
        let was_established = conn.state() != ConnState::Handshake;
        conn.set_state(ConnState::Closing);

        for group_id in conn.group_ids() {
            self.groups.remove_member(&group_id, id);
        }
        if let Some(peer_id) = conn.peer_id() {
            if self.peers.get(&peer_id) == Some(&id) {
                self.peers.remove(&peer_id);
            }
        }
        for endpoint in conn.endpoints() {
            if self.endpoints.get(endpoint) == Some(&id) {
                self.endpoints.remove(endpoint);
            }
        }
        if let Some(cookie) = conn.take_cookie() {
            self.cookies.remove(&cookie);
        }

        if was_established {
            self.handler.on_disconnect(&conn);
        }

        if let (Some(key), Some(addr)) = (conn.encrypt_key().copied(), conn.primary_endpoint()) {
            match pack_message(
                self.cipher.as_ref(),
                &Message::Close,
                None,
                0,
                &key,
                conn.initiator_id(),
            ) {
                Ok(bytes) => self.send(&bytes, addr),
                Err(e) => log::error!("Failed to pack close frame: {}", e),
            }
        }
        log::debug!("Connection {} closed", id);
    }

    fn shutdown(&mut self) {
        let ids: Vec<u32> = self.connections.keys().copied().collect();
        for id in ids {
            self.close_connection(id);
        }
        self.handler.on_stop();
        log::info!("RTMFP server stopped");
    }

    /// Encrypt with the connection's session key (or the handshake key
    /// while the handshake is still in progress), encode the
    /// initiator's id and send to the primary endpoint.
    fn send_to_connection(
        &mut self,
        id: u32,
        message: &Message,
        ack: Option<(u8, u8)>,
        echo_time: u16,
        fallback: Option<SocketAddr>,
    ) {
        let (key, initiator_id, target) = match self.connections.get(&id) {
            Some(conn) => {
                let key = if conn.state() == ConnState::Handshake {
                    HANDSHAKE_KEY
                } else {
                    match conn.encrypt_key() {
                        Some(key) => *key,
                        None => return,
                    }
                };
                (key, conn.initiator_id(), conn.primary_endpoint().or(fallback))
            }
            None => return,
        };
        let target = match target {
            Some(target) => target,
            None => return,
        };
        match pack_message(self.cipher.as_ref(), message, ack, echo_time, &key, initiator_id) {
            Ok(bytes) => self.send(&bytes, target),
            Err(e) => log::error!("Failed to pack response for connection {}: {}", id, e),
        }
    }

    /// Send a handshake-phase message: fixed key, connection id zero.
    fn send_handshake(&mut self, message: &Message, to: SocketAddr) {
        match pack_message(self.cipher.as_ref(), message, None, 0, &HANDSHAKE_KEY, 0) {
            Ok(bytes) => self.send(&bytes, to),
            Err(e) => log::error!("Failed to pack handshake response: {}", e),
        }
    }

    fn send(&self, bytes: &[u8], to: SocketAddr) {
        if let Err(e) = self.socket.try_send_to(bytes, to) {
            log::error!("Socket send to {} failed: {}", to, e);
        }
    }
}

/// Serialize, pad, checksum, encrypt and encode one outgoing datagram.
fn pack_message(
    cipher: &dyn PacketCipher,
    message: &Message,
    ack: Option<(u8, u8)>,
    echo_time: u16,
    key: &[u8; 16],
    encode_id: u32,
) -> Result<Vec<u8>, CryptoError> {
    let mut pkt = Packet::new();
    message::write_packet(&mut pkt, message, echo_time);
    if let Some((flow, stage)) = ack {
        message::write_ack(&mut pkt, flow, stage, true);
    }
    crypto::seal_packet(cipher, pkt, key, encode_id)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::{CbcPacketCipher, KeyExchange};

    fn test_settings() -> ServerSettings {
        ServerSettings {
            address: "127.0.0.1".to_string(),
            port: 0,
            ..ServerSettings::default()
        }
    }

    async fn test_state(settings: ServerSettings) -> ServerState {
        let socket = Arc::new(UdpSocket::bind("127.0.0.1:0").await.unwrap());
        let (tx, _rx) = mpsc::unbounded_channel();
        ServerState::new(
            settings,
            socket,
            Arc::new(CbcPacketCipher),
            Box::new(DefaultHandler),
            HashMap::new(),
            tx,
        )
    }

    fn established(state: &mut ServerState, endpoint: SocketAddr) -> u32 {
        let id = state.next_connection_id();
        let mut conn = Connection::new(id, Box::new(EcdhKeyExchange::new()));
        conn.set_initiator_id(id + 100);
        conn.compute_shared_secret(&EcdhKeyExchange::new().public_key()).unwrap();
        conn.derive_keys(b"initiator", b"responder").unwrap();
        conn.push_endpoint(endpoint);
        conn.set_state(ConnState::Connected);
        conn.set_peer_id([id as u8; 32]);
        state.endpoints.insert(endpoint, id);
        state.peers.insert([id as u8; 32], id);
        state.connections.insert(id, conn);
        id
    }

    #[test]
    fn test_pack_then_unpack() {
        let cipher = CbcPacketCipher;
        let key = [9u8; 16];
        let bytes = pack_message(&cipher, &Message::Keepalive, Some((2, 1)), 7, &key, 42).unwrap();
        assert!(bytes.len() >= MIN_PACKET_SIZE);
        assert_eq!((bytes.len() - CHECKSUM_OFFSET) % CIPHER_BLOCK_SIZE, 0);

        let mut pkt = Packet::from_bytes(bytes);
        assert_eq!(packet::decode_connection_id(&mut pkt).unwrap(), 42);
        assert!(crypto::open_packet(&cipher, &mut pkt, &key));
        let frame = message::read_packet(&mut pkt).unwrap();
        assert_eq!(
            frame.messages,
            vec![Message::Keepalive, Message::Ack { flow: 2, stage: 1 }]
        );
    }

    #[test]
    fn test_unpack_rejects_wrong_key() {
        let cipher = CbcPacketCipher;
        let bytes = pack_message(&cipher, &Message::Keepalive, None, 0, &[1u8; 16], 0).unwrap();
        let mut pkt = Packet::from_bytes(bytes);
        packet::decode_connection_id(&mut pkt).unwrap();
        assert!(!crypto::open_packet(&cipher, &mut pkt, &[2u8; 16]));
    }

    #[tokio::test]
    async fn test_handshake_request_registers_cookie() {
        let mut state = test_state(test_settings()).await;
        let from: SocketAddr = "127.0.0.1:5000".parse().unwrap();
        state.handle_message(
            None,
            Message::HandshakeRequest { url: "rtmfp://localhost/app".into(), tag: vec![1u8; 16] },
            0,
            None,
            from,
        );
        assert_eq!(state.connections.len(), 1);
        assert_eq!(state.cookies.len(), 1);
        let entry = state.cookies.values().next().unwrap();
        let conn = state.connections.get(&entry.connection).unwrap();
        assert_eq!(conn.state(), ConnState::Handshake);
        assert!(conn.decrypt_key().is_none());
    }

    #[tokio::test]
    async fn test_session_open_requires_handshake_state() {
        let mut state = test_state(test_settings()).await;
        let from: SocketAddr = "127.0.0.1:5001".parse().unwrap();
        let id = established(&mut state, from);

        let header = FlowHeader { flag: 0, flow: 2, stage: 1, delta: 1, signature: None };
        state.on_session_open(id, header, [0u8; 6], 1.0, vec![], 0, from);
        // already connected: ignored, still Connected, no retained message
        let conn = state.connections.get(&id).unwrap();
        assert_eq!(conn.state(), ConnState::Connected);
        assert!(conn.last_message().is_none());
    }

    #[tokio::test]
    async fn test_ack_clears_matching_slot_only() {
        let mut state = test_state(test_settings()).await;
        let from: SocketAddr = "127.0.0.1:5002".parse().unwrap();
        let id = established(&mut state, from);
        state.connections.get_mut(&id).unwrap().set_last_message(PendingMessage {
            flow: 2,
            stage: 1,
            echo_time: 0,
            message: Message::Keepalive,
        });

        state.handle_message(Some(id), Message::Ack { flow: 2, stage: 9 }, 0, None, from);
        assert!(state.connections.get(&id).unwrap().last_message().is_some());

        state.handle_message(Some(id), Message::Ack { flow: 2, stage: 1 }, 0, None, from);
        assert!(state.connections.get(&id).unwrap().last_message().is_none());
    }

    #[tokio::test]
    async fn test_close_removes_every_index() {
        let mut state = test_state(test_settings()).await;
        let from: SocketAddr = "127.0.0.1:5003".parse().unwrap();
        let id = established(&mut state, from);
        state.groups.get_or_create(b"g").add(id);
        state.connections.get_mut(&id).unwrap().join(3, b"g".to_vec());

        state.close_connection(id);
        assert!(state.connections.is_empty());
        assert!(state.peers.is_empty());
        assert!(state.endpoints.is_empty());
        assert!(state.groups.get(b"g").unwrap().is_empty());

        // closing again is a no-op
        state.close_connection(id);
    }

    #[tokio::test]
    async fn test_sweep_times_out_idle_connections() {
        let mut settings = test_settings();
        settings.connection_timeout = Duration::ZERO;
        let mut state = test_state(settings).await;
        let from: SocketAddr = "127.0.0.1:5004".parse().unwrap();
        let id = established(&mut state, from);

        tokio::time::sleep(Duration::from_millis(5)).await;
        state.sweep();
        assert!(state.connections.get(&id).is_none());
        assert!(state.peers.is_empty());
    }

    #[tokio::test]
    async fn test_sweep_sends_keepalive_up_to_cap() {
        let mut settings = test_settings();
        settings.keepalive_interval = Duration::ZERO;
        settings.max_keepalives = 2;
        let mut state = test_state(settings).await;
        let from: SocketAddr = "127.0.0.1:5005".parse().unwrap();
        let id = established(&mut state, from);

        tokio::time::sleep(Duration::from_millis(5)).await;
        state.sweep();
        state.sweep();
        state.sweep();
        assert_eq!(state.connections.get(&id).unwrap().keepalives(), 2);
    }

    #[tokio::test]
    async fn test_sweep_resends_pending_and_keeps_slot() {
        let mut state = test_state(test_settings()).await;
        let from: SocketAddr = "127.0.0.1:5006".parse().unwrap();
        let id = established(&mut state, from);
        state.connections.get_mut(&id).unwrap().set_last_message(PendingMessage {
            flow: 2,
            stage: 1,
            echo_time: 0,
            message: Message::Keepalive,
        });

        state.sweep();
        // only a matching ack clears the slot
        assert!(state.connections.get(&id).unwrap().last_message().is_some());
    }

    #[tokio::test]
    async fn test_sweep_discards_stale_cookies() {
        let mut settings = test_settings();
        settings.handshake_timeout = Duration::ZERO;
        let mut state = test_state(settings).await;
        let from: SocketAddr = "127.0.0.1:5007".parse().unwrap();
        state.handle_message(
            None,
            Message::HandshakeRequest { url: "rtmfp://x".into(), tag: vec![0u8; 16] },
            0,
            None,
            from,
        );
        assert_eq!(state.cookies.len(), 1);

        tokio::time::sleep(Duration::from_millis(5)).await;
        state.sweep();
        assert!(state.cookies.is_empty());
        // the never-keyed connection went with it
        assert!(state.connections.is_empty());
    }

    #[tokio::test]
    async fn test_waiting_connection_defers_messages() {
        let mut state = test_state(test_settings()).await;
        let from: SocketAddr = "127.0.0.1:5008".parse().unwrap();
        let id = established(&mut state, from);
        state.connections.get_mut(&id).unwrap().set_waiting(true);
        state.connections.get_mut(&id).unwrap().set_last_message(PendingMessage {
            flow: 2,
            stage: 1,
            echo_time: 0,
            message: Message::Keepalive,
        });

        // the ack would normally clear the slot; waiting suppresses it
        state.handle_message(Some(id), Message::Ack { flow: 2, stage: 1 }, 0, None, from);
        assert!(state.connections.get(&id).unwrap().last_message().is_some());
    }

    #[tokio::test]
    async fn test_group_join_returns_fastest_and_tracks_membership() {
        let mut state = test_state(test_settings()).await;
        let a: SocketAddr = "127.0.0.1:5009".parse().unwrap();
        let b: SocketAddr = "127.0.0.1:5010".parse().unwrap();
        let id_a = established(&mut state, a);
        let id_b = established(&mut state, b);
        state.connections.get_mut(&id_a).unwrap().set_latency(50);

        let header = FlowHeader { flag: 0, flow: 3, stage: 1, delta: 1, signature: None };
        state.on_group_join(id_a, header.clone(), b"g".to_vec(), 0, a);
        // first member gets no peer list and no retained message
        assert!(state.connections.get(&id_a).unwrap().last_message().is_none());

        state.on_group_join(id_b, header.clone(), b"g".to_vec(), 0, b);
        assert_eq!(state.groups.get(b"g").unwrap().members(), &[id_a, id_b]);
        let pending = state.connections.get(&id_b).unwrap().last_message().unwrap().clone();
        match pending.message {
            Message::GroupPeers { peer_ids, .. } => assert_eq!(peer_ids, vec![[id_a as u8; 32]]),
            other => panic!("expected GroupPeers, got {other:?}"),
        }

        // leave removes the membership both ways
        state.on_group_leave(id_a, FlowHeader { stage: 2, ..header }, 0, a);
        assert_eq!(state.groups.get(b"g").unwrap().members(), &[id_b]);
        assert!(state.connections.get(&id_a).unwrap().group_ids().is_empty());
    }
}
