//! Per-peer connection state.
//!
//! A `Connection` holds everything the manager tracks for one remote
//! session: identity, known endpoints, key material, flow bookkeeping
//! and timers. State transitions are driven by the manager; this type
//! only stores them.

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

use crate::crypto::{self, CryptoError, KeyExchange};
use crate::message::Message;

/// Latency sentinel for connections that have not been measured yet.
/// Large enough to sort unmeasured members last.
pub const LATENCY_UNKNOWN: u32 = 999_999;

/// Connection lifecycle state.
///
/// `Closing` is the terminal marker; a closing connection is treated
/// the same as an absent one by the dispatch path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    Handshake,
    Connecting,
    Connected,
    Accepted,
    Failed,
    Rejected,
    Closing,
}

/// The single retained unacknowledged response.
#[derive(Debug, Clone)]
pub struct PendingMessage {
    pub flow: u8,
    pub stage: u8,
    pub echo_time: u16,
    pub message: Message,
}

/// One remote peer session.
pub struct Connection {
    id: u32,
    /// Id the initiator chose for itself; used to encode outbound packets.
    initiator_id: u32,
    state: ConnState,
    peer_id: Option<[u8; 32]>,
    cookie: Option<Vec<u8>>,
    endpoints: Vec<SocketAddr>,
    endpoint_cursors: BTreeMap<Vec<u8>, usize>,
    key_exchange: Box<dyn KeyExchange>,
    shared_secret: Option<Vec<u8>>,
    certificate: Option<Vec<u8>>,
    decrypt_key: Option<[u8; 16]>,
    encrypt_key: Option<[u8; 16]>,
    latency: u32,
    last_message: Option<PendingMessage>,
    touched: Instant,
    keepalives: u32,
    waiting: bool,
    authenticated: bool,
    /// flow id -> joined group id
    groups: BTreeMap<u8, Vec<u8>>,
    pending_open: Option<(Message, u16)>,
}

impl Connection {
    pub fn new(id: u32, key_exchange: Box<dyn KeyExchange>) -> Self {
        Connection {
            id,
            initiator_id: 0,
            state: ConnState::Handshake,
            peer_id: None,
            cookie: None,
            endpoints: Vec::new(),
            endpoint_cursors: BTreeMap::new(),
            key_exchange,
            shared_secret: None,
            certificate: None,
            decrypt_key: None,
            encrypt_key: None,
            latency: LATENCY_UNKNOWN,
            last_message: None,
            touched: Instant::now(),
            keepalives: 0,
            waiting: false,
            authenticated: false,
            groups: BTreeMap::new(),
            pending_open: None,
        }
    }

    /// Server-assigned id, unique for the manager's lifetime.
    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn initiator_id(&self) -> u32 {
        self.initiator_id
    }

    pub fn set_initiator_id(&mut self, id: u32) {
        self.initiator_id = id;
    }

    pub fn state(&self) -> ConnState {
        self.state
    }

    pub fn set_state(&mut self, state: ConnState) {
        self.state = state;
    }

    pub fn peer_id(&self) -> Option<[u8; 32]> {
        self.peer_id
    }

    pub fn set_peer_id(&mut self, peer_id: [u8; 32]) {
        self.peer_id = Some(peer_id);
    }

    pub fn cookie(&self) -> Option<&[u8]> {
        self.cookie.as_deref()
    }

    pub fn set_cookie(&mut self, cookie: Vec<u8>) {
        self.cookie = Some(cookie);
    }

    pub fn take_cookie(&mut self) -> Option<Vec<u8>> {
        self.cookie.take()
    }

    /// Known endpoints; the first entry is the public one.
    pub fn endpoints(&self) -> &[SocketAddr] {
        &self.endpoints
    }

    pub fn primary_endpoint(&self) -> Option<SocketAddr> {
        self.endpoints.first().copied()
    }

    pub fn set_endpoints(&mut self, endpoints: Vec<SocketAddr>) {
        self.endpoints = endpoints;
        self.endpoint_cursors.clear();
    }

    pub fn push_endpoint(&mut self, endpoint: SocketAddr) {
        self.endpoints.push(endpoint);
    }

    /// Round-robin over the endpoint list, one cursor per rendezvous tag.
    pub fn next_endpoint(&mut self, tag: &[u8]) -> Option<SocketAddr> {
        if self.endpoints.is_empty() {
            return None;
        }
        let cursor = self.endpoint_cursors.entry(tag.to_vec()).or_insert(0);
        *cursor = if *cursor >= self.endpoints.len() { 1 } else { *cursor + 1 };
        self.endpoints.get(*cursor - 1).copied()
    }

    /// The connection certificate, generated on first use.
    pub fn certificate(&mut self) -> &[u8] {
        self.certificate.get_or_insert_with(crypto::make_certificate)
    }

    /// The local public key, generating the key pair on first use.
    pub fn public_key(&mut self) -> Vec<u8> {
        self.key_exchange.public_key()
    }

    /// Compute and retain the shared secret for the peer's public key.
    pub fn compute_shared_secret(&mut self, peer_public: &[u8]) -> Result<(), CryptoError> {
        let secret = self.key_exchange.shared_secret(peer_public)?;
        self.shared_secret = Some(secret);
        Ok(())
    }

    /// Derive the session keys once the shared secret is in place.
    pub fn derive_keys(
        &mut self,
        initiator_nonce: &[u8],
        responder_nonce: &[u8],
    ) -> Result<(), CryptoError> {
        let secret = self.shared_secret.as_deref().ok_or(CryptoError::InvalidKeyLength)?;
        let (decrypt_key, encrypt_key) =
            crypto::derive_session_keys(secret, initiator_nonce, responder_nonce);
        self.decrypt_key = Some(decrypt_key);
        self.encrypt_key = Some(encrypt_key);
        Ok(())
    }

    pub fn decrypt_key(&self) -> Option<&[u8; 16]> {
        self.decrypt_key.as_ref()
    }

    pub fn encrypt_key(&self) -> Option<&[u8; 16]> {
        self.encrypt_key.as_ref()
    }

    /// Measured round-trip latency in ticks, `LATENCY_UNKNOWN` until seen.
    pub fn latency(&self) -> u32 {
        self.latency
    }

    pub fn set_latency(&mut self, latency: u32) {
        self.latency = latency;
    }

    /// Note traffic: resets the idle clock and the keepalive counter.
    pub fn touch(&mut self) {
        self.touched = Instant::now();
        self.keepalives = 0;
    }

    /// Time since the last observed traffic.
    pub fn idle(&self) -> Duration {
        self.touched.elapsed()
    }

    /// Count a server keepalive towards the escalation cap.
    pub fn keepalive(&mut self) -> u32 {
        self.keepalives += 1;
        self.keepalives
    }

    pub fn keepalives(&self) -> u32 {
        self.keepalives
    }

    pub fn last_message(&self) -> Option<&PendingMessage> {
        self.last_message.as_ref()
    }

    /// Retain a response that requires acknowledgment. A newer entry
    /// overwrites the slot; there is no queue.
    pub fn set_last_message(&mut self, pending: PendingMessage) {
        self.last_message = Some(pending);
    }

    /// Clear the retained response if the ack matches its flow and stage.
    /// Returns whether the slot was cleared.
    pub fn clear_acked(&mut self, flow: u8, stage: u8) -> bool {
        match &self.last_message {
            Some(pending) if pending.flow == flow && pending.stage == stage => {
                self.last_message = None;
                true
            }
            _ => false,
        }
    }

    pub fn waiting(&self) -> bool {
        self.waiting
    }

    pub fn set_waiting(&mut self, waiting: bool) {
        self.waiting = waiting;
    }

    pub fn authenticated(&self) -> bool {
        self.authenticated
    }

    pub fn set_authenticated(&mut self, authenticated: bool) {
        self.authenticated = authenticated;
    }

    /// Track a joined group under its flow id.
    pub fn join(&mut self, flow: u8, group_id: Vec<u8>) {
        self.groups.insert(flow, group_id);
    }

    /// Forget the group tracked under `flow`, returning its id.
    pub fn leave(&mut self, flow: u8) -> Option<Vec<u8>> {
        self.groups.remove(&flow)
    }

    /// Ids of every group this connection is a member of.
    pub fn group_ids(&self) -> Vec<Vec<u8>> {
        self.groups.values().cloned().collect()
    }

    pub fn set_pending_open(&mut self, message: Message, echo_time: u16) {
        self.pending_open = Some((message, echo_time));
    }

    pub fn take_pending_open(&mut self) -> Option<(Message, u16)> {
        self.pending_open.take()
    }
}
