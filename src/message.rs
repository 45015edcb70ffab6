//! Message codec.
//!
//! Parses a decrypted datagram into an ordered list of protocol
//! messages and serializes outgoing messages back into a datagram.
//! Every message kind is a variant of the closed `Message` sum type and
//! the codec is bidirectional, so `read` of a `write` reproduces the
//! original value for requests and responses alike.

use std::fmt;
use std::net::SocketAddr;
use std::time::Instant;

use once_cell::sync::Lazy;

use crate::amf::{self, Amf0Value, AmfError};
use crate::crypto::{COOKIE_SIZE, INITIATOR_CERT_SIZE, PEER_ID_SIZE};
use crate::packet::{Packet, PacketError};

/// Marker for handshake-phase frames (no echo time).
pub const MARKER_HANDSHAKE: u8 = 0x0b;
/// Marker for responses that echo the peer's send time.
pub const MARKER_RESPONSE_ECHO: u8 = 0x4e;
/// Marker for responses without an echo time.
pub const MARKER_RESPONSE_PLAIN: u8 = 0x4a;
/// Marker for session frames sent by the initiator.
pub const MARKER_MESSAGE_ECHO: u8 = 0x8d;

const TAG_KEEPALIVE: u8 = 0x01;
const TAG_CLOSE: u8 = 0x0c;
const TAG_NEWCOMER: u8 = 0x0f;
const TAG_FLOW: u8 = 0x10;
const TAG_FLOW_REPEAT: u8 = 0x11;
const TAG_FRAGMENT: u8 = 0x18;
const TAG_HANDSHAKE: u8 = 0x30;
const TAG_KEY_REQUEST: u8 = 0x38;
const TAG_KEEPALIVE_REPLY: u8 = 0x41;
const TAG_CLOSE_ACK: u8 = 0x4c;
const TAG_ACK: u8 = 0x51;
const TAG_FLOW_EXCEPTION: u8 = 0x5e;
const TAG_HANDSHAKE_REPLY: u8 = 0x70;
const TAG_ENDPOINTS: u8 = 0x71;
const TAG_KEY_REPLY: u8 = 0x78;

const HANDSHAKE_SUBTYPE_HELLO: u8 = 0x0a;
const HANDSHAKE_SUBTYPE_RENDEZVOUS: u8 = 0x0f;

const ACK_POSITIVE: u8 = 0x7f;
const SIGNATURE_PREFIX_SIZE: usize = 4;

/// Header flags that signal "connect failed, retry" and end the message.
const FLAG_RETRY_EXTENDED: u8 = 0x83;
const FLAG_RETRY: u8 = 0x03;
/// Header flag announcing a trailing signature field.
const FLAG_EXTENDED: u8 = 0x80;

static EPOCH: Lazy<Instant> = Lazy::new(Instant::now);

/// Quarter-milliseconds since process start, wrapping at 16 bits.
pub fn time_now() -> u16 {
    ((EPOCH.elapsed().as_millis() / 4) & 0xffff) as u16
}

/// Codec error
#[derive(Debug, Clone, PartialEq)]
pub enum CodecError {
    /// A field ran past the end of the datagram
    Truncated,
    /// The frame marker is not in the allow-list
    BadMarker(u8),
    /// A recognized tag this server cannot process
    UnsupportedTag(u8),
    /// A structural constraint was violated
    Malformed(&'static str),
    /// An AMF0 body failed to parse
    Amf(AmfError),
}

impl fmt::Display for CodecError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CodecError::Truncated => write!(f, "message truncated"),
            CodecError::BadMarker(m) => write!(f, "unknown frame marker {m:#04x}"),
            CodecError::UnsupportedTag(t) => write!(f, "unsupported message tag {t:#04x}"),
            CodecError::Malformed(what) => write!(f, "malformed message: {what}"),
            CodecError::Amf(e) => write!(f, "AMF0 body: {e}"),
        }
    }
}

impl std::error::Error for CodecError {}

impl From<PacketError> for CodecError {
    fn from(_: PacketError) -> Self {
        CodecError::Truncated
    }
}

impl From<AmfError> for CodecError {
    fn from(e: AmfError) -> Self {
        CodecError::Amf(e)
    }
}

/// Flow envelope header: sub-channel, per-flow step counter, delta and
/// the optional flow signature.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlowHeader {
    pub flag: u8,
    pub flow: u8,
    pub stage: u8,
    pub delta: u8,
    pub signature: Option<Vec<u8>>,
}

impl FlowHeader {
    /// Header for a plain response on an existing flow.
    pub fn response(flow: u8, stage: u8) -> Self {
        FlowHeader { flag: 0x00, flow, stage, delta: 0x01, signature: None }
    }
}

/// A candidate endpoint with its public/private wire flag.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PeerEndpoint {
    pub addr: SocketAddr,
    pub public: bool,
}

/// One protocol message.
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    /// Handshake request: connection URL + 16-byte correlation tag
    HandshakeRequest { url: String, tag: Vec<u8> },
    /// Handshake response: tag echo, fresh cookie, server certificate
    HandshakeResponse { tag: Vec<u8>, cookie: Vec<u8>, certificate: Vec<u8> },
    /// Rendezvous lookup for one or more peer ids
    RendezvousRequest { peer_ids: Vec<[u8; PEER_ID_SIZE]>, tag: Vec<u8> },
    /// Rendezvous reply to the requester: the target's endpoints
    RendezvousResponse { tag: Vec<u8>, endpoints: Vec<PeerEndpoint> },
    /// Endpoint forward (same wire shape, private endpoints only)
    Forward { tag: Vec<u8>, endpoints: Vec<PeerEndpoint> },
    /// Newcomer notification to the rendezvous target
    RendezvousNewcomer { peer_id: [u8; PEER_ID_SIZE], endpoint: PeerEndpoint, tag: Vec<u8> },
    /// Key exchange request: initiator-chosen id, cookie, key material
    KeyRequest {
        initiator_id: u32,
        cookie: Vec<u8>,
        signature: Vec<u8>,
        public_key: Vec<u8>,
        certificate: Vec<u8>,
    },
    /// Key exchange response: server-assigned id and responder key
    KeyResponse { connection_id: u32, signature: Vec<u8>, public_key: Vec<u8> },
    /// Session open ("connect") command
    SessionOpen { header: FlowHeader, prelude: [u8; 6], handle: f64, params: Vec<Amf0Value> },
    /// Session open acknowledgment with a status object
    SessionOpenAck {
        header: FlowHeader,
        prelude: [u8; 6],
        handle: f64,
        code: String,
        description: String,
    },
    /// Address exchange ("setPeerInfo"): extra candidate endpoints
    Addresses { header: FlowHeader, prelude: [u8; 6], handle: f64, endpoints: Vec<SocketAddr> },
    /// Address exchange acknowledgment advertising keepalive intervals
    AddressesAck { header: FlowHeader, server_keepalive_ms: u32, client_keepalive_ms: u32 },
    /// Free-form command invocation
    Command {
        header: FlowHeader,
        prelude: [u8; 6],
        name: String,
        handle: f64,
        params: Vec<Amf0Value>,
    },
    /// Command result correlated by handle
    CommandResult { header: FlowHeader, handle: f64, value: Option<Amf0Value> },
    /// Command failure correlated by handle
    CommandError { header: FlowHeader, handle: f64, description: String },
    /// Group join (flow > 2, stage 1)
    GroupJoin { header: FlowHeader, prelude: [u8; 2], group_id: Vec<u8> },
    /// Group join reply: latency-ordered member peer ids
    GroupPeers { header: FlowHeader, prelude: [u8; 2], peer_ids: Vec<[u8; PEER_ID_SIZE]> },
    /// Group leave (flow > 2, stage 2)
    GroupLeave { header: FlowHeader },
    /// "Connect failed, retry" signal for a flow
    FlowRetry { flow: u8, stage: u8 },
    /// Positive acknowledgment
    Ack { flow: u8, stage: u8 },
    /// Negative acknowledgment
    Nack { flow: u8, stage: u8 },
    Keepalive,
    KeepaliveReply,
    Close,
    CloseAck,
    /// Flow failure notice carrying the flow id
    FlowException { flow: u8 },
}

impl Message {
    /// The frame marker this message is sent under; the marker decides
    /// whether an echo-time field is present.
    pub fn marker(&self) -> u8 {
        match self {
            Message::HandshakeRequest { .. }
            | Message::HandshakeResponse { .. }
            | Message::RendezvousRequest { .. }
            | Message::RendezvousResponse { .. }
            | Message::Forward { .. }
            | Message::KeyRequest { .. }
            | Message::KeyResponse { .. } => MARKER_HANDSHAKE,
            Message::SessionOpen { .. }
            | Message::Addresses { .. }
            | Message::Command { .. }
            | Message::GroupJoin { .. }
            | Message::GroupLeave { .. }
            | Message::FlowException { .. } => MARKER_MESSAGE_ECHO,
            Message::RendezvousNewcomer { .. }
            | Message::SessionOpenAck { .. }
            | Message::AddressesAck { .. }
            | Message::CommandResult { .. }
            | Message::CommandError { .. }
            | Message::GroupPeers { .. }
            | Message::FlowRetry { .. }
            | Message::Ack { .. }
            | Message::Nack { .. }
            | Message::KeepaliveReply => MARKER_RESPONSE_ECHO,
            Message::Keepalive | Message::Close | Message::CloseAck => MARKER_RESPONSE_PLAIN,
        }
    }
}

/// A parsed datagram: frame times plus the ordered messages.
#[derive(Debug)]
pub struct Frame {
    pub marker: u8,
    pub sent_time: u16,
    pub echo_time: u16,
    /// Round-trip estimate in quarter-millisecond ticks, when the frame
    /// echoed one of our timestamps.
    pub latency: Option<u32>,
    pub messages: Vec<Message>,
}

fn marker_allowed(marker: u8) -> bool {
    matches!(marker, 0x0b | 0x09 | 0x89 | 0x0d | 0x8d | 0x49 | 0x4e | 0x4a)
}

fn marker_has_echo(marker: u8) -> bool {
    (marker | 0xf0) == 0xfd || marker == MARKER_RESPONSE_ECHO
}

fn tag_recognized(tag: u8) -> bool {
    matches!(
        tag,
        TAG_FLOW
            | TAG_FLOW_REPEAT
            | TAG_HANDSHAKE
            | TAG_KEY_REQUEST
            | TAG_ACK
            | TAG_KEEPALIVE
            | TAG_KEEPALIVE_REPLY
            | TAG_CLOSE
            | TAG_CLOSE_ACK
            | TAG_FLOW_EXCEPTION
            | TAG_FRAGMENT
            | TAG_HANDSHAKE_REPLY
            | TAG_ENDPOINTS
            | TAG_KEY_REPLY
            | TAG_NEWCOMER
    )
}

/// Parse a decrypted datagram starting after the 6-byte header.
///
/// Parsing stops silently at the first unrecognized byte or when a
/// declared message length exceeds the remaining buffer (partial
/// frame); structural errors inside a recognized message fail the
/// whole datagram.
pub fn read_packet(pkt: &mut Packet) -> Result<Frame, CodecError> {
    pkt.set_pos(6);
    let marker = pkt.read_u8()?;
    if !marker_allowed(marker) {
        return Err(CodecError::BadMarker(marker));
    }
    let sent_time = pkt.read_u16()?;
    let echo_time = if marker_has_echo(marker) { pkt.read_u16()? } else { 0 };
    let latency =
        if echo_time > 0 { Some(u32::from(time_now().wrapping_sub(echo_time))) } else { None };

    let mut messages: Vec<Message> = Vec::new();
    let mut last_header: Option<FlowHeader> = None;
    let mut last_was_group_peers = false;

    while let Some(tag) = pkt.peek() {
        if !tag_recognized(tag) {
            break;
        }
        pkt.skip(1);
        if pkt.available() < 2 {
            break;
        }
        let size = pkt.read_u16()? as usize;
        if pkt.available() < size {
            // partial frame, drop silently
            break;
        }
        let mut body = Packet::from_bytes(pkt.read_bytes(size)?);

        // group-peer continuations extend the previous message
        if tag == TAG_FLOW_REPEAT && last_was_group_peers {
            if body.read_u16()? != 0x0b {
                return Err(CodecError::Malformed("group peer continuation"));
            }
            let peer_id = read_peer_id(&mut body)?;
            if let Some(Message::GroupPeers { peer_ids, .. }) = messages.last_mut() {
                peer_ids.push(peer_id);
            }
            continue;
        }

        let parsed = read_message(tag, &mut body, &mut last_header)?;
        last_was_group_peers = matches!(parsed, Some(Message::GroupPeers { .. }));
        if let Some(message) = parsed {
            messages.push(message);
        }
    }

    Ok(Frame { marker, sent_time, echo_time, latency, messages })
}

fn read_peer_id(pkt: &mut Packet) -> Result<[u8; PEER_ID_SIZE], CodecError> {
    let raw = pkt.read_bytes(PEER_ID_SIZE)?;
    let mut id = [0u8; PEER_ID_SIZE];
    id.copy_from_slice(&raw);
    Ok(id)
}

fn read_message(
    tag: u8,
    m: &mut Packet,
    last_header: &mut Option<FlowHeader>,
) -> Result<Option<Message>, CodecError> {
    match tag {
        TAG_HANDSHAKE => read_handshake(m).map(Some),
        TAG_KEY_REQUEST => read_key_request(m).map(Some),
        TAG_HANDSHAKE_REPLY => read_handshake_reply(m).map(Some),
        TAG_KEY_REPLY => read_key_reply(m).map(Some),
        TAG_ENDPOINTS => read_endpoint_list(m).map(Some),
        TAG_NEWCOMER => read_newcomer(m).map(Some),
        TAG_KEEPALIVE => Ok(Some(Message::Keepalive)),
        TAG_KEEPALIVE_REPLY => Ok(Some(Message::KeepaliveReply)),
        TAG_CLOSE => Ok(Some(Message::Close)),
        TAG_CLOSE_ACK => Ok(Some(Message::CloseAck)),
        TAG_ACK => read_ack(m).map(Some),
        TAG_FLOW_EXCEPTION => Ok(Some(Message::FlowException { flow: m.read_u8()? })),
        TAG_FLOW | TAG_FLOW_REPEAT => read_flow(tag, m, last_header),
        TAG_FRAGMENT => Err(CodecError::UnsupportedTag(TAG_FRAGMENT)),
        other => Err(CodecError::UnsupportedTag(other)),
    }
}

fn read_handshake(m: &mut Packet) -> Result<Message, CodecError> {
    // length is a single byte unless escaped with the 0x81 U29 form
    let url_len = if m.peek() == Some(0x81) {
        m.skip(2);
        (m.read_u29()? as usize).saturating_sub(1)
    } else {
        m.skip(1);
        (m.read_u8()? as usize).saturating_sub(1)
    };
    match m.read_u8()? {
        HANDSHAKE_SUBTYPE_RENDEZVOUS => {
            let mut peer_ids = Vec::new();
            while m.available() > 16 {
                if m.available() < PEER_ID_SIZE + 16 {
                    return Err(CodecError::Malformed("rendezvous peer id list"));
                }
                peer_ids.push(read_peer_id(m)?);
            }
            if peer_ids.is_empty() {
                return Err(CodecError::Malformed("rendezvous without peer id"));
            }
            let tag = m.read_bytes(16)?;
            Ok(Message::RendezvousRequest { peer_ids, tag })
        }
        HANDSHAKE_SUBTYPE_HELLO => {
            let url = String::from_utf8(m.read_bytes(url_len)?)
                .map_err(|_| CodecError::Malformed("handshake url"))?;
            let tag = m.read_bytes(16)?;
            Ok(Message::HandshakeRequest { url, tag })
        }
        _ => Err(CodecError::Malformed("handshake sub-type")),
    }
}

fn read_key_request(m: &mut Packet) -> Result<Message, CodecError> {
    let initiator_id = m.read_u32()?;
    let cookie_len = m.read_u8()? as usize;
    if cookie_len != COOKIE_SIZE {
        return Err(CodecError::Malformed("cookie size"));
    }
    let cookie = m.read_bytes(cookie_len)?;
    let key_size = m.read_u29()? as usize;
    if key_size <= SIGNATURE_PREFIX_SIZE {
        return Err(CodecError::Malformed("initiator key size"));
    }
    let signature = m.read_bytes(SIGNATURE_PREFIX_SIZE)?;
    let public_key = m.read_bytes(key_size - SIGNATURE_PREFIX_SIZE)?;
    let cert_len = m.read_u8()? as usize;
    if cert_len != INITIATOR_CERT_SIZE {
        return Err(CodecError::Malformed("initiator certificate size"));
    }
    let certificate = m.read_bytes(cert_len)?;
    Ok(Message::KeyRequest { initiator_id, cookie, signature, public_key, certificate })
}

fn read_handshake_reply(m: &mut Packet) -> Result<Message, CodecError> {
    let tag_len = m.read_u8()? as usize;
    let tag = m.read_bytes(tag_len)?;
    let cookie_len = m.read_u8()? as usize;
    let cookie = m.read_bytes(cookie_len)?;
    let certificate = m.read_bytes(m.available())?;
    Ok(Message::HandshakeResponse { tag, cookie, certificate })
}

fn read_key_reply(m: &mut Packet) -> Result<Message, CodecError> {
    let connection_id = m.read_u32()?;
    if m.read_u8()? != 0x81 {
        return Err(CodecError::Malformed("key reply length form"));
    }
    let sig_len = m.read_u8()? as usize;
    let signature = m.read_bytes(sig_len)?;
    if m.available() < 1 {
        return Err(CodecError::Truncated);
    }
    let public_key = m.read_bytes(m.available() - 1)?;
    if m.read_u8()? != 0x58 {
        return Err(CodecError::Malformed("key reply trailer"));
    }
    Ok(Message::KeyResponse { connection_id, signature, public_key })
}

fn read_endpoint_list(m: &mut Packet) -> Result<Message, CodecError> {
    let tag_len = m.read_u8()? as usize;
    let tag = m.read_bytes(tag_len)?;
    let mut endpoints = Vec::new();
    while m.available() > 0 {
        endpoints.push(read_endpoint(m)?);
    }
    if endpoints.first().map(|e| e.public).unwrap_or(false) {
        Ok(Message::RendezvousResponse { tag, endpoints })
    } else {
        Ok(Message::Forward { tag, endpoints })
    }
}

fn read_newcomer(m: &mut Packet) -> Result<Message, CodecError> {
    let intro = m.read_bytes(3)?;
    if intro != [0x22, 0x21, 0x0f] {
        return Err(CodecError::Malformed("newcomer prelude"));
    }
    let peer_id = read_peer_id(m)?;
    let endpoint = read_endpoint(m)?;
    let tag = m.read_bytes(m.available())?;
    Ok(Message::RendezvousNewcomer { peer_id, endpoint, tag })
}

fn read_ack(m: &mut Packet) -> Result<Message, CodecError> {
    let flow = m.read_u8()?;
    let mut marker = m.read_u8()?;
    if marker == 0xff {
        // filler byte seen after many resends
        marker = m.read_u8()?;
    }
    let stage = m.read_u8()?;
    if marker == ACK_POSITIVE {
        Ok(Message::Ack { flow, stage })
    } else {
        Ok(Message::Nack { flow, stage })
    }
}

fn read_flow(
    tag: u8,
    m: &mut Packet,
    last_header: &mut Option<FlowHeader>,
) -> Result<Option<Message>, CodecError> {
    let flag = m.read_u8()?;

    if flag == FLAG_RETRY_EXTENDED || flag == FLAG_RETRY {
        let flow = m.read_u8().unwrap_or(0);
        let stage = m.read_u8().unwrap_or(0);
        return Ok(Some(Message::FlowRetry { flow, stage }));
    }

    let (flow, stage, delta, reused_signature) = if tag == TAG_FLOW_REPEAT && last_header.is_some()
    {
        let last = last_header.as_ref().expect("checked above");
        (last.flow, last.stage, last.delta, last.signature.clone())
    } else {
        (m.read_u8()?, m.read_u8()?, m.read_u8()?, None)
    };

    let signature = if flag == FLAG_EXTENDED {
        let sig_len = m.read_u8()? as usize;
        Some(m.read_bytes(sig_len)?)
    } else {
        reused_signature
    };

    let header = FlowHeader { flag, flow, stage, delta, signature };
    *last_header = Some(header.clone());

    // a bare flag with no body trails some group joins
    if m.size() == 1 {
        return Ok(None);
    }

    if header.flow == 0x02 {
        return read_flow_two(m, header).map(Some);
    }
    if header.flow > 0x02 && header.stage == 0x01 {
        return read_group_stage_one(m, header).map(Some);
    }
    if header.flow > 0x02 && header.stage == 0x02 {
        return Ok(Some(Message::GroupLeave { header }));
    }
    Err(CodecError::Malformed("flow message"))
}

fn read_flow_two(m: &mut Packet, header: FlowHeader) -> Result<Message, CodecError> {
    // server-emitted bodies are discriminated by their fixed preludes
    match m.peek() {
        Some(0x02) if starts_with(m, &[0x02, 0x0a, 0x02]) => {
            m.skip(3);
            let prelude = read_prelude6(m)?;
            let name = amf::read_string(m)?;
            let handle = amf::read_number(m)?;
            amf::read_value(m)?; // null terminating the command header
            let status = amf::read_value(m)?;
            let (code, description) = status_fields(&status);
            if name != "_result" {
                return Err(CodecError::Malformed("session open ack name"));
            }
            Ok(Message::SessionOpenAck { header, prelude, handle, code, description })
        }
        Some(0x14) => {
            m.skip(1);
            m.read_u32()?;
            let name = amf::read_string(m)?;
            let handle = amf::read_number(m)?;
            amf::read_value(m)?; // null
            if name == "_result" {
                let value = if m.available() > 0 { Some(amf::read_value(m)?) } else { None };
                Ok(Message::CommandResult { header, handle, value })
            } else {
                let status = amf::read_value(m)?;
                let (_, description) = status_fields(&status);
                Ok(Message::CommandError { header, handle, description })
            }
        }
        Some(0x04) => {
            m.skip(7);
            let server_keepalive_ms = m.read_u32()?;
            let client_keepalive_ms = m.read_u32()?;
            Ok(Message::AddressesAck { header, server_keepalive_ms, client_keepalive_ms })
        }
        _ => {
            let prelude = read_prelude6(m)?;
            let name = amf::read_string(m)?;
            let handle = amf::read_number(m)?;
            match name.as_str() {
                "connect" => {
                    let params = amf::read_values(m)?;
                    Ok(Message::SessionOpen { header, prelude, handle, params })
                }
                "setPeerInfo" => {
                    m.skip(1); // null closing the command header
                    let mut endpoints = Vec::new();
                    while m.available() > 3 {
                        if m.read_u8()? != 0x02 {
                            break;
                        }
                        endpoints.push(read_endpoint_text(m)?);
                    }
                    Ok(Message::Addresses { header, prelude, handle, endpoints })
                }
                _ => {
                    let params = amf::read_values(m)?;
                    Ok(Message::Command { header, prelude, name, handle, params })
                }
            }
        }
    }
}

fn read_group_stage_one(m: &mut Packet, header: FlowHeader) -> Result<Message, CodecError> {
    let raw = m.read_bytes(2)?;
    let prelude = [raw[0], raw[1]];
    if starts_with(m, &[0x03, 0x00, 0x0b]) {
        m.skip(3);
        let peer_ids = vec![read_peer_id(m)?];
        return Ok(Message::GroupPeers { header, prelude, peer_ids });
    }
    m.skip(3);
    let id_len = m.read_u29()? as usize;
    let group_id = m.read_bytes(id_len)?;
    Ok(Message::GroupJoin { header, prelude, group_id })
}

fn starts_with(m: &Packet, prefix: &[u8]) -> bool {
    let rest = &m.bytes()[m.pos().min(m.size())..];
    rest.len() >= prefix.len() && &rest[..prefix.len()] == prefix
}

fn read_prelude6(m: &mut Packet) -> Result<[u8; 6], CodecError> {
    let raw = m.read_bytes(6)?;
    let mut prelude = [0u8; 6];
    prelude.copy_from_slice(&raw);
    Ok(prelude)
}

fn status_fields(status: &Amf0Value) -> (String, String) {
    let mut code = String::new();
    let mut description = String::new();
    if let Amf0Value::Object(props) = status {
        for (key, value) in props {
            if let Amf0Value::String(s) = value {
                match key.as_str() {
                    "code" => code = s.clone(),
                    "description" => description = s.clone(),
                    _ => {}
                }
            }
        }
    }
    (code, description)
}

/// Begin a datagram: 6-byte placeholder header, marker, send time and
/// the echoed peer time when the marker carries one.
pub fn begin_packet(pkt: &mut Packet, marker: u8, echo_time: u16) {
    pkt.set_pos(0);
    pkt.write_bytes(&[0u8; 6]);
    pkt.write_u8(marker);
    pkt.write_u16(time_now());
    if marker_has_echo(marker) {
        pkt.write_u16(echo_time);
    }
}

/// Serialize a complete single-message datagram.
pub fn write_packet(pkt: &mut Packet, message: &Message, echo_time: u16) {
    begin_packet(pkt, message.marker(), echo_time);
    write_message(pkt, message);
}

/// Append one message (tag, 16-bit length, body) at the cursor.
pub fn write_message(pkt: &mut Packet, message: &Message) {
    match message {
        Message::HandshakeRequest { url, tag } => {
            write_sized(pkt, TAG_HANDSHAKE, |b| {
                if url.len() + 2 < 0x81 {
                    b.write_u8(url.len() as u8 + 2);
                    b.write_u8(url.len() as u8 + 1);
                } else {
                    b.write_u8(0x81);
                    b.write_u8(0x7f);
                    b.write_u29(url.len() as u32 + 1);
                }
                b.write_u8(HANDSHAKE_SUBTYPE_HELLO);
                b.write_bytes(url.as_bytes());
                b.write_bytes(tag);
            });
        }
        Message::RendezvousRequest { peer_ids, tag } => {
            write_sized(pkt, TAG_HANDSHAKE, |b| {
                b.write_u8(0x22);
                b.write_u8(0x21);
                b.write_u8(HANDSHAKE_SUBTYPE_RENDEZVOUS);
                for id in peer_ids {
                    b.write_bytes(id);
                }
                b.write_bytes(tag);
            });
        }
        Message::HandshakeResponse { tag, cookie, certificate } => {
            write_sized(pkt, TAG_HANDSHAKE_REPLY, |b| {
                b.write_u8(tag.len() as u8);
                b.write_bytes(tag);
                b.write_u8(cookie.len() as u8);
                b.write_bytes(cookie);
                b.write_bytes(certificate);
            });
        }
        Message::KeyRequest { initiator_id, cookie, signature, public_key, certificate } => {
            write_sized(pkt, TAG_KEY_REQUEST, |b| {
                b.write_u32(*initiator_id);
                b.write_u8(cookie.len() as u8);
                b.write_bytes(cookie);
                b.write_u29((signature.len() + public_key.len()) as u32);
                b.write_bytes(signature);
                b.write_bytes(public_key);
                b.write_u8(certificate.len() as u8);
                b.write_bytes(certificate);
            });
        }
        Message::KeyResponse { connection_id, signature, public_key } => {
            write_sized(pkt, TAG_KEY_REPLY, |b| {
                b.write_u32(*connection_id);
                b.write_u8(0x81);
                b.write_u8(signature.len() as u8);
                b.write_bytes(signature);
                b.write_bytes(public_key);
                b.write_u8(0x58);
            });
        }
        Message::RendezvousResponse { tag, endpoints } | Message::Forward { tag, endpoints } => {
            write_sized(pkt, TAG_ENDPOINTS, |b| {
                b.write_u8(tag.len() as u8);
                b.write_bytes(tag);
                for endpoint in endpoints {
                    write_endpoint(b, endpoint);
                }
            });
        }
        Message::RendezvousNewcomer { peer_id, endpoint, tag } => {
            write_sized(pkt, TAG_NEWCOMER, |b| {
                b.write_bytes(&[0x22, 0x21, 0x0f]);
                b.write_bytes(peer_id);
                write_endpoint(b, endpoint);
                b.write_bytes(tag);
            });
        }
        Message::SessionOpen { header, prelude, handle, params } => {
            write_sized(pkt, TAG_FLOW, |b| {
                write_flow_header(b, header);
                b.write_bytes(prelude);
                amf::write_string(b, "connect");
                amf::write_number(b, *handle);
                for param in params {
                    amf::write_value(b, param);
                }
            });
        }
        Message::SessionOpenAck { header, prelude, handle, code, description } => {
            write_sized(pkt, TAG_FLOW, |b| {
                write_flow_header(b, header);
                b.write_bytes(&[0x02, 0x0a, 0x02]);
                b.write_bytes(prelude);
                amf::write_string(b, "_result");
                amf::write_number(b, *handle);
                amf::write_null(b);
                amf::write_value(
                    b,
                    &Amf0Value::Object(vec![
                        ("objectEncoding".to_string(), Amf0Value::Number(3.0)),
                        ("description".to_string(), Amf0Value::String(description.clone())),
                        ("level".to_string(), Amf0Value::String("status".to_string())),
                        ("code".to_string(), Amf0Value::String(code.clone())),
                    ]),
                );
            });
        }
        Message::Addresses { header, prelude, handle, endpoints } => {
            write_sized(pkt, TAG_FLOW, |b| {
                write_flow_header(b, header);
                b.write_bytes(prelude);
                amf::write_string(b, "setPeerInfo");
                amf::write_number(b, *handle);
                amf::write_null(b);
                for endpoint in endpoints {
                    amf::write_string(b, &endpoint.to_string());
                }
            });
        }
        Message::AddressesAck { header, server_keepalive_ms, client_keepalive_ms } => {
            write_sized(pkt, TAG_FLOW, |b| {
                write_flow_header(b, header);
                b.write_bytes(&[0x04, 0x00, 0x00, 0x00, 0x00, 0x00, 0x29]);
                b.write_u32(*server_keepalive_ms);
                b.write_u32(*client_keepalive_ms);
            });
        }
        Message::Command { header, prelude, name, handle, params } => {
            write_sized(pkt, TAG_FLOW, |b| {
                write_flow_header(b, header);
                b.write_bytes(prelude);
                amf::write_string(b, name);
                amf::write_number(b, *handle);
                for param in params {
                    amf::write_value(b, param);
                }
            });
        }
        Message::CommandResult { header, handle, value } => {
            write_sized(pkt, TAG_FLOW, |b| {
                write_flow_header(b, header);
                b.write_u8(0x14);
                b.write_u32(0);
                amf::write_string(b, "_result");
                amf::write_number(b, *handle);
                amf::write_null(b);
                if let Some(value) = value {
                    amf::write_value(b, value);
                }
            });
        }
        Message::CommandError { header, handle, description } => {
            write_sized(pkt, TAG_FLOW, |b| {
                write_flow_header(b, header);
                b.write_u8(0x14);
                b.write_u32(0);
                amf::write_string(b, "_error");
                amf::write_number(b, *handle);
                amf::write_null(b);
                amf::write_value(
                    b,
                    &Amf0Value::Object(vec![
                        ("level".to_string(), Amf0Value::String("error".to_string())),
                        (
                            "code".to_string(),
                            Amf0Value::String("NetConnection.Call.Failed".to_string()),
                        ),
                        ("description".to_string(), Amf0Value::String(description.clone())),
                    ]),
                );
            });
        }
        Message::GroupJoin { header, prelude, group_id } => {
            write_sized(pkt, TAG_FLOW, |b| {
                write_flow_header(b, header);
                b.write_bytes(prelude);
                b.write_bytes(&[0x00, 0x00, 0x00]);
                b.write_u29(group_id.len() as u32);
                b.write_bytes(group_id);
            });
        }
        Message::GroupPeers { header, prelude, peer_ids } => {
            write_sized(pkt, TAG_FLOW, |b| {
                write_flow_header(b, header);
                b.write_bytes(prelude);
                b.write_u8(0x03);
                b.write_u16(0x0b);
                if let Some(first) = peer_ids.first() {
                    b.write_bytes(first);
                }
            });
            for peer_id in peer_ids.iter().skip(1) {
                write_sized(pkt, TAG_FLOW_REPEAT, |b| {
                    b.write_u16(0x0b);
                    b.write_bytes(peer_id);
                });
            }
        }
        Message::GroupLeave { header } => {
            write_sized(pkt, TAG_FLOW, |b| {
                write_flow_header(b, header);
            });
        }
        Message::FlowRetry { flow, stage } => {
            write_sized(pkt, TAG_FLOW, |b| {
                b.write_u8(FLAG_RETRY_EXTENDED);
                b.write_u8(*flow);
                b.write_u8(*stage);
            });
        }
        Message::Ack { flow, stage } => write_ack(pkt, *flow, *stage, true),
        Message::Nack { flow, stage } => write_ack(pkt, *flow, *stage, false),
        Message::Keepalive => write_sized(pkt, TAG_KEEPALIVE, |_| {}),
        Message::KeepaliveReply => write_sized(pkt, TAG_KEEPALIVE_REPLY, |_| {}),
        Message::Close => write_sized(pkt, TAG_CLOSE, |_| {}),
        Message::CloseAck => write_sized(pkt, TAG_CLOSE_ACK, |_| {}),
        Message::FlowException { flow } => {
            write_sized(pkt, TAG_FLOW_EXCEPTION, |b| b.write_u8(*flow));
        }
    }
}

/// Append an acknowledgment (tag 0x51, length 3).
pub fn write_ack(pkt: &mut Packet, flow: u8, stage: u8, positive: bool) {
    pkt.write_u8(TAG_ACK);
    pkt.write_u16(3);
    pkt.write_u8(flow);
    pkt.write_u8(if positive { ACK_POSITIVE } else { 0x00 });
    pkt.write_u8(stage);
}

fn write_sized(pkt: &mut Packet, tag: u8, body: impl FnOnce(&mut Packet)) {
    pkt.write_u8(tag);
    let size_pos = pkt.pos();
    pkt.skip(2);
    let body_start = size_pos + 2;
    body(pkt);
    let size = pkt.pos() - body_start;
    pkt.write_u16_at(size_pos, size as u16);
}

fn write_flow_header(pkt: &mut Packet, header: &FlowHeader) {
    pkt.write_u8(header.flag);
    pkt.write_u8(header.flow);
    pkt.write_u8(header.stage);
    pkt.write_u8(header.delta);
    if header.flag == FLAG_EXTENDED {
        let signature = header.signature.as_deref().unwrap_or(&[]);
        pkt.write_u8(signature.len() as u8);
        pkt.write_bytes(signature);
    }
}

fn write_endpoint(pkt: &mut Packet, endpoint: &PeerEndpoint) {
    match endpoint.addr {
        SocketAddr::V4(v4) => {
            pkt.write_u8(if endpoint.public { 0x02 } else { 0x01 });
            pkt.write_bytes(&v4.ip().octets());
        }
        SocketAddr::V6(v6) => {
            pkt.write_u8(if endpoint.public { 0x82 } else { 0x81 });
            pkt.write_bytes(&v6.ip().octets());
        }
    }
    pkt.write_u16(endpoint.addr.port());
}

fn read_endpoint(pkt: &mut Packet) -> Result<PeerEndpoint, CodecError> {
    let flag = pkt.read_u8()?;
    let (addr, public) = match flag {
        0x01 | 0x02 => {
            let raw = pkt.read_bytes(4)?;
            let octets: [u8; 4] = [raw[0], raw[1], raw[2], raw[3]];
            let port = pkt.read_u16()?;
            (SocketAddr::from((octets, port)), flag == 0x02)
        }
        0x81 | 0x82 => {
            let raw = pkt.read_bytes(16)?;
            let mut octets = [0u8; 16];
            octets.copy_from_slice(&raw);
            let port = pkt.read_u16()?;
            (SocketAddr::from((octets, port)), flag == 0x82)
        }
        _ => return Err(CodecError::Malformed("endpoint flag")),
    };
    Ok(PeerEndpoint { addr, public })
}

/// Legacy text endpoint: 16-bit length + `address:port`, IPv6 in
/// brackets.
fn read_endpoint_text(pkt: &mut Packet) -> Result<SocketAddr, CodecError> {
    let len = pkt.read_u16()? as usize;
    let raw = pkt.read_bytes(len)?;
    let text = String::from_utf8(raw).map_err(|_| CodecError::Malformed("endpoint text"))?;
    text.parse().map_err(|_| CodecError::Malformed("endpoint address"))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(message: Message) -> Frame {
        let mut pkt = Packet::new();
        write_packet(&mut pkt, &message, 5);
        let frame = read_packet(&mut pkt).expect("frame parses");
        assert_eq!(frame.messages, vec![message]);
        frame
    }

    fn header_plain(flow: u8, stage: u8) -> FlowHeader {
        FlowHeader { flag: 0x00, flow, stage, delta: 0x01, signature: None }
    }

    fn header_signed(flow: u8, stage: u8) -> FlowHeader {
        FlowHeader { flag: 0x80, flow, stage, delta: 0x01, signature: Some(vec![0x47, 0x52, 0x1d]) }
    }

    #[test]
    fn test_handshake_request_roundtrip() {
        roundtrip(Message::HandshakeRequest {
            url: "rtmfp://localhost/app".to_string(),
            tag: vec![9u8; 16],
        });
    }

    #[test]
    fn test_handshake_request_long_url() {
        roundtrip(Message::HandshakeRequest { url: "r".repeat(200), tag: vec![1u8; 16] });
    }

    #[test]
    fn test_handshake_response_roundtrip() {
        roundtrip(Message::HandshakeResponse {
            tag: vec![7u8; 16],
            cookie: vec![3u8; 64],
            certificate: crate::crypto::make_certificate(),
        });
    }

    #[test]
    fn test_rendezvous_request_roundtrip() {
        roundtrip(Message::RendezvousRequest { peer_ids: vec![[4u8; 32]], tag: vec![2u8; 16] });
        // several requested ids in one message
        roundtrip(Message::RendezvousRequest {
            peer_ids: (0..8).map(|i| [i as u8; 32]).collect(),
            tag: vec![2u8; 16],
        });
    }

    #[test]
    fn test_key_exchange_roundtrip() {
        roundtrip(Message::KeyRequest {
            initiator_id: 0x01020304,
            cookie: vec![0xaa; 64],
            signature: vec![0x81, 0x02, 0x1d, 0x02],
            public_key: vec![0x33; 33],
            certificate: vec![0xbb; 76],
        });
        roundtrip(Message::KeyResponse {
            connection_id: 7,
            signature: crate::crypto::SERVER_SIGNATURE.to_vec(),
            public_key: vec![0x44; 33],
        });
    }

    #[test]
    fn test_key_request_rejects_bad_cookie_size() {
        let mut pkt = Packet::new();
        write_packet(
            &mut pkt,
            &Message::KeyRequest {
                initiator_id: 1,
                cookie: vec![0u8; 64],
                signature: vec![0u8; 4],
                public_key: vec![1u8; 16],
                certificate: vec![2u8; 76],
            },
            0,
        );
        // corrupt the cookie length byte (after 6 header + 3 frame + 1 tag + 2 len + 4 id)
        pkt.bytes_mut()[16] = 63;
        assert!(read_packet(&mut pkt).is_err());
    }

    #[test]
    fn test_session_open_roundtrip() {
        roundtrip(Message::SessionOpen {
            header: header_signed(2, 1),
            prelude: [0, 0x54, 0x43, 0x04, 0, 0],
            handle: 1.0,
            params: vec![Amf0Value::Object(vec![(
                "app".to_string(),
                Amf0Value::String("chat".to_string()),
            )])],
        });
        // empty argument list
        roundtrip(Message::SessionOpen {
            header: header_signed(2, 1),
            prelude: [0; 6],
            handle: 1.0,
            params: vec![],
        });
    }

    #[test]
    fn test_session_open_ack_roundtrip() {
        roundtrip(Message::SessionOpenAck {
            header: header_signed(2, 1),
            prelude: [0, 0x54, 0x43, 0x04, 0, 0],
            handle: 1.0,
            code: "NetConnection.Connect.Success".to_string(),
            description: "Connection succeeded".to_string(),
        });
    }

    #[test]
    fn test_addresses_roundtrip() {
        roundtrip(Message::Addresses {
            header: header_plain(2, 2),
            prelude: [0; 6],
            handle: 2.0,
            endpoints: vec![
                "10.0.0.2:1935".parse().unwrap(),
                "[2001:db8::1]:19350".parse().unwrap(),
            ],
        });
        roundtrip(Message::AddressesAck {
            header: header_plain(2, 2),
            server_keepalive_ms: 60_000,
            client_keepalive_ms: 60_000,
        });
    }

    #[test]
    fn test_command_roundtrip() {
        roundtrip(Message::Command {
            header: header_plain(2, 3),
            prelude: [0; 6],
            name: "echo".to_string(),
            handle: 3.0,
            params: vec![Amf0Value::String("ping".to_string()), Amf0Value::Number(4.0)],
        });
        roundtrip(Message::CommandResult {
            header: header_plain(2, 3),
            handle: 3.0,
            value: Some(Amf0Value::String("pong".to_string())),
        });
        roundtrip(Message::CommandResult { header: header_plain(2, 3), handle: 3.0, value: None });
        roundtrip(Message::CommandError {
            header: header_plain(2, 3),
            handle: 3.0,
            description: "no such command".to_string(),
        });
    }

    #[test]
    fn test_group_roundtrip() {
        roundtrip(Message::GroupJoin {
            header: header_signed(3, 1),
            prelude: [0x00, 0x47],
            group_id: vec![0xde, 0xad, 0xbe, 0xef],
        });
        roundtrip(Message::GroupLeave { header: header_plain(3, 2) });
    }

    #[test]
    fn test_group_peers_roundtrip_with_continuations() {
        roundtrip(Message::GroupPeers {
            header: header_signed(3, 1),
            prelude: [0x00, 0x47],
            peer_ids: vec![[1u8; 32]],
        });
        roundtrip(Message::GroupPeers {
            header: header_signed(3, 1),
            prelude: [0x00, 0x47],
            peer_ids: vec![[1u8; 32], [2u8; 32], [3u8; 32]],
        });
    }

    #[test]
    fn test_rendezvous_response_roundtrip() {
        roundtrip(Message::RendezvousResponse {
            tag: vec![5u8; 16],
            endpoints: vec![
                PeerEndpoint { addr: "1.2.3.4:1935".parse().unwrap(), public: true },
                PeerEndpoint { addr: "192.168.0.9:1935".parse().unwrap(), public: false },
            ],
        });
        roundtrip(Message::Forward {
            tag: vec![5u8; 16],
            endpoints: vec![PeerEndpoint { addr: "192.168.0.9:1935".parse().unwrap(), public: false }],
        });
        roundtrip(Message::RendezvousNewcomer {
            peer_id: [6u8; 32],
            endpoint: PeerEndpoint { addr: "4.3.2.1:1000".parse().unwrap(), public: true },
            tag: vec![8u8; 16],
        });
    }

    #[test]
    fn test_small_messages_roundtrip() {
        roundtrip(Message::Ack { flow: 2, stage: 1 });
        roundtrip(Message::Nack { flow: 3, stage: 9 });
        roundtrip(Message::Keepalive);
        roundtrip(Message::KeepaliveReply);
        roundtrip(Message::Close);
        roundtrip(Message::CloseAck);
        roundtrip(Message::FlowException { flow: 2 });
        roundtrip(Message::FlowRetry { flow: 2, stage: 1 });
    }

    #[test]
    fn test_bad_marker_fails_datagram() {
        let mut pkt = Packet::new();
        pkt.write_bytes(&[0u8; 6]);
        pkt.write_u8(0x77);
        pkt.write_u16(0);
        assert_eq!(read_packet(&mut pkt).unwrap_err(), CodecError::BadMarker(0x77));
    }

    #[test]
    fn test_partial_message_dropped_silently() {
        let mut pkt = Packet::new();
        begin_packet(&mut pkt, MARKER_RESPONSE_PLAIN, 0);
        pkt.write_u8(0x51);
        pkt.write_u16(30); // claims more bytes than present
        pkt.write_u8(2);
        let frame = read_packet(&mut pkt).unwrap();
        assert!(frame.messages.is_empty());
    }

    #[test]
    fn test_unrecognized_tag_stops_parsing() {
        let mut pkt = Packet::new();
        begin_packet(&mut pkt, MARKER_RESPONSE_ECHO, 1);
        write_message(&mut pkt, &Message::Keepalive);
        pkt.write_u8(0xff); // padding byte, not a tag
        pkt.write_u8(0xff);
        let frame = read_packet(&mut pkt).unwrap();
        assert_eq!(frame.messages, vec![Message::Keepalive]);
    }

    #[test]
    fn test_fragment_tag_fails_datagram() {
        let mut pkt = Packet::new();
        begin_packet(&mut pkt, MARKER_RESPONSE_ECHO, 1);
        pkt.write_u8(0x18);
        pkt.write_u16(0);
        assert_eq!(read_packet(&mut pkt).unwrap_err(), CodecError::UnsupportedTag(0x18));
    }

    #[test]
    fn test_echo_time_produces_latency() {
        let mut pkt = Packet::new();
        begin_packet(&mut pkt, MARKER_RESPONSE_ECHO, 0x0001);
        write_message(&mut pkt, &Message::Keepalive);
        let frame = read_packet(&mut pkt).unwrap();
        assert_eq!(frame.echo_time, 1);
        assert!(frame.latency.is_some());

        let mut pkt = Packet::new();
        begin_packet(&mut pkt, MARKER_RESPONSE_PLAIN, 0);
        write_message(&mut pkt, &Message::Keepalive);
        let frame = read_packet(&mut pkt).unwrap();
        assert_eq!(frame.latency, None);
    }

    #[test]
    fn test_repeat_header_reuses_previous_flow() {
        let mut pkt = Packet::new();
        begin_packet(&mut pkt, MARKER_MESSAGE_ECHO, 0);
        write_message(
            &mut pkt,
            &Message::Command {
                header: header_plain(2, 4),
                prelude: [0; 6],
                name: "first".to_string(),
                handle: 1.0,
                params: vec![],
            },
        );
        // hand-written repeat envelope: flag only, header carried over
        pkt.write_u8(0x11);
        let size_pos = pkt.pos();
        pkt.skip(2);
        pkt.write_u8(0x00);
        pkt.write_bytes(&[0; 6]);
        amf::write_string(&mut pkt, "second");
        amf::write_number(&mut pkt, 2.0);
        let size = (pkt.pos() - size_pos - 2) as u16;
        pkt.write_u16_at(size_pos, size);

        let frame = read_packet(&mut pkt).unwrap();
        assert_eq!(frame.messages.len(), 2);
        match &frame.messages[1] {
            Message::Command { header, name, .. } => {
                assert_eq!(name, "second");
                assert_eq!(header.flow, 2);
                assert_eq!(header.stage, 4);
            }
            other => panic!("unexpected message {other:?}"),
        }
    }

    #[test]
    fn test_ack_filler_byte_tolerated() {
        let mut pkt = Packet::new();
        begin_packet(&mut pkt, MARKER_RESPONSE_ECHO, 1);
        pkt.write_u8(0x51);
        pkt.write_u16(4);
        pkt.write_u8(2);
        pkt.write_u8(0xff);
        pkt.write_u8(0x7f);
        pkt.write_u8(9);
        let frame = read_packet(&mut pkt).unwrap();
        assert_eq!(frame.messages, vec![Message::Ack { flow: 2, stage: 9 }]);
    }

    #[test]
    fn test_retry_flag_terminates_message() {
        let mut pkt = Packet::new();
        begin_packet(&mut pkt, MARKER_RESPONSE_ECHO, 1);
        pkt.write_u8(0x10);
        pkt.write_u16(4);
        pkt.write_bytes(&[0x03, 0x02, 0x01, 0x01]);
        let frame = read_packet(&mut pkt).unwrap();
        assert_eq!(frame.messages, vec![Message::FlowRetry { flow: 2, stage: 1 }]);
    }
}
