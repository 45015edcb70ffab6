//! Handshake cryptography and the packet cipher.
//!
//! Key agreement and the block cipher are injected interfaces so the
//! protocol engine never depends on their internals: `KeyExchange`
//! produces a public key and a shared secret, `PacketCipher` transforms
//! the encrypted region of a datagram in place. The production
//! implementations use P-256 ECDH and AES-128-CBC (zero IV, no padding).

use std::fmt;

use aes::Aes128;
use cbc::cipher::block_padding::NoPadding;
use cbc::cipher::{BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use hmac::{Hmac, Mac};
use p256::ecdh::EphemeralSecret;
use p256::elliptic_curve::sec1::ToEncodedPoint;
use p256::PublicKey;
use rand_core::OsRng;
use sha2::{Digest, Sha256};

use crate::packet::{self, Packet, CHECKSUM_OFFSET, CIPHER_BLOCK_SIZE};

type HmacSha256 = Hmac<Sha256>;
type Aes128CbcEnc = cbc::Encryptor<Aes128>;
type Aes128CbcDec = cbc::Decryptor<Aes128>;

/// Well-known symmetric key for all handshake-phase traffic.
pub const HANDSHAKE_KEY: [u8; 16] = *b"Adobe Systems 02";

/// Fixed server signature prefixed to the responder public key.
pub const SERVER_SIGNATURE: [u8; 11] =
    [0x03, 0x1a, 0x00, 0x00, 0x02, 0x1e, 0x00, 0x81, 0x02, 0x0d, 0x02];

/// Length of a peer identifier.
pub const PEER_ID_SIZE: usize = 32;

/// Length of a handshake cookie.
pub const COOKIE_SIZE: usize = 64;

/// Length of the initiator certificate carried in a key request.
pub const INITIATOR_CERT_SIZE: usize = 76;

/// Crypto error
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CryptoError {
    /// The peer public key could not be parsed
    InvalidPublicKey,
    /// A symmetric key had the wrong length
    InvalidKeyLength,
    /// The region handed to the cipher is not block aligned
    UnalignedPayload,
}

impl fmt::Display for CryptoError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CryptoError::InvalidPublicKey => write!(f, "invalid peer public key"),
            CryptoError::InvalidKeyLength => write!(f, "invalid symmetric key length"),
            CryptoError::UnalignedPayload => write!(f, "payload not aligned to cipher block"),
        }
    }
}

impl std::error::Error for CryptoError {}

/// Asymmetric key agreement for one connection.
///
/// Injected so tests can substitute a deterministic implementation. The
/// key pair is generated lazily on first use and reused afterwards, so
/// a retransmitted key request derives identical session keys.
pub trait KeyExchange: Send {
    /// The local public key in its wire encoding.
    fn public_key(&mut self) -> Vec<u8>;

    /// The shared secret for a peer public key.
    fn shared_secret(&mut self, peer_public: &[u8]) -> Result<Vec<u8>, CryptoError>;
}

/// P-256 ECDH key agreement.
pub struct EcdhKeyExchange {
    secret: Option<EphemeralSecret>,
}

impl EcdhKeyExchange {
    pub fn new() -> Self {
        EcdhKeyExchange { secret: None }
    }

    fn secret(&mut self) -> &EphemeralSecret {
        self.secret.get_or_insert_with(|| EphemeralSecret::random(&mut OsRng))
    }
}

impl Default for EcdhKeyExchange {
    fn default() -> Self {
        EcdhKeyExchange::new()
    }
}

impl KeyExchange for EcdhKeyExchange {
    fn public_key(&mut self) -> Vec<u8> {
        PublicKey::from(self.secret()).to_encoded_point(true).as_bytes().to_vec()
    }

    fn shared_secret(&mut self, peer_public: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let peer =
            PublicKey::from_sec1_bytes(peer_public).map_err(|_| CryptoError::InvalidPublicKey)?;
        Ok(self.secret().diffie_hellman(&peer).raw_secret_bytes().to_vec())
    }
}

/// Symmetric cipher applied to the datagram region past the checksum.
///
/// The slice length must be a multiple of the cipher block size; the
/// transport codec pads outbound packets before encryption.
pub trait PacketCipher: Send + Sync {
    fn encrypt(&self, data: &mut [u8], key: &[u8; 16]) -> Result<(), CryptoError>;
    fn decrypt(&self, data: &mut [u8], key: &[u8; 16]) -> Result<(), CryptoError>;
}

/// AES-128-CBC with a zero IV and no padding.
pub struct CbcPacketCipher;

const ZERO_IV: [u8; 16] = [0u8; 16];

impl PacketCipher for CbcPacketCipher {
    fn encrypt(&self, data: &mut [u8], key: &[u8; 16]) -> Result<(), CryptoError> {
        if data.len() % CIPHER_BLOCK_SIZE != 0 {
            return Err(CryptoError::UnalignedPayload);
        }
        let len = data.len();
        let cipher = Aes128CbcEnc::new_from_slices(key, &ZERO_IV)
            .map_err(|_| CryptoError::InvalidKeyLength)?;
        cipher
            .encrypt_padded_mut::<NoPadding>(data, len)
            .map_err(|_| CryptoError::UnalignedPayload)?;
        Ok(())
    }

    fn decrypt(&self, data: &mut [u8], key: &[u8; 16]) -> Result<(), CryptoError> {
        if data.len() % CIPHER_BLOCK_SIZE != 0 {
            return Err(CryptoError::UnalignedPayload);
        }
        let cipher = Aes128CbcDec::new_from_slices(key, &ZERO_IV)
            .map_err(|_| CryptoError::InvalidKeyLength)?;
        cipher
            .decrypt_padded_mut::<NoPadding>(data)
            .map_err(|_| CryptoError::UnalignedPayload)?;
        Ok(())
    }
}

/// Pad, checksum, encrypt and stamp the connection id on an outgoing
/// datagram. The filler bytes align the encrypted region to the cipher
/// block size; the checksum is written at offset 4 before encryption.
pub fn seal_packet(
    cipher: &dyn PacketCipher,
    mut pkt: Packet,
    key: &[u8; 16],
    encode_id: u32,
) -> Result<Vec<u8>, CryptoError> {
    let size = pkt.size();
    let padding = packet::padding_length(size);
    pkt.set_pos(size);
    for _ in 0..padding {
        pkt.write_u8(0xff);
    }

    let sum = packet::checksum(&pkt);
    pkt.set_pos(CHECKSUM_OFFSET);
    pkt.write_u16(sum);

    let total = pkt.size();
    cipher.encrypt(&mut pkt.bytes_mut()[CHECKSUM_OFFSET..total], key)?;
    packet::encode_connection_id(&mut pkt, encode_id).map_err(|_| CryptoError::UnalignedPayload)?;
    Ok(pkt.into_bytes())
}

/// Decrypt the region past the checksum field and validate it.
///
/// Returns false for forged, corrupt or wrong-key datagrams; such
/// datagrams must be dropped without a reply.
pub fn open_packet(cipher: &dyn PacketCipher, pkt: &mut Packet, key: &[u8; 16]) -> bool {
    let size = pkt.size();
    if size <= CHECKSUM_OFFSET || (size - CHECKSUM_OFFSET) % CIPHER_BLOCK_SIZE != 0 {
        return false;
    }
    if cipher.decrypt(&mut pkt.bytes_mut()[CHECKSUM_OFFSET..size], key).is_err() {
        return false;
    }
    pkt.set_pos(CHECKSUM_OFFSET);
    match pkt.read_u16() {
        Ok(stored) => stored == packet::checksum(pkt),
        Err(_) => false,
    }
}

/// Derive the per-connection (decrypt, encrypt) keys.
///
/// HMAC-SHA256 chain over the shared secret and both handshake nonces;
/// the 256-bit digests are truncated to the cipher key size.
pub fn derive_session_keys(
    shared_secret: &[u8],
    initiator_nonce: &[u8],
    responder_nonce: &[u8],
) -> ([u8; 16], [u8; 16]) {
    let md1 = hmac_sha256(responder_nonce, initiator_nonce);
    let md2 = hmac_sha256(initiator_nonce, responder_nonce);
    let decrypt = hmac_sha256(shared_secret, &md1);
    let encrypt = hmac_sha256(shared_secret, &md2);
    let mut decrypt_key = [0u8; 16];
    let mut encrypt_key = [0u8; 16];
    decrypt_key.copy_from_slice(&decrypt[..16]);
    encrypt_key.copy_from_slice(&encrypt[..16]);
    (decrypt_key, encrypt_key)
}

fn hmac_sha256(key: &[u8], data: &[u8]) -> [u8; 32] {
    let mut mac = HmacSha256::new_from_slice(key).expect("HMAC accepts any key length");
    mac.update(data);
    mac.finalize().into_bytes().into()
}

/// Peer identifier: SHA-256 over the initiator's public key material.
pub fn compute_peer_id(key_with_signature: &[u8]) -> [u8; PEER_ID_SIZE] {
    Sha256::digest(key_with_signature).into()
}

/// Build a fresh 77-byte certificate blob with a random core.
pub fn make_certificate() -> Vec<u8> {
    use rand_core::RngCore;
    let mut core = [0u8; 64];
    OsRng.fill_bytes(&mut core);
    let mut cert = Vec::with_capacity(77);
    cert.extend_from_slice(&[0x01, 0x0a, 0x41, 0x0e]);
    cert.extend_from_slice(&core);
    cert.extend_from_slice(&[0x02, 0x15, 0x02, 0x02, 0x15, 0x05, 0x02, 0x15, 0x0e]);
    cert
}

/// Build a fresh 64-byte handshake cookie.
pub fn make_cookie() -> Vec<u8> {
    use rand_core::RngCore;
    let mut cookie = vec![0u8; COOKIE_SIZE];
    OsRng.fill_bytes(&mut cookie);
    cookie
}

/// The responder nonce: server signature followed by the server public key.
pub fn responder_nonce(server_public_key: &[u8]) -> Vec<u8> {
    let mut nonce = Vec::with_capacity(SERVER_SIGNATURE.len() + server_public_key.len());
    nonce.extend_from_slice(&SERVER_SIGNATURE);
    nonce.extend_from_slice(server_public_key);
    nonce
}
