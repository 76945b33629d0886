//! DTLS-PSK-style session layer (C2): identity challenge/response, HKDF key
//! derivation, and an AEAD record layer with a sliding-window replay guard.
//!
//! Modeled on the handshake/record split the transport modules in this
//! workspace already use for their reliable connections, but replacing the
//! plaintext `serde_json` framing with an authenticated, encrypted one.

use aes_gcm::aead::{Aead, KeyInit, Payload};
use aes_gcm::Aes256Gcm;
use chacha20poly1305::ChaCha20Poly1305;
use hkdf::Hkdf;
use hmac::{Hmac, Mac};
use rand::RngCore;
use sha2::Sha256;

use crate::error::SessionError;

type Result<T> = std::result::Result<T, SessionError>;
type HmacSha256 = Hmac<Sha256>;

const KEY_LEN: usize = 32;
const NONCE_LEN: usize = 12;
const CHALLENGE_LEN: usize = 32;
const REPLAY_WINDOW: u64 = 100;
pub const RECORD_TAG: u8 = 0x10;

/// Frame tags for the plaintext handshake that bootstraps a [`PskSession`],
/// exchanged before any `RpcMessage` is sent. Shared between the client and
/// server connection modules so both sides agree on the framing without
/// duplicating constants.
pub const HANDSHAKE_HELLO: u8 = 0x01;
pub const HANDSHAKE_CHALLENGE: u8 = 0x02;
pub const HANDSHAKE_RESPONSE: u8 = 0x03;
pub const HANDSHAKE_ACCEPT: u8 = 0x04;
pub const HANDSHAKE_REJECT: u8 = 0x05;
/// Sent by a listener that demultiplexes many peers off one rendezvous
/// socket, redirecting the client to a per-connection ephemeral port
/// before the challenge is issued. Payload is a big-endian u16 port.
pub const HANDSHAKE_REDIRECT: u8 = 0x06;

/// Negotiated AEAD construction for the record layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PskCipher {
    Aes256Gcm,
    ChaCha20Poly1305,
}

impl Default for PskCipher {
    fn default() -> Self {
        PskCipher::Aes256Gcm
    }
}

/// State machine for one side of a PSK handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Init,
    AwaitingChallenge,
    AwaitingResponse,
    Established,
    Closed,
}

/// A derived, zeroizing AEAD key pair plus the sliding-window replay guard.
/// Keys never appear in `Debug` output.
pub struct PskSession {
    identity: String,
    cipher: PskCipher,
    state: SessionState,
    encrypt_key: Option<[u8; KEY_LEN]>,
    decrypt_key: Option<[u8; KEY_LEN]>,
    send_seq: u64,
    recv_watermark: u64,
    recv_window: u128,
    authenticated_user: Option<crate::message::Identity>,
}

impl std::fmt::Debug for PskSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PskSession")
            .field("identity", &self.identity)
            .field("cipher", &self.cipher)
            .field("state", &self.state)
            .field("encrypt_key", &self.encrypt_key.map(|_| "<redacted>"))
            .field("decrypt_key", &self.decrypt_key.map(|_| "<redacted>"))
            .field("send_seq", &self.send_seq)
            .field("recv_watermark", &self.recv_watermark)
            .finish()
    }
}

impl Drop for PskSession {
    fn drop(&mut self) {
        if let Some(k) = self.encrypt_key.as_mut() {
            k.fill(0);
        }
        if let Some(k) = self.decrypt_key.as_mut() {
            k.fill(0);
        }
    }
}

/// One side of the handshake's HMAC challenge exchange, held until the
/// response arrives.
pub struct PendingChallenge {
    pub identity: String,
    pub challenge: [u8; CHALLENGE_LEN],
}

impl PskSession {
    pub fn new(identity: impl Into<String>, cipher: PskCipher) -> Self {
        Self {
            identity: identity.into(),
            cipher,
            state: SessionState::Init,
            encrypt_key: None,
            decrypt_key: None,
            send_seq: 0,
            recv_watermark: 0,
            recv_window: 0,
            authenticated_user: None,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn authenticated_user(&self) -> Option<&crate::message::Identity> {
        self.authenticated_user.as_ref()
    }

    /// Server side: issues a fresh random challenge for `identity`, looked
    /// up against `psk` by the caller beforehand.
    pub fn issue_challenge(identity: impl Into<String>) -> PendingChallenge {
        let mut challenge = [0u8; CHALLENGE_LEN];
        rand::thread_rng().fill_bytes(&mut challenge);
        PendingChallenge {
            identity: identity.into(),
            challenge,
        }
    }

    /// Client side: computes `HMAC-SHA256(psk, challenge)` as the response.
    pub fn respond_to_challenge(psk: &[u8], challenge: &[u8]) -> Vec<u8> {
        let mut mac = HmacSha256::new_from_slice(psk).expect("HMAC accepts any key length");
        mac.update(challenge);
        mac.finalize().into_bytes().to_vec()
    }

    /// Server side: verifies the client's response in constant time and, on
    /// success, derives the session's directional keys via HKDF-SHA256.
    pub fn verify_and_derive(
        &mut self,
        psk: &[u8],
        challenge: &[u8],
        response: &[u8],
    ) -> Result<()> {
        let mut mac = HmacSha256::new_from_slice(psk).expect("HMAC accepts any key length");
        mac.update(challenge);
        mac.verify_slice(response)
            .map_err(|_| SessionError::ChallengeMismatch)?;
        self.derive_keys(psk, challenge, true);
        self.state = SessionState::Established;
        Ok(())
    }

    /// Client side: derives keys once the server's ack confirms the
    /// challenge response was accepted.
    pub fn complete_as_client(&mut self, psk: &[u8], challenge: &[u8]) {
        self.derive_keys(psk, challenge, false);
        self.state = SessionState::Established;
    }

    /// Derives the two directional keys via `HKDF-SHA256(psk, challenge)`
    /// with distinct info strings, so a peer's send key is the other's
    /// receive key.
    fn derive_keys(&mut self, psk: &[u8], challenge: &[u8], is_server: bool) {
        let hk = Hkdf::<Sha256>::new(Some(challenge), psk);
        let mut s2c = [0u8; KEY_LEN];
        let mut c2s = [0u8; KEY_LEN];
        hk.expand(b"server_to_client", &mut s2c)
            .expect("32 bytes is a valid HKDF output length");
        hk.expand(b"client_to_server", &mut c2s)
            .expect("32 bytes is a valid HKDF output length");
        if is_server {
            self.encrypt_key = Some(s2c);
            self.decrypt_key = Some(c2s);
        } else {
            self.encrypt_key = Some(c2s);
            self.decrypt_key = Some(s2c);
        }
    }

    /// Encrypts `plaintext` into a framed record: `[tag:1][seq:8][nonce:12][ciphertext+tag]`.
    pub fn encrypt(&mut self, plaintext: &[u8]) -> Result<Vec<u8>> {
        let key = self.encrypt_key.ok_or(SessionError::InvalidState(self.state))?;
        let seq = self.send_seq;
        self.send_seq += 1;

        let mut nonce = [0u8; NONCE_LEN];
        nonce[..8].copy_from_slice(&seq.to_le_bytes());

        let ciphertext = match self.cipher {
            PskCipher::Aes256Gcm => {
                let cipher = Aes256Gcm::new_from_slice(&key).expect("32-byte key");
                cipher
                    .encrypt(
                        (&nonce).into(),
                        Payload {
                            msg: plaintext,
                            aad: &seq.to_le_bytes(),
                        },
                    )
                    .map_err(|_| SessionError::DecryptFailed)?
            }
            PskCipher::ChaCha20Poly1305 => {
                let cipher = ChaCha20Poly1305::new_from_slice(&key).expect("32-byte key");
                cipher
                    .encrypt(
                        (&nonce).into(),
                        Payload {
                            msg: plaintext,
                            aad: &seq.to_le_bytes(),
                        },
                    )
                    .map_err(|_| SessionError::DecryptFailed)?
            }
        };

        let mut record = Vec::with_capacity(1 + 8 + NONCE_LEN + ciphertext.len());
        record.push(RECORD_TAG);
        record.extend_from_slice(&seq.to_le_bytes());
        record.extend_from_slice(&nonce);
        record.extend_from_slice(&ciphertext);
        Ok(record)
    }

    /// Decrypts a framed record, rejecting malformed frames, AEAD failures,
    /// and replays (sequence numbers more than [`REPLAY_WINDOW`] behind the
    /// high watermark, or already seen within the window).
    pub fn decrypt(&mut self, record: &[u8]) -> Result<Vec<u8>> {
        let key = self.decrypt_key.ok_or(SessionError::InvalidState(self.state))?;
        if record.len() < 1 + 8 + NONCE_LEN {
            return Err(SessionError::MalformedRecord);
        }
        if record[0] != RECORD_TAG {
            return Err(SessionError::MalformedRecord);
        }
        let seq = u64::from_le_bytes(record[1..9].try_into().unwrap());
        let nonce = &record[9..9 + NONCE_LEN];
        let ciphertext = &record[9 + NONCE_LEN..];

        self.check_replay(seq)?;

        let plaintext = match self.cipher {
            PskCipher::Aes256Gcm => {
                let cipher = Aes256Gcm::new_from_slice(&key).expect("32-byte key");
                cipher
                    .decrypt(
                        nonce.into(),
                        Payload {
                            msg: ciphertext,
                            aad: &seq.to_le_bytes(),
                        },
                    )
                    .map_err(|_| SessionError::DecryptFailed)?
            }
            PskCipher::ChaCha20Poly1305 => {
                let cipher = ChaCha20Poly1305::new_from_slice(&key).expect("32-byte key");
                cipher
                    .decrypt(
                        nonce.into(),
                        Payload {
                            msg: ciphertext,
                            aad: &seq.to_le_bytes(),
                        },
                    )
                    .map_err(|_| SessionError::DecryptFailed)?
            }
        };

        self.record_seen(seq);
        Ok(plaintext)
    }

    fn check_replay(&self, seq: u64) -> Result<()> {
        if seq > self.recv_watermark {
            return Ok(());
        }
        let age = self.recv_watermark - seq;
        if age >= REPLAY_WINDOW {
            return Err(SessionError::ReplayDetected {
                seq,
                watermark: self.recv_watermark,
            });
        }
        if self.recv_window & (1u128 << age) != 0 {
            return Err(SessionError::ReplayDetected {
                seq,
                watermark: self.recv_watermark,
            });
        }
        Ok(())
    }

    fn record_seen(&mut self, seq: u64) {
        if seq > self.recv_watermark {
            let shift = seq - self.recv_watermark;
            self.recv_window = if shift >= 128 { 0 } else { self.recv_window << shift };
            self.recv_window |= 1;
            self.recv_watermark = seq;
        } else {
            let age = self.recv_watermark - seq;
            self.recv_window |= 1u128 << age;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn established_pair(cipher: PskCipher) -> (PskSession, PskSession) {
        let psk = b"shared-secret-key-material";
        let pending = PskSession::issue_challenge("client-1");
        let response = PskSession::respond_to_challenge(psk, &pending.challenge);

        let mut server = PskSession::new("server", cipher);
        server
            .verify_and_derive(psk, &pending.challenge, &response)
            .unwrap();

        let mut client = PskSession::new("client-1", cipher);
        client.complete_as_client(psk, &pending.challenge);

        (server, client)
    }

    #[test]
    fn handshake_derives_complementary_keys() {
        let (server, client) = established_pair(PskCipher::Aes256Gcm);
        assert_eq!(server.encrypt_key, client.decrypt_key);
        assert_eq!(client.encrypt_key, server.decrypt_key);
    }

    #[test]
    fn wrong_psk_fails_challenge() {
        let pending = PskSession::issue_challenge("client-1");
        let wrong_response = PskSession::respond_to_challenge(b"wrong-psk", &pending.challenge);
        let mut server = PskSession::new("server", PskCipher::Aes256Gcm);
        let err = server
            .verify_and_derive(b"shared-secret-key-material", &pending.challenge, &wrong_response)
            .unwrap_err();
        assert_eq!(err, SessionError::ChallengeMismatch);
    }

    #[test]
    fn encrypt_decrypt_roundtrip_both_ciphers() {
        for cipher in [PskCipher::Aes256Gcm, PskCipher::ChaCha20Poly1305] {
            let (mut server, mut client) = established_pair(cipher);
            let record = client.encrypt(b"hello from client").unwrap();
            let plaintext = server.decrypt(&record).unwrap();
            assert_eq!(plaintext, b"hello from client");
        }
    }

    #[test]
    fn replay_of_same_sequence_is_rejected() {
        let (mut server, mut client) = established_pair(PskCipher::Aes256Gcm);
        let record = client.encrypt(b"ping").unwrap();
        server.decrypt(&record).unwrap();
        let err = server.decrypt(&record).unwrap_err();
        assert!(matches!(err, SessionError::ReplayDetected { .. }));
    }

    #[test]
    fn out_of_window_sequence_is_rejected() {
        let (mut server, mut client) = established_pair(PskCipher::Aes256Gcm);
        let first = client.encrypt(b"seq zero").unwrap();
        server.decrypt(&first).unwrap();
        for _ in 0..150 {
            let record = client.encrypt(b"x").unwrap();
            server.decrypt(&record).unwrap();
        }
        // Replaying seq 0 is now far outside the 100-packet window.
        let err = server.decrypt(&first).unwrap_err();
        assert!(matches!(err, SessionError::ReplayDetected { .. }));
    }

    #[test]
    fn tampered_ciphertext_fails_decryption() {
        let (mut server, mut client) = established_pair(PskCipher::Aes256Gcm);
        let mut record = client.encrypt(b"integrity check").unwrap();
        let last = record.len() - 1;
        record[last] ^= 0xff;
        let err = server.decrypt(&record).unwrap_err();
        assert_eq!(err, SessionError::DecryptFailed);
    }

    #[test]
    fn debug_output_never_contains_key_bytes() {
        let (server, _client) = established_pair(PskCipher::Aes256Gcm);
        let debug = format!("{:?}", server);
        assert!(debug.contains("<redacted>"));
    }
}
