//! Double Ratchet with DH ratchet steps.
//!
//! References:
//!   - Signal Double Ratchet spec: <https://signal.org/docs/specifications/doubleratchet/>
//!
//! State separation:
//!   RK  - root key (updated on every DH ratchet step)
//!   CKs - sending chain key (updated per message)
//!   CKr - receiving chain key (updated per message)
//!   MK  - message key (derived from CK, used once, then deleted)
//!
//! Every mutating step works on `&mut self`; callers that must not lose
//! state on a failed decrypt operate on a clone and keep it only on success.

use std::collections::HashMap;

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use x25519_dalek::{PublicKey as X25519Public, StaticSecret};
use zeroize::Zeroize;

use crate::error::CryptoError;

/// Maximum number of skipped message keys we store per session.
/// Bounds memory and rejects huge counter jumps.
pub const MAX_SKIP: u64 = 256;

// ── Ratchet header (included in every message, unencrypted) ──────────────────

/// Sent alongside every ciphertext so the recipient can advance their ratchet.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RatchetHeader {
    /// Sender's current DH ratchet public key (base64)
    pub dh_pub: String,
    /// Message number in the current sending chain
    pub n: u64,
    /// Number of messages in the previous sending chain
    pub pn: u64,
}

// ── Session state ────────────────────────────────────────────────────────────

#[derive(Clone, Serialize, Deserialize)]
pub struct RatchetSession {
    pub session_id: String,

    root_key: [u8; 32],

    // ── Sending chain ────────────────────────────────────────────────────
    dh_send_secret: [u8; 32],
    #[serde(with = "public_key_b64")]
    dh_send_pub: X25519Public,
    send_ck: [u8; 32],
    /// Resets to 0 on DH ratchet
    pub send_n: u64,

    // ── Receiving chain ──────────────────────────────────────────────────
    #[serde(with = "public_key_b64::option")]
    dh_recv_pub: Option<X25519Public>,
    recv_ck: [u8; 32],
    pub recv_n: u64,
    pub prev_send_n: u64,

    /// `"{dh_pub}:{n}"` → message key. JSON maps need string keys.
    skipped_keys: HashMap<String, [u8; 32]>,
}

impl Drop for RatchetSession {
    fn drop(&mut self) {
        self.root_key.zeroize();
        self.dh_send_secret.zeroize();
        self.send_ck.zeroize();
        self.recv_ck.zeroize();
        self.skipped_keys.values_mut().for_each(Zeroize::zeroize);
    }
}

fn skipped_key_id(dh_pub: &str, n: u64) -> String {
    format!("{dh_pub}:{n}")
}

fn encode_public(key: &X25519Public) -> String {
    URL_SAFE_NO_PAD.encode(key.as_bytes())
}

fn parse_public(b64: &str) -> Result<X25519Public, CryptoError> {
    let bytes: [u8; 32] = URL_SAFE_NO_PAD
        .decode(b64)?
        .try_into()
        .map_err(|_| CryptoError::InvalidKey("ratchet key must be 32 bytes".into()))?;
    Ok(X25519Public::from(bytes))
}

impl RatchetSession {
    fn blank(session_id: String, root_key: [u8; 32], ratchet_secret: &StaticSecret) -> Self {
        Self {
            session_id,
            root_key,
            dh_send_secret: ratchet_secret.to_bytes(),
            dh_send_pub: X25519Public::from(ratchet_secret),
            send_ck: [0u8; 32],
            send_n: 0,
            dh_recv_pub: None,
            recv_ck: [0u8; 32],
            recv_n: 0,
            prev_send_n: 0,
            skipped_keys: HashMap::new(),
        }
    }

    /// Session for the side that ran X3DH from a bundle. The peer's signed
    /// pre-key is its first ratchet key, so a sending chain exists at once.
    pub fn initiate(
        session_id: String,
        shared_key: [u8; 32],
        their_signed_pre_key: &X25519Public,
    ) -> Result<Self, CryptoError> {
        let ratchet_secret = StaticSecret::random_from_rng(OsRng);
        let mut session = Self::blank(session_id, shared_key, &ratchet_secret);
        session.dh_recv_pub = Some(*their_signed_pre_key);
        session.send_ck = session.mix_root(&ratchet_secret, their_signed_pre_key)?;
        Ok(session)
    }

    /// Session for the side that received the pre-key message. Our signed
    /// pre-key is the opening ratchet key; nothing can be sent until the
    /// initiator's first message drives a DH step.
    pub fn respond(session_id: String, shared_key: [u8; 32], our_signed_pre_key: &StaticSecret) -> Self {
        Self::blank(session_id, shared_key, our_signed_pre_key)
    }

    pub fn can_send(&self) -> bool {
        self.dh_recv_pub.is_some()
    }

    pub fn our_ratchet_pub(&self) -> X25519Public {
        self.dh_send_pub
    }

    /// Advance the sending chain. Returns (header, message_key).
    pub fn encrypt_step(&mut self) -> Result<(RatchetHeader, [u8; 32]), CryptoError> {
        if !self.can_send() {
            return Err(CryptoError::RatchetStep("sending chain not established yet".into()));
        }
        let mk = advance_chain(&mut self.send_ck)?;
        let header = RatchetHeader {
            dh_pub: encode_public(&self.dh_send_pub),
            n: self.send_n,
            pn: self.prev_send_n,
        };
        self.send_n += 1;
        Ok((header, mk))
    }

    /// Message key for an inbound header. A stored skipped key is used
    /// first; a new peer ratchet key triggers a DH step after stashing the
    /// rest of the old receiving chain.
    pub fn decrypt_step(&mut self, header: &RatchetHeader) -> Result<[u8; 32], CryptoError> {
        if let Some(mk) = self.skipped_keys.remove(&skipped_key_id(&header.dh_pub, header.n)) {
            return Ok(mk);
        }

        let peer = parse_public(&header.dh_pub)?;
        let is_new_chain = self.dh_recv_pub.map_or(true, |current| current != peer);
        if is_new_chain {
            if self.dh_recv_pub.is_some() {
                self.stash_skipped(header.pn)?;
            }
            self.dh_step(peer)?;
        } else if header.n < self.recv_n {
            return Err(CryptoError::RatchetStep(format!(
                "message {} already received or its key was evicted",
                header.n
            )));
        }

        self.stash_skipped(header.n)?;
        let mk = advance_chain(&mut self.recv_ck)?;
        self.recv_n += 1;
        Ok(mk)
    }

    /// New receiving chain from the peer's key, then a fresh ratchet key of
    /// our own and a new sending chain.
    fn dh_step(&mut self, peer: X25519Public) -> Result<(), CryptoError> {
        let current = StaticSecret::from(self.dh_send_secret);
        self.recv_ck = self.mix_root(&current, &peer)?;
        self.dh_recv_pub = Some(peer);
        self.recv_n = 0;

        let next = StaticSecret::random_from_rng(OsRng);
        self.send_ck = self.mix_root(&next, &peer)?;
        self.prev_send_n = std::mem::replace(&mut self.send_n, 0);
        self.dh_send_pub = X25519Public::from(&next);
        self.dh_send_secret = next.to_bytes();
        Ok(())
    }

    /// Mix DH(ours, theirs) into the root key; returns the new chain key.
    fn mix_root(&mut self, ours: &StaticSecret, theirs: &X25519Public) -> Result<[u8; 32], CryptoError> {
        let shared = ours.diffie_hellman(theirs);
        let (root_key, chain_key) = kdf_rk(&self.root_key, shared.as_bytes())?;
        self.root_key = root_key;
        Ok(chain_key)
    }

    /// Keep keys for receiving-chain messages `recv_n..until` that have not
    /// arrived yet. The oldest entries are dropped past `MAX_SKIP`.
    fn stash_skipped(&mut self, until: u64) -> Result<(), CryptoError> {
        if until <= self.recv_n {
            return Ok(());
        }
        let gap = until - self.recv_n;
        if gap > MAX_SKIP {
            return Err(CryptoError::RatchetStep(format!(
                "too many skipped messages ({gap} > {MAX_SKIP})"
            )));
        }

        let chain = self.dh_recv_pub.as_ref().map(encode_public).unwrap_or_default();
        for n in self.recv_n..until {
            let mk = advance_chain(&mut self.recv_ck)?;
            self.skipped_keys.insert(skipped_key_id(&chain, n), mk);
        }
        self.recv_n = until;

        let excess = self.skipped_keys.len().saturating_sub(MAX_SKIP as usize);
        let evicted: Vec<String> = self.skipped_keys.keys().take(excess).cloned().collect();
        for id in evicted {
            if let Some(mut mk) = self.skipped_keys.remove(&id) {
                mk.zeroize();
            }
        }
        Ok(())
    }
}

// ── KDF helpers ──────────────────────────────────────────────────────────────

/// KDF_RK: (root key, DH output) → (next root key, chain key).
fn kdf_rk(rk: &[u8; 32], dh_output: &[u8]) -> Result<([u8; 32], [u8; 32]), CryptoError> {
    let hk = hkdf::Hkdf::<sha2::Sha256>::new(Some(rk), dh_output);
    let mut okm = [0u8; 64];
    hk.expand(b"dl-ratchet-root", &mut okm)
        .map_err(|e| CryptoError::KeyDerivation(e.to_string()))?;
    let mut root = [0u8; 32];
    let mut chain = [0u8; 32];
    root.copy_from_slice(&okm[..32]);
    chain.copy_from_slice(&okm[32..]);
    okm.zeroize();
    Ok((root, chain))
}

/// KDF_CK: chain key → (next chain key, message key), HMAC-SHA256 with
/// the constant bytes 0x02 and 0x01.
pub(crate) fn kdf_ck(ck: &[u8; 32]) -> Result<([u8; 32], [u8; 32]), CryptoError> {
    use hmac::{Hmac, Mac};

    let derive = |constant: u8| -> Result<[u8; 32], CryptoError> {
        let mut mac = <Hmac<sha2::Sha256>>::new_from_slice(ck)
            .map_err(|e| CryptoError::KeyDerivation(e.to_string()))?;
        mac.update(&[constant]);
        Ok(mac.finalize().into_bytes().into())
    };
    Ok((derive(0x02)?, derive(0x01)?))
}

/// Step `chain` forward in place and return the message key it yielded.
fn advance_chain(chain: &mut [u8; 32]) -> Result<[u8; 32], CryptoError> {
    let (next, mk) = kdf_ck(chain)?;
    *chain = next;
    Ok(mk)
}

mod public_key_b64 {
    use serde::{de::Error, Deserialize, Deserializer, Serializer};
    use x25519_dalek::PublicKey;

    pub fn serialize<S: Serializer>(key: &PublicKey, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&super::encode_public(key))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<PublicKey, D::Error> {
        super::parse_public(&String::deserialize(d)?).map_err(D::Error::custom)
    }

    pub mod option {
        use serde::{de::Error, Deserialize, Deserializer, Serializer};
        use x25519_dalek::PublicKey;

        use super::super::{encode_public, parse_public};

        pub fn serialize<S: Serializer>(key: &Option<PublicKey>, s: S) -> Result<S::Ok, S::Error> {
            match key {
                Some(key) => s.serialize_some(&encode_public(key)),
                None => s.serialize_none(),
            }
        }

        pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<PublicKey>, D::Error> {
            Option::<String>::deserialize(d)?
                .map(|b64| parse_public(&b64).map_err(D::Error::custom))
                .transpose()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pair(shared_key: [u8; 32]) -> (RatchetSession, RatchetSession) {
        let bob_spk = StaticSecret::random_from_rng(OsRng);
        let bob_spk_pub = X25519Public::from(&bob_spk);
        let alice = RatchetSession::initiate("sess".into(), shared_key, &bob_spk_pub).unwrap();
        let bob = RatchetSession::respond("sess".into(), shared_key, &bob_spk);
        (alice, bob)
    }

    #[test]
    fn full_ratchet_roundtrip() {
        let (mut alice, mut bob) = pair([42u8; 32]);

        for i in 0..3 {
            let (header, mk_alice) = alice.encrypt_step().unwrap();
            let mk_bob = bob.decrypt_step(&header).unwrap();
            assert_eq!(mk_alice, mk_bob, "message {i}: keys must match");
        }

        // Bob replies (triggers DH ratchet)
        for i in 0..2 {
            let (header, mk_bob) = bob.encrypt_step().unwrap();
            let mk_alice = alice.decrypt_step(&header).unwrap();
            assert_eq!(mk_bob, mk_alice, "bob message {i}: keys must match");
        }

        let (header, mk_a) = alice.encrypt_step().unwrap();
        let mk_b = bob.decrypt_step(&header).unwrap();
        assert_eq!(mk_a, mk_b);
    }

    #[test]
    fn out_of_order_messages() {
        let (mut alice, mut bob) = pair([99u8; 32]);

        let (h0, mk0) = alice.encrypt_step().unwrap();
        let (h1, mk1) = alice.encrypt_step().unwrap();
        let (h2, mk2) = alice.encrypt_step().unwrap();

        assert_eq!(mk2, bob.decrypt_step(&h2).unwrap());
        assert_eq!(mk0, bob.decrypt_step(&h0).unwrap());
        assert_eq!(mk1, bob.decrypt_step(&h1).unwrap());
    }

    #[test]
    fn responder_cannot_send_first() {
        let (_alice, mut bob) = pair([1u8; 32]);
        assert!(!bob.can_send());
        assert!(bob.encrypt_step().is_err());
    }

    #[test]
    fn replayed_header_is_rejected() {
        let (mut alice, mut bob) = pair([5u8; 32]);
        let (h0, _) = alice.encrypt_step().unwrap();
        bob.decrypt_step(&h0).unwrap();
        assert!(bob.decrypt_step(&h0).is_err());
    }

    #[test]
    fn state_survives_serde_with_skipped_keys() {
        let (mut alice, mut bob) = pair([8u8; 32]);
        let (h0, mk0) = alice.encrypt_step().unwrap();
        let (h1, _) = alice.encrypt_step().unwrap();
        bob.decrypt_step(&h1).unwrap();

        let json = serde_json::to_vec(&bob).unwrap();
        let mut restored: RatchetSession = serde_json::from_slice(&json).unwrap();
        assert_eq!(mk0, restored.decrypt_step(&h0).unwrap());
    }
}
