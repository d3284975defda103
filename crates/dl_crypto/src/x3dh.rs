//! X3DH asynchronous key agreement.
//!
//! References:
//!   - Signal X3DH spec: <https://signal.org/docs/specifications/x3dh/>
//!   - RFC 7748 (X25519): <https://datatracker.ietf.org/doc/html/rfc7748>
//!   - RFC 5869 (HKDF):  <https://datatracker.ietf.org/doc/html/rfc5869>
//!
//! Protocol:
//!   Alice (initiator) holds Bob's fetched pre-key bundle:
//!     IK_B  (identity, Ed25519 public → converted to X25519)
//!     SPK_B (signed prekey, X25519) + IK_B signature over SPK_B
//!     OPK_B (optional one-time prekey, X25519)
//!
//!   Alice generates ONE ephemeral keypair EK_A (X25519).
//!
//! ```text
//!     DH1 = DH(IK_A_x25519, SPK_B)
//!     DH2 = DH(EK_A,         IK_B_x25519)
//!     DH3 = DH(EK_A,         SPK_B)
//!     DH4 = DH(EK_A,         OPK_B)   [optional]
//!
//!   SK = HKDF(salt=0, ikm = 0xFF*32 || DH1 || DH2 || DH3 [|| DH4], info="dl-x3dh-v1")
//! ```
//!
//!   Alice MUST verify the SPK_B signature before computing any DH.
//!   The init header (IK_A, EK_A, spk id, opk id) travels with every
//!   pre-key message until Bob answers.

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use x25519_dalek::{PublicKey as X25519Public, StaticSecret};
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::{error::CryptoError, identity::IdentityKeyPair, kdf};

// ── Helpers ──────────────────────────────────────────────────────────────────

pub(crate) fn b64d(s: &str) -> Result<Vec<u8>, CryptoError> {
    URL_SAFE_NO_PAD.decode(s).map_err(CryptoError::Base64Decode)
}

pub(crate) fn to_32(bytes: &[u8]) -> Result<[u8; 32], CryptoError> {
    bytes
        .try_into()
        .map_err(|_| CryptoError::InvalidKey("expected 32-byte key".into()))
}

pub(crate) fn x25519_from_b64(s: &str) -> Result<X25519Public, CryptoError> {
    Ok(X25519Public::from(to_32(&b64d(s)?)?))
}

/// Convert an Ed25519 signing key (32 bytes) to an X25519 static secret.
/// Uses the clamped SHA-512 expansion that ed25519-dalek uses internally.
pub fn ed25519_secret_to_x25519(ed_secret: &[u8; 32]) -> StaticSecret {
    use sha2::{Digest, Sha512};
    let mut h = Sha512::digest(ed_secret);
    // Clamp as per RFC 7748 §5
    h[0] &= 248;
    h[31] &= 127;
    h[31] |= 64;
    let mut key = [0u8; 32];
    key.copy_from_slice(&h[..32]);
    h.as_mut_slice().zeroize();
    StaticSecret::from(key)
}

/// Convert an Ed25519 verifying key (public, 32 bytes) to an X25519 public key.
/// Uses the birational map from the Ed25519 curve to Curve25519.
pub fn ed25519_pub_to_x25519(ed_pub: &[u8; 32]) -> Result<X25519Public, CryptoError> {
    use curve25519_dalek::edwards::CompressedEdwardsY;
    let compressed = CompressedEdwardsY::from_slice(ed_pub)
        .map_err(|_| CryptoError::InvalidKey("invalid Ed25519 public key".into()))?;
    let point = compressed.decompress().ok_or_else(|| {
        CryptoError::InvalidKey("Ed25519 public key decompression failed".into())
    })?;
    Ok(X25519Public::from(point.to_montgomery().to_bytes()))
}

// ── Local pre-key records ────────────────────────────────────────────────────

/// One-time pre-key as persisted by the owner. Consumed by the first
/// pre-key message that references it.
#[derive(Clone, Serialize, Deserialize, ZeroizeOnDrop)]
pub struct PreKeyRecord {
    #[zeroize(skip)]
    pub id: u32,
    secret: [u8; 32],
    #[zeroize(skip)]
    pub public: String,
}

impl PreKeyRecord {
    pub fn generate(id: u32) -> Self {
        let secret = StaticSecret::random_from_rng(OsRng);
        let public = X25519Public::from(&secret);
        Self {
            id,
            secret: secret.to_bytes(),
            public: URL_SAFE_NO_PAD.encode(public.as_bytes()),
        }
    }

    pub fn secret(&self) -> StaticSecret {
        StaticSecret::from(self.secret)
    }

    pub fn serialize(&self) -> Result<Vec<u8>, CryptoError> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn deserialize(bytes: &[u8]) -> Result<Self, CryptoError> {
        Ok(serde_json::from_slice(bytes)?)
    }
}

/// Generate a contiguous batch of one-time pre-keys starting at `start_id`.
pub fn generate_pre_keys(start_id: u32, count: u32) -> Vec<PreKeyRecord> {
    (0..count)
        .map(|i| PreKeyRecord::generate(start_id.wrapping_add(i)))
        .collect()
}

/// Signed pre-key: an X25519 keypair whose public half is signed by the
/// account's Ed25519 identity key.
#[derive(Clone, Serialize, Deserialize, ZeroizeOnDrop)]
pub struct SignedPreKeyRecord {
    #[zeroize(skip)]
    pub id: u32,
    secret: [u8; 32],
    #[zeroize(skip)]
    pub public: String,
    #[zeroize(skip)]
    pub signature: String,
}

impl SignedPreKeyRecord {
    pub fn generate(identity: &IdentityKeyPair, id: u32) -> Self {
        let secret = StaticSecret::random_from_rng(OsRng);
        let public = X25519Public::from(&secret);
        let sig = identity.sign(public.as_bytes());
        Self {
            id,
            secret: secret.to_bytes(),
            public: URL_SAFE_NO_PAD.encode(public.as_bytes()),
            signature: URL_SAFE_NO_PAD.encode(sig),
        }
    }

    pub fn secret(&self) -> StaticSecret {
        StaticSecret::from(self.secret)
    }

    pub fn serialize(&self) -> Result<Vec<u8>, CryptoError> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn deserialize(bytes: &[u8]) -> Result<Self, CryptoError> {
        Ok(serde_json::from_slice(bytes)?)
    }
}

// ── Pre-key bundle ───────────────────────────────────────────────────────────

/// Published by each device, fetched by session initiators.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PreKeyBundle {
    pub registration_id: u32,
    pub device_id: u32,
    /// Ed25519 identity public key (base64)
    pub identity_key: String,
    pub signed_pre_key_id: u32,
    /// X25519 signed prekey (base64)
    pub signed_pre_key: String,
    /// Ed25519 signature over raw signed prekey bytes (base64)
    pub signed_pre_key_signature: String,
    pub pre_key_id: Option<u32>,
    /// X25519 one-time prekey (base64)
    pub pre_key: Option<String>,
}

impl PreKeyBundle {
    /// Assemble the bundle a device would publish for its own keys.
    pub fn from_local(
        registration_id: u32,
        device_id: u32,
        identity: &IdentityKeyPair,
        signed_pre_key: &SignedPreKeyRecord,
        pre_key: Option<&PreKeyRecord>,
    ) -> Self {
        Self {
            registration_id,
            device_id,
            identity_key: identity.public_b64(),
            signed_pre_key_id: signed_pre_key.id,
            signed_pre_key: signed_pre_key.public.clone(),
            signed_pre_key_signature: signed_pre_key.signature.clone(),
            pre_key_id: pre_key.map(|k| k.id),
            pre_key: pre_key.map(|k| k.public.clone()),
        }
    }
}

// ── Init header ──────────────────────────────────────────────────────────────

/// Carried by every pre-key message so the responder can derive SK.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct X3DHHeader {
    pub registration_id: u32,
    /// Initiator's Ed25519 identity public key (base64)
    pub identity_key: String,
    /// Initiator's ephemeral X25519 public key (base64)
    pub base_key: String,
    pub signed_pre_key_id: u32,
    /// Which OPK was consumed (`None` if the bundle had none)
    pub pre_key_id: Option<u32>,
}

/// Result of the initiator side of the handshake.
pub struct X3DHResult {
    /// 32-byte shared key → initial root key of the double ratchet
    pub shared_key: [u8; 32],
    pub header: X3DHHeader,
    /// Responder's signed prekey, the first remote ratchet key
    pub their_signed_pre_key: X25519Public,
}

impl Drop for X3DHResult {
    fn drop(&mut self) {
        self.shared_key.zeroize();
    }
}

// ── Initiator (Alice) ────────────────────────────────────────────────────────

pub fn initiate(
    my_ik: &IdentityKeyPair,
    my_registration_id: u32,
    bundle: &PreKeyBundle,
) -> Result<X3DHResult, CryptoError> {
    // ── 1. Verify SPK signature ──────────────────────────────────────────
    let ik_b_ed = to_32(&b64d(&bundle.identity_key)?)?;
    let spk_b_raw = to_32(&b64d(&bundle.signed_pre_key)?)?;
    let spk_sig_bytes = b64d(&bundle.signed_pre_key_signature)?;
    IdentityKeyPair::verify(&ik_b_ed, &spk_b_raw, &spk_sig_bytes)?;

    // ── 2. Convert identity keys to X25519 ───────────────────────────────
    let ik_a_x = ed25519_secret_to_x25519(my_ik.secret_bytes());
    let ik_b_x = ed25519_pub_to_x25519(&ik_b_ed)?;
    let spk_b = X25519Public::from(spk_b_raw);

    // ── 3. Ephemeral key ─────────────────────────────────────────────────
    let ek_a = StaticSecret::random_from_rng(OsRng);
    let ek_a_pub = X25519Public::from(&ek_a);

    // ── 4. DH calculations (single EK for all) ──────────────────────────
    let dh1 = ik_a_x.diffie_hellman(&spk_b);
    let dh2 = ek_a.diffie_hellman(&ik_b_x);
    let dh3 = ek_a.diffie_hellman(&spk_b);

    let mut ikm = vec![0xFFu8; 32];
    ikm.extend_from_slice(dh1.as_bytes());
    ikm.extend_from_slice(dh2.as_bytes());
    ikm.extend_from_slice(dh3.as_bytes());

    let mut pre_key_id = None;
    if let (Some(opk_b64), Some(opk_id)) = (&bundle.pre_key, bundle.pre_key_id) {
        let opk_b = x25519_from_b64(opk_b64)?;
        let dh4 = ek_a.diffie_hellman(&opk_b);
        ikm.extend_from_slice(dh4.as_bytes());
        pre_key_id = Some(opk_id);
    }

    // ── 5. Derive SK ─────────────────────────────────────────────────────
    let mut sk = [0u8; 32];
    kdf::hkdf_expand(&ikm, Some(&[0u8; 32]), b"dl-x3dh-v1", &mut sk)?;
    ikm.zeroize();

    Ok(X3DHResult {
        shared_key: sk,
        header: X3DHHeader {
            registration_id: my_registration_id,
            identity_key: my_ik.public_b64(),
            base_key: URL_SAFE_NO_PAD.encode(ek_a_pub.as_bytes()),
            signed_pre_key_id: bundle.signed_pre_key_id,
            pre_key_id,
        },
        their_signed_pre_key: spk_b,
    })
}

// ── Responder (Bob) ──────────────────────────────────────────────────────────

/// Reconstruct SK from an init header. The initiator's identity key is
/// taken from the header itself.
pub fn respond(
    my_ik: &IdentityKeyPair,
    my_spk_secret: &StaticSecret,
    my_opk_secret: Option<&StaticSecret>,
    header: &X3DHHeader,
) -> Result<[u8; 32], CryptoError> {
    let ek_a = x25519_from_b64(&header.base_key)?;
    let sender_ik_ed = to_32(&b64d(&header.identity_key)?)?;
    let sender_ik_x = ed25519_pub_to_x25519(&sender_ik_ed)?;
    let ik_b_x = ed25519_secret_to_x25519(my_ik.secret_bytes());

    // Mirror Alice's DH order exactly (DH is commutative).
    let dh1 = my_spk_secret.diffie_hellman(&sender_ik_x);
    let dh2 = ik_b_x.diffie_hellman(&ek_a);
    let dh3 = my_spk_secret.diffie_hellman(&ek_a);

    let mut ikm = vec![0xFFu8; 32];
    ikm.extend_from_slice(dh1.as_bytes());
    ikm.extend_from_slice(dh2.as_bytes());
    ikm.extend_from_slice(dh3.as_bytes());

    match (header.pre_key_id, my_opk_secret) {
        (Some(_), Some(opk_sec)) => {
            let dh4 = opk_sec.diffie_hellman(&ek_a);
            ikm.extend_from_slice(dh4.as_bytes());
        }
        (Some(id), None) => {
            ikm.zeroize();
            return Err(CryptoError::UnknownPreKey(id));
        }
        _ => {}
    }

    let mut sk = [0u8; 32];
    kdf::hkdf_expand(&ikm, Some(&[0u8; 32]), b"dl-x3dh-v1", &mut sk)?;
    ikm.zeroize();

    Ok(sk)
}
