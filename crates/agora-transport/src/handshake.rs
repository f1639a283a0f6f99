//! JSON handshake exchanged before any frame.
//!
//! Three lines, each side proving it holds the key behind its `peer_id`:
//!
//! 1. dialer → acceptor: [`Hello`] with a fresh nonce.
//! 2. acceptor → dialer: its own [`Hello`] with a fresh nonce and a proof
//!    over the dialer's nonce.
//! 3. dialer → acceptor: [`Proof`] over the acceptor's nonce.
//!
//! An acceptor that does not speak the requested protocol closes the
//! connection without answering. Proofs are Ed25519 signatures over
//! [`challenge_bytes`], which binds the signer's role and the verifier's
//! identity so a proof cannot be replayed on another connection.

use ed25519_dalek::{Signature, Signer, SigningKey};
use futures_util::{SinkExt, StreamExt};
use rand::RngCore;
use serde::{Deserialize, Serialize};

use crate::host::{FrameReader, FrameWriter};
use crate::{PeerId, TransportError};

const DOMAIN: &[u8] = b"agora/handshake/1";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) struct Hello {
    pub protocol: String,
    pub peer_id: PeerId,
    /// Port the sender accepts connections on; the acceptor pairs it with
    /// the observed remote IP to learn a dialable address.
    pub listen_port: u16,
    /// Hex challenge the other side must sign.
    pub nonce: String,
    /// Hex signature over the dialer's nonce, set only in the answer.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub proof: Option<String>,
}

/// Last line of the handshake, sent by the dialer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) struct Proof {
    pub proof: String,
}

/// Which side of the connection produced a proof.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Role {
    Dialer,
    Acceptor,
}

impl Role {
    fn tag(self) -> u8 {
        match self {
            Role::Dialer => b'd',
            Role::Acceptor => b'a',
        }
    }
}

pub(crate) fn new_nonce() -> String {
    let mut nonce = [0u8; 32];
    rand::rng().fill_bytes(&mut nonce);
    hex::encode(nonce)
}

/// Bytes signed by `role` to answer `nonce`, issued by `verifier`.
pub(crate) fn challenge_bytes(role: Role, protocol: &str, nonce: &str, verifier: &PeerId) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(DOMAIN.len() + protocol.len() + nonce.len() + 35);
    bytes.extend_from_slice(DOMAIN);
    bytes.push(role.tag());
    bytes.extend_from_slice(&verifier.as_bytes());
    bytes.extend_from_slice(protocol.as_bytes());
    bytes.push(0);
    bytes.extend_from_slice(nonce.as_bytes());
    bytes
}

pub(crate) fn prove(
    key: &SigningKey,
    role: Role,
    protocol: &str,
    nonce: &str,
    verifier: &PeerId,
) -> String {
    let signature = key.sign(&challenge_bytes(role, protocol, nonce, verifier));
    hex::encode(signature.to_bytes())
}

/// Check that `signer` produced `proof` for the challenge `nonce`.
pub(crate) fn check(
    proof: &str,
    signer: &PeerId,
    role: Role,
    protocol: &str,
    nonce: &str,
    verifier: &PeerId,
) -> Result<(), TransportError> {
    let invalid = || TransportError::Handshake(format!("{signer} failed to prove its identity"));
    let bytes: [u8; 64] = hex::decode(proof)
        .ok()
        .and_then(|b| b.try_into().ok())
        .ok_or_else(invalid)?;
    signer
        .verifying_key()?
        .verify_strict(
            &challenge_bytes(role, protocol, nonce, verifier),
            &Signature::from_bytes(&bytes),
        )
        .map_err(|_| invalid())
}

/// Reject nonces that are not 32 hex-encoded bytes.
pub(crate) fn validate_nonce(nonce: &str) -> Result<(), TransportError> {
    match hex::decode(nonce) {
        Ok(bytes) if bytes.len() == 32 => Ok(()),
        _ => Err(TransportError::Handshake("malformed nonce".into())),
    }
}

pub(crate) async fn write_line<T: Serialize>(
    writer: &mut FrameWriter,
    message: &T,
) -> Result<(), TransportError> {
    let line = serde_json::to_string(message)
        .map_err(|e| TransportError::Handshake(format!("encode: {e}")))?;
    writer
        .send(line)
        .await
        .map_err(|e| TransportError::Handshake(format!("write: {e}")))
}

pub(crate) async fn read_line<T: for<'de> Deserialize<'de>>(
    reader: &mut FrameReader,
) -> Result<T, TransportError> {
    let line = reader
        .next()
        .await
        .ok_or_else(|| TransportError::Handshake("closed by remote".into()))?
        .map_err(|e| TransportError::Handshake(format!("read: {e}")))?;
    serde_json::from_str(&line).map_err(|e| TransportError::Handshake(format!("malformed line: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(seed: u8) -> (SigningKey, PeerId) {
        (SigningKey::from_bytes(&[seed; 32]), PeerId::from_secret_seed(&[seed; 32]))
    }

    #[test]
    fn hello_json_shape() {
        let hello = Hello {
            protocol: crate::ORDERS_PROTOCOL.into(),
            peer_id: PeerId::from_secret_seed(&[5u8; 32]),
            listen_port: 4001,
            nonce: new_nonce(),
            proof: None,
        };
        let json = serde_json::to_string(&hello).unwrap();
        assert!(!json.contains('\n'));
        assert!(!json.contains("proof"));
        assert!(json.contains("\"protocol\":\"/agora/orders/1.0.0\""));
        let back: Hello = serde_json::from_str(&json).unwrap();
        assert_eq!(back, hello);
    }

    #[test]
    fn hello_rejects_bad_peer_id() {
        let json = r#"{"protocol":"/agora/orders/1.0.0","peer_id":"nope","listen_port":1,"nonce":"00"}"#;
        assert!(serde_json::from_str::<Hello>(json).is_err());
    }

    #[test]
    fn nonces_are_fresh_and_well_formed() {
        let a = new_nonce();
        assert_ne!(a, new_nonce());
        assert!(validate_nonce(&a).is_ok());
        assert!(validate_nonce("abcd").is_err());
        assert!(validate_nonce(&"zz".repeat(32)).is_err());
    }

    #[test]
    fn proof_verifies_for_its_signer_only() {
        let (alice_key, alice) = key(1);
        let (_, bob) = key(2);
        let (mallory_key, _) = key(3);
        let nonce = new_nonce();

        let proof = prove(&alice_key, Role::Dialer, "/p", &nonce, &bob);
        assert!(check(&proof, &alice, Role::Dialer, "/p", &nonce, &bob).is_ok());

        let forged = prove(&mallory_key, Role::Dialer, "/p", &nonce, &bob);
        assert!(check(&forged, &alice, Role::Dialer, "/p", &nonce, &bob).is_err());
        assert!(check("00", &alice, Role::Dialer, "/p", &nonce, &bob).is_err());
    }

    #[test]
    fn proof_is_bound_to_role_nonce_and_verifier() {
        let (alice_key, alice) = key(1);
        let (_, bob) = key(2);
        let (_, carol) = key(3);
        let nonce = new_nonce();
        let proof = prove(&alice_key, Role::Acceptor, "/p", &nonce, &bob);

        // An acceptor answer reflected as a dialer proof.
        assert!(check(&proof, &alice, Role::Dialer, "/p", &nonce, &bob).is_err());
        assert!(check(&proof, &alice, Role::Acceptor, "/p", &new_nonce(), &bob).is_err());
        assert!(check(&proof, &alice, Role::Acceptor, "/p", &nonce, &carol).is_err());
        assert!(check(&proof, &alice, Role::Acceptor, "/q", &nonce, &bob).is_err());
    }
}
