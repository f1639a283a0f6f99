//! Node identity: an Ed25519 keypair persisted in storage.

use ed25519_dalek::{Signature, Signer, SigningKey, VerifyingKey};
use rand::RngCore;

use crate::error::StorageError;
use crate::storage::Storage;
use crate::types::{PeerId, KEYPAIR_KEY};

/// Signing identity of the local node.
pub trait IdentityProvider: Send + Sync {
    fn peer_id(&self) -> PeerId;

    /// 32-byte secret seed, also the HMAC key of order ids.
    fn secret_seed(&self) -> [u8; 32];

    /// Ed25519 signature over `bytes`.
    fn sign(&self, bytes: &[u8]) -> Vec<u8>;

    /// Strict Ed25519 verification of `signature` over `bytes` under `public_key`.
    fn verify(&self, public_key: &PeerId, signature: &[u8], bytes: &[u8]) -> bool {
        verify_signature(public_key, signature, bytes)
    }
}

/// Verify a 64-byte Ed25519 signature, rejecting non-canonical encodings.
pub fn verify_signature(public_key: &PeerId, signature: &[u8], bytes: &[u8]) -> bool {
    let Ok(sig_bytes) = <[u8; 64]>::try_from(signature) else {
        return false;
    };
    let Ok(verifying_key) = VerifyingKey::from_bytes(&public_key.as_bytes()) else {
        return false;
    };
    verifying_key
        .verify_strict(bytes, &Signature::from_bytes(&sig_bytes))
        .is_ok()
}

/// [`IdentityProvider`] holding the keypair in memory.
#[derive(Clone)]
pub struct NodeIdentity {
    signing_key: SigningKey,
}

impl NodeIdentity {
    pub fn from_seed(seed: [u8; 32]) -> Self {
        Self {
            signing_key: SigningKey::from_bytes(&seed),
        }
    }

    /// Fresh random identity, not persisted.
    pub fn generate() -> Self {
        let mut seed = [0u8; 32];
        rand::rng().fill_bytes(&mut seed);
        Self::from_seed(seed)
    }

    /// Identity stored in `storage`, created on first use.
    pub fn load_or_generate(storage: &dyn Storage) -> Result<Self, StorageError> {
        let (signing_key, _) = get_or_create_keypair(storage)?;
        Ok(Self { signing_key })
    }

    pub fn verifying_key(&self) -> VerifyingKey {
        self.signing_key.verifying_key()
    }
}

impl IdentityProvider for NodeIdentity {
    fn peer_id(&self) -> PeerId {
        PeerId::from_secret_seed(&self.signing_key.to_bytes())
    }

    fn secret_seed(&self) -> [u8; 32] {
        self.signing_key.to_bytes()
    }

    fn sign(&self, bytes: &[u8]) -> Vec<u8> {
        self.signing_key.sign(bytes).to_bytes().to_vec()
    }
}

impl std::fmt::Debug for NodeIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NodeIdentity")
            .field("peer_id", &self.peer_id())
            .finish_non_exhaustive()
    }
}

/// Load the node keypair from `storage`, generating and persisting it once.
pub fn get_or_create_keypair(
    storage: &dyn Storage,
) -> Result<(SigningKey, VerifyingKey), StorageError> {
    if let Some(stored) = storage.get(KEYPAIR_KEY)? {
        let seed: [u8; 32] = stored
            .as_slice()
            .try_into()
            .map_err(|_| StorageError::Codec(format!("keypair record has {} bytes", stored.len())))?;
        let signing_key = SigningKey::from_bytes(&seed);
        let verifying_key = signing_key.verifying_key();
        return Ok((signing_key, verifying_key));
    }

    let identity = NodeIdentity::generate();
    storage.put(KEYPAIR_KEY, &identity.secret_seed())?;
    tracing::info!(peer_id = %identity.peer_id(), "generated node keypair");
    Ok((identity.signing_key.clone(), identity.verifying_key()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStorage;

    #[test]
    fn sign_and_verify() {
        let id = NodeIdentity::from_seed([7u8; 32]);
        let sig = id.sign(b"payload");
        assert_eq!(sig.len(), 64);
        assert!(id.verify(&id.peer_id(), &sig, b"payload"));
        assert!(!id.verify(&id.peer_id(), &sig, b"payload!"));
    }

    #[test]
    fn verify_rejects_other_key() {
        let alice = NodeIdentity::from_seed([1u8; 32]);
        let bob = NodeIdentity::from_seed([2u8; 32]);
        let sig = alice.sign(b"data");
        assert!(!verify_signature(&bob.peer_id(), &sig, b"data"));
    }

    #[test]
    fn verify_rejects_wrong_length() {
        let id = NodeIdentity::from_seed([3u8; 32]);
        assert!(!verify_signature(&id.peer_id(), &[0u8; 10], b"data"));
        assert!(!verify_signature(&id.peer_id(), &[], b"data"));
    }

    #[test]
    fn peer_id_matches_transport_derivation() {
        let id = NodeIdentity::from_seed([4u8; 32]);
        assert_eq!(id.peer_id(), PeerId::from_secret_seed(&[4u8; 32]));
        assert_eq!(id.peer_id().as_bytes(), id.verifying_key().to_bytes());
    }

    #[test]
    fn keypair_is_created_once() {
        let storage = MemoryStorage::new();
        let (first, first_pub) = get_or_create_keypair(&storage).unwrap();
        let (second, second_pub) = get_or_create_keypair(&storage).unwrap();
        assert_eq!(first.to_bytes(), second.to_bytes());
        assert_eq!(first_pub, second_pub);
        assert_eq!(storage.len(), 1);

        let loaded = NodeIdentity::load_or_generate(&storage).unwrap();
        assert_eq!(loaded.verifying_key(), first_pub);
    }

    #[test]
    fn corrupt_keypair_is_reported() {
        let storage = MemoryStorage::new();
        storage.put(KEYPAIR_KEY, b"short").unwrap();
        assert!(matches!(
            get_or_create_keypair(&storage),
            Err(StorageError::Codec(_))
        ));
    }

    #[test]
    fn generated_identities_differ() {
        assert_ne!(
            NodeIdentity::generate().peer_id(),
            NodeIdentity::generate().peer_id()
        );
    }
}
