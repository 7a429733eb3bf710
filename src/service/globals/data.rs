use ed25519_dalek::SigningKey;

use crate::Result;

/// This server's signing keypair and its advertised key ID.
#[derive(Clone)]
pub struct SigningKeys {
    pub key: SigningKey,
    pub key_id: String,
}

impl SigningKeys {
    pub fn generate() -> Self {
        let seed: [u8; 32] = rand::random();
        Self {
            key: SigningKey::from_bytes(&seed),
            key_id: format!("ed25519:{}", crate::utils::random_string(8)),
        }
    }
}

pub trait Data: Send + Sync {
    /// Advances the global event-index counter and returns the new value.
    fn next_count(&self) -> Result<u64>;

    /// The current value of the event-index counter.
    fn current_count(&self) -> Result<u64>;

    /// Loads the persisted signing keypair, generating one on first start.
    fn load_keypair(&self) -> Result<SigningKeys>;

    fn remove_keypair(&self) -> Result<()>;
}
