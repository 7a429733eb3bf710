use ed25519_dalek::SigningKey;

use crate::{
    database::KeyValueDatabase,
    service::{self, globals::SigningKeys},
    utils, Error, Result,
};

const COUNTER: &[u8] = b"counter";
const KEYPAIR: &[u8] = b"keypair";

impl service::globals::Data for KeyValueDatabase {
    fn next_count(&self) -> Result<u64> {
        utils::u64_from_bytes(&self.global.increment(COUNTER)?)
            .map_err(|_| Error::bad_database("Count has invalid bytes."))
    }

    fn current_count(&self) -> Result<u64> {
        self.global.get(COUNTER)?.map_or(Ok(0), |bytes| {
            utils::u64_from_bytes(&bytes)
                .map_err(|_| Error::bad_database("Count has invalid bytes."))
        })
    }

    fn load_keypair(&self) -> Result<SigningKeys> {
        match self.global.get(KEYPAIR)? {
            Some(bytes) => {
                let mut parts = bytes.splitn(2, |&b| b == super::SEP);
                let key_id = parts
                    .next()
                    .map(|id| utils::string_from_bytes(id))
                    .transpose()
                    .map_err(|_| Error::bad_database("Invalid key id in keypair."))?
                    .ok_or_else(|| Error::bad_database("Invalid keypair format in database."))?;
                let seed: [u8; 32] = parts
                    .next()
                    .and_then(|seed| seed.try_into().ok())
                    .ok_or_else(|| Error::bad_database("Invalid keypair format in database."))?;

                Ok(SigningKeys {
                    key: SigningKey::from_bytes(&seed),
                    key_id,
                })
            }
            None => {
                let keypair = SigningKeys::generate();
                let mut value = keypair.key_id.as_bytes().to_vec();
                value.push(super::SEP);
                value.extend_from_slice(&keypair.key.to_bytes());
                self.global.insert(KEYPAIR, &value)?;
                Ok(keypair)
            }
        }
    }

    fn remove_keypair(&self) -> Result<()> {
        self.global.remove(KEYPAIR)
    }
}
