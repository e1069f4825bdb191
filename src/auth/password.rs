use anyhow::Context;
use rand::{rngs::OsRng, RngCore};
use scrypt::{scrypt, Params};
use subtle::ConstantTimeEq;
use tracing::error;

const SALT_LEN: usize = 8;
const KEY_LEN: usize = 64;
const SCRYPT_R: u32 = 8;
const SCRYPT_P: u32 = 1;

/// Salted scrypt hashing. The stored form is `<hex key>.<hex salt>`, where
/// the salt's hex text (not its raw bytes) is what the KDF is salted with.
#[derive(Debug, Clone, Copy)]
pub struct PasswordHasher {
    params: Params,
}

impl PasswordHasher {
    pub fn new(log_n: u8) -> anyhow::Result<Self> {
        let params = Params::new(log_n, SCRYPT_R, SCRYPT_P, KEY_LEN)
            .map_err(|e| anyhow::anyhow!("invalid scrypt params: {e}"))?;
        Ok(Self { params })
    }

    pub fn hash_password(&self, plain: &str) -> anyhow::Result<String> {
        let mut salt = [0u8; SALT_LEN];
        OsRng.fill_bytes(&mut salt);
        let salt_hex = hex::encode(salt);
        let key = self.derive(plain, &salt_hex)?;
        Ok(format!("{}.{}", hex::encode(key), salt_hex))
    }

    pub fn verify_password(&self, stored: &str, plain: &str) -> anyhow::Result<bool> {
        let (key_hex, salt_hex) = stored
            .split_once('.')
            .context("stored password has no salt separator")?;
        let expected = hex::decode(key_hex).context("stored key is not hex")?;
        let derived = self.derive(plain, salt_hex)?;
        Ok(derived[..].ct_eq(&expected[..]).into())
    }

    fn derive(&self, plain: &str, salt_hex: &str) -> anyhow::Result<[u8; KEY_LEN]> {
        let mut key = [0u8; KEY_LEN];
        scrypt(plain.as_bytes(), salt_hex.as_bytes(), &self.params, &mut key).map_err(|e| {
            error!(error = %e, "scrypt derive error");
            anyhow::anyhow!(e.to_string())
        })?;
        Ok(key)
    }
}
