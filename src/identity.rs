// Device identity (§3 SyncDevice, §5 key material): an ed25519 keypair and a
// stable device id persisted under `config.keys_dir()`, generated once and
// reused across process restarts. The fingerprint (SHA-256 of the raw public
// key, hex) is the trust anchor peers pin against during pairing.

use crate::config::Config;
use crate::error::{Error, Result};
use ed25519_dalek::{Signer, SigningKey, VerifyingKey};
use rand::rngs::OsRng;
use rand::RngCore;
use sha2::{Digest, Sha256};
use std::fs;
use std::path::{Path, PathBuf};
use uuid::Uuid;

const SIGNING_KEY_FILE: &str = "signing_key";
const DEVICE_ID_FILE: &str = "device_id";

#[derive(Clone)]
pub struct DeviceIdentity {
    pub device_id: String,
    signing_key: SigningKey,
}

impl DeviceIdentity {
    pub fn verifying_key(&self) -> VerifyingKey {
        self.signing_key.verifying_key()
    }

    /// SHA-256 of the raw 32-byte public key, hex-encoded — the canonical
    /// fingerprint form peers compare during pairing and every sync request.
    pub fn fingerprint(&self) -> String {
        fingerprint_of(&self.verifying_key())
    }

    /// Base64 (standard, no padding stripped) encoding of the raw public key,
    /// suitable for the pairing payload and `X-Codemem-*` auth headers.
    pub fn public_key_base64(&self) -> String {
        use base64::Engine;
        base64::engine::general_purpose::STANDARD.encode(self.verifying_key().to_bytes())
    }

    pub fn sign(&self, message: &[u8]) -> [u8; 64] {
        self.signing_key.sign(message).to_bytes()
    }
}

pub fn fingerprint_of(key: &VerifyingKey) -> String {
    let mut hasher = Sha256::new();
    hasher.update(key.to_bytes());
    hex::encode(hasher.finalize())
}

pub fn decode_public_key(base64_key: &str) -> Result<VerifyingKey> {
    use base64::Engine;
    let bytes = base64::engine::general_purpose::STANDARD
        .decode(base64_key)
        .map_err(|e| Error::InvalidInput(format!("invalid public key encoding: {e}")))?;
    let bytes: [u8; 32] = bytes
        .try_into()
        .map_err(|_| Error::InvalidInput("public key must be 32 bytes".to_string()))?;
    VerifyingKey::from_bytes(&bytes).map_err(|e| Error::InvalidInput(format!("invalid public key: {e}")))
}

#[cfg(unix)]
fn write_private_file(path: &Path, contents: &[u8]) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    fs::write(path, contents)?;
    fs::set_permissions(path, fs::Permissions::from_mode(0o600))?;
    Ok(())
}

#[cfg(not(unix))]
fn write_private_file(path: &Path, contents: &[u8]) -> Result<()> {
    fs::write(path, contents)?;
    Ok(())
}

/// Load the device identity from `config.keys_dir()`, generating a fresh
/// ed25519 keypair and device id on first run. Idempotent: a second call
/// against the same directory returns the same identity.
pub fn load_or_create(config: &Config) -> Result<DeviceIdentity> {
    let keys_dir = config.keys_dir();
    fs::create_dir_all(&keys_dir)?;

    let key_path = keys_dir.join(SIGNING_KEY_FILE);
    let device_id_path = keys_dir.join(DEVICE_ID_FILE);

    let signing_key = if key_path.exists() {
        load_signing_key(&key_path)?
    } else {
        let mut seed = [0u8; 32];
        OsRng.fill_bytes(&mut seed);
        let key = SigningKey::from_bytes(&seed);
        write_private_file(&key_path, &key.to_bytes())?;
        key
    };

    let device_id = if device_id_path.exists() {
        fs::read_to_string(&device_id_path)?.trim().to_string()
    } else {
        let id = Uuid::new_v4().to_string();
        write_private_file(&device_id_path, id.as_bytes())?;
        id
    };

    Ok(DeviceIdentity { device_id, signing_key })
}

fn load_signing_key(path: &PathBuf) -> Result<SigningKey> {
    let raw = fs::read(path)?;
    let bytes: [u8; 32] = raw
        .try_into()
        .map_err(|_| Error::Other(format!("corrupt signing key at {}", path.display())))?;
    Ok(SigningKey::from_bytes(&bytes))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn config_in(dir: &TempDir) -> Config {
        let mut config = Config::default();
        config.data_dir = dir.path().to_path_buf();
        config
    }

    #[test]
    fn load_or_create_persists_across_calls() {
        let dir = TempDir::new().unwrap();
        let config = config_in(&dir);

        let first = load_or_create(&config).unwrap();
        let second = load_or_create(&config).unwrap();

        assert_eq!(first.device_id, second.device_id);
        assert_eq!(first.fingerprint(), second.fingerprint());
    }

    #[test]
    fn different_directories_yield_different_identities() {
        let dir_a = TempDir::new().unwrap();
        let dir_b = TempDir::new().unwrap();

        let a = load_or_create(&config_in(&dir_a)).unwrap();
        let b = load_or_create(&config_in(&dir_b)).unwrap();

        assert_ne!(a.device_id, b.device_id);
        assert_ne!(a.fingerprint(), b.fingerprint());
    }

    #[test]
    fn public_key_round_trips_through_base64() {
        let dir = TempDir::new().unwrap();
        let identity = load_or_create(&config_in(&dir)).unwrap();

        let decoded = decode_public_key(&identity.public_key_base64()).unwrap();
        assert_eq!(decoded, identity.verifying_key());
    }

    #[cfg(unix)]
    #[test]
    fn signing_key_file_is_private() {
        use std::os::unix::fs::PermissionsExt;
        let dir = TempDir::new().unwrap();
        let config = config_in(&dir);
        load_or_create(&config).unwrap();

        let meta = fs::metadata(config.keys_dir().join(SIGNING_KEY_FILE)).unwrap();
        assert_eq!(meta.permissions().mode() & 0o777, 0o600);
    }
}
