//! Key lifecycle and at-rest encryption.
//!
//! Two keys back the store: a 16-byte data key (AES-128-GCM) for bulk
//! encryption of metadata, the user directory, and audit lines, and a
//! long-lived 32-byte master key (AES-256-GCM) that wraps key material and
//! other small envelopes. Every ciphertext is `nonce ‖ ct ‖ tag` with a
//! fresh random 96-bit nonce.
//!
//! Key files live under the builtin directory and are written with mode
//! 0600. Missing key files cause fresh generation at first boot.

use std::fs;
use std::path::{Path, PathBuf};

use aes_gcm::aead::consts::U12;
use aes_gcm::aead::{Aead, AeadCore, KeyInit};
use aes_gcm::{Aes128Gcm, Aes256Gcm, Key, Nonce};
use rand::RngCore;
use zeroize::{Zeroize, ZeroizeOnDrop};

use sudb_common::{SudbError, SudbResult};

/// Length of the bulk data key in bytes.
pub const DATA_KEY_LEN: usize = 16;
/// Length of the master (wrapping) key in bytes.
pub const MASTER_KEY_LEN: usize = 32;
/// GCM nonce length in bytes.
pub const NONCE_LEN: usize = 12;
/// GCM authentication tag length in bytes.
pub const TAG_LEN: usize = 16;

/// Master key file name under the builtin directory.
pub const MASTER_KEY_FILE: &str = "key.sudb.pri";
/// Data key file name under the builtin directory.
pub const DATA_KEY_FILE: &str = "key.sudb.sm4";

#[derive(Clone, Zeroize, ZeroizeOnDrop)]
struct DataKey([u8; DATA_KEY_LEN]);

#[derive(Clone, Zeroize, ZeroizeOnDrop)]
struct MasterKey([u8; MASTER_KEY_LEN]);

/// Holds both ciphers plus the raw key bytes needed for persistence.
pub struct CryptoManager {
    data_cipher: Aes128Gcm,
    master_cipher: Aes256Gcm,
    data_key: DataKey,
    master_key: MasterKey,
}

impl std::fmt::Debug for CryptoManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CryptoManager")
            .field("data_key", &"[REDACTED]")
            .field("master_key", &"[REDACTED]")
            .finish()
    }
}

impl CryptoManager {
    /// Generate a fresh key pair without persisting it.
    pub fn generate() -> Self {
        let mut data = [0u8; DATA_KEY_LEN];
        let mut master = [0u8; MASTER_KEY_LEN];
        rand::thread_rng().fill_bytes(&mut data);
        rand::thread_rng().fill_bytes(&mut master);
        Self::from_raw(MasterKey(master), DataKey(data))
    }

    fn from_raw(master_key: MasterKey, data_key: DataKey) -> Self {
        let data_cipher = Aes128Gcm::new(Key::<Aes128Gcm>::from_slice(&data_key.0));
        let master_cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&master_key.0));
        Self {
            data_cipher,
            master_cipher,
            data_key,
            master_key,
        }
    }

    /// Load keys from `dir`, generating and persisting a fresh pair when the
    /// master key file is absent. The data key file must hold exactly 16
    /// bytes.
    pub fn load_or_generate(dir: &Path) -> SudbResult<Self> {
        let master_path = dir.join(MASTER_KEY_FILE);
        if !master_path.exists() {
            tracing::info!("key material absent, generating fresh keys in {:?}", dir);
            let manager = Self::generate();
            manager.save_keys(dir)?;
            return Ok(manager);
        }

        let master_bytes = fs::read(&master_path)?;
        if master_bytes.len() != MASTER_KEY_LEN {
            return Err(SudbError::Integrity(format!(
                "master key file holds {} bytes, expected {MASTER_KEY_LEN}",
                master_bytes.len()
            )));
        }
        let data_path = dir.join(DATA_KEY_FILE);
        let data_bytes = fs::read(&data_path)?;
        if data_bytes.len() != DATA_KEY_LEN {
            return Err(SudbError::Integrity(format!(
                "data key file holds {} bytes, expected {DATA_KEY_LEN}",
                data_bytes.len()
            )));
        }

        let mut master = [0u8; MASTER_KEY_LEN];
        master.copy_from_slice(&master_bytes);
        let mut data = [0u8; DATA_KEY_LEN];
        data.copy_from_slice(&data_bytes);
        Ok(Self::from_raw(MasterKey(master), DataKey(data)))
    }

    /// Persist both keys under `dir` with restrictive permissions.
    pub fn save_keys(&self, dir: &Path) -> SudbResult<()> {
        fs::create_dir_all(dir)?;
        write_secret(&dir.join(MASTER_KEY_FILE), &self.master_key.0)?;
        write_secret(&dir.join(DATA_KEY_FILE), &self.data_key.0)?;
        Ok(())
    }

    /// Encrypt with the bulk data key. Output: `nonce ‖ ct ‖ tag`.
    pub fn encrypt(&self, plaintext: &[u8]) -> SudbResult<Vec<u8>> {
        seal(&self.data_cipher, plaintext)
    }

    /// Decrypt a blob produced by [`encrypt`](Self::encrypt).
    pub fn decrypt(&self, blob: &[u8]) -> SudbResult<Vec<u8>> {
        open(&self.data_cipher, blob)
    }

    /// Wrap an envelope under the long-lived master key.
    pub fn wrap(&self, plaintext: &[u8]) -> SudbResult<Vec<u8>> {
        seal(&self.master_cipher, plaintext)
    }

    /// Open an envelope produced by [`wrap`](Self::wrap).
    pub fn open_wrapped(&self, blob: &[u8]) -> SudbResult<Vec<u8>> {
        open(&self.master_cipher, blob)
    }
}

fn seal<C>(cipher: &C, plaintext: &[u8]) -> SudbResult<Vec<u8>>
where
    C: Aead + AeadCore<NonceSize = U12>,
{
    let mut nonce_bytes = [0u8; NONCE_LEN];
    rand::thread_rng().fill_bytes(&mut nonce_bytes);
    let nonce = Nonce::from_slice(&nonce_bytes);

    let ciphertext = cipher
        .encrypt(nonce, plaintext)
        .map_err(|_| SudbError::Internal("加密失败".into()))?;

    let mut out = Vec::with_capacity(NONCE_LEN + ciphertext.len());
    out.extend_from_slice(&nonce_bytes);
    out.extend_from_slice(&ciphertext);
    Ok(out)
}

fn open<C>(cipher: &C, blob: &[u8]) -> SudbResult<Vec<u8>>
where
    C: Aead + AeadCore<NonceSize = U12>,
{
    if blob.len() < NONCE_LEN + TAG_LEN {
        return Err(SudbError::Integrity("密文太短".into()));
    }
    let nonce = Nonce::from_slice(&blob[..NONCE_LEN]);
    cipher
        .decrypt(nonce, &blob[NONCE_LEN..])
        .map_err(|_| SudbError::Integrity("解密失败".into()))
}

fn write_secret(path: &PathBuf, bytes: &[u8]) -> SudbResult<()> {
    fs::write(path, bytes)?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(path, fs::Permissions::from_mode(0o600))?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_encrypt_decrypt_roundtrip() {
        let cm = CryptoManager::generate();
        for data in [
            &b""[..],
            b"short",
            &[0xAB; DATA_KEY_LEN],  // exactly one block
            &[0x42; 4096],
        ] {
            let blob = cm.encrypt(data).unwrap();
            assert_eq!(cm.decrypt(&blob).unwrap(), data);
        }
    }

    #[test]
    fn test_ciphertext_differs_per_call() {
        let cm = CryptoManager::generate();
        let a = cm.encrypt(b"same plaintext").unwrap();
        let b = cm.encrypt(b"same plaintext").unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn test_wrap_roundtrip() {
        let cm = CryptoManager::generate();
        let blob = cm.wrap(b"key material").unwrap();
        assert_eq!(cm.open_wrapped(&blob).unwrap(), b"key material");
        // An envelope is not a data-key blob.
        assert!(cm.decrypt(&blob).is_err());
    }

    #[test]
    fn test_tampered_ciphertext_rejected() {
        let cm = CryptoManager::generate();
        let mut blob = cm.encrypt(b"payload").unwrap();
        let last = blob.len() - 1;
        blob[last] ^= 0xFF;
        assert!(cm.decrypt(&blob).is_err());
    }

    #[test]
    fn test_too_short_blob_rejected() {
        let cm = CryptoManager::generate();
        assert!(cm.decrypt(&[0u8; 10]).is_err());
    }

    #[test]
    fn test_wrong_key_rejected() {
        let a = CryptoManager::generate();
        let b = CryptoManager::generate();
        let blob = a.encrypt(b"secret").unwrap();
        assert!(b.decrypt(&blob).is_err());
    }

    #[test]
    fn test_first_boot_generates_and_persists() {
        let dir = TempDir::new().unwrap();
        let cm = CryptoManager::load_or_generate(dir.path()).unwrap();
        assert!(dir.path().join(MASTER_KEY_FILE).exists());
        assert_eq!(
            std::fs::read(dir.path().join(DATA_KEY_FILE)).unwrap().len(),
            DATA_KEY_LEN
        );

        // A reload decrypts what the first instance encrypted.
        let blob = cm.encrypt(b"persisted").unwrap();
        let reloaded = CryptoManager::load_or_generate(dir.path()).unwrap();
        assert_eq!(reloaded.decrypt(&blob).unwrap(), b"persisted");
    }

    #[test]
    fn test_short_data_key_file_rejected() {
        let dir = TempDir::new().unwrap();
        CryptoManager::load_or_generate(dir.path()).unwrap();
        std::fs::write(dir.path().join(DATA_KEY_FILE), [0u8; 8]).unwrap();
        assert!(CryptoManager::load_or_generate(dir.path()).is_err());
    }

    #[cfg(unix)]
    #[test]
    fn test_key_files_are_0600() {
        use std::os::unix::fs::PermissionsExt;
        let dir = TempDir::new().unwrap();
        CryptoManager::load_or_generate(dir.path()).unwrap();
        for file in [MASTER_KEY_FILE, DATA_KEY_FILE] {
            let mode = std::fs::metadata(dir.path().join(file))
                .unwrap()
                .permissions()
                .mode();
            assert_eq!(mode & 0o777, 0o600, "{file} should be 0600");
        }
    }
}
