//! Encrypted environment handoff for new-terminal launches
//!
//! The environment is sealed with ChaCha20-Poly1305 under a fresh key per launch. The
//! file holds `base64(nonce || ciphertext)`; the key travels only on the runner's
//! command line. The runner deletes the file as soon as it has read it.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use base64::Engine;
use base64::engine::general_purpose::{STANDARD, URL_SAFE_NO_PAD};
use chacha20poly1305::aead::{Aead, AeadCore, KeyInit, OsRng};
use chacha20poly1305::{ChaCha20Poly1305, Key, Nonce};

use sdk_core::SdkPaths;

use crate::error::SupervisionError;

const KEY_LEN: usize = 32;
const NONCE_LEN: usize = 12;

/// `component_datadirs/<type>/<id>.encrypted.env`
pub fn env_file_path(paths: &SdkPaths, component_type: &str, id: &str) -> PathBuf {
    paths
        .component_type_datadirs(component_type)
        .join(format!("{id}.encrypted.env"))
}

fn err(message: impl ToString) -> SupervisionError {
    SupervisionError::EnvFile(message.to_string())
}

/// Seal `env` into `path`; returns the key for the command line
pub fn write_encrypted(path: &Path, env: &BTreeMap<String, String>) -> Result<String, SupervisionError> {
    let key = ChaCha20Poly1305::generate_key(&mut OsRng);
    let cipher = ChaCha20Poly1305::new(&key);
    let nonce = ChaCha20Poly1305::generate_nonce(&mut OsRng);

    let plaintext = serde_json::to_vec(env).map_err(err)?;
    let ciphertext = cipher.encrypt(&nonce, plaintext.as_ref()).map_err(err)?;

    let mut sealed = Vec::with_capacity(NONCE_LEN + ciphertext.len());
    sealed.extend_from_slice(nonce.as_slice());
    sealed.extend_from_slice(&ciphertext);

    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, STANDARD.encode(sealed))?;
    Ok(URL_SAFE_NO_PAD.encode(key.as_slice()))
}

/// Read, delete, then open the sealed environment at `path`
pub fn read_and_delete(path: &Path, key: &str) -> Result<BTreeMap<String, String>, SupervisionError> {
    let content = std::fs::read_to_string(path)?;
    if let Err(e) = std::fs::remove_file(path) {
        tracing::warn!("Failed to delete {}: {}", path.display(), e);
    }

    let key = URL_SAFE_NO_PAD.decode(key.trim()).map_err(err)?;
    if key.len() != KEY_LEN {
        return Err(err(format!("key must be {KEY_LEN} bytes, got {}", key.len())));
    }
    let sealed = STANDARD.decode(content.trim()).map_err(err)?;
    if sealed.len() < NONCE_LEN {
        return Err(err("sealed environment is truncated"));
    }
    let (nonce, ciphertext) = sealed.split_at(NONCE_LEN);

    let cipher = ChaCha20Poly1305::new(Key::from_slice(&key));
    let plaintext = cipher
        .decrypt(Nonce::from_slice(nonce), ciphertext)
        .map_err(|_| err("decryption failed"))?;
    serde_json::from_slice(&plaintext).map_err(err)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn env() -> BTreeMap<String, String> {
        BTreeMap::from([
            ("DB_DIRECTORY".to_string(), "/sdk/electrumx1".to_string()),
            ("API_TOKEN".to_string(), "s3cr3t".to_string()),
        ])
    }

    #[test]
    fn test_sealed_file_hides_values_and_is_deleted() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("electrumx/electrumx1.encrypted.env");
        let key = write_encrypted(&path, &env()).unwrap();

        let on_disk = std::fs::read_to_string(&path).unwrap();
        assert!(!on_disk.contains("s3cr3t"));

        assert_eq!(read_and_delete(&path, &key).unwrap(), env());
        assert!(!path.exists());
    }

    #[test]
    fn test_wrong_key_fails() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("x.encrypted.env");
        write_encrypted(&path, &env()).unwrap();
        let other = URL_SAFE_NO_PAD.encode([7u8; KEY_LEN]);
        assert!(matches!(read_and_delete(&path, &other), Err(SupervisionError::EnvFile(_))));
        // the file is gone even though decryption failed
        assert!(!path.exists());
    }

    #[test]
    fn test_malformed_key_is_rejected() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("x.encrypted.env");
        write_encrypted(&path, &env()).unwrap();
        assert!(matches!(read_and_delete(&path, "c2hvcnQ"), Err(SupervisionError::EnvFile(_))));
    }

    #[test]
    fn test_path_layout() {
        let paths = SdkPaths::at("/sdk", Path::new("/cwd"), Path::new("/bin"));
        assert_eq!(
            env_file_path(&paths, "electrumx", "electrumx1"),
            PathBuf::from("/sdk/component_datadirs/electrumx/electrumx1.encrypted.env")
        );
    }
}
