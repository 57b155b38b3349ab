//! Node identity.
//!
//! A random 32-byte node key kept hex-encoded in `<data_dir>/node_key`.
//! The PeerId is its SHA3-256 fingerprint, so it survives restarts.

use crate::types::PeerId;
use std::fs;
use std::io;
use std::path::Path;
use thiserror::Error;
use tracing::info;

pub const NODE_KEY_FILE: &str = "node_key";

#[derive(Error, Debug)]
pub enum IdentityError {
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    #[error("corrupt node key: {0}")]
    Corrupt(String),
}

pub fn load_or_generate(data_dir: &Path) -> Result<PeerId, IdentityError> {
    let path = data_dir.join(NODE_KEY_FILE);

    if path.exists() {
        let text = fs::read_to_string(&path)?;
        let mut key = [0u8; 32];
        hex::decode_to_slice(text.trim(), &mut key).map_err(|e| IdentityError::Corrupt(e.to_string()))?;
        return Ok(PeerId::from_public_key(&key));
    }

    fs::create_dir_all(data_dir)?;
    let key: [u8; 32] = rand::random();
    fs::write(&path, hex::encode(key))?;

    let id = PeerId::from_public_key(&key);
    info!("Generated node key {} at {}", id, path.display());
    Ok(id)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_dir(name: &str) -> std::path::PathBuf {
        let dir = std::env::temp_dir().join(format!("porlink-{}-{}", name, std::process::id()));
        let _ = fs::remove_dir_all(&dir);
        dir
    }

    #[test]
    fn test_identity_is_stable() {
        let dir = temp_dir("identity");
        let first = load_or_generate(&dir).unwrap();
        let second = load_or_generate(&dir).unwrap();
        assert_eq!(first, second);
        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn test_corrupt_key_is_reported() {
        let dir = temp_dir("corrupt");
        fs::create_dir_all(&dir).unwrap();
        fs::write(dir.join(NODE_KEY_FILE), "not hex").unwrap();
        assert!(matches!(load_or_generate(&dir), Err(IdentityError::Corrupt(_))));
        let _ = fs::remove_dir_all(&dir);
    }
}
