use std::path::Path;

use rand::RngCore;
use tracing::info;

/// Load the raw 32-byte miner key from a hex keystore file, generating one
/// on first start. An unreadable or malformed keystore is fatal: the caller
/// aborts before any networking starts.
pub fn load_or_generate(path: &Path) -> anyhow::Result<[u8; 32]> {
    if path.exists() {
        let raw = std::fs::read_to_string(path)
            .map_err(|e| anyhow::anyhow!("keystore unreadable {}: {e}", path.display()))?;
        let bytes = hex::decode(raw.trim())
            .map_err(|e| anyhow::anyhow!("keystore not hex {}: {e}", path.display()))?;
        let key: [u8; 32] = bytes
            .try_into()
            .map_err(|_| anyhow::anyhow!("keystore {} must hold 32 bytes", path.display()))?;
        return Ok(key);
    }

    let mut key = [0u8; 32];
    rand::rngs::OsRng.fill_bytes(&mut key);
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, hex::encode(key))?;
    info!(path = %path.display(), "generated new miner keystore");
    Ok(key)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generate_then_reload() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("miner.key");
        let first = load_or_generate(&path).unwrap();
        let second = load_or_generate(&path).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn test_malformed_keystore_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("miner.key");
        std::fs::write(&path, "not-hex").unwrap();
        assert!(load_or_generate(&path).is_err());
    }
}
