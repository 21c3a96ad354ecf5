use std::{
    io::ErrorKind,
    path::{Path, PathBuf},
};

use anyhow::{Context, Result, anyhow};
use libp2p::identity::Keypair;

const KEY_DIR: &str = ".crowdnode";

/// `~/.crowdnode/<component>.key`.
pub fn default_key_path(component: &str) -> Result<PathBuf> {
    let home = std::env::var_os("HOME").ok_or_else(|| anyhow!("$HOME is not set"))?;
    Ok(PathBuf::from(home)
        .join(KEY_DIR)
        .join(format!("{component}.key")))
}

/// Load the keypair stored at `path`, creating an Ed25519 one on first run.
///
/// The file holds the protobuf encoding and is written owner-only.
pub fn load_or_generate(path: &Path) -> Result<Keypair> {
    let (keypair, origin) = match std::fs::read(path) {
        Ok(bytes) => (decode(path, &bytes)?, "loaded"),
        Err(e) if e.kind() == ErrorKind::NotFound => (create(path)?, "generated"),
        Err(e) => {
            return Err(e).with_context(|| format!("reading identity from {}", path.display()));
        }
    };
    tracing::info!(
        peer_id = %keypair.public().to_peer_id(),
        path = %path.display(),
        "{origin} identity"
    );
    Ok(keypair)
}

fn decode(path: &Path, bytes: &[u8]) -> Result<Keypair> {
    Keypair::from_protobuf_encoding(bytes)
        .with_context(|| format!("decoding identity from {}", path.display()))
}

fn create(path: &Path) -> Result<Keypair> {
    let keypair = Keypair::generate_ed25519();
    let encoded = keypair.to_protobuf_encoding().context("encoding identity")?;
    if let Some(dir) = path.parent().filter(|dir| !dir.as_os_str().is_empty()) {
        std::fs::create_dir_all(dir)
            .with_context(|| format!("creating key directory {}", dir.display()))?;
    }
    write_private(path, &encoded)
        .with_context(|| format!("writing identity to {}", path.display()))?;
    Ok(keypair)
}

#[cfg(unix)]
fn write_private(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    use std::{io::Write, os::unix::fs::OpenOptionsExt};

    let mut file = std::fs::OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .mode(0o600)
        .open(path)?;
    file.write_all(bytes)
}

#[cfg(not(unix))]
fn write_private(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    std::fs::write(path, bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reload_yields_same_peer_id() {
        let dir = tempfile::tempdir().expect("create temp directory");
        let path = dir.path().join("worker.key");

        let first = load_or_generate(&path).expect("generate identity");
        let second = load_or_generate(&path).expect("reload identity");
        assert_eq!(first.public().to_peer_id(), second.public().to_peer_id());
    }

    #[test]
    fn creates_missing_parent_directories() {
        let dir = tempfile::tempdir().expect("create temp directory");
        let path = dir.path().join(".crowdnode/consumer.key");

        assert!(!path.exists());
        let keypair = load_or_generate(&path).expect("generate identity in subdir");
        assert!(path.exists());
        assert_eq!(keypair.key_type(), libp2p::identity::KeyType::Ed25519);
    }

    #[cfg(unix)]
    #[test]
    fn key_file_is_owner_only() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().expect("create temp directory");
        let path = dir.path().join("dht.key");
        load_or_generate(&path).expect("generate identity");
        let mode = std::fs::metadata(&path).expect("stat key file").permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }

    #[test]
    fn corrupt_key_file_is_an_error() {
        let dir = tempfile::tempdir().expect("create temp directory");
        let path = dir.path().join("broken.key");
        std::fs::write(&path, b"not a key").expect("write garbage");
        assert!(load_or_generate(&path).is_err());
    }

    #[test]
    fn directory_in_place_of_key_is_an_error() {
        let dir = tempfile::tempdir().expect("create temp directory");
        assert!(load_or_generate(dir.path()).is_err());
    }

    #[test]
    fn key_file_holds_protobuf_encoding() {
        let dir = tempfile::tempdir().expect("create temp directory");
        let path = dir.path().join("worker.key");
        let first = load_or_generate(&path).expect("generate identity");
        let bytes = std::fs::read(&path).expect("read key file");
        assert_eq!(bytes, first.to_protobuf_encoding().expect("encode identity"));
    }

    #[test]
    fn default_path_names_component() {
        match std::env::var_os("HOME") {
            Some(_) => {
                let path = default_key_path("worker").expect("HOME is set");
                assert!(path.ends_with(".crowdnode/worker.key"));
            }
            None => assert!(default_key_path("worker").is_err()),
        }
    }
}
