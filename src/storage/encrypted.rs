//! SQLite-backed blob store with AES-GCM encryption of every payload.
//! Key derived from a machine-bound secret plus the agent's entropy string.

use aes_gcm::{
    aead::{Aead, KeyInit},
    Aes256Gcm,
};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use rand::RngCore;
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use std::sync::Mutex;
use tracing::{debug, warn};

use super::{BlobKey, BlobStore};
use crate::error::StoreError;

const NONCE_LEN: usize = 12;
const KEY_LEN: usize = 32;
const MACHINE_SECRET_FILE: &str = "machine.key";

fn derive_key(secret: &[u8], entropy: &[u8]) -> [u8; KEY_LEN] {
    use ring::digest;
    let mut ctx = digest::Context::new(&digest::SHA256);
    ctx.update(secret);
    ctx.update(entropy);
    let h = ctx.finish();
    let mut out = [0u8; KEY_LEN];
    out[..h.as_ref().len().min(KEY_LEN)].copy_from_slice(h.as_ref());
    out
}

fn encrypt(key: &[u8; KEY_LEN], plaintext: &[u8]) -> Result<String, StoreError> {
    let cipher = Aes256Gcm::new_from_slice(key).map_err(|_| StoreError::Encryption)?;
    let mut nonce = [0u8; NONCE_LEN];
    rand::thread_rng().fill_bytes(&mut nonce);
    let ciphertext = cipher
        .encrypt((&nonce).into(), plaintext)
        .map_err(|_| StoreError::Encryption)?;
    let mut out = nonce.to_vec();
    out.extend(ciphertext);
    Ok(BASE64.encode(&out))
}

fn decrypt(key: &[u8; KEY_LEN], encoded: &str) -> Result<Vec<u8>, Box<dyn std::error::Error + Send + Sync>> {
    let raw = BASE64.decode(encoded)?;
    if raw.len() < NONCE_LEN {
        return Err("payload too short".into());
    }
    let (nonce, ct) = raw.split_at(NONCE_LEN);
    let cipher = Aes256Gcm::new_from_slice(key).map_err(|e| format!("{:?}", e))?;
    cipher
        .decrypt(nonce.into(), ct)
        .map_err(|_| "authentication failed".into())
}

/// Read the machine secret next to the database, creating it on first use.
fn load_or_create_machine_secret(dir: &Path) -> Result<Vec<u8>, StoreError> {
    let path = dir.join(MACHINE_SECRET_FILE);
    match std::fs::read(&path) {
        Ok(secret) if secret.len() == KEY_LEN => return Ok(secret),
        Ok(_) => warn!(path = %path.display(), "machine secret malformed, regenerating"),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => return Err(e.into()),
    }

    let mut secret = vec![0u8; KEY_LEN];
    rand::thread_rng().fill_bytes(&mut secret);
    std::fs::write(&path, &secret)?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o600))?;
    }
    debug!(path = %path.display(), "machine secret created");
    Ok(secret)
}

pub struct SqliteBlobStore {
    conn: Mutex<Connection>,
    key: [u8; KEY_LEN],
}

impl SqliteBlobStore {
    /// Open or create the store at `path`. The machine secret lives in the
    /// same directory.
    pub fn open(path: &Path, entropy: &[u8]) -> Result<Self, StoreError> {
        let dir = match path.parent() {
            Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
            _ => std::env::current_dir()?,
        };
        std::fs::create_dir_all(&dir)?;
        let secret = load_or_create_machine_secret(&dir)?;
        Self::open_with_secret(path, &secret, entropy)
    }

    /// Open with an explicit secret instead of the machine secret file.
    pub fn open_with_secret(path: &Path, secret: &[u8], entropy: &[u8]) -> Result<Self, StoreError> {
        let conn = Connection::open(path)?;
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS blobs (
                location TEXT NOT NULL,
                value_name TEXT NOT NULL,
                payload_enc TEXT NOT NULL,
                PRIMARY KEY (location, value_name)
            );
            "#,
        )?;
        Ok(Self {
            conn: Mutex::new(conn),
            key: derive_key(secret, entropy),
        })
    }

    fn read_encoded(&self, key: &BlobKey) -> Result<Option<String>, rusqlite::Error> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        conn.query_row(
            "SELECT payload_enc FROM blobs WHERE location = ?1 AND value_name = ?2",
            params![key.location, key.value_name],
            |row| row.get(0),
        )
        .optional()
    }
}

impl BlobStore for SqliteBlobStore {
    fn load(&self, key: &BlobKey) -> Option<Vec<u8>> {
        let encoded = match self.read_encoded(key) {
            Ok(Some(v)) => v,
            Ok(None) => return None,
            Err(e) => {
                warn!(key = %key, error = %e, "blob read failed");
                return None;
            }
        };
        match decrypt(&self.key, &encoded) {
            Ok(plain) if !plain.is_empty() => Some(plain),
            Ok(_) => None,
            Err(e) => {
                warn!(key = %key, error = %e, "blob could not be decrypted");
                None
            }
        }
    }

    fn save(&self, key: &BlobKey, bytes: &[u8]) -> Result<(), StoreError> {
        let enc = encrypt(&self.key, bytes)?;
        self.conn.lock().unwrap_or_else(|e| e.into_inner()).execute(
            "INSERT OR REPLACE INTO blobs (location, value_name, payload_enc) VALUES (?1, ?2, ?3)",
            params![key.location, key.value_name, enc],
        )?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key() -> BlobKey {
        BlobKey::new("SOFTWARE\\Test", "Blob")
    }

    #[test]
    fn roundtrip_and_overwrite() {
        let dir = tempfile::tempdir().unwrap();
        let store = SqliteBlobStore::open(&dir.path().join("store.db"), b"entropy").unwrap();
        assert_eq!(store.load(&key()), None);

        store.save(&key(), b"first").unwrap();
        store.save(&key(), b"second").unwrap();
        assert_eq!(store.load(&key()).as_deref(), Some(&b"second"[..]));
        assert_eq!(store.load(&BlobKey::new("SOFTWARE\\Test", "Other")), None);
    }

    #[test]
    fn payload_is_not_plaintext() {
        let dir = tempfile::tempdir().unwrap();
        let store = SqliteBlobStore::open(&dir.path().join("store.db"), b"entropy").unwrap();
        store.save(&key(), b"visible-marker").unwrap();
        let encoded = store.read_encoded(&key()).unwrap().unwrap();
        let raw = BASE64.decode(encoded).unwrap();
        assert!(!raw.windows(14).any(|w| w == b"visible-marker"));
    }

    #[test]
    fn wrong_entropy_reads_as_missing() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("store.db");
        SqliteBlobStore::open(&path, b"entropy-a")
            .unwrap()
            .save(&key(), b"payload")
            .unwrap();
        let other = SqliteBlobStore::open(&path, b"entropy-b").unwrap();
        assert_eq!(other.load(&key()), None);
    }

    #[test]
    fn machine_secret_is_reused() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("store.db");
        SqliteBlobStore::open(&path, b"e").unwrap().save(&key(), b"kept").unwrap();
        let reopened = SqliteBlobStore::open(&path, b"e").unwrap();
        assert_eq!(reopened.load(&key()).as_deref(), Some(&b"kept"[..]));
    }
}
