//! The SQLite-backed keystore.

use std::path::Path;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use palisade_core::{CredentialId, Provider};
use palisade_crypto::{MasterKey, SealedBox, open, seal, sealed_from_parts};
use rusqlite::{Connection, OptionalExtension, params};
use zeroize::Zeroizing;

use crate::error::{KeystoreError, KeystoreResult};
use crate::types::{CredentialRecord, DecryptedCredential, NewCredential, SecretMaterial};

/// Plaintext sealed into the key-check sentinel at store creation.
const KEYCHECK_PLAINTEXT: &[u8] = b"palisade-keycheck-v1";

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS credentials (
    id           TEXT PRIMARY KEY,
    provider     TEXT NOT NULL,
    ciphertext   BLOB NOT NULL,
    nonce        BLOB NOT NULL,
    display_name TEXT,
    tags         TEXT NOT NULL DEFAULT '[]',
    expires_at   TEXT,
    created_at   TEXT NOT NULL
);
CREATE TABLE IF NOT EXISTS keycheck (
    id         INTEGER PRIMARY KEY CHECK (id = 1),
    nonce      BLOB NOT NULL,
    ciphertext BLOB NOT NULL
);
";

/// Encrypted credential store.
///
/// All operations go through one connection behind a mutex, which gives the
/// per-id write serialization the rest of the bridge relies on. Keystore
/// operations are in-process and fast; callers on the async side treat them
/// as cheap blocking calls.
pub struct Keystore {
    conn: Mutex<Connection>,
    key: MasterKey,
}

impl std::fmt::Debug for Keystore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Keystore").finish_non_exhaustive()
    }
}

impl Keystore {
    /// Open or create the keystore at `path`.
    ///
    /// Creates the schema on first use and writes a key-check sentinel
    /// sealed under `key`. On later opens the sentinel must decrypt; if it
    /// does not, the keystore belongs to a different master key and the
    /// daemon must not serve.
    ///
    /// # Errors
    ///
    /// [`KeystoreError::OpenFailed`] on filesystem/schema failures,
    /// [`KeystoreError::BadMasterKey`] when the sentinel does not decrypt.
    pub fn open(path: impl AsRef<Path>, key: MasterKey) -> KeystoreResult<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| KeystoreError::OpenFailed(format!("{}: {e}", parent.display())))?;
        }

        let conn = Connection::open(path)
            .map_err(|e| KeystoreError::OpenFailed(format!("{}: {e}", path.display())))?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            if let Ok(metadata) = std::fs::metadata(path) {
                let mut perms = metadata.permissions();
                perms.set_mode(0o600);
                let _ = std::fs::set_permissions(path, perms);
            }
        }

        Self::init(conn, key)
    }

    /// Open an in-memory keystore (tests).
    ///
    /// # Errors
    ///
    /// Returns an error if schema creation fails.
    pub fn open_in_memory(key: MasterKey) -> KeystoreResult<Self> {
        let conn = Connection::open_in_memory()
            .map_err(|e| KeystoreError::OpenFailed(e.to_string()))?;
        Self::init(conn, key)
    }

    fn init(conn: Connection, key: MasterKey) -> KeystoreResult<Self> {
        conn.execute_batch(SCHEMA)
            .map_err(|e| KeystoreError::OpenFailed(e.to_string()))?;

        let sentinel: Option<(Vec<u8>, Vec<u8>)> = conn
            .query_row("SELECT nonce, ciphertext FROM keycheck WHERE id = 1", [], |row| {
                Ok((row.get(0)?, row.get(1)?))
            })
            .optional()?;

        match sentinel {
            Some((nonce, ciphertext)) => {
                let sealed = sealed_from_parts(&nonce, ciphertext)
                    .map_err(|_| KeystoreError::BadMasterKey)?;
                let opened = open(&key, &sealed).map_err(|_| KeystoreError::BadMasterKey)?;
                if opened != KEYCHECK_PLAINTEXT {
                    return Err(KeystoreError::BadMasterKey);
                }
            },
            None => {
                let sealed = seal(&key, KEYCHECK_PLAINTEXT)?;
                conn.execute(
                    "INSERT INTO keycheck (id, nonce, ciphertext) VALUES (1, ?1, ?2)",
                    params![sealed.nonce.as_slice(), sealed.ciphertext],
                )?;
                tracing::info!("Initialized keystore with a fresh key-check sentinel");
            },
        }

        Ok(Self {
            conn: Mutex::new(conn),
            key,
        })
    }

    /// Store a credential.
    ///
    /// Seals the token (plus any additional material) under a fresh nonce.
    /// With `replace` the row is overwritten; without it a duplicate id is
    /// an error.
    ///
    /// # Errors
    ///
    /// [`KeystoreError::Duplicate`] on id collision without `replace`;
    /// database and sealing failures otherwise.
    pub fn store(&self, credential: NewCredential, replace: bool) -> KeystoreResult<CredentialId> {
        let material = SecretMaterial {
            token: credential.token.to_string(),
            additional: credential.additional.clone(),
        };
        let plaintext = Zeroizing::new(
            serde_json::to_vec(&material).map_err(|e| KeystoreError::Corrupt(e.to_string()))?,
        );
        let sealed: SealedBox = seal(&self.key, &plaintext)?;

        let tags_json = serde_json::to_string(&credential.tags)
            .map_err(|e| KeystoreError::Corrupt(e.to_string()))?;

        let conn = self.lock();
        if !replace {
            let exists: Option<i64> = conn
                .query_row(
                    "SELECT 1 FROM credentials WHERE id = ?1",
                    params![credential.id.as_str()],
                    |row| row.get(0),
                )
                .optional()?;
            if exists.is_some() {
                return Err(KeystoreError::Duplicate { id: credential.id });
            }
        }

        conn.execute(
            "INSERT OR REPLACE INTO credentials
                 (id, provider, ciphertext, nonce, display_name, tags, expires_at, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                credential.id.as_str(),
                credential.provider.as_str(),
                sealed.ciphertext,
                sealed.nonce.as_slice(),
                credential.display_name,
                tags_json,
                credential.expires_at.map(|t| t.to_rfc3339()),
                Utc::now().to_rfc3339(),
            ],
        )?;

        tracing::info!(id = %credential.id, provider = %credential.provider, "Stored credential");
        Ok(credential.id)
    }

    /// Decrypt and return a credential.
    ///
    /// The returned plaintext lives only as long as the caller keeps it; the
    /// holder zeroizes on drop. Callers are expected to audit this access.
    ///
    /// # Errors
    ///
    /// [`KeystoreError::NotFound`] for unknown ids;
    /// [`KeystoreError::DecryptFailed`] when the row does not decrypt.
    pub fn get(&self, id: &CredentialId) -> KeystoreResult<DecryptedCredential> {
        let conn = self.lock();
        let row = conn
            .query_row(
                "SELECT provider, ciphertext, nonce, display_name, tags, expires_at, created_at
                 FROM credentials WHERE id = ?1",
                params![id.as_str()],
                |row| {
                    Ok(RawRow {
                        provider: row.get(0)?,
                        ciphertext: row.get(1)?,
                        nonce: row.get(2)?,
                        display_name: row.get(3)?,
                        tags: row.get(4)?,
                        expires_at: row.get(5)?,
                        created_at: row.get(6)?,
                    })
                },
            )
            .optional()?
            .ok_or_else(|| KeystoreError::NotFound { id: id.clone() })?;
        drop(conn);

        let record = row.record(id)?;

        let sealed = sealed_from_parts(&row.nonce, row.ciphertext.clone())
            .map_err(|_| KeystoreError::DecryptFailed { id: id.clone() })?;
        let plaintext = Zeroizing::new(
            open(&self.key, &sealed).map_err(|_| KeystoreError::DecryptFailed { id: id.clone() })?,
        );
        let material: SecretMaterial = serde_json::from_slice(&plaintext)
            .map_err(|_| KeystoreError::DecryptFailed { id: id.clone() })?;

        Ok(DecryptedCredential {
            record,
            token: Zeroizing::new(material.token.clone()),
            additional: material.additional.clone(),
        })
    }

    /// Fetch one credential's metadata without decrypting anything.
    ///
    /// # Errors
    ///
    /// [`KeystoreError::NotFound`] for unknown ids.
    pub fn metadata(&self, id: &CredentialId) -> KeystoreResult<CredentialRecord> {
        let conn = self.lock();
        let raw = conn
            .query_row(
                "SELECT provider, display_name, tags, expires_at, created_at
                 FROM credentials WHERE id = ?1",
                params![id.as_str()],
                |row| {
                    Ok(RawRow {
                        provider: row.get(0)?,
                        ciphertext: Vec::new(),
                        nonce: Vec::new(),
                        display_name: row.get(1)?,
                        tags: row.get(2)?,
                        expires_at: row.get(3)?,
                        created_at: row.get(4)?,
                    })
                },
            )
            .optional()?
            .ok_or_else(|| KeystoreError::NotFound { id: id.clone() })?;
        raw.record(id)
    }

    /// List credential metadata, never plaintext.
    ///
    /// # Errors
    ///
    /// Returns database errors.
    pub fn list(&self) -> KeystoreResult<Vec<CredentialRecord>> {
        let conn = self.lock();
        let mut stmt = conn.prepare(
            "SELECT id, provider, display_name, tags, expires_at, created_at
             FROM credentials ORDER BY created_at",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok((
                row.get::<_, String>(0)?,
                RawRow {
                    provider: row.get(1)?,
                    ciphertext: Vec::new(),
                    nonce: Vec::new(),
                    display_name: row.get(2)?,
                    tags: row.get(3)?,
                    expires_at: row.get(4)?,
                    created_at: row.get(5)?,
                },
            ))
        })?;

        let mut records = Vec::new();
        for row in rows {
            let (id, raw) = row?;
            records.push(raw.record(&CredentialId::from(id))?);
        }
        Ok(records)
    }

    /// Delete a credential. Idempotent.
    ///
    /// # Errors
    ///
    /// Returns database errors.
    pub fn delete(&self, id: &CredentialId) -> KeystoreResult<bool> {
        let conn = self.lock();
        let changed = conn.execute("DELETE FROM credentials WHERE id = ?1", params![id.as_str()])?;
        if changed > 0 {
            tracing::info!(id = %id, "Deleted credential");
        }
        Ok(changed > 0)
    }

    /// Whether a credential with `id` exists.
    ///
    /// # Errors
    ///
    /// Returns database errors.
    pub fn contains(&self, id: &CredentialId) -> KeystoreResult<bool> {
        let conn = self.lock();
        let exists: Option<i64> = conn
            .query_row(
                "SELECT 1 FROM credentials WHERE id = ?1",
                params![id.as_str()],
                |row| row.get(0),
            )
            .optional()?;
        Ok(exists.is_some())
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Connection> {
        self.conn
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

/// One row as it comes off the database, before decryption.
struct RawRow {
    provider: String,
    ciphertext: Vec<u8>,
    nonce: Vec<u8>,
    display_name: Option<String>,
    tags: String,
    expires_at: Option<String>,
    created_at: String,
}

impl RawRow {
    fn record(&self, id: &CredentialId) -> KeystoreResult<CredentialRecord> {
        let provider: Provider = self
            .provider
            .parse()
            .map_err(|e: palisade_core::provider::UnknownProvider| {
                KeystoreError::Corrupt(e.to_string())
            })?;
        let tags: Vec<String> = serde_json::from_str(&self.tags)
            .map_err(|e| KeystoreError::Corrupt(e.to_string()))?;
        let expires_at = self
            .expires_at
            .as_deref()
            .map(parse_rfc3339)
            .transpose()?;
        let created_at = parse_rfc3339(&self.created_at)?;

        Ok(CredentialRecord {
            id: id.clone(),
            provider,
            display_name: self.display_name.clone(),
            tags,
            expires_at,
            created_at,
        })
    }
}

fn parse_rfc3339(s: &str) -> KeystoreResult<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| KeystoreError::Corrupt(format!("bad timestamp {s}: {e}")))
}
