/// Client identity and its local persistence.
///
/// Identity file format (UTF-8, three lines):
///
/// ```text
/// <base64 username>
/// <client id, 32 hex digits>
/// <base64 PKCS#8 DER private key>
/// ```
///
/// The username is encoded because the server accepts any byte but NUL,
/// line breaks included.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use base64::{Engine as _, engine::general_purpose::STANDARD as BASE64};
use strongbox_crypto::{ClientKeypair, RsaOaepCipher};
use strongbox_types::models::ClientId;

use crate::error::{Result, TransferError};

/// Everything the client needs to reconnect without registering again.
#[derive(Debug, Clone)]
pub struct ClientIdentity {
    pub client_id: ClientId,
    pub username: String,
    pub keypair: ClientKeypair,
}

impl ClientIdentity {
    pub fn cipher(&self) -> RsaOaepCipher {
        RsaOaepCipher::new(self.keypair.clone())
    }
}

/// Where identities live between process restarts.
pub trait IdentityStore: Send + Sync {
    fn load(&self) -> Result<Option<ClientIdentity>>;
    fn save(&self, identity: &ClientIdentity) -> Result<()>;
}

/// Identity persisted as a small text file.
#[derive(Debug, Clone)]
pub struct FileIdentityStore {
    path: PathBuf,
}

impl FileIdentityStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl IdentityStore for FileIdentityStore {
    fn load(&self) -> Result<Option<ClientIdentity>> {
        let text = match fs::read_to_string(&self.path) {
            Ok(t) => t,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(TransferError::file(&self.path, e)),
        };
        parse_identity(&text)
            .map(Some)
            .map_err(|msg| TransferError::Config(format!("{}: {}", self.path.display(), msg)))
    }

    fn save(&self, identity: &ClientIdentity) -> Result<()> {
        let text = format!(
            "{}\n{}\n{}\n",
            BASE64.encode(identity.username.as_bytes()),
            identity.client_id.to_hex(),
            identity.keypair.to_base64()?
        );
        // Write-then-rename so a crash never leaves a half-written identity.
        let tmp = self.path.with_extension("tmp");
        if let Some(dir) = self.path.parent().filter(|d| !d.as_os_str().is_empty()) {
            fs::create_dir_all(dir).map_err(|e| TransferError::file(dir, e))?;
        }
        fs::write(&tmp, text).map_err(|e| TransferError::file(&tmp, e))?;
        fs::rename(&tmp, &self.path).map_err(|e| TransferError::file(&self.path, e))?;
        tracing::debug!(path = %self.path.display(), client_id = %identity.client_id, "identity saved");
        Ok(())
    }
}

fn parse_identity(text: &str) -> std::result::Result<ClientIdentity, String> {
    let mut lines = text.lines();
    let name_line = lines.next().filter(|l| !l.is_empty()).ok_or("missing username line")?;
    let username = BASE64
        .decode(name_line.trim())
        .ok()
        .and_then(|raw| String::from_utf8(raw).ok())
        .ok_or_else(|| format!("bad username {:?}", name_line))?;
    let id_line = lines.next().ok_or("missing client id line")?;
    let client_id =
        ClientId::from_hex(id_line.trim()).ok_or_else(|| format!("bad client id {:?}", id_line))?;
    let key_line = lines.next().ok_or("missing private key line")?;
    let keypair = ClientKeypair::from_base64(key_line).map_err(|e| e.to_string())?;
    Ok(ClientIdentity {
        client_id,
        username,
        keypair,
    })
}

/// In-process store, for embedders that persist elsewhere and for tests.
#[derive(Debug, Default)]
pub struct MemoryIdentityStore {
    slot: Mutex<Option<ClientIdentity>>,
}

impl MemoryIdentityStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(identity: ClientIdentity) -> Self {
        Self {
            slot: Mutex::new(Some(identity)),
        }
    }
}

impl IdentityStore for MemoryIdentityStore {
    fn load(&self) -> Result<Option<ClientIdentity>> {
        Ok(self.slot.lock().map_err(|_| poisoned())?.clone())
    }

    fn save(&self, identity: &ClientIdentity) -> Result<()> {
        *self.slot.lock().map_err(|_| poisoned())? = Some(identity.clone());
        Ok(())
    }
}

fn poisoned() -> TransferError {
    TransferError::Config("identity store lock poisoned".into())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_path(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("strongbox_identity_{}_{}", name, std::process::id()));
        let _ = fs::create_dir_all(&dir);
        dir.join("me.info")
    }

    #[test]
    fn file_store_roundtrip() {
        let path = temp_path("roundtrip");
        let _ = fs::remove_file(&path);
        let store = FileIdentityStore::new(&path);
        assert!(store.load().unwrap().is_none());

        let identity = ClientIdentity {
            client_id: ClientId::from_bytes([0x5C; 16]),
            username: "alice".into(),
            keypair: ClientKeypair::generate().unwrap(),
        };
        store.save(&identity).unwrap();

        let loaded = store.load().unwrap().unwrap();
        assert_eq!(loaded.client_id, identity.client_id);
        assert_eq!(loaded.username, identity.username);
        assert_eq!(
            loaded.keypair.to_pkcs8_der().unwrap(),
            identity.keypair.to_pkcs8_der().unwrap()
        );
        assert_eq!(loaded.keypair.public_key_der(), identity.keypair.public_key_der());
    }

    #[test]
    fn usernames_with_line_breaks_survive() {
        let path = temp_path("linebreaks");
        let store = FileIdentityStore::new(&path);
        let keypair = ClientKeypair::generate().unwrap();
        for name in ["ali\nce", "bob\r", "\r\n carol \t"] {
            let identity = ClientIdentity {
                client_id: ClientId::from_bytes([0x21; 16]),
                username: name.into(),
                keypair: keypair.clone(),
            };
            store.save(&identity).unwrap();
            let loaded = store.load().unwrap().unwrap();
            assert_eq!(loaded.username, name);
            assert_eq!(loaded.client_id, identity.client_id);
        }
        let text = fs::read_to_string(&path).unwrap();
        assert_eq!(text.lines().count(), 3);
    }

    #[test]
    fn malformed_file_is_config_error() {
        let path = temp_path("malformed");
        fs::write(&path, "YWxpY2U=\nnot-hex\nAAAA\n").unwrap();
        let err = FileIdentityStore::new(&path).load().unwrap_err();
        assert!(matches!(err, TransferError::Config(_)), "{:?}", err);

        fs::write(&path, "YWxpY2U=\n").unwrap();
        assert!(FileIdentityStore::new(&path).load().is_err());

        fs::write(&path, "alice!\n5c5c5c5c5c5c5c5c5c5c5c5c5c5c5c5c\nAAAA\n").unwrap();
        let err = FileIdentityStore::new(&path).load().unwrap_err();
        assert!(err.to_string().contains("bad username"), "{}", err);
    }

    #[test]
    fn memory_store_overwrites() {
        let store = MemoryIdentityStore::new();
        assert!(store.load().unwrap().is_none());
        let kp = ClientKeypair::generate().unwrap();
        for name in ["a", "b"] {
            store
                .save(&ClientIdentity {
                    client_id: ClientId::from_bytes([1; 16]),
                    username: name.into(),
                    keypair: kp.clone(),
                })
                .unwrap();
        }
        assert_eq!(store.load().unwrap().unwrap().username, "b");
    }
}
