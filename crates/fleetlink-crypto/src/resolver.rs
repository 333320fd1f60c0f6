//! Peer identity to public key resolution.
//!
//! The resolver is the trust store: a session signature is only accepted if
//! the resolver returns a key for the claimed source. Two implementations:
//!
//! - [`InMemoryResolver`] for tests and for endpoints, which only ever need
//!   the server's key
//! - [`DirectoryResolver`], which persists one PEM file per identity so a
//!   server remembers enrolled endpoints across restarts

use std::{
    collections::HashMap,
    fs,
    io::ErrorKind,
    path::{Path, PathBuf},
    sync::{Arc, Mutex, PoisonError},
};

use rsa::RsaPublicKey;

use crate::{
    error::CryptoError,
    keys::{parse_public_key_pem, public_key_to_pem},
};

/// Capability mapping a peer identity to its public key.
///
/// Implementations must be safe to call concurrently from many connections.
pub trait PublicKeyResolver: Send + Sync {
    /// Key for `identity`, or `None` if unknown.
    fn get(&self, identity: &str) -> Result<Option<RsaPublicKey>, CryptoError>;

    /// Store `key` for `identity`, replacing any previous key.
    fn add(&self, identity: &str, key: &RsaPublicKey) -> Result<(), CryptoError>;

    /// Forget `identity`. Unknown identities are not an error.
    fn remove(&self, identity: &str) -> Result<(), CryptoError>;

    /// Forget everything.
    fn clear(&self) -> Result<(), CryptoError>;
}

/// Volatile resolver backed by a `HashMap`.
#[derive(Clone, Default)]
pub struct InMemoryResolver {
    keys: Arc<Mutex<HashMap<String, RsaPublicKey>>>,
}

impl InMemoryResolver {
    /// Empty resolver.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of known identities.
    pub fn len(&self) -> usize {
        self.keys.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    /// True if no identities are known.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl PublicKeyResolver for InMemoryResolver {
    fn get(&self, identity: &str) -> Result<Option<RsaPublicKey>, CryptoError> {
        Ok(self.keys.lock().unwrap_or_else(PoisonError::into_inner).get(identity).cloned())
    }

    fn add(&self, identity: &str, key: &RsaPublicKey) -> Result<(), CryptoError> {
        self.keys
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(identity.to_string(), key.clone());
        Ok(())
    }

    fn remove(&self, identity: &str) -> Result<(), CryptoError> {
        self.keys.lock().unwrap_or_else(PoisonError::into_inner).remove(identity);
        Ok(())
    }

    fn clear(&self) -> Result<(), CryptoError> {
        self.keys.lock().unwrap_or_else(PoisonError::into_inner).clear();
        Ok(())
    }
}

/// Resolver persisting `<dir>/<identity>.pem`.
///
/// # Security
///
/// Identities are restricted to ASCII alphanumerics, `.`, `-` and `_` and may
/// not start with `.`, so a hostile identity cannot escape the directory.
#[derive(Clone, Debug)]
pub struct DirectoryResolver {
    dir: PathBuf,
}

impl DirectoryResolver {
    const EXTENSION: &'static str = "pem";

    /// Use `dir`, creating it if needed.
    pub fn open(dir: impl AsRef<Path>) -> Result<Self, CryptoError> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir).map_err(|e| CryptoError::Storage(e.to_string()))?;
        tracing::debug!(dir = %dir.display(), "opened key directory");
        Ok(Self { dir })
    }

    fn path_for(&self, identity: &str) -> Result<PathBuf, CryptoError> {
        let valid = !identity.is_empty()
            && !identity.starts_with('.')
            && identity.chars().all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_'));
        if !valid {
            return Err(CryptoError::InvalidIdentity(identity.to_string()));
        }
        Ok(self.dir.join(format!("{identity}.{}", Self::EXTENSION)))
    }
}

impl PublicKeyResolver for DirectoryResolver {
    fn get(&self, identity: &str) -> Result<Option<RsaPublicKey>, CryptoError> {
        let path = self.path_for(identity)?;
        match fs::read_to_string(&path) {
            Ok(pem) => parse_public_key_pem(&pem).map(Some),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(CryptoError::Storage(e.to_string())),
        }
    }

    fn add(&self, identity: &str, key: &RsaPublicKey) -> Result<(), CryptoError> {
        let path = self.path_for(identity)?;
        let pem = public_key_to_pem(key)?;

        // Write then rename so readers never observe a partial key.
        let tmp = path.with_extension("pem.tmp");
        fs::write(&tmp, pem).map_err(|e| CryptoError::Storage(e.to_string()))?;
        fs::rename(&tmp, &path).map_err(|e| CryptoError::Storage(e.to_string()))
    }

    fn remove(&self, identity: &str) -> Result<(), CryptoError> {
        let path = self.path_for(identity)?;
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(CryptoError::Storage(e.to_string())),
        }
    }

    fn clear(&self) -> Result<(), CryptoError> {
        let entries = fs::read_dir(&self.dir).map_err(|e| CryptoError::Storage(e.to_string()))?;
        for entry in entries {
            let path = entry.map_err(|e| CryptoError::Storage(e.to_string()))?.path();
            if path.extension().is_some_and(|ext| ext == Self::EXTENSION) {
                fs::remove_file(&path).map_err(|e| CryptoError::Storage(e.to_string()))?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use rand::SeedableRng;
    use rand_chacha::ChaCha20Rng;
    use tempfile::tempdir;

    use super::*;
    use crate::keys::KeyMaterial;

    fn key(seed: u64) -> KeyMaterial {
        KeyMaterial::generate(&mut ChaCha20Rng::seed_from_u64(seed), 1024).unwrap()
    }

    #[test]
    fn in_memory_add_get_remove() {
        let resolver = InMemoryResolver::new();
        let key = key(41);
        resolver.add(key.identity(), key.public_key()).unwrap();
        assert_eq!(resolver.get(key.identity()).unwrap().as_ref(), Some(key.public_key()));

        resolver.remove(key.identity()).unwrap();
        assert!(resolver.get(key.identity()).unwrap().is_none());
        assert!(resolver.is_empty());
    }

    #[test]
    fn directory_resolver_survives_reopen() {
        let dir = tempdir().unwrap();
        let key = key(42);
        {
            let resolver = DirectoryResolver::open(dir.path()).unwrap();
            resolver.add(key.identity(), key.public_key()).unwrap();
        }

        let resolver = DirectoryResolver::open(dir.path()).unwrap();
        assert_eq!(resolver.get(key.identity()).unwrap().as_ref(), Some(key.public_key()));
        assert!(dir.path().join(format!("{}.pem", key.identity())).exists());
    }

    #[test]
    fn directory_resolver_clear_only_touches_keys() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("notes.txt"), "keep me").unwrap();
        let resolver = DirectoryResolver::open(dir.path()).unwrap();
        let key = key(43);
        resolver.add(key.identity(), key.public_key()).unwrap();

        resolver.clear().unwrap();
        assert!(resolver.get(key.identity()).unwrap().is_none());
        assert!(dir.path().join("notes.txt").exists());
    }

    #[test]
    fn hostile_identities_are_rejected() {
        let dir = tempdir().unwrap();
        let resolver = DirectoryResolver::open(dir.path()).unwrap();
        for identity in ["../etc/passwd", "", ".hidden", "a/b", "C.x\0"] {
            assert!(matches!(resolver.get(identity), Err(CryptoError::InvalidIdentity(_))));
        }
    }

    #[test]
    fn unknown_identity_is_none() {
        let dir = tempdir().unwrap();
        let resolver = DirectoryResolver::open(dir.path()).unwrap();
        assert!(resolver.get("C.0000000000000000").unwrap().is_none());
        resolver.remove("C.0000000000000000").unwrap();
    }
}
