#![expect(
    clippy::module_name_repetitions,
    reason = "Store types carry the module name to distinguish them from the token itself"
)]

use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::{Arc, PoisonError, RwLock};

use async_trait::async_trait;
use secrecy::{ExposeSecret as _, SecretString};

use crate::Result;

/// Pluggable persistence for the signed auth token.
#[async_trait]
pub trait TokenStore: Send + Sync {
    async fn save_token(&self, signed_token: &str) -> Result<()>;

    /// Returns `None` when no token is stored.
    async fn load_token(&self) -> Result<Option<String>>;

    async fn remove_token(&self) -> Result<()>;
}

/// Best-effort front for an optional [`TokenStore`].
///
/// Store failures never reach the caller. The last saved token is kept in memory as well and
/// returned by [`TokenStoreEngine::load_token`] whenever the store is absent, fails or has
/// nothing to offer.
pub struct TokenStoreEngine {
    store: Option<Arc<dyn TokenStore>>,
    memory: RwLock<Option<SecretString>>,
}

impl std::fmt::Debug for TokenStoreEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenStoreEngine")
            .field("store", &self.store.is_some())
            .field("memory", &self.read_memory().is_some())
            .finish()
    }
}

impl TokenStoreEngine {
    #[must_use]
    pub fn new(store: Option<Arc<dyn TokenStore>>) -> Self {
        Self {
            store,
            memory: RwLock::new(None),
        }
    }

    pub async fn save_token(&self, signed_token: &str) {
        *self.memory.write().unwrap_or_else(PoisonError::into_inner) =
            Some(SecretString::from(signed_token.to_owned()));

        if let Some(store) = &self.store
            && let Err(e) = store.save_token(signed_token).await
        {
            #[cfg(feature = "tracing")]
            tracing::warn!(error = %e, "Failed to save auth token");
            #[cfg(not(feature = "tracing"))]
            let _ = &e;
        }
    }

    pub async fn load_token(&self) -> Option<String> {
        if let Some(store) = &self.store {
            match store.load_token().await {
                Ok(Some(token)) if !token.is_empty() => return Some(token),
                Ok(_) => {}
                Err(e) => {
                    #[cfg(feature = "tracing")]
                    tracing::warn!(error = %e, "Failed to load auth token, using in-memory copy");
                    #[cfg(not(feature = "tracing"))]
                    let _ = &e;
                }
            }
        }
        self.read_memory()
    }

    pub async fn remove_token(&self) {
        *self.memory.write().unwrap_or_else(PoisonError::into_inner) = None;

        if let Some(store) = &self.store
            && let Err(e) = store.remove_token().await
        {
            #[cfg(feature = "tracing")]
            tracing::warn!(error = %e, "Failed to remove auth token");
            #[cfg(not(feature = "tracing"))]
            let _ = &e;
        }
    }

    fn read_memory(&self) -> Option<String> {
        self.memory
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .map(|token| token.expose_secret().to_owned())
    }
}

/// Stores the signed token in a file named `<key>.token` inside a directory.
#[derive(Debug, Clone)]
pub struct FileTokenStore {
    path: PathBuf,
}

impl FileTokenStore {
    #[must_use]
    pub fn new<P: Into<PathBuf>>(path: P) -> Self {
        Self { path: path.into() }
    }

    #[must_use]
    pub fn for_key<P: AsRef<Path>>(dir: P, key: &str) -> Self {
        Self::new(dir.as_ref().join(format!("{key}.token")))
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl TokenStore for FileTokenStore {
    async fn save_token(&self, signed_token: &str) -> Result<()> {
        if let Some(parent) = self.path.parent()
            && !parent.as_os_str().is_empty()
        {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&self.path, signed_token).await?;
        Ok(())
    }

    async fn load_token(&self) -> Result<Option<String>> {
        match tokio::fs::read_to_string(&self.path).await {
            Ok(token) => Ok(Some(token.trim().to_owned()).filter(|t| !t.is_empty())),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn remove_token(&self) -> Result<()> {
        match tokio::fs::remove_file(&self.path).await {
            Err(e) if e.kind() != ErrorKind::NotFound => Err(e.into()),
            _ => Ok(()),
        }
    }
}
