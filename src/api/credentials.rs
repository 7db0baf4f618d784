// Credential rotation: one randomly chosen bot session per request.
//
// The pool is loaded once at process start from the document store
// (credentials flagged "error" are excluded) and is read-only afterwards.

use anyhow::Result;
use rand::seq::IndexedRandom;
use tracing::info;

use super::error::EmptyPoolError;
use crate::db::models::Credential;
use crate::db::DocumentStore;

#[derive(Debug, Clone, Default)]
pub struct CredentialPool {
    credentials: Vec<Credential>,
}

impl CredentialPool {
    pub fn new(credentials: Vec<Credential>) -> Self {
        Self { credentials }
    }

    /// Load every usable credential from the store.
    pub async fn load(store: &dyn DocumentStore) -> Result<Self> {
        let credentials = store.load_credentials().await?;
        info!(count = credentials.len(), "Loaded credential pool");
        Ok(Self::new(credentials))
    }

    /// Pick one credential uniformly at random.
    pub fn select(&self) -> Result<&Credential, EmptyPoolError> {
        self.credentials
            .choose(&mut rand::rng())
            .ok_or(EmptyPoolError)
    }

    pub fn len(&self) -> usize {
        self.credentials.len()
    }

    pub fn is_empty(&self) -> bool {
        self.credentials.is_empty()
    }
}
