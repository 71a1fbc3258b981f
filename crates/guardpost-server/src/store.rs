//! Async access to the synchronous SQLite store.
//!
//! Every call runs on the blocking pool so request and connection tasks
//! never stall a runtime worker on disk I/O.

use std::sync::{Arc, Mutex};

use guardpost_store::{Database, StoreError};

use crate::error::ServerError;

#[derive(Clone)]
pub struct SharedStore {
    db: Arc<Mutex<Database>>,
}

impl SharedStore {
    pub fn new(db: Database) -> Self {
        Self {
            db: Arc::new(Mutex::new(db)),
        }
    }

    /// Run `f` against the database on the blocking pool.
    pub async fn call<T, F>(&self, f: F) -> Result<T, ServerError>
    where
        F: FnOnce(&mut Database) -> Result<T, StoreError> + Send + 'static,
        T: Send + 'static,
    {
        let db = self.db.clone();
        tokio::task::spawn_blocking(move || {
            let mut guard = db
                .lock()
                .map_err(|e| ServerError::Internal(format!("Database lock poisoned: {e}")))?;
            f(&mut guard).map_err(ServerError::from)
        })
        .await
        .map_err(|e| ServerError::Internal(format!("Store task failed: {e}")))?
    }
}
