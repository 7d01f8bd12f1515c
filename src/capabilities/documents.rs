use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use thiserror::Error;
use tokio::sync::RwLock;

use crate::model::UserId;

pub const MAX_ID_LENGTH: usize = 128;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Collection {
    Contacts,
    History,
}

impl Collection {
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Contacts => "contacts",
            Self::History => "history",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct StoredDocument {
    pub id: String,
    pub body: serde_json::Value,
}

impl StoredDocument {
    pub fn new(id: impl Into<String>, body: serde_json::Value) -> Result<Self, StoreError> {
        let id = id.into();
        validate_id(&id)?;
        Ok(Self { id, body })
    }
}

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("invalid document id '{id}': {reason}")]
    InvalidId { id: String, reason: String },

    #[error("document '{0}' already exists")]
    Duplicate(String),

    #[error("storage backend error: {0}")]
    Backend(String),

    #[error("lock acquisition failed")]
    LockFailed,
}

impl From<serde_json::Error> for StoreError {
    fn from(e: serde_json::Error) -> Self {
        StoreError::Serialization(e.to_string())
    }
}

fn validate_id(id: &str) -> Result<(), StoreError> {
    let invalid = |reason: &str| StoreError::InvalidId {
        id: id.chars().take(50).collect(),
        reason: reason.to_string(),
    };
    if id.trim().is_empty() {
        return Err(invalid("id cannot be empty"));
    }
    if id.len() > MAX_ID_LENGTH {
        return Err(invalid("id is too long"));
    }
    if id.chars().any(char::is_control) {
        return Err(invalid("id contains control characters"));
    }
    Ok(())
}

/// Per-user document collections. Documents are written once and removed whole; there
/// is no update. `list_by_user` returns insertion order.
#[async_trait::async_trait]
pub trait DocumentStore: Send + Sync {
    async fn append(
        &self,
        user: &UserId,
        collection: Collection,
        document: StoredDocument,
    ) -> Result<(), StoreError>;

    /// Returns false if no such document existed.
    async fn remove(&self, user: &UserId, collection: Collection, id: &str)
        -> Result<bool, StoreError>;

    async fn list_by_user(
        &self,
        user: &UserId,
        collection: Collection,
    ) -> Result<Vec<StoredDocument>, StoreError>;
}

#[derive(Debug, Default)]
pub struct MemoryDocumentStore {
    documents: RwLock<HashMap<(UserId, Collection), Vec<StoredDocument>>>,
}

impl MemoryDocumentStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait::async_trait]
impl DocumentStore for MemoryDocumentStore {
    async fn append(
        &self,
        user: &UserId,
        collection: Collection,
        document: StoredDocument,
    ) -> Result<(), StoreError> {
        validate_id(&document.id)?;
        let mut documents = self.documents.write().await;
        let entries = documents.entry((user.clone(), collection)).or_default();
        if entries.iter().any(|d| d.id == document.id) {
            return Err(StoreError::Duplicate(document.id));
        }
        entries.push(document);
        Ok(())
    }

    async fn remove(
        &self,
        user: &UserId,
        collection: Collection,
        id: &str,
    ) -> Result<bool, StoreError> {
        let mut documents = self.documents.write().await;
        let Some(entries) = documents.get_mut(&(user.clone(), collection)) else {
            return Ok(false);
        };
        let before = entries.len();
        entries.retain(|d| d.id != id);
        Ok(entries.len() != before)
    }

    async fn list_by_user(
        &self,
        user: &UserId,
        collection: Collection,
    ) -> Result<Vec<StoredDocument>, StoreError> {
        let documents = self.documents.read().await;
        Ok(documents
            .get(&(user.clone(), collection))
            .cloned()
            .unwrap_or_default())
    }
}

#[cfg(not(target_arch = "wasm32"))]
pub use sqlite::SqliteDocumentStore;

#[cfg(not(target_arch = "wasm32"))]
mod sqlite {
    use rusqlite::{params, Connection, ErrorCode};
    use std::path::Path;
    use std::sync::{Arc, Mutex};

    use super::{validate_id, Collection, DocumentStore, StoreError, StoredDocument};
    use crate::model::UserId;

    const SCHEMA: &str = r"
        CREATE TABLE IF NOT EXISTS documents (
            seq INTEGER PRIMARY KEY AUTOINCREMENT,
            user_id TEXT NOT NULL,
            collection TEXT NOT NULL,
            doc_id TEXT NOT NULL,
            body TEXT NOT NULL,
            UNIQUE (user_id, collection, doc_id)
        );
        CREATE INDEX IF NOT EXISTS idx_documents_owner ON documents(user_id, collection, seq);
    ";

    impl From<rusqlite::Error> for StoreError {
        fn from(e: rusqlite::Error) -> Self {
            StoreError::Backend(e.to_string())
        }
    }

    /// SQLite-backed documents. rusqlite is blocking, so every call runs on the blocking
    /// pool behind a shared connection.
    #[derive(Clone)]
    pub struct SqliteDocumentStore {
        conn: Arc<Mutex<Connection>>,
    }

    impl SqliteDocumentStore {
        pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
            Self::init(Connection::open(path)?)
        }

        pub fn open_in_memory() -> Result<Self, StoreError> {
            Self::init(Connection::open_in_memory()?)
        }

        fn init(conn: Connection) -> Result<Self, StoreError> {
            conn.execute_batch(SCHEMA)?;
            Ok(Self {
                conn: Arc::new(Mutex::new(conn)),
            })
        }

        async fn with_conn<T, F>(&self, f: F) -> Result<T, StoreError>
        where
            T: Send + 'static,
            F: FnOnce(&Connection) -> Result<T, StoreError> + Send + 'static,
        {
            let conn = Arc::clone(&self.conn);
            tokio::task::spawn_blocking(move || {
                let conn = conn.lock().map_err(|_| StoreError::LockFailed)?;
                f(&conn)
            })
            .await
            .map_err(|e| StoreError::Backend(e.to_string()))?
        }
    }

    #[async_trait::async_trait]
    impl DocumentStore for SqliteDocumentStore {
        async fn append(
            &self,
            user: &UserId,
            collection: Collection,
            document: StoredDocument,
        ) -> Result<(), StoreError> {
            validate_id(&document.id)?;
            let user = user.as_str().to_owned();
            let body = serde_json::to_string(&document.body)?;
            self.with_conn(move |conn| {
                let inserted = conn.execute(
                    "INSERT INTO documents (user_id, collection, doc_id, body) VALUES (?1, ?2, ?3, ?4)",
                    params![user, collection.name(), document.id, body],
                );
                match inserted {
                    Ok(_) => Ok(()),
                    Err(rusqlite::Error::SqliteFailure(e, _))
                        if e.code == ErrorCode::ConstraintViolation =>
                    {
                        Err(StoreError::Duplicate(document.id))
                    }
                    Err(e) => Err(e.into()),
                }
            })
            .await
        }

        async fn remove(
            &self,
            user: &UserId,
            collection: Collection,
            id: &str,
        ) -> Result<bool, StoreError> {
            let user = user.as_str().to_owned();
            let id = id.to_owned();
            self.with_conn(move |conn| {
                let removed = conn.execute(
                    "DELETE FROM documents WHERE user_id = ?1 AND collection = ?2 AND doc_id = ?3",
                    params![user, collection.name(), id],
                )?;
                Ok(removed > 0)
            })
            .await
        }

        async fn list_by_user(
            &self,
            user: &UserId,
            collection: Collection,
        ) -> Result<Vec<StoredDocument>, StoreError> {
            let user = user.as_str().to_owned();
            self.with_conn(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT doc_id, body FROM documents WHERE user_id = ?1 AND collection = ?2 ORDER BY seq ASC",
                )?;
                let rows = stmt.query_map(params![user, collection.name()], |row| {
                    Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
                })?;

                let mut documents = Vec::new();
                for row in rows {
                    let (id, body) = row?;
                    documents.push(StoredDocument {
                        id,
                        body: serde_json::from_str(&body)?,
                    });
                }
                Ok(documents)
            })
            .await
        }
    }
}
