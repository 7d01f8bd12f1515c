use serde::{Deserialize, Serialize};
use std::cmp::Reverse;
use std::sync::Arc;
use tracing::{info, instrument, warn};

use crate::capabilities::{Collection, DocumentStore, StoreError, StoredDocument};
use crate::error::Rejection;
use crate::model::{
    Contact, ContactId, HistoryId, HistoryRecord, LocationSnapshot, SessionId, SessionStatus,
    UnixTimeMs, UserId, WalkSession,
};
use crate::store::SessionStore;

// --- Session start / end ---

#[must_use]
pub fn begin_session(user_id: UserId, contact: Contact, now: UnixTimeMs) -> WalkSession {
    WalkSession {
        id: SessionId::generate(),
        user_id,
        contact,
        status: SessionStatus::Active,
        started_at: now,
        ended_at: None,
    }
}

/// Marks the session ended and snapshots it into a history record.
///
/// Start and end locations come from the first and last accepted path points; both are
/// `None` when nothing was ever accepted.
pub fn finalize_session(
    session: &mut WalkSession,
    path: &SessionStore,
    help_sent: bool,
    now: UnixTimeMs,
) -> Result<HistoryRecord, Rejection> {
    if !session.is_active() {
        return Err(Rejection::NoActiveSession);
    }
    session.status = SessionStatus::Ended;
    session.ended_at = Some(now);

    Ok(HistoryRecord {
        id: HistoryId::generate(),
        user_id: session.user_id.clone(),
        session_id: session.id.clone(),
        contact: session.contact.clone(),
        status: session.status,
        started_at: session.started_at,
        ended_at: session.ended_at,
        start_location: path.first_accepted().map(LocationSnapshot::from),
        end_location: path.last_accepted().map(LocationSnapshot::from),
        distance_meters: path.distance_m(),
        duration_ms: session.duration_ms(now),
        path_points: path.path().len(),
        help_sent,
    })
}

// --- History ---

/// Finished walks of one user, stored in the `history` collection.
#[derive(Clone)]
pub struct HistoryRepository {
    documents: Arc<dyn DocumentStore>,
    user: UserId,
}

impl HistoryRepository {
    pub fn new(documents: Arc<dyn DocumentStore>, user: UserId) -> Self {
        Self { documents, user }
    }

    #[instrument(skip(self, record), fields(history_id = %record.id))]
    pub async fn save(&self, record: &HistoryRecord) -> Result<(), StoreError> {
        let document = StoredDocument::new(record.id.as_str(), serde_json::to_value(record)?)?;
        self.documents
            .append(&self.user, Collection::History, document)
            .await?;
        info!(
            distance_m = record.distance_meters,
            path_points = record.path_points,
            help_sent = record.help_sent,
            "walk saved to history"
        );
        Ok(())
    }

    /// Newest first. Records that no longer deserialize are skipped with a warning.
    pub async fn list(&self) -> Result<Vec<HistoryRecord>, StoreError> {
        let documents = self
            .documents
            .list_by_user(&self.user, Collection::History)
            .await?;
        let mut records: Vec<HistoryRecord> = documents
            .into_iter()
            .filter_map(|doc| match serde_json::from_value(doc.body) {
                Ok(record) => Some(record),
                Err(e) => {
                    warn!(history_id = %doc.id, error = %e, "skipping unreadable history record");
                    None
                }
            })
            .collect();
        records.sort_by_key(|r| Reverse(r.started_at));
        Ok(records)
    }

    /// Removes one record. Nothing else is touched.
    pub async fn delete(&self, id: &HistoryId) -> Result<bool, StoreError> {
        let removed = self
            .documents
            .remove(&self.user, Collection::History, id.as_str())
            .await?;
        if removed {
            info!(history_id = %id, "history record deleted");
        }
        Ok(removed)
    }
}

// --- Contacts ---

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct SavedContact {
    pub id: ContactId,
    #[serde(flatten)]
    pub contact: Contact,
    pub created_at: UnixTimeMs,
}

#[derive(Clone)]
pub struct ContactBook {
    documents: Arc<dyn DocumentStore>,
    user: UserId,
}

impl ContactBook {
    pub fn new(documents: Arc<dyn DocumentStore>, user: UserId) -> Self {
        Self { documents, user }
    }

    pub async fn add(&self, contact: Contact, now: UnixTimeMs) -> Result<SavedContact, StoreError> {
        let saved = SavedContact {
            id: ContactId::generate(),
            contact,
            created_at: now,
        };
        let document = StoredDocument::new(saved.id.as_str(), serde_json::to_value(&saved)?)?;
        self.documents
            .append(&self.user, Collection::Contacts, document)
            .await?;
        Ok(saved)
    }

    /// Oldest first.
    pub async fn list(&self) -> Result<Vec<SavedContact>, StoreError> {
        let documents = self
            .documents
            .list_by_user(&self.user, Collection::Contacts)
            .await?;
        Ok(documents
            .into_iter()
            .filter_map(|doc| match serde_json::from_value(doc.body) {
                Ok(contact) => Some(contact),
                Err(e) => {
                    warn!(contact_id = %doc.id, error = %e, "skipping unreadable contact");
                    None
                }
            })
            .collect())
    }

    pub async fn remove(&self, id: &ContactId) -> Result<bool, StoreError> {
        self.documents
            .remove(&self.user, Collection::Contacts, id.as_str())
            .await
    }
}
