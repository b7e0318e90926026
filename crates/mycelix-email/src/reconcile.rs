use crate::EmailError;
use mycelix_core::{DecodedMessage, Folder, Message};
use mycelix_storage::{FlagPolicy, Storage};
use uuid::Uuid;

#[derive(Debug, Clone, Default)]
pub struct ReconcileOutcome {
    pub synced: usize,
    /// Rows seen for the first time in this pass, as stored.
    pub inserted: Vec<Message>,
}

/// Merges a decoded window into storage, keyed by `(account, Message-ID)`.
///
/// Upserts are single statements with no surrounding transaction; a failure
/// mid-batch leaves the earlier rows in place. Folder counters describe the
/// batch only, not the full remote folder.
#[derive(Clone)]
pub struct Reconciler {
    storage: Storage,
    flags: FlagPolicy,
}

impl Reconciler {
    pub fn new(storage: Storage, flags: FlagPolicy) -> Self {
        Self { storage, flags }
    }

    pub async fn reconcile(
        &self,
        account_id: Uuid,
        folder: &Folder,
        decoded: Vec<DecodedMessage>,
    ) -> Result<ReconcileOutcome, EmailError> {
        let synced = decoded.len();
        let mut unread = 0u32;
        let mut inserted = Vec::new();

        for message in decoded {
            let candidate = Message::from_decoded(account_id, folder.id, message);
            let stored = self.storage.upsert_message(&candidate, self.flags).await?;
            if !stored.is_read {
                unread += 1;
            }
            if stored.id == candidate.id {
                inserted.push(stored);
            }
        }

        let total = u32::try_from(synced).unwrap_or(u32::MAX);
        self.storage
            .update_folder_counts(folder.id, unread, total)
            .await?;

        tracing::debug!(
            %account_id,
            folder = %folder.path,
            synced,
            inserted = inserted.len(),
            unread,
            "reconciled folder window"
        );

        Ok(ReconcileOutcome { synced, inserted })
    }
}
