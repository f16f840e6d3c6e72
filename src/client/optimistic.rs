use crate::core::domain::notification::NotificationPayload;
use crate::core::domain::optimistic::OptimisticUpdate;
use chrono::{DateTime, Utc};
use serde_json::Value;
use std::time::Duration;
use uuid::Uuid;

/// Local changes waiting for the server to confirm them.
///
/// A pushed event whose entity changes name the same entity type and id
/// confirms the update. Updates still unconfirmed after the timeout are
/// handed back for rollback.
#[derive(Debug, Default)]
pub struct OptimisticTracker {
    pending: Vec<OptimisticUpdate>,
}

impl OptimisticTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a change the UI has already applied.
    pub fn apply(
        &mut self,
        entity_type: impl Into<String>,
        entity_id: impl Into<String>,
        changes: Value,
        rollback_data: Option<Value>,
    ) -> OptimisticUpdate {
        let update = OptimisticUpdate {
            id: Uuid::new_v4().to_string(),
            entity_type: entity_type.into(),
            entity_id: entity_id.into(),
            changes,
            applied_at: Utc::now(),
            confirmed: false,
            rollback_data,
        };
        self.pending.push(update.clone());
        update
    }

    /// Retires the updates confirmed by `payload`.
    ///
    /// # Returns
    ///
    /// The confirmed updates, marked as such.
    pub fn confirm_from(&mut self, payload: &NotificationPayload) -> Vec<OptimisticUpdate> {
        let Some(changes) = payload.entity_changes.as_ref() else {
            return Vec::new();
        };
        let (mut confirmed, pending): (Vec<_>, Vec<_>) =
            self.pending.drain(..).partition(|update| {
                changes.iter().any(|c| {
                    c.entity_type == update.entity_type && c.entity_id == update.entity_id
                })
            });
        self.pending = pending;
        for update in &mut confirmed {
            update.confirmed = true;
        }
        confirmed
    }

    /// Removes a single update, e.g. after a conflict reported by the server.
    pub fn rollback(&mut self, id: &str) -> Option<OptimisticUpdate> {
        let index = self.pending.iter().position(|u| u.id == id)?;
        Some(self.pending.remove(index))
    }

    /// Removes updates applied more than `timeout` ago.
    pub fn expire(&mut self, timeout: Duration) -> Vec<OptimisticUpdate> {
        let timeout = chrono::Duration::from_std(timeout).unwrap_or(chrono::Duration::MAX);
        match Utc::now().checked_sub_signed(timeout) {
            Some(cutoff) => self.expire_before(cutoff),
            None => Vec::new(),
        }
    }

    /// Removes updates applied before `cutoff`.
    pub fn expire_before(&mut self, cutoff: DateTime<Utc>) -> Vec<OptimisticUpdate> {
        let (expired, pending): (Vec<_>, Vec<_>) = self
            .pending
            .drain(..)
            .partition(|update| update.applied_at < cutoff);
        self.pending = pending;
        expired
    }

    /// Empties the tracker, returning everything still pending.
    pub fn take_all(&mut self) -> Vec<OptimisticUpdate> {
        std::mem::take(&mut self.pending)
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}
