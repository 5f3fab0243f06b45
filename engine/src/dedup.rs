use common::{JobId, RowNumber};
use reader::RowRecord;
use std::collections::{HashMap, HashSet};
use store::{DataStore, DataStoreError, EmployeeEntry};

/// Last-occurrence index over the whole file, built by the survey pass.
///
/// Within-file dedup is "keep last": only the final occurrence of an
/// employee number or email is admitted. Knowing the winner before the
/// first chunk runs is what makes the policy independent of chunk size;
/// streaming alone cannot look ahead.
#[derive(Debug, Default)]
pub struct FileKeyIndex {
    last_by_number: HashMap<String, RowNumber>,
    last_by_email: HashMap<String, RowNumber>,
}

impl FileKeyIndex {
    /// Feeds one surveyed row. Rows missing either key never participate.
    pub fn observe(&mut self, record: &RowRecord) {
        let (Some(number), Some(email)) = (
            record.get_trimmed("employee_number"),
            record.get_trimmed("email"),
        ) else {
            return;
        };
        self.last_by_number.insert(number.to_string(), record.row_number);
        self.last_by_email.insert(email.to_string(), record.row_number);
    }

    /// True when a later row carries the same employee number or email, in
    /// which case this row is the keep-last loser.
    pub fn is_superseded(&self, number: &str, email: &str, row: RowNumber) -> bool {
        let by_number = self
            .last_by_number
            .get(number)
            .is_some_and(|last| *last > row);
        let by_email = self.last_by_email.get(email).is_some_and(|last| *last > row);
        by_number || by_email
    }

    pub fn tracked_keys(&self) -> usize {
        self.last_by_number.len() + self.last_by_email.len()
    }
}

/// What the chunk engine should do with a row that passed validation.
#[derive(Debug)]
pub enum DedupDecision {
    /// No conflict anywhere: insert a new employee.
    InsertNew,
    /// The store already has this person and updates are allowed.
    UpdateExisting(Box<EmployeeEntry>),
    /// This job already admitted the same key earlier in the session.
    SkipSessionDuplicate,
    /// The store has this person and updates are disabled by policy.
    SkipStoreDuplicate,
}

/// Per-job duplicate tracking: the in-memory mirror of the dedup ledger.
#[derive(Debug, Default)]
pub struct Deduplicator {
    processed_numbers: HashSet<String>,
    processed_emails: HashSet<String>,
}

impl Deduplicator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reloads the session sets from the durable ledger so a resumed job
    /// continues with exactly the state it crashed with, without rereading
    /// any input.
    pub async fn rebuild_tracking_state(
        &mut self,
        db: &DataStore,
        job_id: &JobId,
    ) -> Result<(), DataStoreError> {
        let state = db.fetch_tracking_state(job_id).await?;
        self.processed_numbers = state.employee_numbers.into_iter().collect();
        self.processed_emails = state.emails.into_iter().collect();
        Ok(())
    }

    pub fn is_session_duplicate(&self, number: &str, email: &str) -> bool {
        self.processed_numbers.contains(number) || self.processed_emails.contains(email)
    }

    pub fn mark_as_processed(&mut self, number: &str, email: &str) {
        self.processed_numbers.insert(number.to_string());
        self.processed_emails.insert(email.to_string());
    }

    /// The decision table, given the store lookup the chunk already ran.
    pub fn decide(
        &self,
        number: &str,
        email: &str,
        existing: Option<EmployeeEntry>,
        update_allowed: bool,
    ) -> DedupDecision {
        if self.is_session_duplicate(number, email) {
            return DedupDecision::SkipSessionDuplicate;
        }
        match existing {
            Some(entry) if update_allowed => DedupDecision::UpdateExisting(Box::new(entry)),
            Some(_) => DedupDecision::SkipStoreDuplicate,
            None => DedupDecision::InsertNew,
        }
    }
}
