//! Test doubles for the runtime
//!
//! `RecordingMessenger` captures outbound traffic and can refuse chosen
//! recipients; `FlakyStore` wraps a real store and fails chosen operations.

use super::traits::*;
use crate::db::{
    Admin, Assignment, Database, DbError, DbResult, ExternalId, FileRecord, NewAssignment,
    NewFile, NewRegistration, ObjectType, RegistrationRequest, Score, Solution, SolutionDetail,
    User, UserStats,
};
use crate::state_machine::Choice;
use async_trait::async_trait;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::Duration;

/// Primary admin in every test store
pub const ADMIN: ExternalId = 1;

/// In-memory store with `ADMIN` bootstrapped as super admin
pub fn test_store() -> DatabaseStore {
    let db = Database::open_in_memory().unwrap();
    db.add_admin(ADMIN, Some("teacher"), "Olga", true).unwrap();
    DatabaseStore::new(db, Duration::from_secs(5))
}

// ============================================================================
// Recording Messenger
// ============================================================================

#[derive(Debug, Clone, PartialEq)]
pub enum Sent {
    Text {
        recipient: ExternalId,
        text: String,
        choices: Vec<Choice>,
    },
    File {
        recipient: ExternalId,
        handle: String,
        caption: Option<String>,
    },
}

/// Messenger that records everything it is asked to send
#[derive(Default)]
pub struct RecordingMessenger {
    sent: Mutex<Vec<Sent>>,
    failing: Mutex<HashSet<ExternalId>>,
}

impl RecordingMessenger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every delivery to `recipient` fails from now on
    pub fn fail_for(&self, recipient: ExternalId) {
        self.failing.lock().unwrap().insert(recipient);
    }

    pub fn sent(&self) -> Vec<Sent> {
        self.sent.lock().unwrap().clone()
    }

    pub fn texts_for(&self, recipient: ExternalId) -> Vec<String> {
        self.sent()
            .into_iter()
            .filter_map(|s| match s {
                Sent::Text {
                    recipient: r, text, ..
                } if r == recipient => Some(text),
                _ => None,
            })
            .collect()
    }

    pub fn choices_for(&self, recipient: ExternalId) -> Vec<Choice> {
        self.sent()
            .into_iter()
            .filter_map(|s| match s {
                Sent::Text {
                    recipient: r,
                    choices,
                    ..
                } if r == recipient => Some(choices),
                _ => None,
            })
            .flatten()
            .collect()
    }

    pub fn files_for(&self, recipient: ExternalId) -> Vec<String> {
        self.sent()
            .into_iter()
            .filter_map(|s| match s {
                Sent::File {
                    recipient: r,
                    handle,
                    ..
                } if r == recipient => Some(handle),
                _ => None,
            })
            .collect()
    }

    /// Recipients of text messages, in send order
    pub fn recipients(&self) -> Vec<ExternalId> {
        self.sent()
            .into_iter()
            .filter_map(|s| match s {
                Sent::Text { recipient, .. } => Some(recipient),
                Sent::File { .. } => None,
            })
            .collect()
    }

    fn check(&self, recipient: ExternalId) -> Result<(), DeliveryError> {
        if self.failing.lock().unwrap().contains(&recipient) {
            Err(DeliveryError::Unreachable(recipient))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl Messenger for RecordingMessenger {
    async fn send_text(&self, recipient: ExternalId, text: &str) -> Result<(), DeliveryError> {
        self.send_choices(recipient, text, &[]).await
    }

    async fn send_file(
        &self,
        recipient: ExternalId,
        handle: &str,
        caption: Option<&str>,
    ) -> Result<(), DeliveryError> {
        self.check(recipient)?;
        self.sent.lock().unwrap().push(Sent::File {
            recipient,
            handle: handle.to_string(),
            caption: caption.map(str::to_string),
        });
        Ok(())
    }

    async fn send_choices(
        &self,
        recipient: ExternalId,
        text: &str,
        choices: &[Choice],
    ) -> Result<(), DeliveryError> {
        self.check(recipient)?;
        self.sent.lock().unwrap().push(Sent::Text {
            recipient,
            text: text.to_string(),
            choices: choices.to_vec(),
        });
        Ok(())
    }
}

// ============================================================================
// Flaky Store
// ============================================================================

/// Store wrapper whose operations can be made to fail by name
pub struct FlakyStore<S> {
    inner: S,
    failing: Mutex<HashSet<&'static str>>,
    /// Registration writes that commit but report a timeout
    late_registrations: AtomicBool,
}

impl<S: EntityStore> FlakyStore<S> {
    pub fn new(inner: S) -> Self {
        Self {
            inner,
            failing: Mutex::new(HashSet::new()),
            late_registrations: AtomicBool::new(false),
        }
    }

    /// `create_registration_request` commits, then reports a timeout
    pub fn time_out_registrations_after_commit(&self) {
        self.late_registrations.store(true, Ordering::SeqCst);
    }

    pub fn fail(&self, op: &'static str) {
        self.failing.lock().unwrap().insert(op);
    }

    pub fn heal(&self, op: &'static str) {
        self.failing.lock().unwrap().remove(op);
    }

    fn check(&self, op: &'static str) -> DbResult<()> {
        if self.failing.lock().unwrap().contains(op) {
            Err(DbError::Join(format!("injected {op} failure")))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl<S: EntityStore> EntityStore for FlakyStore<S> {
    async fn is_registered(&self, user: ExternalId) -> DbResult<bool> {
        self.check("is_registered")?;
        self.inner.is_registered(user).await
    }

    async fn is_admin(&self, user: ExternalId) -> DbResult<bool> {
        self.check("is_admin")?;
        self.inner.is_admin(user).await
    }

    async fn has_pending_request(&self, user: ExternalId) -> DbResult<bool> {
        self.check("has_pending_request")?;
        self.inner.has_pending_request(user).await
    }

    async fn get_user(&self, user: ExternalId) -> DbResult<User> {
        self.check("get_user")?;
        self.inner.get_user(user).await
    }

    async fn list_active_users(&self) -> DbResult<Vec<User>> {
        self.check("list_active_users")?;
        self.inner.list_active_users().await
    }

    async fn deactivate_user(&self, user: ExternalId) -> DbResult<()> {
        self.check("deactivate_user")?;
        self.inner.deactivate_user(user).await
    }

    async fn update_user_notes(&self, user: ExternalId, notes: &str) -> DbResult<()> {
        self.check("update_user_notes")?;
        self.inner.update_user_notes(user, notes).await
    }

    async fn add_admin(
        &self,
        user: ExternalId,
        username: Option<&str>,
        first_name: &str,
    ) -> DbResult<Admin> {
        self.check("add_admin")?;
        self.inner.add_admin(user, username, first_name).await
    }

    async fn get_admin(&self, user: ExternalId) -> DbResult<Admin> {
        self.check("get_admin")?;
        self.inner.get_admin(user).await
    }

    async fn list_admins(&self) -> DbResult<Vec<Admin>> {
        self.check("list_admins")?;
        self.inner.list_admins().await
    }

    async fn create_registration_request(
        &self,
        request: &NewRegistration,
    ) -> DbResult<RegistrationRequest> {
        self.check("create_registration_request")?;
        let created = self.inner.create_registration_request(request).await?;
        if self.late_registrations.load(Ordering::SeqCst) {
            return Err(DbError::Timeout(Duration::from_secs(5)));
        }
        Ok(created)
    }

    async fn get_registration_request(&self, id: i64) -> DbResult<RegistrationRequest> {
        self.check("get_registration_request")?;
        self.inner.get_registration_request(id).await
    }

    async fn list_pending_requests(&self) -> DbResult<Vec<RegistrationRequest>> {
        self.check("list_pending_requests")?;
        self.inner.list_pending_requests().await
    }

    async fn approve_request(&self, id: i64, comment: &str) -> DbResult<User> {
        self.check("approve_request")?;
        self.inner.approve_request(id, comment).await
    }

    async fn reject_request(&self, id: i64, comment: &str) -> DbResult<RegistrationRequest> {
        self.check("reject_request")?;
        self.inner.reject_request(id, comment).await
    }

    async fn create_assignment(
        &self,
        assignment: &NewAssignment,
        file_ids: &[i64],
    ) -> DbResult<Assignment> {
        self.check("create_assignment")?;
        self.inner.create_assignment(assignment, file_ids).await
    }

    async fn get_assignment(&self, id: i64) -> DbResult<Assignment> {
        self.check("get_assignment")?;
        self.inner.get_assignment(id).await
    }

    async fn list_assignments(&self) -> DbResult<Vec<Assignment>> {
        self.check("list_assignments")?;
        self.inner.list_assignments().await
    }

    async fn list_assignments_for_grade(&self, grade: u8) -> DbResult<Vec<Assignment>> {
        self.check("list_assignments_for_grade")?;
        self.inner.list_assignments_for_grade(grade).await
    }

    async fn deactivate_assignment(&self, id: i64) -> DbResult<()> {
        self.check("deactivate_assignment")?;
        self.inner.deactivate_assignment(id).await
    }

    async fn submit_solution(
        &self,
        user: ExternalId,
        assignment_id: i64,
        text: &str,
        file_ids: &[i64],
    ) -> DbResult<Solution> {
        self.check("submit_solution")?;
        self.inner
            .submit_solution(user, assignment_id, text, file_ids)
            .await
    }

    async fn grade_solution(
        &self,
        id: i64,
        score: Score,
        comment: Option<&str>,
        file_ids: &[i64],
    ) -> DbResult<SolutionDetail> {
        self.check("grade_solution")?;
        self.inner.grade_solution(id, score, comment, file_ids).await
    }

    async fn get_solution(&self, id: i64) -> DbResult<SolutionDetail> {
        self.check("get_solution")?;
        self.inner.get_solution(id).await
    }

    async fn list_ungraded_solutions(&self) -> DbResult<Vec<SolutionDetail>> {
        self.check("list_ungraded_solutions")?;
        self.inner.list_ungraded_solutions().await
    }

    async fn list_user_solutions(&self, user: ExternalId) -> DbResult<Vec<SolutionDetail>> {
        self.check("list_user_solutions")?;
        self.inner.list_user_solutions(user).await
    }

    async fn compute_user_stats(&self, user: ExternalId) -> DbResult<UserStats> {
        self.check("compute_user_stats")?;
        self.inner.compute_user_stats(user).await
    }

    async fn record_upload(&self, file: &NewFile) -> DbResult<FileRecord> {
        self.check("record_upload")?;
        self.inner.record_upload(file).await
    }

    async fn list_files_for_object(
        &self,
        object_type: ObjectType,
        object_id: i64,
    ) -> DbResult<Vec<FileRecord>> {
        self.check("list_files_for_object")?;
        self.inner.list_files_for_object(object_type, object_id).await
    }

    async fn count_files_for_object(
        &self,
        object_type: ObjectType,
        object_id: i64,
    ) -> DbResult<u32> {
        self.check("count_files_for_object")?;
        self.inner.count_files_for_object(object_type, object_id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_flaky_store_fails_only_chosen_op() {
        let store = FlakyStore::new(test_store());
        store.fail("list_admins");

        assert!(matches!(store.list_admins().await, Err(DbError::Join(_))));
        assert!(store.is_admin(ADMIN).await.unwrap());

        store.heal("list_admins");
        assert_eq!(store.list_admins().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_recording_messenger_refuses_failing_recipient() {
        let messenger = RecordingMessenger::new();
        messenger.fail_for(7);

        assert!(messenger.send_text(7, "hi").await.is_err());
        messenger.send_text(8, "hi").await.unwrap();
        messenger.send_file(8, "doc", Some("scan")).await.unwrap();

        assert_eq!(messenger.recipients(), vec![8]);
        assert_eq!(messenger.files_for(8), vec!["doc"]);
    }
}
