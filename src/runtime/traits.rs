//! Trait abstractions for runtime I/O
//!
//! These traits enable testing the engine with mock implementations.

use crate::db::{
    Admin, Assignment, DbError, DbResult, ExternalId, FileRecord, NewAssignment, NewFile,
    NewRegistration, ObjectType, RegistrationRequest, Score, Solution, SolutionDetail, User,
    UserStats,
};
use crate::state_machine::Choice;
use async_trait::async_trait;
use serde_json::{json, Value};
use std::time::Duration;
use thiserror::Error;

/// Async view of the entity store
#[async_trait]
pub trait EntityStore: Send + Sync {
    async fn is_registered(&self, user: ExternalId) -> DbResult<bool>;
    async fn is_admin(&self, user: ExternalId) -> DbResult<bool>;
    async fn has_pending_request(&self, user: ExternalId) -> DbResult<bool>;

    async fn get_user(&self, user: ExternalId) -> DbResult<User>;
    async fn list_active_users(&self) -> DbResult<Vec<User>>;
    async fn deactivate_user(&self, user: ExternalId) -> DbResult<()>;
    async fn update_user_notes(&self, user: ExternalId, notes: &str) -> DbResult<()>;

    async fn add_admin(
        &self,
        user: ExternalId,
        username: Option<&str>,
        first_name: &str,
    ) -> DbResult<Admin>;
    async fn get_admin(&self, user: ExternalId) -> DbResult<Admin>;
    async fn list_admins(&self) -> DbResult<Vec<Admin>>;

    async fn create_registration_request(
        &self,
        request: &NewRegistration,
    ) -> DbResult<RegistrationRequest>;
    async fn get_registration_request(&self, id: i64) -> DbResult<RegistrationRequest>;
    async fn list_pending_requests(&self) -> DbResult<Vec<RegistrationRequest>>;
    async fn approve_request(&self, id: i64, comment: &str) -> DbResult<User>;
    async fn reject_request(&self, id: i64, comment: &str) -> DbResult<RegistrationRequest>;

    async fn create_assignment(
        &self,
        assignment: &NewAssignment,
        file_ids: &[i64],
    ) -> DbResult<Assignment>;
    async fn get_assignment(&self, id: i64) -> DbResult<Assignment>;
    async fn list_assignments(&self) -> DbResult<Vec<Assignment>>;
    async fn list_assignments_for_grade(&self, grade: u8) -> DbResult<Vec<Assignment>>;
    async fn deactivate_assignment(&self, id: i64) -> DbResult<()>;

    async fn submit_solution(
        &self,
        user: ExternalId,
        assignment_id: i64,
        text: &str,
        file_ids: &[i64],
    ) -> DbResult<Solution>;
    async fn grade_solution(
        &self,
        id: i64,
        score: Score,
        comment: Option<&str>,
        file_ids: &[i64],
    ) -> DbResult<SolutionDetail>;
    async fn get_solution(&self, id: i64) -> DbResult<SolutionDetail>;
    async fn list_ungraded_solutions(&self) -> DbResult<Vec<SolutionDetail>>;
    async fn list_user_solutions(&self, user: ExternalId) -> DbResult<Vec<SolutionDetail>>;
    async fn compute_user_stats(&self, user: ExternalId) -> DbResult<UserStats>;

    async fn record_upload(&self, file: &NewFile) -> DbResult<FileRecord>;
    async fn list_files_for_object(
        &self,
        object_type: ObjectType,
        object_id: i64,
    ) -> DbResult<Vec<FileRecord>>;
    async fn count_files_for_object(&self, object_type: ObjectType, object_id: i64)
        -> DbResult<u32>;
}

#[derive(Debug, Error)]
pub enum DeliveryError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("Bot API returned {status}: {body}")]
    Status { status: u16, body: String },
    #[error("Recipient {0} unreachable")]
    Unreachable(ExternalId),
}

/// Outbound message channel
#[async_trait]
pub trait Messenger: Send + Sync {
    async fn send_text(&self, recipient: ExternalId, text: &str) -> Result<(), DeliveryError>;

    /// Re-send a previously uploaded file by its transport handle
    async fn send_file(
        &self,
        recipient: ExternalId,
        handle: &str,
        caption: Option<&str>,
    ) -> Result<(), DeliveryError>;

    /// Message with reply buttons. Transports without buttons get the
    /// choices appended as text.
    async fn send_choices(
        &self,
        recipient: ExternalId,
        text: &str,
        choices: &[Choice],
    ) -> Result<(), DeliveryError> {
        if choices.is_empty() {
            return self.send_text(recipient, text).await;
        }
        let rendered = choices
            .iter()
            .map(|c| format!("• {} [{}]", c.label, c.data))
            .collect::<Vec<_>>()
            .join("\n");
        self.send_text(recipient, &format!("{text}\n\n{rendered}"))
            .await
    }
}

// ============================================================================
// Production Adapters
// ============================================================================

use crate::db::Database;

/// Adapter to use Database as an async `EntityStore`.
///
/// Every call runs on the blocking pool and is bounded by `timeout`.
#[derive(Clone)]
pub struct DatabaseStore {
    db: Database,
    timeout: Duration,
}

impl DatabaseStore {
    pub fn new(db: Database, timeout: Duration) -> Self {
        Self { db, timeout }
    }

    async fn call<T, F>(&self, f: F) -> DbResult<T>
    where
        T: Send + 'static,
        F: FnOnce(&Database) -> DbResult<T> + Send + 'static,
    {
        let db = self.db.clone();
        let task = tokio::task::spawn_blocking(move || f(&db));
        match tokio::time::timeout(self.timeout, task).await {
            Ok(Ok(result)) => result,
            Ok(Err(e)) => Err(DbError::Join(e.to_string())),
            Err(_) => Err(DbError::Timeout(self.timeout)),
        }
    }
}

#[async_trait]
impl EntityStore for DatabaseStore {
    async fn is_registered(&self, user: ExternalId) -> DbResult<bool> {
        self.call(move |db| db.is_registered(user)).await
    }

    async fn is_admin(&self, user: ExternalId) -> DbResult<bool> {
        self.call(move |db| db.is_admin(user)).await
    }

    async fn has_pending_request(&self, user: ExternalId) -> DbResult<bool> {
        self.call(move |db| db.has_pending_request(user)).await
    }

    async fn get_user(&self, user: ExternalId) -> DbResult<User> {
        self.call(move |db| db.get_user(user)).await
    }

    async fn list_active_users(&self) -> DbResult<Vec<User>> {
        self.call(Database::list_active_users).await
    }

    async fn deactivate_user(&self, user: ExternalId) -> DbResult<()> {
        self.call(move |db| db.deactivate_user(user)).await
    }

    async fn update_user_notes(&self, user: ExternalId, notes: &str) -> DbResult<()> {
        let notes = notes.to_string();
        self.call(move |db| db.update_user_notes(user, &notes)).await
    }

    /// Promoted admins are never super admins; only the bootstrap is
    async fn add_admin(
        &self,
        user: ExternalId,
        username: Option<&str>,
        first_name: &str,
    ) -> DbResult<Admin> {
        let username = username.map(str::to_string);
        let first_name = first_name.to_string();
        self.call(move |db| db.add_admin(user, username.as_deref(), &first_name, false))
            .await
    }

    async fn get_admin(&self, user: ExternalId) -> DbResult<Admin> {
        self.call(move |db| db.get_admin(user)).await
    }

    async fn list_admins(&self) -> DbResult<Vec<Admin>> {
        self.call(Database::list_admins).await
    }

    async fn create_registration_request(
        &self,
        request: &NewRegistration,
    ) -> DbResult<RegistrationRequest> {
        let request = request.clone();
        self.call(move |db| db.create_registration_request(&request))
            .await
    }

    async fn get_registration_request(&self, id: i64) -> DbResult<RegistrationRequest> {
        self.call(move |db| db.get_registration_request(id)).await
    }

    async fn list_pending_requests(&self) -> DbResult<Vec<RegistrationRequest>> {
        self.call(Database::list_pending_requests).await
    }

    async fn approve_request(&self, id: i64, comment: &str) -> DbResult<User> {
        let comment = comment.to_string();
        self.call(move |db| db.approve_request(id, &comment)).await
    }

    async fn reject_request(&self, id: i64, comment: &str) -> DbResult<RegistrationRequest> {
        let comment = comment.to_string();
        self.call(move |db| db.reject_request(id, &comment)).await
    }

    async fn create_assignment(
        &self,
        assignment: &NewAssignment,
        file_ids: &[i64],
    ) -> DbResult<Assignment> {
        let assignment = assignment.clone();
        let file_ids = file_ids.to_vec();
        self.call(move |db| db.create_assignment(&assignment, &file_ids))
            .await
    }

    async fn get_assignment(&self, id: i64) -> DbResult<Assignment> {
        self.call(move |db| db.get_assignment(id)).await
    }

    async fn list_assignments(&self) -> DbResult<Vec<Assignment>> {
        self.call(Database::list_assignments).await
    }

    async fn list_assignments_for_grade(&self, grade: u8) -> DbResult<Vec<Assignment>> {
        self.call(move |db| db.list_assignments_for_grade(grade))
            .await
    }

    async fn deactivate_assignment(&self, id: i64) -> DbResult<()> {
        self.call(move |db| db.deactivate_assignment(id)).await
    }

    async fn submit_solution(
        &self,
        user: ExternalId,
        assignment_id: i64,
        text: &str,
        file_ids: &[i64],
    ) -> DbResult<Solution> {
        let text = text.to_string();
        let file_ids = file_ids.to_vec();
        self.call(move |db| db.submit_solution(user, assignment_id, &text, &file_ids))
            .await
    }

    async fn grade_solution(
        &self,
        id: i64,
        score: Score,
        comment: Option<&str>,
        file_ids: &[i64],
    ) -> DbResult<SolutionDetail> {
        let comment = comment.map(str::to_string);
        let file_ids = file_ids.to_vec();
        self.call(move |db| db.grade_solution(id, score, comment.as_deref(), &file_ids))
            .await
    }

    async fn get_solution(&self, id: i64) -> DbResult<SolutionDetail> {
        self.call(move |db| db.get_solution(id)).await
    }

    async fn list_ungraded_solutions(&self) -> DbResult<Vec<SolutionDetail>> {
        self.call(Database::list_ungraded_solutions).await
    }

    async fn list_user_solutions(&self, user: ExternalId) -> DbResult<Vec<SolutionDetail>> {
        self.call(move |db| db.list_user_solutions(user)).await
    }

    async fn compute_user_stats(&self, user: ExternalId) -> DbResult<UserStats> {
        self.call(move |db| db.compute_user_stats(user)).await
    }

    async fn record_upload(&self, file: &NewFile) -> DbResult<FileRecord> {
        let file = file.clone();
        self.call(move |db| db.record_upload(&file)).await
    }

    async fn list_files_for_object(
        &self,
        object_type: ObjectType,
        object_id: i64,
    ) -> DbResult<Vec<FileRecord>> {
        self.call(move |db| db.list_files_for_object(object_type, object_id))
            .await
    }

    async fn count_files_for_object(
        &self,
        object_type: ObjectType,
        object_id: i64,
    ) -> DbResult<u32> {
        self.call(move |db| db.count_files_for_object(object_type, object_id))
            .await
    }
}

/// Messenger for a Telegram-style bot API (`sendMessage`, `sendDocument`)
pub struct HttpMessenger {
    client: reqwest::Client,
    base_url: String,
}

impl HttpMessenger {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self, DeliveryError> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }

    async fn post(&self, method: &str, body: Value) -> Result<(), DeliveryError> {
        let response = self
            .client
            .post(format!("{}/{method}", self.base_url))
            .json(&body)
            .send()
            .await?;

        let status = response.status();
        if status.is_success() {
            return Ok(());
        }
        let body = response.text().await.unwrap_or_default();
        Err(DeliveryError::Status {
            status: status.as_u16(),
            body,
        })
    }
}

#[async_trait]
impl Messenger for HttpMessenger {
    async fn send_text(&self, recipient: ExternalId, text: &str) -> Result<(), DeliveryError> {
        self.post("sendMessage", json!({ "chat_id": recipient, "text": text }))
            .await
    }

    async fn send_file(
        &self,
        recipient: ExternalId,
        handle: &str,
        caption: Option<&str>,
    ) -> Result<(), DeliveryError> {
        self.post(
            "sendDocument",
            json!({ "chat_id": recipient, "document": handle, "caption": caption }),
        )
        .await
    }

    async fn send_choices(
        &self,
        recipient: ExternalId,
        text: &str,
        choices: &[Choice],
    ) -> Result<(), DeliveryError> {
        // One button per row
        let keyboard: Vec<Value> = choices
            .iter()
            .map(|c| json!([{ "text": c.label, "callback_data": c.data }]))
            .collect();
        self.post(
            "sendMessage",
            json!({
                "chat_id": recipient,
                "text": text,
                "reply_markup": { "inline_keyboard": keyboard },
            }),
        )
        .await
    }
}

/// Messenger used when no bot API is configured: messages go to the log
pub struct LogMessenger;

#[async_trait]
impl Messenger for LogMessenger {
    async fn send_text(&self, recipient: ExternalId, text: &str) -> Result<(), DeliveryError> {
        tracing::info!(recipient = %recipient, text = %text, "Outbound message");
        Ok(())
    }

    async fn send_file(
        &self,
        recipient: ExternalId,
        handle: &str,
        caption: Option<&str>,
    ) -> Result<(), DeliveryError> {
        tracing::info!(recipient = %recipient, handle = %handle, caption = ?caption, "Outbound file");
        Ok(())
    }
}
