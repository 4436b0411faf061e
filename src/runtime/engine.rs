//! Flow engine
//!
//! Owns the per-user conversation states and executes the effects produced by
//! `state_machine::transition`. Each user's state sits behind its own async
//! mutex, so one user's inputs are handled in order while other users
//! proceed in parallel.

use super::error::FlowError;
use super::traits::{EntityStore, Messenger};
use crate::db::{
    Assignment, DbError, ExternalId, FileRecord, NewAssignment, RegistrationRequest, RequestStatus,
    Solution, SolutionDetail, User,
};
use crate::files::Upload;
use crate::notify::{dispatch, plan, DispatchReport, NotificationEvent};
use crate::state_machine::{
    prompt_for, transition, Applicant, Choice, ConvState, Effect, Event, FlowStart, Step,
};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, OwnedMutexGuard, RwLock};

/// Unchecked request to enter a flow. The engine resolves it into a
/// `FlowStart` after checking permissions against the store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FlowRequest {
    Register(Applicant),
    CreateAssignment,
    Solve { assignment_id: i64 },
    Grade { solution_id: i64 },
    Reject { request_id: i64 },
}

/// Input for the step a user is on
#[derive(Debug, Clone, PartialEq)]
pub enum Input {
    Text(String),
    Choice(String),
    File(Upload),
    /// Explicit end of the attachment sub-loop
    Done,
}

impl From<Input> for Event {
    fn from(input: Input) -> Self {
        match input {
            Input::Text(text) => Event::Text(text),
            Input::Choice(data) => Event::Choice(data),
            Input::File(upload) => Event::File(upload),
            Input::Done => Event::FinishAttachments,
        }
    }
}

/// What became of a submitted input
#[derive(Debug, Clone, PartialEq)]
pub enum SubmitOutcome {
    /// Accepted; the flow now waits on `step`
    Advanced { step: Step },
    /// Refused; the user was re-prompted for the same step
    Retry { step: Step, reason: String },
    /// The flow finished and its writes are committed
    Completed(Completion),
}

#[derive(Debug, Clone, PartialEq)]
pub enum Completion {
    RegistrationSubmitted(RegistrationRequest),
    AssignmentCreated {
        assignment: Assignment,
        files: usize,
        notified: DispatchReport,
    },
    SolutionSubmitted {
        solution: Solution,
        files: usize,
    },
    SolutionGraded(SolutionDetail),
    RequestRejected(RegistrationRequest),
}

enum Executed {
    Done,
    Feedback(Event),
    Completed(Completion),
}

pub struct FlowEngine<S: EntityStore, M: Messenger + ?Sized> {
    store: Arc<S>,
    messenger: Arc<M>,
    /// Receives registration requests
    primary_admin: ExternalId,
    /// Only users with an active flow have an entry
    sessions: RwLock<HashMap<ExternalId, Arc<Mutex<ConvState>>>>,
}

impl<S: EntityStore, M: Messenger + ?Sized> FlowEngine<S, M> {
    pub fn new(store: Arc<S>, messenger: Arc<M>, primary_admin: ExternalId) -> Self {
        Self {
            store,
            messenger,
            primary_admin,
            sessions: RwLock::new(HashMap::new()),
        }
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    pub fn messenger(&self) -> &Arc<M> {
        &self.messenger
    }

    async fn existing_session(&self, user: ExternalId) -> Option<Arc<Mutex<ConvState>>> {
        self.sessions.read().await.get(&user).cloned()
    }

    /// Lock the user's session, creating it if needed.
    ///
    /// A session removed by `release` while we waited for its lock is
    /// orphaned, so we retry against the map.
    async fn lock_session(&self, user: ExternalId) -> OwnedMutexGuard<ConvState> {
        loop {
            let session = match self.existing_session(user).await {
                Some(session) => session,
                None => self.sessions.write().await.entry(user).or_default().clone(),
            };
            let guard = session.clone().lock_owned().await;
            if self.is_current(user, &session).await {
                return guard;
            }
        }
    }

    /// Lock the user's session only if one exists
    async fn lock_existing(&self, user: ExternalId) -> Option<OwnedMutexGuard<ConvState>> {
        loop {
            let session = self.existing_session(user).await?;
            let guard = session.clone().lock_owned().await;
            if self.is_current(user, &session).await {
                return Some(guard);
            }
        }
    }

    async fn is_current(&self, user: ExternalId, session: &Arc<Mutex<ConvState>>) -> bool {
        self.sessions
            .read()
            .await
            .get(&user)
            .is_some_and(|current| Arc::ptr_eq(current, session))
    }

    /// Drop the session entry once the user is back to idle. The state lock
    /// is held until the entry is gone.
    async fn release(&self, user: ExternalId, state: OwnedMutexGuard<ConvState>) {
        if state.is_idle() {
            self.sessions.write().await.remove(&user);
        }
        drop(state);
    }

    /// Step the user's flow waits on, `None` when no flow is active
    pub async fn current_step(&self, user: ExternalId) -> Option<Step> {
        let session = self.existing_session(user).await?;
        let state = session.lock().await;
        state.step()
    }

    /// Clear the user's flow. Returns whether one was active.
    pub async fn cancel(&self, user: ExternalId) -> bool {
        let state = self.lock_existing(user).await;
        let was_active = state.as_ref().is_some_and(|s| !s.is_idle());
        let current = state.as_deref().cloned().unwrap_or_default();
        if let Ok(result) = transition(&current, Event::Cancel) {
            for effect in result.effects {
                if let Effect::Reply { text, choices } = effect {
                    self.reply_with(user, &text, &choices).await;
                }
            }
        }
        if let Some(mut state) = state {
            *state = ConvState::Idle;
            self.release(user, state).await;
        }
        if was_active {
            tracing::info!(user_id = %user, "Flow cancelled");
        }
        was_active
    }

    pub async fn start(
        &self,
        user: ExternalId,
        request: FlowRequest,
    ) -> Result<SubmitOutcome, FlowError> {
        let mut state = self.lock_session(user).await;
        if let Some(step) = state.step() {
            return Err(FlowError::Busy(step));
        }
        let outcome = match self.authorize(user, request).await {
            Ok(start) => {
                tracing::info!(user_id = %user, flow = ?start, "Flow started");
                self.process(user, &mut state, Event::Start(start)).await
            }
            Err(e) => Err(e),
        };
        self.release(user, state).await;
        outcome
    }

    /// Feed input for `step`. A `step` other than the current one is stale
    /// and refused.
    pub async fn submit_input(
        &self,
        user: ExternalId,
        step: Step,
        input: Input,
    ) -> Result<SubmitOutcome, FlowError> {
        let Some(mut state) = self.lock_existing(user).await else {
            return Err(FlowError::InvalidState(
                "No form is in progress.".to_string(),
            ));
        };
        let outcome = match state.step() {
            None => Err(FlowError::InvalidState(
                "No form is in progress.".to_string(),
            )),
            Some(current) if current != step => Err(FlowError::InvalidState(format!(
                "Input was for step {step:?} but the form is at {current:?}."
            ))),
            Some(_) => self.process(user, &mut state, input.into()).await,
        };
        self.release(user, state).await;
        outcome
    }

    pub async fn require_admin(&self, user: ExternalId) -> Result<(), FlowError> {
        if self.store.is_admin(user).await? {
            Ok(())
        } else {
            Err(FlowError::Forbidden("admin rights"))
        }
    }

    /// Approve a pending registration and welcome the new student
    pub async fn approve(
        &self,
        admin: ExternalId,
        request_id: i64,
        comment: &str,
    ) -> Result<User, FlowError> {
        self.require_admin(admin).await?;
        let user = self.store.approve_request(request_id, comment).await?;
        tracing::info!(admin = %admin, request_id, user_id = %user.external_id, "Registration approved");
        self.notify(NotificationEvent::RequestApproved { user: user.clone() })
            .await;
        Ok(user)
    }

    pub async fn notify(&self, event: NotificationEvent) -> DispatchReport {
        let deliveries = plan(&event);
        let report = dispatch(deliveries, self.messenger.as_ref()).await;
        tracing::debug!(
            delivered = report.delivered,
            failed = report.failed,
            "Notifications dispatched"
        );
        report
    }

    async fn authorize(&self, user: ExternalId, request: FlowRequest) -> Result<FlowStart, FlowError> {
        match request {
            FlowRequest::Register(applicant) => {
                if self.store.is_registered(user).await? {
                    return Err(FlowError::InvalidState(
                        "You are already registered.".to_string(),
                    ));
                }
                if self.store.has_pending_request(user).await? {
                    return Err(FlowError::DuplicateRequest);
                }
                Ok(FlowStart::Registration(applicant))
            }
            FlowRequest::CreateAssignment => {
                self.require_admin(user).await?;
                Ok(FlowStart::Assignment { admin: user })
            }
            FlowRequest::Solve { assignment_id } => {
                if !self.store.is_registered(user).await? {
                    return Err(FlowError::Forbidden("registration"));
                }
                let student = self.store.get_user(user).await?;
                let assignment = self.store.get_assignment(assignment_id).await?;
                if !assignment.is_active || !assignment.is_visible_to_grade(student.grade) {
                    return Err(FlowError::NotFound(format!("assignment #{assignment_id}")));
                }
                Ok(FlowStart::Solution {
                    user,
                    assignment_id,
                    title: assignment.title,
                })
            }
            FlowRequest::Grade { solution_id } => {
                self.require_admin(user).await?;
                self.store.get_solution(solution_id).await?;
                Ok(FlowStart::Grading {
                    admin: user,
                    solution_id,
                })
            }
            FlowRequest::Reject { request_id } => {
                self.require_admin(user).await?;
                let request = self.store.get_registration_request(request_id).await?;
                if request.status != RequestStatus::Pending {
                    return Err(FlowError::InvalidState(format!(
                        "Request #{request_id} is already {}.",
                        request.status
                    )));
                }
                Ok(FlowStart::Rejection {
                    admin: user,
                    request_id,
                })
            }
        }
    }

    /// Run an event through the state machine, executing effects until no
    /// more events are generated.
    async fn process(
        &self,
        user: ExternalId,
        state: &mut ConvState,
        event: Event,
    ) -> Result<SubmitOutcome, FlowError> {
        let mut events_to_process = vec![event];
        let mut completion = None;

        while let Some(current_event) = events_to_process.pop() {
            let result = match transition(state, current_event).map_err(FlowError::from) {
                Ok(r) => r,
                Err(FlowError::Validation(reason)) => return self.retry(user, state, reason).await,
                Err(e) => return Err(e),
            };

            if result.completion().is_some() {
                tracing::debug!(user_id = %user, "Running completion write");
            }
            let previous = std::mem::replace(state, result.new_state);

            for effect in result.effects {
                match self.execute_effect(user, effect).await {
                    Ok(Executed::Done) => {}
                    Ok(Executed::Feedback(event)) => events_to_process.push(event),
                    Ok(Executed::Completed(done)) => completion = Some(done),
                    Err(e) => {
                        *state = if e.clears_flow() {
                            ConvState::Idle
                        } else {
                            // Keep the collected answers so the last step can be retried
                            previous
                        };
                        tracing::warn!(user_id = %user, error = %e, "Flow effect failed");
                        return Err(e);
                    }
                }
            }
        }

        if let Some(done) = completion {
            return Ok(SubmitOutcome::Completed(done));
        }
        state
            .step()
            .map(|step| SubmitOutcome::Advanced { step })
            .ok_or_else(|| FlowError::InvalidState("The form ended unexpectedly.".to_string()))
    }

    async fn retry(
        &self,
        user: ExternalId,
        state: &ConvState,
        reason: String,
    ) -> Result<SubmitOutcome, FlowError> {
        let step = state
            .step()
            .ok_or_else(|| FlowError::InvalidState("No form is in progress.".to_string()))?;
        tracing::debug!(user_id = %user, step = ?step, reason = %reason, "Input refused");
        self.reply(user, &reason).await;
        // Buttons disappear with the message they came on
        if step.is_choice() || step.is_attachment() {
            if let Effect::Reply { text, choices } = prompt_for(step) {
                self.reply_with(user, &text, &choices).await;
            }
        }
        Ok(SubmitOutcome::Retry { step, reason })
    }

    /// A timed-out write may still commit in the background. The store
    /// serializes access, so a pending request written by it is visible here.
    async fn recover_registration(
        &self,
        user: ExternalId,
        after: Duration,
    ) -> Result<RegistrationRequest, FlowError> {
        let pending = self.store.list_pending_requests().await?;
        match pending.into_iter().find(|r| r.external_id == user) {
            Some(request) => {
                tracing::warn!(
                    user_id = %user,
                    request_id = request.id,
                    "Registration committed after store timeout"
                );
                Ok(request)
            }
            None => Err(DbError::Timeout(after).into()),
        }
    }

    async fn execute_effect(&self, user: ExternalId, effect: Effect) -> Result<Executed, FlowError> {
        let completion = match effect {
            Effect::Reply { text, choices } => {
                self.reply_with(user, &text, &choices).await;
                return Ok(Executed::Done);
            }
            Effect::RecordUpload { file } => {
                let record = self.store.record_upload(&file).await?;
                tracing::debug!(user_id = %user, file_id = record.id, name = %record.file_name, "Upload recorded");
                return Ok(Executed::Feedback(Event::UploadRecorded(record)));
            }
            Effect::CompleteRegistration { request } => {
                let created = match self.store.create_registration_request(&request).await {
                    Ok(created) => created,
                    Err(DbError::Timeout(after)) => self.recover_registration(user, after).await?,
                    Err(e) => return Err(e.into()),
                };
                tracing::info!(user_id = %user, request_id = created.id, "Registration request created");
                self.reply(
                    user,
                    "✅ Your request has been sent! We will let you know once it is reviewed.",
                )
                .await;
                self.notify(NotificationEvent::RegistrationReceived {
                    request: created.clone(),
                    admin: self.primary_admin,
                })
                .await;
                Completion::RegistrationSubmitted(created)
            }
            Effect::CreateAssignment { assignment, files } => {
                self.create_assignment(user, &assignment, files).await?
            }
            Effect::SubmitSolution {
                user_id,
                assignment_id,
                text,
                files,
            } => {
                self.submit_solution(user_id, assignment_id, &text, files)
                    .await?
            }
            Effect::GradeSolution {
                solution_id,
                score,
                comment,
                files,
            } => {
                let detail = self
                    .store
                    .grade_solution(solution_id, score, comment.as_deref(), &file_ids(&files))
                    .await?;
                tracing::info!(user_id = %user, solution_id, score = %score, "Solution graded");
                self.reply(
                    user,
                    &format!(
                        "✅ Solution #{solution_id} graded: {score} ({}%).",
                        score.percentage()
                    ),
                )
                .await;
                self.notify(NotificationEvent::GradePosted {
                    detail: detail.clone(),
                    files,
                })
                .await;
                Completion::SolutionGraded(detail)
            }
            Effect::RejectRequest { request_id, reason } => {
                let request = self.store.reject_request(request_id, &reason).await?;
                tracing::info!(user_id = %user, request_id, "Registration rejected");
                self.reply(user, &format!("Request #{request_id} rejected."))
                    .await;
                self.notify(NotificationEvent::RequestRejected {
                    request: request.clone(),
                })
                .await;
                Completion::RequestRejected(request)
            }
        };
        Ok(Executed::Completed(completion))
    }

    async fn create_assignment(
        &self,
        admin: ExternalId,
        assignment: &NewAssignment,
        files: Vec<FileRecord>,
    ) -> Result<Completion, FlowError> {
        let created = self
            .store
            .create_assignment(assignment, &file_ids(&files))
            .await?;
        tracing::info!(user_id = %admin, assignment_id = created.id, files = files.len(), "Assignment created");
        self.reply(
            admin,
            &format!(
                "✅ Assignment #{} \"{}\" created for {}.",
                created.id,
                created.title,
                created.audience_label()
            ),
        )
        .await;
        let audience = self.store.list_active_users().await.unwrap_or_else(|e| {
            tracing::warn!(error = %e, "Could not load the assignment audience");
            vec![]
        });
        let count = files.len();
        let notified = self
            .notify(NotificationEvent::NewAssignment {
                assignment: created.clone(),
                audience,
                files,
            })
            .await;
        Ok(Completion::AssignmentCreated {
            assignment: created,
            files: count,
            notified,
        })
    }

    async fn submit_solution(
        &self,
        user: ExternalId,
        assignment_id: i64,
        text: &str,
        files: Vec<FileRecord>,
    ) -> Result<Completion, FlowError> {
        let solution = self
            .store
            .submit_solution(user, assignment_id, text, &file_ids(&files))
            .await?;
        tracing::info!(user_id = %user, solution_id = solution.id, assignment_id, "Solution submitted");
        self.reply(
            user,
            "✅ Solution submitted! You will be notified when it is graded.",
        )
        .await;
        let count = files.len();
        match self.store.get_solution(solution.id).await {
            Ok(detail) => {
                self.notify(NotificationEvent::NewSolution { detail, files })
                    .await;
            }
            Err(e) => {
                tracing::warn!(solution_id = solution.id, error = %e, "Could not notify about solution");
            }
        }
        Ok(Completion::SolutionSubmitted {
            solution,
            files: count,
        })
    }

    pub async fn reply(&self, user: ExternalId, text: &str) {
        self.reply_with(user, text, &[]).await;
    }

    /// Delivery failures are logged, never propagated
    pub async fn reply_with(&self, user: ExternalId, text: &str, choices: &[Choice]) {
        if let Err(e) = self.messenger.send_choices(user, text, choices).await {
            tracing::warn!(user_id = %user, error = %e, "Reply delivery failed");
        }
    }
}

fn file_ids(files: &[FileRecord]) -> Vec<i64> {
    files.iter().map(|f| f.id).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{Difficulty, NewRegistration, ObjectType};
    use crate::runtime::testing::{test_store, FlakyStore, RecordingMessenger, ADMIN};
    use crate::runtime::DatabaseStore;
    use crate::state_machine::FILES_DONE;

    type TestEngine = FlowEngine<FlakyStore<DatabaseStore>, RecordingMessenger>;

    fn engine() -> TestEngine {
        FlowEngine::new(
            Arc::new(FlakyStore::new(test_store())),
            Arc::new(RecordingMessenger::new()),
            ADMIN,
        )
    }

    fn applicant(id: ExternalId) -> Applicant {
        Applicant {
            external_id: id,
            username: Some(format!("student{id}")),
            first_name: "Anna".to_string(),
        }
    }

    async fn answer(engine: &TestEngine, user: ExternalId, text: &str) -> SubmitOutcome {
        let step = engine.current_step(user).await.unwrap();
        engine
            .submit_input(user, step, Input::Text(text.to_string()))
            .await
            .unwrap()
    }

    async fn register(engine: &TestEngine, user: ExternalId, grade: &str) -> SubmitOutcome {
        engine
            .start(user, FlowRequest::Register(applicant(user)))
            .await
            .unwrap();
        for text in ["Petrova", "+79990001122", grade, "Mother, +79990003344"] {
            answer(engine, user, text).await;
        }
        answer(engine, user, "Preparing for the exams").await
    }

    async fn enroll(engine: &TestEngine, user: ExternalId, grade: &str) {
        let SubmitOutcome::Completed(Completion::RegistrationSubmitted(request)) =
            register(engine, user, grade).await
        else {
            panic!("registration did not complete");
        };
        engine.approve(ADMIN, request.id, "").await.unwrap();
    }

    async fn create_assignment(engine: &TestEngine, grade: &str) -> Assignment {
        engine
            .start(ADMIN, FlowRequest::CreateAssignment)
            .await
            .unwrap();
        for text in ["Fractions", "Add the fractions below", grade] {
            answer(engine, ADMIN, text).await;
        }
        engine
            .submit_input(
                ADMIN,
                Step::Difficulty,
                Input::Choice("difficulty_medium".to_string()),
            )
            .await
            .unwrap();
        answer(engine, ADMIN, "-").await;
        let SubmitOutcome::Completed(Completion::AssignmentCreated { assignment, .. }) =
            answer(engine, ADMIN, "done").await
        else {
            panic!("assignment did not complete");
        };
        assignment
    }

    #[tokio::test]
    async fn test_registration_creates_pending_request_and_notifies_admin() {
        let engine = engine();
        let outcome = register(&engine, 42, "7").await;

        let SubmitOutcome::Completed(Completion::RegistrationSubmitted(request)) = outcome else {
            panic!("expected completion, got {outcome:?}");
        };
        assert_eq!(request.status, RequestStatus::Pending);
        assert_eq!(engine.current_step(42).await, None);
        assert_eq!(engine.store().list_pending_requests().await.unwrap().len(), 1);

        let admin_inbox = engine.messenger().choices_for(ADMIN);
        assert!(admin_inbox
            .iter()
            .any(|c| c.data == format!("approve_{}", request.id)));
    }

    #[tokio::test]
    async fn test_invalid_input_retries_same_step() {
        let engine = engine();
        engine
            .start(42, FlowRequest::Register(applicant(42)))
            .await
            .unwrap();
        answer(&engine, 42, "Petrova").await;
        answer(&engine, 42, "+79990001122").await;

        let outcome = answer(&engine, 42, "12").await;
        assert!(matches!(outcome, SubmitOutcome::Retry { step: Step::Grade, .. }));
        assert_eq!(engine.current_step(42).await, Some(Step::Grade));
        assert!(engine
            .messenger()
            .texts_for(42)
            .iter()
            .any(|t| t.contains("from 1 to 11")));
    }

    #[tokio::test]
    async fn test_stale_step_is_refused() {
        let engine = engine();
        engine
            .start(42, FlowRequest::Register(applicant(42)))
            .await
            .unwrap();
        let err = engine
            .submit_input(42, Step::Phone, Input::Text("+79990001122".to_string()))
            .await
            .unwrap_err();
        assert!(matches!(err, FlowError::InvalidState(_)));
        assert_eq!(engine.current_step(42).await, Some(Step::LastName));
    }

    #[tokio::test]
    async fn test_second_registration_is_duplicate() {
        let engine = engine();
        register(&engine, 42, "7").await;
        let err = engine
            .start(42, FlowRequest::Register(applicant(42)))
            .await
            .unwrap_err();
        assert_eq!(err, FlowError::DuplicateRequest);
    }

    #[tokio::test]
    async fn test_duplicate_at_completion_clears_flow() {
        let engine = engine();
        engine
            .start(42, FlowRequest::Register(applicant(42)))
            .await
            .unwrap();
        for text in ["Petrova", "+79990001122", "7", "Mother, +79990003344"] {
            answer(&engine, 42, text).await;
        }
        // Another path filed a request while this form was open
        engine
            .store()
            .create_registration_request(&NewRegistration {
                external_id: 42,
                username: None,
                first_name: "Anna".to_string(),
                last_name: "Petrova".to_string(),
                phone: "+79990001122".to_string(),
                grade: 7,
                parent_contact: "Mother".to_string(),
                motivation: "Elsewhere".to_string(),
            })
            .await
            .unwrap();

        let err = engine
            .submit_input(
                42,
                Step::Motivation,
                Input::Text("Preparing for the exams".to_string()),
            )
            .await
            .unwrap_err();
        assert_eq!(err, FlowError::DuplicateRequest);
        assert_eq!(engine.current_step(42).await, None);
        assert_eq!(engine.store().list_pending_requests().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_persistence_failure_restores_last_step() {
        let engine = engine();
        engine
            .start(42, FlowRequest::Register(applicant(42)))
            .await
            .unwrap();
        for text in ["Petrova", "+79990001122", "7", "Mother, +79990003344"] {
            answer(&engine, 42, text).await;
        }

        engine.store().fail("create_registration_request");
        let err = engine
            .submit_input(
                42,
                Step::Motivation,
                Input::Text("Preparing for the exams".to_string()),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, FlowError::Persistence(_)));
        assert_eq!(engine.current_step(42).await, Some(Step::Motivation));

        engine.store().heal("create_registration_request");
        let outcome = answer(&engine, 42, "Preparing for the exams").await;
        assert!(matches!(
            outcome,
            SubmitOutcome::Completed(Completion::RegistrationSubmitted(_))
        ));
    }

    #[tokio::test]
    async fn test_non_admin_cannot_create_assignment() {
        let engine = engine();
        let err = engine
            .start(42, FlowRequest::CreateAssignment)
            .await
            .unwrap_err();
        assert_eq!(err, FlowError::Forbidden("admin rights"));
        assert_eq!(engine.current_step(42).await, None);
    }

    #[tokio::test]
    async fn test_start_while_busy() {
        let engine = engine();
        engine
            .start(ADMIN, FlowRequest::CreateAssignment)
            .await
            .unwrap();
        let err = engine
            .start(ADMIN, FlowRequest::Grade { solution_id: 1 })
            .await
            .unwrap_err();
        assert_eq!(err, FlowError::Busy(Step::Title));
    }

    #[tokio::test]
    async fn test_cancel_is_idempotent() {
        let engine = engine();
        engine
            .start(ADMIN, FlowRequest::CreateAssignment)
            .await
            .unwrap();
        assert!(engine.cancel(ADMIN).await);
        assert!(!engine.cancel(ADMIN).await);
        assert_eq!(engine.current_step(ADMIN).await, None);
    }

    #[tokio::test]
    async fn test_assignment_reaches_matching_students_with_files() {
        let engine = engine();
        enroll(&engine, 10, "7").await;
        enroll(&engine, 11, "8").await;

        engine
            .start(ADMIN, FlowRequest::CreateAssignment)
            .await
            .unwrap();
        for text in ["Fractions", "Add the fractions below", "7"] {
            answer(&engine, ADMIN, text).await;
        }
        engine
            .submit_input(
                ADMIN,
                Step::Difficulty,
                Input::Choice("difficulty_easy".to_string()),
            )
            .await
            .unwrap();
        answer(&engine, ADMIN, "01.12.2026").await;

        let upload = Upload {
            handle: "sheet-handle".to_string(),
            unique_id: "sheet".to_string(),
            filename: Some("sheet.pdf".to_string()),
            byte_size: 4096,
            mime_hint: None,
        };
        let outcome = engine
            .submit_input(ADMIN, Step::AssignmentFiles, Input::File(upload))
            .await
            .unwrap();
        assert_eq!(outcome, SubmitOutcome::Advanced {
            step: Step::AssignmentFiles
        });

        let outcome = engine
            .submit_input(
                ADMIN,
                Step::AssignmentFiles,
                Input::Choice(FILES_DONE.to_string()),
            )
            .await
            .unwrap();
        let SubmitOutcome::Completed(Completion::AssignmentCreated {
            assignment,
            files,
            notified,
        }) = outcome
        else {
            panic!("expected assignment completion");
        };
        assert_eq!(files, 1);
        assert_eq!(notified.delivered, 1);
        assert_eq!(assignment.difficulty, Difficulty::Easy);

        let linked = engine
            .store()
            .list_files_for_object(ObjectType::Assignment, assignment.id)
            .await
            .unwrap();
        assert_eq!(linked.len(), 1);
        assert_eq!(engine.messenger().files_for(10), vec!["sheet-handle"]);
        assert!(engine.messenger().files_for(11).is_empty());
    }

    #[tokio::test]
    async fn test_solve_grade_round_trip() {
        let engine = engine();
        enroll(&engine, 42, "7").await;
        let assignment = create_assignment(&engine, "0").await;

        engine
            .start(42, FlowRequest::Solve {
                assignment_id: assignment.id,
            })
            .await
            .unwrap();
        answer(&engine, 42, "One half plus one third is five sixths").await;
        let SubmitOutcome::Completed(Completion::SolutionSubmitted { solution, .. }) =
            engine.submit_input(42, Step::SolutionFiles, Input::Done).await.unwrap()
        else {
            panic!("expected solution completion");
        };
        assert!(engine
            .messenger()
            .choices_for(ADMIN)
            .iter()
            .any(|c| c.data == format!("grade_{}", solution.id)));

        engine
            .start(ADMIN, FlowRequest::Grade {
                solution_id: solution.id,
            })
            .await
            .unwrap();
        answer(&engine, ADMIN, "9/10").await;
        answer(&engine, ADMIN, "Well done").await;
        let SubmitOutcome::Completed(Completion::SolutionGraded(detail)) =
            answer(&engine, ADMIN, "/done").await
        else {
            panic!("expected grading completion");
        };
        assert_eq!(detail.solution.score, Some(9));
        assert!(engine
            .messenger()
            .texts_for(42)
            .iter()
            .any(|t| t.contains("9/10 (90%)") && t.contains("Well done")));
    }

    #[tokio::test]
    async fn test_assignment_for_other_grade_is_hidden() {
        let engine = engine();
        enroll(&engine, 42, "7").await;
        let assignment = create_assignment(&engine, "9").await;

        let err = engine
            .start(42, FlowRequest::Solve {
                assignment_id: assignment.id,
            })
            .await
            .unwrap_err();
        assert!(matches!(err, FlowError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_rejection_notifies_applicant() {
        let engine = engine();
        let SubmitOutcome::Completed(Completion::RegistrationSubmitted(request)) =
            register(&engine, 42, "7").await
        else {
            panic!("registration did not complete");
        };

        engine
            .start(ADMIN, FlowRequest::Reject {
                request_id: request.id,
            })
            .await
            .unwrap();
        let outcome = answer(&engine, ADMIN, "The group is full").await;
        assert!(matches!(
            outcome,
            SubmitOutcome::Completed(Completion::RequestRejected(_))
        ));
        assert!(engine
            .messenger()
            .texts_for(42)
            .iter()
            .any(|t| t.contains("The group is full")));

        let err = engine
            .start(ADMIN, FlowRequest::Reject {
                request_id: request.id,
            })
            .await
            .unwrap_err();
        assert!(matches!(err, FlowError::InvalidState(_)));
    }

    #[tokio::test]
    async fn test_users_progress_in_parallel() {
        let engine = Arc::new(engine());
        let handles: Vec<_> = (100..120)
            .map(|user| {
                let engine = engine.clone();
                tokio::spawn(async move { register(&engine, user, "5").await })
            })
            .collect();
        for handle in handles {
            assert!(matches!(
                handle.await.unwrap(),
                SubmitOutcome::Completed(Completion::RegistrationSubmitted(_))
            ));
        }
        assert_eq!(engine.store().list_pending_requests().await.unwrap().len(), 20);
    }

    #[tokio::test]
    async fn test_failed_reply_does_not_fail_the_flow() {
        let engine = engine();
        engine.messenger().fail_for(ADMIN);
        let outcome = register(&engine, 42, "7").await;
        assert!(matches!(
            outcome,
            SubmitOutcome::Completed(Completion::RegistrationSubmitted(_))
        ));
    }

    #[tokio::test]
    async fn test_deactivated_student_can_reapply() {
        let engine = engine();
        enroll(&engine, 42, "7").await;
        engine.store().deactivate_user(42).await.unwrap();

        let SubmitOutcome::Completed(Completion::RegistrationSubmitted(request)) =
            register(&engine, 42, "8").await
        else {
            panic!("second registration did not complete");
        };
        let student = engine.approve(ADMIN, request.id, "welcome back").await.unwrap();

        assert!(student.is_active);
        assert_eq!(student.grade, 8);
        assert!(engine.store().is_registered(42).await.unwrap());
        assert!(!engine.store().has_pending_request(42).await.unwrap());
        assert_eq!(
            engine
                .store()
                .get_registration_request(request.id)
                .await
                .unwrap()
                .status,
            RequestStatus::Approved
        );
    }

    #[tokio::test]
    async fn test_idle_users_hold_no_session() {
        let engine = engine();
        for user in 100..600 {
            assert_eq!(engine.current_step(user).await, None);
            assert!(!engine.cancel(user).await);
        }
        assert!(engine.sessions.read().await.is_empty());

        // Refused starts and finished flows leave nothing behind either
        let err = engine.start(7, FlowRequest::CreateAssignment).await.unwrap_err();
        assert_eq!(err, FlowError::Forbidden("admin rights"));
        enroll(&engine, 42, "7").await;
        create_assignment(&engine, "7").await;
        assert!(engine.sessions.read().await.is_empty());

        engine
            .start(43, FlowRequest::Register(applicant(43)))
            .await
            .unwrap();
        assert_eq!(engine.sessions.read().await.len(), 1);
        assert!(engine.cancel(43).await);
        assert!(engine.sessions.read().await.is_empty());
    }

    #[tokio::test]
    async fn test_registration_committed_after_timeout_completes() {
        let engine = engine();
        engine.store().time_out_registrations_after_commit();

        let outcome = register(&engine, 42, "7").await;
        let SubmitOutcome::Completed(Completion::RegistrationSubmitted(request)) = outcome else {
            panic!("expected completion, got {outcome:?}");
        };
        assert_eq!(request.external_id, 42);
        assert_eq!(engine.current_step(42).await, None);
        assert!(engine
            .messenger()
            .choices_for(ADMIN)
            .iter()
            .any(|c| c.data == format!("approve_{}", request.id)));
    }
}
