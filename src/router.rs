//! Command router
//!
//! Classifies inbound transport events: bare commands and navigation
//! buttons are served here, everything else is input for the sender's
//! current flow step.

mod views;

use crate::db::{ExternalId, ObjectType};
use crate::files::Upload;
use crate::runtime::{
    Completion, EntityStore, FlowEngine, FlowError, FlowRequest, Input, Messenger, SubmitOutcome,
};
use crate::state_machine::Applicant;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use views::{Page, Role, MAX_MESSAGE_CHARS};

/// Who sent an inbound event
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Sender {
    pub id: ExternalId,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub first_name: Option<String>,
}

impl Sender {
    fn name(&self) -> String {
        self.first_name
            .clone()
            .or_else(|| self.username.clone())
            .unwrap_or_else(|| "student".to_string())
    }
}

/// Event delivered by the messaging transport
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum InboundEvent {
    /// `/name args`
    Command {
        name: String,
        #[serde(default)]
        args: String,
        sender: Sender,
    },
    FreeText {
        text: String,
        sender: Sender,
    },
    /// Reply-button press carrying its callback data
    Button {
        data: String,
        sender: Sender,
    },
    FileUpload {
        #[serde(flatten)]
        upload: Upload,
        sender: Sender,
    },
}

impl InboundEvent {
    pub fn sender(&self) -> &Sender {
        match self {
            InboundEvent::Command { sender, .. }
            | InboundEvent::FreeText { sender, .. }
            | InboundEvent::Button { sender, .. }
            | InboundEvent::FileUpload { sender, .. } => sender,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            InboundEvent::Command { .. } => "command",
            InboundEvent::FreeText { .. } => "free_text",
            InboundEvent::Button { .. } => "button",
            InboundEvent::FileUpload { .. } => "file_upload",
        }
    }
}

/// Buttons that navigate rather than answer a step
fn parse_nav_button(data: &str) -> Option<(&str, i64)> {
    let (action, id) = data.rsplit_once('_')?;
    let id = id.parse().ok()?;
    matches!(action, "solve" | "grade" | "approve" | "reject").then_some((action, id))
}

fn parse_id(command: &str, args: &str) -> Result<i64, FlowError> {
    args.split_whitespace()
        .next()
        .and_then(|a| a.parse().ok())
        .ok_or_else(|| FlowError::InvalidState(format!("Usage: /{command} <id>")))
}

/// Everything after the first argument
fn rest(args: &str) -> &str {
    args.trim()
        .split_once(char::is_whitespace)
        .map_or("", |(_, rest)| rest.trim())
}

fn log_outcome(user: ExternalId, outcome: &SubmitOutcome) {
    match outcome {
        SubmitOutcome::Advanced { step } => {
            tracing::debug!(user_id = %user, step = ?step, "Flow advanced");
        }
        SubmitOutcome::Retry { step, reason } => {
            tracing::debug!(user_id = %user, step = ?step, reason = %reason, "Flow input refused");
        }
        SubmitOutcome::Completed(Completion::RegistrationSubmitted(request)) => {
            tracing::debug!(user_id = %user, request_id = request.id, "Registration flow completed");
        }
        SubmitOutcome::Completed(Completion::AssignmentCreated {
            assignment,
            files,
            notified,
        }) => tracing::debug!(
            user_id = %user,
            assignment_id = assignment.id,
            files,
            delivered = notified.delivered,
            failed = notified.failed,
            "Assignment flow completed"
        ),
        SubmitOutcome::Completed(Completion::SolutionSubmitted { solution, files }) => {
            tracing::debug!(user_id = %user, solution_id = solution.id, files, "Solution flow completed");
        }
        SubmitOutcome::Completed(Completion::SolutionGraded(detail)) => {
            tracing::debug!(user_id = %user, solution_id = detail.solution.id, "Grading flow completed");
        }
        SubmitOutcome::Completed(Completion::RequestRejected(request)) => {
            tracing::debug!(user_id = %user, request_id = request.id, "Rejection flow completed");
        }
    }
}

pub struct CommandRouter<S: EntityStore, M: Messenger + ?Sized> {
    engine: Arc<FlowEngine<S, M>>,
}

impl<S: EntityStore, M: Messenger + ?Sized> CommandRouter<S, M> {
    pub fn new(engine: Arc<FlowEngine<S, M>>) -> Self {
        Self { engine }
    }

    pub fn engine(&self) -> &Arc<FlowEngine<S, M>> {
        &self.engine
    }

    /// Handle one inbound event. Returns the number of messages sent
    /// directly by the router; flow prompts go out through the engine.
    pub async fn handle(&self, event: InboundEvent) -> usize {
        let sender = event.sender().clone();
        let kind = event.kind();
        tracing::debug!(user_id = %sender.id, kind, "Inbound event");

        let result = match event {
            InboundEvent::Command { name, args, .. } => {
                self.command(&sender, name.trim_start_matches('/'), &args)
                    .await
            }
            InboundEvent::FreeText { text, .. } => self.free_text(&sender, text).await,
            InboundEvent::Button { data, .. } => self.button(&sender, &data).await,
            InboundEvent::FileUpload { upload, .. } => self.file(&sender, upload).await,
        };

        let pages = match result {
            Ok(pages) => pages,
            Err(e) => {
                match &e {
                    FlowError::Persistence(_) | FlowError::Delivery(_) => {
                        tracing::warn!(user_id = %sender.id, kind, error = %e, "Event failed");
                    }
                    _ => tracing::debug!(user_id = %sender.id, kind, error = %e, "Event refused"),
                }
                vec![Page::text(e.user_message())]
            }
        };
        self.send_pages(sender.id, pages).await
    }

    async fn send_pages(&self, recipient: ExternalId, pages: Vec<Page>) -> usize {
        let mut sent = 0;
        for page in pages {
            let mut parts = views::chunks(&page.text, MAX_MESSAGE_CHARS);
            let last = parts.pop().unwrap_or_default();
            for part in parts {
                self.engine.reply(recipient, &part).await;
                sent += 1;
            }
            self.engine.reply_with(recipient, &last, &page.choices).await;
            sent += 1;
            for handle in &page.files {
                if let Err(e) = self
                    .engine
                    .messenger()
                    .send_file(recipient, handle, None)
                    .await
                {
                    tracing::warn!(user_id = %recipient, error = %e, "File delivery failed");
                }
                sent += 1;
            }
        }
        sent
    }

    async fn role(&self, user: ExternalId) -> Result<Role, FlowError> {
        let store = self.engine.store();
        Ok(if store.is_admin(user).await? {
            Role::Admin
        } else if store.is_registered(user).await? {
            Role::Student
        } else if store.has_pending_request(user).await? {
            Role::Applicant
        } else {
            Role::Guest
        })
    }

    async fn start(&self, sender: &Sender, request: FlowRequest) -> Result<Vec<Page>, FlowError> {
        let outcome = self.engine.start(sender.id, request).await?;
        log_outcome(sender.id, &outcome);
        Ok(vec![])
    }

    /// Feed input to the sender's current step
    async fn submit(&self, sender: &Sender, input: Input) -> Result<Vec<Page>, FlowError> {
        let Some(step) = self.engine.current_step(sender.id).await else {
            let hint = if matches!(input, Input::File(_)) {
                "❓ File received, but no upload is expected right now."
            } else {
                "ℹ️ No form is in progress. Send /help to see the commands."
            };
            return Ok(vec![Page::text(hint)]);
        };
        let outcome = self.engine.submit_input(sender.id, step, input).await?;
        log_outcome(sender.id, &outcome);
        Ok(vec![])
    }

    async fn free_text(&self, sender: &Sender, text: String) -> Result<Vec<Page>, FlowError> {
        self.submit(sender, Input::Text(text)).await
    }

    async fn file(&self, sender: &Sender, upload: Upload) -> Result<Vec<Page>, FlowError> {
        self.submit(sender, Input::File(upload)).await
    }

    async fn button(&self, sender: &Sender, data: &str) -> Result<Vec<Page>, FlowError> {
        match parse_nav_button(data) {
            Some((action, id)) => self.command(sender, action, &id.to_string()).await,
            None => self.submit(sender, Input::Choice(data.to_string())).await,
        }
    }

    async fn command(
        &self,
        sender: &Sender,
        name: &str,
        args: &str,
    ) -> Result<Vec<Page>, FlowError> {
        let user = sender.id;
        let store = self.engine.store();

        match name {
            "start" => {
                let role = self.role(user).await?;
                let name = match role {
                    Role::Student => store.get_user(user).await?.first_name,
                    _ => sender.name(),
                };
                Ok(vec![Page::text(views::welcome(role, &name))])
            }
            "help" => Ok(vec![Page::text(views::help(self.role(user).await?))]),
            "register" => {
                let applicant = Applicant {
                    external_id: user,
                    username: sender.username.clone(),
                    first_name: sender.name(),
                };
                self.start(sender, FlowRequest::Register(applicant)).await
            }
            "cancel" => {
                self.engine.cancel(user).await;
                Ok(vec![])
            }
            "done" => match self.engine.current_step(user).await {
                Some(step) if step.is_attachment() => {
                    let outcome = self.engine.submit_input(user, step, Input::Done).await?;
                    log_outcome(user, &outcome);
                    Ok(vec![])
                }
                _ => Err(FlowError::InvalidState(
                    "There are no attachments to finish.".to_string(),
                )),
            },
            "create_assignment" => self.start(sender, FlowRequest::CreateAssignment).await,
            "solve" => {
                let assignment_id = parse_id(name, args)?;
                self.start(sender, FlowRequest::Solve { assignment_id })
                    .await
            }
            "grade" => {
                let solution_id = parse_id(name, args)?;
                self.start(sender, FlowRequest::Grade { solution_id }).await
            }
            "reject" => {
                let request_id = parse_id(name, args)?;
                self.start(sender, FlowRequest::Reject { request_id }).await
            }
            "approve" => {
                let request_id = parse_id(name, args)?;
                let student = self.engine.approve(user, request_id, rest(args)).await?;
                Ok(vec![Page::text(format!(
                    "✅ Request #{request_id} approved: {} is now a student.",
                    student.display_name()
                ))])
            }
            "assignments" => self.assignments(user).await,
            "assignment" => self.assignment(user, parse_id(name, args)?).await,
            "solution" => self.solution(user, parse_id(name, args)?).await,
            "progress" => self.progress(user).await,
            _ => self.admin_command(user, name, args).await,
        }
    }

    /// Commands only admins may run
    async fn admin_command(
        &self,
        user: ExternalId,
        name: &str,
        args: &str,
    ) -> Result<Vec<Page>, FlowError> {
        let known = matches!(
            name,
            "pending"
                | "users"
                | "ungraded"
                | "admins"
                | "add_admin"
                | "deactivate"
                | "note"
                | "close"
        );
        if !known {
            return Ok(vec![Page::text("❓ Unknown command. Send /help.")]);
        }
        self.engine.require_admin(user).await?;
        let store = self.engine.store();

        match name {
            "pending" => {
                let requests = store.list_pending_requests().await?;
                if requests.is_empty() {
                    return Ok(vec![Page::text("📋 No pending requests.")]);
                }
                Ok(requests.iter().map(views::pending_request).collect())
            }
            "users" => Ok(vec![Page::text(views::users(
                &store.list_active_users().await?,
            ))]),
            "ungraded" => Ok(views::ungraded(&store.list_ungraded_solutions().await?)),
            "admins" => Ok(vec![Page::text(views::admins(&store.list_admins().await?))]),
            "add_admin" => {
                if !store.get_admin(user).await?.is_super_admin {
                    return Err(FlowError::Forbidden("super admin rights"));
                }
                let target = parse_id(name, args)?;
                let display = match rest(args) {
                    "" => "Admin",
                    given => given,
                };
                let admin = store.add_admin(target, None, display).await?;
                tracing::info!(by = %user, admin = %admin.external_id, "Admin added");
                Ok(vec![Page::text(format!(
                    "🔑 {} [id {}] is now an admin.",
                    admin.first_name, admin.external_id
                ))])
            }
            "deactivate" => {
                let target = parse_id(name, args)?;
                store.deactivate_user(target).await?;
                tracing::info!(by = %user, user_id = %target, "Student deactivated");
                Ok(vec![Page::text(format!("Student {target} deactivated."))])
            }
            "note" => {
                let target = parse_id(name, args)?;
                let note = rest(args);
                if note.is_empty() {
                    return Err(FlowError::InvalidState(
                        "Usage: /note <user id> <text>".to_string(),
                    ));
                }
                store.update_user_notes(target, note).await?;
                Ok(vec![Page::text(format!("📝 Note saved for {target}."))])
            }
            _ => {
                let id = parse_id(name, args)?;
                store.deactivate_assignment(id).await?;
                tracing::info!(by = %user, assignment_id = id, "Assignment closed");
                Ok(vec![Page::text(format!("Assignment #{id} closed."))])
            }
        }
    }

    async fn progress(&self, user: ExternalId) -> Result<Vec<Page>, FlowError> {
        let store = self.engine.store();
        if !store.is_registered(user).await? {
            return Err(FlowError::Forbidden("registration"));
        }
        let stats = store.compute_user_stats(user).await?;
        let solutions = store.list_user_solutions(user).await?;
        Ok(vec![Page::text(views::progress(&stats, &solutions))])
    }

    async fn assignments(&self, user: ExternalId) -> Result<Vec<Page>, FlowError> {
        let store = self.engine.store();
        let text = match self.role(user).await? {
            Role::Admin => views::all_assignments(&store.list_assignments().await?),
            Role::Student => {
                let student = store.get_user(user).await?;
                views::student_assignments(
                    &store.list_assignments_for_grade(student.grade).await?,
                )
            }
            Role::Applicant | Role::Guest => return Err(FlowError::Forbidden("registration")),
        };
        Ok(vec![Page::text(text)])
    }

    async fn assignment(&self, user: ExternalId, id: i64) -> Result<Vec<Page>, FlowError> {
        let store = self.engine.store();
        let role = self.role(user).await?;
        let assignment = store.get_assignment(id).await?;
        match role {
            Role::Admin => {}
            Role::Student => {
                let student = store.get_user(user).await?;
                if !assignment.is_active || !assignment.is_visible_to_grade(student.grade) {
                    return Err(FlowError::NotFound(format!("assignment #{id}")));
                }
            }
            Role::Applicant | Role::Guest => return Err(FlowError::Forbidden("registration")),
        }
        let files = store
            .list_files_for_object(ObjectType::Assignment, id)
            .await?;
        Ok(vec![views::assignment_detail(&assignment, &files, role)])
    }

    async fn solution(&self, user: ExternalId, id: i64) -> Result<Vec<Page>, FlowError> {
        let store = self.engine.store();
        let role = self.role(user).await?;
        let detail = store.get_solution(id).await?;
        // Students only see their own work
        if role != Role::Admin && detail.solution.user_id != user {
            return Err(FlowError::NotFound(format!("solution #{id}")));
        }
        let solution_files = store.list_files_for_object(ObjectType::Solution, id).await?;
        let grade_files = if detail.solution.is_graded() {
            store.list_files_for_object(ObjectType::Grade, id).await?
        } else {
            vec![]
        };
        Ok(vec![views::solution_detail(
            &detail,
            &solution_files,
            &grade_files,
            role,
        )])
    }
}
