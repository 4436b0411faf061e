//! Notification fan-out
//!
//! `plan` turns a domain event into deliveries without touching I/O;
//! `dispatch` sends them concurrently. A failed delivery is logged and
//! counted, never retried and never surfaced to the caller.

use crate::db::{
    Assignment, ExternalId, FileRecord, RegistrationRequest, SolutionDetail, User,
};
use crate::runtime::Messenger;
use crate::state_machine::Choice;
use futures::future::join_all;

/// Something other participants should hear about
#[derive(Debug, Clone)]
pub enum NotificationEvent {
    /// `audience` is every active user; the plan narrows it by grade
    NewAssignment {
        assignment: Assignment,
        audience: Vec<User>,
        files: Vec<FileRecord>,
    },
    NewSolution {
        detail: SolutionDetail,
        files: Vec<FileRecord>,
    },
    GradePosted {
        detail: SolutionDetail,
        files: Vec<FileRecord>,
    },
    RegistrationReceived {
        request: RegistrationRequest,
        admin: ExternalId,
    },
    RequestApproved {
        user: User,
    },
    RequestRejected {
        request: RegistrationRequest,
    },
}

/// One message to one recipient
#[derive(Debug, Clone, PartialEq)]
pub struct Delivery {
    pub recipient: ExternalId,
    pub text: String,
    pub choices: Vec<Choice>,
    /// Transport handles re-sent after the text
    pub files: Vec<String>,
}

impl Delivery {
    fn text(recipient: ExternalId, text: String) -> Self {
        Self {
            recipient,
            text,
            choices: vec![],
            files: vec![],
        }
    }

    fn with_choice(mut self, choice: Choice) -> Self {
        self.choices.push(choice);
        self
    }

    fn with_files(mut self, files: &[FileRecord]) -> Self {
        self.files = files.iter().map(|f| f.handle.clone()).collect();
        self
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatchReport {
    pub delivered: usize,
    pub failed: usize,
}

/// Colour marker for a percentage
pub fn grade_marker(percentage: f64) -> &'static str {
    if percentage >= 80.0 {
        "🟢"
    } else if percentage >= 60.0 {
        "🟡"
    } else {
        "🔴"
    }
}

pub fn plan(event: &NotificationEvent) -> Vec<Delivery> {
    match event {
        NotificationEvent::NewAssignment {
            assignment,
            audience,
            files,
        } => {
            let due = assignment
                .due_date
                .map(|d| format!("\n📅 Due: {}", d.format("%d.%m.%Y")))
                .unwrap_or_default();
            let text = format!(
                "📚 New assignment: {}\n{} {}\n\n{}{due}",
                assignment.title,
                assignment.difficulty.marker(),
                assignment.difficulty,
                assignment.description,
            );
            audience
                .iter()
                .filter(|u| u.is_active && assignment.is_visible_to_grade(u.grade))
                .map(|u| {
                    Delivery::text(u.external_id, text.clone())
                        .with_choice(Choice::new(
                            "✍️ Submit a solution",
                            format!("solve_{}", assignment.id),
                        ))
                        .with_files(files)
                })
                .collect()
        }
        NotificationEvent::NewSolution { detail, files } => {
            let text = format!(
                "📥 New solution #{} for \"{}\"\nFrom: {} (grade {})\n\n{}",
                detail.solution.id,
                detail.assignment_title,
                detail.student_name,
                detail.student_grade,
                detail.solution.text,
            );
            vec![Delivery::text(detail.assignment_creator, text)
                .with_choice(Choice::new(
                    "📊 Grade",
                    format!("grade_{}", detail.solution.id),
                ))
                .with_files(files)]
        }
        NotificationEvent::GradePosted { detail, files } => {
            let Some(score) = detail.solution.grade() else {
                return vec![];
            };
            let percentage = score.percentage();
            let comment = detail
                .solution
                .comment
                .as_deref()
                .map(|c| format!("\n💬 {c}"))
                .unwrap_or_default();
            let text = format!(
                "{} Your solution for \"{}\" was graded: {score} ({percentage}%){comment}",
                grade_marker(percentage),
                detail.assignment_title,
            );
            vec![Delivery::text(detail.solution.user_id, text).with_files(files)]
        }
        NotificationEvent::RegistrationReceived { request, admin } => {
            let username = request
                .username
                .as_deref()
                .map(|u| format!(" (@{u})"))
                .unwrap_or_default();
            let text = format!(
                "🆕 Registration request #{}\n{}{username}\nGrade: {}\nPhone: {}\nParent: {}\nMotivation: {}",
                request.id,
                request.display_name(),
                request.grade,
                request.phone,
                request.parent_contact,
                request.motivation,
            );
            vec![Delivery::text(*admin, text)
                .with_choice(Choice::new("✅ Approve", format!("approve_{}", request.id)))
                .with_choice(Choice::new("❌ Reject", format!("reject_{}", request.id)))]
        }
        NotificationEvent::RequestApproved { user } => vec![Delivery::text(
            user.external_id,
            format!(
                "🎉 {}, your registration was approved! Send /assignments to see your tasks.",
                user.first_name
            ),
        )],
        NotificationEvent::RequestRejected { request } => {
            let reason = request.admin_comment.as_deref().unwrap_or("no reason given");
            vec![Delivery::text(
                request.external_id,
                format!("😔 Your registration request was declined.\nReason: {reason}"),
            )]
        }
    }
}

async fn deliver<M: Messenger + ?Sized>(
    messenger: &M,
    delivery: &Delivery,
) -> Result<(), crate::runtime::DeliveryError> {
    messenger
        .send_choices(delivery.recipient, &delivery.text, &delivery.choices)
        .await?;
    for handle in &delivery.files {
        messenger.send_file(delivery.recipient, handle, None).await?;
    }
    Ok(())
}

/// Send every delivery concurrently; one failure does not affect the rest
pub async fn dispatch<M: Messenger + ?Sized>(
    deliveries: Vec<Delivery>,
    messenger: &M,
) -> DispatchReport {
    let outcomes = join_all(deliveries.iter().map(|d| async move {
        let outcome = deliver(messenger, d).await;
        if let Err(e) = &outcome {
            tracing::warn!(recipient = %d.recipient, error = %e, "Notification delivery failed");
        }
        outcome.is_ok()
    }))
    .await;

    let delivered = outcomes.iter().filter(|ok| **ok).count();
    DispatchReport {
        delivered,
        failed: outcomes.len() - delivered,
    }
}
