//! Pure state transition function
//!
//! One `match` arm per flow. Input that fails validation returns
//! `TransitionError::Validation` and leaves the state untouched; the caller
//! re-prompts the same step.

use super::effect::Choice;
use super::state::{
    Applicant, AssignmentDraft, AssignmentStep, FlowStart, GradingStep, RegistrationStep,
    SolutionStep, Step,
};
use super::{ConvState, Effect, Event};
use crate::db::{Difficulty, ExternalId, FileRecord, NewAssignment, NewRegistration, Score};
use crate::files::{self, Upload, MAX_FILES_PER_OBJECT};
use chrono::NaiveDate;
use std::str::FromStr;
use thiserror::Error;

const MIN_LAST_NAME: usize = 2;
const MIN_PHONE: usize = 10;
const MIN_PARENT_CONTACT: usize = 5;
const MIN_MOTIVATION: usize = 10;
const MIN_TITLE: usize = 3;
const MIN_DESCRIPTION: usize = 10;
const MIN_SOLUTION_TEXT: usize = 10;
const MAX_GRADE: u8 = 11;

/// Answers that leave an optional field empty
const SKIP_TOKENS: &[&str] = &["-", "no", "skip", "нет"];
/// Text that ends the attachment sub-loop
const DONE_TOKENS: &[&str] = &["/done", "done", "готово"];

pub const FILES_DONE: &str = "files_done";
pub const DIFFICULTY_PREFIX: &str = "difficulty_";

/// Result of a state transition
#[derive(Debug)]
pub struct TransitionResult {
    pub new_state: ConvState,
    pub effects: Vec<Effect>,
}

impl TransitionResult {
    pub fn new(state: ConvState) -> Self {
        Self {
            new_state: state,
            effects: vec![],
        }
    }

    pub fn with_effect(mut self, effect: Effect) -> Self {
        self.effects.push(effect);
        self
    }

    /// The completion write, if this transition finished a flow
    pub fn completion(&self) -> Option<&Effect> {
        self.effects.iter().find(|e| e.is_completion())
    }
}

/// Errors that can occur during transition
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransitionError {
    /// Input refused; the same step is asked again
    #[error("{0}")]
    Validation(String),
    #[error("Another flow is in progress at step {0:?} (cancel it first)")]
    Busy(Step),
    #[error("No flow in progress")]
    NoActiveFlow,
    #[error("Invalid transition: {0}")]
    InvalidTransition(String),
}

fn invalid(reason: impl Into<String>) -> TransitionError {
    TransitionError::Validation(reason.into())
}

/// Pure transition function
///
/// Given the same state and event it always produces the same result; all
/// I/O is described by the returned effects.
pub fn transition(state: &ConvState, event: Event) -> Result<TransitionResult, TransitionError> {
    match (state, event) {
        (ConvState::Idle, Event::Cancel) => {
            Ok(TransitionResult::new(ConvState::Idle)
                .with_effect(Effect::reply("Nothing to cancel.")))
        }
        (_, Event::Cancel) => Ok(TransitionResult::new(ConvState::Idle)
            .with_effect(Effect::reply("❌ Cancelled. Nothing was saved."))),

        (ConvState::Idle, Event::Start(start)) => Ok(start_flow(start)),
        (busy, Event::Start(_)) => Err(busy
            .step()
            .map_or(TransitionError::NoActiveFlow, TransitionError::Busy)),

        (ConvState::Idle, _) => Err(TransitionError::NoActiveFlow),

        // Attachment sub-loop is shared by the three flows that have one
        (current, event) if current.step().is_some_and(Step::is_attachment) => {
            attachment_step(current, event)
        }

        (ConvState::Registration { applicant, step }, event) => {
            registration_step(applicant, step, event)
        }
        (ConvState::Assignment { admin, step }, event) => assignment_step(*admin, step, event),
        (
            ConvState::Solution {
                user,
                assignment_id,
                title,
                step: SolutionStep::Text,
            },
            event,
        ) => {
            let text = expect_text(event, Step::SolutionText)?;
            let text = min_chars(&text, MIN_SOLUTION_TEXT, "The solution")?;
            let next = ConvState::Solution {
                user: *user,
                assignment_id: *assignment_id,
                title: title.clone(),
                step: SolutionStep::Files {
                    text,
                    files: vec![],
                },
            };
            Ok(advance(next))
        }
        (
            ConvState::Grading {
                admin,
                solution_id,
                step,
            },
            event,
        ) => grading_step(*admin, *solution_id, step, event),
        (ConvState::Rejection { admin: _, request_id }, event) => {
            let text = expect_text(event, Step::RejectionReason)?;
            let reason = text.trim();
            if reason.is_empty() {
                return Err(invalid("Please give a reason for the rejection."));
            }
            Ok(TransitionResult::new(ConvState::Idle).with_effect(Effect::RejectRequest {
                request_id: *request_id,
                reason: reason.to_string(),
            }))
        }
        (state, _) => Err(TransitionError::InvalidTransition(format!(
            "no handler for state {state:?}"
        ))),
    }
}

/// Move to `next` and ask for its input
fn advance(next: ConvState) -> TransitionResult {
    let prompt = next.step().map(prompt_for);
    let result = TransitionResult::new(next);
    match prompt {
        Some(effect) => result.with_effect(effect),
        None => result,
    }
}

fn start_flow(start: FlowStart) -> TransitionResult {
    let (intro, state) = match start {
        FlowStart::Registration(applicant) => (
            format!(
                "👋 Hello, {}! Let's fill in the registration form. Send /cancel at any time to stop.",
                applicant.first_name
            ),
            ConvState::Registration {
                applicant,
                step: RegistrationStep::LastName,
            },
        ),
        FlowStart::Assignment { admin } => (
            "📝 Creating a new assignment.".to_string(),
            ConvState::Assignment {
                admin,
                step: AssignmentStep::Title,
            },
        ),
        FlowStart::Solution {
            user,
            assignment_id,
            title,
        } => (
            format!("✍️ Submitting a solution for \"{title}\"."),
            ConvState::Solution {
                user,
                assignment_id,
                title,
                step: SolutionStep::Text,
            },
        ),
        FlowStart::Grading { admin, solution_id } => (
            format!("📊 Grading solution #{solution_id}."),
            ConvState::Grading {
                admin,
                solution_id,
                step: GradingStep::Score,
            },
        ),
        FlowStart::Rejection { admin, request_id } => (
            format!("Rejecting registration request #{request_id}."),
            ConvState::Rejection { admin, request_id },
        ),
    };
    TransitionResult::new(ConvState::Idle)
        .with_effect(Effect::reply(intro))
        .with_effects_of(advance(state))
}

impl TransitionResult {
    fn with_effects_of(mut self, other: TransitionResult) -> Self {
        self.effects.extend(other.effects);
        self.new_state = other.new_state;
        self
    }
}

// ============================================================================
// Registration
// ============================================================================

fn registration_step(
    applicant: &Applicant,
    step: &RegistrationStep,
    event: Event,
) -> Result<TransitionResult, TransitionError> {
    let at = |step: RegistrationStep| ConvState::Registration {
        applicant: applicant.clone(),
        step,
    };

    let next = match step {
        RegistrationStep::LastName => {
            let text = expect_text(event, Step::LastName)?;
            at(RegistrationStep::Phone {
                last_name: min_chars(&text, MIN_LAST_NAME, "The last name")?,
            })
        }
        RegistrationStep::Phone { last_name } => {
            let text = expect_text(event, Step::Phone)?;
            at(RegistrationStep::Grade {
                last_name: last_name.clone(),
                phone: min_chars(&text, MIN_PHONE, "The phone number")?,
            })
        }
        RegistrationStep::Grade { last_name, phone } => {
            let text = expect_text(event, Step::Grade)?;
            at(RegistrationStep::ParentContact {
                last_name: last_name.clone(),
                phone: phone.clone(),
                grade: parse_grade(&text, 1)?,
            })
        }
        RegistrationStep::ParentContact {
            last_name,
            phone,
            grade,
        } => {
            let text = expect_text(event, Step::ParentContact)?;
            at(RegistrationStep::Motivation {
                last_name: last_name.clone(),
                phone: phone.clone(),
                grade: *grade,
                parent_contact: min_chars(&text, MIN_PARENT_CONTACT, "The parent contact")?,
            })
        }
        RegistrationStep::Motivation {
            last_name,
            phone,
            grade,
            parent_contact,
        } => {
            let text = expect_text(event, Step::Motivation)?;
            let motivation = min_chars(&text, MIN_MOTIVATION, "The motivation")?;
            let request = NewRegistration {
                external_id: applicant.external_id,
                username: applicant.username.clone(),
                first_name: applicant.first_name.clone(),
                last_name: last_name.clone(),
                phone: phone.clone(),
                grade: *grade,
                parent_contact: parent_contact.clone(),
                motivation,
            };
            return Ok(TransitionResult::new(ConvState::Idle)
                .with_effect(Effect::CompleteRegistration { request }));
        }
    };
    Ok(advance(next))
}

// ============================================================================
// Assignment creation
// ============================================================================

fn assignment_step(
    admin: ExternalId,
    step: &AssignmentStep,
    event: Event,
) -> Result<TransitionResult, TransitionError> {
    let at = |step: AssignmentStep| ConvState::Assignment { admin, step };

    let next = match step {
        AssignmentStep::Title => {
            let text = expect_text(event, Step::Title)?;
            at(AssignmentStep::Description {
                title: min_chars(&text, MIN_TITLE, "The title")?,
            })
        }
        AssignmentStep::Description { title } => {
            let text = expect_text(event, Step::Description)?;
            at(AssignmentStep::GradeLevel {
                title: title.clone(),
                description: min_chars(&text, MIN_DESCRIPTION, "The description")?,
            })
        }
        AssignmentStep::GradeLevel { title, description } => {
            let text = expect_text(event, Step::GradeLevel)?;
            at(AssignmentStep::Difficulty {
                title: title.clone(),
                description: description.clone(),
                grade_level: parse_grade(&text, 0)?,
            })
        }
        AssignmentStep::Difficulty {
            title,
            description,
            grade_level,
        } => {
            let Event::Choice(data) = event else {
                return Err(invalid("Please choose the difficulty with the buttons."));
            };
            let difficulty = data
                .strip_prefix(DIFFICULTY_PREFIX)
                .and_then(|d| Difficulty::from_str(d).ok())
                .ok_or_else(|| invalid("Please choose the difficulty with the buttons."))?;
            at(AssignmentStep::DueDate {
                title: title.clone(),
                description: description.clone(),
                grade_level: *grade_level,
                difficulty,
            })
        }
        AssignmentStep::DueDate {
            title,
            description,
            grade_level,
            difficulty,
        } => {
            let text = expect_text(event, Step::DueDate)?;
            at(AssignmentStep::Files {
                draft: AssignmentDraft {
                    title: title.clone(),
                    description: description.clone(),
                    grade_level: *grade_level,
                    difficulty: *difficulty,
                    due_date: parse_due_date(&text)?,
                },
                files: vec![],
            })
        }
        AssignmentStep::Files { .. } => {
            return Err(TransitionError::InvalidTransition(
                "attachment step reached the field dispatcher".to_string(),
            ));
        }
    };
    Ok(advance(next))
}

// ============================================================================
// Grading
// ============================================================================

fn grading_step(
    admin: ExternalId,
    solution_id: i64,
    step: &GradingStep,
    event: Event,
) -> Result<TransitionResult, TransitionError> {
    let at = |step: GradingStep| ConvState::Grading {
        admin,
        solution_id,
        step,
    };

    let next = match step {
        GradingStep::Score => {
            let text = expect_text(event, Step::Score)?;
            let score = Score::from_str(&text).map_err(|e| invalid(format!("❌ Invalid score: {e}.")))?;
            at(GradingStep::Comment { score })
        }
        GradingStep::Comment { score } => {
            let text = expect_text(event, Step::Comment)?;
            let comment = if is_skip(&text) || text.trim().is_empty() {
                None
            } else {
                Some(text.trim().to_string())
            };
            at(GradingStep::Files {
                score: *score,
                comment,
                files: vec![],
            })
        }
        GradingStep::Files { .. } => {
            return Err(TransitionError::InvalidTransition(
                "attachment step reached the field dispatcher".to_string(),
            ));
        }
    };
    Ok(advance(next))
}

// ============================================================================
// Attachment sub-loop
// ============================================================================

fn attachment_step(state: &ConvState, event: Event) -> Result<TransitionResult, TransitionError> {
    let buffered = state.buffered_files().map_or(0, <[_]>::len);

    match event {
        Event::File(upload) => request_upload(state, &upload, buffered),
        Event::UploadRecorded(record) => Ok(append_upload(state, record)),
        Event::FinishAttachments => complete_with_files(state),
        Event::Choice(data) if data == FILES_DONE => complete_with_files(state),
        Event::Text(text) if is_done(&text) => complete_with_files(state),
        Event::Text(_) | Event::Choice(_) => Err(invalid(format!(
            "Send a file to attach or press \"Done\" to finish ({buffered}/{MAX_FILES_PER_OBJECT} attached)."
        ))),
        Event::Start(_) | Event::Cancel => Err(TransitionError::InvalidTransition(
            "control event reached the attachment step".to_string(),
        )),
    }
}

fn request_upload(
    state: &ConvState,
    upload: &Upload,
    buffered: usize,
) -> Result<TransitionResult, TransitionError> {
    if buffered >= MAX_FILES_PER_OBJECT {
        return Err(invalid(format!(
            "❌ At most {MAX_FILES_PER_OBJECT} files can be attached. Press \"Done\" to finish."
        )));
    }
    let uploader = state
        .actor()
        .ok_or_else(|| TransitionError::InvalidTransition("upload without an actor".to_string()))?;
    let file = files::prepare(upload, uploader).map_err(|r| invalid(r.user_message()))?;
    Ok(TransitionResult::new(state.clone()).with_effect(Effect::RecordUpload { file }))
}

fn append_upload(state: &ConvState, record: FileRecord) -> TransitionResult {
    let mut next = state.clone();
    let Some(files) = next.buffered_files_mut() else {
        return TransitionResult::new(next);
    };

    let text = if files.iter().any(|f| f.id == record.id) {
        format!("This file is already attached ({}/{MAX_FILES_PER_OBJECT}).", files.len())
    } else if files.len() >= MAX_FILES_PER_OBJECT {
        format!("❌ At most {MAX_FILES_PER_OBJECT} files can be attached.")
    } else {
        let name = record.file_name.clone();
        files.push(record);
        format!(
            "✅ {name} attached ({}/{MAX_FILES_PER_OBJECT}). Send another file or press \"Done\".",
            files.len()
        )
    };
    TransitionResult::new(next).with_effect(Effect::reply_with_choices(text, vec![done_choice()]))
}

fn complete_with_files(state: &ConvState) -> Result<TransitionResult, TransitionError> {
    let effect = match state {
        ConvState::Assignment {
            admin,
            step: AssignmentStep::Files { draft, files },
        } => Effect::CreateAssignment {
            assignment: NewAssignment {
                title: draft.title.clone(),
                description: draft.description.clone(),
                grade_level: draft.grade_level,
                difficulty: draft.difficulty,
                due_date: draft.due_date,
                created_by: *admin,
            },
            files: files.clone(),
        },
        ConvState::Solution {
            user,
            assignment_id,
            step: SolutionStep::Files { text, files },
            ..
        } => Effect::SubmitSolution {
            user_id: *user,
            assignment_id: *assignment_id,
            text: text.clone(),
            files: files.clone(),
        },
        ConvState::Grading {
            solution_id,
            step:
                GradingStep::Files {
                    score,
                    comment,
                    files,
                },
            ..
        } => Effect::GradeSolution {
            solution_id: *solution_id,
            score: *score,
            comment: comment.clone(),
            files: files.clone(),
        },
        other => {
            return Err(TransitionError::InvalidTransition(format!(
                "cannot finish attachments from {other:?}"
            )))
        }
    };
    Ok(TransitionResult::new(ConvState::Idle).with_effect(effect))
}

// ============================================================================
// Input parsing
// ============================================================================

/// Text answer for a field step; anything else is re-prompted
fn expect_text(event: Event, step: Step) -> Result<String, TransitionError> {
    match event {
        Event::Text(text) => Ok(text),
        Event::File(_) => Err(invalid("Files are not accepted at this step. Please type your answer.")),
        Event::Choice(_) | Event::FinishAttachments => {
            Err(invalid("Please type your answer."))
        }
        Event::UploadRecorded(_) | Event::Start(_) | Event::Cancel => Err(
            TransitionError::InvalidTransition(format!("unexpected event at step {step:?}")),
        ),
    }
}

fn min_chars(text: &str, min: usize, what: &str) -> Result<String, TransitionError> {
    let trimmed = text.trim();
    if trimmed.chars().count() < min {
        return Err(invalid(format!(
            "❌ {what} must be at least {min} characters long."
        )));
    }
    Ok(trimmed.to_string())
}

/// Grade in `min..=11`; 0 is the "all grades" audience for assignments
fn parse_grade(text: &str, min: u8) -> Result<u8, TransitionError> {
    match text.trim().parse::<u8>() {
        Ok(grade) if (min..=MAX_GRADE).contains(&grade) => Ok(grade),
        _ => Err(invalid(format!(
            "❌ Enter a grade number from {min} to {MAX_GRADE}."
        ))),
    }
}

fn parse_due_date(text: &str) -> Result<Option<NaiveDate>, TransitionError> {
    if is_skip(text) {
        return Ok(None);
    }
    NaiveDate::parse_from_str(text.trim(), "%d.%m.%Y")
        .map(Some)
        .map_err(|_| invalid("❌ Use the DD.MM.YYYY format, or send \"-\" for no due date."))
}

pub fn is_skip(text: &str) -> bool {
    let t = text.trim().to_lowercase();
    SKIP_TOKENS.contains(&t.as_str())
}

pub fn is_done(text: &str) -> bool {
    let t = text.trim().to_lowercase();
    DONE_TOKENS.contains(&t.as_str())
}

// ============================================================================
// Prompts
// ============================================================================

fn done_choice() -> Choice {
    Choice::new("✅ Done", FILES_DONE)
}

/// The question asked at `step`
pub fn prompt_for(step: Step) -> Effect {
    let text = match step {
        Step::LastName => "Step 1/5. Enter your last name:",
        Step::Phone => "Step 2/5. Enter your phone number:",
        Step::Grade => "Step 3/5. Which grade are you in? (1-11)",
        Step::ParentContact => "Step 4/5. Enter a parent's name and phone number:",
        Step::Motivation => "Step 5/5. Why do you want to study with us?",
        Step::Title => "Enter the assignment title:",
        Step::Description => "Enter the assignment description:",
        Step::GradeLevel => "Which grade is it for? (1-11, or 0 for all grades)",
        Step::Difficulty => {
            let choices = Difficulty::ALL
                .iter()
                .map(|d| {
                    Choice::new(
                        format!("{} {d}", d.marker()),
                        format!("{DIFFICULTY_PREFIX}{d}"),
                    )
                })
                .collect();
            return Effect::reply_with_choices("Choose the difficulty:", choices);
        }
        Step::DueDate => "Enter the due date as DD.MM.YYYY, or \"-\" for none:",
        Step::SolutionText => "Type your solution:",
        Step::Score => "Enter the score as <score>/<max>, for example 8/10:",
        Step::Comment => "Enter a comment for the student, or \"-\" to skip:",
        Step::RejectionReason => "Enter the reason for the rejection:",
        Step::AssignmentFiles | Step::SolutionFiles | Step::GradeFiles => {
            return Effect::reply_with_choices(
                format!(
                    "📎 Send files to attach (up to {MAX_FILES_PER_OBJECT}), or press \"Done\" to finish."
                ),
                vec![done_choice()],
            );
        }
    };
    Effect::reply(text)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::FileClass;
    use chrono::Utc;

    fn applicant() -> Applicant {
        Applicant {
            external_id: 42,
            username: Some("anna".to_string()),
            first_name: "Anna".to_string(),
        }
    }

    fn feed(state: ConvState, inputs: &[&str]) -> ConvState {
        inputs.iter().fold(state, |state, input| {
            transition(&state, Event::Text((*input).to_string()))
                .unwrap()
                .new_state
        })
    }

    fn start(start: FlowStart) -> ConvState {
        transition(&ConvState::Idle, Event::Start(start))
            .unwrap()
            .new_state
    }

    fn record(id: i64) -> FileRecord {
        FileRecord {
            id,
            handle: format!("h{id}"),
            unique_id: format!("u{id}"),
            file_name: format!("page{id}.jpg"),
            byte_size: 100,
            mime_type: "image/jpeg".to_string(),
            class: FileClass::Photo,
            uploaded_by: 1,
            uploaded_at: Utc::now(),
        }
    }

    #[test]
    fn test_registration_happy_path() {
        let state = start(FlowStart::Registration(applicant()));
        assert_eq!(state.step(), Some(Step::LastName));

        let state = feed(
            state,
            &["Petrova", "+79990001122", "7", "Mother, +79990003344"],
        );
        assert_eq!(state.step(), Some(Step::Motivation));

        let result = transition(
            &state,
            Event::Text("Preparing for the exams".to_string()),
        )
        .unwrap();
        assert!(result.new_state.is_idle());
        let Some(Effect::CompleteRegistration { request }) = result.completion() else {
            panic!("expected registration completion");
        };
        assert_eq!(request.external_id, 42);
        assert_eq!(request.last_name, "Petrova");
        assert_eq!(request.grade, 7);
        assert_eq!(request.motivation, "Preparing for the exams");
    }

    #[test]
    fn test_invalid_grade_keeps_step() {
        let state = feed(
            start(FlowStart::Registration(applicant())),
            &["Petrova", "+79990001122"],
        );
        for bad in ["0", "12", "seven", "-3", ""] {
            let err = transition(&state, Event::Text(bad.to_string())).unwrap_err();
            assert!(matches!(err, TransitionError::Validation(_)), "{bad}");
        }
        assert_eq!(state.step(), Some(Step::Grade));
    }

    #[test]
    fn test_short_fields_are_refused() {
        let state = start(FlowStart::Registration(applicant()));
        assert!(transition(&state, Event::Text(" P ".to_string())).is_err());
        let state = feed(state, &["Petrova"]);
        assert!(transition(&state, Event::Text("12345".to_string())).is_err());
    }

    #[test]
    fn test_second_flow_is_busy() {
        let state = start(FlowStart::Assignment { admin: 1 });
        let err = transition(
            &state,
            Event::Start(FlowStart::Registration(applicant())),
        )
        .unwrap_err();
        assert_eq!(err, TransitionError::Busy(Step::Title));
    }

    #[test]
    fn test_cancel_returns_to_idle() {
        let state = feed(start(FlowStart::Assignment { admin: 1 }), &["Fractions"]);
        let result = transition(&state, Event::Cancel).unwrap();
        assert!(result.new_state.is_idle());
        assert!(transition(&ConvState::Idle, Event::Cancel)
            .unwrap()
            .new_state
            .is_idle());
    }

    #[test]
    fn test_idle_text_has_no_flow() {
        assert_eq!(
            transition(&ConvState::Idle, Event::Text("hello".to_string())).unwrap_err(),
            TransitionError::NoActiveFlow
        );
    }

    #[test]
    fn test_difficulty_only_accepts_choice() {
        let state = feed(
            start(FlowStart::Assignment { admin: 1 }),
            &["Fractions", "Add the fractions below", "5"],
        );
        assert_eq!(state.step(), Some(Step::Difficulty));
        assert!(transition(&state, Event::Text("easy".to_string())).is_err());
        assert!(transition(&state, Event::Choice("difficulty_extreme".to_string())).is_err());

        let next = transition(&state, Event::Choice("difficulty_hard".to_string()))
            .unwrap()
            .new_state;
        let ConvState::Assignment {
            step: AssignmentStep::DueDate { difficulty, .. },
            ..
        } = next
        else {
            panic!("expected due date step");
        };
        assert_eq!(difficulty, Difficulty::Hard);
    }

    #[test]
    fn test_assignment_with_files_completes() {
        let state = feed(
            start(FlowStart::Assignment { admin: 1 }),
            &["Fractions", "Add the fractions below", "0"],
        );
        let state = transition(&state, Event::Choice("difficulty_easy".to_string()))
            .unwrap()
            .new_state;
        assert!(transition(&state, Event::Text("31.02.2026".to_string())).is_err());
        let state = feed(state, &["01.12.2026"]);
        assert_eq!(state.step(), Some(Step::AssignmentFiles));

        let upload = Upload {
            handle: "h".to_string(),
            unique_id: "u".to_string(),
            filename: Some("task.pdf".to_string()),
            byte_size: 1000,
            mime_hint: None,
        };
        let result = transition(&state, Event::File(upload)).unwrap();
        assert!(matches!(
            result.effects.as_slice(),
            [Effect::RecordUpload { file }] if file.uploaded_by == 1
        ));

        let state = transition(&state, Event::UploadRecorded(record(9)))
            .unwrap()
            .new_state;
        assert_eq!(state.buffered_files().map(<[_]>::len), Some(1));

        let result = transition(&state, Event::Text("готово".to_string())).unwrap();
        assert!(result.new_state.is_idle());
        let Some(Effect::CreateAssignment { assignment, files }) = result.completion() else {
            panic!("expected assignment completion");
        };
        assert_eq!(assignment.grade_level, 0);
        assert_eq!(assignment.due_date, NaiveDate::from_ymd_opt(2026, 12, 1));
        assert_eq!(files.len(), 1);
    }

    #[test]
    fn test_skip_token_leaves_due_date_empty() {
        let state = feed(
            start(FlowStart::Assignment { admin: 1 }),
            &["Fractions", "Add the fractions below", "5"],
        );
        let state = transition(&state, Event::Choice("difficulty_easy".to_string()))
            .unwrap()
            .new_state;
        let state = feed(state, &["нет"]);
        let ConvState::Assignment {
            step: AssignmentStep::Files { draft, .. },
            ..
        } = state
        else {
            panic!("expected attachment step");
        };
        assert_eq!(draft.due_date, None);
    }

    #[test]
    fn test_invalid_upload_keeps_buffer() {
        let state = ConvState::Solution {
            user: 42,
            assignment_id: 3,
            title: "Fractions".to_string(),
            step: SolutionStep::Files {
                text: "one half plus one third".to_string(),
                files: vec![record(1)],
            },
        };
        let upload = Upload {
            handle: "h".to_string(),
            unique_id: "u".to_string(),
            filename: Some("virus.exe".to_string()),
            byte_size: 10,
            mime_hint: None,
        };
        assert!(matches!(
            transition(&state, Event::File(upload)),
            Err(TransitionError::Validation(_))
        ));
        assert!(matches!(
            transition(&state, Event::Text("more text".to_string())),
            Err(TransitionError::Validation(_))
        ));
        assert_eq!(state.buffered_files().map(<[_]>::len), Some(1));
    }

    #[test]
    fn test_file_limit_is_enforced() {
        let files: Vec<FileRecord> = (1..=10).map(record).collect();
        let state = ConvState::Grading {
            admin: 1,
            solution_id: 5,
            step: GradingStep::Files {
                score: Score {
                    score: 8,
                    max_score: 10,
                },
                comment: None,
                files,
            },
        };
        let upload = Upload {
            handle: "h".to_string(),
            unique_id: "u".to_string(),
            filename: Some("extra.png".to_string()),
            byte_size: 10,
            mime_hint: None,
        };
        assert!(transition(&state, Event::File(upload)).is_err());
        let after = transition(&state, Event::UploadRecorded(record(11)))
            .unwrap()
            .new_state;
        assert_eq!(after.buffered_files().map(<[_]>::len), Some(10));
    }

    #[test]
    fn test_duplicate_upload_is_not_buffered_twice() {
        let state = ConvState::Solution {
            user: 42,
            assignment_id: 3,
            title: "Fractions".to_string(),
            step: SolutionStep::Files {
                text: "one half plus one third".to_string(),
                files: vec![record(1)],
            },
        };
        let after = transition(&state, Event::UploadRecorded(record(1)))
            .unwrap()
            .new_state;
        assert_eq!(after.buffered_files().map(<[_]>::len), Some(1));
    }

    #[test]
    fn test_grading_flow() {
        let state = start(FlowStart::Grading {
            admin: 1,
            solution_id: 5,
        });
        for bad in ["11/10", "8/0", "-1/10", "abc", "8/10/2"] {
            assert!(transition(&state, Event::Text(bad.to_string())).is_err(), "{bad}");
        }
        let state = feed(state, &["8/10", "skip"]);
        let result = transition(&state, Event::Choice(FILES_DONE.to_string())).unwrap();
        let Some(Effect::GradeSolution {
            solution_id,
            score,
            comment,
            files,
        }) = result.completion()
        else {
            panic!("expected grading completion");
        };
        assert_eq!(*solution_id, 5);
        assert_eq!(score.to_string(), "8/10");
        assert_eq!(comment, &None);
        assert!(files.is_empty());
    }

    #[test]
    fn test_rejection_requires_reason() {
        let state = start(FlowStart::Rejection {
            admin: 1,
            request_id: 4,
        });
        assert!(transition(&state, Event::Text("   ".to_string())).is_err());
        let result = transition(&state, Event::Text("Group is full".to_string())).unwrap();
        assert_eq!(
            result.completion(),
            Some(&Effect::RejectRequest {
                request_id: 4,
                reason: "Group is full".to_string()
            })
        );
    }
}
