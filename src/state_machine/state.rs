//! Conversation state types
//!
//! Each flow variant carries exactly the fields collected so far. A step that
//! has not been answered yet has no slot in the record, so a half-filled form
//! can never be mistaken for a complete one.

use crate::db::{Difficulty, ExternalId, FileRecord, Score};
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

// ============================================================================
// Steps
// ============================================================================

/// Flat tag naming the input a flow is waiting for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Step {
    LastName,
    Phone,
    Grade,
    ParentContact,
    Motivation,
    Title,
    Description,
    GradeLevel,
    Difficulty,
    DueDate,
    AssignmentFiles,
    SolutionText,
    SolutionFiles,
    Score,
    Comment,
    GradeFiles,
    RejectionReason,
}

impl Step {
    /// Steps that run the attachment sub-loop
    pub fn is_attachment(self) -> bool {
        matches!(
            self,
            Step::AssignmentFiles | Step::SolutionFiles | Step::GradeFiles
        )
    }

    /// Steps that only accept a button choice
    pub fn is_choice(self) -> bool {
        matches!(self, Step::Difficulty)
    }
}

// ============================================================================
// Flow records
// ============================================================================

/// Identity of a person applying for registration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Applicant {
    pub external_id: ExternalId,
    pub username: Option<String>,
    pub first_name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "step", rename_all = "snake_case")]
pub enum RegistrationStep {
    LastName,
    Phone {
        last_name: String,
    },
    Grade {
        last_name: String,
        phone: String,
    },
    ParentContact {
        last_name: String,
        phone: String,
        grade: u8,
    },
    Motivation {
        last_name: String,
        phone: String,
        grade: u8,
        parent_contact: String,
    },
}

/// Assignment fields gathered before the attachment sub-loop
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AssignmentDraft {
    pub title: String,
    pub description: String,
    pub grade_level: u8,
    pub difficulty: Difficulty,
    pub due_date: Option<NaiveDate>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "step", rename_all = "snake_case")]
pub enum AssignmentStep {
    Title,
    Description {
        title: String,
    },
    GradeLevel {
        title: String,
        description: String,
    },
    Difficulty {
        title: String,
        description: String,
        grade_level: u8,
    },
    DueDate {
        title: String,
        description: String,
        grade_level: u8,
        difficulty: Difficulty,
    },
    Files {
        draft: AssignmentDraft,
        files: Vec<FileRecord>,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "step", rename_all = "snake_case")]
pub enum SolutionStep {
    Text,
    Files { text: String, files: Vec<FileRecord> },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "step", rename_all = "snake_case")]
pub enum GradingStep {
    Score,
    Comment {
        score: Score,
    },
    Files {
        score: Score,
        comment: Option<String>,
        files: Vec<FileRecord>,
    },
}

// ============================================================================
// Conversation State
// ============================================================================

/// Per-user conversation state
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(tag = "flow", rename_all = "snake_case")]
pub enum ConvState {
    /// No flow in progress; commands are handled directly
    #[default]
    Idle,

    Registration {
        applicant: Applicant,
        step: RegistrationStep,
    },

    Assignment {
        admin: ExternalId,
        step: AssignmentStep,
    },

    Solution {
        user: ExternalId,
        assignment_id: i64,
        title: String,
        step: SolutionStep,
    },

    Grading {
        admin: ExternalId,
        solution_id: i64,
        step: GradingStep,
    },

    /// Admin typing the reason for rejecting a registration request
    Rejection { admin: ExternalId, request_id: i64 },
}

impl ConvState {
    pub fn is_idle(&self) -> bool {
        matches!(self, ConvState::Idle)
    }

    /// Step the flow is waiting on, `None` when idle
    pub fn step(&self) -> Option<Step> {
        let step = match self {
            ConvState::Idle => return None,
            ConvState::Registration { step, .. } => match step {
                RegistrationStep::LastName => Step::LastName,
                RegistrationStep::Phone { .. } => Step::Phone,
                RegistrationStep::Grade { .. } => Step::Grade,
                RegistrationStep::ParentContact { .. } => Step::ParentContact,
                RegistrationStep::Motivation { .. } => Step::Motivation,
            },
            ConvState::Assignment { step, .. } => match step {
                AssignmentStep::Title => Step::Title,
                AssignmentStep::Description { .. } => Step::Description,
                AssignmentStep::GradeLevel { .. } => Step::GradeLevel,
                AssignmentStep::Difficulty { .. } => Step::Difficulty,
                AssignmentStep::DueDate { .. } => Step::DueDate,
                AssignmentStep::Files { .. } => Step::AssignmentFiles,
            },
            ConvState::Solution { step, .. } => match step {
                SolutionStep::Text => Step::SolutionText,
                SolutionStep::Files { .. } => Step::SolutionFiles,
            },
            ConvState::Grading { step, .. } => match step {
                GradingStep::Score => Step::Score,
                GradingStep::Comment { .. } => Step::Comment,
                GradingStep::Files { .. } => Step::GradeFiles,
            },
            ConvState::Rejection { .. } => Step::RejectionReason,
        };
        Some(step)
    }

    /// The person driving the flow; uploads are attributed to them
    pub fn actor(&self) -> Option<ExternalId> {
        match self {
            ConvState::Idle => None,
            ConvState::Registration { applicant, .. } => Some(applicant.external_id),
            ConvState::Assignment { admin, .. }
            | ConvState::Grading { admin, .. }
            | ConvState::Rejection { admin, .. } => Some(*admin),
            ConvState::Solution { user, .. } => Some(*user),
        }
    }

    /// Files buffered by the attachment sub-loop, if the flow is in it
    pub fn buffered_files(&self) -> Option<&[FileRecord]> {
        match self {
            ConvState::Assignment {
                step: AssignmentStep::Files { files, .. },
                ..
            }
            | ConvState::Solution {
                step: SolutionStep::Files { files, .. },
                ..
            }
            | ConvState::Grading {
                step: GradingStep::Files { files, .. },
                ..
            } => Some(files),
            _ => None,
        }
    }

    pub(crate) fn buffered_files_mut(&mut self) -> Option<&mut Vec<FileRecord>> {
        match self {
            ConvState::Assignment {
                step: AssignmentStep::Files { files, .. },
                ..
            }
            | ConvState::Solution {
                step: SolutionStep::Files { files, .. },
                ..
            }
            | ConvState::Grading {
                step: GradingStep::Files { files, .. },
                ..
            } => Some(files),
            _ => None,
        }
    }
}

/// How a flow is entered. Permission checks happen before this reaches the
/// state machine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FlowStart {
    Registration(Applicant),
    Assignment {
        admin: ExternalId,
    },
    Solution {
        user: ExternalId,
        assignment_id: i64,
        title: String,
    },
    Grading {
        admin: ExternalId,
        solution_id: i64,
    },
    Rejection {
        admin: ExternalId,
        request_id: i64,
    },
}
