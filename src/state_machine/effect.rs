//! Effects produced by state transitions

use crate::db::{ExternalId, FileRecord, NewAssignment, NewFile, NewRegistration, Score};

/// A reply button: `label` is shown, `data` comes back as `Event::Choice`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Choice {
    pub label: String,
    pub data: String,
}

impl Choice {
    pub fn new(label: impl Into<String>, data: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            data: data.into(),
        }
    }
}

/// Effects to be executed after state transition
#[derive(Debug, Clone, PartialEq)]
pub enum Effect {
    /// Message the user driving the flow
    Reply { text: String, choices: Vec<Choice> },

    /// Store a validated upload; the executor answers with `Event::UploadRecorded`
    RecordUpload { file: NewFile },

    // Completion writes. Each one ends its flow.
    CompleteRegistration {
        request: NewRegistration,
    },
    CreateAssignment {
        assignment: NewAssignment,
        files: Vec<FileRecord>,
    },
    SubmitSolution {
        user_id: ExternalId,
        assignment_id: i64,
        text: String,
        files: Vec<FileRecord>,
    },
    GradeSolution {
        solution_id: i64,
        score: Score,
        comment: Option<String>,
        files: Vec<FileRecord>,
    },
    RejectRequest {
        request_id: i64,
        reason: String,
    },
}

impl Effect {
    pub fn reply(text: impl Into<String>) -> Self {
        Effect::Reply {
            text: text.into(),
            choices: vec![],
        }
    }

    pub fn reply_with_choices(text: impl Into<String>, choices: Vec<Choice>) -> Self {
        Effect::Reply {
            text: text.into(),
            choices,
        }
    }

    /// Whether this effect is a flow's final write
    pub fn is_completion(&self) -> bool {
        !matches!(self, Effect::Reply { .. } | Effect::RecordUpload { .. })
    }
}
