//! Property-based tests for the state machine
//!
//! These tests verify key invariants hold across arbitrary input sequences.

use super::state::*;
use super::transition::*;
use super::*;
use crate::db::{FileClass, FileRecord};
use crate::files::{Upload, MAX_FILES_PER_OBJECT};
use chrono::Utc;
use proptest::prelude::*;

// ============================================================================
// Test Helpers
// ============================================================================

/// Position of a step inside its flow: (flow, index)
fn rank(step: Step) -> (u8, u8) {
    match step {
        Step::LastName => (0, 0),
        Step::Phone => (0, 1),
        Step::Grade => (0, 2),
        Step::ParentContact => (0, 3),
        Step::Motivation => (0, 4),
        Step::Title => (1, 0),
        Step::Description => (1, 1),
        Step::GradeLevel => (1, 2),
        Step::Difficulty => (1, 3),
        Step::DueDate => (1, 4),
        Step::AssignmentFiles => (1, 5),
        Step::SolutionText => (2, 0),
        Step::SolutionFiles => (2, 1),
        Step::Score => (3, 0),
        Step::Comment => (3, 1),
        Step::GradeFiles => (3, 2),
        Step::RejectionReason => (4, 0),
    }
}

fn record(id: i64) -> FileRecord {
    FileRecord {
        id,
        handle: format!("h{id}"),
        unique_id: format!("u{id}"),
        file_name: format!("scan{id}.png"),
        byte_size: 1024,
        mime_type: "image/png".to_string(),
        class: FileClass::Photo,
        uploaded_by: 1,
        uploaded_at: Utc::now(),
    }
}

// ============================================================================
// Arbitrary Generators
// ============================================================================

fn arb_flow_start() -> impl Strategy<Value = FlowStart> {
    prop_oneof![
        Just(FlowStart::Registration(Applicant {
            external_id: 42,
            username: None,
            first_name: "Anna".to_string(),
        })),
        Just(FlowStart::Assignment { admin: 1 }),
        Just(FlowStart::Solution {
            user: 42,
            assignment_id: 3,
            title: "Fractions".to_string(),
        }),
        Just(FlowStart::Grading {
            admin: 1,
            solution_id: 5,
        }),
        Just(FlowStart::Rejection {
            admin: 1,
            request_id: 8,
        }),
    ]
}

/// Text that is valid for some step, plus noise
fn arb_text() -> impl Strategy<Value = String> {
    prop_oneof![
        prop::sample::select(vec![
            "Petrova",
            "+79990001122",
            "7",
            "0",
            "12",
            "Mother, +79990003344",
            "Preparing for the olympiad",
            "Add the fractions below",
            "8/10",
            "11/10",
            "01.12.2026",
            "31.02.2026",
            "-",
            "skip",
            "done",
            "/done",
            "готово",
            "",
        ])
        .prop_map(str::to_string),
        "[a-zA-Z0-9 ./+-]{0,24}",
    ]
}

fn arb_upload() -> impl Strategy<Value = Upload> {
    (
        prop::sample::select(vec!["pdf", "png", "gif", "mp4", "exe", "txt"]),
        0u64..30 * 1024 * 1024,
        "[a-z]{6}",
    )
        .prop_map(|(ext, byte_size, uid)| Upload {
            handle: format!("handle-{uid}"),
            unique_id: uid,
            filename: Some(format!("upload.{ext}")),
            byte_size,
            mime_hint: None,
        })
}

fn arb_event() -> impl Strategy<Value = Event> {
    prop_oneof![
        6 => arb_text().prop_map(Event::Text),
        2 => prop::sample::select(vec![
            "difficulty_easy",
            "difficulty_medium",
            "difficulty_hard",
            "difficulty_extreme",
            FILES_DONE,
            "solve_3",
        ])
        .prop_map(|c| Event::Choice(c.to_string())),
        2 => arb_upload().prop_map(Event::File),
        2 => (1i64..15).prop_map(|id| Event::UploadRecorded(record(id))),
        1 => Just(Event::FinishAttachments),
        1 => arb_flow_start().prop_map(Event::Start),
    ]
}

// ============================================================================
// Properties
// ============================================================================

proptest! {
    /// A refused input never changes the step, and an accepted input on a
    /// field step moves exactly one step forward or completes the flow.
    #[test]
    fn flows_only_move_forward(
        start in arb_flow_start(),
        events in prop::collection::vec(arb_event(), 0..40),
    ) {
        let mut state = transition(&ConvState::Idle, Event::Start(start))
            .unwrap()
            .new_state;

        for event in events {
            let Some(before) = state.step() else { break };
            let feedback = matches!(event, Event::UploadRecorded(_));
            match transition(&state, event) {
                Err(TransitionError::Validation(_) | TransitionError::Busy(_)) => {}
                // Store feedback only arrives during the attachment sub-loop
                Err(TransitionError::InvalidTransition(_)) if feedback => {
                    prop_assert!(!before.is_attachment());
                }
                Err(e) => prop_assert!(false, "unexpected error {e:?} at {before:?}"),
                Ok(result) => {
                    match result.new_state.step() {
                        None => prop_assert!(
                            result.completion().is_some(),
                            "left {before:?} without a completion"
                        ),
                        Some(after) if before.is_attachment() => {
                            prop_assert_eq!(after, before);
                        }
                        Some(after) => {
                            let (flow_a, idx_a) = rank(before);
                            let (flow_b, idx_b) = rank(after);
                            prop_assert_eq!(flow_a, flow_b);
                            prop_assert_eq!(idx_b, idx_a + 1);
                        }
                    }
                    state = result.new_state;
                }
            }
        }
    }

    /// Cancel always lands in Idle with no completion write.
    #[test]
    fn cancel_always_returns_to_idle(
        start in arb_flow_start(),
        events in prop::collection::vec(arb_event(), 0..20),
    ) {
        let mut state = transition(&ConvState::Idle, Event::Start(start))
            .unwrap()
            .new_state;
        for event in events {
            if let Ok(result) = transition(&state, event) {
                state = result.new_state;
            }
        }

        let result = transition(&state, Event::Cancel).unwrap();
        prop_assert!(result.new_state.is_idle());
        prop_assert!(result.completion().is_none());
    }

    /// The attachment buffer never exceeds the per-object limit and never
    /// holds the same file twice.
    #[test]
    fn attachment_buffer_is_bounded(ids in prop::collection::vec(1i64..20, 0..40)) {
        let mut state = ConvState::Solution {
            user: 42,
            assignment_id: 3,
            title: "Fractions".to_string(),
            step: SolutionStep::Files {
                text: "one half plus one third".to_string(),
                files: vec![],
            },
        };
        for id in ids {
            state = transition(&state, Event::UploadRecorded(record(id)))
                .unwrap()
                .new_state;
            let files = state.buffered_files().unwrap();
            prop_assert!(files.len() <= MAX_FILES_PER_OBJECT);
            let mut seen: Vec<i64> = files.iter().map(|f| f.id).collect();
            seen.sort_unstable();
            seen.dedup();
            prop_assert_eq!(seen.len(), files.len());
        }
    }

    /// Text shorter than any minimum is refused at every free-text field.
    #[test]
    fn blank_text_is_never_accepted(start in arb_flow_start(), spaces in " {0,3}") {
        let state = transition(&ConvState::Idle, Event::Start(start))
            .unwrap()
            .new_state;
        let result = transition(&state, Event::Text(spaces));
        prop_assert!(matches!(result, Err(TransitionError::Validation(_))));
    }
}
