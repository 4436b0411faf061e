//! Events that can occur in a conversation

use crate::db::FileRecord;
use crate::files::Upload;
use crate::state_machine::state::FlowStart;

/// Events that trigger state transitions
#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    // User events
    Start(FlowStart),
    Text(String),
    /// Button payload, e.g. `difficulty_easy` or `files_done`
    Choice(String),
    File(Upload),
    FinishAttachments,
    Cancel,

    // Store feedback
    /// The upload requested by `Effect::RecordUpload` is now stored
    UploadRecorded(FileRecord),
}
