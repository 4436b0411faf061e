//! File attachment rules
//!
//! Uploads are validated against a fixed extension table before anything is
//! recorded. Classification follows the validated extension, so a PNG sent
//! as a document is still a photo.

use crate::db::{ExternalId, FileClass, FileRecord, NewFile};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Upper bound on files linked to a single assignment, solution or grade
pub const MAX_FILES_PER_OBJECT: usize = 10;

const MB: u64 = 1024 * 1024;

/// (extension, byte ceiling, class)
const RULES: &[(&str, u64, FileClass)] = &[
    ("pdf", 20 * MB, FileClass::Document),
    ("doc", 10 * MB, FileClass::Document),
    ("docx", 10 * MB, FileClass::Document),
    ("txt", MB, FileClass::Document),
    ("jpg", 5 * MB, FileClass::Photo),
    ("jpeg", 5 * MB, FileClass::Photo),
    ("png", 5 * MB, FileClass::Photo),
    ("gif", 2 * MB, FileClass::Photo),
    ("mp4", 20 * MB, FileClass::Video),
];

/// An upload as delivered by the transport, before validation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Upload {
    /// Transport handle used to re-send the file
    pub handle: String,
    /// Content-addressable id; identical content yields the same value
    pub unique_id: String,
    #[serde(default)]
    pub filename: Option<String>,
    pub byte_size: u64,
    #[serde(default)]
    pub mime_hint: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Rejection {
    #[error("unsupported file type: {}", .extension.as_deref().unwrap_or("(none)"))]
    UnsupportedExtension { extension: Option<String> },
    #[error("{extension} file of {byte_size} bytes exceeds the {ceiling} byte limit")]
    TooLarge {
        extension: String,
        byte_size: u64,
        ceiling: u64,
    },
}

impl Rejection {
    pub fn user_message(&self) -> String {
        match self {
            Rejection::UnsupportedExtension { .. } => format!(
                "❌ This file type is not supported. Allowed: {}.",
                RULES
                    .iter()
                    .map(|(ext, _, _)| *ext)
                    .collect::<Vec<_>>()
                    .join(", ")
            ),
            Rejection::TooLarge {
                extension, ceiling, ..
            } => format!(
                "❌ The file is too large. Maximum size for .{extension} is {}.",
                format_size(*ceiling)
            ),
        }
    }
}

/// Lowercased text after the last `.`, if any
pub fn extension(filename: &str) -> Option<String> {
    let (_, ext) = filename.rsplit_once('.')?;
    if ext.is_empty() {
        None
    } else {
        Some(ext.to_lowercase())
    }
}

/// Check an upload's name and size against the extension table
pub fn validate(filename: &str, byte_size: u64) -> Result<FileClass, Rejection> {
    let Some(ext) = extension(filename) else {
        return Err(Rejection::UnsupportedExtension { extension: None });
    };
    let Some(&(_, ceiling, class)) = RULES.iter().find(|(known, _, _)| *known == ext) else {
        return Err(Rejection::UnsupportedExtension {
            extension: Some(ext),
        });
    };
    if byte_size > ceiling {
        return Err(Rejection::TooLarge {
            extension: ext,
            byte_size,
            ceiling,
        });
    }
    Ok(class)
}

/// Name to store for an upload. Photos arrive without a name.
pub fn display_name(filename: Option<&str>, unique_id: &str) -> String {
    match filename.map(str::trim) {
        Some(name) if !name.is_empty() => name.to_string(),
        _ => format!("photo_{unique_id}.jpg"),
    }
}

/// Transport hint when present, otherwise guessed from the extension
pub fn mime_type(filename: &str, hint: Option<&str>) -> String {
    match hint.map(str::trim) {
        Some(hint) if !hint.is_empty() => hint.to_string(),
        _ => mime_guess::from_path(filename)
            .first_or_octet_stream()
            .essence_str()
            .to_string(),
    }
}

/// Validate an upload and build the row to record
pub fn prepare(upload: &Upload, uploaded_by: ExternalId) -> Result<NewFile, Rejection> {
    let file_name = display_name(upload.filename.as_deref(), &upload.unique_id);
    let class = validate(&file_name, upload.byte_size)?;
    let mime_type = mime_type(&file_name, upload.mime_hint.as_deref());
    Ok(NewFile {
        handle: upload.handle.clone(),
        unique_id: upload.unique_id.clone(),
        file_name,
        byte_size: upload.byte_size,
        mime_type,
        class,
        uploaded_by,
    })
}

#[allow(clippy::cast_precision_loss)] // display only
pub fn format_size(bytes: u64) -> String {
    let b = bytes as f64;
    if bytes >= MB {
        format!("{:.1} MB", b / MB as f64)
    } else if bytes >= 1024 {
        format!("{:.1} KB", b / 1024.0)
    } else {
        format!("{bytes} B")
    }
}

fn class_marker(class: FileClass) -> &'static str {
    match class {
        FileClass::Document => "📄",
        FileClass::Photo => "🖼",
        FileClass::Video => "🎬",
    }
}

/// Numbered listing of attached files
pub fn format_file_list(files: &[FileRecord]) -> String {
    if files.is_empty() {
        return "No files attached.".to_string();
    }
    let mut out = format!("📎 Files ({}):", files.len());
    for (i, file) in files.iter().enumerate() {
        out.push_str(&format!(
            "\n{}. {} {} ({})",
            i + 1,
            class_marker(file.class),
            file.file_name,
            format_size(file.byte_size)
        ));
    }
    out
}
