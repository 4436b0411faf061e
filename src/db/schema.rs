//! Database schema and types

use chrono::{DateTime, NaiveDate, Utc};
use rusqlite::types::{FromSql, FromSqlError, FromSqlResult, ToSql, ToSqlOutput, ValueRef};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// SQL schema for initialization
pub const SCHEMA: &str = r"
CREATE TABLE IF NOT EXISTS admins (
    external_id INTEGER PRIMARY KEY,
    username TEXT,
    first_name TEXT NOT NULL,
    is_super_admin BOOLEAN NOT NULL DEFAULT 0,
    added_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS users (
    external_id INTEGER PRIMARY KEY,
    username TEXT,
    first_name TEXT NOT NULL,
    last_name TEXT NOT NULL,
    phone TEXT NOT NULL,
    grade INTEGER NOT NULL CHECK (grade BETWEEN 1 AND 11),
    parent_contact TEXT NOT NULL,
    is_active BOOLEAN NOT NULL DEFAULT 1,
    notes TEXT,
    registered_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS registration_requests (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    external_id INTEGER NOT NULL,
    username TEXT,
    first_name TEXT NOT NULL,
    last_name TEXT NOT NULL,
    phone TEXT NOT NULL,
    grade INTEGER NOT NULL CHECK (grade BETWEEN 1 AND 11),
    parent_contact TEXT NOT NULL,
    motivation TEXT NOT NULL,
    status TEXT NOT NULL DEFAULT 'pending'
        CHECK (status IN ('pending', 'approved', 'rejected')),
    admin_comment TEXT,
    created_at TEXT NOT NULL
);

-- One pending request per identity. This index is the authority for
-- duplicate detection, not any read performed beforehand.
CREATE UNIQUE INDEX IF NOT EXISTS idx_requests_one_pending
    ON registration_requests(external_id) WHERE status = 'pending';

CREATE TABLE IF NOT EXISTS assignments (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    title TEXT NOT NULL,
    description TEXT NOT NULL,
    grade_level INTEGER NOT NULL CHECK (grade_level BETWEEN 0 AND 11),
    difficulty TEXT NOT NULL CHECK (difficulty IN ('easy', 'medium', 'hard')),
    due_date TEXT,
    is_active BOOLEAN NOT NULL DEFAULT 1,
    created_by INTEGER NOT NULL,
    created_at TEXT NOT NULL,

    FOREIGN KEY (created_by) REFERENCES admins(external_id)
);

CREATE INDEX IF NOT EXISTS idx_assignments_grade ON assignments(grade_level, is_active);

CREATE TABLE IF NOT EXISTS solutions (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    user_id INTEGER NOT NULL,
    assignment_id INTEGER NOT NULL,
    solution_text TEXT NOT NULL,
    score INTEGER,
    max_score INTEGER,
    comment TEXT,
    submitted_at TEXT NOT NULL,
    graded_at TEXT,

    UNIQUE (user_id, assignment_id),
    FOREIGN KEY (user_id) REFERENCES users(external_id),
    FOREIGN KEY (assignment_id) REFERENCES assignments(id)
);

CREATE INDEX IF NOT EXISTS idx_solutions_ungraded ON solutions(score) WHERE score IS NULL;

CREATE TABLE IF NOT EXISTS files (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    handle TEXT NOT NULL,
    unique_id TEXT NOT NULL UNIQUE,
    file_name TEXT NOT NULL,
    byte_size INTEGER NOT NULL,
    mime_type TEXT NOT NULL,
    file_class TEXT NOT NULL CHECK (file_class IN ('document', 'photo', 'video')),
    uploaded_by INTEGER NOT NULL,
    uploaded_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS file_links (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    file_id INTEGER NOT NULL,
    object_type TEXT NOT NULL CHECK (object_type IN ('assignment', 'solution', 'grade')),
    object_id INTEGER NOT NULL,

    UNIQUE (file_id, object_type, object_id),
    FOREIGN KEY (file_id) REFERENCES files(id)
);

CREATE INDEX IF NOT EXISTS idx_file_links_object ON file_links(object_type, object_id);
";

/// External messaging-platform identity of a participant
pub type ExternalId = i64;

/// Grade level meaning "every grade"
pub const ALL_GRADES: u8 = 0;

/// Error returned when a stored tag does not name a known variant
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown {kind}: {value}")]
pub struct UnknownTag {
    pub kind: &'static str,
    pub value: String,
}

/// Declares a closed set of tags stored as lowercase TEXT columns.
macro_rules! text_enum {
    ($(#[$meta:meta])* $name:ident, $kind:literal { $($variant:ident => $tag:literal),+ $(,)? }) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(rename_all = "snake_case")]
        pub enum $name {
            $($variant),+
        }

        impl $name {
            pub const ALL: &'static [$name] = &[$($name::$variant),+];

            pub fn as_str(self) -> &'static str {
                match self {
                    $($name::$variant => $tag),+
                }
            }
        }

        impl FromStr for $name {
            type Err = UnknownTag;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($tag => Ok($name::$variant),)+
                    other => Err(UnknownTag {
                        kind: $kind,
                        value: other.to_string(),
                    }),
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl ToSql for $name {
            fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
                Ok(ToSqlOutput::from(self.as_str()))
            }
        }

        impl FromSql for $name {
            fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
                value
                    .as_str()?
                    .parse()
                    .map_err(|e: UnknownTag| FromSqlError::Other(Box::new(e)))
            }
        }
    };
}

text_enum!(
    /// Assignment difficulty
    Difficulty, "difficulty" {
        Easy => "easy",
        Medium => "medium",
        Hard => "hard",
    }
);

text_enum!(
    /// Registration request lifecycle
    RequestStatus, "request status" {
        Pending => "pending",
        Approved => "approved",
        Rejected => "rejected",
    }
);

text_enum!(
    /// Content classification of an uploaded file
    FileClass, "file class" {
        Document => "document",
        Photo => "photo",
        Video => "video",
    }
);

text_enum!(
    /// Kind of entity a file is attached to
    ObjectType, "object type" {
        Assignment => "assignment",
        Solution => "solution",
        Grade => "grade",
    }
);

impl Difficulty {
    pub fn marker(self) -> &'static str {
        match self {
            Difficulty::Easy => "🟢",
            Difficulty::Medium => "🟡",
            Difficulty::Hard => "🔴",
        }
    }
}

/// Registered student
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct User {
    pub external_id: ExternalId,
    pub username: Option<String>,
    pub first_name: String,
    pub last_name: String,
    pub phone: String,
    pub grade: u8,
    pub parent_contact: String,
    pub is_active: bool,
    pub notes: Option<String>,
    pub registered_at: DateTime<Utc>,
}

impl User {
    pub fn display_name(&self) -> String {
        format!("{} {}", self.first_name, self.last_name)
    }
}

/// Privileged participant
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Admin {
    pub external_id: ExternalId,
    pub username: Option<String>,
    pub first_name: String,
    pub is_super_admin: bool,
    pub added_at: DateTime<Utc>,
}

/// Applicant data collected by the registration flow
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewRegistration {
    pub external_id: ExternalId,
    pub username: Option<String>,
    pub first_name: String,
    pub last_name: String,
    pub phone: String,
    pub grade: u8,
    pub parent_contact: String,
    pub motivation: String,
}

/// Persisted registration request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegistrationRequest {
    pub id: i64,
    pub external_id: ExternalId,
    pub username: Option<String>,
    pub first_name: String,
    pub last_name: String,
    pub phone: String,
    pub grade: u8,
    pub parent_contact: String,
    pub motivation: String,
    pub status: RequestStatus,
    pub admin_comment: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl RegistrationRequest {
    pub fn display_name(&self) -> String {
        format!("{} {}", self.first_name, self.last_name)
    }
}

/// Assignment data collected by the creation flow
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewAssignment {
    pub title: String,
    pub description: String,
    pub grade_level: u8,
    pub difficulty: Difficulty,
    pub due_date: Option<NaiveDate>,
    pub created_by: ExternalId,
}

/// Persisted assignment
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Assignment {
    pub id: i64,
    pub title: String,
    pub description: String,
    pub grade_level: u8,
    pub difficulty: Difficulty,
    pub due_date: Option<NaiveDate>,
    pub is_active: bool,
    pub created_by: ExternalId,
    pub created_at: DateTime<Utc>,
}

impl Assignment {
    /// Whether a student in `grade` may see this assignment
    pub fn is_visible_to_grade(&self, grade: u8) -> bool {
        self.grade_level == ALL_GRADES || self.grade_level == grade
    }

    pub fn audience_label(&self) -> String {
        if self.grade_level == ALL_GRADES {
            "all grades".to_string()
        } else {
            format!("grade {}", self.grade_level)
        }
    }
}

/// A validated `<score>/<max>` pair
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Score {
    pub score: u32,
    pub max_score: u32,
}

/// Why a score token was refused
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum ScoreError {
    #[error("expected <score>/<max>, for example 8/10")]
    Format,
    #[error("maximum score must be greater than zero")]
    ZeroMax,
    #[error("score cannot exceed the maximum")]
    AboveMax,
}

impl FromStr for Score {
    type Err = ScoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (score, max_score) = s.trim().split_once('/').ok_or(ScoreError::Format)?;
        // u32 parsing refuses signs other than '+', so "-1/10" fails here
        let score: u32 = score.trim().parse().map_err(|_| ScoreError::Format)?;
        let max_score: u32 = max_score.trim().parse().map_err(|_| ScoreError::Format)?;
        if max_score == 0 {
            return Err(ScoreError::ZeroMax);
        }
        if score > max_score {
            return Err(ScoreError::AboveMax);
        }
        Ok(Score { score, max_score })
    }
}

impl Score {
    pub fn percentage(self) -> f64 {
        round_one_decimal(f64::from(self.score) / f64::from(self.max_score) * 100.0)
    }
}

impl fmt::Display for Score {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.score, self.max_score)
    }
}

/// Persisted solution (a "result")
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Solution {
    pub id: i64,
    pub user_id: ExternalId,
    pub assignment_id: i64,
    pub text: String,
    pub score: Option<u32>,
    pub max_score: Option<u32>,
    pub comment: Option<String>,
    pub submitted_at: DateTime<Utc>,
    pub graded_at: Option<DateTime<Utc>>,
}

impl Solution {
    pub fn grade(&self) -> Option<Score> {
        match (self.score, self.max_score) {
            (Some(score), Some(max_score)) => Some(Score { score, max_score }),
            _ => None,
        }
    }

    pub fn is_graded(&self) -> bool {
        self.grade().is_some()
    }
}

/// Solution joined with its owner and assignment
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SolutionDetail {
    pub solution: Solution,
    pub student_name: String,
    pub student_grade: u8,
    pub assignment_title: String,
    pub assignment_difficulty: Difficulty,
    pub assignment_creator: ExternalId,
}

/// Metadata of an accepted upload, before it is stored
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewFile {
    pub handle: String,
    pub unique_id: String,
    pub file_name: String,
    pub byte_size: u64,
    pub mime_type: String,
    pub class: FileClass,
    pub uploaded_by: ExternalId,
}

/// Persisted file record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileRecord {
    pub id: i64,
    pub handle: String,
    pub unique_id: String,
    pub file_name: String,
    pub byte_size: u64,
    pub mime_type: String,
    pub class: FileClass,
    pub uploaded_by: ExternalId,
    pub uploaded_at: DateTime<Utc>,
}

/// Aggregate progress of one student
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserStats {
    pub total: u32,
    pub graded: u32,
    /// Mean of score/max × 100 over graded solutions only
    pub average_percentage: Option<f64>,
    pub by_difficulty: Vec<DifficultyStats>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DifficultyStats {
    pub difficulty: Difficulty,
    pub graded: u32,
    pub average_percentage: f64,
}

pub(crate) fn round_one_decimal(value: f64) -> f64 {
    (value * 10.0).round() / 10.0
}
