//! Database module for the tutoring desk
//!
//! The entity store: owns every durable row (users, admins, registration
//! requests, assignments, solutions, files). Uniqueness and referential
//! integrity are enforced by the schema; operations that touch more than one
//! row run inside a single transaction.

mod schema;

pub use schema::*;

use chrono::{DateTime, NaiveDate, Utc};
use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use thiserror::Error;

/// How long a writer waits on a locked database before failing
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Error, Debug)]
pub enum DbError {
    #[error("Database error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("{entity} not found: {id}")]
    NotFound { entity: &'static str, id: i64 },
    #[error("{0}")]
    InvalidState(String),
    #[error("A pending registration request already exists for {0}")]
    DuplicateRequest(ExternalId),
    #[error("Store call timed out after {0:?}")]
    Timeout(Duration),
    #[error("Store task failed: {0}")]
    Join(String),
}

pub type DbResult<T> = Result<T, DbError>;

/// Thread-safe database handle
#[derive(Clone)]
pub struct Database {
    conn: Arc<Mutex<Connection>>,
}

const USER_COLUMNS: &str = "external_id, username, first_name, last_name, phone, grade, \
     parent_contact, is_active, notes, registered_at";

const ADMIN_COLUMNS: &str = "external_id, username, first_name, is_super_admin, added_at";

const REQUEST_COLUMNS: &str = "id, external_id, username, first_name, last_name, phone, grade, \
     parent_contact, motivation, status, admin_comment, created_at";

const ASSIGNMENT_COLUMNS: &str = "id, title, description, grade_level, difficulty, due_date, \
     is_active, created_by, created_at";

const SOLUTION_DETAIL_SELECT: &str = "SELECT s.id, s.user_id, s.assignment_id, s.solution_text, \
     s.score, s.max_score, s.comment, s.submitted_at, s.graded_at, \
     u.first_name, u.last_name, u.grade, a.title, a.difficulty, a.created_by \
     FROM solutions s \
     JOIN users u ON u.external_id = s.user_id \
     JOIN assignments a ON a.id = s.assignment_id";

const FILE_COLUMNS: &str = "f.id, f.handle, f.unique_id, f.file_name, f.byte_size, f.mime_type, \
     f.file_class, f.uploaded_by, f.uploaded_at";

impl Database {
    /// Open or create database at the given path
    pub fn open<P: AsRef<Path>>(path: P) -> DbResult<Self> {
        let conn = Connection::open(path)?;
        Self::from_connection(conn)
    }

    /// Open an in-memory database (for testing)
    #[allow(dead_code)] // Used in tests
    pub fn open_in_memory() -> DbResult<Self> {
        let conn = Connection::open_in_memory()?;
        Self::from_connection(conn)
    }

    fn from_connection(conn: Connection) -> DbResult<Self> {
        conn.busy_timeout(BUSY_TIMEOUT)?;
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;
        let db = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        db.run_migrations()?;
        Ok(db)
    }

    fn run_migrations(&self) -> DbResult<()> {
        let conn = self.conn();
        conn.execute_batch(SCHEMA)?;
        Ok(())
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        // A panic while holding the lock cannot leave SQLite mid-statement,
        // so a poisoned guard is still usable.
        self.conn.lock().unwrap_or_else(PoisonError::into_inner)
    }

    // ==================== Existence Checks ====================

    /// Active registered student?
    pub fn is_registered(&self, external_id: ExternalId) -> DbResult<bool> {
        let conn = self.conn();
        let exists: bool = conn.query_row(
            "SELECT EXISTS(SELECT 1 FROM users WHERE external_id = ?1 AND is_active = 1)",
            params![external_id],
            |row| row.get(0),
        )?;
        Ok(exists)
    }

    pub fn is_admin(&self, external_id: ExternalId) -> DbResult<bool> {
        let conn = self.conn();
        let exists: bool = conn.query_row(
            "SELECT EXISTS(SELECT 1 FROM admins WHERE external_id = ?1)",
            params![external_id],
            |row| row.get(0),
        )?;
        Ok(exists)
    }

    pub fn has_pending_request(&self, external_id: ExternalId) -> DbResult<bool> {
        let conn = self.conn();
        let exists: bool = conn.query_row(
            "SELECT EXISTS(SELECT 1 FROM registration_requests
                           WHERE external_id = ?1 AND status = 'pending')",
            params![external_id],
            |row| row.get(0),
        )?;
        Ok(exists)
    }

    // ==================== User Operations ====================

    pub fn get_user(&self, external_id: ExternalId) -> DbResult<User> {
        let conn = self.conn();
        conn.query_row(
            &format!("SELECT {USER_COLUMNS} FROM users WHERE external_id = ?1"),
            params![external_id],
            parse_user_row,
        )
        .optional()?
        .ok_or(DbError::NotFound {
            entity: "user",
            id: external_id,
        })
    }

    /// Active students, most recently registered first
    pub fn list_active_users(&self) -> DbResult<Vec<User>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(&format!(
            "SELECT {USER_COLUMNS} FROM users WHERE is_active = 1 ORDER BY registered_at DESC"
        ))?;
        let rows = stmt.query_map([], parse_user_row)?;
        rows.collect::<Result<Vec<_>, _>>().map_err(DbError::from)
    }

    /// Soft-deactivate a student. Rows are never deleted.
    pub fn deactivate_user(&self, external_id: ExternalId) -> DbResult<()> {
        let conn = self.conn();
        let updated = conn.execute(
            "UPDATE users SET is_active = 0 WHERE external_id = ?1",
            params![external_id],
        )?;
        if updated == 0 {
            return Err(DbError::NotFound {
                entity: "user",
                id: external_id,
            });
        }
        Ok(())
    }

    pub fn update_user_notes(&self, external_id: ExternalId, notes: &str) -> DbResult<()> {
        let conn = self.conn();
        let updated = conn.execute(
            "UPDATE users SET notes = ?1 WHERE external_id = ?2",
            params![notes, external_id],
        )?;
        if updated == 0 {
            return Err(DbError::NotFound {
                entity: "user",
                id: external_id,
            });
        }
        Ok(())
    }

    // ==================== Admin Operations ====================

    /// Add or refresh an admin (bootstrap and promotion)
    pub fn add_admin(
        &self,
        external_id: ExternalId,
        username: Option<&str>,
        first_name: &str,
        is_super_admin: bool,
    ) -> DbResult<Admin> {
        let conn = self.conn();
        let now = Utc::now();
        conn.execute(
            "INSERT INTO admins (external_id, username, first_name, is_super_admin, added_at)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(external_id) DO UPDATE SET
                username = excluded.username,
                first_name = excluded.first_name,
                is_super_admin = excluded.is_super_admin",
            params![external_id, username, first_name, is_super_admin, now.to_rfc3339()],
        )?;
        conn.query_row(
            &format!("SELECT {ADMIN_COLUMNS} FROM admins WHERE external_id = ?1"),
            params![external_id],
            parse_admin_row,
        )
        .map_err(DbError::from)
    }

    pub fn get_admin(&self, external_id: ExternalId) -> DbResult<Admin> {
        let conn = self.conn();
        conn.query_row(
            &format!("SELECT {ADMIN_COLUMNS} FROM admins WHERE external_id = ?1"),
            params![external_id],
            parse_admin_row,
        )
        .optional()?
        .ok_or(DbError::NotFound {
            entity: "admin",
            id: external_id,
        })
    }

    pub fn list_admins(&self) -> DbResult<Vec<Admin>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(&format!(
            "SELECT {ADMIN_COLUMNS} FROM admins ORDER BY is_super_admin DESC, added_at ASC"
        ))?;
        let rows = stmt.query_map([], parse_admin_row)?;
        rows.collect::<Result<Vec<_>, _>>().map_err(DbError::from)
    }

    // ==================== Registration Operations ====================

    /// Create a pending registration request.
    ///
    /// Duplicate detection relies on the partial unique index, so two racing
    /// submissions for the same identity resolve to exactly one row.
    pub fn create_registration_request(
        &self,
        request: &NewRegistration,
    ) -> DbResult<RegistrationRequest> {
        let conn = self.conn();
        let now = Utc::now();

        let inserted = conn.execute(
            "INSERT INTO registration_requests
                (external_id, username, first_name, last_name, phone, grade, parent_contact,
                 motivation, status, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, 'pending', ?9)",
            params![
                request.external_id,
                request.username,
                request.first_name,
                request.last_name,
                request.phone,
                request.grade,
                request.parent_contact,
                request.motivation,
                now.to_rfc3339(),
            ],
        );

        match inserted {
            Ok(_) => {}
            Err(e) if is_unique_violation(&e) => {
                return Err(DbError::DuplicateRequest(request.external_id));
            }
            Err(e) => return Err(e.into()),
        }

        Ok(RegistrationRequest {
            id: conn.last_insert_rowid(),
            external_id: request.external_id,
            username: request.username.clone(),
            first_name: request.first_name.clone(),
            last_name: request.last_name.clone(),
            phone: request.phone.clone(),
            grade: request.grade,
            parent_contact: request.parent_contact.clone(),
            motivation: request.motivation.clone(),
            status: RequestStatus::Pending,
            admin_comment: None,
            created_at: now,
        })
    }

    pub fn get_registration_request(&self, id: i64) -> DbResult<RegistrationRequest> {
        let conn = self.conn();
        load_request(&conn, id)
    }

    /// Pending requests, oldest first
    pub fn list_pending_requests(&self) -> DbResult<Vec<RegistrationRequest>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(&format!(
            "SELECT {REQUEST_COLUMNS} FROM registration_requests
             WHERE status = 'pending' ORDER BY created_at ASC, id ASC"
        ))?;
        let rows = stmt.query_map([], parse_request_row)?;
        rows.collect::<Result<Vec<_>, _>>().map_err(DbError::from)
    }

    /// Approve a pending request and create the student, all or nothing.
    ///
    /// A deactivated student who applied again is reactivated with the new
    /// details; their notes and original registration date are kept.
    pub fn approve_request(&self, id: i64, comment: &str) -> DbResult<User> {
        let mut conn = self.conn();
        let now = Utc::now();
        let tx = conn.transaction()?;

        let request = load_request(&tx, id)?;
        ensure_pending(&request)?;

        tx.execute(
            "INSERT INTO users (external_id, username, first_name, last_name, phone, grade,
                                parent_contact, is_active, registered_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, 1, ?8)
             ON CONFLICT(external_id) DO UPDATE SET
                 username = excluded.username,
                 first_name = excluded.first_name,
                 last_name = excluded.last_name,
                 phone = excluded.phone,
                 grade = excluded.grade,
                 parent_contact = excluded.parent_contact,
                 is_active = 1",
            params![
                request.external_id,
                request.username,
                request.first_name,
                request.last_name,
                request.phone,
                request.grade,
                request.parent_contact,
                now.to_rfc3339(),
            ],
        )?;

        tx.execute(
            "UPDATE registration_requests SET status = 'approved', admin_comment = ?1
             WHERE id = ?2 AND status = 'pending'",
            params![comment, id],
        )?;

        let user = tx.query_row(
            &format!("SELECT {USER_COLUMNS} FROM users WHERE external_id = ?1"),
            params![request.external_id],
            parse_user_row,
        )?;

        // Dropping `tx` on any early return above rolls everything back
        tx.commit()?;
        Ok(user)
    }

    /// Reject a pending request with a reason
    pub fn reject_request(&self, id: i64, comment: &str) -> DbResult<RegistrationRequest> {
        let mut conn = self.conn();
        let tx = conn.transaction()?;

        let mut request = load_request(&tx, id)?;
        ensure_pending(&request)?;

        tx.execute(
            "UPDATE registration_requests SET status = 'rejected', admin_comment = ?1
             WHERE id = ?2 AND status = 'pending'",
            params![comment, id],
        )?;
        tx.commit()?;

        request.status = RequestStatus::Rejected;
        request.admin_comment = Some(comment.to_string());
        Ok(request)
    }

    // ==================== Assignment Operations ====================

    /// Create an assignment and link its files in one transaction
    pub fn create_assignment(
        &self,
        assignment: &NewAssignment,
        file_ids: &[i64],
    ) -> DbResult<Assignment> {
        let mut conn = self.conn();
        let now = Utc::now();
        let tx = conn.transaction()?;

        let creator_exists: bool = tx.query_row(
            "SELECT EXISTS(SELECT 1 FROM admins WHERE external_id = ?1)",
            params![assignment.created_by],
            |row| row.get(0),
        )?;
        if !creator_exists {
            return Err(DbError::NotFound {
                entity: "admin",
                id: assignment.created_by,
            });
        }

        tx.execute(
            "INSERT INTO assignments
                (title, description, grade_level, difficulty, due_date, is_active, created_by, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, 1, ?6, ?7)",
            params![
                assignment.title,
                assignment.description,
                assignment.grade_level,
                assignment.difficulty,
                assignment.due_date.map(format_date),
                assignment.created_by,
                now.to_rfc3339(),
            ],
        )?;
        let id = tx.last_insert_rowid();
        link_files(&tx, file_ids, ObjectType::Assignment, id)?;
        tx.commit()?;

        Ok(Assignment {
            id,
            title: assignment.title.clone(),
            description: assignment.description.clone(),
            grade_level: assignment.grade_level,
            difficulty: assignment.difficulty,
            due_date: assignment.due_date,
            is_active: true,
            created_by: assignment.created_by,
            created_at: now,
        })
    }

    pub fn get_assignment(&self, id: i64) -> DbResult<Assignment> {
        let conn = self.conn();
        load_assignment(&conn, id)
    }

    /// All assignments, newest first (admin view)
    pub fn list_assignments(&self) -> DbResult<Vec<Assignment>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(&format!(
            "SELECT {ASSIGNMENT_COLUMNS} FROM assignments ORDER BY created_at DESC, id DESC"
        ))?;
        let rows = stmt.query_map([], parse_assignment_row)?;
        rows.collect::<Result<Vec<_>, _>>().map_err(DbError::from)
    }

    /// Active assignments visible to a student of `grade`
    pub fn list_assignments_for_grade(&self, grade: u8) -> DbResult<Vec<Assignment>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(&format!(
            "SELECT {ASSIGNMENT_COLUMNS} FROM assignments
             WHERE is_active = 1 AND (grade_level = ?1 OR grade_level = ?2)
             ORDER BY created_at DESC, id DESC"
        ))?;
        let rows = stmt.query_map(params![grade, ALL_GRADES], parse_assignment_row)?;
        rows.collect::<Result<Vec<_>, _>>().map_err(DbError::from)
    }

    pub fn deactivate_assignment(&self, id: i64) -> DbResult<()> {
        let conn = self.conn();
        let updated = conn.execute(
            "UPDATE assignments SET is_active = 0 WHERE id = ?1",
            params![id],
        )?;
        if updated == 0 {
            return Err(DbError::NotFound {
                entity: "assignment",
                id,
            });
        }
        Ok(())
    }

    // ==================== Solution Operations ====================

    /// Insert or overwrite the student's solution for an assignment.
    ///
    /// Overwriting clears any previous grade so the solution is re-opened for
    /// grading, and refreshes the submission timestamp. `file_ids` are linked
    /// in the same transaction.
    pub fn submit_solution(
        &self,
        user_id: ExternalId,
        assignment_id: i64,
        text: &str,
        file_ids: &[i64],
    ) -> DbResult<Solution> {
        let mut conn = self.conn();
        let now = Utc::now();
        let tx = conn.transaction()?;

        let assignment = load_assignment(&tx, assignment_id)?;
        if !assignment.is_active {
            return Err(DbError::InvalidState(format!(
                "Assignment {assignment_id} is no longer active"
            )));
        }
        let user_exists: bool = tx.query_row(
            "SELECT EXISTS(SELECT 1 FROM users WHERE external_id = ?1)",
            params![user_id],
            |row| row.get(0),
        )?;
        if !user_exists {
            return Err(DbError::NotFound {
                entity: "user",
                id: user_id,
            });
        }

        let id: i64 = tx.query_row(
            "INSERT INTO solutions (user_id, assignment_id, solution_text, submitted_at)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(user_id, assignment_id) DO UPDATE SET
                solution_text = excluded.solution_text,
                score = NULL,
                max_score = NULL,
                comment = NULL,
                graded_at = NULL,
                submitted_at = excluded.submitted_at
             RETURNING id",
            params![user_id, assignment_id, text, now.to_rfc3339()],
            |row| row.get(0),
        )?;
        link_files(&tx, file_ids, ObjectType::Solution, id)?;
        tx.commit()?;

        Ok(Solution {
            id,
            user_id,
            assignment_id,
            text: text.to_string(),
            score: None,
            max_score: None,
            comment: None,
            submitted_at: now,
            graded_at: None,
        })
    }

    /// Record a grade and link its files. An empty or absent comment is
    /// stored as NULL.
    pub fn grade_solution(
        &self,
        id: i64,
        score: Score,
        comment: Option<&str>,
        file_ids: &[i64],
    ) -> DbResult<SolutionDetail> {
        let mut conn = self.conn();
        let now = Utc::now();
        let comment = comment.filter(|c| !c.trim().is_empty());
        let tx = conn.transaction()?;

        let updated = tx.execute(
            "UPDATE solutions SET score = ?1, max_score = ?2, comment = ?3, graded_at = ?4
             WHERE id = ?5",
            params![score.score, score.max_score, comment, now.to_rfc3339(), id],
        )?;
        if updated == 0 {
            return Err(DbError::NotFound {
                entity: "solution",
                id,
            });
        }
        link_files(&tx, file_ids, ObjectType::Grade, id)?;
        let detail = load_solution_detail(&tx, id)?;
        tx.commit()?;
        Ok(detail)
    }

    pub fn get_solution(&self, id: i64) -> DbResult<SolutionDetail> {
        let conn = self.conn();
        load_solution_detail(&conn, id)
    }

    /// Solutions awaiting a grade, oldest first
    pub fn list_ungraded_solutions(&self) -> DbResult<Vec<SolutionDetail>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(&format!(
            "{SOLUTION_DETAIL_SELECT} WHERE s.score IS NULL ORDER BY s.submitted_at ASC, s.id ASC"
        ))?;
        let rows = stmt.query_map([], parse_solution_detail_row)?;
        rows.collect::<Result<Vec<_>, _>>().map_err(DbError::from)
    }

    /// A student's solutions, newest first
    pub fn list_user_solutions(&self, user_id: ExternalId) -> DbResult<Vec<SolutionDetail>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(&format!(
            "{SOLUTION_DETAIL_SELECT} WHERE s.user_id = ?1 ORDER BY s.submitted_at DESC, s.id DESC"
        ))?;
        let rows = stmt.query_map(params![user_id], parse_solution_detail_row)?;
        rows.collect::<Result<Vec<_>, _>>().map_err(DbError::from)
    }

    /// Progress aggregate. Ungraded solutions count toward `total` only; they
    /// are excluded from every average rather than treated as zero.
    pub fn compute_user_stats(&self, user_id: ExternalId) -> DbResult<UserStats> {
        let conn = self.conn();

        let (total, graded, average): (u32, u32, Option<f64>) = conn.query_row(
            "SELECT COUNT(*), COUNT(score),
                    AVG(CASE WHEN score IS NOT NULL THEN score * 100.0 / max_score END)
             FROM solutions WHERE user_id = ?1",
            params![user_id],
            |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
        )?;

        let mut stmt = conn.prepare(
            "SELECT a.difficulty, COUNT(*), AVG(s.score * 100.0 / s.max_score)
             FROM solutions s JOIN assignments a ON a.id = s.assignment_id
             WHERE s.user_id = ?1 AND s.score IS NOT NULL
             GROUP BY a.difficulty",
        )?;
        let mut by_difficulty = stmt
            .query_map(params![user_id], |row| {
                Ok(DifficultyStats {
                    difficulty: row.get(0)?,
                    graded: row.get(1)?,
                    average_percentage: round_one_decimal(row.get(2)?),
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        by_difficulty.sort_by_key(|s| s.difficulty);

        Ok(UserStats {
            total,
            graded,
            average_percentage: average.map(round_one_decimal),
            by_difficulty,
        })
    }

    // ==================== File Operations ====================

    /// Store metadata of a validated upload.
    ///
    /// Files are content-addressed by `unique_id`: recording the same content
    /// again returns the existing record.
    pub fn record_upload(&self, file: &NewFile) -> DbResult<FileRecord> {
        let conn = self.conn();
        let now = Utc::now();

        conn.execute(
            "INSERT INTO files (handle, unique_id, file_name, byte_size, mime_type, file_class,
                                uploaded_by, uploaded_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
             ON CONFLICT(unique_id) DO NOTHING",
            params![
                file.handle,
                file.unique_id,
                file.file_name,
                file.byte_size,
                file.mime_type,
                file.class,
                file.uploaded_by,
                now.to_rfc3339(),
            ],
        )?;

        conn.query_row(
            &format!("SELECT {FILE_COLUMNS} FROM files f WHERE f.unique_id = ?1"),
            params![file.unique_id],
            parse_file_row,
        )
        .map_err(DbError::from)
    }

    /// Link files to an object. Re-attaching an existing link is a no-op.
    /// Returns the number of new links.
    #[cfg(test)]
    pub fn attach_files(
        &self,
        file_ids: &[i64],
        object_type: ObjectType,
        object_id: i64,
    ) -> DbResult<usize> {
        let mut conn = self.conn();
        let tx = conn.transaction()?;
        let linked = link_files(&tx, file_ids, object_type, object_id)?;
        tx.commit()?;
        Ok(linked)
    }

    /// Files linked to an object, in attachment order
    pub fn list_files_for_object(
        &self,
        object_type: ObjectType,
        object_id: i64,
    ) -> DbResult<Vec<FileRecord>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(&format!(
            "SELECT {FILE_COLUMNS} FROM files f
             JOIN file_links l ON l.file_id = f.id
             WHERE l.object_type = ?1 AND l.object_id = ?2
             ORDER BY l.id ASC"
        ))?;
        let rows = stmt.query_map(params![object_type, object_id], parse_file_row)?;
        rows.collect::<Result<Vec<_>, _>>().map_err(DbError::from)
    }

    pub fn count_files_for_object(&self, object_type: ObjectType, object_id: i64) -> DbResult<u32> {
        let conn = self.conn();
        conn.query_row(
            "SELECT COUNT(*) FROM file_links WHERE object_type = ?1 AND object_id = ?2",
            params![object_type, object_id],
            |row| row.get(0),
        )
        .map_err(DbError::from)
    }
}

fn link_files(
    conn: &Connection,
    file_ids: &[i64],
    object_type: ObjectType,
    object_id: i64,
) -> DbResult<usize> {
    let mut stmt = conn.prepare_cached(
        "INSERT OR IGNORE INTO file_links (file_id, object_type, object_id) VALUES (?1, ?2, ?3)",
    )?;
    let mut linked = 0;
    for file_id in file_ids {
        linked += stmt.execute(params![file_id, object_type, object_id])?;
    }
    Ok(linked)
}

fn is_unique_violation(e: &rusqlite::Error) -> bool {
    matches!(
        e,
        rusqlite::Error::SqliteFailure(err, _)
            if err.extended_code == rusqlite::ffi::SQLITE_CONSTRAINT_UNIQUE
    )
}

fn ensure_pending(request: &RegistrationRequest) -> DbResult<()> {
    if request.status == RequestStatus::Pending {
        Ok(())
    } else {
        Err(DbError::InvalidState(format!(
            "Registration request {} is already {}",
            request.id, request.status
        )))
    }
}

fn load_request(conn: &Connection, id: i64) -> DbResult<RegistrationRequest> {
    conn.query_row(
        &format!("SELECT {REQUEST_COLUMNS} FROM registration_requests WHERE id = ?1"),
        params![id],
        parse_request_row,
    )
    .optional()?
    .ok_or(DbError::NotFound {
        entity: "registration request",
        id,
    })
}

fn load_assignment(conn: &Connection, id: i64) -> DbResult<Assignment> {
    conn.query_row(
        &format!("SELECT {ASSIGNMENT_COLUMNS} FROM assignments WHERE id = ?1"),
        params![id],
        parse_assignment_row,
    )
    .optional()?
    .ok_or(DbError::NotFound {
        entity: "assignment",
        id,
    })
}

fn load_solution_detail(conn: &Connection, id: i64) -> DbResult<SolutionDetail> {
    conn.query_row(
        &format!("{SOLUTION_DETAIL_SELECT} WHERE s.id = ?1"),
        params![id],
        parse_solution_detail_row,
    )
    .optional()?
    .ok_or(DbError::NotFound {
        entity: "solution",
        id,
    })
}

fn parse_user_row(row: &Row<'_>) -> rusqlite::Result<User> {
    Ok(User {
        external_id: row.get(0)?,
        username: row.get(1)?,
        first_name: row.get(2)?,
        last_name: row.get(3)?,
        phone: row.get(4)?,
        grade: row.get(5)?,
        parent_contact: row.get(6)?,
        is_active: row.get(7)?,
        notes: row.get(8)?,
        registered_at: parse_datetime(9, &row.get::<_, String>(9)?)?,
    })
}

fn parse_admin_row(row: &Row<'_>) -> rusqlite::Result<Admin> {
    Ok(Admin {
        external_id: row.get(0)?,
        username: row.get(1)?,
        first_name: row.get(2)?,
        is_super_admin: row.get(3)?,
        added_at: parse_datetime(4, &row.get::<_, String>(4)?)?,
    })
}

fn parse_request_row(row: &Row<'_>) -> rusqlite::Result<RegistrationRequest> {
    Ok(RegistrationRequest {
        id: row.get(0)?,
        external_id: row.get(1)?,
        username: row.get(2)?,
        first_name: row.get(3)?,
        last_name: row.get(4)?,
        phone: row.get(5)?,
        grade: row.get(6)?,
        parent_contact: row.get(7)?,
        motivation: row.get(8)?,
        status: row.get(9)?,
        admin_comment: row.get(10)?,
        created_at: parse_datetime(11, &row.get::<_, String>(11)?)?,
    })
}

fn parse_assignment_row(row: &Row<'_>) -> rusqlite::Result<Assignment> {
    Ok(Assignment {
        id: row.get(0)?,
        title: row.get(1)?,
        description: row.get(2)?,
        grade_level: row.get(3)?,
        difficulty: row.get(4)?,
        due_date: row
            .get::<_, Option<String>>(5)?
            .map(|s| parse_date(5, &s))
            .transpose()?,
        is_active: row.get(6)?,
        created_by: row.get(7)?,
        created_at: parse_datetime(8, &row.get::<_, String>(8)?)?,
    })
}

fn parse_solution_detail_row(row: &Row<'_>) -> rusqlite::Result<SolutionDetail> {
    let first_name: String = row.get(9)?;
    let last_name: String = row.get(10)?;
    Ok(SolutionDetail {
        solution: Solution {
            id: row.get(0)?,
            user_id: row.get(1)?,
            assignment_id: row.get(2)?,
            text: row.get(3)?,
            score: row.get(4)?,
            max_score: row.get(5)?,
            comment: row.get(6)?,
            submitted_at: parse_datetime(7, &row.get::<_, String>(7)?)?,
            graded_at: row
                .get::<_, Option<String>>(8)?
                .map(|s| parse_datetime(8, &s))
                .transpose()?,
        },
        student_name: format!("{first_name} {last_name}"),
        student_grade: row.get(11)?,
        assignment_title: row.get(12)?,
        assignment_difficulty: row.get(13)?,
        assignment_creator: row.get(14)?,
    })
}

fn parse_file_row(row: &Row<'_>) -> rusqlite::Result<FileRecord> {
    Ok(FileRecord {
        id: row.get(0)?,
        handle: row.get(1)?,
        unique_id: row.get(2)?,
        file_name: row.get(3)?,
        byte_size: row.get(4)?,
        mime_type: row.get(5)?,
        class: row.get(6)?,
        uploaded_by: row.get(7)?,
        uploaded_at: parse_datetime(8, &row.get::<_, String>(8)?)?,
    })
}

fn parse_datetime(idx: usize, s: &str) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

fn format_date(date: NaiveDate) -> String {
    date.format("%Y-%m-%d").to_string()
}

fn parse_date(idx: usize, s: &str) -> rusqlite::Result<NaiveDate> {
    NaiveDate::parse_from_str(s, "%Y-%m-%d")
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}
