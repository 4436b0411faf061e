//! Read-only views rendered for commands
//!
//! Everything here is pure: the router loads the data and sends the pages.

use crate::db::{
    Admin, Assignment, FileRecord, RegistrationRequest, SolutionDetail, User, UserStats,
};
use crate::files::format_file_list;
use crate::notify::grade_marker;
use crate::state_machine::Choice;
use std::fmt::Write;

/// Longest message the transport accepts, in characters
pub const MAX_MESSAGE_CHARS: usize = 4000;

/// Ungraded solutions shown per `/ungraded`
pub const UNGRADED_PAGE: usize = 5;

/// Recent solutions listed by `/progress`
const RECENT_SOLUTIONS: usize = 5;

const PREVIEW_CHARS: usize = 100;

/// Who is asking; decides which commands and views apply
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Admin,
    Student,
    Applicant,
    Guest,
}

/// One reply: text, buttons on its last chunk, then files re-sent by handle
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Page {
    pub text: String,
    pub choices: Vec<Choice>,
    pub files: Vec<String>,
}

impl Page {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            ..Self::default()
        }
    }

    pub fn with_choice(mut self, choice: Choice) -> Self {
        self.choices.push(choice);
        self
    }

    pub fn with_files(mut self, files: &[FileRecord]) -> Self {
        self.files.extend(files.iter().map(|f| f.handle.clone()));
        self
    }
}

/// Split `text` into pieces of at most `limit` characters, preferring line
/// breaks.
pub fn chunks(text: &str, limit: usize) -> Vec<String> {
    let mut out = Vec::new();
    let mut current = String::new();
    let mut current_len = 0;

    for line in text.split_inclusive('\n') {
        let line_len = line.chars().count();
        if current_len + line_len > limit && !current.is_empty() {
            out.push(std::mem::take(&mut current));
            current_len = 0;
        }
        if line_len > limit {
            // A single line longer than the limit is cut by characters
            let chars: Vec<char> = line.chars().collect();
            for piece in chars.chunks(limit) {
                out.push(piece.iter().collect());
            }
            continue;
        }
        current.push_str(line);
        current_len += line_len;
    }
    if !current.is_empty() || out.is_empty() {
        out.push(current);
    }
    out
}

fn preview(text: &str) -> String {
    if text.chars().count() <= PREVIEW_CHARS {
        return text.to_string();
    }
    let cut: String = text.chars().take(PREVIEW_CHARS).collect();
    format!("{cut}...")
}

pub fn welcome(role: Role, name: &str) -> String {
    match role {
        Role::Admin => format!(
            "👨‍🏫 Welcome, {name}!\n\n\
             /pending - registration requests\n\
             /users - students\n\
             /create_assignment - new assignment\n\
             /assignments - all assignments\n\
             /ungraded - solutions to grade\n\
             /help - all commands"
        ),
        Role::Student => format!(
            "👋 Hi, {name}! You are registered.\n\n\
             /assignments - my assignments\n\
             /progress - my statistics\n\
             /help - all commands"
        ),
        Role::Applicant => "⏳ Your registration request is waiting for review. \
                            You will get a message once it is decided."
            .to_string(),
        Role::Guest => "🎓 Welcome! Registration is required to get access.\n\
                        Your request will be reviewed by the teacher.\n\n\
                        Send /register to apply."
            .to_string(),
    }
}

pub fn help(role: Role) -> String {
    match role {
        Role::Admin => "🔧 Admin commands:\n\n\
             👥 Students:\n\
             /pending - registration requests\n\
             /approve <id> [comment] - approve a request\n\
             /reject <id> - reject a request\n\
             /users - active students\n\
             /deactivate <user id> - deactivate a student\n\
             /note <user id> <text> - note about a student\n\n\
             📚 Assignments:\n\
             /create_assignment - new assignment\n\
             /assignments - all assignments\n\
             /assignment <id> - assignment details\n\
             /close <id> - deactivate an assignment\n\
             /ungraded - solutions to grade\n\
             /solution <id> - solution details\n\
             /grade <id> - grade a solution\n\n\
             🔑 Admins:\n\
             /admins - list admins\n\
             /add_admin <user id> [name] - promote (super admin only)\n\n\
             📎 Assignments and grades can carry files.\n\
             /cancel - abandon the current form"
            .to_string(),
        Role::Student => "📚 Commands:\n\n\
             /assignments - my assignments\n\
             /assignment <id> - assignment details\n\
             /solve <id> - submit a solution\n\
             /solution <id> - solution details\n\
             /progress - my statistics\n\n\
             📎 Solutions can carry files.\n\
             /cancel - abandon the current form"
            .to_string(),
        Role::Applicant | Role::Guest => "ℹ️ Commands:\n\n\
             /start - get started\n\
             /register - apply for registration\n\
             /cancel - abandon the current form\n\
             /help - this help"
            .to_string(),
    }
}

pub fn pending_request(request: &RegistrationRequest) -> Page {
    let username = request
        .username
        .as_deref()
        .map(|u| format!(" (@{u})"))
        .unwrap_or_default();
    Page::text(format!(
        "📋 Request #{}\n👤 {}{username}\n🎓 Grade: {}\n📱 {}\n👨‍👩‍👧 {}\n💭 {}\n📅 {}",
        request.id,
        request.display_name(),
        request.grade,
        request.phone,
        request.parent_contact,
        request.motivation,
        request.created_at.format("%Y-%m-%d %H:%M"),
    ))
    .with_choice(Choice::new("✅ Approve", format!("approve_{}", request.id)))
    .with_choice(Choice::new("❌ Reject", format!("reject_{}", request.id)))
}

pub fn users(users: &[User]) -> String {
    if users.is_empty() {
        return "📋 No registered students yet.".to_string();
    }
    let mut text = format!("👥 Students ({}):\n", users.len());
    for user in users {
        let _ = write!(
            text,
            "\n👤 {} [id {}]\n🎓 Grade {} | 📱 {}\n📅 Since {}\n",
            user.display_name(),
            user.external_id,
            user.grade,
            user.phone,
            user.registered_at.format("%Y-%m-%d"),
        );
        if let Some(notes) = &user.notes {
            let _ = writeln!(text, "📝 {notes}");
        }
    }
    text
}

pub fn admins(admins: &[Admin]) -> String {
    let mut text = "🔑 Admins:\n".to_string();
    for admin in admins {
        let role = if admin.is_super_admin { " ⭐" } else { "" };
        let _ = write!(text, "\n{} [id {}]{role}", admin.first_name, admin.external_id);
    }
    text
}

fn due_suffix(assignment: &Assignment) -> String {
    assignment
        .due_date
        .map(|d| format!(" 📅 due {}", d.format("%d.%m.%Y")))
        .unwrap_or_default()
}

/// Every assignment, including inactive ones
pub fn all_assignments(assignments: &[Assignment]) -> String {
    if assignments.is_empty() {
        return "📋 No assignments yet.\n\nSend /create_assignment to add one.".to_string();
    }
    let mut text = "📚 All assignments:\n".to_string();
    for a in assignments {
        let status = if a.is_active { "✅ active" } else { "❌ closed" };
        let _ = write!(
            text,
            "\n#{} {}\n🎓 {} | {} {} | {status}{}\n",
            a.id,
            a.title,
            a.audience_label(),
            a.difficulty.marker(),
            a.difficulty,
            due_suffix(a),
        );
    }
    text
}

/// Assignments visible to one student
pub fn student_assignments(assignments: &[Assignment]) -> String {
    if assignments.is_empty() {
        return "📋 No assignments for you yet.".to_string();
    }
    let mut text = "📚 Your assignments:\n".to_string();
    for a in assignments {
        let _ = write!(
            text,
            "\n#{} {}\n{} {}{}\n📄 {}\n",
            a.id,
            a.title,
            a.difficulty.marker(),
            a.difficulty,
            due_suffix(a),
            preview(&a.description),
        );
    }
    text.push_str("\nDetails: /assignment <id>\nSubmit: /solve <id>");
    text
}

pub fn assignment_detail(assignment: &Assignment, files: &[FileRecord], role: Role) -> Page {
    let due = assignment
        .due_date
        .map(|d| format!("\n📅 Due: {}", d.format("%d.%m.%Y")))
        .unwrap_or_default();
    let status = if assignment.is_active { "" } else { "\n❌ Closed" };
    let attachments = if files.is_empty() {
        String::new()
    } else {
        format!("\n\n{}", format_file_list(files))
    };
    let page = Page::text(format!(
        "📝 #{} {}\n\n{}\n\n🎓 For: {}\n{} {}\n🕐 Created: {}{due}{status}{attachments}",
        assignment.id,
        assignment.title,
        assignment.description,
        assignment.audience_label(),
        assignment.difficulty.marker(),
        assignment.difficulty,
        assignment.created_at.format("%Y-%m-%d %H:%M"),
    ))
    .with_files(files);

    if role == Role::Student && assignment.is_active {
        page.with_choice(Choice::new(
            "✍️ Submit a solution",
            format!("solve_{}", assignment.id),
        ))
    } else {
        page
    }
}

pub fn solution_detail(
    detail: &SolutionDetail,
    solution_files: &[FileRecord],
    grade_files: &[FileRecord],
    role: Role,
) -> Page {
    let solution = &detail.solution;
    let verdict = match solution.grade() {
        Some(score) => {
            let comment = solution
                .comment
                .as_deref()
                .map(|c| format!("\n💬 {c}"))
                .unwrap_or_default();
            format!(
                "{} Score: {score} ({}%){comment}",
                grade_marker(score.percentage()),
                score.percentage()
            )
        }
        None => "⏳ Waiting for grading".to_string(),
    };
    let mut text = format!(
        "📝 Solution #{} for \"{}\"\n👤 {} (grade {})\n📅 {}\n\n{}\n\n{verdict}",
        solution.id,
        detail.assignment_title,
        detail.student_name,
        detail.student_grade,
        solution.submitted_at.format("%Y-%m-%d %H:%M"),
        solution.text,
    );
    if !solution_files.is_empty() {
        let _ = write!(text, "\n\n{}", format_file_list(solution_files));
    }
    if !grade_files.is_empty() {
        let _ = write!(text, "\n\nFrom the teacher:\n{}", format_file_list(grade_files));
    }

    let page = Page::text(text)
        .with_files(solution_files)
        .with_files(grade_files);
    if role == Role::Admin {
        page.with_choice(Choice::new("📊 Grade", format!("grade_{}", solution.id)))
    } else {
        page
    }
}

/// First `UNGRADED_PAGE` ungraded solutions, oldest first
pub fn ungraded(solutions: &[SolutionDetail]) -> Vec<Page> {
    if solutions.is_empty() {
        return vec![Page::text("✅ Everything is graded!")];
    }
    let mut pages: Vec<Page> = solutions
        .iter()
        .take(UNGRADED_PAGE)
        .map(|d| {
            Page::text(format!(
                "📝 {}\n👤 {} (grade {})\n📅 Submitted {}\n🆔 Solution #{}\n\n{}",
                d.assignment_title,
                d.student_name,
                d.student_grade,
                d.solution.submitted_at.format("%Y-%m-%d %H:%M"),
                d.solution.id,
                preview(&d.solution.text),
            ))
            .with_choice(Choice::new("📊 Grade", format!("grade_{}", d.solution.id)))
        })
        .collect();
    if solutions.len() > UNGRADED_PAGE {
        pages.push(Page::text(format!(
            "Showing {UNGRADED_PAGE} of {} solutions.",
            solutions.len()
        )));
    }
    pages
}

pub fn progress(stats: &UserStats, solutions: &[SolutionDetail]) -> String {
    if solutions.is_empty() {
        return "📊 You have not submitted any solutions yet.".to_string();
    }
    let average = stats
        .average_percentage
        .map_or_else(|| "-".to_string(), |p| format!("{p}%"));
    let mut text = format!(
        "📊 Your statistics\n\n📝 Submitted: {}\n✅ Graded: {}\n📈 Average: {average}\n",
        stats.total, stats.graded
    );

    if !stats.by_difficulty.is_empty() {
        text.push_str("\nBy difficulty:\n");
        for d in &stats.by_difficulty {
            let _ = writeln!(
                text,
                "{} {}: {}% ({} graded)",
                d.difficulty.marker(),
                d.difficulty,
                d.average_percentage,
                d.graded
            );
        }
    }

    text.push_str("\n📋 Recent solutions:\n");
    for d in solutions.iter().take(RECENT_SOLUTIONS) {
        let status = d
            .solution
            .grade()
            .map_or_else(|| "⏳ waiting".to_string(), |s| format!("✅ {s}"));
        let _ = writeln!(text, "• {} - {status}", d.assignment_title);
    }
    if solutions.len() > RECENT_SOLUTIONS {
        let _ = write!(
            text,
            "\n...and {} more",
            solutions.len() - RECENT_SOLUTIONS
        );
    }
    text
}
