//! Line-level codec for inline markdown tasks.
//!
//! Recognition and field extraction are span-based rather than destructive:
//! a parsed line remembers every token's original text, so a rewrite can
//! replace exactly the fields that changed and leave everything else —
//! including emoji-vs-parenthesized token forms and malformed tokens that
//! stayed in the title — as the author wrote it.

use crate::domain::dates;
use crate::types::{Priority, TaskStatus};
use chrono::NaiveDate;
use regex::Regex;
use std::sync::LazyLock;

static TASK_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(?P<indent>[ \t]*)(?P<bullet>[-*])\s+\[(?P<status>[ xX])\](?:\s+(?P<rest>.*))?$")
        .unwrap()
});

static ANCHOR_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\s*\^(?P<id>[A-Za-z0-9-]+)\s*$").unwrap());

static TOKEN_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(concat!(
        r"(?P<due_e>📅\s*\d{4}-\d{2}-\d{2})",
        r"|(?P<due_p>\(due:\s*\d{4}-\d{2}-\d{2}\))",
        r"|(?P<sched_e>⏳\s*\d{4}-\d{2}-\d{2})",
        r"|(?P<sched_p>\(scheduled:\s*\d{4}-\d{2}-\d{2}\))",
        r"|(?P<start_e>🛫\s*\d{4}-\d{2}-\d{2})",
        r"|(?P<start_p>\(start:\s*\d{4}-\d{2}-\d{2}\))",
        r"|(?P<done_e>✅\s*\d{4}-\d{2}-\d{2})",
        r"|(?P<done_p>\(done:\s*\d{4}-\d{2}-\d{2}\))",
        r"|(?P<prio>[⏫🔼🔽🔺])",
        r"|(?P<recur>🔁)",
        r"|(?P<tag>#[A-Za-z0-9_/-]+)",
    ))
    .unwrap()
});

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TokenField {
    Due,
    Scheduled,
    Start,
    DoneOn,
    Priority,
    Recurrence,
}

/// One span of the `<rest>` portion of a task line, in source order.
#[derive(Debug, Clone, PartialEq)]
enum Segment {
    /// Free text (title content, including malformed or duplicate tokens).
    Text(String),
    /// A `#tag` token, kept in place across rewrites.
    Tag(String),
    /// A recognized field token with its original text.
    Field { kind: TokenField, raw: String },
}

/// A recognized task line, decomposed for field access and rewriting.
#[derive(Debug, Clone, PartialEq)]
pub struct ParsedTask {
    pub indent: String,
    pub bullet: char,
    pub status: TaskStatus,
    pub title: String,
    pub due: Option<NaiveDate>,
    pub scheduled: Option<NaiveDate>,
    pub start: Option<NaiveDate>,
    pub done_on: Option<NaiveDate>,
    pub priority: Priority,
    pub recurrence: Option<String>,
    pub tags: Vec<String>,
    pub block_anchor: Option<String>,
    segments: Vec<Segment>,
}

/// A task found during a document walk. `line_no` is 1-based.
#[derive(Debug, Clone)]
pub struct DocumentTask {
    pub line_no: usize,
    pub task: ParsedTask,
}

/// Field changes to apply to an existing line.
///
/// The outer `Option` is "touch this field at all"; for clearable fields the
/// inner `Option` is the new value (`None` removes the token).
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LineEdit {
    pub title: Option<String>,
    pub status: Option<TaskStatus>,
    pub due: Option<Option<NaiveDate>>,
    pub done_on: Option<Option<NaiveDate>>,
    pub priority: Option<Priority>,
}

impl LineEdit {
    pub fn is_empty(&self) -> bool {
        *self == LineEdit::default()
    }
}

fn priority_for_marker(marker: &str) -> Priority {
    match marker {
        "⏫" => Priority::Highest,
        "🔼" => Priority::High,
        "🔽" => Priority::Medium,
        "🔺" => Priority::Low,
        _ => Priority::None,
    }
}

fn marker_for_priority(priority: Priority) -> Option<&'static str> {
    match priority {
        Priority::Highest => Some("⏫"),
        Priority::High => Some("🔼"),
        Priority::Medium => Some("🔽"),
        Priority::Low => Some("🔺"),
        Priority::None => None,
    }
}

/// True when a line opens or closes a fenced code block.
pub fn is_fence_delimiter(line: &str) -> bool {
    line.trim_start().starts_with("```")
}

struct RawToken {
    start: usize,
    end: usize,
    kind: RawKind,
}

enum RawKind {
    Date(TokenField),
    Priority,
    Recurrence,
    Tag,
}

fn scan_tokens(rest: &str) -> Vec<RawToken> {
    let mut out = Vec::new();
    for caps in TOKEN_RE.captures_iter(rest) {
        let whole = caps.get(0).unwrap();
        let kind = if caps.name("due_e").is_some() || caps.name("due_p").is_some() {
            RawKind::Date(TokenField::Due)
        } else if caps.name("sched_e").is_some() || caps.name("sched_p").is_some() {
            RawKind::Date(TokenField::Scheduled)
        } else if caps.name("start_e").is_some() || caps.name("start_p").is_some() {
            RawKind::Date(TokenField::Start)
        } else if caps.name("done_e").is_some() || caps.name("done_p").is_some() {
            RawKind::Date(TokenField::DoneOn)
        } else if caps.name("prio").is_some() {
            RawKind::Priority
        } else if caps.name("recur").is_some() {
            RawKind::Recurrence
        } else {
            // Tags must start the line or follow whitespace; a '#' glued to
            // other text is title content.
            let at_boundary = whole.start() == 0
                || rest[..whole.start()]
                    .chars()
                    .next_back()
                    .is_some_and(char::is_whitespace);
            if !at_boundary {
                continue;
            }
            RawKind::Tag
        };
        out.push(RawToken {
            start: whole.start(),
            end: whole.end(),
            kind,
        });
    }
    out
}

fn date_body(raw: &str) -> Option<NaiveDate> {
    // The last 10 characters of every date token form are the date body.
    let trimmed = raw.trim_end_matches(')');
    let body = &trimmed[trimmed.len().saturating_sub(10)..];
    dates::parse_date(body)
}

/// Parses a single line; `None` when the line is not task-shaped.
pub fn parse_task_line(line: &str) -> Option<ParsedTask> {
    let caps = TASK_RE.captures(line)?;
    let indent = caps.name("indent").map_or("", |m| m.as_str()).to_string();
    let bullet = caps.name("bullet").unwrap().as_str().chars().next().unwrap();
    let status_char = caps.name("status").unwrap().as_str().chars().next().unwrap();
    let status = if status_char.eq_ignore_ascii_case(&'x') {
        TaskStatus::Done
    } else {
        TaskStatus::Todo
    };
    let full_rest = caps.name("rest").map_or("", |m| m.as_str());

    // The block anchor is only recognized at end of line.
    let (rest, block_anchor) = match ANCHOR_RE.captures(full_rest) {
        Some(anchor_caps) => {
            let whole = anchor_caps.get(0).unwrap();
            (
                &full_rest[..whole.start()],
                Some(anchor_caps.name("id").unwrap().as_str().to_string()),
            )
        }
        None => (full_rest, None),
    };

    let tokens = scan_tokens(rest);
    let mut segments: Vec<Segment> = Vec::new();
    let mut due = None;
    let mut scheduled = None;
    let mut start = None;
    let mut done_on = None;
    let mut priority = Priority::None;
    let mut recurrence: Option<String> = None;
    let mut tags: Vec<String> = Vec::new();

    let push_text = |segments: &mut Vec<Segment>, raw: &str| {
        let trimmed = raw.trim();
        if !trimmed.is_empty() {
            segments.push(Segment::Text(trimmed.to_string()));
        }
    };

    let mut pos = 0;
    let mut i = 0;
    while i < tokens.len() {
        let tok = &tokens[i];
        if tok.start > pos {
            push_text(&mut segments, &rest[pos..tok.start]);
        }
        match tok.kind {
            RawKind::Date(field) => {
                let raw = &rest[tok.start..tok.end];
                let slot = match field {
                    TokenField::Due => &mut due,
                    TokenField::Scheduled => &mut scheduled,
                    TokenField::Start => &mut start,
                    TokenField::DoneOn => &mut done_on,
                    _ => unreachable!(),
                };
                match date_body(raw) {
                    // First occurrence wins; duplicates and malformed dates
                    // stay in the title verbatim.
                    Some(parsed) if slot.is_none() => {
                        *slot = Some(parsed);
                        segments.push(Segment::Field {
                            kind: field,
                            raw: raw.to_string(),
                        });
                    }
                    _ => push_text(&mut segments, raw),
                }
                pos = tok.end;
            }
            RawKind::Priority => {
                let raw = &rest[tok.start..tok.end];
                if priority == Priority::None {
                    priority = priority_for_marker(raw);
                    segments.push(Segment::Field {
                        kind: TokenField::Priority,
                        raw: raw.to_string(),
                    });
                } else {
                    push_text(&mut segments, raw);
                }
                pos = tok.end;
            }
            RawKind::Recurrence => {
                // Recurrence text runs until the next recognized token.
                let value_end = tokens.get(i + 1).map_or(rest.len(), |next| next.start);
                let raw = rest[tok.start..value_end].trim_end();
                let value = rest[tok.end..value_end].trim();
                if recurrence.is_none() && !value.is_empty() {
                    recurrence = Some(value.to_string());
                    segments.push(Segment::Field {
                        kind: TokenField::Recurrence,
                        raw: raw.to_string(),
                    });
                } else {
                    push_text(&mut segments, raw);
                }
                pos = value_end;
            }
            RawKind::Tag => {
                let tag = rest[tok.start + 1..tok.end].to_string();
                if !tags.contains(&tag) {
                    tags.push(tag.clone());
                }
                segments.push(Segment::Tag(tag));
                pos = tok.end;
            }
        }
        i += 1;
    }
    if pos < rest.len() {
        push_text(&mut segments, &rest[pos..]);
    }

    let title = segments
        .iter()
        .filter_map(|s| match s {
            Segment::Text(t) => Some(t.as_str()),
            _ => None,
        })
        .collect::<Vec<_>>()
        .join(" ");

    Some(ParsedTask {
        indent,
        bullet,
        status,
        title,
        due,
        scheduled,
        start,
        done_on,
        priority,
        recurrence,
        tags,
        block_anchor,
        segments,
    })
}

/// Walks a document, skipping fenced code blocks, and returns every task.
pub fn extract_tasks(text: &str) -> Vec<DocumentTask> {
    let mut out = Vec::new();
    let mut in_fence = false;
    for (idx, line) in text.lines().enumerate() {
        if is_fence_delimiter(line) {
            in_fence = !in_fence;
            continue;
        }
        if in_fence {
            continue;
        }
        if let Some(task) = parse_task_line(line) {
            out.push(DocumentTask {
                line_no: idx + 1,
                task,
            });
        }
    }
    out
}

fn render_date_token(kind: TokenField, original: &str, date: NaiveDate) -> String {
    let day = dates::format_date(date);
    if original.starts_with('(') {
        let key = match kind {
            TokenField::Due => "due",
            TokenField::Scheduled => "scheduled",
            TokenField::Start => "start",
            TokenField::DoneOn => "done",
            _ => unreachable!(),
        };
        format!("({key}: {day})")
    } else {
        let marker = match kind {
            TokenField::Due => "📅",
            TokenField::Scheduled => "⏳",
            TokenField::Start => "🛫",
            TokenField::DoneOn => "✅",
            _ => unreachable!(),
        };
        format!("{marker} {day}")
    }
}

fn edit_changes_line(parsed: &ParsedTask, edit: &LineEdit) -> bool {
    if let Some(title) = &edit.title {
        if *title != parsed.title {
            return true;
        }
    }
    if let Some(status) = edit.status {
        if status != parsed.status {
            return true;
        }
    }
    if let Some(due) = edit.due {
        if due != parsed.due {
            return true;
        }
    }
    if let Some(done_on) = edit.done_on {
        if done_on != parsed.done_on {
            return true;
        }
    }
    if let Some(priority) = edit.priority {
        if priority != parsed.priority {
            return true;
        }
    }
    false
}

/// Rewrites a task line in place, replacing exactly the fields in `edit`.
///
/// Returns `None` when the line is not a recognizable task. When the edit is
/// a no-op the original line is returned byte-for-byte. Unchanged tokens
/// keep their original textual form; newly-set fields are appended in
/// canonical emoji form before the block anchor.
pub fn rewrite_line(original: &str, edit: &LineEdit) -> Option<String> {
    let parsed = parse_task_line(original)?;
    if !edit_changes_line(&parsed, edit) {
        return Some(original.to_string());
    }

    let status = edit.status.unwrap_or(parsed.status);
    let status_char = match status {
        TaskStatus::Done => 'x',
        TaskStatus::Todo => ' ',
    };

    let mut parts: Vec<String> = Vec::new();
    let mut title_emitted = false;
    let mut had_due_token = false;
    let mut had_done_token = false;
    let mut had_priority_token = false;

    for segment in &parsed.segments {
        match segment {
            Segment::Text(text) => match &edit.title {
                Some(new_title) => {
                    if !title_emitted {
                        if !new_title.is_empty() {
                            parts.push(new_title.clone());
                        }
                        title_emitted = true;
                    }
                }
                None => parts.push(text.clone()),
            },
            Segment::Tag(tag) => parts.push(format!("#{tag}")),
            Segment::Field { kind, raw } => match kind {
                TokenField::Due => {
                    had_due_token = true;
                    match edit.due {
                        Some(Some(new_due)) => {
                            parts.push(render_date_token(TokenField::Due, raw, new_due));
                        }
                        Some(None) => {}
                        None => parts.push(raw.clone()),
                    }
                }
                TokenField::DoneOn => {
                    had_done_token = true;
                    match edit.done_on {
                        Some(Some(new_done)) => {
                            parts.push(render_date_token(TokenField::DoneOn, raw, new_done));
                        }
                        Some(None) => {}
                        None => parts.push(raw.clone()),
                    }
                }
                TokenField::Priority => {
                    had_priority_token = true;
                    match edit.priority {
                        Some(new_priority) => {
                            if let Some(marker) = marker_for_priority(new_priority) {
                                parts.push(marker.to_string());
                            }
                        }
                        None => parts.push(raw.clone()),
                    }
                }
                _ => parts.push(raw.clone()),
            },
        }
    }

    if let Some(new_title) = &edit.title {
        if !title_emitted && !new_title.is_empty() {
            parts.insert(0, new_title.clone());
        }
    }
    if let Some(Some(new_due)) = edit.due {
        if !had_due_token {
            parts.push(format!("📅 {}", dates::format_date(new_due)));
        }
    }
    if let Some(Some(new_done)) = edit.done_on {
        if !had_done_token {
            parts.push(format!("✅ {}", dates::format_date(new_done)));
        }
    }
    if let Some(new_priority) = edit.priority {
        if !had_priority_token {
            if let Some(marker) = marker_for_priority(new_priority) {
                parts.push(marker.to_string());
            }
        }
    }

    let mut line = format!("{}{} [{}]", parsed.indent, parsed.bullet, status_char);
    let rest = parts.join(" ");
    if !rest.is_empty() {
        line.push(' ');
        line.push_str(&rest);
    }
    if let Some(anchor) = &parsed.block_anchor {
        line.push_str(&format!(" ^{anchor}"));
    }
    Some(line)
}

/// Emits a brand-new task line in canonical form.
pub fn emit_task_line(
    title: &str,
    status: TaskStatus,
    due: Option<NaiveDate>,
    priority: Priority,
    done_on: Option<NaiveDate>,
    tags: &[String],
    anchor: Option<&str>,
) -> String {
    let status_char = match status {
        TaskStatus::Done => 'x',
        TaskStatus::Todo => ' ',
    };
    let mut parts: Vec<String> = Vec::new();
    if !title.is_empty() {
        parts.push(title.to_string());
    }
    for tag in tags {
        parts.push(format!("#{tag}"));
    }
    if let Some(day) = due {
        parts.push(format!("📅 {}", dates::format_date(day)));
    }
    if let Some(marker) = marker_for_priority(priority) {
        parts.push(marker.to_string());
    }
    if let Some(day) = done_on {
        parts.push(format!("✅ {}", dates::format_date(day)));
    }
    if let Some(id) = anchor {
        parts.push(format!("^{id}"));
    }
    if parts.is_empty() {
        format!("- [{status_char}]")
    } else {
        format!("- [{status_char}] {}", parts.join(" "))
    }
}
