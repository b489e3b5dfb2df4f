use std::collections::HashMap;
use std::fmt;

use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

pub type Id = i64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema, sqlx::Type)]
#[serde(rename_all = "lowercase")]
#[sqlx(type_name = "ticket_status", rename_all = "lowercase")]
pub enum TicketStatus {
    Open,
    /// Owner has posted and support has not answered yet.
    Pending,
    Closed,
}

impl TicketStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            TicketStatus::Open => "open",
            TicketStatus::Pending => "pending",
            TicketStatus::Closed => "closed",
        }
    }

    /// Legal status transitions. Closed tickets accept nothing but a reopen.
    pub fn can_transition(self, to: TicketStatus) -> bool {
        use TicketStatus::*;
        matches!(
            (self, to),
            (Open, Closed) | (Open, Pending) | (Pending, Open) | (Pending, Closed) | (Closed, Open)
        )
    }
}

impl fmt::Display for TicketStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// Priority values are business data inherited from the original helpdesk and
// kept stable on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema, sqlx::Type)]
#[serde(rename_all = "lowercase")]
#[sqlx(type_name = "ticket_priority", rename_all = "lowercase")]
pub enum TicketPriority {
    Baja,
    Media,
    Alta,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema, sqlx::Type)]
#[serde(rename_all = "lowercase")]
#[sqlx(type_name = "ticket_kind", rename_all = "lowercase")]
pub enum TicketKind {
    Incident,
    Request,
    Question,
    Other,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema, sqlx::FromRow)]
pub struct Ticket {
    pub id: Id,
    pub user_id: Id,
    /// Technician currently assigned; None until first assignment/escalation.
    pub technician_id: Option<Id>,
    pub title: String,
    pub kind: TicketKind,
    pub priority: TicketPriority,
    pub status: TicketStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct NewTicket {
    pub title: String,
    pub kind: TicketKind,
    pub priority: TicketPriority,
    /// Problem description; becomes the ticket's first (undeletable) reply.
    pub content: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, ToSchema)]
pub struct TicketPatch {
    pub title: Option<String>,
    pub kind: Option<TicketKind>,
    pub priority: Option<TicketPriority>,
    pub status: Option<TicketStatus>,
}

impl TicketPatch {
    pub fn is_empty(&self) -> bool {
        self.title.is_none() && self.kind.is_none() && self.priority.is_none() && self.status.is_none()
    }

    /// True when the patch touches anything beyond the title.
    pub fn touches_privileged_fields(&self) -> bool {
        self.kind.is_some() || self.priority.is_some() || self.status.is_some()
    }
}

#[derive(Debug, Clone, Default)]
pub struct TicketFilter {
    pub owner_id: Option<Id>,
    pub status: Option<TicketStatus>,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema, sqlx::FromRow)]
pub struct Reply {
    pub id: Id,
    pub ticket_id: Id,
    pub author_id: Id,
    pub content: String,
    pub from_support: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct NewReply {
    pub ticket_id: Id,
    pub author_id: Id,
    pub content: String,
    pub from_support: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema, sqlx::Type)]
#[serde(rename_all = "lowercase")]
#[sqlx(type_name = "attachment_kind", rename_all = "lowercase")]
pub enum AttachmentKind {
    Image,
    Document,
    Video,
    Audio,
    Other,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema, sqlx::FromRow)]
pub struct Attachment {
    pub id: Id,
    pub reply_id: Id,
    pub kind: AttachmentKind,
    pub mime: String,
    /// Key in the blob store; also the public fetch path segment.
    pub storage_key: String,
    pub file_name: String,
    pub size_bytes: i64,
    pub checksum: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct NewAttachment {
    pub kind: AttachmentKind,
    pub mime: String,
    pub storage_key: String,
    pub file_name: String,
    pub size_bytes: i64,
    pub checksum: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema, sqlx::FromRow)]
pub struct Escalation {
    pub id: Id,
    pub ticket_id: Id,
    pub origin_id: Id,
    pub dest_id: Id,
    pub reason: String,
    pub observations: Option<String>,
    pub approved: bool,
    pub requested_at: DateTime<Utc>,
    pub approved_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct NewEscalation {
    pub ticket_id: Id,
    pub origin_id: Id,
    pub dest_id: Id,
    pub reason: String,
    pub observations: Option<String>,
}

/// Append-only audit record written on assignment-changing actions.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema, sqlx::FromRow)]
pub struct TrackingNote {
    pub id: Id,
    pub ticket_id: Id,
    pub note: String,
    pub created_at: DateTime<Utc>,
}

// ---------------- attachment classification -----------------------

// Fixed extension -> kind table. Doubles as the upload allow-list: anything
// absent from this table is rejected at the boundary, while classification of
// an unlisted extension falls back to Other.
static EXTENSION_KINDS: Lazy<HashMap<&'static str, AttachmentKind>> = Lazy::new(|| {
    use AttachmentKind::*;
    HashMap::from([
        ("jpg", Image),
        ("jpeg", Image),
        ("png", Image),
        ("gif", Image),
        ("webp", Image),
        ("pdf", Document),
        ("doc", Document),
        ("docx", Document),
        ("xls", Document),
        ("xlsx", Document),
        ("txt", Document),
        ("csv", Document),
        ("mp4", Video),
        ("webm", Video),
        ("mov", Video),
        ("mp3", Audio),
        ("wav", Audio),
        ("ogg", Audio),
        ("zip", Other),
    ])
});

/// Lowercased extension of a file name, empty when there is none.
pub fn file_extension(name: &str) -> String {
    name.rsplit_once('.')
        .map(|(_, ext)| ext.to_ascii_lowercase())
        .unwrap_or_default()
}

pub fn extension_allowed(ext: &str) -> bool {
    EXTENSION_KINDS.contains_key(ext)
}

pub fn classify_extension(ext: &str) -> AttachmentKind {
    EXTENSION_KINDS.get(ext).copied().unwrap_or(AttachmentKind::Other)
}
