use crate::models::*;

#[derive(thiserror::Error, Debug)]
pub enum RepoError {
    #[error("not found")]
    NotFound,
    #[error("conflict")]
    Conflict,
    #[error("{0}")]
    InvalidState(String),
    #[error("internal: {0}")]
    Internal(String),
}

pub type RepoResult<T> = Result<T, RepoError>;

use async_trait::async_trait;

#[async_trait]
pub trait TicketRepo: Send + Sync {
    async fn list_tickets(&self, filter: TicketFilter) -> RepoResult<Vec<Ticket>>;
    async fn get_ticket(&self, id: Id) -> RepoResult<Ticket>;
    /// Creates the ticket and its initial reply in one transaction.
    async fn create_ticket(&self, new: NewTicket, owner_id: Id) -> RepoResult<(Ticket, Reply)>;
    async fn update_ticket(&self, id: Id, patch: TicketPatch) -> RepoResult<Ticket>;
    /// Conditional status flip; fails with InvalidState unless the current
    /// status is one of `from`.
    async fn transition(&self, id: Id, from: &[TicketStatus], to: TicketStatus) -> RepoResult<Ticket>;
    async fn assign_technician(&self, id: Id, technician_id: Id) -> RepoResult<Ticket>;
}

#[async_trait]
pub trait ReplyRepo: Send + Sync {
    async fn list_replies(&self, ticket_id: Id) -> RepoResult<Vec<Reply>>;
    async fn get_reply(&self, id: Id) -> RepoResult<Reply>;
    /// Lowest reply id of a ticket, i.e. the original problem report.
    async fn first_reply_id(&self, ticket_id: Id) -> RepoResult<Id>;
    /// Persists the reply and its attachment rows in one transaction.
    async fn create_reply(
        &self,
        new: NewReply,
        attachments: Vec<NewAttachment>,
    ) -> RepoResult<(Reply, Vec<Attachment>)>;
    async fn update_reply(&self, id: Id, content: String) -> RepoResult<Reply>;
    /// Removes the reply and its attachment rows; returns the removed
    /// attachments so the caller can delete the blobs.
    async fn delete_reply(&self, id: Id) -> RepoResult<Vec<Attachment>>;
    async fn list_attachments(&self, reply_id: Id) -> RepoResult<Vec<Attachment>>;
}

#[async_trait]
pub trait EscalationRepo: Send + Sync {
    /// Records the escalation request and its tracking note in one
    /// transaction. The ticket's assignment is untouched.
    async fn create_escalation(&self, new: NewEscalation, tracking_note: &str) -> RepoResult<Escalation>;
    /// Marks the escalation approved, reassigns the ticket's technician to the
    /// destination and appends a tracking note — one transaction.
    async fn approve_escalation(
        &self,
        id: Id,
        approved_at: chrono::DateTime<chrono::Utc>,
        tracking_note: &str,
    ) -> RepoResult<Escalation>;
    async fn get_escalation(&self, id: Id) -> RepoResult<Escalation>;
    async fn list_escalations(&self, ticket_id: Id) -> RepoResult<Vec<Escalation>>;
    async fn list_tracking(&self, ticket_id: Id) -> RepoResult<Vec<TrackingNote>>;
}

pub trait Repo: TicketRepo + ReplyRepo + EscalationRepo {}

impl<T> Repo for T where T: TicketRepo + ReplyRepo + EscalationRepo {}

#[cfg(feature = "inmem-store")]
pub mod inmem {
    use super::*;
    use chrono::{DateTime, Utc};
    use serde::{Deserialize, Serialize};
    use std::collections::HashMap;
    use std::path::{Path, PathBuf};
    use std::sync::{Arc, RwLock};

    const SNAPSHOT_PATH: &str = "data/state.json";

    #[derive(Default, Serialize, Deserialize)]
    struct State {
        tickets: HashMap<Id, Ticket>,
        replies: HashMap<Id, Reply>,
        attachments: HashMap<Id, Attachment>,
        escalations: HashMap<Id, Escalation>,
        tracking: HashMap<Id, TrackingNote>,
        next_id: Id,
    }

    #[derive(Clone)]
    pub struct InMemRepo {
        state: Arc<RwLock<State>>,
        snapshot_path: Arc<PathBuf>,
    }

    impl InMemRepo {
        fn data_dir() -> PathBuf {
            std::env::var("RHD_DATA_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("data"))
        }

        fn snapshot_path() -> PathBuf {
            if std::env::var("RHD_DATA_DIR").is_ok() {
                let mut p = Self::data_dir();
                p.push("state.json");
                p
            } else {
                PathBuf::from(SNAPSHOT_PATH)
            }
        }

        fn load_state_from(path: &Path) -> State {
            match std::fs::read(path) {
                Ok(bytes) => match serde_json::from_slice::<State>(&bytes) {
                    Ok(s) => {
                        log::info!("loaded snapshot '{}'", path.display());
                        s
                    }
                    Err(e) => {
                        log::warn!("failed to parse snapshot '{}': {e}. Starting empty.", path.display());
                        State::default()
                    }
                },
                Err(_) => State::default(),
            }
        }

        fn persist(&self) {
            let path = self.snapshot_path.clone();
            if let Ok(s) = serde_json::to_vec_pretty(&*self.state.read().unwrap()) {
                if let Some(dir) = path.parent() {
                    let _ = std::fs::create_dir_all(dir);
                }
                if let Err(e) = std::fs::write(&*path, s) {
                    log::warn!("failed to write snapshot '{}': {e}", path.display());
                }
            }
        }

        pub fn new() -> Self {
            let snapshot_path = Self::snapshot_path();
            let state = Self::load_state_from(&snapshot_path);
            Self {
                state: Arc::new(RwLock::new(state)),
                snapshot_path: Arc::new(snapshot_path),
            }
        }

        fn next_id(state: &mut State) -> Id {
            state.next_id += 1;
            state.next_id
        }

        /// Test support: rewrite a reply's creation timestamp so the edit
        /// window can be exercised without sleeping.
        pub fn set_reply_created_at(&self, id: Id, created_at: DateTime<Utc>) {
            let mut s = self.state.write().unwrap();
            if let Some(r) = s.replies.get_mut(&id) {
                r.created_at = created_at;
            }
        }
    }

    impl Default for InMemRepo {
        fn default() -> Self {
            Self::new()
        }
    }

    #[async_trait]
    impl TicketRepo for InMemRepo {
        async fn list_tickets(&self, filter: TicketFilter) -> RepoResult<Vec<Ticket>> {
            let s = self.state.read().unwrap();
            let mut v: Vec<_> = s
                .tickets
                .values()
                .filter(|t| filter.owner_id.map_or(true, |o| t.user_id == o))
                .filter(|t| filter.status.map_or(true, |st| t.status == st))
                .cloned()
                .collect();
            v.sort_by(|a, b| b.id.cmp(&a.id)); // newest first
            Ok(v)
        }

        async fn get_ticket(&self, id: Id) -> RepoResult<Ticket> {
            let s = self.state.read().unwrap();
            s.tickets.get(&id).cloned().ok_or(RepoError::NotFound)
        }

        async fn create_ticket(&self, new: NewTicket, owner_id: Id) -> RepoResult<(Ticket, Reply)> {
            let mut s = self.state.write().unwrap();
            let now = Utc::now();
            let id = Self::next_id(&mut s);
            let ticket = Ticket {
                id,
                user_id: owner_id,
                technician_id: None,
                title: new.title,
                kind: new.kind,
                priority: new.priority,
                status: TicketStatus::Open,
                created_at: now,
                updated_at: now,
            };
            s.tickets.insert(id, ticket.clone());
            let reply_id = Self::next_id(&mut s);
            let reply = Reply {
                id: reply_id,
                ticket_id: id,
                author_id: owner_id,
                content: new.content,
                from_support: false,
                created_at: now,
                updated_at: now,
            };
            s.replies.insert(reply_id, reply.clone());
            drop(s);
            self.persist();
            Ok((ticket, reply))
        }

        async fn update_ticket(&self, id: Id, patch: TicketPatch) -> RepoResult<Ticket> {
            let mut s = self.state.write().unwrap();
            let ticket = s.tickets.get_mut(&id).ok_or(RepoError::NotFound)?;
            if let Some(status) = patch.status {
                if !ticket.status.can_transition(status) {
                    return Err(RepoError::InvalidState(format!(
                        "cannot move ticket from {} to {}",
                        ticket.status, status
                    )));
                }
                ticket.status = status;
            }
            if let Some(title) = patch.title {
                ticket.title = title;
            }
            if let Some(kind) = patch.kind {
                ticket.kind = kind;
            }
            if let Some(priority) = patch.priority {
                ticket.priority = priority;
            }
            ticket.updated_at = Utc::now();
            let updated = ticket.clone();
            drop(s);
            self.persist();
            Ok(updated)
        }

        async fn transition(&self, id: Id, from: &[TicketStatus], to: TicketStatus) -> RepoResult<Ticket> {
            let mut s = self.state.write().unwrap();
            let ticket = s.tickets.get_mut(&id).ok_or(RepoError::NotFound)?;
            if !from.contains(&ticket.status) {
                return Err(RepoError::InvalidState(format!(
                    "cannot move ticket from {} to {}",
                    ticket.status, to
                )));
            }
            ticket.status = to;
            ticket.updated_at = Utc::now();
            let updated = ticket.clone();
            drop(s);
            self.persist();
            Ok(updated)
        }

        async fn assign_technician(&self, id: Id, technician_id: Id) -> RepoResult<Ticket> {
            let mut s = self.state.write().unwrap();
            let ticket = s.tickets.get_mut(&id).ok_or(RepoError::NotFound)?;
            ticket.technician_id = Some(technician_id);
            ticket.updated_at = Utc::now();
            let updated = ticket.clone();
            drop(s);
            self.persist();
            Ok(updated)
        }
    }

    #[async_trait]
    impl ReplyRepo for InMemRepo {
        async fn list_replies(&self, ticket_id: Id) -> RepoResult<Vec<Reply>> {
            let s = self.state.read().unwrap();
            if !s.tickets.contains_key(&ticket_id) {
                return Err(RepoError::NotFound);
            }
            let mut v: Vec<_> = s
                .replies
                .values()
                .filter(|r| r.ticket_id == ticket_id)
                .cloned()
                .collect();
            v.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
            Ok(v)
        }

        async fn get_reply(&self, id: Id) -> RepoResult<Reply> {
            let s = self.state.read().unwrap();
            s.replies.get(&id).cloned().ok_or(RepoError::NotFound)
        }

        async fn first_reply_id(&self, ticket_id: Id) -> RepoResult<Id> {
            let s = self.state.read().unwrap();
            s.replies
                .values()
                .filter(|r| r.ticket_id == ticket_id)
                .map(|r| r.id)
                .min()
                .ok_or(RepoError::NotFound)
        }

        async fn create_reply(
            &self,
            new: NewReply,
            attachments: Vec<NewAttachment>,
        ) -> RepoResult<(Reply, Vec<Attachment>)> {
            let mut s = self.state.write().unwrap();
            if !s.tickets.contains_key(&new.ticket_id) {
                return Err(RepoError::NotFound);
            }
            let now = Utc::now();
            let id = Self::next_id(&mut s);
            let reply = Reply {
                id,
                ticket_id: new.ticket_id,
                author_id: new.author_id,
                content: new.content,
                from_support: new.from_support,
                created_at: now,
                updated_at: now,
            };
            s.replies.insert(id, reply.clone());
            let mut stored = Vec::with_capacity(attachments.len());
            for att in attachments {
                let att_id = Self::next_id(&mut s);
                let row = Attachment {
                    id: att_id,
                    reply_id: id,
                    kind: att.kind,
                    mime: att.mime,
                    storage_key: att.storage_key,
                    file_name: att.file_name,
                    size_bytes: att.size_bytes,
                    checksum: att.checksum,
                    created_at: now,
                };
                s.attachments.insert(att_id, row.clone());
                stored.push(row);
            }
            drop(s);
            self.persist();
            Ok((reply, stored))
        }

        async fn update_reply(&self, id: Id, content: String) -> RepoResult<Reply> {
            let mut s = self.state.write().unwrap();
            let reply = s.replies.get_mut(&id).ok_or(RepoError::NotFound)?;
            reply.content = content;
            reply.updated_at = Utc::now();
            let updated = reply.clone();
            drop(s);
            self.persist();
            Ok(updated)
        }

        async fn delete_reply(&self, id: Id) -> RepoResult<Vec<Attachment>> {
            let mut s = self.state.write().unwrap();
            if s.replies.remove(&id).is_none() {
                return Err(RepoError::NotFound);
            }
            let removed_ids: Vec<Id> = s
                .attachments
                .values()
                .filter(|a| a.reply_id == id)
                .map(|a| a.id)
                .collect();
            let mut removed = Vec::with_capacity(removed_ids.len());
            for att_id in removed_ids {
                if let Some(a) = s.attachments.remove(&att_id) {
                    removed.push(a);
                }
            }
            drop(s);
            self.persist();
            Ok(removed)
        }

        async fn list_attachments(&self, reply_id: Id) -> RepoResult<Vec<Attachment>> {
            let s = self.state.read().unwrap();
            if !s.replies.contains_key(&reply_id) {
                return Err(RepoError::NotFound);
            }
            let mut v: Vec<_> = s
                .attachments
                .values()
                .filter(|a| a.reply_id == reply_id)
                .cloned()
                .collect();
            v.sort_by_key(|a| a.id);
            Ok(v)
        }
    }

    #[async_trait]
    impl EscalationRepo for InMemRepo {
        async fn create_escalation(&self, new: NewEscalation, tracking_note: &str) -> RepoResult<Escalation> {
            let mut s = self.state.write().unwrap();
            if !s.tickets.contains_key(&new.ticket_id) {
                return Err(RepoError::NotFound);
            }
            let now = Utc::now();
            let id = Self::next_id(&mut s);
            let escalation = Escalation {
                id,
                ticket_id: new.ticket_id,
                origin_id: new.origin_id,
                dest_id: new.dest_id,
                reason: new.reason,
                observations: new.observations,
                approved: false,
                requested_at: now,
                approved_at: None,
            };
            s.escalations.insert(id, escalation.clone());
            let note_id = Self::next_id(&mut s);
            s.tracking.insert(
                note_id,
                TrackingNote {
                    id: note_id,
                    ticket_id: escalation.ticket_id,
                    note: tracking_note.to_string(),
                    created_at: now,
                },
            );
            drop(s);
            self.persist();
            Ok(escalation)
        }

        async fn approve_escalation(
            &self,
            id: Id,
            approved_at: DateTime<Utc>,
            tracking_note: &str,
        ) -> RepoResult<Escalation> {
            let mut s = self.state.write().unwrap();
            let escalation = s.escalations.get_mut(&id).ok_or(RepoError::NotFound)?;
            if escalation.approved {
                return Err(RepoError::InvalidState("escalation has already been approved".into()));
            }
            escalation.approved = true;
            escalation.approved_at = Some(approved_at);
            let approved = escalation.clone();
            let ticket = s.tickets.get_mut(&approved.ticket_id).ok_or(RepoError::NotFound)?;
            ticket.technician_id = Some(approved.dest_id);
            ticket.updated_at = approved_at;
            let note_id = Self::next_id(&mut s);
            s.tracking.insert(
                note_id,
                TrackingNote {
                    id: note_id,
                    ticket_id: approved.ticket_id,
                    note: tracking_note.to_string(),
                    created_at: approved_at,
                },
            );
            drop(s);
            self.persist();
            Ok(approved)
        }

        async fn get_escalation(&self, id: Id) -> RepoResult<Escalation> {
            let s = self.state.read().unwrap();
            s.escalations.get(&id).cloned().ok_or(RepoError::NotFound)
        }

        async fn list_escalations(&self, ticket_id: Id) -> RepoResult<Vec<Escalation>> {
            let s = self.state.read().unwrap();
            if !s.tickets.contains_key(&ticket_id) {
                return Err(RepoError::NotFound);
            }
            let mut v: Vec<_> = s
                .escalations
                .values()
                .filter(|e| e.ticket_id == ticket_id)
                .cloned()
                .collect();
            v.sort_by_key(|e| e.id);
            Ok(v)
        }

        async fn list_tracking(&self, ticket_id: Id) -> RepoResult<Vec<TrackingNote>> {
            let s = self.state.read().unwrap();
            if !s.tickets.contains_key(&ticket_id) {
                return Err(RepoError::NotFound);
            }
            let mut v: Vec<_> = s
                .tracking
                .values()
                .filter(|n| n.ticket_id == ticket_id)
                .cloned()
                .collect();
            v.sort_by_key(|n| n.id);
            Ok(v)
        }
    }
}

// Postgres implementation (feature = "postgres-store")
#[cfg(feature = "postgres-store")]
pub mod pg {
    use super::*;
    use chrono::{DateTime, Utc};
    use sqlx::{Pool, Postgres};

    const TICKET_COLS: &str = "id, user_id, technician_id, title, kind, priority, status, created_at, updated_at";
    const REPLY_COLS: &str = "id, ticket_id, author_id, content, from_support, created_at, updated_at";
    const ATTACHMENT_COLS: &str =
        "id, reply_id, kind, mime, storage_key, file_name, size_bytes, checksum, created_at";
    const ESCALATION_COLS: &str =
        "id, ticket_id, origin_id, dest_id, reason, observations, approved, requested_at, approved_at";

    fn db(e: sqlx::Error) -> RepoError {
        match e {
            sqlx::Error::RowNotFound => RepoError::NotFound,
            other => RepoError::Internal(other.to_string()),
        }
    }

    #[derive(Clone)]
    pub struct PgRepo {
        pool: Pool<Postgres>,
    }

    impl PgRepo {
        pub fn new(pool: Pool<Postgres>) -> Self {
            Self { pool }
        }
    }

    #[async_trait]
    impl TicketRepo for PgRepo {
        async fn list_tickets(&self, filter: TicketFilter) -> RepoResult<Vec<Ticket>> {
            let sql = format!(
                "SELECT {TICKET_COLS} FROM tickets \
                 WHERE ($1::bigint IS NULL OR user_id = $1) \
                   AND ($2::ticket_status IS NULL OR status = $2) \
                 ORDER BY id DESC"
            );
            sqlx::query_as::<_, Ticket>(&sql)
                .bind(filter.owner_id)
                .bind(filter.status)
                .fetch_all(&self.pool)
                .await
                .map_err(db)
        }

        async fn get_ticket(&self, id: Id) -> RepoResult<Ticket> {
            let sql = format!("SELECT {TICKET_COLS} FROM tickets WHERE id = $1");
            sqlx::query_as::<_, Ticket>(&sql)
                .bind(id)
                .fetch_one(&self.pool)
                .await
                .map_err(db)
        }

        async fn create_ticket(&self, new: NewTicket, owner_id: Id) -> RepoResult<(Ticket, Reply)> {
            let mut tx = self.pool.begin().await.map_err(db)?;
            let sql = format!(
                "INSERT INTO tickets (user_id, title, kind, priority, status) \
                 VALUES ($1, $2, $3, $4, 'open') RETURNING {TICKET_COLS}"
            );
            let ticket = sqlx::query_as::<_, Ticket>(&sql)
                .bind(owner_id)
                .bind(&new.title)
                .bind(new.kind)
                .bind(new.priority)
                .fetch_one(&mut *tx)
                .await
                .map_err(db)?;
            let sql = format!(
                "INSERT INTO replies (ticket_id, author_id, content, from_support) \
                 VALUES ($1, $2, $3, false) RETURNING {REPLY_COLS}"
            );
            let reply = sqlx::query_as::<_, Reply>(&sql)
                .bind(ticket.id)
                .bind(owner_id)
                .bind(&new.content)
                .fetch_one(&mut *tx)
                .await
                .map_err(db)?;
            tx.commit().await.map_err(db)?;
            Ok((ticket, reply))
        }

        async fn update_ticket(&self, id: Id, patch: TicketPatch) -> RepoResult<Ticket> {
            let mut tx = self.pool.begin().await.map_err(db)?;
            let sql = format!("SELECT {TICKET_COLS} FROM tickets WHERE id = $1 FOR UPDATE");
            let current = sqlx::query_as::<_, Ticket>(&sql)
                .bind(id)
                .fetch_one(&mut *tx)
                .await
                .map_err(db)?;
            if let Some(status) = patch.status {
                if !current.status.can_transition(status) {
                    return Err(RepoError::InvalidState(format!(
                        "cannot move ticket from {} to {}",
                        current.status, status
                    )));
                }
            }
            let sql = format!(
                "UPDATE tickets SET \
                   title = COALESCE($2, title), \
                   kind = COALESCE($3, kind), \
                   priority = COALESCE($4, priority), \
                   status = COALESCE($5, status), \
                   updated_at = now() \
                 WHERE id = $1 RETURNING {TICKET_COLS}"
            );
            let updated = sqlx::query_as::<_, Ticket>(&sql)
                .bind(id)
                .bind(patch.title)
                .bind(patch.kind)
                .bind(patch.priority)
                .bind(patch.status)
                .fetch_one(&mut *tx)
                .await
                .map_err(db)?;
            tx.commit().await.map_err(db)?;
            Ok(updated)
        }

        async fn transition(&self, id: Id, from: &[TicketStatus], to: TicketStatus) -> RepoResult<Ticket> {
            let mut tx = self.pool.begin().await.map_err(db)?;
            let sql = format!("SELECT {TICKET_COLS} FROM tickets WHERE id = $1 FOR UPDATE");
            let current = sqlx::query_as::<_, Ticket>(&sql)
                .bind(id)
                .fetch_one(&mut *tx)
                .await
                .map_err(db)?;
            if !from.contains(&current.status) {
                return Err(RepoError::InvalidState(format!(
                    "cannot move ticket from {} to {}",
                    current.status, to
                )));
            }
            let sql = format!(
                "UPDATE tickets SET status = $2, updated_at = now() WHERE id = $1 RETURNING {TICKET_COLS}"
            );
            let updated = sqlx::query_as::<_, Ticket>(&sql)
                .bind(id)
                .bind(to)
                .fetch_one(&mut *tx)
                .await
                .map_err(db)?;
            tx.commit().await.map_err(db)?;
            Ok(updated)
        }

        async fn assign_technician(&self, id: Id, technician_id: Id) -> RepoResult<Ticket> {
            let sql = format!(
                "UPDATE tickets SET technician_id = $2, updated_at = now() WHERE id = $1 RETURNING {TICKET_COLS}"
            );
            sqlx::query_as::<_, Ticket>(&sql)
                .bind(id)
                .bind(technician_id)
                .fetch_one(&self.pool)
                .await
                .map_err(db)
        }
    }

    #[async_trait]
    impl ReplyRepo for PgRepo {
        async fn list_replies(&self, ticket_id: Id) -> RepoResult<Vec<Reply>> {
            let sql = format!(
                "SELECT {REPLY_COLS} FROM replies WHERE ticket_id = $1 ORDER BY created_at ASC, id ASC"
            );
            sqlx::query_as::<_, Reply>(&sql)
                .bind(ticket_id)
                .fetch_all(&self.pool)
                .await
                .map_err(db)
        }

        async fn get_reply(&self, id: Id) -> RepoResult<Reply> {
            let sql = format!("SELECT {REPLY_COLS} FROM replies WHERE id = $1");
            sqlx::query_as::<_, Reply>(&sql)
                .bind(id)
                .fetch_one(&self.pool)
                .await
                .map_err(db)
        }

        async fn first_reply_id(&self, ticket_id: Id) -> RepoResult<Id> {
            let first: Option<Id> = sqlx::query_scalar("SELECT min(id) FROM replies WHERE ticket_id = $1")
                .bind(ticket_id)
                .fetch_one(&self.pool)
                .await
                .map_err(db)?;
            first.ok_or(RepoError::NotFound)
        }

        async fn create_reply(
            &self,
            new: NewReply,
            attachments: Vec<NewAttachment>,
        ) -> RepoResult<(Reply, Vec<Attachment>)> {
            let mut tx = self.pool.begin().await.map_err(db)?;
            let sql = format!(
                "INSERT INTO replies (ticket_id, author_id, content, from_support) \
                 VALUES ($1, $2, $3, $4) RETURNING {REPLY_COLS}"
            );
            let reply = sqlx::query_as::<_, Reply>(&sql)
                .bind(new.ticket_id)
                .bind(new.author_id)
                .bind(&new.content)
                .bind(new.from_support)
                .fetch_one(&mut *tx)
                .await
                .map_err(db)?;
            let mut stored = Vec::with_capacity(attachments.len());
            let sql = format!(
                "INSERT INTO attachments (reply_id, kind, mime, storage_key, file_name, size_bytes, checksum) \
                 VALUES ($1, $2, $3, $4, $5, $6, $7) RETURNING {ATTACHMENT_COLS}"
            );
            for att in attachments {
                let row = sqlx::query_as::<_, Attachment>(&sql)
                    .bind(reply.id)
                    .bind(att.kind)
                    .bind(&att.mime)
                    .bind(&att.storage_key)
                    .bind(&att.file_name)
                    .bind(att.size_bytes)
                    .bind(&att.checksum)
                    .fetch_one(&mut *tx)
                    .await
                    .map_err(db)?;
                stored.push(row);
            }
            tx.commit().await.map_err(db)?;
            Ok((reply, stored))
        }

        async fn update_reply(&self, id: Id, content: String) -> RepoResult<Reply> {
            let sql = format!(
                "UPDATE replies SET content = $2, updated_at = now() WHERE id = $1 RETURNING {REPLY_COLS}"
            );
            sqlx::query_as::<_, Reply>(&sql)
                .bind(id)
                .bind(content)
                .fetch_one(&self.pool)
                .await
                .map_err(db)
        }

        async fn delete_reply(&self, id: Id) -> RepoResult<Vec<Attachment>> {
            let mut tx = self.pool.begin().await.map_err(db)?;
            let sql = format!("SELECT {ATTACHMENT_COLS} FROM attachments WHERE reply_id = $1");
            let attachments = sqlx::query_as::<_, Attachment>(&sql)
                .bind(id)
                .fetch_all(&mut *tx)
                .await
                .map_err(db)?;
            // attachment rows go with the reply via ON DELETE CASCADE
            let deleted = sqlx::query("DELETE FROM replies WHERE id = $1")
                .bind(id)
                .execute(&mut *tx)
                .await
                .map_err(db)?;
            if deleted.rows_affected() == 0 {
                return Err(RepoError::NotFound);
            }
            tx.commit().await.map_err(db)?;
            Ok(attachments)
        }

        async fn list_attachments(&self, reply_id: Id) -> RepoResult<Vec<Attachment>> {
            let sql = format!("SELECT {ATTACHMENT_COLS} FROM attachments WHERE reply_id = $1 ORDER BY id ASC");
            sqlx::query_as::<_, Attachment>(&sql)
                .bind(reply_id)
                .fetch_all(&self.pool)
                .await
                .map_err(db)
        }
    }

    #[async_trait]
    impl EscalationRepo for PgRepo {
        async fn create_escalation(&self, new: NewEscalation, tracking_note: &str) -> RepoResult<Escalation> {
            let mut tx = self.pool.begin().await.map_err(db)?;
            let sql = format!(
                "INSERT INTO escalations (ticket_id, origin_id, dest_id, reason, observations) \
                 VALUES ($1, $2, $3, $4, $5) RETURNING {ESCALATION_COLS}"
            );
            let escalation = sqlx::query_as::<_, Escalation>(&sql)
                .bind(new.ticket_id)
                .bind(new.origin_id)
                .bind(new.dest_id)
                .bind(&new.reason)
                .bind(&new.observations)
                .fetch_one(&mut *tx)
                .await
                .map_err(db)?;
            sqlx::query("INSERT INTO tracking_notes (ticket_id, note) VALUES ($1, $2)")
                .bind(escalation.ticket_id)
                .bind(tracking_note)
                .execute(&mut *tx)
                .await
                .map_err(db)?;
            tx.commit().await.map_err(db)?;
            Ok(escalation)
        }

        async fn approve_escalation(
            &self,
            id: Id,
            approved_at: DateTime<Utc>,
            tracking_note: &str,
        ) -> RepoResult<Escalation> {
            let mut tx = self.pool.begin().await.map_err(db)?;
            let sql = format!("SELECT {ESCALATION_COLS} FROM escalations WHERE id = $1 FOR UPDATE");
            let current = sqlx::query_as::<_, Escalation>(&sql)
                .bind(id)
                .fetch_one(&mut *tx)
                .await
                .map_err(db)?;
            if current.approved {
                return Err(RepoError::InvalidState("escalation has already been approved".into()));
            }
            let sql = format!(
                "UPDATE escalations SET approved = true, approved_at = $2 WHERE id = $1 RETURNING {ESCALATION_COLS}"
            );
            let approved = sqlx::query_as::<_, Escalation>(&sql)
                .bind(id)
                .bind(approved_at)
                .fetch_one(&mut *tx)
                .await
                .map_err(db)?;
            let reassigned = sqlx::query("UPDATE tickets SET technician_id = $2, updated_at = $3 WHERE id = $1")
                .bind(approved.ticket_id)
                .bind(approved.dest_id)
                .bind(approved_at)
                .execute(&mut *tx)
                .await
                .map_err(db)?;
            if reassigned.rows_affected() == 0 {
                return Err(RepoError::NotFound);
            }
            sqlx::query("INSERT INTO tracking_notes (ticket_id, note) VALUES ($1, $2)")
                .bind(approved.ticket_id)
                .bind(tracking_note)
                .execute(&mut *tx)
                .await
                .map_err(db)?;
            tx.commit().await.map_err(db)?;
            Ok(approved)
        }

        async fn get_escalation(&self, id: Id) -> RepoResult<Escalation> {
            let sql = format!("SELECT {ESCALATION_COLS} FROM escalations WHERE id = $1");
            sqlx::query_as::<_, Escalation>(&sql)
                .bind(id)
                .fetch_one(&self.pool)
                .await
                .map_err(db)
        }

        async fn list_escalations(&self, ticket_id: Id) -> RepoResult<Vec<Escalation>> {
            let sql = format!("SELECT {ESCALATION_COLS} FROM escalations WHERE ticket_id = $1 ORDER BY id ASC");
            sqlx::query_as::<_, Escalation>(&sql)
                .bind(ticket_id)
                .fetch_all(&self.pool)
                .await
                .map_err(db)
        }

        async fn list_tracking(&self, ticket_id: Id) -> RepoResult<Vec<TrackingNote>> {
            let sql = "SELECT id, ticket_id, note, created_at FROM tracking_notes WHERE ticket_id = $1 ORDER BY id ASC";
            sqlx::query_as::<_, TrackingNote>(sql)
                .bind(ticket_id)
                .fetch_all(&self.pool)
                .await
                .map_err(db)
        }
    }
}
