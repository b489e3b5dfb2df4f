use std::sync::Arc;

use chrono::{Duration, Utc};
use sha2::{Digest, Sha256};

use crate::auth::Claims;
use crate::error::ApiError;
use crate::models::*;
use crate::notify::Notifier;
use crate::repo::Repo;
use crate::storage::AttachmentStore;

/// Non-privileged authors may edit their replies this long after posting.
pub const REPLY_EDIT_WINDOW_HOURS: i64 = 24;

/// Ticket lifecycle: create with the initial reply, field updates under the
/// owner/support privilege split, close and reopen.
#[derive(Clone)]
pub struct TicketService {
    repo: Arc<dyn Repo>,
}

impl TicketService {
    pub fn new(repo: Arc<dyn Repo>) -> Self {
        Self { repo }
    }

    pub async fn create(&self, owner_id: Id, new: NewTicket) -> Result<(Ticket, Reply), ApiError> {
        let created = self.repo.create_ticket(new, owner_id).await?;
        metrics::increment_counter!("rhd_tickets_created_total");
        Ok(created)
    }

    pub async fn list(&self, caller: &Claims, status: Option<TicketStatus>) -> Result<Vec<Ticket>, ApiError> {
        let owner_id = if caller.is_support() { None } else { Some(caller.uid) };
        Ok(self.repo.list_tickets(TicketFilter { owner_id, status }).await?)
    }

    pub async fn get(&self, id: Id, caller: &Claims) -> Result<Ticket, ApiError> {
        let ticket = self.repo.get_ticket(id).await?;
        if !caller.is_support() && ticket.user_id != caller.uid {
            // don't leak other users' ticket ids
            return Err(ApiError::NotFound);
        }
        Ok(ticket)
    }

    pub async fn update(&self, id: Id, patch: TicketPatch, caller: &Claims) -> Result<Ticket, ApiError> {
        let ticket = self.get(id, caller).await?;
        // owners may retitle their ticket, nothing more
        if !caller.is_support() && patch.touches_privileged_fields() {
            return Err(ApiError::Forbidden);
        }
        if ticket.status == TicketStatus::Closed {
            let only_reopen = patch.title.is_none()
                && patch.kind.is_none()
                && patch.priority.is_none()
                && patch.status == Some(TicketStatus::Open);
            if !only_reopen {
                return Err(ApiError::Unprocessable("a closed ticket can only be reopened".into()));
            }
        }
        if let Some(status) = patch.status {
            if !ticket.status.can_transition(status) {
                return Err(ApiError::Unprocessable(format!(
                    "invalid status transition {} -> {}",
                    ticket.status, status
                )));
            }
        }
        Ok(self.repo.update_ticket(id, patch).await?)
    }

    pub async fn close(&self, id: Id) -> Result<Ticket, ApiError> {
        let ticket = self.repo.get_ticket(id).await?;
        if ticket.status == TicketStatus::Closed {
            return Err(ApiError::Unprocessable("ticket is already closed".into()));
        }
        let closed = self
            .repo
            .transition(id, &[TicketStatus::Open, TicketStatus::Pending], TicketStatus::Closed)
            .await?;
        metrics::increment_counter!("rhd_tickets_closed_total");
        Ok(closed)
    }

    pub async fn reopen(&self, id: Id) -> Result<Ticket, ApiError> {
        let ticket = self.repo.get_ticket(id).await?;
        if ticket.status != TicketStatus::Closed {
            return Err(ApiError::Unprocessable("only a closed ticket can be reopened".into()));
        }
        let reopened = self.repo.transition(id, &[TicketStatus::Closed], TicketStatus::Open).await?;
        metrics::increment_counter!("rhd_tickets_reopened_total");
        Ok(reopened)
    }
}

/// A file received over multipart, already size/extension checked at the
/// boundary.
#[derive(Debug, Clone)]
pub struct StagedFile {
    pub file_name: String,
    pub bytes: Vec<u8>,
}

/// Reply threading: posting with attachments and owner notification, edits
/// under the 24-hour window, deletion with the first-reply guard.
#[derive(Clone)]
pub struct ReplyService {
    repo: Arc<dyn Repo>,
    store: Arc<dyn AttachmentStore>,
    notifier: Arc<dyn Notifier>,
}

impl ReplyService {
    pub fn new(repo: Arc<dyn Repo>, store: Arc<dyn AttachmentStore>, notifier: Arc<dyn Notifier>) -> Self {
        Self { repo, store, notifier }
    }

    pub async fn list(&self, ticket_id: Id, caller: &Claims) -> Result<Vec<Reply>, ApiError> {
        self.access_ticket(ticket_id, caller).await?;
        Ok(self.repo.list_replies(ticket_id).await?)
    }

    pub async fn list_attachments(&self, reply_id: Id, caller: &Claims) -> Result<Vec<Attachment>, ApiError> {
        let reply = self.repo.get_reply(reply_id).await?;
        self.access_ticket(reply.ticket_id, caller).await?;
        Ok(self.repo.list_attachments(reply_id).await?)
    }

    pub async fn create(
        &self,
        ticket_id: Id,
        caller: &Claims,
        content: String,
        files: Vec<StagedFile>,
    ) -> Result<(Reply, Vec<Attachment>), ApiError> {
        let ticket = self.access_ticket(ticket_id, caller).await?;
        if ticket.status == TicketStatus::Closed {
            return Err(ApiError::Unprocessable("cannot reply to a closed ticket".into()));
        }
        let from_support = caller.is_support();

        let mut attachments = Vec::with_capacity(files.len());
        for file in files {
            let ext = file_extension(&file.file_name);
            if !extension_allowed(&ext) {
                return Err(ApiError::UnsupportedMedia);
            }
            let mime = infer::get(&file.bytes)
                .map(|t| t.mime_type().to_string())
                .unwrap_or_else(|| "application/octet-stream".into());
            let checksum = format!("{:x}", Sha256::digest(&file.bytes));
            let storage_key = uuid::Uuid::new_v4().simple().to_string();
            self.store
                .save(&storage_key, &mime, &file.bytes)
                .await
                .map_err(|e| {
                    log::error!("attachment store save failed: {e}");
                    ApiError::Internal
                })?;
            attachments.push(NewAttachment {
                kind: classify_extension(&ext),
                mime,
                storage_key,
                file_name: file.file_name,
                size_bytes: file.bytes.len() as i64,
                checksum,
            });
        }

        let (reply, stored) = self
            .repo
            .create_reply(
                NewReply {
                    ticket_id,
                    author_id: caller.uid,
                    content,
                    from_support,
                },
                attachments,
            )
            .await?;

        // Status flips around the owner/support conversation: a support answer
        // releases a pending ticket; an owner message puts an open ticket back
        // into pending until support answers.
        if from_support && ticket.status == TicketStatus::Pending {
            self.repo
                .transition(ticket_id, &[TicketStatus::Pending], TicketStatus::Open)
                .await?;
        } else if !from_support && caller.uid == ticket.user_id && ticket.status == TicketStatus::Open {
            self.repo
                .transition(ticket_id, &[TicketStatus::Open], TicketStatus::Pending)
                .await?;
        }

        if caller.uid != ticket.user_id {
            self.notifier.reply_posted(&ticket, &reply).await;
        }
        metrics::increment_counter!("rhd_replies_created_total");
        Ok((reply, stored))
    }

    pub async fn update(&self, reply_id: Id, caller: &Claims, content: String) -> Result<Reply, ApiError> {
        let reply = self.repo.get_reply(reply_id).await?;
        let ticket = self.access_ticket(reply.ticket_id, caller).await?;
        if ticket.status == TicketStatus::Closed {
            return Err(ApiError::Unprocessable("cannot edit replies on a closed ticket".into()));
        }
        let privileged = caller.is_support();
        if reply.author_id != caller.uid && !privileged {
            return Err(ApiError::Forbidden);
        }
        if !privileged {
            let age = Utc::now() - reply.created_at;
            if age > Duration::hours(REPLY_EDIT_WINDOW_HOURS) {
                return Err(ApiError::Unprocessable(format!(
                    "the {REPLY_EDIT_WINDOW_HOURS}-hour edit window has elapsed"
                )));
            }
        }
        Ok(self.repo.update_reply(reply_id, content).await?)
    }

    pub async fn delete(&self, reply_id: Id, caller: &Claims) -> Result<(), ApiError> {
        let reply = self.repo.get_reply(reply_id).await?;
        let ticket = self.access_ticket(reply.ticket_id, caller).await?;
        if ticket.status == TicketStatus::Closed {
            return Err(ApiError::Unprocessable("cannot delete replies on a closed ticket".into()));
        }
        if reply.author_id != caller.uid && !caller.is_support() {
            return Err(ApiError::Forbidden);
        }
        // The original problem report must survive for the life of the ticket.
        let first = self.repo.first_reply_id(reply.ticket_id).await?;
        if first == reply_id {
            return Err(ApiError::Unprocessable("the original problem report cannot be deleted".into()));
        }
        let removed = self.repo.delete_reply(reply_id).await?;
        for att in removed {
            if let Err(e) = self.store.delete(&att.storage_key).await {
                log::warn!("failed to delete attachment blob '{}': {e}", att.storage_key);
            }
        }
        Ok(())
    }

    async fn access_ticket(&self, ticket_id: Id, caller: &Claims) -> Result<Ticket, ApiError> {
        let ticket = self.repo.get_ticket(ticket_id).await?;
        if !caller.is_support() && ticket.user_id != caller.uid {
            return Err(ApiError::NotFound);
        }
        Ok(ticket)
    }
}

/// Technician escalation: request (no reassignment) and approval
/// (reassignment plus audit notes).
#[derive(Clone)]
pub struct EscalationService {
    repo: Arc<dyn Repo>,
}

impl EscalationService {
    pub fn new(repo: Arc<dyn Repo>) -> Self {
        Self { repo }
    }

    pub async fn escalate(
        &self,
        ticket_id: Id,
        origin_id: Id,
        dest_id: Id,
        reason: String,
        observations: Option<String>,
    ) -> Result<Escalation, ApiError> {
        if origin_id == dest_id {
            return Err(ApiError::Unprocessable(
                "destination technician must differ from the origin technician".into(),
            ));
        }
        let ticket = self.repo.get_ticket(ticket_id).await?;
        if ticket.status == TicketStatus::Closed {
            return Err(ApiError::Unprocessable("cannot escalate a closed ticket".into()));
        }
        let note = format!(
            "escalation requested: technician {origin_id} -> technician {dest_id} ({reason})"
        );
        let escalation = self
            .repo
            .create_escalation(
                NewEscalation {
                    ticket_id,
                    origin_id,
                    dest_id,
                    reason,
                    observations,
                },
                &note,
            )
            .await?;
        metrics::increment_counter!("rhd_escalations_requested_total");
        Ok(escalation)
    }

    pub async fn approve(&self, escalation_id: Id) -> Result<Escalation, ApiError> {
        let escalation = self.repo.get_escalation(escalation_id).await?;
        if escalation.approved {
            return Err(ApiError::Unprocessable("escalation has already been approved".into()));
        }
        let note = format!(
            "escalation approved: ticket assigned to technician {}",
            escalation.dest_id
        );
        let approved = self
            .repo
            .approve_escalation(escalation_id, Utc::now(), &note)
            .await?;
        metrics::increment_counter!("rhd_escalations_approved_total");
        Ok(approved)
    }

    pub async fn list(&self, ticket_id: Id) -> Result<Vec<Escalation>, ApiError> {
        Ok(self.repo.list_escalations(ticket_id).await?)
    }

    pub async fn tracking(&self, ticket_id: Id) -> Result<Vec<TrackingNote>, ApiError> {
        Ok(self.repo.list_tracking(ticket_id).await?)
    }
}
