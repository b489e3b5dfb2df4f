use std::sync::Arc;

use actix_multipart::Multipart;
use actix_web::middleware::DefaultHeaders;
use actix_web::{web, HttpResponse};
use futures_util::TryStreamExt as _;
use serde_json::{Map, Value};

use crate::auth::{create_jwt, Auth, Role};
use crate::error::ApiError;
use crate::models::*;
use crate::rate_limit::RateLimiterFacade;
use crate::require_role;
use crate::service::{EscalationService, ReplyService, StagedFile, TicketService};
use crate::storage::{AttachmentStore, StoreError};

pub fn config(cfg: &mut web::ServiceConfig) {
    cfg.service(
        web::scope("/api/v1")
            .service(
                web::resource("/tickets")
                    .route(web::get().to(list_tickets))
                    .route(web::post().to(create_ticket)),
            )
            .service(
                web::resource("/tickets/{id}")
                    .route(web::get().to(get_ticket))
                    .route(web::patch().to(update_ticket)),
            )
            .service(web::resource("/tickets/{id}/close").route(web::post().to(close_ticket)))
            .service(web::resource("/tickets/{id}/reopen").route(web::post().to(reopen_ticket)))
            .service(
                web::resource("/tickets/{id}/replies")
                    .route(web::get().to(list_replies))
                    .route(web::post().to(create_reply)),
            )
            .service(
                web::resource("/replies/{id}")
                    .route(web::patch().to(update_reply))
                    .route(web::delete().to(delete_reply)),
            )
            .service(web::resource("/replies/{id}/attachments").route(web::get().to(list_reply_attachments)))
            .service(
                web::resource("/tickets/{id}/escalations")
                    .route(web::get().to(list_escalations))
                    .route(web::post().to(escalate_ticket)),
            )
            .service(web::resource("/escalations/{id}/approve").route(web::post().to(approve_escalation)))
            .service(web::resource("/tickets/{id}/tracking").route(web::get().to(list_tracking)))
            .service(web::resource("/auth/me").route(web::get().to(auth_me)))
            .service(web::resource("/auth/refresh").route(web::post().to(refresh_token))),
    );
    // public fetch route (no /api/v1 prefix so <img src="/attachments/{key}"> works)
    cfg.route("/attachments/{key}", web::get().to(get_attachment));
}

/// Hardening headers applied to every response.
pub fn security_headers() -> DefaultHeaders {
    DefaultHeaders::new()
        .add(("X-Content-Type-Options", "nosniff"))
        .add(("X-Frame-Options", "DENY"))
        .add(("Referrer-Policy", "no-referrer"))
        .add((
            "Content-Security-Policy",
            "default-src 'none'; img-src 'self'; frame-ancestors 'none'; base-uri 'none'",
        ))
}

#[derive(Clone)]
pub struct AppState {
    pub tickets: TicketService,
    pub replies: ReplyService,
    pub escalations: EscalationService,
    pub store: Arc<dyn AttachmentStore>,
    pub limiter: RateLimiterFacade,
}

// ---------------- request validation helpers -----------------------

#[derive(Default)]
struct FieldErrors(Map<String, Value>);

impl FieldErrors {
    fn add(&mut self, field: &str, message: &str) {
        self.0
            .entry(field.to_string())
            .or_insert_with(|| Value::Array(Vec::new()))
            .as_array_mut()
            .expect("field errors are arrays")
            .push(Value::String(message.to_string()));
    }

    fn into_result(self) -> Result<(), ApiError> {
        if self.0.is_empty() {
            Ok(())
        } else {
            Err(ApiError::Validation(Value::Object(self.0)))
        }
    }
}

fn field_error(field: &str, message: &str) -> ApiError {
    let mut errors = FieldErrors::default();
    errors.add(field, message);
    errors
        .into_result()
        .expect_err("field error is always present")
}

const TITLE_MAX: usize = 200;
const CONTENT_MAX: usize = 10_000;
const REASON_MAX: usize = 500;

// ---------------- tickets -----------------------

#[derive(Debug, serde::Deserialize, utoipa::ToSchema)]
pub struct CreateTicketRequest {
    pub title: Option<String>,
    pub kind: Option<TicketKind>,
    pub priority: Option<TicketPriority>,
    /// Problem description; stored as the ticket's first reply.
    pub content: Option<String>,
}

#[derive(Debug, serde::Serialize, utoipa::ToSchema)]
pub struct TicketCreatedResponse {
    pub ticket: Ticket,
    pub reply: Reply,
}

#[derive(Debug, serde::Deserialize)]
pub struct TicketListQuery {
    pub status: Option<TicketStatus>,
}

#[utoipa::path(
    get,
    path = "/api/v1/tickets",
    params(("status" = Option<TicketStatus>, Query, description = "Filter by status")),
    responses(
        (status = 200, description = "List tickets (own tickets unless support)", body = [Ticket])
    )
)]
pub async fn list_tickets(
    auth: Auth,
    data: web::Data<AppState>,
    query: web::Query<TicketListQuery>,
) -> Result<HttpResponse, ApiError> {
    let tickets = data.tickets.list(&auth.0, query.status).await?;
    Ok(HttpResponse::Ok().json(tickets))
}

#[utoipa::path(
    post,
    path = "/api/v1/tickets",
    request_body = CreateTicketRequest,
    responses(
        (status = 201, description = "Ticket created with its initial reply", body = TicketCreatedResponse),
        (status = 422, description = "Validation failed"),
        (status = 429, description = "Too many tickets")
    )
)]
pub async fn create_ticket(
    auth: Auth,
    data: web::Data<AppState>,
    payload: web::Json<CreateTicketRequest>,
) -> Result<HttpResponse, ApiError> {
    if !data.limiter.allow_ticket(auth.0.uid) {
        return Err(ApiError::RateLimited);
    }
    let req = payload.into_inner();
    let mut errors = FieldErrors::default();
    let title = req.title.unwrap_or_default();
    if title.trim().is_empty() {
        errors.add("title", "title is required");
    } else if title.len() > TITLE_MAX {
        errors.add("title", "title must be at most 200 characters");
    }
    if req.priority.is_none() {
        errors.add("priority", "priority is required");
    }
    let content = req.content.unwrap_or_default();
    if content.trim().is_empty() {
        errors.add("content", "content is required");
    } else if content.len() > CONTENT_MAX {
        errors.add("content", "content must be at most 10000 characters");
    }
    errors.into_result()?;

    let new = NewTicket {
        title,
        kind: req.kind.unwrap_or(TicketKind::Other),
        priority: req.priority.expect("validated above"),
        content,
    };
    let (ticket, reply) = data.tickets.create(auth.0.uid, new).await?;
    Ok(HttpResponse::Created().json(TicketCreatedResponse { ticket, reply }))
}

#[utoipa::path(
    get,
    path = "/api/v1/tickets/{id}",
    params(("id" = Id, Path, description = "Ticket id")),
    responses(
        (status = 200, description = "Ticket", body = Ticket),
        (status = 404, description = "Ticket not found")
    )
)]
pub async fn get_ticket(auth: Auth, data: web::Data<AppState>, path: web::Path<Id>) -> Result<HttpResponse, ApiError> {
    let ticket = data.tickets.get(path.into_inner(), &auth.0).await?;
    Ok(HttpResponse::Ok().json(ticket))
}

#[utoipa::path(
    patch,
    path = "/api/v1/tickets/{id}",
    request_body = TicketPatch,
    params(("id" = Id, Path, description = "Ticket id")),
    responses(
        (status = 200, description = "Ticket updated", body = Ticket),
        (status = 403, description = "Owner tried to change support-only fields"),
        (status = 404, description = "Ticket not found"),
        (status = 422, description = "Illegal status transition or closed ticket")
    )
)]
pub async fn update_ticket(
    auth: Auth,
    data: web::Data<AppState>,
    path: web::Path<Id>,
    payload: web::Json<TicketPatch>,
) -> Result<HttpResponse, ApiError> {
    let patch = payload.into_inner();
    if patch.is_empty() {
        let mut errors = FieldErrors::default();
        errors.add("body", "at least one field must be provided");
        errors.into_result()?;
    }
    if let Some(title) = &patch.title {
        if title.trim().is_empty() || title.len() > TITLE_MAX {
            let mut errors = FieldErrors::default();
            errors.add("title", "title must be between 1 and 200 characters");
            errors.into_result()?;
        }
    }
    let ticket = data.tickets.update(path.into_inner(), patch, &auth.0).await?;
    Ok(HttpResponse::Ok().json(ticket))
}

#[utoipa::path(
    post,
    path = "/api/v1/tickets/{id}/close",
    params(("id" = Id, Path, description = "Ticket id")),
    responses(
        (status = 200, description = "Ticket closed", body = Ticket),
        (status = 404, description = "Ticket not found"),
        (status = 422, description = "Ticket is already closed")
    )
)]
pub async fn close_ticket(auth: Auth, data: web::Data<AppState>, path: web::Path<Id>) -> Result<HttpResponse, ApiError> {
    let id = path.into_inner();
    data.tickets.get(id, &auth.0).await?; // owner or support only
    let ticket = data.tickets.close(id).await?;
    Ok(HttpResponse::Ok().json(ticket))
}

#[utoipa::path(
    post,
    path = "/api/v1/tickets/{id}/reopen",
    params(("id" = Id, Path, description = "Ticket id")),
    responses(
        (status = 200, description = "Ticket reopened", body = Ticket),
        (status = 404, description = "Ticket not found"),
        (status = 422, description = "Ticket is not closed")
    )
)]
pub async fn reopen_ticket(auth: Auth, data: web::Data<AppState>, path: web::Path<Id>) -> Result<HttpResponse, ApiError> {
    let id = path.into_inner();
    data.tickets.get(id, &auth.0).await?;
    let ticket = data.tickets.reopen(id).await?;
    Ok(HttpResponse::Ok().json(ticket))
}

// ---------------- replies & attachments -----------------------

const ATTACHMENT_SIZE_LIMIT: usize = 10 * 1024 * 1024; // 10 MiB per file
const ATTACHMENTS_PER_REPLY: usize = 5;
const CONTENT_FIELD_LIMIT: usize = 64 * 1024;

#[derive(Debug, serde::Serialize, utoipa::ToSchema)]
pub struct ReplyCreatedResponse {
    pub reply: Reply,
    pub attachments: Vec<Attachment>,
}

#[utoipa::path(
    get,
    path = "/api/v1/tickets/{id}/replies",
    params(("id" = Id, Path, description = "Ticket id")),
    responses(
        (status = 200, description = "Replies in creation order", body = [Reply]),
        (status = 404, description = "Ticket not found")
    )
)]
pub async fn list_replies(auth: Auth, data: web::Data<AppState>, path: web::Path<Id>) -> Result<HttpResponse, ApiError> {
    let replies = data.replies.list(path.into_inner(), &auth.0).await?;
    Ok(HttpResponse::Ok().json(replies))
}

#[utoipa::path(
    post,
    path = "/api/v1/tickets/{id}/replies",
    params(("id" = Id, Path, description = "Ticket id")),
    responses(
        (status = 201, description = "Reply created", body = ReplyCreatedResponse),
        (status = 404, description = "Ticket not found"),
        (status = 413, description = "Attachment over 10 MiB"),
        (status = 415, description = "Extension not allowed"),
        (status = 422, description = "Closed ticket, missing content or too many attachments")
    )
)]
pub async fn create_reply(
    auth: Auth,
    data: web::Data<AppState>,
    path: web::Path<Id>,
    mut payload: Multipart,
) -> Result<HttpResponse, ApiError> {
    let ticket_id = path.into_inner();
    if !data.limiter.allow_reply(auth.0.uid) {
        return Err(ApiError::RateLimited);
    }

    let mut content: Option<String> = None;
    let mut files: Vec<StagedFile> = Vec::new();
    while let Some(field) = payload.try_next().await.map_err(|e| {
        log::error!("multipart error: {e}");
        ApiError::Internal
    })? {
        let name = field.content_disposition().get_name().unwrap_or("").to_string();
        match name.as_str() {
            "content" => {
                let mut buf: Vec<u8> = Vec::new();
                let mut field_stream = field;
                while let Some(chunk) = field_stream.try_next().await.map_err(|e| {
                    log::error!("stream read error: {e}");
                    ApiError::Internal
                })? {
                    if buf.len() + chunk.len() > CONTENT_FIELD_LIMIT {
                        return Err(ApiError::PayloadTooLarge);
                    }
                    buf.extend_from_slice(&chunk);
                }
                content = Some(String::from_utf8_lossy(&buf).into_owned());
            }
            "file" => {
                if files.len() == ATTACHMENTS_PER_REPLY {
                    return Err(field_error("file", "at most 5 attachments per reply"));
                }
                let file_name = field
                    .content_disposition()
                    .get_filename()
                    .unwrap_or("")
                    .to_string();
                if !extension_allowed(&file_extension(&file_name)) {
                    return Err(ApiError::UnsupportedMedia);
                }
                let mut bytes: Vec<u8> = Vec::new();
                let mut field_stream = field;
                while let Some(chunk) = field_stream.try_next().await.map_err(|e| {
                    log::error!("stream read error: {e}");
                    ApiError::Internal
                })? {
                    if bytes.len() + chunk.len() > ATTACHMENT_SIZE_LIMIT {
                        return Err(ApiError::PayloadTooLarge);
                    }
                    bytes.extend_from_slice(&chunk);
                }
                files.push(StagedFile { file_name, bytes });
            }
            _ => continue,
        }
    }

    let content = match content {
        Some(c) if !c.trim().is_empty() => c,
        _ => return Err(field_error("content", "content is required")),
    };

    let (reply, attachments) = data.replies.create(ticket_id, &auth.0, content, files).await?;
    Ok(HttpResponse::Created().json(ReplyCreatedResponse { reply, attachments }))
}

#[derive(Debug, serde::Deserialize, utoipa::ToSchema)]
pub struct UpdateReplyRequest {
    pub content: Option<String>,
}

#[utoipa::path(
    patch,
    path = "/api/v1/replies/{id}",
    request_body = UpdateReplyRequest,
    params(("id" = Id, Path, description = "Reply id")),
    responses(
        (status = 200, description = "Reply updated", body = Reply),
        (status = 403, description = "Not the author"),
        (status = 404, description = "Reply not found"),
        (status = 422, description = "Edit window elapsed or ticket closed")
    )
)]
pub async fn update_reply(
    auth: Auth,
    data: web::Data<AppState>,
    path: web::Path<Id>,
    payload: web::Json<UpdateReplyRequest>,
) -> Result<HttpResponse, ApiError> {
    let content = payload.into_inner().content.unwrap_or_default();
    if content.trim().is_empty() {
        let mut errors = FieldErrors::default();
        errors.add("content", "content is required");
        errors.into_result()?;
    }
    let reply = data.replies.update(path.into_inner(), &auth.0, content).await?;
    Ok(HttpResponse::Ok().json(reply))
}

#[utoipa::path(
    delete,
    path = "/api/v1/replies/{id}",
    params(("id" = Id, Path, description = "Reply id")),
    responses(
        (status = 204, description = "Reply and its attachments deleted"),
        (status = 403, description = "Not the author"),
        (status = 404, description = "Reply not found"),
        (status = 422, description = "First reply of the ticket")
    )
)]
pub async fn delete_reply(auth: Auth, data: web::Data<AppState>, path: web::Path<Id>) -> Result<HttpResponse, ApiError> {
    data.replies.delete(path.into_inner(), &auth.0).await?;
    Ok(HttpResponse::NoContent().finish())
}

#[utoipa::path(
    get,
    path = "/api/v1/replies/{id}/attachments",
    params(("id" = Id, Path, description = "Reply id")),
    responses(
        (status = 200, description = "Attachments of the reply", body = [Attachment]),
        (status = 404, description = "Reply not found")
    )
)]
pub async fn list_reply_attachments(
    auth: Auth,
    data: web::Data<AppState>,
    path: web::Path<Id>,
) -> Result<HttpResponse, ApiError> {
    let attachments = data.replies.list_attachments(path.into_inner(), &auth.0).await?;
    Ok(HttpResponse::Ok().json(attachments))
}

// serve a stored attachment blob by key
pub async fn get_attachment(data: web::Data<AppState>, path: web::Path<String>) -> Result<HttpResponse, ApiError> {
    let key = path.into_inner();
    if key.len() < 2 {
        return Err(ApiError::NotFound);
    }
    match data.store.load(&key).await {
        Ok((bytes, mime)) => Ok(HttpResponse::Ok().insert_header(("Content-Type", mime)).body(bytes)),
        Err(StoreError::NotFound) => Err(ApiError::NotFound),
        Err(e) => {
            log::error!("attachment store load error: {e}");
            Err(ApiError::Internal)
        }
    }
}

// ---------------- escalations -----------------------

#[derive(Debug, serde::Deserialize, utoipa::ToSchema)]
pub struct EscalateRequest {
    pub to_technician_id: Option<Id>,
    pub reason: Option<String>,
    pub observations: Option<String>,
}

#[utoipa::path(
    post,
    path = "/api/v1/tickets/{id}/escalations",
    request_body = EscalateRequest,
    params(("id" = Id, Path, description = "Ticket id")),
    responses(
        (status = 201, description = "Escalation requested (unapproved)", body = Escalation),
        (status = 403, description = "Forbidden - technicians only"),
        (status = 404, description = "Ticket not found"),
        (status = 422, description = "Destination equals origin or ticket closed")
    )
)]
pub async fn escalate_ticket(
    auth: Auth,
    data: web::Data<AppState>,
    path: web::Path<Id>,
    payload: web::Json<EscalateRequest>,
) -> Result<HttpResponse, ApiError> {
    require_role!(auth, Role::Technician | Role::Admin);
    let req = payload.into_inner();
    let mut errors = FieldErrors::default();
    if req.to_technician_id.is_none() {
        errors.add("to_technician_id", "destination technician is required");
    }
    let reason = req.reason.unwrap_or_default();
    if reason.trim().is_empty() {
        errors.add("reason", "reason is required");
    } else if reason.len() > REASON_MAX {
        errors.add("reason", "reason must be at most 500 characters");
    }
    errors.into_result()?;

    let escalation = data
        .escalations
        .escalate(
            path.into_inner(),
            auth.0.uid,
            req.to_technician_id.expect("validated above"),
            reason,
            req.observations,
        )
        .await?;
    Ok(HttpResponse::Created().json(escalation))
}

#[utoipa::path(
    post,
    path = "/api/v1/escalations/{id}/approve",
    params(("id" = Id, Path, description = "Escalation id")),
    responses(
        (status = 200, description = "Escalation approved; ticket reassigned", body = Escalation),
        (status = 403, description = "Forbidden - admins only"),
        (status = 404, description = "Escalation not found"),
        (status = 422, description = "Already approved")
    )
)]
pub async fn approve_escalation(
    auth: Auth,
    data: web::Data<AppState>,
    path: web::Path<Id>,
) -> Result<HttpResponse, ApiError> {
    require_role!(auth, Role::Admin);
    let escalation = data.escalations.approve(path.into_inner()).await?;
    Ok(HttpResponse::Ok().json(escalation))
}

#[utoipa::path(
    get,
    path = "/api/v1/tickets/{id}/escalations",
    params(("id" = Id, Path, description = "Ticket id")),
    responses(
        (status = 200, description = "Escalations of the ticket", body = [Escalation]),
        (status = 403, description = "Forbidden - support staff only"),
        (status = 404, description = "Ticket not found")
    )
)]
pub async fn list_escalations(auth: Auth, data: web::Data<AppState>, path: web::Path<Id>) -> Result<HttpResponse, ApiError> {
    require_role!(auth, Role::Technician | Role::Admin);
    let escalations = data.escalations.list(path.into_inner()).await?;
    Ok(HttpResponse::Ok().json(escalations))
}

#[utoipa::path(
    get,
    path = "/api/v1/tickets/{id}/tracking",
    params(("id" = Id, Path, description = "Ticket id")),
    responses(
        (status = 200, description = "Audit notes in append order", body = [TrackingNote]),
        (status = 403, description = "Forbidden - support staff only"),
        (status = 404, description = "Ticket not found")
    )
)]
pub async fn list_tracking(auth: Auth, data: web::Data<AppState>, path: web::Path<Id>) -> Result<HttpResponse, ApiError> {
    require_role!(auth, Role::Technician | Role::Admin);
    let notes = data.escalations.tracking(path.into_inner()).await?;
    Ok(HttpResponse::Ok().json(notes))
}

// ---------------- auth -----------------------

#[derive(serde::Serialize)]
struct MeResponse {
    uid: Id,
    username: String,
    role: String,
}

#[utoipa::path(
    get,
    path = "/api/v1/auth/me",
    responses(
        (status = 200, description = "Current user info"),
        (status = 401, description = "Unauthorized")
    )
)]
pub async fn auth_me(auth: Auth) -> Result<HttpResponse, ApiError> {
    // highest privilege wins (Admin > Technician > User)
    let role = if auth.0.is_admin() {
        "admin"
    } else if auth.0.is_support() {
        "technician"
    } else {
        "user"
    };
    let me = MeResponse {
        uid: auth.0.uid,
        username: auth.0.sub.clone(),
        role: role.to_string(),
    };
    Ok(HttpResponse::Ok().json(me))
}

pub async fn refresh_token(auth: Auth) -> Result<HttpResponse, ApiError> {
    let jwt = create_jwt(auth.0.uid, &auth.0.sub, auth.0.roles).map_err(|_| ApiError::Internal)?;
    Ok(HttpResponse::Ok().json(serde_json::json!({ "token": jwt })))
}
