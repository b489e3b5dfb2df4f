use crate::models::{
    Attachment, AttachmentKind, Escalation, NewTicket, Reply, Ticket, TicketKind, TicketPatch,
    TicketPriority, TicketStatus, TrackingNote,
};
use utoipa::OpenApi;

#[derive(OpenApi)]
#[openapi(
    paths(
        crate::routes::list_tickets,
        crate::routes::create_ticket,
        crate::routes::get_ticket,
        crate::routes::update_ticket,
        crate::routes::close_ticket,
        crate::routes::reopen_ticket,
        crate::routes::list_replies,
        crate::routes::create_reply,
        crate::routes::update_reply,
        crate::routes::delete_reply,
        crate::routes::list_reply_attachments,
        crate::routes::escalate_ticket,
        crate::routes::approve_escalation,
        crate::routes::list_escalations,
        crate::routes::list_tracking,
        crate::routes::auth_me,
    ),
    components(schemas(
        Ticket, NewTicket, TicketPatch, TicketStatus, TicketPriority, TicketKind,
        Reply, Attachment, AttachmentKind, Escalation, TrackingNote,
        crate::routes::CreateTicketRequest, crate::routes::TicketCreatedResponse,
        crate::routes::ReplyCreatedResponse, crate::routes::UpdateReplyRequest,
        crate::routes::EscalateRequest,
    )),
    tags(
        (name = "tickets", description = "Ticket lifecycle"),
        (name = "replies", description = "Reply threading and attachments"),
        (name = "escalations", description = "Technician escalation workflow"),
    )
)]
pub struct ApiDoc;
