#![cfg(feature = "inmem-store")]

use rhd::models::*;
use rhd::repo::{inmem::InMemRepo, RepoError};
// Bring trait method namespaces into scope so calls on InMemRepo resolve.
use rhd::repo::{EscalationRepo, ReplyRepo, TicketRepo};

/// Helper that returns a fresh, empty repository for every test run.
fn repo() -> InMemRepo {
    // isolate state: do **not** persist to the default file path
    std::env::set_var("RHD_DATA_DIR", tempfile::tempdir().unwrap().path());
    InMemRepo::new()
}

fn new_ticket(title: &str) -> NewTicket {
    NewTicket {
        title: title.into(),
        kind: TicketKind::Incident,
        priority: TicketPriority::Alta,
        content: "it broke".into(),
    }
}

#[tokio::test]
async fn ticket_creation_includes_first_reply() {
    let r = repo();

    let (ticket, reply) = r.create_ticket(new_ticket("VPN down"), 10).await.unwrap();
    assert_eq!(ticket.status, TicketStatus::Open);
    assert_eq!(ticket.user_id, 10);
    assert!(ticket.technician_id.is_none());
    assert_eq!(reply.ticket_id, ticket.id);
    assert_eq!(reply.author_id, 10);
    assert_eq!(reply.content, "it broke");
    assert!(!reply.from_support);

    // the initial reply is the first reply
    assert_eq!(r.first_reply_id(ticket.id).await.unwrap(), reply.id);
    let replies = r.list_replies(ticket.id).await.unwrap();
    assert_eq!(replies.len(), 1);
}

#[tokio::test]
async fn list_tickets_filters_by_owner_and_status() {
    let r = repo();

    let (a, _) = r.create_ticket(new_ticket("A"), 1).await.unwrap();
    let (b, _) = r.create_ticket(new_ticket("B"), 2).await.unwrap();
    r.transition(b.id, &[TicketStatus::Open], TicketStatus::Closed).await.unwrap();

    let mine = r
        .list_tickets(TicketFilter { owner_id: Some(1), status: None })
        .await
        .unwrap();
    assert_eq!(mine.len(), 1);
    assert_eq!(mine[0].id, a.id);

    let closed = r
        .list_tickets(TicketFilter { owner_id: None, status: Some(TicketStatus::Closed) })
        .await
        .unwrap();
    assert_eq!(closed.len(), 1);
    assert_eq!(closed[0].id, b.id);
}

#[tokio::test]
async fn transition_guards() {
    let r = repo();
    let (ticket, _) = r.create_ticket(new_ticket("T"), 1).await.unwrap();

    // close from open
    let closed = r
        .transition(ticket.id, &[TicketStatus::Open, TicketStatus::Pending], TicketStatus::Closed)
        .await
        .unwrap();
    assert_eq!(closed.status, TicketStatus::Closed);

    // closing again is rejected
    let err = r
        .transition(ticket.id, &[TicketStatus::Open, TicketStatus::Pending], TicketStatus::Closed)
        .await
        .unwrap_err();
    assert!(matches!(err, RepoError::InvalidState(_)));

    // reopen
    let reopened = r
        .transition(ticket.id, &[TicketStatus::Closed], TicketStatus::Open)
        .await
        .unwrap();
    assert_eq!(reopened.status, TicketStatus::Open);

    // reopening a non-closed ticket is rejected
    let err = r
        .transition(ticket.id, &[TicketStatus::Closed], TicketStatus::Open)
        .await
        .unwrap_err();
    assert!(matches!(err, RepoError::InvalidState(_)));
}

#[tokio::test]
async fn update_ticket_applies_patch_and_validates_status() {
    let r = repo();
    let (ticket, _) = r.create_ticket(new_ticket("T"), 1).await.unwrap();

    let updated = r
        .update_ticket(
            ticket.id,
            TicketPatch {
                title: Some("Renamed".into()),
                priority: Some(TicketPriority::Baja),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    assert_eq!(updated.title, "Renamed");
    assert_eq!(updated.priority, TicketPriority::Baja);
    assert_eq!(updated.status, TicketStatus::Open);

    r.transition(ticket.id, &[TicketStatus::Open], TicketStatus::Closed).await.unwrap();
    // closed -> pending is not a legal transition
    let err = r
        .update_ticket(
            ticket.id,
            TicketPatch { status: Some(TicketStatus::Pending), ..Default::default() },
        )
        .await
        .unwrap_err();
    assert!(matches!(err, RepoError::InvalidState(_)));
}

#[tokio::test]
async fn reply_and_attachment_flow() {
    let r = repo();
    let (ticket, first) = r.create_ticket(new_ticket("T"), 1).await.unwrap();

    let (reply, atts) = r
        .create_reply(
            NewReply {
                ticket_id: ticket.id,
                author_id: 7,
                content: "have you tried turning it off and on".into(),
                from_support: true,
            },
            vec![NewAttachment {
                kind: AttachmentKind::Image,
                mime: "image/png".into(),
                storage_key: "abcd1234".into(),
                file_name: "screen.png".into(),
                size_bytes: 42,
                checksum: "deadbeef".into(),
            }],
        )
        .await
        .unwrap();
    assert_eq!(atts.len(), 1);
    assert_eq!(atts[0].reply_id, reply.id);

    let listed = r.list_attachments(reply.id).await.unwrap();
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0].storage_key, "abcd1234");

    // replies come back in creation order, original report first
    let replies = r.list_replies(ticket.id).await.unwrap();
    assert_eq!(replies.len(), 2);
    assert_eq!(replies[0].id, first.id);
    assert_eq!(replies[1].id, reply.id);

    // deleting the reply hands back its attachments for blob cleanup
    let removed = r.delete_reply(reply.id).await.unwrap();
    assert_eq!(removed.len(), 1);
    assert_eq!(removed[0].storage_key, "abcd1234");
    assert!(matches!(r.get_reply(reply.id).await.unwrap_err(), RepoError::NotFound));
    assert_eq!(r.list_replies(ticket.id).await.unwrap().len(), 1);
}

#[tokio::test]
async fn update_reply_rewrites_content() {
    let r = repo();
    let (_, first) = r.create_ticket(new_ticket("T"), 1).await.unwrap();

    let updated = r.update_reply(first.id, "more details".into()).await.unwrap();
    assert_eq!(updated.content, "more details");
    assert!(updated.updated_at >= updated.created_at);
}

#[tokio::test]
async fn escalation_request_does_not_reassign() {
    let r = repo();
    let (ticket, _) = r.create_ticket(new_ticket("T"), 1).await.unwrap();

    let escalation = r
        .create_escalation(
            NewEscalation {
                ticket_id: ticket.id,
                origin_id: 7,
                dest_id: 8,
                reason: "needs networking team".into(),
                observations: None,
            },
            "escalation requested",
        )
        .await
        .unwrap();
    assert!(!escalation.approved);
    assert!(escalation.approved_at.is_none());

    // unapproved escalations leave the assignment untouched
    let ticket = r.get_ticket(ticket.id).await.unwrap();
    assert!(ticket.technician_id.is_none());

    // but the request is audited
    let notes = r.list_tracking(ticket.id).await.unwrap();
    assert_eq!(notes.len(), 1);
    assert_eq!(notes[0].note, "escalation requested");
}

#[tokio::test]
async fn escalation_approval_reassigns_and_audits() {
    let r = repo();
    let (ticket, _) = r.create_ticket(new_ticket("T"), 1).await.unwrap();
    let escalation = r
        .create_escalation(
            NewEscalation {
                ticket_id: ticket.id,
                origin_id: 7,
                dest_id: 8,
                reason: "out of my depth".into(),
                observations: Some("second incident this week".into()),
            },
            "requested",
        )
        .await
        .unwrap();

    let before = r.get_ticket(ticket.id).await.unwrap();
    let approved = r
        .approve_escalation(escalation.id, chrono::Utc::now(), "approved")
        .await
        .unwrap();
    assert!(approved.approved);
    assert!(approved.approved_at.is_some());

    let after = r.get_ticket(ticket.id).await.unwrap();
    assert_eq!(after.technician_id, Some(8));
    // nothing but the assignment (and updated_at) changed
    assert_eq!(after.title, before.title);
    assert_eq!(after.status, before.status);
    assert_eq!(after.priority, before.priority);
    assert_eq!(after.user_id, before.user_id);

    let notes = r.list_tracking(ticket.id).await.unwrap();
    assert_eq!(notes.len(), 2);
    assert_eq!(notes[1].note, "approved");

    // a second approval is rejected
    let err = r
        .approve_escalation(escalation.id, chrono::Utc::now(), "again")
        .await
        .unwrap_err();
    assert!(matches!(err, RepoError::InvalidState(_)));
}
