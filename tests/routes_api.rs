#![cfg(feature = "inmem-store")]

use std::sync::Arc;

use actix_web::{test, App};
use rhd::auth::{create_jwt, Role};
use rhd::notify::{LogNotifier, Notifier};
use rhd::rate_limit::{InMemoryRateLimiter, RateLimitConfig, RateLimiterFacade};
use rhd::repo::{inmem::InMemRepo, Repo};
use rhd::routes::{config, security_headers, AppState};
use rhd::service::{EscalationService, ReplyService, TicketService};
use rhd::storage::{AttachmentStore, FsAttachmentStore};
use serial_test::serial;

// Helper to ensure JWT secret present & unique temp data dir per test
fn setup_env() {
    std::env::set_var("JWT_SECRET", "test-secret-must-be-32-bytes-long!!");
    let tmp = tempfile::tempdir().unwrap();
    std::env::set_var("RHD_DATA_DIR", tmp.path().to_str().unwrap());
}

fn app_state() -> AppState {
    let repo: Arc<dyn Repo> = Arc::new(InMemRepo::new());
    let store: Arc<dyn AttachmentStore> = Arc::new(FsAttachmentStore::new());
    let notifier: Arc<dyn Notifier> = Arc::new(LogNotifier);
    AppState {
        tickets: TicketService::new(repo.clone()),
        replies: ReplyService::new(repo.clone(), store.clone(), notifier),
        escalations: EscalationService::new(repo),
        store,
        limiter: RateLimiterFacade::new(InMemoryRateLimiter::new(false), RateLimitConfig::from_env()),
    }
}

fn owner_token() -> String {
    create_jwt(10, "owner", vec![Role::User]).unwrap()
}
fn other_user_token() -> String {
    create_jwt(11, "other", vec![Role::User]).unwrap()
}
fn tech_token() -> String {
    create_jwt(77, "tech", vec![Role::Technician]).unwrap()
}
fn admin_token() -> String {
    create_jwt(1, "admin", vec![Role::Admin]).unwrap()
}

fn bearer(token: &str) -> (&'static str, String) {
    ("Authorization", format!("Bearer {token}"))
}

// 1x1 transparent PNG, enough for `infer` to sniff image/png
const PNG: &[u8] = &[
    0x89, b'P', b'N', b'G', 0x0D, 0x0A, 0x1A, 0x0A, 0x00, 0x00, 0x00, 0x0D, b'I', b'H', b'D',
    b'R', 0x00, 0x00, 0x00, 0x01, 0x00, 0x00, 0x00, 0x01, 0x08, 0x06, 0x00, 0x00, 0x00, 0x1F,
    0x15, 0xC4, 0x89, 0x00, 0x00, 0x00, 0x0A, b'I', b'D', b'A', b'T', 0x78, 0x9C, 0x63, 0x00,
    0x01, 0x00, 0x00, 0x05, 0x00, 0x01, 0x0D, 0x0A, 0x2D, 0xB4, 0x00, 0x00, 0x00, 0x00, b'I',
    b'E', b'N', b'D', 0xAE, 0x42, 0x60, 0x82,
];

fn multipart_reply(boundary: &str, content: &str, file: Option<(&str, &[u8])>) -> Vec<u8> {
    let mut body: Vec<u8> = Vec::new();
    body.extend_from_slice(
        format!("--{boundary}\r\nContent-Disposition: form-data; name=\"content\"\r\n\r\n{content}\r\n").as_bytes(),
    );
    if let Some((filename, bytes)) = file {
        body.extend_from_slice(
            format!(
                "--{boundary}\r\nContent-Disposition: form-data; name=\"file\"; filename=\"{filename}\"\r\nContent-Type: application/octet-stream\r\n\r\n"
            )
            .as_bytes(),
        );
        body.extend_from_slice(bytes);
        body.extend_from_slice(b"\r\n");
    }
    body.extend_from_slice(format!("--{boundary}--\r\n").as_bytes());
    body
}

macro_rules! create_ticket_as_owner {
    ($app:expr) => {{
        let req = test::TestRequest::post()
            .uri("/api/v1/tickets")
            .insert_header(bearer(&owner_token()))
            .set_json(&serde_json::json!({
                "title": "VPN down",
                "kind": "incident",
                "priority": "alta",
                "content": "the VPN drops every few minutes"
            }))
            .to_request();
        let resp = test::call_service($app, req).await;
        assert_eq!(resp.status(), 201);
        let body: serde_json::Value = serde_json::from_slice(&test::read_body(resp).await).unwrap();
        body
    }};
}

#[actix_web::test]
#[serial]
async fn test_ticket_lifecycle_routes() {
    setup_env();
    let app = test::init_service(
        App::new()
            .wrap(security_headers())
            .app_data(actix_web::web::Data::new(app_state()))
            .configure(config),
    )
    .await;

    let created = create_ticket_as_owner!(&app);
    assert_eq!(created["ticket"]["status"], "open");
    assert_eq!(created["reply"]["content"], "the VPN drops every few minutes");
    let ticket_id = created["ticket"]["id"].as_i64().unwrap();

    // owner sees their ticket
    let req = test::TestRequest::get()
        .uri(&format!("/api/v1/tickets/{ticket_id}"))
        .insert_header(bearer(&owner_token()))
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert!(resp.status().is_success());

    // a different user does not
    let req = test::TestRequest::get()
        .uri(&format!("/api/v1/tickets/{ticket_id}"))
        .insert_header(bearer(&other_user_token()))
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), 404);

    // owner may retitle
    let req = test::TestRequest::patch()
        .uri(&format!("/api/v1/tickets/{ticket_id}"))
        .insert_header(bearer(&owner_token()))
        .set_json(&serde_json::json!({"title": "VPN still down"}))
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), 200);

    // owner may not change priority
    let req = test::TestRequest::patch()
        .uri(&format!("/api/v1/tickets/{ticket_id}"))
        .insert_header(bearer(&owner_token()))
        .set_json(&serde_json::json!({"priority": "baja"}))
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), 403);

    // support may
    let req = test::TestRequest::patch()
        .uri(&format!("/api/v1/tickets/{ticket_id}"))
        .insert_header(bearer(&tech_token()))
        .set_json(&serde_json::json!({"priority": "media"}))
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), 200);

    // close, then closing again is a domain error
    let req = test::TestRequest::post()
        .uri(&format!("/api/v1/tickets/{ticket_id}/close"))
        .insert_header(bearer(&owner_token()))
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), 200);

    let req = test::TestRequest::post()
        .uri(&format!("/api/v1/tickets/{ticket_id}/close"))
        .insert_header(bearer(&owner_token()))
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), 422);
    let body: serde_json::Value = serde_json::from_slice(&test::read_body(resp).await).unwrap();
    assert_eq!(body["success"], false);
    assert!(body["message"].as_str().unwrap().contains("closed"));

    // replying to a closed ticket is rejected
    let boundary = "TESTBOUNDARY";
    let req = test::TestRequest::post()
        .uri(&format!("/api/v1/tickets/{ticket_id}/replies"))
        .insert_header(bearer(&owner_token()))
        .insert_header(("Content-Type", format!("multipart/form-data; boundary={boundary}")))
        .set_payload(multipart_reply(boundary, "hello?", None))
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), 422);

    // reopen brings it back
    let req = test::TestRequest::post()
        .uri(&format!("/api/v1/tickets/{ticket_id}/reopen"))
        .insert_header(bearer(&owner_token()))
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), 200);
    let reopened: serde_json::Value = serde_json::from_slice(&test::read_body(resp).await).unwrap();
    assert_eq!(reopened["status"], "open");
}

#[actix_web::test]
#[serial]
async fn test_reply_multipart_and_attachment_fetch() {
    setup_env();
    let app = test::init_service(
        App::new()
            .wrap(security_headers())
            .app_data(actix_web::web::Data::new(app_state()))
            .configure(config),
    )
    .await;

    let created = create_ticket_as_owner!(&app);
    let ticket_id = created["ticket"]["id"].as_i64().unwrap();
    let first_reply_id = created["reply"]["id"].as_i64().unwrap();

    // owner posts a reply with a PNG attachment -> ticket goes pending
    let boundary = "BOUNDARYHASH";
    let req = test::TestRequest::post()
        .uri(&format!("/api/v1/tickets/{ticket_id}/replies"))
        .insert_header(bearer(&owner_token()))
        .insert_header(("Content-Type", format!("multipart/form-data; boundary={boundary}")))
        .set_payload(multipart_reply(boundary, "screenshot attached", Some(("shot.png", PNG))))
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), 201);
    let posted: serde_json::Value = serde_json::from_slice(&test::read_body(resp).await).unwrap();
    assert_eq!(posted["attachments"].as_array().unwrap().len(), 1);
    assert_eq!(posted["attachments"][0]["kind"], "image");
    assert_eq!(posted["attachments"][0]["mime"], "image/png");
    let reply_id = posted["reply"]["id"].as_i64().unwrap();
    let key = posted["attachments"][0]["storage_key"].as_str().unwrap().to_string();

    let req = test::TestRequest::get()
        .uri(&format!("/api/v1/tickets/{ticket_id}"))
        .insert_header(bearer(&owner_token()))
        .to_request();
    let resp = test::call_service(&app, req).await;
    let ticket: serde_json::Value = serde_json::from_slice(&test::read_body(resp).await).unwrap();
    assert_eq!(ticket["status"], "pending");

    // support reply releases the pending ticket
    let req = test::TestRequest::post()
        .uri(&format!("/api/v1/tickets/{ticket_id}/replies"))
        .insert_header(bearer(&tech_token()))
        .insert_header(("Content-Type", format!("multipart/form-data; boundary={boundary}")))
        .set_payload(multipart_reply(boundary, "restart the client please", None))
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), 201);

    let req = test::TestRequest::get()
        .uri(&format!("/api/v1/tickets/{ticket_id}"))
        .insert_header(bearer(&owner_token()))
        .to_request();
    let resp = test::call_service(&app, req).await;
    let ticket: serde_json::Value = serde_json::from_slice(&test::read_body(resp).await).unwrap();
    assert_eq!(ticket["status"], "open");

    // the blob is fetchable by key with its sniffed content type
    let req = test::TestRequest::get().uri(&format!("/attachments/{key}")).to_request();
    let resp = test::call_service(&app, req).await;
    assert!(resp.status().is_success());
    let ct = resp.headers().get("content-type").unwrap().to_str().unwrap();
    assert_eq!(ct, "image/png");

    // listing attachments for the reply
    let req = test::TestRequest::get()
        .uri(&format!("/api/v1/replies/{reply_id}/attachments"))
        .insert_header(bearer(&owner_token()))
        .to_request();
    let resp = test::call_service(&app, req).await;
    let atts: serde_json::Value = serde_json::from_slice(&test::read_body(resp).await).unwrap();
    assert_eq!(atts.as_array().unwrap().len(), 1);

    // the original report cannot be deleted, later replies can
    let req = test::TestRequest::delete()
        .uri(&format!("/api/v1/replies/{first_reply_id}"))
        .insert_header(bearer(&admin_token()))
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), 422);

    let req = test::TestRequest::delete()
        .uri(&format!("/api/v1/replies/{reply_id}"))
        .insert_header(bearer(&owner_token()))
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), 204);

    // blob removed along with the reply
    let req = test::TestRequest::get().uri(&format!("/attachments/{key}")).to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), 404);
}

#[actix_web::test]
#[serial]
async fn test_disallowed_extension_is_rejected() {
    setup_env();
    let app = test::init_service(
        App::new()
            .app_data(actix_web::web::Data::new(app_state()))
            .configure(config),
    )
    .await;

    let created = create_ticket_as_owner!(&app);
    let ticket_id = created["ticket"]["id"].as_i64().unwrap();

    let boundary = "BOUNDARYEXE";
    let req = test::TestRequest::post()
        .uri(&format!("/api/v1/tickets/{ticket_id}/replies"))
        .insert_header(bearer(&owner_token()))
        .insert_header(("Content-Type", format!("multipart/form-data; boundary={boundary}")))
        .set_payload(multipart_reply(boundary, "totally safe", Some(("tool.exe", &[0u8; 16]))))
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), 415);
}

#[actix_web::test]
#[serial]
async fn test_validation_envelope() {
    setup_env();
    let app = test::init_service(
        App::new()
            .app_data(actix_web::web::Data::new(app_state()))
            .configure(config),
    )
    .await;

    // missing title, priority and content
    let req = test::TestRequest::post()
        .uri("/api/v1/tickets")
        .insert_header(bearer(&owner_token()))
        .set_json(&serde_json::json!({"kind": "incident"}))
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), 422);
    let body: serde_json::Value = serde_json::from_slice(&test::read_body(resp).await).unwrap();
    assert_eq!(body["success"], false);
    assert!(body["errors"]["title"].is_array());
    assert!(body["errors"]["priority"].is_array());
    assert!(body["errors"]["content"].is_array());
}

#[actix_web::test]
#[serial]
async fn test_escalation_routes() {
    setup_env();
    let app = test::init_service(
        App::new()
            .app_data(actix_web::web::Data::new(app_state()))
            .configure(config),
    )
    .await;

    let created = create_ticket_as_owner!(&app);
    let ticket_id = created["ticket"]["id"].as_i64().unwrap();

    // plain users cannot escalate
    let req = test::TestRequest::post()
        .uri(&format!("/api/v1/tickets/{ticket_id}/escalations"))
        .insert_header(bearer(&owner_token()))
        .set_json(&serde_json::json!({"to_technician_id": 88, "reason": "needs networking"}))
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), 403);

    // technician escalating to themselves is rejected
    let req = test::TestRequest::post()
        .uri(&format!("/api/v1/tickets/{ticket_id}/escalations"))
        .insert_header(bearer(&tech_token()))
        .set_json(&serde_json::json!({"to_technician_id": 77, "reason": "me again"}))
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), 422);

    // valid escalation request
    let req = test::TestRequest::post()
        .uri(&format!("/api/v1/tickets/{ticket_id}/escalations"))
        .insert_header(bearer(&tech_token()))
        .set_json(&serde_json::json!({
            "to_technician_id": 88,
            "reason": "needs networking",
            "observations": "second time this month"
        }))
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), 201);
    let escalation: serde_json::Value = serde_json::from_slice(&test::read_body(resp).await).unwrap();
    assert_eq!(escalation["approved"], false);
    let escalation_id = escalation["id"].as_i64().unwrap();

    // no reassignment before approval
    let req = test::TestRequest::get()
        .uri(&format!("/api/v1/tickets/{ticket_id}"))
        .insert_header(bearer(&tech_token()))
        .to_request();
    let resp = test::call_service(&app, req).await;
    let ticket: serde_json::Value = serde_json::from_slice(&test::read_body(resp).await).unwrap();
    assert!(ticket["technician_id"].is_null());

    // approval is admin-only
    let req = test::TestRequest::post()
        .uri(&format!("/api/v1/escalations/{escalation_id}/approve"))
        .insert_header(bearer(&tech_token()))
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), 403);

    let req = test::TestRequest::post()
        .uri(&format!("/api/v1/escalations/{escalation_id}/approve"))
        .insert_header(bearer(&admin_token()))
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), 200);

    // ticket now assigned to the destination technician
    let req = test::TestRequest::get()
        .uri(&format!("/api/v1/tickets/{ticket_id}"))
        .insert_header(bearer(&tech_token()))
        .to_request();
    let resp = test::call_service(&app, req).await;
    let ticket: serde_json::Value = serde_json::from_slice(&test::read_body(resp).await).unwrap();
    assert_eq!(ticket["technician_id"], 88);

    // both actions audited
    let req = test::TestRequest::get()
        .uri(&format!("/api/v1/tickets/{ticket_id}/tracking"))
        .insert_header(bearer(&tech_token()))
        .to_request();
    let resp = test::call_service(&app, req).await;
    let notes: serde_json::Value = serde_json::from_slice(&test::read_body(resp).await).unwrap();
    assert_eq!(notes.as_array().unwrap().len(), 2);

    // second approval rejected
    let req = test::TestRequest::post()
        .uri(&format!("/api/v1/escalations/{escalation_id}/approve"))
        .insert_header(bearer(&admin_token()))
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), 422);
}

#[actix_web::test]
#[serial]
async fn test_auth_me_and_refresh() {
    setup_env();
    let app = test::init_service(
        App::new()
            .app_data(actix_web::web::Data::new(app_state()))
            .configure(config),
    )
    .await;

    let token = tech_token();

    let req = test::TestRequest::get()
        .uri("/api/v1/auth/me")
        .insert_header(bearer(&token))
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert!(resp.status().is_success());
    let me: serde_json::Value = serde_json::from_slice(&test::read_body(resp).await).unwrap();
    assert_eq!(me["role"], "technician");
    assert_eq!(me["uid"], 77);

    let req = test::TestRequest::post()
        .uri("/api/v1/auth/refresh")
        .insert_header(bearer(&token))
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert!(resp.status().is_success());
    let refreshed: serde_json::Value = serde_json::from_slice(&test::read_body(resp).await).unwrap();
    assert!(refreshed["token"].as_str().unwrap().len() > 10);

    // no token -> 401
    let req = test::TestRequest::get().uri("/api/v1/auth/me").to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), 401);
}
