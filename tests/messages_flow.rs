mod common;

use anyhow::Result;
use axum::http::StatusCode;
use chat_gateway::store::ChatStore;
use common::{body_json, TestApp, TestUser};
use serde::Deserialize;
use serde_json::json;
use uuid::Uuid;

#[derive(Deserialize)]
struct ChatResponse {
    id: Uuid,
}

#[derive(Debug, Deserialize, PartialEq)]
struct MessageResponse {
    id: Uuid,
    chat_id: Uuid,
    user_id: Uuid,
    content: String,
    message_type: String,
    file_url: Option<String>,
    file_name: Option<String>,
    file_size: Option<i64>,
}

#[derive(Deserialize)]
struct UnreadResponse {
    unread_count: i64,
}

#[derive(Deserialize)]
struct ReadResponse {
    newly_read: bool,
}

async fn create_group(app: &TestApp, owner: &TestUser, members: &[&TestUser]) -> Result<Uuid> {
    let ids: Vec<Uuid> = members.iter().map(|member| member.id).collect();
    let response = app
        .post_json(
            "/api/chats",
            &json!({ "workspace_id": Uuid::new_v4(), "chat_type": "group", "participant_ids": ids }),
            Some(&owner.token),
        )
        .await?;
    assert_eq!(response.status(), StatusCode::CREATED);
    let chat: ChatResponse = body_json(response).await?;
    Ok(chat.id)
}

async fn send_text(app: &TestApp, chat_id: Uuid, author: &TestUser, content: &str) -> Result<MessageResponse> {
    let response = app
        .post_json(
            &format!("/api/chats/{chat_id}/messages"),
            &json!({ "content": content }),
            Some(&author.token),
        )
        .await?;
    assert_eq!(response.status(), StatusCode::CREATED);
    body_json(response).await
}

async fn unread(app: &TestApp, chat_id: Uuid, user: &TestUser) -> Result<i64> {
    let response = app
        .get(&format!("/api/chats/{chat_id}/unread-count"), Some(&user.token))
        .await?;
    assert_eq!(response.status(), StatusCode::OK);
    let body: UnreadResponse = body_json(response).await?;
    Ok(body.unread_count)
}

#[tokio::test]
async fn send_list_and_read_flow() -> Result<()> {
    let app = TestApp::new()?;
    let alice = app.insert_user("Alice").await?;
    let bob = app.insert_user("Bob").await?;
    let chat_id = create_group(&app, &alice, &[&bob]).await?;

    let attachment = app
        .post_json(
            &format!("/api/chats/{chat_id}/messages"),
            &json!({
                "content": "spec sheet",
                "message_type": "file",
                "file_url": "https://files.example/sheet.pdf",
                "file_name": "sheet.pdf",
                "file_size": 4096,
            }),
            Some(&alice.token),
        )
        .await?;
    assert_eq!(attachment.status(), StatusCode::CREATED);
    let attachment: MessageResponse = body_json(attachment).await?;
    assert_eq!(attachment.user_id, alice.id);
    assert_eq!(attachment.chat_id, chat_id);

    let listed = app
        .get(&format!("/api/chats/{chat_id}/messages?after=0"), Some(&bob.token))
        .await?;
    assert_eq!(listed.status(), StatusCode::OK);
    let listed: Vec<MessageResponse> = body_json(listed).await?;
    assert_eq!(listed, vec![attachment]);
    assert_eq!(listed[0].message_type, "file");
    assert_eq!(listed[0].file_name.as_deref(), Some("sheet.pdf"));
    assert_eq!(listed[0].file_size, Some(4096));
    assert_eq!(listed[0].file_url.as_deref(), Some("https://files.example/sheet.pdf"));

    send_text(&app, chat_id, &alice, "two").await?;
    let latest = send_text(&app, chat_id, &alice, "three").await?;

    assert_eq!(unread(&app, chat_id, &alice).await?, 0);
    assert_eq!(unread(&app, chat_id, &bob).await?, 3);

    let read = app
        .post_empty(&format!("/api/messages/{}/read", latest.id), Some(&bob.token))
        .await?;
    assert_eq!(read.status(), StatusCode::OK);
    let read: ReadResponse = body_json(read).await?;
    assert!(read.newly_read);

    let again = app
        .post_empty(&format!("/api/messages/{}/read", latest.id), Some(&bob.token))
        .await?;
    let again: ReadResponse = body_json(again).await?;
    assert!(!again.newly_read);
    assert_eq!(app.store.count_reads(latest.id).await?, 1);

    assert_eq!(unread(&app, chat_id, &bob).await?, 0);

    let reply = send_text(&app, chat_id, &alice, "four").await?;
    assert_eq!(unread(&app, chat_id, &bob).await?, 1);
    let caught_up = app
        .post_empty(&format!("/api/chats/{chat_id}/read"), Some(&bob.token))
        .await?;
    assert_eq!(caught_up.status(), StatusCode::NO_CONTENT);
    assert_eq!(unread(&app, chat_id, &bob).await?, 0);
    assert_eq!(reply.content, "four");

    Ok(())
}

#[tokio::test]
async fn non_participant_cannot_post() -> Result<()> {
    let app = TestApp::new()?;
    let alice = app.insert_user("Alice").await?;
    let mallory = app.insert_user("Mallory").await?;
    let chat_id = create_group(&app, &alice, &[]).await?;

    let response = app
        .post_json(
            &format!("/api/chats/{chat_id}/messages"),
            &json!({ "content": "let me in" }),
            Some(&mallory.token),
        )
        .await?;
    assert_eq!(response.status(), StatusCode::FORBIDDEN);
    assert_eq!(app.store.message_count(chat_id).await, 0);

    let listing = app
        .get(&format!("/api/chats/{chat_id}/messages"), Some(&mallory.token))
        .await?;
    assert_eq!(listing.status(), StatusCode::FORBIDDEN);
    Ok(())
}

#[tokio::test]
async fn pagination_limits_and_offsets() -> Result<()> {
    let app = TestApp::new()?;
    let alice = app.insert_user("Alice").await?;
    let chat_id = create_group(&app, &alice, &[]).await?;
    for n in 0..5 {
        send_text(&app, chat_id, &alice, &format!("m{n}")).await?;
    }

    let page = app
        .get(
            &format!("/api/chats/{chat_id}/messages?limit=2&offset=1"),
            Some(&alice.token),
        )
        .await?;
    let page: Vec<MessageResponse> = body_json(page).await?;
    let contents: Vec<&str> = page.iter().map(|m| m.content.as_str()).collect();
    assert_eq!(contents, vec!["m1", "m2"]);

    let clamped = app
        .get(&format!("/api/chats/{chat_id}/messages?limit=0"), Some(&alice.token))
        .await?;
    let clamped: Vec<MessageResponse> = body_json(clamped).await?;
    assert_eq!(clamped.len(), 1);
    Ok(())
}

#[tokio::test]
async fn edit_and_delete_are_author_only() -> Result<()> {
    let app = TestApp::new()?;
    let alice = app.insert_user("Alice").await?;
    let bob = app.insert_user("Bob").await?;
    let chat_id = create_group(&app, &alice, &[&bob]).await?;
    let message = send_text(&app, chat_id, &alice, "first draft").await?;
    let path = format!("/api/chats/{chat_id}/messages/{}", message.id);

    let hijack = app
        .patch_json(&path, &json!({ "content": "mine now" }), Some(&bob.token))
        .await?;
    assert_eq!(hijack.status(), StatusCode::FORBIDDEN);

    let edited = app
        .patch_json(&path, &json!({ "content": "final" }), Some(&alice.token))
        .await?;
    assert_eq!(edited.status(), StatusCode::OK);
    let edited: MessageResponse = body_json(edited).await?;
    assert_eq!(edited.content, "final");

    let blank = app
        .patch_json(&path, &json!({ "content": "   " }), Some(&alice.token))
        .await?;
    assert_eq!(blank.status(), StatusCode::BAD_REQUEST);

    let denied = app.delete(&path, Some(&bob.token)).await?;
    assert_eq!(denied.status(), StatusCode::FORBIDDEN);

    let deleted = app.delete(&path, Some(&alice.token)).await?;
    assert_eq!(deleted.status(), StatusCode::NO_CONTENT);
    assert_eq!(unread(&app, chat_id, &bob).await?, 0);

    let twice = app.delete(&path, Some(&alice.token)).await?;
    assert_eq!(twice.status(), StatusCode::NOT_FOUND);
    Ok(())
}

#[tokio::test]
async fn blank_text_is_rejected() -> Result<()> {
    let app = TestApp::new()?;
    let alice = app.insert_user("Alice").await?;
    let chat_id = create_group(&app, &alice, &[]).await?;

    let response = app
        .post_json(
            &format!("/api/chats/{chat_id}/messages"),
            &json!({ "content": "  " }),
            Some(&alice.token),
        )
        .await?;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    Ok(())
}
