mod common;

use std::net::SocketAddr;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use axum::http::StatusCode;
use common::{body_json, TestApp};
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use uuid::Uuid;

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

#[derive(Deserialize)]
struct ChatResponse {
    id: Uuid,
}

async fn open(addr: SocketAddr, kind: &str, workspace_id: Uuid, token: &str) -> Result<Socket> {
    let url = format!("ws://{addr}/ws/{kind}/{workspace_id}?token={token}");
    let (socket, _) = connect_async(url).await.context("websocket handshake failed")?;
    Ok(socket)
}

async fn send(socket: &mut Socket, frame: Value) -> Result<()> {
    socket.send(Message::Text(frame.to_string())).await?;
    Ok(())
}

/// Reads until a JSON frame with the given `type` arrives, skipping others.
async fn next_of_type(socket: &mut Socket, kind: &str) -> Result<Value> {
    loop {
        let frame = timeout(Duration::from_secs(2), socket.next())
            .await
            .with_context(|| format!("timed out waiting for {kind}"))?;
        match frame {
            Some(Ok(Message::Text(text))) => {
                let value: Value = serde_json::from_str(&text)?;
                if value["type"] == kind {
                    return Ok(value);
                }
            }
            Some(Ok(Message::Close(frame))) => bail!("socket closed while waiting for {kind}: {frame:?}"),
            Some(Ok(_)) => {}
            Some(Err(err)) => return Err(err.into()),
            None => bail!("socket ended while waiting for {kind}"),
        }
    }
}

#[tokio::test]
async fn invalid_token_is_closed_with_policy_violation() -> Result<()> {
    let app = TestApp::new()?;
    let addr = app.spawn_server().await?;

    let mut socket = open(addr, "chat", Uuid::new_v4(), "not-a-token").await?;
    let frame = timeout(Duration::from_secs(2), socket.next())
        .await
        .context("timed out waiting for close")?;
    match frame {
        Some(Ok(Message::Close(Some(close)))) => assert_eq!(u16::from(close.code), 1008),
        other => panic!("expected policy close, got {other:?}"),
    }
    Ok(())
}

#[tokio::test]
async fn message_round_trip_over_sockets() -> Result<()> {
    let app = TestApp::new()?;
    let alice = app.insert_user("Alice").await?;
    let bob = app.insert_user("Bob").await?;
    let workspace_id = Uuid::new_v4();

    let created = app
        .post_json(
            "/api/chats",
            &json!({ "workspace_id": workspace_id, "chat_type": "group", "participant_ids": [bob.id] }),
            Some(&alice.token),
        )
        .await?;
    assert_eq!(created.status(), StatusCode::CREATED);
    let chat: ChatResponse = body_json(created).await?;

    let addr = app.spawn_server().await?;
    let mut alice_socket = open(addr, "chat", workspace_id, &alice.token).await?;
    let mut bob_socket = open(addr, "chat", workspace_id, &bob.token).await?;

    for socket in [&mut alice_socket, &mut bob_socket] {
        send(socket, json!({ "type": "SUBSCRIBE", "chatId": chat.id })).await?;
        let subscribed = next_of_type(socket, "SUBSCRIBED").await?;
        assert_eq!(subscribed["chatId"], chat.id.to_string());
    }

    send(
        &mut alice_socket,
        json!({ "type": "SEND_MESSAGE", "content": "hello" }),
    )
    .await?;
    let sent = next_of_type(&mut alice_socket, "MESSAGE_SENT").await?;
    let received = next_of_type(&mut bob_socket, "MESSAGE_RECEIVED").await?;
    assert_eq!(sent["messageId"], received["messageId"]);
    assert_eq!(received["userId"], alice.id.to_string());
    assert_eq!(received["userName"], "Alice");
    assert_eq!(received["content"], "hello");
    assert_eq!(received["messageType"], "text");

    send(&mut bob_socket, json!({ "type": "PING" })).await?;
    next_of_type(&mut bob_socket, "PONG").await?;

    send(&mut bob_socket, json!({ "type": "NOPE" })).await?;
    let error = next_of_type(&mut bob_socket, "ERROR").await?;
    assert_eq!(error["code"], "BAD_REQUEST");

    // The connection survives a rejected frame.
    send(
        &mut bob_socket,
        json!({ "type": "MARK_READ", "messageId": received["messageId"] }),
    )
    .await?;
    next_of_type(&mut bob_socket, "READ").await?;

    Ok(())
}

#[tokio::test]
async fn closing_socket_marks_user_offline() -> Result<()> {
    let app = TestApp::new()?;
    let alice = app.insert_user("Alice").await?;
    let workspace_id = Uuid::new_v4();
    let addr = app.spawn_server().await?;

    let mut socket = open(addr, "presence", workspace_id, &alice.token).await?;
    // Our own status change is the first event on the presence channel.
    let status = next_of_type(&mut socket, "USER_STATUS").await?;
    assert_eq!(status["userId"], alice.id.to_string());
    assert!(app.state.presence.is_online(alice.id, workspace_id).await);

    socket.close(None).await?;
    for _ in 0..100 {
        if !app.state.presence.is_online(alice.id, workspace_id).await {
            return Ok(());
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    bail!("user still online after closing the socket");
}
