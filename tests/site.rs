//! Integration tests for the web front end.
//!
//! Serves the real router on an ephemeral port and speaks plain HTTP/1.1
//! over a TCP socket.

mod common;

use common::{Sent, TestBot, test_bot, test_site};
use mystatusd::http::AppState;
use mystatusd::transport::{Event, Transport};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

async fn spawn_site() -> (SocketAddr, TestBot) {
    let bot = test_bot().await;
    let transport: Arc<dyn Transport> = bot.transport.clone();
    let state = AppState {
        db: bot.db.clone(),
        site: test_site(),
        transport,
        messenger: Arc::clone(&bot.messenger),
    };

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind ephemeral port");
    let addr = listener.local_addr().expect("local addr");
    let app = mystatusd::http::router(state);
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });

    (addr, bot)
}

/// Issue one HTTP/1.1 request and return (status code, body).
async fn request(addr: SocketAddr, method: &str, path: &str, form: Option<&str>) -> (u16, String) {
    let mut stream = TcpStream::connect(addr).await.expect("connect");
    let req = match form {
        Some(body) => format!(
            "{method} {path} HTTP/1.1\r\nHost: test\r\nConnection: close\r\n\
             Content-Type: application/x-www-form-urlencoded\r\nContent-Length: {}\r\n\r\n{body}",
            body.len()
        ),
        None => format!("{method} {path} HTTP/1.1\r\nHost: test\r\nConnection: close\r\n\r\n"),
    };
    stream.write_all(req.as_bytes()).await.expect("write");

    let mut response = Vec::new();
    stream.read_to_end(&mut response).await.expect("read");
    let response = String::from_utf8_lossy(&response).to_string();

    let status = response
        .split_whitespace()
        .nth(1)
        .and_then(|s| s.parse().ok())
        .expect("status code");
    let body = response
        .split_once("\r\n\r\n")
        .map(|(_, body)| body.to_string())
        .unwrap_or_default();
    (status, body)
}

#[tokio::test]
async fn status_feed_unknown_user_is_404() {
    let (addr, _bot) = spawn_site().await;
    let (status, body) = request(addr, "GET", "/status/nobody", None).await;
    assert_eq!(status, 404);
    assert!(body.contains("User not found"));
}

#[tokio::test]
async fn status_feed_reflects_presence() {
    let (addr, bot) = spawn_site().await;

    bot.handler
        .dispatch(Event::Presence {
            sender: "alice@example.org".to_string(),
            available: true,
            state: Some("dnd".to_string()),
            status_text: Some("heads down".to_string()),
        })
        .await;

    // Claim a username through the store directly; the feed keys on it.
    let patch = mystatusd::db::AccountPatch {
        username: Some("alice".to_string()),
        ..mystatusd::db::AccountPatch::for_address("alice@example.org")
    };
    bot.db
        .accounts()
        .reconcile(&[mystatusd::db::MatchKey::Address], &patch)
        .await
        .expect("claim username");

    let (status, body) = request(addr, "GET", "/status/alice", None).await;
    assert_eq!(status, 200);
    assert!(body.contains(r#""rawState":"dnd""#));
    assert!(body.contains("Do not disturb"));
    assert!(body.contains("img/icons/busy.png"));
    assert!(body.contains("heads down"));
}

#[tokio::test]
async fn register_unknown_address_requests_subscription() {
    let (addr, bot) = spawn_site().await;

    let (status, body) = request(
        addr,
        "POST",
        "/account/register",
        Some("address=new%40example.org"),
    )
    .await;
    assert_eq!(status, 200);
    assert!(body.contains("subscription-requested"));

    let sent = bot.transport.take().await;
    assert_eq!(
        sent,
        vec![Sent::RequestSubscription("new@example.org".to_string())]
    );
}

#[tokio::test]
async fn register_known_address_resends_link() {
    let (addr, bot) = spawn_site().await;

    bot.handler
        .dispatch(Event::SubscriptionRequest {
            sender: "alice@example.org".to_string(),
        })
        .await;
    bot.transport.take().await;

    let (status, body) = request(
        addr,
        "POST",
        "/account/register",
        Some("address=alice%40example.org"),
    )
    .await;
    assert_eq!(status, 200);
    assert!(body.contains("message-sent"));

    let sent = bot.transport.take().await;
    assert!(matches!(&sent[..], [Sent::Message { to, .. }] if to == "alice@example.org"));
}

#[tokio::test]
async fn register_rejects_malformed_address() {
    let (addr, bot) = spawn_site().await;

    let (status, _body) = request(
        addr,
        "POST",
        "/account/register",
        Some("address=not-an-address"),
    )
    .await;
    assert_eq!(status, 422);
    assert!(bot.transport.take().await.is_empty());
}

#[tokio::test]
async fn account_page_flow_claims_username() {
    let (addr, bot) = spawn_site().await;

    bot.handler
        .dispatch(Event::SubscriptionRequest {
            sender: "alice@example.org".to_string(),
        })
        .await;
    let code = bot
        .db
        .accounts()
        .find_by_address("alice@example.org")
        .await
        .expect("find")
        .expect("exists")
        .account_code
        .expect("code");

    let (status, body) = request(addr, "GET", &format!("/account/{code}"), None).await;
    assert_eq!(status, 200);
    assert!(body.contains("alice@example.org"));

    let (status, body) = request(
        addr,
        "POST",
        &format!("/account/{code}"),
        Some("username=alice"),
    )
    .await;
    assert_eq!(status, 200);
    assert!(body.contains("/status/alice"));

    // Invalid usernames are rejected before any write
    let (status, _) = request(
        addr,
        "POST",
        &format!("/account/{code}"),
        Some("username=bad%20name"),
    )
    .await;
    assert_eq!(status, 422);
}

#[tokio::test]
async fn claiming_a_taken_username_is_a_conflict() {
    let (addr, bot) = spawn_site().await;

    for sender in ["alice@example.org", "bob@example.org"] {
        bot.handler
            .dispatch(Event::SubscriptionRequest {
                sender: sender.to_string(),
            })
            .await;
    }
    let alice_code = bot
        .db
        .accounts()
        .find_by_address("alice@example.org")
        .await
        .expect("find")
        .expect("exists")
        .account_code
        .expect("code");
    let bob_code = bot
        .db
        .accounts()
        .find_by_address("bob@example.org")
        .await
        .expect("find")
        .expect("exists")
        .account_code
        .expect("code");

    let (status, _) = request(
        addr,
        "POST",
        &format!("/account/{alice_code}"),
        Some("username=shared"),
    )
    .await;
    assert_eq!(status, 200);

    let (status, body) = request(
        addr,
        "POST",
        &format!("/account/{bob_code}"),
        Some("username=shared"),
    )
    .await;
    assert_eq!(status, 409);
    assert!(body.contains("already taken"));
}

#[tokio::test]
async fn unknown_account_code_is_404() {
    let (addr, _bot) = spawn_site().await;
    let (status, _) = request(addr, "GET", "/account/ffffffff", None).await;
    assert_eq!(status, 404);
}

#[tokio::test]
async fn metrics_endpoint_serves_text() {
    let (addr, _bot) = spawn_site().await;
    let (status, _body) = request(addr, "GET", "/metrics", None).await;
    // Metrics may be empty when init has not run in this process; the
    // route itself must answer.
    assert_eq!(status, 200);
}
