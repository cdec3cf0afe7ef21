//! E2E tests for the relay inbox

mod common;

use common::{PUBLIC, RemotePeer, TestOptions, TestServer};
use serde_json::{Value, json};
use std::time::Duration;

async fn subscribe(server: &TestServer, peer: &RemotePeer) {
    let response = server.post_signed(peer, &peer.follow(PUBLIC, None)).await;
    assert_eq!(response.status(), 202);
}

async fn settle() {
    tokio::time::sleep(Duration::from_millis(100)).await;
}

#[tokio::test]
async fn test_relay_follow_gets_accept_and_follow_back() {
    let server = TestServer::new().await;
    let peer = server.peer("a.example");

    let follow = peer.follow(&server.relay_id(), Some(&server.relay_id()));
    let response = server.post_signed(&peer, &follow).await;
    assert_eq!(response.status(), 202);

    let sent = server.transport.wait_for(2).await;
    assert_eq!(sent.len(), 2);
    assert!(sent.iter().all(|(inbox, _)| inbox == "https://a.example/inbox"));

    let accept = sent
        .iter()
        .map(|(_, activity)| activity)
        .find(|activity| activity["type"] == "Accept")
        .expect("accept should be delivered");
    assert_eq!(accept["actor"], server.relay_id());
    assert_eq!(accept["object"]["id"], follow["id"]);

    let follow_back = sent
        .iter()
        .map(|(_, activity)| activity)
        .find(|activity| activity["type"] == "Follow")
        .expect("follow-back should be delivered");
    assert_eq!(follow_back["object"], peer.actor_id());

    let follower = server.state.db.get_follower("a.example").await.unwrap();
    assert!(follower.is_some());
}

#[tokio::test]
async fn test_public_follow_creates_active_subscriber() {
    let server = TestServer::new().await;
    let peer = server.peer("a.example");

    subscribe(&server, &peer).await;

    let sent = server.transport.wait_for(1).await;
    assert_eq!(sent[0].1["type"], "Accept");
    assert_eq!(sent[0].1["object"]["object"], PUBLIC);

    let subscriber = server
        .state
        .db
        .get_subscriber("a.example")
        .await
        .unwrap()
        .expect("subscriber should be stored");
    assert_eq!(subscriber.state, fedirelay::data::MembershipState::Active);
}

#[tokio::test]
async fn test_public_create_is_rebroadcast_unchanged() {
    let server = TestServer::new().await;
    let a = server.peer("a.example");
    let b = server.peer("b.example");
    let c = server.peer("c.example");
    for peer in [&a, &b, &c] {
        subscribe(&server, peer).await;
    }
    server.transport.wait_for(3).await;

    let body = serde_json::to_vec(&a.public_create()).unwrap();
    let response = server.post_raw(&a, body.clone()).await;
    assert_eq!(response.status(), 202);

    let sent = server.transport.wait_for(5).await;
    let relayed: Vec<(String, Vec<u8>)> = server
        .transport
        .sent()
        .into_iter()
        .skip(3)
        .collect();
    assert_eq!(sent.len(), 5);

    let mut inboxes: Vec<&str> = relayed.iter().map(|(inbox, _)| inbox.as_str()).collect();
    inboxes.sort();
    assert_eq!(inboxes, vec!["https://b.example/inbox", "https://c.example/inbox"]);
    assert!(relayed.iter().all(|(_, payload)| *payload == body));
}

#[tokio::test]
async fn test_public_create_from_stranger_is_unauthorized() {
    let server = TestServer::new().await;
    let stranger = server.peer("x.example");

    let response = server.post_signed(&stranger, &stranger.public_create()).await;
    assert_eq!(response.status(), 401);
    assert!(response.text().await.unwrap().contains("subscribe in advance"));
}

#[tokio::test]
async fn test_blocked_domain_follow_is_rejected() {
    let server = TestServer::with_options(TestOptions {
        blocked_domains: vec!["spam.example".to_string()],
        ..TestOptions::default()
    })
    .await;
    let spammer = server.peer("spam.example");

    let response = server
        .post_signed(&spammer, &spammer.follow(PUBLIC, None))
        .await;
    assert_eq!(response.status(), 401);
    assert_eq!(
        response.headers()["content-type"],
        "text/plain; charset=utf-8"
    );

    let sent = server.transport.wait_for(1).await;
    assert_eq!(sent[0].0, "https://spam.example/inbox");
    assert_eq!(sent[0].1["type"], "Reject");
    assert!(
        server
            .state
            .db
            .get_subscriber("spam.example")
            .await
            .unwrap()
            .is_none()
    );
}

#[tokio::test]
async fn test_follow_of_unknown_object_sends_reject() {
    let server = TestServer::new().await;
    let peer = server.peer("a.example");

    let follow = peer.follow("https://relay.test/users/nobody", None);
    let response = server.post_signed(&peer, &follow).await;
    assert_eq!(response.status(), 401);

    let sent = server.transport.wait_for(1).await;
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].0, "https://a.example/inbox");
    assert_eq!(sent[0].1["type"], "Reject");
    assert_eq!(sent[0].1["object"]["id"], follow["id"]);
    assert!(server.state.db.find_member("a.example").await.unwrap().is_none());
}

#[tokio::test]
async fn test_announce_from_non_member_is_unauthorized() {
    let server = TestServer::new().await;
    let stranger = server.peer("x.example");

    let announce = json!({
        "id": "https://x.example/announces/1",
        "type": "Announce",
        "actor": stranger.actor_id(),
        "to": [server.relay_id()],
        "object": "https://origin.example/notes/1"
    });
    let response = server.post_signed(&stranger, &announce).await;
    assert_eq!(response.status(), 401);

    settle().await;
    assert!(server.transport.sent().is_empty());
}

#[tokio::test]
async fn test_announce_from_follower_relays_original_object() {
    let server = TestServer::new().await;
    let a = server.peer("a.example");
    let c = server.peer("c.example");
    let origin = server.peer("origin.example");

    let follow = a.follow(&server.relay_id(), Some(&server.relay_id()));
    assert_eq!(server.post_signed(&a, &follow).await.status(), 202);
    subscribe(&server, &c).await;
    server.transport.wait_for(3).await;

    let note = json!({
        "id": "https://origin.example/notes/7",
        "type": "Note",
        "attributedTo": origin.actor_id(),
        "actor": origin.actor_id(),
        "content": "boosted"
    });
    server
        .fetcher
        .add_object("https://origin.example/notes/7", note.clone());

    let announce = json!({
        "id": "https://a.example/announces/1",
        "type": "Announce",
        "actor": a.actor_id(),
        "to": [server.relay_id()],
        "object": "https://origin.example/notes/7"
    });
    assert_eq!(server.post_signed(&a, &announce).await.status(), 202);

    let sent = server.transport.wait_for(4).await;
    let (inbox, relayed) = sent.last().unwrap();
    assert_eq!(inbox, "https://c.example/inbox");
    assert_eq!(*relayed, note);
}

#[tokio::test]
async fn test_undo_follow_removes_subscriber() {
    let server = TestServer::new().await;
    let peer = server.peer("a.example");
    let follow = peer.follow(PUBLIC, None);
    assert_eq!(server.post_signed(&peer, &follow).await.status(), 202);

    let undo = json!({
        "id": "https://a.example/undo/1",
        "type": "Undo",
        "actor": peer.actor_id(),
        "object": follow
    });
    assert_eq!(server.post_signed(&peer, &undo).await.status(), 202);
    assert!(
        server
            .state
            .db
            .find_member("a.example")
            .await
            .unwrap()
            .is_none()
    );
}

#[tokio::test]
async fn test_manual_approval_holds_follow_until_approved() {
    let server = TestServer::with_options(TestOptions {
        manual_approval: true,
        ..TestOptions::default()
    })
    .await;
    let peer = server.peer("a.example");

    subscribe(&server, &peer).await;
    settle().await;
    assert!(server.transport.sent().is_empty());

    assert!(server.state.membership.approve("a.example").await.unwrap());
    let sent = server.transport.wait_for(1).await;
    assert_eq!(sent[0].1["type"], "Accept");
}

#[tokio::test]
async fn test_malformed_body_is_bad_request() {
    let server = TestServer::new().await;
    let peer = server.peer("a.example");

    let response = server.post_raw(&peer, b"{not json".to_vec()).await;
    assert_eq!(response.status(), 400);
}

#[tokio::test]
async fn test_unsigned_request_is_bad_request() {
    let server = TestServer::new().await;
    let peer = server.peer("a.example");

    let response = server
        .client
        .post(server.url("/inbox"))
        .header("Content-Type", "application/activity+json")
        .json(&peer.follow(PUBLIC, None))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 400);
}

#[tokio::test]
async fn test_key_of_another_actor_is_bad_request() {
    let server = TestServer::new().await;
    let a = server.peer("a.example");
    let b = server.peer("b.example");

    // Signed by b, claims to be from a.
    let response = server.post_signed(&b, &a.follow(PUBLIC, None)).await;
    assert_eq!(response.status(), 400);
}

#[tokio::test]
async fn test_unknown_actor_is_bad_request() {
    let server = TestServer::new().await;
    let ghost = RemotePeer::new("ghost.example");

    let response = server.post_signed(&ghost, &ghost.follow(PUBLIC, None)).await;
    assert_eq!(response.status(), 400);
}

#[tokio::test]
async fn test_tampered_body_is_bad_request() {
    let server = TestServer::new().await;
    let peer = server.peer("a.example");

    let url = server.url("/inbox");
    let signed_body = serde_json::to_vec(&peer.follow(PUBLIC, None)).unwrap();
    let headers =
        fedirelay::federation::sign_request("POST", &url, Some(&signed_body), &test_key(), &peer.key_id())
            .unwrap();
    let tampered: Value = peer.follow(&server.relay_id(), None);

    let response = server
        .client
        .post(&url)
        .header("Content-Type", "application/activity+json")
        .header("Date", headers.date)
        .header("Digest", headers.digest.unwrap())
        .header("Signature", headers.signature)
        .body(serde_json::to_vec(&tampered).unwrap())
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 400);
}

#[tokio::test]
async fn test_get_inbox_is_method_not_allowed() {
    let server = TestServer::new().await;

    let response = server.client.get(server.url("/inbox")).send().await.unwrap();
    assert_eq!(response.status(), 405);
}

fn test_key() -> String {
    // Any valid key works here: the digest check fails before the signature.
    fedirelay::federation::generate_key_pair(1024).unwrap().0
}
