mod common;

use common::spawn_server;
use reqwest::StatusCode;
use serde_json::{json, Value};

async fn error_code(resp: reqwest::Response) -> (StatusCode, String) {
    let status = resp.status();
    let body: Value = resp.json().await.unwrap();
    (status, body["error"].as_str().unwrap_or_default().to_string())
}

#[tokio::test]
async fn health_and_authentication() {
    let srv = spawn_server().await;
    let client = reqwest::Client::new();
    let resp = client.get(srv.url("/api/health")).send().await.unwrap();
    assert_eq!(resp.text().await.unwrap(), "ok");

    let resp = client.get(srv.url("/api/me")).send().await.unwrap();
    assert_eq!(
        error_code(resp).await,
        (StatusCode::UNAUTHORIZED, "unauthenticated".into())
    );
    let resp = client
        .get(srv.url("/api/me"))
        .bearer_auth("not-a-token")
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);

    let (id, token) = srv.user("alice").await;
    let me: Value = client
        .get(srv.url("/api/me"))
        .bearer_auth(&token)
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(me["id"], id.to_string());
    assert_eq!(me["username"], "alice");
    assert_eq!(me["favorites"], json!([]));

    let me: Value = client
        .get(srv.url(&format!("/api/me?token={}", token)))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(me["id"], id.to_string());
}

#[tokio::test]
async fn direct_chats_are_shared_and_soft_leave_revives() {
    let srv = spawn_server().await;
    let client = reqwest::Client::new();
    let (a, ta) = srv.user("alice").await;
    let (b, tb) = srv.user("bob").await;

    let first: Value = client
        .post(srv.url("/api/chats"))
        .bearer_auth(&ta)
        .json(&json!({ "participantIds": [b] }))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    let second: Value = client
        .post(srv.url("/api/chats"))
        .bearer_auth(&tb)
        .json(&json!({ "participantIds": [a], "isGroup": false }))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(first["id"], second["id"]);
    assert_eq!(first["isGroup"], false);
    let chat_id = first["id"].as_str().unwrap();

    let resp = client
        .post(srv.url(&format!("/api/chats/{}/leave", chat_id)))
        .bearer_auth(&ta)
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::NO_CONTENT);
    let list: Value = client
        .get(srv.url("/api/chats"))
        .bearer_auth(&ta)
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(list, json!([]));

    client
        .post(srv.url(&format!("/api/chats/{}/messages", chat_id)))
        .bearer_auth(&tb)
        .json(&json!({ "content": "still there?" }))
        .send()
        .await
        .unwrap();
    let list: Value = client
        .get(srv.url("/api/chats"))
        .bearer_auth(&ta)
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(list[0]["id"], chat_id);
    assert_eq!(list[0]["lastMessage"]["content"], "still there?");
    assert_eq!(list[0]["unreadCount"], 1);
    assert_eq!(list[0]["messageStatus"], "sent");
}

#[tokio::test]
async fn group_status_needs_every_reader() {
    let srv = spawn_server().await;
    let client = reqwest::Client::new();
    let (_a, ta) = srv.user("alice").await;
    let (b, tb) = srv.user("bob").await;
    let (c, tc) = srv.user("carol").await;

    let group: Value = client
        .post(srv.url("/api/chats"))
        .bearer_auth(&ta)
        .json(&json!({ "participantIds": [b, c], "isGroup": true, "name": "Trip" }))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    let chat_id = group["id"].as_str().unwrap();
    assert_eq!(group["participants"].as_array().unwrap().len(), 3);

    let msg: Value = client
        .post(srv.url(&format!("/api/chats/{}/messages", chat_id)))
        .bearer_auth(&ta)
        .json(&json!({ "content": "<b>hello</b> all" }))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(msg["content"], "hello all");
    let msg_id = msg["id"].as_str().unwrap();

    let status = |token: String| {
        let client = client.clone();
        let url = srv.url("/api/chats");
        async move {
            let list: Value = client
                .get(url)
                .bearer_auth(token)
                .send()
                .await
                .unwrap()
                .json()
                .await
                .unwrap();
            list[0].clone()
        }
    };

    // a sender cannot mark their own message
    let own: Value = client
        .post(srv.url(&format!("/api/messages/{}/delivered", msg_id)))
        .bearer_auth(&ta)
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(own["status"], "sent");

    for _ in 0..2 {
        let read: Value = client
            .post(srv.url(&format!("/api/messages/{}/read", msg_id)))
            .bearer_auth(&tb)
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(read["readBy"].as_array().unwrap().len(), 1);
    }
    assert_eq!(status(ta.clone()).await["messageStatus"], "delivered");
    assert_eq!(status(tb.clone()).await["unreadCount"], 0);
    assert_eq!(status(tc.clone()).await["unreadCount"], 1);

    client
        .post(srv.url(&format!("/api/messages/{}/read", msg_id)))
        .bearer_auth(&tc)
        .send()
        .await
        .unwrap();
    assert_eq!(status(ta.clone()).await["messageStatus"], "read");

    // a newer message starts over
    client
        .post(srv.url(&format!("/api/chats/{}/messages", chat_id)))
        .bearer_auth(&ta)
        .json(&json!({ "content": "next" }))
        .send()
        .await
        .unwrap();
    assert_eq!(status(ta).await["messageStatus"], "sent");
}

#[tokio::test]
async fn invalid_input_is_rejected_with_codes() {
    let srv = spawn_server().await;
    let client = reqwest::Client::new();
    let (_a, ta) = srv.user("alice").await;
    let (b, _tb) = srv.user("bob").await;
    let (c, _tc) = srv.user("carol").await;
    let chat: Value = client
        .post(srv.url("/api/chats"))
        .bearer_auth(&ta)
        .json(&json!({ "participantIds": [b] }))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    let messages = srv.url(&format!("/api/chats/{}/messages", chat["id"].as_str().unwrap()));

    let cases = [
        (json!({ "content": "   " }), "empty_message"),
        (json!({}), "empty_message"),
        (json!({ "content": "x".repeat(5001) }), "content_too_long"),
        (
            json!({ "attachment": { "url": "javascript:alert(1)", "kind": "image", "name": "a.png" } }),
            "invalid_attachment",
        ),
    ];
    for (body, code) in cases {
        let resp = client
            .post(&messages)
            .bearer_auth(&ta)
            .json(&body)
            .send()
            .await
            .unwrap();
        assert_eq!(error_code(resp).await, (StatusCode::BAD_REQUEST, code.into()));
    }

    let chats = [
        (json!({ "participantIds": [b, c] }), "invalid_participants"),
        (json!({ "participantIds": [] }), "invalid_participants"),
        (json!({ "participantIds": [b, c], "isGroup": true }), "group_name_required"),
        (
            json!({ "participantIds": [b, c], "isGroup": true, "name": "n".repeat(101) }),
            "name_too_long",
        ),
    ];
    for (body, code) in chats {
        let resp = client
            .post(srv.url("/api/chats"))
            .bearer_auth(&ta)
            .json(&body)
            .send()
            .await
            .unwrap();
        assert_eq!(error_code(resp).await, (StatusCode::BAD_REQUEST, code.into()));
    }

    let resp = client
        .get(srv.url("/api/users?search=a"))
        .bearer_auth(&ta)
        .send()
        .await
        .unwrap();
    assert_eq!(
        error_code(resp).await,
        (StatusCode::BAD_REQUEST, "search_too_short".into())
    );

    for path in [
        "/api/chats/nope/messages".to_string(),
        format!("/api/chats/{}/messages", uuid::Uuid::new_v4()),
        format!("/api/messages/{}/read", uuid::Uuid::new_v4()),
    ] {
        let resp = client
            .post(srv.url(&path))
            .bearer_auth(&ta)
            .json(&json!({ "content": "x" }))
            .send()
            .await
            .unwrap();
        assert_eq!(error_code(resp).await, (StatusCode::NOT_FOUND, "not_found".into()));
    }
}

#[tokio::test]
async fn messages_page_newest_first() {
    let srv = spawn_server().await;
    let client = reqwest::Client::new();
    let (_a, ta) = srv.user("alice").await;
    let (b, tb) = srv.user("bob").await;
    let (_c, tc) = srv.user("carol").await;
    let chat: Value = client
        .post(srv.url("/api/chats"))
        .bearer_auth(&ta)
        .json(&json!({ "participantIds": [b] }))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    let url = srv.url(&format!("/api/chats/{}/messages", chat["id"].as_str().unwrap()));
    for i in 0..5 {
        client
            .post(&url)
            .bearer_auth(&ta)
            .json(&json!({ "content": format!("m{}", i) }))
            .send()
            .await
            .unwrap();
    }
    let page: Value = client
        .get(format!("{}?limit=2", url))
        .bearer_auth(&tb)
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    let contents: Vec<&str> = page
        .as_array()
        .unwrap()
        .iter()
        .map(|m| m["content"].as_str().unwrap())
        .collect();
    assert_eq!(contents, vec!["m4", "m3"]);
    let page: Value = client
        .get(format!("{}?limit=2&offset=4", url))
        .bearer_auth(&tb)
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(page[0]["content"], "m0");
    assert_eq!(page.as_array().unwrap().len(), 1);

    let resp = client.get(&url).bearer_auth(&tc).send().await.unwrap();
    assert_eq!(resp.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn attachments_upload_and_download() {
    let srv = spawn_server().await;
    let client = reqwest::Client::new();
    let (_a, ta) = srv.user("alice").await;
    let (b, tb) = srv.user("bob").await;

    let part = reqwest::multipart::Part::bytes(b"hello file".to_vec())
        .file_name("notes.txt")
        .mime_str("text/plain")
        .unwrap();
    let form = reqwest::multipart::Form::new().part("file", part);
    let resp = client
        .post(srv.url("/api/files"))
        .bearer_auth(&ta)
        .multipart(form)
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::CREATED);
    let uploaded: Value = resp.json().await.unwrap();
    assert_eq!(uploaded["kind"], "file");
    assert_eq!(uploaded["originalName"], "notes.txt");
    let url = uploaded["url"].as_str().unwrap();
    assert!(url.starts_with("/api/files/"));

    let chat: Value = client
        .post(srv.url("/api/chats"))
        .bearer_auth(&ta)
        .json(&json!({ "participantIds": [b] }))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    let msg: Value = client
        .post(srv.url(&format!("/api/chats/{}/messages", chat["id"].as_str().unwrap())))
        .bearer_auth(&ta)
        .json(&json!({ "attachment": { "url": url, "kind": "file", "name": "notes.txt" } }))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert!(msg["content"].is_null());
    assert_eq!(msg["attachment"]["url"], url);

    let resp = client.get(srv.url(url)).bearer_auth(&tb).send().await.unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    assert_eq!(resp.headers()["content-type"], "text/plain");
    assert_eq!(resp.bytes().await.unwrap().as_ref(), b"hello file");
}

#[tokio::test]
async fn profile_search_and_favorites() {
    let srv = spawn_server().await;
    let client = reqwest::Client::new();
    let (a, ta) = srv.user("alice").await;
    let (b, tb) = srv.user("bob").await;

    let found: Value = client
        .get(srv.url("/api/users?search=BO"))
        .bearer_auth(&ta)
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(found[0]["id"], b.to_string());
    assert_eq!(found.as_array().unwrap().len(), 1);

    let resp = client
        .patch(srv.url("/api/me"))
        .bearer_auth(&tb)
        .json(&json!({ "username": "alice" }))
        .send()
        .await
        .unwrap();
    assert_eq!(
        error_code(resp).await,
        (StatusCode::BAD_REQUEST, "username_taken".into())
    );
    let updated: Value = client
        .patch(srv.url("/api/me"))
        .bearer_auth(&tb)
        .json(&json!({ "username": "robert", "avatarUrl": "https://img.example/r.png" }))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(updated["username"], "robert");
    assert_eq!(updated["avatarUrl"], "https://img.example/r.png");

    let chat: Value = client
        .post(srv.url("/api/chats"))
        .bearer_auth(&ta)
        .json(&json!({ "participantIds": [b] }))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    let chat_id = chat["id"].as_str().unwrap();
    let profile: Value = client
        .post(srv.url(&format!("/api/chats/{}/favorite", chat_id)))
        .bearer_auth(&ta)
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(profile["id"], a.to_string());
    assert_eq!(profile["favorites"], json!([chat_id]));
    let list: Value = client
        .get(srv.url("/api/chats"))
        .bearer_auth(&ta)
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(list[0]["favorite"], true);
}
