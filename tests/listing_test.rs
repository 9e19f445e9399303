//! File listing tests

mod common;

use axum::body::{Body, Bytes};
use axum::http::Request;
use common::{json_body, metadata_header, TestApp};
use tusgate::storage::ObjectStore;

async fn list(app: &TestApp) -> Vec<serde_json::Value> {
    let response = app
        .send(Request::get("/uploads/").body(Body::empty()).unwrap())
        .await;
    assert_eq!(response.status().as_u16(), 200);
    json_body(response).await.as_array().unwrap().clone()
}

#[tokio::test]
async fn test_listing_resolves_display_name() {
    let app = TestApp::new();
    app.store
        .put_blob("song.bin", Bytes::from_static(b"not really audio"))
        .await
        .unwrap();
    app.store
        .put_blob(
            "song.bin.info",
            Bytes::from_static(br#"{"MetaData":{"filename":"My Song.mp3"}}"#),
        )
        .await
        .unwrap();

    let entries = list(&app).await;
    assert_eq!(entries.len(), 1, "{:?}", entries);
    assert_eq!(entries[0]["key"], "song.bin");
    assert_eq!(entries[0]["name"], "My Song.mp3");
    assert_eq!(entries[0]["size"], 16);
    assert_eq!(entries[0]["url"], "song.bin");
}

#[tokio::test]
async fn test_listing_excludes_bookkeeping_and_falls_back_to_key() {
    let app = TestApp::new();
    let md = metadata_header(&[("filename", "report.pdf")]);
    let done = app.create(9, Some(&md)).await;
    app.patch(&done, 0, b"completed").await;

    // Incomplete: only an info record and a pending tail exist
    let open = app.create(20, Some(&md)).await;
    app.patch(&open, 0, b"tail").await;

    app.store
        .put_blob("orphan", Bytes::from_static(b"xyz"))
        .await
        .unwrap();
    app.store
        .put_blob("broken", Bytes::from_static(b"abc"))
        .await
        .unwrap();
    app.store
        .put_blob("broken.info", Bytes::from_static(b"{not json"))
        .await
        .unwrap();

    let entries = list(&app).await;
    let names: Vec<(&str, &str)> = entries
        .iter()
        .map(|e| (e["key"].as_str().unwrap(), e["name"].as_str().unwrap()))
        .collect();
    let done_id = done.rsplit('/').next().unwrap();
    assert_eq!(names.len(), 3, "{:?}", names);
    assert!(names.contains(&(done_id, "report.pdf")));
    assert!(names.contains(&("orphan", "orphan")));
    assert!(names.contains(&("broken", "broken")));
    assert!(entries
        .iter()
        .all(|e| !e["key"].as_str().unwrap().ends_with(".info")
            && !e["key"].as_str().unwrap().ends_with(".part")));
}

#[tokio::test]
async fn test_listing_urls_use_public_base() {
    let app = TestApp::with_config(|c| {
        c.public_base_url = Some("https://cdn.example.com/files/".to_string())
    });
    app.store
        .put_blob("a.txt", Bytes::from_static(b"a"))
        .await
        .unwrap();
    let entries = list(&app).await;
    assert_eq!(entries[0]["url"], "https://cdn.example.com/files/a.txt");
}
