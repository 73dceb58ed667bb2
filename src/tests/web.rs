use std::{sync::Arc, time::Duration};

use axum::{
    body::Body,
    http::{Request, StatusCode},
    Router,
};
use http_body_util::BodyExt;
use serde_json::Value;
use tower::ServiceExt;

use crate::app::{
    service::{IndexService, ServiceOptions},
    task_runner::StartOutcome,
};
use crate::lock::LockOptions;
use crate::web;

use super::support::Fixture;

fn create_app(names: &[&str]) -> (Router, Arc<IndexService>, Fixture) {
    let fixture = Fixture::new();
    for name in names {
        fixture.put(name, 1);
    }

    let options = ServiceOptions {
        read_timeout: Duration::from_millis(10),
        write_timeout: Duration::from_millis(10),
        ..ServiceOptions::default()
    };
    let service = Arc::new(IndexService::new(fixture.reconciler.clone(), options));
    assert_eq!(service.start_init(), StartOutcome::Started);
    service.join();

    let router = web::router(service.clone(), fixture.tmp.path().join("images"));
    (router, service, fixture)
}

async fn send(router: Router, request: Request<Body>) -> (StatusCode, Value) {
    let response = router.oneshot(request).await.unwrap();
    let status = response.status();
    let body = response.into_body().collect().await.unwrap().to_bytes();
    (status, serde_json::from_slice(&body).unwrap())
}

fn get(uri: &str) -> Request<Body> {
    Request::get(uri).body(Body::empty()).unwrap()
}

#[tokio::test(flavor = "multi_thread")]
async fn test_text_search() {
    let (router, _service, _fixture) = create_app(&["a.jpg", "b.jpg"]);

    let (status, body) = send(router, get("/api/search?q=b.jpg")).await;
    assert_eq!(status, StatusCode::OK);

    let hits = body.as_array().unwrap();
    assert_eq!(hits.len(), 2);
    assert_eq!(hits[0]["rank"], 1);
    assert_eq!(hits[0]["id"], 2);
    assert_eq!(hits[0]["path"], "b.jpg");
}

#[tokio::test(flavor = "multi_thread")]
async fn test_image_upload_then_tag_pages() {
    let (router, service, _fixture) = create_app(&["a.jpg", "b.jpg"]);
    let session = service.new_session().to_string();

    let request = Request::post(format!("/api/search/img?session={session}"))
        .body(Body::from("a.jpg"))
        .unwrap();
    let (status, body) = send(router.clone(), request).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["results"][0]["path"], "a.jpg");

    let tag = body["tag"].as_str().unwrap();
    let (status, body) = send(
        router.clone(),
        get(&format!("/api/search/img/{tag}?session={session}&page=1")),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body[0]["path"], "a.jpg");

    let (status, _) = send(router, get(&format!("/api/search/img/{tag}?session=other"))).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_corrupt_upload_is_rejected() {
    let (router, _service, _fixture) = create_app(&["a.jpg"]);

    let request = Request::post("/api/search/img?session=s")
        .body(Body::from("corrupt bytes"))
        .unwrap();
    let (status, body) = send(router, request).await;
    assert_eq!(status, StatusCode::UNSUPPORTED_MEDIA_TYPE);
    assert!(body["error"].is_string());
}

#[tokio::test(flavor = "multi_thread")]
async fn test_search_by_id() {
    let (router, _service, _fixture) = create_app(&["a.jpg", "b.jpg"]);

    let (status, body) = send(router.clone(), get("/api/search/id/1")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body[0]["path"], "a.jpg");
    assert_eq!(body[0]["distance"], 0.0);

    let (status, _) = send(router, get("/api/search/id/99")).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_progress_status_and_session() {
    let (router, _service, _fixture) = create_app(&["a.jpg"]);

    let (status, body) = send(router.clone(), get("/api/progress_status")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["progress"], 1.0);
    assert_eq!(body["state"], "Done");
    assert_eq!(body["title"], "Building index");

    let (status, body) = send(router, get("/api/session_id")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["session_id"].as_str().unwrap().len(), 26);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_busy_while_write_locked() {
    let (router, service, _fixture) = create_app(&["a.jpg"]);

    let guard = service.lock().acquire(LockOptions::write(None)).unwrap();

    let (status, body) = send(router.clone(), get("/api/search?q=a")).await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(body["busy"], true);

    let request = Request::post("/api/db_refresh").body(Body::empty()).unwrap();
    let (status, _) = send(router.clone(), request).await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);

    drop(guard);
    let request = Request::post("/api/db_refresh").body(Body::empty()).unwrap();
    let (status, body) = send(router, request).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["started"], true);
    service.join();
}

#[tokio::test(flavor = "multi_thread")]
async fn test_classification() {
    let (router, _service, _fixture) = create_app(&["a.jpg"]);

    let request = Request::post("/api/classification?labels=dog%0Acat")
        .body(Body::from("cat"))
        .unwrap();
    let (status, body) = send(router.clone(), request).await;
    assert_eq!(status, StatusCode::OK);

    let scores = body.as_array().unwrap();
    assert_eq!(scores.len(), 2);
    assert_eq!(scores[0]["label"], "dog");
    assert_eq!(scores[1]["label"], "cat");
    let probability = |i: usize| scores[i]["probability"].as_f64().unwrap();
    assert!(probability(1) > probability(0));

    let request = Request::post("/api/classification?labels=%0A")
        .body(Body::from("cat"))
        .unwrap();
    let (status, body) = send(router.clone(), request).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body["error"].is_string());

    let request = Request::post("/api/classification?labels=cat")
        .body(Body::from("corrupt bytes"))
        .unwrap();
    let (status, _) = send(router, request).await;
    assert_eq!(status, StatusCode::UNSUPPORTED_MEDIA_TYPE);
}
