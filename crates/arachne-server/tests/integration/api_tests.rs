use axum::Router;
use axum::body::Body;
use axum::http::{Request, StatusCode};
use http_body_util::BodyExt;
use tower::ServiceExt;

use arachne_client::FixtureReply;

use crate::integration::common::{
    DEMO_PACK_URL, TEST_ADMIN_TOKEN, rule_pack, setup_test_app, setup_test_app_no_auth,
};

async fn send(router: &Router, request: Request<Body>) -> (StatusCode, serde_json::Value) {
    let response = router.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let body = response.into_body().collect().await.unwrap().to_bytes();
    let json = if body.is_empty() {
        serde_json::Value::Null
    } else {
        serde_json::from_slice(&body).unwrap()
    };
    (status, json)
}

fn get(uri: &str) -> Request<Body> {
    Request::get(uri).body(Body::empty()).unwrap()
}

fn admin(builder: axum::http::request::Builder) -> axum::http::request::Builder {
    builder.header("authorization", format!("Bearer {TEST_ADMIN_TOKEN}"))
}

fn json_body(value: serde_json::Value) -> Body {
    Body::from(serde_json::to_vec(&value).unwrap())
}

#[tokio::test]
async fn health_returns_200() {
    let app = setup_test_app().await;

    let (status, json) = send(&app.router, get("/health")).await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["status"], "healthy");
    assert_eq!(json["plugins"], 2);
}

#[tokio::test]
async fn list_plugins_is_public() {
    let app = setup_test_app().await;

    let (status, json) = send(&app.router, get("/v1/plugins")).await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["total"], 2);
    assert_eq!(json["plugins"][0]["key"], "demo");
    assert_eq!(json["plugins"][0]["version"], "1.0.0");
    assert_eq!(json["plugins"][0]["safety"], "safe");
}

#[tokio::test]
async fn search_isolates_failing_resolver() {
    let app = setup_test_app().await;

    let (status, json) = send(&app.router, get("/v1/search?keyword=earth")).await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["progress"]["total"], 2);
    assert_eq!(json["progress"]["succeeded"], 1);
    assert_eq!(json["progress"]["failed"], 1);

    let results = json["results"].as_array().unwrap();
    let demo = results.iter().find(|r| r["resolver_key"] == "demo").unwrap();
    assert_eq!(demo["items"].as_array().unwrap().len(), 2);
    assert_eq!(demo["items"][0]["name"], "Wandering Earth");
    let slow = results.iter().find(|r| r["resolver_key"] == "slow").unwrap();
    assert_eq!(slow["success"], false);
    assert!(slow["error"].is_string());
}

#[tokio::test]
async fn search_restricted_to_resolvers() {
    let app = setup_test_app().await;

    let (status, json) = send(&app.router, get("/v1/search?keyword=earth&resolvers=demo")).await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["resolvers"], serde_json::json!(["demo"]));
    assert_eq!(json["progress"]["succeeded"], 1);
}

#[tokio::test]
async fn search_rejects_empty_keyword() {
    let app = setup_test_app().await;

    let (status, json) = send(&app.router, get("/v1/search?keyword=%20")).await;

    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(json["error"], "bad_request");
}

#[tokio::test]
async fn search_stream_emits_ndjson_lines() {
    let app = setup_test_app().await;

    let response = app
        .router
        .clone()
        .oneshot(get("/v1/search/stream?keyword=earth"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        response.headers()["content-type"],
        "application/x-ndjson"
    );

    let body = response.into_body().collect().await.unwrap().to_bytes();
    let lines: Vec<serde_json::Value> = String::from_utf8(body.to_vec())
        .unwrap()
        .lines()
        .map(|l| serde_json::from_str(l).unwrap())
        .collect();

    assert_eq!(lines.len(), 3);
    assert_eq!(lines[0]["type"], "result");
    assert_eq!(lines[1]["type"], "result");
    assert_eq!(lines[2]["type"], "summary");
    assert_eq!(lines[2]["progress"]["completed"], 2);
}

#[tokio::test]
async fn home_returns_categories() {
    let app = setup_test_app().await;

    let (status, json) = send(&app.router, get("/v1/resolvers/demo/home")).await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["categories"][0]["type_name"], "Movies");
}

#[tokio::test]
async fn category_passes_filters_and_page() {
    let app = setup_test_app().await;

    let (status, json) = send(
        &app.router,
        get("/v1/resolvers/demo/category/1?page=2&year=2019"),
    )
    .await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["page"], 2);
    assert_eq!(json["items"].as_array().unwrap().len(), 2);
}

#[tokio::test]
async fn category_rejects_bad_page() {
    let app = setup_test_app().await;

    let (status, _) = send(&app.router, get("/v1/resolvers/demo/category/1?page=two")).await;

    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn detail_then_play() {
    let app = setup_test_app().await;

    let (status, json) = send(
        &app.router,
        Request::post("/v1/resolvers/demo/detail")
            .header("content-type", "application/json")
            .body(json_body(serde_json::json!({"ids": ["/v/7.html"]})))
            .unwrap(),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let detail = &json["details"][0];
    assert_eq!(detail["name"], "Wandering Earth");
    assert_eq!(detail["playlists"][0]["flag"], "Line 1");
    let episode_id = detail["playlists"][0]["episodes"][0]["id"]
        .as_str()
        .unwrap()
        .to_string();

    let (status, json) = send(
        &app.router,
        Request::post("/v1/resolvers/demo/play")
            .header("content-type", "application/json")
            .body(json_body(serde_json::json!({"flag": "Line 1", "id": episode_id})))
            .unwrap(),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["url"], "https://demo.example/play/7-1-1.html");
    assert_eq!(json["parse"], true);
}

#[tokio::test]
async fn unknown_resolver_returns_404() {
    let app = setup_test_app().await;

    let (status, json) = send(&app.router, get("/v1/resolvers/nope/home")).await;

    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(json["error"], "not_found");
}

#[tokio::test]
async fn admin_without_token_returns_401() {
    let app = setup_test_app().await;

    let (status, json) = send(&app.router, get("/v1/admin/status")).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(json["error"], "unauthorized");

    let (status, _) = send(
        &app.router,
        Request::get("/v1/admin/status")
            .header("authorization", "Bearer wrong-token")
            .body(Body::empty())
            .unwrap(),
    )
    .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn no_admin_token_returns_403() {
    let app = setup_test_app_no_auth().await;

    let (status, json) = send(
        &app.router,
        Request::get("/v1/admin/status")
            .header("authorization", "Bearer any-token")
            .body(Body::empty())
            .unwrap(),
    )
    .await;

    assert_eq!(status, StatusCode::FORBIDDEN);
    assert_eq!(json["error"], "forbidden");
}

#[tokio::test]
async fn admin_status_reports_components() {
    let app = setup_test_app().await;

    let (status, json) = send(
        &app.router,
        admin(Request::get("/v1/admin/status")).body(Body::empty()).unwrap(),
    )
    .await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["loaded"], 2);
    assert_eq!(json["in_flight"], 0);
    assert!(json["pool"]["max_size"].as_u64().unwrap() > 0);
}

#[tokio::test]
async fn load_plugin_verifies_checksum() {
    let app = setup_test_app().await;
    let pack = serde_json::to_vec(&rule_pack("extra", "https://extra.example")).unwrap();
    app.transport
        .insert("https://packs.example/extra.json", FixtureReply::ok(pack.clone()));

    let wrong = "0".repeat(64);
    let (status, json) = send(
        &app.router,
        admin(Request::post("/v1/plugins"))
            .header("content-type", "application/json")
            .body(json_body(serde_json::json!({
                "key": "extra",
                "source": format!("https://packs.example/extra.json;sha256;{wrong}")
            })))
            .unwrap(),
    )
    .await;
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
    assert_eq!(json["error"], "load_error");

    let (status, json) = send(
        &app.router,
        admin(Request::post("/v1/plugins"))
            .header("content-type", "application/json")
            .body(json_body(serde_json::json!({
                "key": "extra",
                "uri": "https://packs.example/extra.json",
                "checksum": arachne_core::compute_bytes_hash(&pack),
                "searchable": false
            })))
            .unwrap(),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(json["key"], "extra");
    assert_eq!(json["searchable"], false);
}

#[tokio::test]
async fn load_plugin_requires_uri_or_source() {
    let app = setup_test_app().await;

    let (status, _) = send(
        &app.router,
        admin(Request::post("/v1/plugins"))
            .header("content-type", "application/json")
            .body(json_body(serde_json::json!({"key": "x"})))
            .unwrap(),
    )
    .await;

    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn unload_plugin_then_404() {
    let app = setup_test_app().await;

    let delete = || {
        admin(Request::delete("/v1/plugins/slow"))
            .body(Body::empty())
            .unwrap()
    };
    let (status, _) = send(&app.router, delete()).await;
    assert_eq!(status, StatusCode::NO_CONTENT);

    let (status, json) = send(&app.router, delete()).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(json["error"], "not_found");
    assert_eq!(app.state.hub.plugins().len(), 1);
}

#[tokio::test]
async fn update_check_and_apply() {
    let app = setup_test_app().await;
    let uri = "/v1/plugins/demo/update";

    let (status, json) = send(&app.router, admin(Request::get(uri)).body(Body::empty()).unwrap()).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["update_available"], false);

    let mut pack = rule_pack("demo", "https://demo.example");
    pack["version"] = "2.0.0".into();
    app.transport
        .insert(DEMO_PACK_URL, FixtureReply::ok(serde_json::to_vec(&pack).unwrap()));

    let (status, json) = send(&app.router, admin(Request::get(uri)).body(Body::empty()).unwrap()).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["update_available"], true);

    let (status, json) = send(&app.router, admin(Request::post(uri)).body(Body::empty()).unwrap()).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["version"], "2.0.0");
}

#[tokio::test]
async fn probe_reports_each_capability() {
    let app = setup_test_app().await;

    let (status, json) = send(
        &app.router,
        admin(Request::get("/v1/plugins/demo/probe?keyword=earth"))
            .body(Body::empty())
            .unwrap(),
    )
    .await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["healthy"], true);
    let checks = json["checks"].as_array().unwrap();
    assert_eq!(checks.len(), 2);
    assert_eq!(checks[1]["capability"], "search");
    assert_eq!(checks[1]["items"], 2);
}

#[tokio::test]
async fn clear_cache_returns_204() {
    let app = setup_test_app().await;
    send(&app.router, get("/v1/resolvers/demo/home")).await;

    let (status, _) = send(
        &app.router,
        admin(Request::delete("/v1/admin/cache")).body(Body::empty()).unwrap(),
    )
    .await;

    assert_eq!(status, StatusCode::NO_CONTENT);
    assert_eq!(app.state.hub.cache_stats().await.memory.entries, 0);
}
