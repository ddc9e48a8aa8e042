use std::sync::Arc;

use axum::Router;
use tempfile::TempDir;

use arachne_client::{FixtureReply, FixtureTransport, HttpClient, rule_hub};
use arachne_core::config::ArachneConfig;
use arachne_core::plugin::PackageSpec;
use arachne_core::retry::RetryPolicy;
use arachne_server::routes;
use arachne_server::state::AppState;

pub const TEST_ADMIN_TOKEN: &str = "test-admin-token";
pub const DEMO_PACK_URL: &str = "https://packs.example/demo.json";
pub const SLOW_PACK_URL: &str = "https://packs.example/slow.json";

const SEARCH_HTML: &str = r#"
    <div class="result"><a class="t" href="/v/7.html">Wandering Earth</a><em>2019</em></div>
    <div class="result"><a class="t" href="/v/8.html">Wandering Earth II</a><em>2023</em></div>"#;

const DETAIL_HTML: &str = r#"
    <h1>Wandering Earth</h1>
    <div class="from"><b>Line 1</b></div>
    <ul class="plist"><li><a href="/play/7-1-1.html">EP1</a></li></ul>"#;

pub struct TestApp {
    pub router: Router,
    pub state: Arc<AppState>,
    pub transport: FixtureTransport,
    _data_dir: TempDir,
}

pub fn rule_pack(key: &str, site: &str) -> serde_json::Value {
    serde_json::json!({
        "key": key,
        "name": format!("{key} site"),
        "version": "1.0.0",
        "site": site,
        "categories": [{"type_id": "1", "type_name": "Movies"}],
        "category": {
            "url": "{site}/list/{tid}-{page}.html?year={year}",
            "list": ".result",
            "id": "a.t@href",
            "name": "a.t"
        },
        "search": {
            "url": "{site}/search?wd={keyword}",
            "list": ".result",
            "id": "a.t@href",
            "name": "a.t",
            "remark": "em"
        },
        "detail": {
            "url": "{site}{id}",
            "name": "h1",
            "playlist": {"flags": ".from b", "groups": "ul.plist", "episode": "li a"}
        },
        "player": {"parse": true}
    })
}

pub async fn setup_test_app() -> TestApp {
    setup(Some(TEST_ADMIN_TOKEN.to_string())).await
}

pub async fn setup_test_app_no_auth() -> TestApp {
    setup(None).await
}

/// A hub with two rule-pack resolvers over canned pages: `demo` answers
/// everything, `slow` times out on search.
async fn setup(admin_token: Option<String>) -> TestApp {
    let data_dir = tempfile::tempdir().unwrap();
    let transport = FixtureTransport::new();

    transport.insert(
        DEMO_PACK_URL,
        FixtureReply::ok(serde_json::to_vec(&rule_pack("demo", "https://demo.example")).unwrap()),
    );
    transport.insert(
        SLOW_PACK_URL,
        FixtureReply::ok(serde_json::to_vec(&rule_pack("slow", "https://slow.example")).unwrap()),
    );
    transport.insert("https://demo.example/search?wd=earth", FixtureReply::ok(SEARCH_HTML));
    transport.insert(
        "https://demo.example/list/1-2.html?year=2019",
        FixtureReply::ok(SEARCH_HTML),
    );
    transport.insert("https://demo.example/v/7.html", FixtureReply::ok(DETAIL_HTML));
    transport.insert("https://slow.example/search?wd=earth", FixtureReply::Timeout);

    let client = HttpClient::builder()
        .retry(RetryPolicy::none())
        .transport(transport.clone())
        .build()
        .unwrap();
    let config = ArachneConfig {
        data_dir: data_dir.path().to_path_buf(),
        retry_count: 0,
        ..ArachneConfig::default()
    };
    let hub = rule_hub(config, client).await.unwrap();
    hub.load_plugin(PackageSpec::new("demo", DEMO_PACK_URL))
        .await
        .unwrap();
    hub.load_plugin(PackageSpec::new("slow", SLOW_PACK_URL))
        .await
        .unwrap();

    let state = Arc::new(AppState { hub, admin_token });
    TestApp {
        router: routes::router(state.clone()),
        state,
        transport,
        _data_dir: data_dir,
    }
}
