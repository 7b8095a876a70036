use std::sync::Arc;
use std::time::Duration;

use agrismart::app_state::{AppState, UiEvent};
use agrismart::gemini::{GeminiClient, GeminiConfig};
use agrismart::web_server::router;
use axum::http::StatusCode;
use axum_test::TestServer;
use serde_json::{json, Value};
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

const MODEL: &str = "test-model";
const PNG_DATA_URL: &str = "data:image/png;base64,iVBORw0KGgo=";

struct Harness {
    server: TestServer,
    app: AppState,
    provider: MockServer,
}

async fn harness() -> Harness {
    let provider = MockServer::start().await;
    let client = GeminiClient::new(GeminiConfig {
        api_key: "test-key".to_string(),
        base_url: provider.uri(),
        model: MODEL.to_string(),
    })
    .expect("client with api key");
    let app = AppState::new(Arc::new(client));
    let server = TestServer::new(router(app.clone(), MODEL)).expect("test server");
    Harness {
        server,
        app,
        provider,
    }
}

async fn mount_generate(provider: &MockServer, template: ResponseTemplate) {
    Mock::given(method("POST"))
        .and(path(format!("/v1beta/models/{}:generateContent", MODEL)))
        .respond_with(template)
        .mount(provider)
        .await;
}

fn text_reply(text: &str) -> Value {
    json!({ "candidates": [{ "content": { "role": "model", "parts": [{ "text": text }] } }] })
}

async fn wait_until_idle(server: &TestServer) -> Value {
    for _ in 0..100 {
        let state: Value = server.get("/api/state").await.json();
        if state["chat_status"] == "idle" {
            return state;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("chat never settled");
}

#[tokio::test]
async fn test_index_renders_navigation() {
    let h = harness().await;
    let response = h.server.get("/").await;
    response.assert_status_ok();
    let page = response.text();
    assert!(page.contains("AgriSmart AI"));
    assert!(page.contains("plant-diagnosis"));
    assert!(page.contains("Market Insights"));
    assert!(page.contains(MODEL));
}

#[tokio::test]
async fn test_dashboard_reports_weekly_totals() {
    let h = harness().await;
    let overview: Value = h.server.get("/api/dashboard").await.json();
    assert_eq!(overview["forecast"].as_array().map(Vec::len), Some(7));
    assert_eq!(overview["total_rainfall_mm"], 52.0);
    assert_eq!(overview["alerts"][0]["severity"], "critical");
}

#[tokio::test]
async fn test_initial_state_has_greeting_and_defaults() {
    let h = harness().await;
    let state: Value = h.server.get("/api/state").await.json();
    assert_eq!(state["view"], "overview");
    assert_eq!(state["chat_status"], "idle");
    assert_eq!(state["transcript"].as_array().map(Vec::len), Some(1));
    assert_eq!(state["transcript"][0]["origin"], "assistant");
    assert_eq!(state["diagnosis"]["phase"], "empty");
    assert_eq!(state["market"]["phase"], "idle");
    assert_eq!(state["market"]["query"], "corn and wheat prices");
}

#[tokio::test]
async fn test_view_selection_is_remembered() {
    let h = harness().await;
    h.server
        .post("/api/view")
        .json(&json!({ "view": "market" }))
        .await
        .assert_status_ok();
    let state: Value = h.server.get("/api/state").await.json();
    assert_eq!(state["view"], "market");
}

#[tokio::test]
async fn test_blank_chat_message_is_rejected() {
    let h = harness().await;
    h.server
        .post("/api/chat")
        .json(&json!({ "message": "   " }))
        .await
        .assert_status(StatusCode::BAD_REQUEST);
    let state: Value = h.server.get("/api/state").await.json();
    assert_eq!(state["transcript"].as_array().map(Vec::len), Some(1));
}

#[test_log::test(tokio::test)]
async fn test_chat_reply_streams_to_subscribers() {
    let h = harness().await;
    let sse = concat!(
        "data: {\"candidates\":[{\"content\":{\"parts\":[{\"text\":\"Spray \"}]}}]}\n\n",
        "data: {\"candidates\":[{\"content\":{\"parts\":[{\"text\":\"neem oil.\"}]}}]}\n\n",
    );
    Mock::given(method("POST"))
        .and(path(format!("/v1beta/models/{}:streamGenerateContent", MODEL)))
        .respond_with(ResponseTemplate::new(200).set_body_raw(sse, "text/event-stream"))
        .mount(&h.provider)
        .await;
    let mut events = h.app.subscribe();

    let response = h
        .server
        .post("/api/chat")
        .json(&json!({ "message": "Aphids on my tomatoes" }))
        .await;
    response.assert_status(StatusCode::ACCEPTED);
    let reply_id = response.json::<Value>()["reply_id"].clone();

    let state = wait_until_idle(&h.server).await;
    let transcript = state["transcript"].as_array().expect("transcript");
    assert_eq!(transcript.len(), 3);
    assert_eq!(transcript[1]["origin"], "operator");
    assert_eq!(transcript[1]["text"], "Aphids on my tomatoes");
    assert_eq!(transcript[2]["id"], reply_id);
    assert_eq!(transcript[2]["text"], "Spray neem oil.");
    assert_eq!(transcript[2]["failed"], false);

    let mut fragments = Vec::new();
    while let Ok(event) = events.try_recv() {
        if let UiEvent::ChatFragment { fragment, .. } = event {
            fragments.push(fragment);
        }
    }
    assert_eq!(fragments, vec!["Spray ", "neem oil."]);
}

#[tokio::test]
async fn test_failed_chat_shows_apology_and_recovers() {
    let h = harness().await;
    Mock::given(method("POST"))
        .and(path(format!("/v1beta/models/{}:streamGenerateContent", MODEL)))
        .respond_with(ResponseTemplate::new(503))
        .mount(&h.provider)
        .await;

    h.server
        .post("/api/chat")
        .json(&json!({ "message": "Hello?" }))
        .await
        .assert_status(StatusCode::ACCEPTED);

    let state = wait_until_idle(&h.server).await;
    let last = &state["transcript"][2];
    assert_eq!(last["failed"], true);
    assert_eq!(
        last["text"],
        "I'm having trouble connecting to the network. Please try again."
    );

    let cleared: Value = h.server.post("/api/chat/clear").await.json();
    assert_eq!(cleared.as_array().map(Vec::len), Some(1));
}

#[test_log::test(tokio::test)]
async fn test_diagnosis_flow() {
    let h = harness().await;
    mount_generate(
        &h.provider,
        ResponseTemplate::new(200).set_body_json(text_reply(
            r#"{"diagnosis":"Powdery Mildew","confidence":"Medium","description":"White powder on leaves.","treatment":"Apply sulfur."}"#,
        )),
    )
    .await;

    h.server
        .post("/api/diagnosis/analyze")
        .await
        .assert_status(StatusCode::CONFLICT);

    h.server
        .post("/api/diagnosis/image")
        .json(&json!({ "image": "not a data url" }))
        .await
        .assert_status(StatusCode::BAD_REQUEST);

    let selected: Value = h
        .server
        .post("/api/diagnosis/image")
        .json(&json!({ "image": PNG_DATA_URL }))
        .await
        .json();
    assert_eq!(selected["phase"], "image-selected");
    assert_eq!(selected["image"], PNG_DATA_URL);
    assert!(selected["healthy"].is_null());

    let analyzed = h.server.post("/api/diagnosis/analyze").await;
    analyzed.assert_status_ok();
    let analyzed: Value = analyzed.json();
    assert_eq!(analyzed["phase"], "complete");
    assert_eq!(analyzed["result"]["diagnosis"], "Powdery Mildew");
    assert_eq!(analyzed["result"]["observation"], "White powder on leaves.");
    assert_eq!(analyzed["healthy"], false);
    assert_eq!(analyzed["high_confidence"], false);

    let reset: Value = h.server.post("/api/diagnosis/reset").await.json();
    assert_eq!(reset["phase"], "empty");
    assert!(reset["result"].is_null());
}

#[tokio::test]
async fn test_diagnosis_failure_keeps_image() {
    let h = harness().await;
    mount_generate(&h.provider, ResponseTemplate::new(500)).await;

    h.server
        .post("/api/diagnosis/image")
        .json(&json!({ "image": PNG_DATA_URL }))
        .await
        .assert_status_ok();
    let response = h.server.post("/api/diagnosis/analyze").await;
    response.assert_status(StatusCode::BAD_GATEWAY);
    assert_eq!(
        response.json::<Value>()["error"],
        "Failed to analyze image. Please try again."
    );

    let state: Value = h.server.get("/api/state").await.json();
    assert_eq!(state["diagnosis"]["phase"], "image-selected");
    assert!(state["diagnosis"]["result"].is_null());
}

#[tokio::test]
async fn test_market_query_returns_grounded_insight() {
    let h = harness().await;
    mount_generate(
        &h.provider,
        ResponseTemplate::new(200).set_body_json(json!({
            "candidates": [{
                "content": { "parts": [{ "text": "Wheat is up 2%." }] },
                "groundingMetadata": { "groundingChunks": [
                    { "web": { "uri": "https://a.example", "title": "A" } },
                    { "web": { "uri": "https://b.example", "title": "B" } }
                ] }
            }]
        })),
    )
    .await;

    h.server
        .post("/api/market")
        .json(&json!({ "query": "  " }))
        .await
        .assert_status(StatusCode::BAD_REQUEST);

    let market: Value = h
        .server
        .post("/api/market")
        .json(&json!({ "query": " wheat futures " }))
        .await
        .json();
    assert_eq!(market["phase"], "complete");
    assert_eq!(market["query"], "wheat futures");
    assert_eq!(market["insight"]["content"], "Wheat is up 2%.");
    assert_eq!(market["insight"]["sources"][0]["title"], "A");
    assert_eq!(market["insight"]["sources"][1]["title"], "B");
}

#[tokio::test]
async fn test_market_failure_is_a_bad_gateway() {
    let h = harness().await;
    mount_generate(&h.provider, ResponseTemplate::new(500)).await;

    let response = h
        .server
        .post("/api/market")
        .json(&json!({ "query": "rice" }))
        .await;
    response.assert_status(StatusCode::BAD_GATEWAY);
    assert_eq!(
        response.json::<Value>()["error"],
        "Failed to fetch market insights."
    );
    let state: Value = h.server.get("/api/state").await.json();
    assert_eq!(state["market"]["phase"], "idle");
}

#[tokio::test]
async fn test_static_assets_are_served() {
    let h = harness().await;
    h.server.get("/static/app.js").await.assert_status_ok();
    h.server
        .get("/static/missing.js")
        .await
        .assert_status(StatusCode::NOT_FOUND);
}
