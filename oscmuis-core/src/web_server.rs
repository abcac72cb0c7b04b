use crate::network::{ConnectOutcome, NetworkModeController, ScanPhase, ScanPoll};
use crate::osc::OscDispatcher;
use crate::portal::Portal;
use crate::structs::{ConnectionRequest, OscSettingsRequest};
use axum::{
    extract::{rejection::FormRejection, State},
    http::{header, StatusCode},
    response::{Html, IntoResponse, Response},
    routing::{get, post},
    Form, Json, Router,
};
use serde_json::json;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;

// The shared state for our web server.
pub type WebServerState = State<Arc<AppState>>;

pub struct AppState {
    pub controller: Arc<NetworkModeController>,
    pub dispatcher: Arc<OscDispatcher>,
    pub portal: Portal,
    /// Trigger number announced and sent by `POST /testosc`.
    pub test_trigger_id: u32,
}

/// Paths operating systems probe to detect a captive portal.
const CAPTIVE_PROBES: [&str; 5] = [
    "/generate_204",
    "/fwlink",
    "/hotspot-detect.html",
    "/canonical.html",
    "/connecttest.txt",
];

pub fn router(state: Arc<AppState>) -> Router {
    let mut app = Router::new()
        .route("/", get(serve_portal))
        .route("/scan", get(api_scan))
        .route("/connect", post(api_connect))
        .route("/disconnect", post(api_disconnect))
        .route("/osc", get(api_get_osc).post(api_set_osc))
        .route("/testosc", post(api_test_osc))
        .route("/success.txt", get(|| async { "success" }));

    for probe in CAPTIVE_PROBES {
        app = app.route(probe, get(redirect_home));
    }

    app.fallback(redirect_home).with_state(state)
}

/// Starts the Axum web server on `addr`.
///
/// # Returns
/// A `JoinHandle` for the server task.
pub fn start_web_server(state: Arc<AppState>, addr: SocketAddr) -> JoinHandle<crate::Result<()>> {
    let app = router(state);
    tokio::spawn(async move {
        let listener = TcpListener::bind(addr).await?;
        tracing::info!("🌐 Web server listening on {}", addr);
        axum::serve(listener, app.into_make_service())
            .await
            .map_err(|e| crate::Error::WebServer(e.into()))
    })
}

// --- Route Handlers ---

/// 处理捕获门户检测请求（Captive Portal Detection）
///
/// 手机连上热点后会探测已知的检验 URL；把它们和所有未知路径都重定向到
/// 门户首页，系统就会弹出配置页面。
async fn redirect_home() -> Response {
    (StatusCode::FOUND, [(header::LOCATION, "/")]).into_response()
}

/// Renders the portal page with live values.
async fn serve_portal(State(state): WebServerState) -> Response {
    match state.portal.render_page().await {
        Ok(page) => Html(page).into_response(),
        Err(e) => {
            tracing::error!("Failed to render portal: {}", e);
            (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response()
        }
    }
}

/// Returns results once ready, otherwise (re)starts a scan and asks the
/// client to poll again.
async fn api_scan(State(state): WebServerState) -> Response {
    match state.controller.poll_scan().await {
        ScanPoll::Ready(networks) => Json(networks).into_response(),
        ScanPoll::Running => Json(json!({ "status": "scanning" })).into_response(),
        ScanPoll::Idle | ScanPoll::Failed => {
            if state.controller.start_scan().await == ScanPhase::Failed {
                tracing::warn!("Scan could not be started, client will retry");
            }
            Json(json!({ "status": "scanning" })).into_response()
        }
    }
}

async fn api_connect(
    State(state): WebServerState,
    form: Result<Form<ConnectionRequest>, FormRejection>,
) -> Response {
    let request = form.map(|Form(r)| r).unwrap_or_default();
    let (Some(ssid), Some(password)) = (request.ssid, request.password) else {
        return Json(json!({ "success": false, "message": "Missing parameters" })).into_response();
    };
    if ssid.is_empty() {
        return Json(json!({ "success": false, "message": "Missing parameters" })).into_response();
    }

    let ticket = state.controller.connect(&ssid, &password).await;
    match ticket.outcome().await {
        ConnectOutcome::Connected { ip } => {
            Json(json!({ "success": true, "ip": ip.to_string() })).into_response()
        }
        ConnectOutcome::Failed { reason } => {
            Json(json!({ "success": false, "message": reason })).into_response()
        }
    }
}

async fn api_disconnect(State(state): WebServerState) -> Response {
    if let Err(e) = state.controller.disconnect().await {
        tracing::error!("Failed to persist disconnect: {}", e);
    }
    Json(json!({ "success": true })).into_response()
}

async fn api_get_osc(State(state): WebServerState) -> Response {
    Json(state.dispatcher.config().await).into_response()
}

/// Applies the valid subset of the submitted fields.
async fn api_set_osc(
    State(state): WebServerState,
    form: Result<Form<OscSettingsRequest>, FormRejection>,
) -> Response {
    let request = form.map(|Form(r)| r).unwrap_or_default();
    match state.dispatcher.apply_update(&request).await {
        Ok(_) => Json(json!({ "success": true })).into_response(),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({ "success": false, "error": e.to_string() })),
        )
            .into_response(),
    }
}

/// Describes the test message; the scheduler sends it on its next tick.
async fn api_test_osc(State(state): WebServerState) -> Response {
    Json(state.dispatcher.request_test(state.test_trigger_id).await).into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::mock::{MockBackend, MockNetwork};
    use crate::config::{ApConfig, ConnectPolicy};
    use crate::scheduler::Scheduler;
    use crate::settings::MemoryStore;
    use crate::traits::DatagramSink;
    use async_trait::async_trait;
    use axum::body::Body;
    use axum::http::Request;
    use http_body_util::BodyExt;
    use serde_json::Value;
    use std::net::Ipv4Addr;
    use std::sync::Mutex as StdMutex;
    use std::time::Duration;
    use tokio::sync::watch;
    use tower::ServiceExt;

    #[derive(Default)]
    struct RecordingSink(StdMutex<Vec<SocketAddr>>);

    #[async_trait]
    impl DatagramSink for RecordingSink {
        async fn send_to(&self, payload: &[u8], target: SocketAddr) -> std::io::Result<usize> {
            self.0.lock().unwrap().push(target);
            Ok(payload.len())
        }
    }

    struct Harness {
        state: Arc<AppState>,
        radio: Arc<MockBackend>,
        sink: Arc<RecordingSink>,
        _shutdown: watch::Sender<bool>,
    }

    async fn harness() -> Harness {
        let radio = Arc::new(MockBackend::with_networks(vec![
            MockNetwork::secured("ValidSSID", "ValidPass", -45, Ipv4Addr::new(192, 168, 1, 42))
                .with_join_polls(3),
            MockNetwork::open("CafeGuest", -70, Ipv4Addr::new(10, 1, 0, 5)),
        ]));
        let store = Arc::new(MemoryStore::new());
        let ap = ApConfig {
            ssid: "OSC-Muis".into(),
            password: String::new(),
            channel: 6,
            country_code: "NL".into(),
            interface: "wlan0".into(),
        };
        let policy = ConnectPolicy {
            poll_interval: Duration::ZERO,
            max_attempts: 20,
        };
        let controller = Arc::new(
            NetworkModeController::new(radio.clone(), store.clone(), ap, policy)
                .with_portal_labels("OSC-Muis", "Test rig"),
        );
        controller.start_access_point().await;

        let sink = Arc::new(RecordingSink::default());
        let dispatcher = Arc::new(OscDispatcher::new(store, controller.clone(), sink.clone()));
        let portal = Portal::new()
            .with_provider(controller.clone())
            .with_provider(dispatcher.clone());

        let (shutdown, rx) = watch::channel(false);
        Scheduler::new(controller.clone(), dispatcher.clone(), Duration::from_millis(1), 1)
            .spawn(rx);

        Harness {
            state: Arc::new(AppState {
                controller,
                dispatcher,
                portal,
                test_trigger_id: 1,
            }),
            radio,
            sink,
            _shutdown: shutdown,
        }
    }

    async fn send(state: &Arc<AppState>, request: Request<Body>) -> (StatusCode, Vec<u8>) {
        let response = router(state.clone()).oneshot(request).await.unwrap();
        let status = response.status();
        let body = response.into_body().collect().await.unwrap().to_bytes();
        (status, body.to_vec())
    }

    async fn get_json(state: &Arc<AppState>, uri: &str) -> Value {
        let (status, body) = send(state, Request::get(uri).body(Body::empty()).unwrap()).await;
        assert_eq!(status, StatusCode::OK);
        serde_json::from_slice(&body).unwrap()
    }

    async fn post_form(state: &Arc<AppState>, uri: &str, form: &str) -> (StatusCode, Value) {
        let request = Request::post(uri)
            .header(header::CONTENT_TYPE, "application/x-www-form-urlencoded")
            .body(Body::from(form.to_string()))
            .unwrap();
        let (status, body) = send(state, request).await;
        (status, serde_json::from_slice(&body).unwrap())
    }

    #[tokio::test]
    async fn portal_page_is_rendered() {
        let h = harness().await;
        let (status, body) = send(&h.state, Request::get("/").body(Body::empty()).unwrap()).await;
        assert_eq!(status, StatusCode::OK);
        let page = String::from_utf8(body).unwrap();
        assert!(page.contains("Test rig"));
        assert!(page.contains("Access Point"));
        assert!(page.contains("broadcast:8001"));
        assert!(page.contains("100%"));
    }

    #[tokio::test]
    async fn stored_address_format_is_escaped_on_the_page() {
        let h = harness().await;
        let form = "addressFormat=%3Cscript%3Ealert(1)%3C%2Fscript%3E";
        let (status, _) = post_form(&h.state, "/osc", form).await;
        assert_eq!(status, StatusCode::OK);

        let (_, body) = send(&h.state, Request::get("/").body(Body::empty()).unwrap()).await;
        let page = String::from_utf8(body).unwrap();
        assert!(!page.contains("<script>alert(1)"));
        assert!(page.contains("&lt;script&gt;alert(1)&lt;/script&gt;"));
    }

    #[tokio::test]
    async fn scan_reports_scanning_then_results() {
        let h = harness().await;
        h.radio.set_scan_polls(1);

        let first = get_json(&h.state, "/scan").await;
        assert_eq!(first, json!({ "status": "scanning" }));
        let second = get_json(&h.state, "/scan").await;
        assert_eq!(second, json!({ "status": "scanning" }));

        let third = get_json(&h.state, "/scan").await;
        let networks = third.as_array().unwrap();
        assert_eq!(networks.len(), 2);
        assert_eq!(networks[0], json!({ "ssid": "ValidSSID", "rssi": -45, "secure": true }));

        // Results are handed over once; the next poll starts a fresh scan.
        let fourth = get_json(&h.state, "/scan").await;
        assert_eq!(fourth, json!({ "status": "scanning" }));
    }

    #[tokio::test]
    async fn connect_requires_both_fields() {
        let h = harness().await;
        let (_, body) = post_form(&h.state, "/connect", "ssid=ValidSSID").await;
        assert_eq!(body, json!({ "success": false, "message": "Missing parameters" }));
    }

    #[tokio::test]
    async fn connect_reports_station_address() {
        let h = harness().await;
        let (status, body) =
            post_form(&h.state, "/connect", "ssid=ValidSSID&password=ValidPass").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, json!({ "success": true, "ip": "192.168.1.42" }));
        assert!(h.state.controller.is_station_connected().await);
    }

    #[tokio::test]
    async fn connect_with_wrong_password_fails() {
        let h = harness().await;
        let (_, body) = post_form(&h.state, "/connect", "ssid=ValidSSID&password=nope").await;
        assert_eq!(body["success"], json!(false));
        assert!(body["message"].as_str().unwrap().starts_with("Connection failed"));
    }

    #[tokio::test]
    async fn disconnect_always_succeeds() {
        let h = harness().await;
        post_form(&h.state, "/connect", "ssid=CafeGuest&password=").await;
        let (_, body) = post_form(&h.state, "/disconnect", "").await;
        assert_eq!(body, json!({ "success": true }));
        assert!(!h.state.controller.is_station_connected().await);
    }

    #[tokio::test]
    async fn osc_settings_round_trip() {
        let h = harness().await;
        assert_eq!(
            get_json(&h.state, "/osc").await,
            json!({ "port": 8001, "targetip": "", "addressFormat": "/kmpush" })
        );

        let (_, body) = post_form(&h.state, "/osc", "port=0&addressFormat=%2Fkm%2Fpush%2F").await;
        assert_eq!(body, json!({ "success": true }));
        assert_eq!(
            get_json(&h.state, "/osc").await,
            json!({ "port": 8001, "targetip": "", "addressFormat": "/km/push/" })
        );
    }

    #[tokio::test]
    async fn test_trigger_is_previewed_and_sent() {
        let h = harness().await;
        let (_, body) = post_form(&h.state, "/testosc", "").await;
        assert_eq!(
            body,
            json!({ "address": "/kmpush1", "targets": ["192.168.4.255:8001"] })
        );

        for _ in 0..100 {
            if !h.sink.0.lock().unwrap().is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(
            *h.sink.0.lock().unwrap(),
            vec!["192.168.4.255:8001".parse::<SocketAddr>().unwrap()]
        );
    }

    #[tokio::test]
    async fn captive_probes_redirect_home() {
        let h = harness().await;
        for uri in ["/generate_204", "/hotspot-detect.html", "/some/unknown/path"] {
            let response = router(h.state.clone())
                .oneshot(Request::get(uri).body(Body::empty()).unwrap())
                .await
                .unwrap();
            assert_eq!(response.status(), StatusCode::FOUND, "{}", uri);
            assert_eq!(response.headers()[header::LOCATION], "/");
        }

        let (status, body) =
            send(&h.state, Request::get("/success.txt").body(Body::empty()).unwrap()).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, b"success");
    }
}
