use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use booking_dispatch::api::rest::router;
use booking_dispatch::config::Config;
use booking_dispatch::models::event::{Channel, Event};
use booking_dispatch::state::AppState;
use chrono::Utc;
use serde_json::{json, Value};
use tower::ServiceExt;
use uuid::Uuid;

fn setup() -> (axum::Router, Arc<AppState>) {
    let state = Arc::new(AppState::in_memory(Config::default()));
    (router(state.clone()), state)
}

fn json_request(method: &str, uri: &str, body: Value) -> Request<Body> {
    Request::builder()
        .method(method)
        .uri(uri)
        .header("content-type", "application/json")
        .body(Body::from(serde_json::to_string(&body).unwrap()))
        .unwrap()
}

fn get_request(uri: &str) -> Request<Body> {
    Request::builder()
        .method("GET")
        .uri(uri)
        .body(Body::empty())
        .unwrap()
}

fn patch_request(uri: &str, body: Value) -> Request<Body> {
    Request::builder()
        .method("PATCH")
        .uri(uri)
        .header("content-type", "application/json")
        .body(Body::from(serde_json::to_string(&body).unwrap()))
        .unwrap()
}

async fn body_json(response: axum::response::Response) -> Value {
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

async fn body_string(response: axum::response::Response) -> String {
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    String::from_utf8(bytes.to_vec()).unwrap()
}

async fn call(app: &axum::Router, request: Request<Body>) -> (StatusCode, Value) {
    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    (status, body_json(response).await)
}

async fn online_driver(app: &axum::Router, name: &str, lat: f64, lng: f64) -> String {
    let (status, driver) = call(
        app,
        json_request(
            "POST",
            "/drivers",
            json!({ "name": name, "vehicle": "bike", "rating": 4.7 }),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let id = driver["id"].as_str().unwrap().to_string();

    let (status, _) = call(
        app,
        patch_request(&format!("/drivers/{id}/status"), json!({ "online": true })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    let (status, _) = call(
        app,
        json_request(
            "POST",
            &format!("/drivers/{id}/location"),
            json!({ "point": { "lat": lat, "lng": lng } }),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    id
}

fn trip(customer_id: Uuid) -> Value {
    json!({
        "customer_id": customer_id,
        "pickup": { "address": "Accra Mall", "point": { "lat": 5.6037, "lng": -0.1870 } },
        "dropoff": { "address": "Kotoka Airport", "point": { "lat": 5.6052, "lng": -0.1668 } },
        "fare": "20.00"
    })
}

async fn start_session(app: &axum::Router, customer_id: Uuid) -> Value {
    let (status, session) = call(app, json_request("POST", "/sessions", trip(customer_id))).await;
    assert_eq!(status, StatusCode::OK);
    session
}

/// Runs a direct request through to an assigned delivery and returns its id.
async fn assigned_delivery(app: &axum::Router, customer_id: Uuid, driver_id: &str) -> String {
    let session = start_session(app, customer_id).await;
    let session_id = session["id"].as_str().unwrap();

    let (status, session) = call(
        app,
        json_request(
            "POST",
            &format!("/sessions/{session_id}/select"),
            json!({ "driver_id": driver_id }),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let request_id = session["request_id"].as_str().unwrap();

    let (status, outcome) = call(
        app,
        json_request(
            "POST",
            &format!("/requests/{request_id}/respond"),
            json!({ "driver_id": driver_id, "decision": "accept" }),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(outcome["outcome"], "assigned");
    outcome["delivery"]["id"].as_str().unwrap().to_string()
}

#[tokio::test]
async fn health_returns_ok() {
    let (app, _state) = setup();
    let response = app.oneshot(get_request("/health")).await.unwrap();

    assert_eq!(response.status(), StatusCode::OK);

    let body = body_json(response).await;
    assert_eq!(body["status"], "ok");
    assert_eq!(body["drivers"], 0);
    assert_eq!(body["active_search_sessions"], 0);
}

#[tokio::test]
async fn metrics_returns_prometheus_format() {
    let (app, _state) = setup();
    let response = app.oneshot(get_request("/metrics")).await.unwrap();

    assert_eq!(response.status(), StatusCode::OK);

    let content_type = response
        .headers()
        .get("content-type")
        .unwrap()
        .to_str()
        .unwrap()
        .to_string();
    assert!(content_type.contains("text/plain"));

    let body = body_string(response).await;
    assert!(body.contains("active_search_sessions"));
}

#[tokio::test]
async fn register_driver_starts_offline_with_clamped_rating() {
    let (app, _state) = setup();
    let (status, body) = call(
        &app,
        json_request(
            "POST",
            "/drivers",
            json!({ "name": "Kofi", "vehicle": "van", "rating": 9.9 }),
        ),
    )
    .await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["name"], "Kofi");
    assert_eq!(body["vehicle"], "van");
    assert_eq!(body["online"], false);
    assert_eq!(body["rating"], 5.0);
    assert!(body["active_delivery"].is_null());
}

#[tokio::test]
async fn register_driver_empty_name_returns_400() {
    let (app, _state) = setup();
    let (status, body) = call(
        &app,
        json_request("POST", "/drivers", json!({ "name": "  ", "vehicle": "car" })),
    )
    .await;

    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body["error"].as_str().unwrap().contains("name"));
}

#[tokio::test]
async fn candidates_skip_offline_drivers_and_ignore_backdated_fixes() {
    let (app, _state) = setup();
    let fresh = online_driver(&app, "Fresh", 5.6040, -0.1870).await;

    let stale = online_driver(&app, "Stale", 5.6041, -0.1870).await;
    let (status, _) = call(
        &app,
        json_request(
            "POST",
            &format!("/drivers/{stale}/location"),
            json!({
                "point": { "lat": 5.6041, "lng": -0.1870 },
                "recorded_at": (Utc::now() - chrono::Duration::minutes(10)).to_rfc3339()
            }),
        ),
    )
    .await;
    // backdated fix is dropped, the fresh one stays
    assert_eq!(status, StatusCode::OK);

    let offline = online_driver(&app, "Offline", 5.6042, -0.1870).await;
    call(
        &app,
        patch_request(&format!("/drivers/{offline}/status"), json!({ "online": false })),
    )
    .await;

    let (status, body) = call(
        &app,
        get_request("/candidates?lat=5.6037&lng=-0.1870&radius_km=3"),
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    let ids: Vec<&str> = body
        .as_array()
        .unwrap()
        .iter()
        .map(|c| c["driver_id"].as_str().unwrap())
        .collect();
    assert!(ids.contains(&fresh.as_str()));
    assert!(ids.contains(&stale.as_str()));
    assert!(!ids.contains(&offline.as_str()));
}

#[tokio::test]
async fn driver_with_only_an_old_fix_is_not_a_candidate() {
    let (app, _state) = setup();
    let (_, driver) = call(
        &app,
        json_request("POST", "/drivers", json!({ "name": "Ama", "vehicle": "car" })),
    )
    .await;
    let id = driver["id"].as_str().unwrap().to_string();
    call(
        &app,
        patch_request(&format!("/drivers/{id}/status"), json!({ "online": true })),
    )
    .await;
    call(
        &app,
        json_request(
            "POST",
            &format!("/drivers/{id}/location"),
            json!({
                "point": { "lat": 5.6040, "lng": -0.1870 },
                "recorded_at": (Utc::now() - chrono::Duration::minutes(3)).to_rfc3339()
            }),
        ),
    )
    .await;

    let (status, body) = call(&app, get_request("/candidates?lat=5.6037&lng=-0.1870")).await;
    assert_eq!(status, StatusCode::OK);
    assert!(body.as_array().unwrap().is_empty());
}

#[tokio::test]
async fn out_of_order_location_is_ignored() {
    let (app, _state) = setup();
    let id = online_driver(&app, "Yaa", 5.6000, -0.1800).await;
    let now = Utc::now();

    let (_, first) = call(
        &app,
        json_request(
            "POST",
            &format!("/drivers/{id}/location"),
            json!({
                "point": { "lat": 5.6100, "lng": -0.1800 },
                "recorded_at": (now + chrono::Duration::seconds(5)).to_rfc3339()
            }),
        ),
    )
    .await;
    assert_eq!(first["outcome"], "accepted");

    let (status, second) = call(
        &app,
        json_request(
            "POST",
            &format!("/drivers/{id}/location"),
            json!({
                "point": { "lat": 5.5000, "lng": -0.1000 },
                "recorded_at": (now + chrono::Duration::seconds(3)).to_rfc3339()
            }),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(second["outcome"], "out_of_order");

    let (_, drivers) = call(&app, get_request("/drivers")).await;
    let driver = drivers
        .as_array()
        .unwrap()
        .iter()
        .find(|d| d["id"] == id.as_str())
        .unwrap();
    assert_eq!(driver["position"]["point"]["lat"], 5.61);
}

#[tokio::test]
async fn location_stamped_far_ahead_is_rejected() {
    let (app, _state) = setup();
    let id = online_driver(&app, "Kofi", 5.6000, -0.1800).await;

    let (status, body) = call(
        &app,
        json_request(
            "POST",
            &format!("/drivers/{id}/location"),
            json!({
                "point": { "lat": 5.6100, "lng": -0.1800 },
                "recorded_at": (Utc::now() + chrono::Duration::days(365)).to_rfc3339()
            }),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body["error"].as_str().unwrap().contains("ahead"));

    let (_, accepted) = call(
        &app,
        json_request(
            "POST",
            &format!("/drivers/{id}/location"),
            json!({ "point": { "lat": 5.6100, "lng": -0.1800 } }),
        ),
    )
    .await;
    assert_eq!(accepted["outcome"], "accepted");
}

#[tokio::test]
async fn broadcast_assigns_first_acceptor_and_late_accept_is_stale() {
    let (app, state) = setup();
    let a = online_driver(&app, "A", 5.6040, -0.1870).await;
    let b = online_driver(&app, "B", 5.6050, -0.1870).await;
    let c = online_driver(&app, "C", 5.6060, -0.1870).await;
    let customer_id = Uuid::new_v4();
    let mut customer_feed = state.bus.subscribe(Channel::Customer(customer_id));

    let session = start_session(&app, customer_id).await;
    assert_eq!(session["state"], "searching");
    assert_eq!(session["candidates"].as_array().unwrap().len(), 3);
    let session_id = session["id"].as_str().unwrap().to_string();

    let (status, session) = call(
        &app,
        json_request("POST", &format!("/sessions/{session_id}/broadcast"), json!({})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(session["state"], "waiting");
    let request_id = session["request_id"].as_str().unwrap().to_string();

    let (status, outcome) = call(
        &app,
        json_request(
            "POST",
            &format!("/requests/{request_id}/respond"),
            json!({ "driver_id": b, "decision": "accept" }),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(outcome["outcome"], "assigned");
    assert_eq!(outcome["delivery"]["driver_id"], b.as_str());
    assert_eq!(outcome["delivery"]["status"], "accepted");

    let (status, late) = call(
        &app,
        json_request(
            "POST",
            &format!("/requests/{request_id}/respond"),
            json!({ "driver_id": a, "decision": "accept" }),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(late["outcome"], "no_longer_available");

    let (_, request) = call(&app, get_request(&format!("/requests/{request_id}"))).await;
    assert_eq!(request["status"], "accepted");
    assert_eq!(request["winning_driver_id"], b.as_str());
    for target in request["targets"].as_array().unwrap() {
        let expected = if target["driver_id"] == b.as_str() {
            "accepted"
        } else {
            "withdrawn"
        };
        assert_eq!(target["state"], expected);
    }
    assert!(request["targets"]
        .as_array()
        .unwrap()
        .iter()
        .any(|t| t["driver_id"] == c.as_str()));

    let (_, session) = call(&app, get_request(&format!("/sessions/{session_id}"))).await;
    assert_eq!(session["state"], "accepted");
    assert_eq!(session["driver_id"], b.as_str());

    let mut assigned = Vec::new();
    while let Ok(envelope) = customer_feed.try_recv() {
        if let Event::DriverAssigned { driver_id, .. } = envelope.event {
            assigned.push(driver_id.to_string());
        }
    }
    assert_eq!(assigned, vec![b]);
}

#[tokio::test]
async fn delivery_lifecycle_settles_commission_once() {
    let (app, _state) = setup();
    let driver = online_driver(&app, "Kwame", 5.6040, -0.1870).await;
    let customer_id = Uuid::new_v4();
    let delivery_id = assigned_delivery(&app, customer_id, &driver).await;

    for step in ["pickup", "transit", "complete"] {
        let (status, _) = call(
            &app,
            json_request(
                "POST",
                &format!("/deliveries/{delivery_id}/{step}"),
                json!({ "driver_id": driver }),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::OK, "step {step}");
    }

    let (_, delivery) = call(&app, get_request(&format!("/deliveries/{delivery_id}"))).await;
    assert_eq!(delivery["status"], "completed");
    assert!(delivery["completed_at"].is_string());
    assert!(delivery["settlement"].is_null());

    let (status, _) = call(
        &app,
        json_request(
            "POST",
            &format!("/deliveries/{delivery_id}/cancel"),
            json!({ "actor": { "role": "customer", "id": customer_id }, "reason": "too late" }),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::CONFLICT);

    let (status, confirmed) = call(
        &app,
        json_request(
            "POST",
            &format!("/deliveries/{delivery_id}/confirm"),
            json!({ "customer_id": customer_id }),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(confirmed["status"], "confirmed");
    assert_eq!(confirmed["settlement"]["commission"], "2.70");
    assert_eq!(confirmed["settlement"]["driver_payout"], "17.30");
    assert_eq!(confirmed["settlement"]["source"], "customer");

    let (status, again) = call(
        &app,
        json_request(
            "POST",
            &format!("/deliveries/{delivery_id}/confirm"),
            json!({ "customer_id": customer_id }),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(again["settlement"], confirmed["settlement"]);
    assert_eq!(again["version"], confirmed["version"]);

    let (_, drivers) = call(&app, get_request("/drivers")).await;
    assert!(drivers[0]["active_delivery"].is_null());
}

#[tokio::test]
async fn wrong_driver_cannot_advance_delivery() {
    let (app, _state) = setup();
    let driver = online_driver(&app, "Esi", 5.6040, -0.1870).await;
    let delivery_id = assigned_delivery(&app, Uuid::new_v4(), &driver).await;

    let (status, _) = call(
        &app,
        json_request(
            "POST",
            &format!("/deliveries/{delivery_id}/pickup"),
            json!({ "driver_id": Uuid::new_v4() }),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::FORBIDDEN);
}

#[tokio::test]
async fn driver_cancellation_frees_driver_for_new_work() {
    let (app, _state) = setup();
    let driver = online_driver(&app, "Abena", 5.6040, -0.1870).await;
    let delivery_id = assigned_delivery(&app, Uuid::new_v4(), &driver).await;

    let (status, cancelled) = call(
        &app,
        json_request(
            "POST",
            &format!("/deliveries/{delivery_id}/cancel"),
            json!({ "actor": { "role": "driver", "id": driver }, "reason": "flat tyre" }),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(cancelled["status"], "cancelled");
    assert_eq!(cancelled["cancel_reason"], "flat tyre");

    let (_, candidates) = call(&app, get_request("/candidates?lat=5.6037&lng=-0.1870")).await;
    assert_eq!(candidates.as_array().unwrap().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn unanswered_direct_request_expires() {
    let (app, _state) = setup();
    let driver = online_driver(&app, "Nana", 5.6040, -0.1870).await;
    let session = start_session(&app, Uuid::new_v4()).await;
    let session_id = session["id"].as_str().unwrap().to_string();

    let (_, session) = call(
        &app,
        json_request(
            "POST",
            &format!("/sessions/{session_id}/select"),
            json!({ "driver_id": driver }),
        ),
    )
    .await;
    let request_id = session["request_id"].as_str().unwrap().to_string();

    tokio::time::sleep(Duration::from_secs(31)).await;

    let (_, request) = call(&app, get_request(&format!("/requests/{request_id}"))).await;
    assert_eq!(request["status"], "expired");
    assert_eq!(request["targets"][0]["state"], "withdrawn");

    let (_, session) = call(&app, get_request(&format!("/sessions/{session_id}"))).await;
    assert_eq!(session["state"], "searching");
    assert_eq!(session["last_failure"], "no_drivers_responded");
}

#[tokio::test]
async fn empty_area_fails_with_no_drivers_available() {
    let (app, _state) = setup();
    let session = start_session(&app, Uuid::new_v4()).await;
    assert_eq!(session["state"], "failed");
    assert_eq!(session["last_failure"], "no_drivers_available");

    let session_id = session["id"].as_str().unwrap();
    let (status, _) = call(
        &app,
        json_request("POST", &format!("/sessions/{session_id}/broadcast"), json!({})),
    )
    .await;
    assert_eq!(status, StatusCode::CONFLICT);

    online_driver(&app, "Late", 5.6040, -0.1870).await;
    let (status, session) = call(
        &app,
        json_request("POST", &format!("/sessions/{session_id}/search"), json!({})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(session["state"], "searching");
    assert_eq!(session["candidates"].as_array().unwrap().len(), 1);
}

#[tokio::test]
async fn cancelled_session_turns_late_accept_stale() {
    let (app, _state) = setup();
    let driver = online_driver(&app, "Kojo", 5.6040, -0.1870).await;
    let session = start_session(&app, Uuid::new_v4()).await;
    let session_id = session["id"].as_str().unwrap().to_string();

    let (_, session) = call(
        &app,
        json_request("POST", &format!("/sessions/{session_id}/broadcast"), json!({})),
    )
    .await;
    let request_id = session["request_id"].as_str().unwrap().to_string();

    let (status, session) = call(
        &app,
        json_request("POST", &format!("/sessions/{session_id}/cancel"), json!({})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(session["state"], "cancelled");

    let (status, late) = call(
        &app,
        json_request(
            "POST",
            &format!("/requests/{request_id}/respond"),
            json!({ "driver_id": driver, "decision": "accept" }),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(late["outcome"], "no_longer_available");
}

#[tokio::test]
async fn untargeted_driver_response_is_forbidden() {
    let (app, _state) = setup();
    online_driver(&app, "Target", 5.6040, -0.1870).await;
    let outsider = online_driver(&app, "Outsider", 5.9000, -0.1870).await;
    let session = start_session(&app, Uuid::new_v4()).await;
    let session_id = session["id"].as_str().unwrap().to_string();

    let (_, session) = call(
        &app,
        json_request("POST", &format!("/sessions/{session_id}/broadcast"), json!({})),
    )
    .await;
    let request_id = session["request_id"].as_str().unwrap().to_string();

    let (status, _) = call(
        &app,
        json_request(
            "POST",
            &format!("/requests/{request_id}/respond"),
            json!({ "driver_id": outsider, "decision": "accept" }),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::FORBIDDEN);

    let (_, drivers) = call(&app, get_request("/drivers")).await;
    assert!(drivers
        .as_array()
        .unwrap()
        .iter()
        .all(|d| d["active_delivery"].is_null()));
}

#[tokio::test]
async fn unknown_session_returns_404() {
    let (app, _state) = setup();
    let fake_id = "00000000-0000-0000-0000-000000000000";
    let response = app
        .oneshot(get_request(&format!("/sessions/{fake_id}")))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn invalid_fare_returns_400() {
    let (app, _state) = setup();
    let mut body = trip(Uuid::new_v4());
    body["fare"] = json!("0");

    let (status, _) = call(&app, json_request("POST", "/sessions", body)).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}
