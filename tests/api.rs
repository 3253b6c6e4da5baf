use axum::{
    body::Body,
    http::{header, Method, Request, StatusCode},
    Router,
};
use chrono::{NaiveDate, NaiveTime, TimeZone, Utc};
use jsonwebtoken::{encode, EncodingKey, Header};
use serde_json::{json, Value};
use std::sync::Arc;
use tower::ServiceExt;

use cinema_booking::{
    clock::FixedClock,
    config::{AppConfig, BookingConfig, Config, DatabaseConfig, JwtConfig, NotifierConfig, VnPayConfig},
    middleware::Claims,
    models::{Account, CinemaRoom, Movie, MovieShow, Role, RoomStatus, Seat, SeatStatus, SeatType, Version},
    router,
    services::{vnpay::append_signature, BookingEvent, RecordingNotifier, VnPayParams},
    store::MemoryStore,
    AppState,
};

const JWT_SECRET: &str = "test-secret";
const HASH_SECRET: &str = "VNPAYSECRET";

fn config() -> Config {
    Config {
        app: AppConfig::default(),
        database: DatabaseConfig::default(),
        redis: None,
        jwt: JwtConfig { secret: JWT_SECRET.to_string() },
        vnpay: VnPayConfig {
            tmn_code: "TMN01".to_string(),
            hash_secret: HASH_SECRET.to_string(),
            payment_url: "https://sandbox.vnpayment.vn/paymentv2/vpcpay.html".to_string(),
            return_url: "http://localhost:8000/api/payment/vnpay-return".to_string(),
            version: "2.1.0".to_string(),
            locale: "vn".to_string(),
            expire_minutes: 15,
        },
        booking: BookingConfig::default(),
        notifier: NotifierConfig::default(),
    }
}

fn seat(id: i64, label: &str) -> Seat {
    Seat {
        id,
        room_id: 1,
        label: label.to_string(),
        seat_type_id: 1,
        status: SeatStatus::Available,
    }
}

fn account(id: &str, role: Role) -> Account {
    Account { id: id.to_string(), role, score: 0, rank_percent: 10 }
}

struct TestApp {
    app: Router,
    notifier: Arc<RecordingNotifier>,
}

fn test_app() -> TestApp {
    let store = MemoryStore::new();
    store.add_room(CinemaRoom {
        id: 1,
        name: "Room 1".to_string(),
        length: 10,
        width: 10,
        status: RoomStatus::Active,
        unavailable_until: None,
    });
    store.add_seat_type(SeatType { id: 1, name: "Standard".to_string(), price: 80_000 });
    store.add_seat_type(SeatType { id: 2, name: "VIP".to_string(), price: 100_000 });
    store.add_seat(seat(1, "A1"));
    store.add_seat(seat(2, "A2"));
    store.add_seat(seat(3, "A3"));
    store.add_movie(Movie {
        id: "M1".to_string(),
        name: Some("Dune".to_string()),
        large_image: None,
        small_image: None,
        duration_minutes: 150,
    });
    store.add_version(Version { id: 1, name: "2D".to_string() });
    store.add_show(MovieShow {
        id: 1,
        movie_id: Some("M1".to_string()),
        room_id: 1,
        show_date: NaiveDate::from_ymd_opt(2025, 6, 10).unwrap(),
        show_time: NaiveTime::from_hms_opt(19, 0, 0),
        version_id: 1,
    });
    store.add_account(account("alice", Role::Member));
    store.add_account(account("bob", Role::Member));
    store.add_account(account("admin", Role::Admin));

    let clock = Arc::new(FixedClock::new(Utc.with_ymd_and_hms(2025, 6, 1, 8, 0, 0).unwrap()));
    let notifier = Arc::new(RecordingNotifier::new());
    let state = AppState::new(&config(), Arc::new(store), clock, notifier.clone(), None);
    TestApp { app: router(state), notifier }
}

fn token(account_id: &str, role: &str) -> String {
    let claims = Claims {
        sub: account_id.to_string(),
        role: role.to_string(),
        exp: (Utc::now().timestamp() + 3600) as usize,
    };
    encode(&Header::default(), &claims, &EncodingKey::from_secret(JWT_SECRET.as_bytes())).unwrap()
}

async fn send(app: &Router, method: Method, uri: &str, bearer: Option<&str>, body: Option<Value>) -> (StatusCode, Value) {
    let mut request = Request::builder().method(method).uri(uri);
    if let Some(token) = bearer {
        request = request.header(header::AUTHORIZATION, format!("Bearer {}", token));
    }
    let request = match body {
        Some(body) => request
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()))
            .unwrap(),
        None => request.body(Body::empty()).unwrap(),
    };

    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let value = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
    (status, value)
}

fn ipn_query(invoice_id: &str, amount: i64, code: &str) -> String {
    let mut params = VnPayParams::new();
    params.insert("vnp_TxnRef".to_string(), invoice_id.to_string());
    params.insert("vnp_Amount".to_string(), (amount * 100).to_string());
    params.insert("vnp_ResponseCode".to_string(), code.to_string());
    params.insert("vnp_TransactionStatus".to_string(), code.to_string());
    params.insert("vnp_TransactionNo".to_string(), "14000001".to_string());
    append_signature(&mut params, HASH_SECRET);
    serde_urlencoded::to_string(&params).unwrap()
}

#[tokio::test]
async fn health_is_public() {
    let t = test_app();
    let response = t
        .app
        .clone()
        .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn protected_routes_require_bearer_token() {
    let t = test_app();
    let (status, body) = send(&t.app, Method::GET, "/api/invoices", None, None).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["success"], false);

    let (status, _) = send(&t.app, Method::GET, "/api/invoices", Some("not-a-jwt"), None).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn showtimes_are_grouped_by_movie() {
    let t = test_app();
    let (status, body) = send(&t.app, Method::GET, "/api/showtimes?date=2025-06-10", None, None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body[0]["movie_id"], "M1");
    assert_eq!(body[0]["versions"][0]["showtimes"][0]["time"], "19:00");

    let (status, _) = send(&t.app, Method::GET, "/api/showtimes?date=tomorrow", None, None).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn find_show_by_slot() {
    let t = test_app();
    let (status, body) = send(
        &t.app,
        Method::GET,
        "/api/shows/find?movie_id=M1&date=10/06/2025&time=19:00&version_id=1",
        None,
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["id"], 1);

    let (status, _) = send(
        &t.app,
        Method::GET,
        "/api/shows/find?movie_id=M9&date=10/06/2025&time=19:00&version_id=1",
        None,
        None,
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn seat_management_is_admin_only() {
    let t = test_app();
    let member = token("alice", "member");
    let admin = token("admin", "admin");

    let (status, _) = send(&t.app, Method::PUT, "/api/seats/1/type", Some(&member), Some(json!({ "seat_type_id": 2 }))).await;
    assert_eq!(status, StatusCode::FORBIDDEN);

    let (status, _) = send(&t.app, Method::PUT, "/api/seats/1/type", Some(&admin), Some(json!({ "seat_type_id": 2 }))).await;
    assert_eq!(status, StatusCode::OK);

    let (_, seats) = send(&t.app, Method::GET, "/api/rooms/1/seats", None, None).await;
    assert_eq!(seats[0]["seat_type_id"], 2);

    let pair = json!({ "first_seat_id": 2, "second_seat_id": 3 });
    let (status, _) = send(&t.app, Method::POST, "/api/couple-seats", Some(&admin), Some(pair.clone())).await;
    assert_eq!(status, StatusCode::CREATED);
    let (status, body) = send(&t.app, Method::POST, "/api/couple-seats", Some(&admin), Some(pair)).await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["message"], "Seats are already coupled");

    let (status, _) = send(
        &t.app,
        Method::DELETE,
        "/api/couple-seats",
        Some(&admin),
        Some(json!({ "seat_ids": [3, 2] })),
    )
    .await;
    assert_eq!(status, StatusCode::NO_CONTENT);
}

#[tokio::test]
async fn couple_batch_validates_body_and_pairs() {
    let t = test_app();
    let admin = token("admin", "admin");

    let (status, _) = send(&t.app, Method::POST, "/api/couple-seats/batch", Some(&admin), Some(json!({ "pairs": [] }))).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, _) = send(
        &t.app,
        Method::POST,
        "/api/couple-seats/batch",
        Some(&admin),
        Some(json!({ "pairs": [{ "first_seat_id": 0, "second_seat_id": 1 }] })),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, body) = send(
        &t.app,
        Method::POST,
        "/api/couple-seats/batch",
        Some(&admin),
        Some(json!({ "pairs": [{ "first_seat_id": 1, "second_seat_id": 2 }] })),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(body[0]["first_seat_id"], 1);
    assert_eq!(body[0]["second_seat_id"], 2);
}

#[tokio::test]
async fn contested_hold_has_one_winner() {
    let t = test_app();
    let alice = token("alice", "member");
    let bob = token("bob", "member");

    let (status, body) = send(&t.app, Method::POST, "/api/shows/1/holds", Some(&alice), Some(json!({ "seat_ids": [1, 2] }))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["outcome"], "held");

    let (status, body) = send(&t.app, Method::POST, "/api/shows/1/holds", Some(&bob), Some(json!({ "seat_ids": [2, 3] }))).await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["outcome"], "unavailable");
    assert_eq!(body["seat_ids"], json!([2]));

    let (_, map) = send(&t.app, Method::GET, "/api/shows/1/seats", None, None).await;
    let statuses: Vec<&str> = map.as_array().unwrap().iter().map(|s| s["status"].as_str().unwrap()).collect();
    assert_eq!(statuses, vec!["held", "held", "available"]);
}

#[tokio::test]
async fn booking_payment_and_cancellation_flow() {
    let t = test_app();
    let alice = token("alice", "member");

    let (status, _) = send(&t.app, Method::POST, "/api/shows/1/holds", Some(&alice), Some(json!({ "seat_ids": [1] }))).await;
    assert_eq!(status, StatusCode::OK);

    let (status, invoice) = send(
        &t.app,
        Method::POST,
        "/api/invoices",
        Some(&alice),
        Some(json!({ "show_id": 1, "seat_ids": [1] })),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(invoice["total_price"], 80_000);
    let invoice_id = invoice["id"].as_str().unwrap().to_string();

    let (status, body) = send(&t.app, Method::POST, &format!("/api/invoices/{}/payment", invoice_id), Some(&alice), None).await;
    assert_eq!(status, StatusCode::OK);
    assert!(body["payment_url"].as_str().unwrap().contains("vnp_SecureHash="));

    // wrong amount is refused and changes nothing
    let (_, ack) = send(&t.app, Method::GET, &format!("/api/payment/vnpay-ipn?{}", ipn_query(&invoice_id, 1_000, "00")), None, None).await;
    assert_eq!(ack, json!({ "RspCode": "97", "Message": "Invalid amount" }));

    let uri = format!("/api/payment/vnpay-ipn?{}", ipn_query(&invoice_id, 80_000, "00"));
    let (_, ack) = send(&t.app, Method::GET, &uri, None, None).await;
    assert_eq!(ack["RspCode"], "00");
    let (_, ack) = send(&t.app, Method::GET, &uri, None, None).await;
    assert_eq!(ack, json!({ "RspCode": "00", "Message": "Order already confirmed" }));

    let (_, stored) = send(&t.app, Method::GET, &format!("/api/invoices/{}", invoice_id), Some(&alice), None).await;
    assert_eq!(stored["status"], "completed");
    assert_eq!(stored["earned_score"], 8_000);

    let bob = token("bob", "member");
    let (status, _) = send(&t.app, Method::POST, &format!("/api/invoices/{}/cancel", invoice_id), Some(&bob), None).await;
    assert_eq!(status, StatusCode::FORBIDDEN);

    let (status, outcome) = send(&t.app, Method::POST, &format!("/api/invoices/{}/cancel", invoice_id), Some(&alice), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(outcome["success"], true);

    let (status, outcome) = send(&t.app, Method::POST, &format!("/api/invoices/{}/cancel", invoice_id), Some(&alice), None).await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(outcome["success"], false);

    let events = t.notifier.events();
    assert!(matches!(events[0], BookingEvent::BookingConfirmed { .. }));
    assert!(matches!(events.last(), Some(BookingEvent::BookingCancelled { .. })));
}

#[tokio::test]
async fn vnpay_return_redirects_with_outcome() {
    let t = test_app();
    let response = t
        .app
        .clone()
        .oneshot(
            Request::builder()
                .uri("/api/payment/vnpay-return")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::SEE_OTHER);
    let location = response.headers()[header::LOCATION].to_str().unwrap();
    assert!(location.starts_with("/booking/result?status=failed"));
}

#[tokio::test]
async fn show_refund_requires_admin() {
    let t = test_app();
    let (status, _) = send(&t.app, Method::POST, "/api/admin/shows/1/refund", Some(&token("alice", "member")), None).await;
    assert_eq!(status, StatusCode::FORBIDDEN);

    let (status, report) = send(&t.app, Method::POST, "/api/admin/shows/1/refund", Some(&token("admin", "admin")), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(report["show_id"], 1);
    assert_eq!(report["cancelled"], json!([]));
}
