use crate::admission::{AdmissionController, Reason, Throttle};
use crate::middleware::*;
use crate::policy::backoff::Backoff;
use crate::policy::strategy::Strategy;
use crate::store::memory::InMemoryStore;
use crate::store::mock::FailingStore;
use actix_web::http::header::RETRY_AFTER;
use actix_web::http::StatusCode;
use actix_web::rt::time::Instant;
use actix_web::test::{read_body, TestRequest};
use actix_web::{get, test, App, Responder};
use std::time::Duration;

const MINUTE: Duration = Duration::from_secs(60);
const CLIENT: &str = "127.0.0.1:40000";

#[get("/200")]
async fn route_200() -> impl Responder {
    HttpResponse::Ok().body("Hello world!")
}

fn request() -> TestRequest {
    TestRequest::get()
        .uri("/200")
        .peer_addr(CLIENT.parse().unwrap())
}

fn store() -> InMemoryStore {
    InMemoryStore::builder().with_gc_interval(None).build()
}

fn header<B>(response: &ServiceResponse<B>, name: &str) -> String {
    response
        .headers()
        .get(name)
        .unwrap()
        .to_str()
        .unwrap()
        .to_owned()
}

#[actix_web::test]
async fn test_allow_deny() {
    tokio::time::pause();
    let controller = AdmissionController::builder(store())
        .window(MINUTE)
        .max_requests(5)
        .build()
        .unwrap();
    let limiter = RateLimiter::builder(controller.clone()).build();
    let app = test::init_service(App::new().service(route_200).wrap(limiter)).await;
    for i in (0..5).rev() {
        let response = test::call_service(&app, request().to_request()).await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(header(&response, "x-ratelimit-limit"), "5");
        assert_eq!(header(&response, "x-ratelimit-remaining"), i.to_string());
        assert_eq!(header(&response, "x-ratelimit-reset"), "60");
    }
    let response = test::call_service(&app, request().to_request()).await;
    assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
    assert_eq!(header(&response, "x-ratelimit-remaining"), "0");
    assert_eq!(header(&response, RETRY_AFTER.as_str()), "60");

    // A different client has its own counter
    let response = test::call_service(
        &app,
        TestRequest::get()
            .uri("/200")
            .peer_addr("127.0.0.2:40000".parse().unwrap())
            .to_request(),
    )
    .await;
    assert_eq!(response.status(), StatusCode::OK);

    // After the window has passed requests are admitted again
    tokio::time::advance(MINUTE).await;
    let response = test::call_service(&app, request().to_request()).await;
    assert_eq!(response.status(), StatusCode::OK);

    // As they are after an explicit reset
    for _ in 0..5 {
        test::call_service(&app, request().to_request()).await;
    }
    controller.reset("127.0.0.1").await.unwrap();
    let response = test::call_service(&app, request().to_request()).await;
    assert_eq!(response.status(), StatusCode::OK);
}

#[actix_web::test]
async fn test_allowlisted() {
    let controller = AdmissionController::builder(store())
        .max_requests(5)
        .allow("127.0.0.1")
        .build()
        .unwrap();
    let app = test::init_service(
        App::new()
            .service(route_200)
            .wrap(RateLimiter::builder(controller).build()),
    )
    .await;
    for _ in 0..10 {
        let response = test::call_service(&app, request().to_request()).await;
        assert_eq!(response.status(), StatusCode::OK);
        // The store was never consulted, so there is no usage to report
        assert!(!response.headers().contains_key("x-ratelimit-limit"));
    }
}

#[actix_web::test]
async fn test_denylisted() {
    let controller = AdmissionController::builder(store())
        .deny("127.0.0.1")
        .build()
        .unwrap();
    let app = test::init_service(
        App::new()
            .service(route_200)
            .wrap(RateLimiter::builder(controller).build()),
    )
    .await;
    let response = test::call_service(&app, request().to_request()).await;
    assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
    assert!(!response.headers().contains_key(RETRY_AFTER));
}

#[actix_web::test]
async fn test_unlimited() {
    let controller = AdmissionController::builder(store())
        .max_requests(0)
        .build()
        .unwrap();
    let app = test::init_service(
        App::new()
            .service(route_200)
            .wrap(RateLimiter::builder(controller).build()),
    )
    .await;
    for _ in 0..10 {
        let response = test::call_service(&app, request().to_request()).await;
        assert_eq!(response.status(), StatusCode::OK);
    }
}

#[actix_web::test]
async fn test_tiny_window_denies_immediately() {
    let controller = AdmissionController::builder(store())
        .window(Duration::from_millis(1))
        .build()
        .unwrap();
    let app = test::init_service(
        App::new()
            .service(route_200)
            .wrap(RateLimiter::builder(controller).build()),
    )
    .await;
    let response = test::call_service(&app, request().to_request()).await;
    assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
}

#[actix_web::test]
async fn test_throttled_burst() {
    tokio::time::pause();
    let controller = AdmissionController::builder(store())
        .max_requests(100)
        .throttling(Throttle::default())
        .build()
        .unwrap();
    let app = test::init_service(
        App::new()
            .service(route_200)
            .wrap(RateLimiter::builder(controller).build()),
    )
    .await;
    for _ in 0..10 {
        let response = test::call_service(&app, request().to_request()).await;
        assert_eq!(response.status(), StatusCode::OK);
    }
    let response = test::call_service(&app, request().to_request()).await;
    assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
}

#[actix_web::test]
async fn test_backoff_delays_instead_of_denying() {
    tokio::time::pause();
    let controller = AdmissionController::builder(store())
        .max_requests(1)
        .exponential_backoff(Backoff::default())
        .build()
        .unwrap();
    let app = test::init_service(
        App::new()
            .service(route_200)
            .wrap(RateLimiter::builder(controller).build()),
    )
    .await;
    let response = test::call_service(&app, request().to_request()).await;
    assert_eq!(response.status(), StatusCode::OK);
    for k in 1..=3 {
        let start = Instant::now();
        let response = test::call_service(&app, request().to_request()).await;
        assert_eq!(response.status(), StatusCode::OK);
        assert!(start.elapsed() >= Duration::from_secs(k));
        assert_eq!(header(&response, "x-ratelimit-remaining"), "0");
    }
}

#[actix_web::test]
async fn test_custom_deny_response() {
    let controller = AdmissionController::builder(store())
        .deny("127.0.0.1")
        .build()
        .unwrap();
    let limiter = RateLimiter::builder(controller)
        .request_denied_response(|verdict| {
            assert_eq!(verdict.reason, Reason::Denylisted);
            HttpResponse::build(StatusCode::IM_A_TEAPOT).body("Custom denied response")
        })
        .build();
    let app = test::init_service(App::new().service(route_200).wrap(limiter)).await;
    let response = test::call_service(&app, request().to_request()).await;
    assert_eq!(response.status(), StatusCode::IM_A_TEAPOT);
    let body = String::from_utf8(read_body(response).await.to_vec()).unwrap();
    assert_eq!(body, "Custom denied response");
}

#[actix_web::test]
async fn test_custom_key() {
    let controller = AdmissionController::builder(store())
        .max_requests(1)
        .strategy(Strategy::TokenBucket)
        .build()
        .unwrap();
    let limiter = RateLimiter::builder(controller)
        .key_fn(|req| Ok(req.path().to_owned()))
        .build();
    let app = test::init_service(App::new().service(route_200).wrap(limiter)).await;
    // No peer address is needed when keying by path
    let response = test::call_service(&app, TestRequest::get().uri("/200").to_request()).await;
    assert_eq!(response.status(), StatusCode::OK);
    let response = test::call_service(&app, TestRequest::get().uri("/200").to_request()).await;
    assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
}

#[actix_web::test]
async fn test_key_function_failure() {
    let controller = AdmissionController::builder(store()).build().unwrap();
    let app = test::init_service(
        App::new()
            .service(route_200)
            .wrap(RateLimiter::builder(controller).build()),
    )
    .await;
    // The default key function needs the peer address
    let response = test::call_service(&app, TestRequest::get().uri("/200").to_request()).await;
    assert!(response.status().is_server_error());
}

#[actix_web::test]
async fn test_fail_open() {
    let controller = AdmissionController::builder(FailingStore::default())
        .build()
        .unwrap();
    let app = test::init_service(
        App::new()
            .service(route_200)
            .wrap(RateLimiter::builder(controller).build()),
    )
    .await;
    let response = test::call_service(&app, request().to_request()).await;
    assert_eq!(response.status(), StatusCode::OK);
    assert!(!response.headers().contains_key("x-ratelimit-limit"));
}

#[actix_web::test]
async fn test_fail_closed() {
    let controller = AdmissionController::builder(FailingStore::default())
        .fail_open(false)
        .build()
        .unwrap();
    let app = test::init_service(
        App::new()
            .service(route_200)
            .wrap(RateLimiter::builder(controller).build()),
    )
    .await;
    let response = test::call_service(&app, request().to_request()).await;
    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
}
