#![cfg_attr(docsrs, feature(doc_cfg))]
//! Request admission control for actix-web.
//!
//! An [AdmissionController] classifies the identifier of each request (by default its peer IP)
//! as admitted, denied, or admitted after a delay, based on a rate limiting
//! [Strategy](policy::strategy::Strategy) evaluated against a pluggable [Store](store::Store).
//! The [RateLimiter] middleware applies those decisions to an actix-web application.
//!
//! ```no_run
//! # use actix_admission_control::{AdmissionController, RateLimiter};
//! # use actix_admission_control::policy::strategy::Strategy;
//! # use actix_web::{App, HttpServer};
//! # use std::time::Duration;
//! # #[actix_web::main]
//! # async fn main() -> std::io::Result<()> {
//! let controller = AdmissionController::in_memory()
//!     .window(Duration::from_secs(60))
//!     .max_requests(100)
//!     .strategy(Strategy::SlidingWindowLog)
//!     .build()
//!     .expect("valid configuration");
//! HttpServer::new(move || App::new().wrap(RateLimiter::builder(controller.clone()).build()))
//!     .bind(("127.0.0.1", 8080))?
//!     .run()
//!     .await
//! # }
//! ```

pub mod admission;
mod middleware;
pub mod policy;
pub mod store;

pub use admission::builder::{AdmissionControllerBuilder, ConfigError};
pub use admission::{AccessList, AdmissionController, Reason, Throttle, Verdict};
pub use middleware::builder::{
    insert_usage_headers, too_many_requests, RateLimiterBuilder, X_RATELIMIT_LIMIT,
    X_RATELIMIT_REMAINING, X_RATELIMIT_RESET,
};
pub use middleware::key::KeyFunctionBuilder;
pub use middleware::RateLimiter;
