use crate::admission::{AdmissionController, Verdict};
use crate::middleware::key::KeyFunctionBuilder;
use crate::middleware::{DeniedResponse, KeyFunction, RateLimiter};
use crate::policy::Usage;
use crate::store::Store;
use actix_web::dev::ServiceRequest;
use actix_web::http::header::{HeaderMap, HeaderName, HeaderValue, RETRY_AFTER};
use actix_web::HttpResponse;
use once_cell::sync::Lazy;
use std::rc::Rc;

pub static X_RATELIMIT_LIMIT: Lazy<HeaderName> =
    Lazy::new(|| HeaderName::from_static("x-ratelimit-limit"));

pub static X_RATELIMIT_REMAINING: Lazy<HeaderName> =
    Lazy::new(|| HeaderName::from_static("x-ratelimit-remaining"));

pub static X_RATELIMIT_RESET: Lazy<HeaderName> =
    Lazy::new(|| HeaderName::from_static("x-ratelimit-reset"));

/// Sets the following headers from the usage of an admitted request:
///
/// - `x-ratelimit-limit`\
/// - `x-ratelimit-remaining`\
/// - `x-ratelimit-reset` (seconds until the reset)
pub fn insert_usage_headers(map: &mut HeaderMap, usage: &Usage) {
    map.insert(X_RATELIMIT_LIMIT.clone(), HeaderValue::from(usage.limit));
    map.insert(
        X_RATELIMIT_REMAINING.clone(),
        HeaderValue::from(usage.remaining()),
    );
    map.insert(
        X_RATELIMIT_RESET.clone(),
        HeaderValue::from(usage.seconds_until_reset()),
    );
}

/// An empty 429 response, carrying the usage headers and `retry-after` when usage is known.
pub fn too_many_requests(verdict: &Verdict) -> HttpResponse {
    let mut response = HttpResponse::TooManyRequests().finish();
    if let Some(usage) = &verdict.usage {
        let map = response.headers_mut();
        insert_usage_headers(map, usage);
        map.insert(RETRY_AFTER, HeaderValue::from(usage.seconds_until_reset()));
    }
    response
}

pub struct RateLimiterBuilder<ST> {
    controller: AdmissionController<ST>,
    key_fn: Rc<KeyFunction>,
    denied_response: Rc<DeniedResponse>,
}

impl<ST: Store> RateLimiterBuilder<ST> {
    pub(super) fn new(controller: AdmissionController<ST>) -> Self {
        Self {
            controller,
            key_fn: Rc::new(KeyFunctionBuilder::new().peer_ip_key().build()),
            denied_response: Rc::new(too_many_requests),
        }
    }

    /// Derive the identifier of each request with a custom function, see [KeyFunctionBuilder].
    ///
    /// Defaults to the peer IP address of the connection.
    pub fn key_fn<F>(mut self, key_fn: F) -> Self
    where
        F: Fn(&ServiceRequest) -> Result<String, actix_web::Error> + 'static,
    {
        self.key_fn = Rc::new(key_fn);
        self
    }

    /// In the event that the request is denied, configure the [HttpResponse] returned.
    ///
    /// Defaults to [too_many_requests].
    pub fn request_denied_response<R>(mut self, denied_response: R) -> Self
    where
        R: Fn(&Verdict) -> HttpResponse + 'static,
    {
        self.denied_response = Rc::new(denied_response);
        self
    }

    pub fn build(self) -> RateLimiter<ST> {
        RateLimiter {
            controller: self.controller,
            key_fn: self.key_fn,
            denied_response: self.denied_response,
        }
    }
}
