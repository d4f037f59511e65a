pub mod builder;
pub mod key;
#[cfg(test)]
mod tests;

use crate::admission::{AdmissionController, Verdict};
use crate::store::Store;
use actix_web::body::EitherBody;
use actix_web::dev::{forward_ready, Service, ServiceRequest, ServiceResponse, Transform};
use actix_web::HttpResponse;
use builder::RateLimiterBuilder;
use futures::future::{ok, LocalBoxFuture, Ready};
use std::cell::RefCell;
use std::rc::Rc;

type KeyFunction = dyn Fn(&ServiceRequest) -> Result<String, actix_web::Error>;
type DeniedResponse = dyn Fn(&Verdict) -> HttpResponse;

/// Admission control middleware.
pub struct RateLimiter<ST> {
    controller: AdmissionController<ST>,
    key_fn: Rc<KeyFunction>,
    denied_response: Rc<DeniedResponse>,
}

impl<ST> Clone for RateLimiter<ST> {
    fn clone(&self) -> Self {
        Self {
            controller: self.controller.clone(),
            key_fn: self.key_fn.clone(),
            denied_response: self.denied_response.clone(),
        }
    }
}

impl<ST: Store> RateLimiter<ST> {
    /// # Arguments
    ///
    /// * `controller`: Decides on each request, given the identifier derived from it.
    pub fn builder(controller: AdmissionController<ST>) -> RateLimiterBuilder<ST> {
        RateLimiterBuilder::new(controller)
    }
}

impl<S, B, ST> Transform<S, ServiceRequest> for RateLimiter<ST>
where
    S: Service<ServiceRequest, Response = ServiceResponse<B>, Error = actix_web::Error> + 'static,
    S::Future: 'static,
    B: 'static,
    ST: Store,
    ST::Error: Into<actix_web::Error>,
{
    type Response = ServiceResponse<EitherBody<B>>;
    type Error = actix_web::Error;
    type Transform = RateLimiterMiddleware<S, ST>;
    type InitError = ();
    type Future = Ready<Result<Self::Transform, Self::InitError>>;

    fn new_transform(&self, service: S) -> Self::Future {
        ok(RateLimiterMiddleware {
            service: Rc::new(RefCell::new(service)),
            controller: self.controller.clone(),
            key_fn: Rc::clone(&self.key_fn),
            denied_response: self.denied_response.clone(),
        })
    }
}

pub struct RateLimiterMiddleware<S, ST> {
    service: Rc<RefCell<S>>,
    controller: AdmissionController<ST>,
    key_fn: Rc<KeyFunction>,
    denied_response: Rc<DeniedResponse>,
}

impl<S, B, ST> Service<ServiceRequest> for RateLimiterMiddleware<S, ST>
where
    S: Service<ServiceRequest, Response = ServiceResponse<B>, Error = actix_web::Error> + 'static,
    S::Future: 'static,
    B: 'static,
    ST: Store,
    ST::Error: Into<actix_web::Error>,
{
    type Response = ServiceResponse<EitherBody<B>>;
    type Error = actix_web::Error;
    type Future = LocalBoxFuture<'static, Result<Self::Response, Self::Error>>;

    forward_ready!(service);

    fn call(&self, req: ServiceRequest) -> Self::Future {
        let service = self.service.clone();
        let controller = self.controller.clone();
        let key_fn = self.key_fn.clone();
        let denied_response = self.denied_response.clone();

        Box::pin(async move {
            let key = match (key_fn)(&req) {
                Ok(key) => key,
                Err(e) => {
                    log::error!("Rate limiter key function failed: {e}");
                    return Ok(req.into_response(e.error_response()).map_into_right_body());
                }
            };

            // Failing open is handled by the controller, an error here means fail closed
            let verdict = match controller.admit(&key).await {
                Ok(verdict) => verdict,
                Err(e) => {
                    let e: actix_web::Error = e.into();
                    return Ok(req.into_response(e.error_response()).map_into_right_body());
                }
            };

            if verdict.decision.is_denied() {
                let response: HttpResponse = (denied_response)(&verdict);
                return Ok(req.into_response(response).map_into_right_body());
            }

            let mut service_response = service.call(req).await?;

            if let Some(usage) = &verdict.usage {
                builder::insert_usage_headers(service_response.headers_mut(), usage);
            }

            Ok(service_response.map_into_left_body())
        })
    }
}
