use crate::store::{Snapshot, Store};
use actix_web::http::StatusCode;
use actix_web::ResponseError;
use async_trait::async_trait;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
#[error("Mock store unavailable")]
pub struct MockError;

impl ResponseError for MockError {
    fn status_code(&self) -> StatusCode {
        StatusCode::SERVICE_UNAVAILABLE
    }
}

/// A store that fails every operation, counting how often it was called.
#[derive(Clone, Default)]
pub struct FailingStore(Arc<AtomicU64>);

impl FailingStore {
    pub fn calls(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }

    fn fail<T>(&self) -> Result<T, MockError> {
        self.0.fetch_add(1, Ordering::Relaxed);
        Err(MockError)
    }
}

#[async_trait]
impl Store for FailingStore {
    type Error = MockError;

    async fn increment(&self, _: &str, _: u64, _: Duration) -> Result<Snapshot, MockError> {
        self.fail()
    }

    async fn increment_below(
        &self,
        _: &str,
        _: u64,
        _: Duration,
    ) -> Result<(bool, Snapshot), MockError> {
        self.fail()
    }

    async fn get(&self, _: &str) -> Result<Snapshot, MockError> {
        self.fail()
    }

    async fn decrement(&self, _: &str) -> Result<(), MockError> {
        self.fail()
    }

    async fn append_within(
        &self,
        _: &str,
        _: u64,
        _: Duration,
    ) -> Result<(bool, Snapshot), MockError> {
        self.fail()
    }

    async fn get_log(&self, _: &str, _: Duration) -> Result<Snapshot, MockError> {
        self.fail()
    }

    async fn reset_key(&self, _: &str) -> Result<(), MockError> {
        self.fail()
    }

    async fn reset_all(&self) -> Result<(), MockError> {
        self.fail()
    }

    async fn close(&self) -> Result<(), MockError> {
        Ok(())
    }
}
