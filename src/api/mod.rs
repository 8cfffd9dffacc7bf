pub mod envelope;
pub mod http;
pub mod types;

use anyhow::Result;
use async_trait::async_trait;

pub use types::{FilePart, HttpReply, Route};

/// Transport seam between the harness and the system under test.
///
/// Implementations only move bytes: a non-2xx status is still `Ok`. `Err`
/// means the exchange itself failed (connect, DNS, timeout, body read) and
/// the caller turns it into a per-job classification.
#[async_trait]
pub trait JobApi: Send + Sync {
    async fn submit(&self, route: &Route, files: Vec<FilePart>) -> Result<HttpReply>;
    async fn job_status(&self, route: &Route, job_id: &str) -> Result<HttpReply>;
}
