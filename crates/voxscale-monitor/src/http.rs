//! JSON-over-HTTP adapters for the queue service and the telemetry sink.
//!
//! - `GET /queues/{name}` → `{"depth": 3, "oldest_message_age_seconds": 1.5}`
//! - `GET /fleets/{fleet}/latency?namespace=…&metric=…` → `[LatencySample]`

use std::time::Duration;

use async_trait::async_trait;
use voxscale_core::http::get_json;
use voxscale_state::LatencySample;

use crate::error::MonitorResult;
use crate::source::{QueueReading, QueueSource, TelemetrySource};

/// Queue service reached over HTTP.
#[derive(Debug, Clone)]
pub struct HttpQueueSource {
    address: String,
    timeout: Duration,
}

impl HttpQueueSource {
    pub fn new(address: impl Into<String>, timeout: Duration) -> Self {
        Self {
            address: address.into(),
            timeout,
        }
    }
}

#[async_trait]
impl QueueSource for HttpQueueSource {
    async fn queue_depth(&self, queue: &str) -> MonitorResult<QueueReading> {
        let path = format!("/queues/{queue}");
        Ok(get_json(&self.address, &path, self.timeout).await?)
    }
}

/// Telemetry sink reached over HTTP.
#[derive(Debug, Clone)]
pub struct HttpTelemetrySource {
    address: String,
    timeout: Duration,
}

impl HttpTelemetrySource {
    pub fn new(address: impl Into<String>, timeout: Duration) -> Self {
        Self {
            address: address.into(),
            timeout,
        }
    }
}

#[async_trait]
impl TelemetrySource for HttpTelemetrySource {
    async fn latency(
        &self,
        fleet: &str,
        namespace: &str,
        metric_name: &str,
    ) -> MonitorResult<Vec<LatencySample>> {
        let path = format!("/fleets/{fleet}/latency?namespace={namespace}&metric={metric_name}");
        Ok(get_json(&self.address, &path, self.timeout).await?)
    }
}
