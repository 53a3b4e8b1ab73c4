//! JSON-over-HTTP adapter for the worker fleet API.
//!
//! | Method | Path | Body |
//! |---|---|---|
//! | POST | `/fleets/{fleet}/desired-capacity` | `{"desired": 3}` |
//! | GET | `/fleets/{fleet}/instances` | → `[WorkerInstance]` |
//! | POST | `/fleets/{fleet}/instances/{id}/protection` | `{"protected": true}` |
//! | POST | `/fleets/{fleet}/instances/{id}/terminate` | `{"decrement_desired_capacity": true}` |
//! | GET | `/fleets/{fleet}/events` | → `[InstanceEvent]` |

use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;
use voxscale_core::http::{get_json, post_json};

use crate::api::{FleetApi, InstanceEvent, WorkerInstance};
use crate::error::FleetResult;

#[derive(Debug, Clone)]
pub struct HttpFleetApi {
    address: String,
    fleet: String,
    timeout: Duration,
}

impl HttpFleetApi {
    pub fn new(address: impl Into<String>, fleet: impl Into<String>, timeout: Duration) -> Self {
        Self {
            address: address.into(),
            fleet: fleet.into(),
            timeout,
        }
    }

    fn path(&self, suffix: &str) -> String {
        format!("/fleets/{}{suffix}", self.fleet)
    }
}

#[async_trait]
impl FleetApi for HttpFleetApi {
    async fn set_desired_capacity(&self, desired: u32) -> FleetResult<()> {
        post_json(
            &self.address,
            &self.path("/desired-capacity"),
            &json!({ "desired": desired }),
            self.timeout,
        )
        .await?;
        Ok(())
    }

    async fn list_instances(&self) -> FleetResult<Vec<WorkerInstance>> {
        Ok(get_json(&self.address, &self.path("/instances"), self.timeout).await?)
    }

    async fn protect(&self, instance_id: &str, protected: bool) -> FleetResult<()> {
        post_json(
            &self.address,
            &self.path(&format!("/instances/{instance_id}/protection")),
            &json!({ "protected": protected }),
            self.timeout,
        )
        .await?;
        Ok(())
    }

    async fn terminate(&self, instance_id: &str) -> FleetResult<()> {
        post_json(
            &self.address,
            &self.path(&format!("/instances/{instance_id}/terminate")),
            &json!({ "decrement_desired_capacity": true }),
            self.timeout,
        )
        .await?;
        Ok(())
    }

    async fn drain_events(&self) -> FleetResult<Vec<InstanceEvent>> {
        Ok(get_json(&self.address, &self.path("/events"), self.timeout).await?)
    }
}
