//! `FleetApi` over the HTTP backends.

use chrono::NaiveDateTime;
use serde_json::{json, Value};

use crate::core::session::FleetApi;
use crate::retrieve::ky_http::{ApiClient, RequestError, ServerTarget};
use crate::telemetry::dto::{parse_timestamp, CompletionRow, CurrentListEntry, InstalledSource, ServerEnvelope};
use crate::telemetry::mapper::map_current_list;
use crate::telemetry::model::{MachineId, MachineRecord};

pub const CURRENT_LIST_PATH: &str = "/machine/currentList";
pub const INSTALLED_SOURCES_PATH: &str = "/api/cloud/installedTransmitters";
pub const REGISTER_SOURCE_PATH: &str = "/api/edge/edge_machine_stat";
pub const COMPLETION_TIME_PATH: &str = "/mon/prd_end";

pub struct FleetClient {
    client: ApiClient,
}

impl FleetClient {
    pub fn new(client: ApiClient) -> Self {
        Self { client }
    }
}

impl FleetApi for FleetClient {
    type Error = RequestError;

    async fn current_list(&self) -> Result<Vec<MachineRecord>, RequestError> {
        let response = self
            .client
            .get::<Vec<CurrentListEntry>>(ServerTarget::Baro, CURRENT_LIST_PATH)
            .await?;
        Ok(map_current_list(response.data))
    }

    async fn installed_sources(&self) -> Result<Vec<String>, RequestError> {
        let response = self
            .client
            .post::<ServerEnvelope<Vec<InstalledSource>>, Value>(ServerTarget::Apis, INSTALLED_SOURCES_PATH, None)
            .await?;
        Ok(response.data.data.into_iter().map(|s| s.id).collect())
    }

    async fn register_source(&self, source: &str) -> Result<(), RequestError> {
        self.client
            .post::<Value, Value>(
                ServerTarget::Edge,
                REGISTER_SOURCE_PATH,
                Some(json!({ "transmitter": source })),
            )
            .await?;
        Ok(())
    }

    async fn completion_time(&self, id: &MachineId) -> Result<Option<NaiveDateTime>, RequestError> {
        let path = format!("{}/{}", COMPLETION_TIME_PATH, id);
        let response = self.client.get::<Vec<CompletionRow>>(ServerTarget::Baro, &path).await?;
        Ok(response
            .data
            .into_iter()
            .next()
            .and_then(|row| row.prdct_end)
            .as_deref()
            .and_then(parse_timestamp))
    }
}
