use std::time::Duration;

use hikibridge_core::types::{ChangeEvent, ChangeKind};
use mockall::automock;
use reqwest::blocking::Client;
use serde_derive::{Deserialize, Serialize};

use crate::error::DeliveryError;

pub const DEFAULT_CLIENT_TIMEOUT: u64 = 30;
pub const IDEMPOTENCY_KEY_HEADER: &str = "Idempotency-Key";

/// Body sent to the API for one change event. Only file metadata and its
/// fingerprint are sent, the file content is not uploaded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Payload {
    pub kind: ChangeKind,
    pub path: String,
    pub size: Option<u64>,
    pub modified_at: Option<u64>,
    pub fingerprint: Option<String>,
    pub idempotency_key: String,
}

impl From<&ChangeEvent> for Payload {
    fn from(event: &ChangeEvent) -> Self {
        Self {
            kind: event.kind,
            path: event.path.to_string(),
            size: event.current.as_ref().map(|record| record.size),
            modified_at: event.current.as_ref().map(|record| record.modified_at.0),
            fingerprint: event.fingerprint().map(|fingerprint| fingerprint.0.clone()),
            idempotency_key: event.idempotency_key(),
        }
    }
}

#[automock]
pub trait IngestClient {
    fn send(&self, payload: &Payload) -> Result<(), DeliveryError>;
}

pub struct HttpIngestClient {
    client: Client,
    endpoint: String,
    api_key: String,
}

impl HttpIngestClient {
    pub fn new(endpoint: String, api_key: String) -> Result<Self, DeliveryError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(DEFAULT_CLIENT_TIMEOUT))
            .build()?;
        Ok(Self {
            client,
            endpoint,
            api_key,
        })
    }
}

impl IngestClient for HttpIngestClient {
    fn send(&self, payload: &Payload) -> Result<(), DeliveryError> {
        let response = self
            .client
            .post(&self.endpoint)
            .bearer_auth(&self.api_key)
            .header(IDEMPOTENCY_KEY_HEADER, &payload.idempotency_key)
            .json(payload)
            .send()?;

        let status = response.status();
        if status.is_success() {
            return Ok(());
        }

        let message = response
            .text()
            .unwrap_or_else(|_| status.canonical_reason().unwrap_or("").to_string());
        Err(DeliveryError::from_status(status.as_u16(), message))
    }
}
