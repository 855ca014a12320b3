//! Inventory service API client
//!
//! Implements the REST client for the interface/subnet inventory service.
//! Endpoints: /v1/subnets, /v1/instances/{id}/interfaces, /v1/interfaces

use crate::error::ProviderError;
use crate::models::*;
use crate::provider_trait::ProviderApi;
use reqwest::{Client, RequestBuilder, Response};
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::time::Duration;
use tracing::debug;

/// Inventory service API client
#[derive(Debug, Clone)]
pub struct HttpProviderClient {
    client: Client,
    base_url: String,
    token: Option<String>,
}

impl HttpProviderClient {
    /// Create a new client
    ///
    /// # Arguments
    /// * `base_url` - Inventory service base URL (e.g., "http://eni-inventory:8080")
    /// * `token` - Optional bearer token
    pub fn new(base_url: String, token: Option<String>) -> Result<Self, ProviderError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(30))
            .build()?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            token,
        })
    }

    /// Get the base URL
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn authorized(&self, request: RequestBuilder) -> RequestBuilder {
        let request = request.header("Accept", "application/json");
        match &self.token {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }

    async fn get<T: DeserializeOwned>(&self, path: &str) -> Result<T, ProviderError> {
        let url = format!("{}{}", self.base_url, path);
        debug!("GET {}", url);

        let response = self.authorized(self.client.get(&url)).send().await?;
        Self::decode(response, "GET", path).await
    }

    async fn post<B: Serialize + ?Sized, T: DeserializeOwned>(
        &self,
        path: &str,
        body: &B,
    ) -> Result<T, ProviderError> {
        let url = format!("{}{}", self.base_url, path);
        debug!("POST {}", url);

        let response = self
            .authorized(self.client.post(&url))
            .json(body)
            .send()
            .await?;
        Self::decode(response, "POST", path).await
    }

    async fn decode<T: DeserializeOwned>(
        response: Response,
        method: &str,
        path: &str,
    ) -> Result<T, ProviderError> {
        let status = response.status();
        if status == 404 {
            let body = response.text().await.unwrap_or_default();
            return Err(ProviderError::NotFound(format!("{} - {}", path, body)));
        }

        if status == 409 {
            let body = response.text().await.unwrap_or_default();
            return Err(ProviderError::SubnetExhausted(format!("{} - {}", path, body)));
        }

        if status == 422 {
            let body = response.text().await.unwrap_or_default();
            return Err(ProviderError::InterfaceLimit(format!("{} - {}", path, body)));
        }

        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ProviderError::Api(format!(
                "{} {} failed: {} - {}",
                method, path, status, body
            )));
        }

        let text = response.text().await?;
        Ok(serde_json::from_str(&text)?)
    }
}

#[async_trait::async_trait]
impl ProviderApi for HttpProviderClient {
    async fn list_subnets(&self) -> Result<Vec<Subnet>, ProviderError> {
        self.get("/v1/subnets").await
    }

    async fn list_interfaces(&self, instance_id: &str) -> Result<Vec<Interface>, ProviderError> {
        let path = format!(
            "/v1/instances/{}/interfaces",
            urlencoding::encode(instance_id)
        );
        let mut interfaces: Vec<Interface> = self.get(&path).await?;
        interfaces.sort_by_key(|interface| interface.index);
        Ok(interfaces)
    }

    async fn create_interface(&self, request: &CreateInterfaceRequest) -> Result<Interface, ProviderError> {
        self.post("/v1/interfaces", request).await
    }

    async fn allocate_addresses(&self, interface_id: &str, count: u32) -> Result<Vec<AllocatedAddress>, ProviderError> {
        if count == 0 {
            return Err(ProviderError::InvalidRequest(format!(
                "zero addresses requested for interface {}",
                interface_id
            )));
        }

        let path = format!(
            "/v1/interfaces/{}/addresses",
            urlencoding::encode(interface_id)
        );
        self.post(&path, &AllocateAddressesRequest { count }).await
    }
}
