//! HashiCorp Vault KV v2 provider

use async_trait::async_trait;
use reqwest::StatusCode;
use serde_json::{json, Value};
use std::time::Duration;
use tracing::debug;

use crate::{validate_key, Provider, SecretsError};

pub struct VaultProvider {
    client: reqwest::Client,
    addr: String,
    mount: String,
    path: String,
    token: Option<String>,
}

impl VaultProvider {
    pub fn new(
        addr: &str,
        mount: String,
        path: String,
        token: Option<String>,
    ) -> Result<Self, SecretsError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| SecretsError::ProviderError(format!("HTTP client: {}", e)))?;

        Ok(Self {
            client,
            addr: addr.trim_end_matches('/').to_string(),
            mount: mount.trim_matches('/').to_string(),
            path: path.trim_matches('/').to_string(),
            token,
        })
    }

    fn data_url(&self, key: &str) -> String {
        format!("{}/v1/{}/data/{}/{}", self.addr, self.mount, self.path, key)
    }

    fn metadata_url(&self, key: &str) -> String {
        format!("{}/v1/{}/metadata/{}/{}", self.addr, self.mount, self.path, key)
    }

    fn request(&self, method: reqwest::Method, url: String) -> reqwest::RequestBuilder {
        let builder = self.client.request(method, url);
        match &self.token {
            Some(token) => builder.header("X-Vault-Token", token),
            None => builder,
        }
    }
}

fn provider_error(e: reqwest::Error) -> SecretsError {
    SecretsError::ProviderError(format!("Vault request failed: {}", e))
}

#[async_trait]
impl Provider for VaultProvider {
    async fn get(&self, key: &str) -> Result<String, SecretsError> {
        validate_key(key)?;
        debug!(key = %key, "Reading secret from Vault");

        let response = self
            .request(reqwest::Method::GET, self.data_url(key))
            .send()
            .await
            .map_err(provider_error)?;

        match response.status() {
            StatusCode::NOT_FOUND => return Err(SecretsError::NotFound(key.to_string())),
            status if !status.is_success() => {
                return Err(SecretsError::ProviderError(format!(
                    "Vault returned {} for {}",
                    status, key
                )))
            }
            _ => {}
        }

        let body: Value = response.json().await.map_err(provider_error)?;
        body.pointer("/data/data/value")
            .and_then(Value::as_str)
            .map(String::from)
            .ok_or_else(|| SecretsError::NotFound(key.to_string()))
    }

    async fn set(&self, key: &str, value: &str) -> Result<(), SecretsError> {
        validate_key(key)?;

        let response = self
            .request(reqwest::Method::POST, self.data_url(key))
            .json(&json!({ "data": { "value": value } }))
            .send()
            .await
            .map_err(provider_error)?;

        if !response.status().is_success() {
            return Err(SecretsError::ProviderError(format!(
                "Vault returned {} writing {}",
                response.status(),
                key
            )));
        }
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), SecretsError> {
        validate_key(key)?;

        let response = self
            .request(reqwest::Method::DELETE, self.metadata_url(key))
            .send()
            .await
            .map_err(provider_error)?;

        match response.status() {
            StatusCode::NOT_FOUND => Err(SecretsError::NotFound(key.to_string())),
            status if status.is_success() => Ok(()),
            status => Err(SecretsError::ProviderError(format!(
                "Vault returned {} deleting {}",
                status, key
            ))),
        }
    }

    fn name(&self) -> &str {
        "vault"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{body_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn provider(server: &MockServer) -> VaultProvider {
        VaultProvider::new(
            &server.uri(),
            "secret".to_string(),
            "dotmac".to_string(),
            Some("root-token".to_string()),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_get_secret() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v1/secret/data/dotmac/db/password"))
            .and(header("X-Vault-Token", "root-token"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "data": { "data": { "value": "hunter2" }, "metadata": { "version": 3 } }
            })))
            .mount(&server)
            .await;

        let value = provider(&server).get("db/password").await.unwrap();
        assert_eq!(value, "hunter2");
    }

    #[tokio::test]
    async fn test_get_missing_secret() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(404).set_body_json(json!({ "errors": [] })))
            .mount(&server)
            .await;

        let err = provider(&server).get("nope").await.unwrap_err();
        assert!(matches!(err, SecretsError::NotFound(k) if k == "nope"));
    }

    #[tokio::test]
    async fn test_set_secret() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/secret/data/dotmac/smtp"))
            .and(body_json(json!({ "data": { "value": "pw" } })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "data": { "version": 1 } })))
            .expect(1)
            .mount(&server)
            .await;

        provider(&server).set("smtp", "pw").await.unwrap();
    }

    #[tokio::test]
    async fn test_delete_secret_and_server_error() {
        let server = MockServer::start().await;
        Mock::given(method("DELETE"))
            .and(path("/v1/secret/metadata/dotmac/old"))
            .respond_with(ResponseTemplate::new(204))
            .mount(&server)
            .await;
        Mock::given(method("DELETE"))
            .and(path("/v1/secret/metadata/dotmac/broken"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;

        let vault = provider(&server);
        vault.delete("old").await.unwrap();
        assert!(matches!(
            vault.delete("broken").await,
            Err(SecretsError::ProviderError(_))
        ));
    }
}
