//! API Client
//!
//! HTTP client for the dispatch server's account and scheduled task endpoints.
//! Every response is wrapped as `{code, message, data}`; `code == 200` means
//! success.

use anyhow::{bail, Context, Result};
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION, CONTENT_TYPE};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use tracing::debug;

use crate::config::Config;

const SUCCESS_CODE: i64 = 200;

#[derive(Debug, Deserialize)]
pub struct ApiResponse<T> {
    pub code: i64,
    #[serde(default)]
    pub message: Option<String>,
    pub data: Option<T>,
}

impl<T> ApiResponse<T> {
    /// Payload of a successful response, which may be empty
    pub fn into_data(self) -> Result<Option<T>> {
        if self.code != SUCCESS_CODE {
            let message = self.message.unwrap_or_else(|| "request failed".to_string());
            bail!("[{}] {}", self.code, message);
        }
        Ok(self.data)
    }
}

pub struct ApiClient {
    client: reqwest::Client,
    base_url: String,
}

impl ApiClient {
    /// Create from saved config, optionally authenticated with a bearer token
    pub fn from_config(config: &Config, token: Option<&str>) -> Result<Self> {
        Self::new(config.api_url(), token)
    }

    pub fn new(base_url: &str, token: Option<&str>) -> Result<Self> {
        let mut headers = HeaderMap::new();
        if let Some(token) = token {
            headers.insert(
                AUTHORIZATION,
                HeaderValue::from_str(&format!("Bearer {}", token))?,
            );
        }
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));

        let client = reqwest::Client::builder()
            .default_headers(headers)
            .build()?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}/api{}", self.base_url, path)
    }

    /// GET request
    pub async fn get<T: DeserializeOwned>(&self, path: &str) -> Result<Option<T>> {
        let url = self.url(path);
        debug!(%url, "GET");
        let response = self
            .client
            .get(&url)
            .send()
            .await
            .with_context(|| format!("Failed to connect to {}", url))?;

        Self::decode(response).await
    }

    /// POST request
    pub async fn post<T: DeserializeOwned, B: serde::Serialize>(
        &self,
        path: &str,
        body: &B,
    ) -> Result<Option<T>> {
        let url = self.url(path);
        debug!(%url, "POST");
        let response = self
            .client
            .post(&url)
            .json(body)
            .send()
            .await
            .with_context(|| format!("Failed to connect to {}", url))?;

        Self::decode(response).await
    }

    async fn decode<T: DeserializeOwned>(response: reqwest::Response) -> Result<Option<T>> {
        let status = response.status();
        let text = response.text().await?;
        let body: ApiResponse<T> = serde_json::from_str(&text)
            .with_context(|| format!("Unexpected API response (HTTP {})", status))?;
        body.into_data()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Value;

    #[derive(Debug, Deserialize)]
    struct Token {
        token: String,
    }

    #[test]
    fn test_success_response() {
        let body: ApiResponse<Token> =
            serde_json::from_str(r#"{"code":200,"message":"ok","data":{"token":"jwt"}}"#).unwrap();
        assert_eq!(body.into_data().unwrap().unwrap().token, "jwt");
    }

    #[test]
    fn test_success_without_data() {
        let body: ApiResponse<Value> = serde_json::from_str(r#"{"code":200,"message":"ok"}"#).unwrap();
        assert!(body.into_data().unwrap().is_none());
    }

    #[test]
    fn test_error_code_is_reported() {
        let body: ApiResponse<Token> =
            serde_json::from_str(r#"{"code":401,"message":"bad credentials","data":null}"#).unwrap();
        let err = body.into_data().unwrap_err().to_string();
        assert_eq!(err, "[401] bad credentials");
    }

    #[test]
    fn test_urls() {
        let api = ApiClient::new("http://localhost:8090/", None).unwrap();
        assert_eq!(api.url("/login"), "http://localhost:8090/api/login");
    }
}
