//! HTTP client for the control plane API.

use anyhow::{Context, Result};
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION};
use serde::{de::DeserializeOwned, Deserialize, Serialize};

use crate::error::CliError;

/// API client speaking for one workload.
#[derive(Debug, Clone)]
pub struct ApiClient {
    client: reqwest::Client,
    base_url: String,
}

impl ApiClient {
    pub fn new(api_url: &str, workload: &str) -> Result<Self> {
        let mut headers = HeaderMap::new();
        headers.insert(
            AUTHORIZATION,
            HeaderValue::from_str(&format!("Bearer workload:{workload}"))
                .context("Invalid workload name")?,
        );

        let client = reqwest::Client::builder()
            .default_headers(headers)
            .build()
            .context("Failed to create HTTP client")?;

        Ok(Self {
            client,
            base_url: api_url.trim_end_matches('/').to_string(),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    pub async fn get<T: DeserializeOwned, Q: Serialize + ?Sized>(
        &self,
        path: &str,
        query: &Q,
    ) -> Result<T, CliError> {
        let response = self.client.get(self.url(path)).query(query).send().await?;
        handle_response(response).await
    }

    pub async fn post<T: DeserializeOwned, Q: Serialize + ?Sized, B: Serialize>(
        &self,
        path: &str,
        query: &Q,
        body: &B,
    ) -> Result<T, CliError> {
        let response = self
            .client
            .post(self.url(path))
            .query(query)
            .json(body)
            .send()
            .await?;
        handle_response(response).await
    }

    pub async fn delete<T: DeserializeOwned, Q: Serialize + ?Sized>(
        &self,
        path: &str,
        query: &Q,
    ) -> Result<T, CliError> {
        let response = self
            .client
            .delete(self.url(path))
            .query(query)
            .send()
            .await?;
        handle_response(response).await
    }
}

async fn handle_response<T: DeserializeOwned>(response: reqwest::Response) -> Result<T, CliError> {
    let status = response.status();

    if status.is_success() {
        return response
            .json()
            .await
            .map_err(|e| CliError::Other(anyhow::anyhow!("Failed to parse response: {}", e)));
    }

    let problem: Problem = response.json().await.unwrap_or_else(|_| Problem {
        code: "unknown".to_string(),
        detail: format!("request failed with status {status}"),
        hint: None,
        retryable: false,
    });

    Err(CliError::Api {
        status: status.as_u16(),
        code: problem.code,
        message: problem.detail,
        hint: problem.hint,
        retryable: problem.retryable,
    })
}

/// Problem document returned on errors.
#[derive(Debug, Deserialize)]
struct Problem {
    code: String,
    detail: String,
    #[serde(default)]
    hint: Option<String>,
    #[serde(default)]
    retryable: bool,
}
