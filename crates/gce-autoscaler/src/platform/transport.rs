//! Authorized JSON-over-HTTPS calls shared by the compute and container clients.

use std::sync::Arc;
use std::time::Duration;

use error_stack::Report;
use error_stack::ResultExt;
use reqwest::Method;
use reqwest::RequestBuilder;
use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::platform::auth::TokenSource;
use crate::platform::CloudError;
use crate::platform::CloudResult;

pub(crate) struct JsonTransport {
    http: reqwest::Client,
    tokens: Arc<dyn TokenSource>,
}

impl JsonTransport {
    pub(crate) fn new(
        request_timeout: Duration,
        user_agent: &str,
        tokens: Arc<dyn TokenSource>,
    ) -> CloudResult<Self> {
        let http = reqwest::Client::builder()
            .timeout(request_timeout)
            .user_agent(user_agent)
            .build()
            .change_context(CloudError::Configuration {
                message: "Failed to create HTTP client".into(),
            })?;
        Ok(Self { http, tokens })
    }

    pub(crate) fn request(&self, method: Method, url: &str) -> RequestBuilder {
        self.http.request(method, url)
    }

    /// Sends `request` with a bearer token and decodes the JSON body.
    ///
    /// 404 becomes [`CloudError::NotFound`]; other non-2xx statuses become [`CloudError::Api`].
    pub(crate) async fn send<T: DeserializeOwned>(
        &self,
        request: RequestBuilder,
        url: &str,
    ) -> CloudResult<T> {
        let token = self.tokens.token().await?;
        let response = request
            .bearer_auth(token)
            .send()
            .await
            .change_context(CloudError::Transport {
                message: format!("request to {url} failed"),
            })?;

        let status = response.status();
        if status == StatusCode::NOT_FOUND {
            return Err(Report::new(CloudError::NotFound {
                resource: url.to_string(),
            }));
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(Report::new(CloudError::Api {
                status: status.as_u16(),
                message: body,
            })
            .attach_printable(format!("url: {url}")));
        }

        let bytes = response
            .bytes()
            .await
            .change_context(CloudError::Transport {
                message: format!("reading response of {url} failed"),
            })?;
        serde_json::from_slice(&bytes).change_context(CloudError::Serialization {
            message: format!("unexpected response body from {url}"),
        })
    }

    pub(crate) async fn get<T: DeserializeOwned>(&self, url: &str) -> CloudResult<T> {
        self.send(self.http.get(url), url).await
    }

    pub(crate) async fn delete<T: DeserializeOwned>(&self, url: &str) -> CloudResult<T> {
        self.send(self.http.delete(url), url).await
    }

    pub(crate) async fn post<B: Serialize + Sync, T: DeserializeOwned>(
        &self,
        url: &str,
        body: Option<&B>,
    ) -> CloudResult<T> {
        let request = self.http.post(url);
        let request = match body {
            Some(body) => request.json(body),
            None => request.header(reqwest::header::CONTENT_LENGTH, 0),
        };
        self.send(request, url).await
    }
}
