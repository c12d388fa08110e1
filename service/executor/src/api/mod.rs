//! The client side of the three central services (queue, usage, event).
//!
//! All three speak JSON over HTTP under a single base URL. Every unary call
//! carries a deadline handed down from the periodic task that makes it, and
//! classifies its failures through [Retryable](error::Retryable) so that the
//! task manager can tell the weather apart from genuine rejections.

pub mod event;
pub mod queue;
pub mod usage;

use error::*;
use result::Result;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::time::Duration;

/// Everything that can go wrong calling the central services.
#[derive(Error, ExecError, Kind, Debug)]
pub enum ApiCallError {
    #[error("The call to {path} failed in transport")]
    Transport {
        path: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("The central server rejected the call to {path} with HTTP {code}: {body}")]
    Rejected { path: String, code: u16, body: String },
    #[error("The response from {path} could not be decoded")]
    Decode {
        path: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("'{endpoint}' is not a usable base URL for the central services: {detail}")]
    BadEndpoint { endpoint: String, detail: String },
}

impl Retryable for ApiCallError {
    fn retry(&self) -> Retry {
        match self {
            // Timeouts and throttling clear on their own. Any other 4xx means
            // the request body itself is unacceptable and resending the same
            // bytes will change nothing.
            ApiCallError::Rejected { code, .. } => match code {
                408 | 429 => Retry::Transient,
                code if *code >= 400 && *code < 500 => Retry::Fatal,
                _ => Retry::Transient,
            },
            ApiCallError::BadEndpoint { .. } => Retry::Fatal,
            _ => Retry::Transient,
        }
    }
}

/// One authenticated connection to the central services, shared by the queue,
/// usage, and event clients.
pub struct ApiConnection {
    base: reqwest::Url,
    client: reqwest::Client,
    token: Option<String>,
}

impl ApiConnection {
    /// Validates the endpoint and builds the underlying HTTP client. This does
    /// not perform a round trip; the first periodic task to fire will discover
    /// an unreachable server soon enough, and unlike a bad URL that condition
    /// can heal.
    pub fn connect(endpoint: &str, token: Option<String>) -> Result<ApiConnection> {
        let base = reqwest::Url::parse(endpoint).map_err(|err| ApiCallError::BadEndpoint {
            endpoint: endpoint.to_string(),
            detail: err.to_string(),
        })?;
        let client = reqwest::Client::builder()
            .build()
            .map_err(|source| ApiCallError::Transport {
                path: endpoint.to_string(),
                source,
            })?;
        Ok(ApiConnection {
            base,
            client,
            token,
        })
    }

    fn url(&self, path: &str) -> reqwest::Url {
        let mut url = self.base.clone();
        {
            let mut segments = url.path_segments_mut().expect("base URL cannot be a base");
            segments.pop_if_empty();
            for segment in path.trim_start_matches('/').split('/') {
                segments.push(segment);
            }
        }
        url
    }

    fn authorize(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.token {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }

    pub(crate) fn get(&self, path: &str) -> reqwest::RequestBuilder {
        self.authorize(self.client.get(self.url(path)))
    }

    /// POSTs `body` to `path` and decodes the JSON response.
    pub(crate) async fn post_json<B, T>(&self, path: &str, body: &B, deadline: Duration) -> Result<T>
    where
        B: Serialize + ?Sized,
        T: DeserializeOwned,
    {
        let response = self.execute(path, body, deadline).await?;
        Ok(response
            .json()
            .await
            .map_err(|source| ApiCallError::Decode {
                path: path.to_string(),
                source,
            })?)
    }

    /// POSTs `body` to `path`, discarding whatever body the server answers
    /// with. Used for the fire-and-acknowledge endpoints (return, usage,
    /// events).
    pub(crate) async fn post(&self, path: &str, body: &impl Serialize, deadline: Duration) -> Result<()> {
        self.execute(path, body, deadline).await?;
        Ok(())
    }

    async fn execute(
        &self,
        path: &str,
        body: &(impl Serialize + ?Sized),
        deadline: Duration,
    ) -> Result<reqwest::Response> {
        let response = self
            .authorize(self.client.post(self.url(path)))
            .timeout(deadline)
            .json(body)
            .send()
            .await
            .map_err(|source| ApiCallError::Transport {
                path: path.to_string(),
                source,
            })?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ApiCallError::Rejected {
                path: path.to_string(),
                code: status.as_u16(),
                body,
            }
            .into());
        }
        Ok(response)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bad_endpoints_are_fatal() {
        let err = ApiConnection::connect("not a url", None).unwrap_err();
        assert!(err.is_fatal());
        assert_eq!("ApiCallError::BadEndpoint", err.kind());
    }

    #[test]
    fn rejection_dispositions() {
        let rejected = |code| ApiCallError::Rejected {
            path: "/v1/queue/leases".to_string(),
            code,
            body: "".to_string(),
        };
        assert!(rejected(400).is_fatal());
        assert!(rejected(422).is_fatal());
        assert!(rejected(408).is_transient());
        assert!(rejected(429).is_transient());
        assert!(rejected(500).is_transient());
    }

    #[test]
    fn urls_join_cleanly() {
        let connection = ApiConnection::connect("https://batch.example.com/api/", None).unwrap();
        assert_eq!(
            "https://batch.example.com/api/v1/queue/leases",
            connection.url("/v1/queue/leases").as_str()
        );
    }
}
