use super::{ApiCallError, ApiConnection};
use crate::events::Event;
use futures_util::StreamExt;
use result::Result;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncBufRead;
use tokio_util::io::StreamReader;

#[derive(Serialize)]
struct ReportRequest<'a> {
    events: &'a [Event],
}

/// The client of the central event service: unary batch reporting plus the
/// server-streamed read-back used by reconciliation.
pub struct EventApi {
    connection: Arc<ApiConnection>,
}

impl EventApi {
    pub fn new(connection: Arc<ApiConnection>) -> EventApi {
        EventApi { connection }
    }

    /// Delivers a batch of events. The server applies them in the order given,
    /// which is what makes the reporter's per (queue, job set) ordering
    /// guarantee hold end to end.
    pub async fn report(&self, events: &[Event], deadline: Duration) -> Result<()> {
        self.connection
            .post("/v1/events", &ReportRequest { events }, deadline)
            .await
    }

    /// Opens the long-poll NDJSON stream for one job set. With `watch` the
    /// server holds the stream open and keeps appending; without it the server
    /// sends what it has and closes, which is the shape reconciliation wants.
    ///
    /// The returned reader is raw framing. Line splitting, record decoding,
    /// cursor tracking, and reconnects all belong to
    /// [EventStreamReader](crate::events::stream::EventStreamReader).
    pub async fn open_stream(
        &self,
        queue: &str,
        job_set_id: &str,
        from_message_id: Option<&str>,
        watch: bool,
    ) -> Result<impl AsyncBufRead + Unpin> {
        let path = "/v1/events/stream";
        let mut request = self.connection.get(path).query(&[
            ("queue", queue),
            ("job_set_id", job_set_id),
            ("watch", if watch { "true" } else { "false" }),
        ]);
        if let Some(from) = from_message_id {
            request = request.query(&[("from_message_id", from)]);
        }
        let response = request
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
        let bytes = response
            .bytes_stream()
            .map(|chunk| chunk.map_err(|err| std::io::Error::new(std::io::ErrorKind::Other, err)))
            .boxed();
        Ok(StreamReader::new(bytes))
    }
}
