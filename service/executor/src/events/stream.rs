use crate::api::event::EventApi;
use crate::events::Event;
use crate::shutdown::Shutdown;
use error::*;
use result::Result;
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;
use term_colors::*;
use tokio::io::{AsyncBufRead, AsyncBufReadExt};

/// One framed record of the event stream. Either side may be absent; a keep
/// alive line is `{}` and a server complaint is `{"error": "..."}`.
#[derive(Deserialize)]
struct StreamRecord {
    #[serde(default)]
    result: Option<StreamResult>,
    #[serde(default)]
    error: Option<String>,
}

#[derive(Deserialize)]
struct StreamResult {
    id: String,
    message: serde_json::Value,
}

/// The event stream failed more consecutive times than a bounded consumer
/// tolerates.
#[derive(Error, ExecError, Kind, Retryable, Debug)]
#[retry(Retry::Transient)]
#[error(
    "The event stream for job set {job_set_id} in queue {queue} failed {failures} \
consecutive times. Giving up on this pass; the next one starts fresh."
)]
pub struct StreamExhausted {
    queue: String,
    job_set_id: String,
    failures: u32,
}

/// Reads the NDJSON event stream of one `(queue, job_set_id)` pair, invoking a
/// callback per decoded event.
///
/// The reader owns the resume cursor. Transport closures are transparent: it
/// reconnects from the highest message id it has observed, so a consumer sees
/// each record at most once no matter how flaky the transport is. In watch
/// mode it reconnects forever; in bounded mode it escalates after
/// `error_tolerance` consecutive failures, and a clean end of stream is simply
/// the end of the read.
///
/// The consecutive error count resets on EVERY successfully read line, even a
/// line that fails to decode and is dropped. A readable-but-garbled stream is
/// a healthy transport speaking a newer dialect, not a failing one.
pub struct EventStreamReader {
    api: Arc<EventApi>,
    queue: String,
    job_set_id: String,
    from_message_id: Option<String>,
    watch: bool,
    error_tolerance: u32,
    consecutive_errors: u32,
}

impl EventStreamReader {
    pub fn new<Q: AsRef<str>, S: AsRef<str>>(
        api: Arc<EventApi>,
        queue: Q,
        job_set_id: S,
        from_message_id: Option<String>,
        watch: bool,
        error_tolerance: u32,
    ) -> EventStreamReader {
        EventStreamReader {
            api,
            queue: queue.as_ref().to_string(),
            job_set_id: job_set_id.as_ref().to_string(),
            from_message_id,
            watch,
            error_tolerance,
            consecutive_errors: 0,
        }
    }

    /// The highest message id observed so far.
    pub fn last_seen(&self) -> Option<&str> {
        self.from_message_id.as_deref()
    }

    /// Runs the stream until it ends (bounded mode), the error budget is
    /// exhausted (bounded mode), or shutdown (either mode).
    pub async fn run<F>(&mut self, shutdown: &Shutdown, mut callback: F) -> Result<()>
    where
        F: FnMut(&str, Event),
    {
        loop {
            if shutdown.is_cancelled() {
                return Ok(());
            }
            let opened = tokio::select! {
                _ = shutdown.cancelled() => return Ok(()),
                opened = self.api.open_stream(
                    &self.queue,
                    &self.job_set_id,
                    self.from_message_id.as_deref(),
                    self.watch,
                ) => opened,
            };
            match opened {
                Ok(reader) => match self.drain(reader, shutdown, &mut callback).await {
                    Ok(()) => {
                        if shutdown.is_cancelled() {
                            return Ok(());
                        }
                        if !self.watch {
                            // The server sent everything it had and closed.
                            return Ok(());
                        }
                        debug!(
                            "The event stream for {} closed; resuming from {}",
                            cyan(&self.job_set_id),
                            cyan(self.last_seen().unwrap_or("the beginning"))
                        );
                    }
                    Err(err) => self.note_failure(format!("{}", err))?,
                },
                Err(err) => self.note_failure(format!("{}", err))?,
            }
            let delay = backoff_delay(self.consecutive_errors);
            tokio::select! {
                _ = shutdown.cancelled() => return Ok(()),
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }

    async fn drain<R, F>(
        &mut self,
        reader: R,
        shutdown: &Shutdown,
        callback: &mut F,
    ) -> std::io::Result<()>
    where
        R: AsyncBufRead + Unpin,
        F: FnMut(&str, Event),
    {
        let mut lines = reader.lines();
        loop {
            let line = tokio::select! {
                _ = shutdown.cancelled() => return Ok(()),
                line = lines.next_line() => line?,
            };
            let line = match line {
                None => return Ok(()),
                Some(line) => line,
            };
            self.absorb(&line, callback);
        }
    }

    /// Digests one raw line. Blank and malformed lines advance quietly,
    /// unknown event variants advance the cursor without a callback, and
    /// decoded events reach the callback alongside their id.
    fn absorb<F>(&mut self, line: &str, callback: &mut F)
    where
        F: FnMut(&str, Event),
    {
        // A line arrived, so the transport itself is healthy regardless of
        // what the line says.
        self.consecutive_errors = 0;
        let line = line.trim();
        if line.is_empty() {
            return;
        }
        let record: StreamRecord = match serde_json::from_str(line) {
            Ok(record) => record,
            Err(err) => {
                debug!(
                    "Skipping an undecodable line on the {} event stream: {}",
                    cyan(&self.job_set_id),
                    err
                );
                return;
            }
        };
        if let Some(error) = record.error.filter(|error| !error.is_empty()) {
            debug!(
                "The server attached an error to the {} event stream: {}",
                cyan(&self.job_set_id),
                error
            );
        }
        let result = match record.result {
            Some(result) => result,
            None => return,
        };
        self.from_message_id = Some(result.id.clone());
        match serde_json::from_value::<Event>(result.message) {
            Ok(event) => callback(&result.id, event),
            // An unknown variant is a newer server speaking politely to an
            // older executor. Drop it and move on.
            Err(_) => {}
        }
    }

    fn note_failure(&mut self, detail: String) -> Result<()> {
        self.consecutive_errors += 1;
        warn!(
            "The event stream for {} failed ({} consecutive): {}",
            cyan(&self.job_set_id),
            self.consecutive_errors,
            detail
        );
        if !self.watch && self.consecutive_errors > self.error_tolerance {
            return Err(StreamExhausted {
                queue: self.queue.clone(),
                job_set_id: self.job_set_id.clone(),
                failures: self.consecutive_errors,
            }
            .into());
        }
        Ok(())
    }
}

/// Doubles per consecutive error, capped at 300 seconds.
pub(crate) fn backoff_delay(consecutive_errors: u32) -> Duration {
    let exponent = consecutive_errors.saturating_sub(1).min(9);
    Duration::from_secs((1u64 << exponent).min(300))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::ApiConnection;

    fn reader() -> EventStreamReader {
        let connection = Arc::new(ApiConnection::connect("http://localhost:1", None).unwrap());
        EventStreamReader::new(
            Arc::new(EventApi::new(connection)),
            "gpu",
            "set-1",
            None,
            false,
            3,
        )
    }

    fn valid_line(id: &str) -> String {
        format!(
            concat!(
                r#"{{"result":{{"id":"{}","message":{{"running":{{"#,
                r#""job_id":"01arz","job_set_id":"set-1","queue":"gpu","#,
                r#""created_at":"2021-08-01T00:00:00Z"}}}}}}}}"#
            ),
            id
        )
    }

    #[test]
    fn resumes_past_malformed_and_unknown_records() {
        tokio_test::block_on(async {
            let mut reader = reader();
            let shutdown = Shutdown::new();
            let lines = format!(
                "{}\n{}\n{}\n{}\n",
                valid_line("1"),
                r#"{"result":{"id":"2","mess"#, // malformed mid-record
                r#"{"result":{"id":"3","message":{"somethingNew":{}}}}"#,
                valid_line("4"),
            );
            let mut seen = Vec::new();
            reader
                .drain(lines.as_bytes(), &shutdown, &mut |id: &str, _event| {
                    seen.push(id.to_string())
                })
                .await
                .unwrap();
            assert_eq!(vec!["1".to_string(), "4".to_string()], seen);
            assert_eq!(Some("4"), reader.last_seen());
        });
    }

    #[test]
    fn blank_lines_and_keepalives_are_quiet() {
        tokio_test::block_on(async {
            let mut reader = reader();
            let shutdown = Shutdown::new();
            let lines = "\n{}\n{\"error\":\"busy\"}\n";
            let mut calls = 0;
            reader
                .drain(lines.as_bytes(), &shutdown, &mut |_: &str, _| calls += 1)
                .await
                .unwrap();
            assert_eq!(0, calls);
            assert_eq!(None, reader.last_seen());
        });
    }

    #[test]
    fn every_read_line_resets_the_error_budget() {
        tokio_test::block_on(async {
            let mut reader = reader();
            reader.consecutive_errors = 2;
            let shutdown = Shutdown::new();
            // Even a line that fails to deserialize counts as transport health.
            reader
                .drain("not json at all\n".as_bytes(), &shutdown, &mut |_: &str, _| {})
                .await
                .unwrap();
            assert_eq!(0, reader.consecutive_errors);
        });
    }

    #[test]
    fn bounded_mode_exhausts_after_the_tolerance() {
        let mut reader = reader();
        assert!(reader.note_failure("nope".to_string()).is_ok());
        assert!(reader.note_failure("nope".to_string()).is_ok());
        assert!(reader.note_failure("nope".to_string()).is_ok());
        assert!(reader.note_failure("nope".to_string()).is_err());
    }

    #[test]
    fn watch_mode_never_exhausts() {
        let mut reader = reader();
        reader.watch = true;
        for _ in 0..100 {
            assert!(reader.note_failure("nope".to_string()).is_ok());
        }
    }

    #[test]
    fn backoff_doubles_to_the_cap() {
        assert_eq!(Duration::from_secs(1), backoff_delay(1));
        assert_eq!(Duration::from_secs(2), backoff_delay(2));
        assert_eq!(Duration::from_secs(4), backoff_delay(3));
        assert_eq!(Duration::from_secs(300), backoff_delay(50));
    }
}
