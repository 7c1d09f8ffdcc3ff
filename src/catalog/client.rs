use std::time::{Duration, Instant};

use anyhow::Result;
use reqwest::header::{CONTENT_TYPE, USER_AGENT};
use tracing::{debug, warn};

use super::{parse, CatalogRecord, CatalogRequest, LookupResult};
use crate::pacing::{Pacer, Window};
use crate::term::CourseCode;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    /// Non-2xx response.
    #[error("server returned status {0}")]
    Status(u16),
    /// Connection, TLS or timeout failure.
    #[error("{0}")]
    Network(String),
}

impl From<TransportError> for LookupResult {
    fn from(e: TransportError) -> Self {
        match e {
            TransportError::Status(status) => LookupResult::PermanentFailure {
                reason: format!("Server returns error code ({})", status),
                status: Some(status),
            },
            TransportError::Network(reason) => LookupResult::TransientFailure { reason },
        }
    }
}

/// Request/response call to the catalog service.
#[allow(async_fn_in_trait)]
pub trait CatalogTransport {
    async fn send(&self, request: &CatalogRequest) -> Result<String, TransportError>;
}

pub struct HttpTransport {
    client: reqwest::Client,
}

impl HttpTransport {
    pub fn new(timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self { client })
    }
}

impl CatalogTransport for HttpTransport {
    async fn send(&self, request: &CatalogRequest) -> Result<String, TransportError> {
        let response = self
            .client
            .post(&request.endpoint)
            .header(USER_AGENT, request.user_agent.as_str())
            .header(CONTENT_TYPE, "application/x-www-form-urlencoded")
            .body(request.body())
            .send()
            .await
            .map_err(|e| TransportError::Network(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(TransportError::Status(status.as_u16()));
        }
        response
            .text()
            .await
            .map_err(|e| TransportError::Network(e.to_string()))
    }
}

pub struct CatalogClient<T> {
    transport: T,
    session_pause: Window,
}

impl<T: CatalogTransport> CatalogClient<T> {
    pub fn new(transport: T, session_pause: Window) -> Self {
        Self {
            transport,
            session_pause,
        }
    }

    #[cfg(test)]
    pub fn transport(&self) -> &T {
        &self.transport
    }

    /// Issue the batch sequentially with a session pause between requests.
    ///
    /// The first matching response wins. A second match in the same batch is logged as a
    /// collision and ends the batch; its data is discarded.
    pub async fn execute(
        &self,
        requests: &[CatalogRequest],
        course_code: &CourseCode,
    ) -> LookupResult {
        let mut pacer = Pacer::new("session", self.session_pause);
        let mut found: Option<CatalogRecord> = None;

        for request in requests {
            pacer.before_call().await;
            let start = Instant::now();
            let body = match self.transport.send(request).await {
                Ok(body) => body,
                Err(e) => match found {
                    Some(record) => {
                        warn!(
                            course_code = %course_code,
                            year_term = %request.year_term,
                            "Lookup failed after a match was found, keeping it: {}", e
                        );
                        return LookupResult::Found(record);
                    }
                    None => return e.into(),
                },
            };
            debug!(
                course_code = %course_code,
                year_term = %request.year_term,
                latency_ms = start.elapsed().as_millis() as u64,
                "Catalog responded"
            );

            match parse::find_course(&body, course_code.as_str(), &request.year_term) {
                Ok(Some(record)) => {
                    if let Some(first) = found.as_mut() {
                        warn!(
                            course_code = %course_code,
                            kept = %first.year_term,
                            discarded = %record.year_term,
                            "There is a collision for split-term course #{}", course_code
                        );
                        first.collided_with = Some(record.year_term);
                        break;
                    }
                    found = Some(record);
                }
                Ok(None) => {}
                Err(e) => match found {
                    Some(record) => {
                        warn!(
                            course_code = %course_code,
                            "Ignoring unreadable response after match: {}", e
                        );
                        return LookupResult::Found(record);
                    }
                    None => {
                        return LookupResult::PermanentFailure {
                            reason: e.to_string(),
                            status: None,
                        }
                    }
                },
            }
        }

        match found {
            Some(record) => LookupResult::Found(record),
            None => LookupResult::NotFound,
        }
    }
}
