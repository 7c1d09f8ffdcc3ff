pub mod client;
pub mod parse;
pub mod request;
#[cfg(test)]
pub mod testing;

pub use client::{CatalogClient, CatalogTransport, HttpTransport};
pub use request::{CatalogRequest, RequestBuilder};

use crate::error::PipelineError;

/// Course metadata read from one catalog response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CatalogRecord {
    pub department: String,
    pub course_number: String,
    pub course_title: String,
    pub instructors: Vec<String>,
    /// `YearTerm` of the request that produced this record.
    pub year_term: String,
    /// `YearTerm` of a later session that also matched and was discarded.
    pub collided_with: Option<String>,
}

impl CatalogRecord {
    pub fn is_complete(&self) -> bool {
        !self.department.is_empty()
            && !self.course_number.is_empty()
            && !self.course_title.is_empty()
    }
}

/// Outcome of one row's lookup batch.
///
/// Transient failures may be retried within a run up to `max_attempts_per_run`. Permanent
/// failures are logged at once and the row stays pending.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LookupResult {
    Found(CatalogRecord),
    NotFound,
    TransientFailure { reason: String },
    PermanentFailure { reason: String, status: Option<u16> },
}

impl LookupResult {
    pub fn into_record(
        self,
        course_code: &str,
        term: &str,
    ) -> Result<CatalogRecord, PipelineError> {
        match self {
            Self::Found(record) => Ok(record),
            Self::NotFound => Err(PipelineError::NotFoundInCatalog {
                course_code: course_code.to_string(),
                term: term.to_string(),
            }),
            Self::TransientFailure { reason } => Err(PipelineError::Network(reason)),
            Self::PermanentFailure { status: Some(status), .. } => {
                Err(PipelineError::Service { status })
            }
            Self::PermanentFailure { reason, status: None } => {
                Err(PipelineError::MalformedResponse(reason))
            }
        }
    }
}
