use std::path::PathBuf;

/// Failure taxonomy for the enrichment and load phases.
///
/// Enrichment errors (`NotFoundInCatalog`, `Service`, `Network`, `InvalidCourseCode`) are
/// recovered per row. `MalformedRow` is handled by the normalizer's policy. `SchemaOrInsert`
/// aborts the current file's transaction.
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("course #{course_code} not found in catalog ({term})")]
    NotFoundInCatalog { course_code: String, term: String },

    #[error("catalog service returned status {status}")]
    Service { status: u16 },

    #[error("network error: {0}")]
    Network(String),

    #[error("unreadable catalog response: {0}")]
    MalformedResponse(String),

    #[error("invalid course code {0:?}")]
    InvalidCourseCode(String),

    #[error("invalid term label {0:?}")]
    InvalidTerm(String),

    #[error("malformed row {row} in {sheet}: {column} = {value:?}")]
    MalformedRow {
        sheet: String,
        row: usize,
        column: &'static str,
        value: String,
    },

    #[error("sheet layout error in {sheet}: {message}")]
    Layout { sheet: String, message: String },

    #[error("workbook {0:?} does not exist; run 'import' first")]
    WorkbookMissing(PathBuf),

    #[error("record store error: {0}")]
    Store(#[from] rusqlite::Error),

    #[error("load failed for {file:?}: {source}")]
    SchemaOrInsert {
        file: PathBuf,
        source: rusqlite::Error,
    },
}

pub type Result<T> = std::result::Result<T, PipelineError>;

impl PipelineError {
    pub fn layout(sheet: &str, message: impl Into<String>) -> Self {
        Self::Layout {
            sheet: sheet.to_string(),
            message: message.into(),
        }
    }
}
