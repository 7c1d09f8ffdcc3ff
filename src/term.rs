use std::fmt;
use std::sync::LazyLock;

use regex::Regex;

use crate::error::{PipelineError, Result};

static COURSE_CODE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^(\d{1,5})(?:\.0+)?$").unwrap());

pub const COURSE_CODE_WIDTH: usize = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Quarter {
    Fall,
    Winter,
    Spring,
    Summer,
}

impl Quarter {
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_uppercase().as_str() {
            "FALL" => Some(Self::Fall),
            "WINTER" => Some(Self::Winter),
            "SPRING" => Some(Self::Spring),
            "SUMMER" => Some(Self::Summer),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Fall => "FALL",
            Self::Winter => "WINTER",
            Self::Spring => "SPRING",
            Self::Summer => "SUMMER",
        }
    }

    /// Catalog lookup codes. Summer is split into three sessions.
    pub fn lookup_codes(&self) -> &'static [&'static str] {
        match self {
            Self::Fall => &["92"],
            Self::Winter => &["03"],
            Self::Spring => &["14"],
            Self::Summer => &["25", "39", "76"],
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TermKind {
    Simple,
    Split,
}

/// One academic offering period, e.g. "Fall 2019".
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Term {
    pub quarter: Quarter,
    pub year: i32,
}

impl Term {
    /// Parse a sheet label of the form "<quarter> <year>".
    pub fn parse(label: &str) -> Result<Self> {
        let mut parts = label.split_whitespace();
        let (Some(q), Some(y), None) = (parts.next(), parts.next(), parts.next()) else {
            return Err(PipelineError::InvalidTerm(label.to_string()));
        };
        let quarter =
            Quarter::parse(q).ok_or_else(|| PipelineError::InvalidTerm(label.to_string()))?;
        let year = y
            .parse::<i32>()
            .map_err(|_| PipelineError::InvalidTerm(label.to_string()))?;
        Ok(Self { quarter, year })
    }

    pub fn kind(&self) -> TermKind {
        if self.quarter.lookup_codes().len() > 1 {
            TermKind::Split
        } else {
            TermKind::Simple
        }
    }

    /// `YearTerm` values to query, one per session.
    pub fn year_terms(&self) -> Vec<String> {
        self.quarter
            .lookup_codes()
            .iter()
            .map(|code| format!("{}-{}", self.year, code))
            .collect()
    }
}

impl fmt::Display for Term {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.quarter.as_str(), self.year)
    }
}

/// Catalog course code, always zero-padded to the canonical width.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CourseCode(String);

impl CourseCode {
    /// Spreadsheet exports sometimes carry codes as floats ("1234.0"); the fractional zeros
    /// are dropped.
    pub fn normalize(raw: &str) -> Result<Self> {
        let caps = COURSE_CODE_RE
            .captures(raw.trim())
            .ok_or_else(|| PipelineError::InvalidCourseCode(raw.to_string()))?;
        Ok(Self(format!("{:0>width$}", &caps[1], width = COURSE_CODE_WIDTH)))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn as_number(&self) -> i64 {
        // always all digits
        self.0.parse().unwrap_or_default()
    }
}

impl fmt::Display for CourseCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
