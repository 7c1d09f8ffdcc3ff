use std::collections::HashSet;
use std::fmt;

use tracing::warn;

use crate::error::{PipelineError, Result};
use crate::term::{CourseCode, Term};
use crate::workbook::layout::{Field, GRADE_FIELDS};
use crate::workbook::{SourceRow, INSTRUCTOR_DELIMITER};

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum CourseId {
    Surrogate(i64),
    Composite { term: String, course_code: i64 },
}

impl fmt::Display for CourseId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Surrogate(id) => write!(f, "#{}", id),
            Self::Composite { term, course_code } => write!(f, "{}/{:05}", term, course_code),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct CourseFact {
    pub id: CourseId,
    pub year: i32,
    pub quarter: String,
    pub term: String,
    pub course_code: i64,
    pub department: String,
    pub course_number: String,
    pub course_title: String,
    /// A, B, C, D, F, P, NP.
    pub grades: [i64; 7],
    pub gpa_avg: f64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CourseInstructor {
    pub course_id: CourseId,
    pub name: String,
}

/// Run-scoped id source for surrogate keys. Share one across every sheet and file of a run.
#[derive(Debug, Default)]
pub struct SequenceGenerator {
    next: i64,
}

impl SequenceGenerator {
    pub fn starting_at(next: i64) -> Self {
        Self { next }
    }

    pub fn next_id(&mut self) -> i64 {
        let id = self.next;
        self.next += 1;
        id
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum IdentityKind {
    /// Per-run counter; loading the same source twice duplicates it.
    Surrogate,
    /// (term, course code); reloading is rejected by the primary key.
    Composite,
}

#[derive(Debug)]
pub enum IdentityStrategy {
    Surrogate(SequenceGenerator),
    Composite,
}

impl IdentityStrategy {
    pub fn kind(&self) -> IdentityKind {
        match self {
            Self::Surrogate(_) => IdentityKind::Surrogate,
            Self::Composite => IdentityKind::Composite,
        }
    }

    fn assign(&mut self, term: &Term, course_code: i64) -> CourseId {
        match self {
            Self::Surrogate(seq) => CourseId::Surrogate(seq.next_id()),
            Self::Composite => CourseId::Composite {
                term: term.to_string(),
                course_code,
            },
        }
    }
}

/// What to do with a row whose numeric cells do not parse.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, clap::ValueEnum)]
pub enum MalformedPolicy {
    /// Leave the row out and report it.
    #[default]
    SkipRow,
    /// Fail the whole file.
    AbortFile,
}

#[derive(Debug, Default)]
pub struct NormalizedSheet {
    pub courses: Vec<CourseFact>,
    pub instructors: Vec<CourseInstructor>,
    pub malformed: Vec<PipelineError>,
    pub unenriched: usize,
    pub duplicates: usize,
}

impl NormalizedSheet {
    pub fn extend(&mut self, other: NormalizedSheet) {
        self.courses.extend(other.courses);
        self.instructors.extend(other.instructors);
        self.malformed.extend(other.malformed);
        self.unenriched += other.unenriched;
        self.duplicates += other.duplicates;
    }
}

pub struct Normalizer {
    strategy: IdentityStrategy,
    policy: MalformedPolicy,
    seen: HashSet<CourseId>,
}

impl Normalizer {
    pub fn new(strategy: IdentityStrategy, policy: MalformedPolicy) -> Self {
        Self {
            strategy,
            policy,
            seen: HashSet::new(),
        }
    }

    /// Forget the composite keys seen so far. Call before each source file: repeats across
    /// files are left to the primary key so a rejected file never hides rows from a later one.
    pub fn start_file(&mut self) {
        self.seen.clear();
    }

    /// Turn one term sheet into course facts and instructor rows.
    ///
    /// Rows without department, number and title are counted as unenriched and left out.
    /// Under the composite strategy a repeated (term, course code) within the current file keeps
    /// its first row.
    pub fn normalize(&mut self, term_label: &str, rows: &[SourceRow]) -> Result<NormalizedSheet> {
        let term = Term::parse(term_label)?;
        let mut out = NormalizedSheet::default();

        for row in rows {
            if !row.is_enriched() {
                out.unenriched += 1;
                continue;
            }
            let parsed = match parse_row(term_label, row) {
                Ok(parsed) => parsed,
                Err(e) => match self.policy {
                    MalformedPolicy::AbortFile => return Err(e),
                    MalformedPolicy::SkipRow => {
                        warn!("Skipping row: {}", e);
                        out.malformed.push(e);
                        continue;
                    }
                },
            };

            if self.strategy.kind() == IdentityKind::Composite {
                let key = CourseId::Composite {
                    term: term.to_string(),
                    course_code: parsed.course_code,
                };
                if !self.seen.insert(key) {
                    warn!(
                        sheet = term_label,
                        row = row.row,
                        "Duplicate course #{:05} in {}, keeping the first row",
                        parsed.course_code,
                        term
                    );
                    out.duplicates += 1;
                    continue;
                }
            }

            let id = self.strategy.assign(&term, parsed.course_code);
            out.instructors.extend(parsed.instructors.into_iter().map(|name| CourseInstructor {
                course_id: id.clone(),
                name,
            }));
            out.courses.push(CourseFact {
                id,
                year: term.year,
                quarter: term.quarter.as_str().to_string(),
                term: term.to_string(),
                course_code: parsed.course_code,
                department: parsed.department,
                course_number: parsed.course_number,
                course_title: parsed.course_title,
                grades: parsed.grades,
                gpa_avg: parsed.gpa_avg,
            });
        }
        Ok(out)
    }
}

struct ParsedRow {
    course_code: i64,
    department: String,
    course_number: String,
    course_title: String,
    instructors: Vec<String>,
    grades: [i64; 7],
    gpa_avg: f64,
}

fn parse_row(sheet: &str, row: &SourceRow) -> Result<ParsedRow> {
    let malformed = |column: &'static str, value: &str| PipelineError::MalformedRow {
        sheet: sheet.to_string(),
        row: row.row,
        column,
        value: value.to_string(),
    };

    let course_code = CourseCode::normalize(&row.course_code)
        .map_err(|_| malformed(Field::CourseCode.name(), &row.course_code))?
        .as_number();

    let mut grades = [0i64; 7];
    for (i, field) in GRADE_FIELDS.iter().enumerate() {
        let cell = row.grades[i].as_deref().unwrap_or("");
        grades[i] = parse_count(cell).ok_or_else(|| malformed(field.name(), cell))?;
    }

    let gpa_avg = match row.gpa.as_deref().map(str::trim) {
        None | Some("") => 0.0,
        Some(cell) => cell
            .parse::<f64>()
            .ok()
            .filter(|g| g.is_finite())
            .ok_or_else(|| malformed(Field::Gpa.name(), cell))?,
    };

    Ok(ParsedRow {
        course_code,
        department: canonical(row.department.as_deref()),
        course_number: canonical(row.course_number.as_deref()),
        course_title: canonical(row.course_title.as_deref()),
        instructors: split_instructors(row.instructors.as_deref().unwrap_or("")),
        grades,
        gpa_avg,
    })
}

fn canonical(value: Option<&str>) -> String {
    value.unwrap_or("").trim().to_uppercase()
}

/// Non-negative integer, also accepting integral floats ("12.0") from spreadsheet exports.
fn parse_count(cell: &str) -> Option<i64> {
    let cell = cell.trim();
    if let Ok(n) = cell.parse::<i64>() {
        return (n >= 0).then_some(n);
    }
    let f = cell.parse::<f64>().ok()?;
    (f.is_finite() && f >= 0.0 && f.fract() == 0.0 && f <= i64::MAX as f64).then_some(f as i64)
}

/// Split on the instructor delimiter, uppercase, drop blanks and repeats.
pub fn split_instructors(cell: &str) -> Vec<String> {
    let mut names: Vec<String> = Vec::new();
    for name in cell.split(INSTRUCTOR_DELIMITER) {
        let name = name.trim().to_uppercase();
        if !name.is_empty() && !names.contains(&name) {
            names.push(name);
        }
    }
    names
}
