use std::path::Path;

use anyhow::{Context, Result};
use rusqlite::types::Value as SqlValue;
use rusqlite::{params_from_iter, Connection};
use tracing::info;

use crate::error::PipelineError;
use crate::normalize::{CourseFact, CourseId, CourseInstructor, IdentityKind};

const COURSE_BATCH: usize = 50;
const INSTRUCTOR_BATCH: usize = 250;

pub fn connect(path: &Path) -> Result<Connection> {
    if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
        std::fs::create_dir_all(dir).with_context(|| format!("Failed to create {:?}", dir))?;
    }
    let conn = Connection::open(path).with_context(|| format!("Failed to open {:?}", path))?;
    conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA foreign_keys=ON;")?;
    Ok(conn)
}

fn key_columns(kind: IdentityKind) -> &'static str {
    match kind {
        IdentityKind::Surrogate => "course_id",
        IdentityKind::Composite => "term, course_code",
    }
}

fn kind_of(id: &CourseId) -> IdentityKind {
    match id {
        CourseId::Surrogate(_) => IdentityKind::Surrogate,
        CourseId::Composite { .. } => IdentityKind::Composite,
    }
}

/// Identity strategy of an existing `course` table, if there is one.
pub fn existing_identity(conn: &Connection) -> Result<Option<IdentityKind>> {
    let mut stmt = conn.prepare("SELECT name FROM pragma_table_info('course')")?;
    let columns = stmt
        .query_map([], |row| row.get::<_, String>(0))?
        .collect::<Result<Vec<_>, _>>()?;
    if columns.is_empty() {
        Ok(None)
    } else if columns.iter().any(|c| c == "course_id") {
        Ok(Some(IdentityKind::Surrogate))
    } else {
        Ok(Some(IdentityKind::Composite))
    }
}

/// Surrogate ids continue from the highest one already stored.
pub fn next_course_id(conn: &Connection) -> Result<i64> {
    let max: Option<i64> = conn.query_row("SELECT MAX(course_id) FROM course", [], |r| r.get(0))?;
    Ok(max.map_or(0, |m| m + 1))
}

pub fn create_schema(conn: &Connection, kind: IdentityKind) -> Result<()> {
    let (id_column, instructor_key, primary_key, foreign_key) = match kind {
        IdentityKind::Surrogate => (
            "course_id     INTEGER NOT NULL CHECK (typeof(course_id) = 'integer'),",
            "course_id     INTEGER NOT NULL CHECK (typeof(course_id) = 'integer'),",
            "PRIMARY KEY (course_id)",
            "FOREIGN KEY (course_id) REFERENCES course(course_id) ON DELETE CASCADE",
        ),
        IdentityKind::Composite => (
            "",
            "term          TEXT NOT NULL CHECK (typeof(term) = 'text'),
             course_code   INTEGER NOT NULL CHECK (typeof(course_code) = 'integer'),",
            "PRIMARY KEY (term, course_code)",
            "FOREIGN KEY (term, course_code)
                REFERENCES course(term, course_code) ON DELETE CASCADE",
        ),
    };

    conn.execute_batch(&format!(
        "
        CREATE TABLE IF NOT EXISTS course (
            {id_column}
            term           TEXT NOT NULL CHECK (typeof(term) = 'text'),
            year           INTEGER NOT NULL CHECK (typeof(year) = 'integer'),
            quarter        TEXT NOT NULL CHECK (quarter IN ('FALL','WINTER','SPRING','SUMMER')),
            course_code    INTEGER NOT NULL CHECK (typeof(course_code) = 'integer'),
            department     TEXT NOT NULL CHECK (typeof(department) = 'text'),
            course_number  TEXT NOT NULL CHECK (typeof(course_number) = 'text'),
            course_title   TEXT NOT NULL CHECK (typeof(course_title) = 'text'),
            grade_a_count  INTEGER NOT NULL
                CHECK (typeof(grade_a_count) = 'integer' AND grade_a_count >= 0),
            grade_b_count  INTEGER NOT NULL
                CHECK (typeof(grade_b_count) = 'integer' AND grade_b_count >= 0),
            grade_c_count  INTEGER NOT NULL
                CHECK (typeof(grade_c_count) = 'integer' AND grade_c_count >= 0),
            grade_d_count  INTEGER NOT NULL
                CHECK (typeof(grade_d_count) = 'integer' AND grade_d_count >= 0),
            grade_f_count  INTEGER NOT NULL
                CHECK (typeof(grade_f_count) = 'integer' AND grade_f_count >= 0),
            grade_p_count  INTEGER NOT NULL
                CHECK (typeof(grade_p_count) = 'integer' AND grade_p_count >= 0),
            grade_np_count INTEGER NOT NULL
                CHECK (typeof(grade_np_count) = 'integer' AND grade_np_count >= 0),
            gpa_avg        REAL NOT NULL CHECK (typeof(gpa_avg) = 'real'),
            loaded_at      TEXT NOT NULL DEFAULT (datetime('now')),
            {primary_key}
        );

        CREATE TABLE IF NOT EXISTS instructor (
            {instructor_key}
            name           TEXT NOT NULL CHECK (typeof(name) = 'text'),
            PRIMARY KEY ({key}, name),
            {foreign_key}
        );
        ",
        key = key_columns(kind),
    ))?;
    Ok(())
}

/// Covering indexes over the common filter prefixes.
pub fn create_indexes(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "
        CREATE INDEX IF NOT EXISTS idx_course_code_number_dept_quarter_year
            ON course (course_code, course_number, department, quarter, year);
        CREATE INDEX IF NOT EXISTS idx_course_code_number_quarter_year
            ON course (course_code, course_number, quarter, year);
        CREATE INDEX IF NOT EXISTS idx_course_code_number_year
            ON course (course_code, course_number, year);
        CREATE INDEX IF NOT EXISTS idx_course_code_dept_quarter_year
            ON course (course_code, department, quarter, year);
        CREATE INDEX IF NOT EXISTS idx_course_code_dept_year
            ON course (course_code, department, year);
        CREATE INDEX IF NOT EXISTS idx_course_code_quarter_year
            ON course (course_code, quarter, year);
        CREATE INDEX IF NOT EXISTS idx_course_code_year ON course (course_code, year);

        CREATE INDEX IF NOT EXISTS idx_course_number_dept_quarter_year
            ON course (course_number, department, quarter, year);
        CREATE INDEX IF NOT EXISTS idx_course_number_dept_year
            ON course (course_number, department, year);
        CREATE INDEX IF NOT EXISTS idx_course_number_quarter_year
            ON course (course_number, quarter, year);
        CREATE INDEX IF NOT EXISTS idx_course_number_year ON course (course_number, year);

        CREATE INDEX IF NOT EXISTS idx_course_dept_quarter_year
            ON course (department, quarter, year);
        CREATE INDEX IF NOT EXISTS idx_course_dept_year ON course (department, year);
        CREATE INDEX IF NOT EXISTS idx_course_quarter_year ON course (quarter, year);
        CREATE INDEX IF NOT EXISTS idx_course_year ON course (year);

        CREATE INDEX IF NOT EXISTS idx_instructor_name ON instructor (name);
        ",
    )?;
    Ok(())
}

/// `instructor_view`: every instructor of a course in one '/'-separated string.
pub fn create_view(conn: &Connection, kind: IdentityKind) -> Result<()> {
    let key = key_columns(kind);
    conn.execute_batch(&format!(
        "CREATE VIEW IF NOT EXISTS instructor_view AS
             SELECT {key}, GROUP_CONCAT(name, '/') AS names
             FROM instructor
             GROUP BY {key};"
    ))?;
    Ok(())
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct LoadCounts {
    pub courses: usize,
    pub instructors: usize,
}

/// Insert one source file's courses and instructors in a single transaction.
/// Any failure rolls the whole file back.
pub fn load(
    conn: &Connection,
    file: &Path,
    courses: &[CourseFact],
    instructors: &[CourseInstructor],
) -> Result<LoadCounts, PipelineError> {
    let fail = |source| PipelineError::SchemaOrInsert {
        file: file.to_path_buf(),
        source,
    };

    let tx = conn.unchecked_transaction().map_err(fail)?;
    insert_courses(&tx, courses).map_err(fail)?;
    insert_instructors(&tx, instructors).map_err(fail)?;
    tx.commit().map_err(fail)?;

    info!(
        file = %file.display(),
        courses = courses.len(),
        instructors = instructors.len(),
        "Loaded file"
    );
    Ok(LoadCounts {
        courses: courses.len(),
        instructors: instructors.len(),
    })
}

fn placeholders(rows: usize, columns: usize) -> String {
    let row = format!("({})", vec!["?"; columns].join(", "));
    vec![row; rows].join(", ")
}

fn id_values(id: &CourseId, out: &mut Vec<SqlValue>) {
    match id {
        CourseId::Surrogate(id) => out.push(SqlValue::Integer(*id)),
        CourseId::Composite { term, course_code } => {
            out.push(SqlValue::Text(term.clone()));
            out.push(SqlValue::Integer(*course_code));
        }
    }
}

fn insert_courses(conn: &Connection, courses: &[CourseFact]) -> rusqlite::Result<()> {
    for chunk in courses.chunks(COURSE_BATCH) {
        let surrogate = kind_of(&chunk[0].id) == IdentityKind::Surrogate;
        let columns = [
            "term", "year", "quarter", "course_code", "department", "course_number", "course_title",
            "grade_a_count", "grade_b_count", "grade_c_count", "grade_d_count", "grade_f_count",
            "grade_p_count", "grade_np_count", "gpa_avg",
        ];
        let mut names: Vec<&str> = Vec::with_capacity(columns.len() + 1);
        if surrogate {
            names.push("course_id");
        }
        names.extend(columns);

        let mut values = Vec::with_capacity(chunk.len() * names.len());
        for c in chunk {
            if let CourseId::Surrogate(id) = c.id {
                values.push(SqlValue::Integer(id));
            }
            values.push(SqlValue::Text(c.term.clone()));
            values.push(SqlValue::Integer(c.year as i64));
            values.push(SqlValue::Text(c.quarter.clone()));
            values.push(SqlValue::Integer(c.course_code));
            values.push(SqlValue::Text(c.department.clone()));
            values.push(SqlValue::Text(c.course_number.clone()));
            values.push(SqlValue::Text(c.course_title.clone()));
            values.extend(c.grades.iter().map(|g| SqlValue::Integer(*g)));
            values.push(SqlValue::Real(c.gpa_avg));
        }

        let sql = format!(
            "INSERT INTO course ({}) VALUES {}",
            names.join(", "),
            placeholders(chunk.len(), names.len())
        );
        conn.execute(&sql, params_from_iter(values))?;
    }
    Ok(())
}

fn insert_instructors(conn: &Connection, instructors: &[CourseInstructor]) -> rusqlite::Result<()> {
    for chunk in instructors.chunks(INSTRUCTOR_BATCH) {
        let kind = kind_of(&chunk[0].course_id);
        let columns = format!("{}, name", key_columns(kind));
        let width = columns.split(',').count();

        let mut values = Vec::with_capacity(chunk.len() * width);
        for i in chunk {
            id_values(&i.course_id, &mut values);
            values.push(SqlValue::Text(i.name.clone()));
        }

        let sql = format!(
            "INSERT INTO instructor ({}) VALUES {}",
            columns,
            placeholders(chunk.len(), width)
        );
        conn.execute(&sql, params_from_iter(values))?;
    }
    Ok(())
}

// ── Queries ──

#[derive(Debug, Default, Clone)]
pub struct CourseFilter {
    pub department: Option<String>,
    pub course_number: Option<String>,
    pub course_code: Option<i64>,
    pub year: Option<i32>,
    pub quarter: Option<String>,
    pub instructor: Option<String>,
    pub limit: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CourseSummary {
    pub term: String,
    pub course_code: i64,
    pub department: String,
    pub course_number: String,
    pub course_title: String,
    pub grades: [i64; 7],
    pub gpa_avg: f64,
    pub instructors: String,
}

pub fn query_courses(
    conn: &Connection,
    kind: IdentityKind,
    filter: &CourseFilter,
) -> Result<Vec<CourseSummary>> {
    let join = match kind {
        IdentityKind::Surrogate => "v.course_id = c.course_id",
        IdentityKind::Composite => "v.term = c.term AND v.course_code = c.course_code",
    };
    let instructor_join = join.replace("v.", "i.");

    let mut conditions = Vec::new();
    let mut params: Vec<SqlValue> = Vec::new();

    if let Some(d) = &filter.department {
        params.push(SqlValue::Text(d.to_uppercase()));
        conditions.push(format!("c.department = ?{}", params.len()));
    }
    if let Some(n) = &filter.course_number {
        params.push(SqlValue::Text(n.to_uppercase()));
        conditions.push(format!("c.course_number = ?{}", params.len()));
    }
    if let Some(code) = filter.course_code {
        params.push(SqlValue::Integer(code));
        conditions.push(format!("c.course_code = ?{}", params.len()));
    }
    if let Some(y) = filter.year {
        params.push(SqlValue::Integer(y as i64));
        conditions.push(format!("c.year = ?{}", params.len()));
    }
    if let Some(q) = &filter.quarter {
        params.push(SqlValue::Text(q.to_uppercase()));
        conditions.push(format!("c.quarter = ?{}", params.len()));
    }
    if let Some(name) = &filter.instructor {
        params.push(SqlValue::Text(format!("%{}%", name.to_uppercase())));
        conditions.push(format!(
            "EXISTS (SELECT 1 FROM instructor i WHERE {} AND i.name LIKE ?{})",
            instructor_join,
            params.len()
        ));
    }

    let where_clause = if conditions.is_empty() {
        String::new()
    } else {
        format!(" WHERE {}", conditions.join(" AND "))
    };

    let sql = format!(
        "SELECT c.term, c.course_code, c.department, c.course_number, c.course_title,
                c.grade_a_count, c.grade_b_count, c.grade_c_count, c.grade_d_count,
                c.grade_f_count, c.grade_p_count, c.grade_np_count, c.gpa_avg,
                COALESCE(v.names, '')
         FROM course c
         LEFT JOIN instructor_view v ON {}{}
         ORDER BY c.year DESC, c.department, c.course_number, c.course_code
         LIMIT {}",
        join, where_clause, filter.limit
    );

    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt
        .query_map(params_from_iter(params), |row| {
            Ok(CourseSummary {
                term: row.get(0)?,
                course_code: row.get(1)?,
                department: row.get(2)?,
                course_number: row.get(3)?,
                course_title: row.get(4)?,
                grades: [
                    row.get(5)?,
                    row.get(6)?,
                    row.get(7)?,
                    row.get(8)?,
                    row.get(9)?,
                    row.get(10)?,
                    row.get(11)?,
                ],
                gpa_avg: row.get(12)?,
                instructors: row.get(13)?,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

pub struct Stats {
    pub courses: usize,
    pub instructors: usize,
    pub terms: usize,
}

pub fn course_count(conn: &Connection) -> Result<usize> {
    Ok(conn.query_row("SELECT COUNT(*) FROM course", [], |r| r.get(0))?)
}

pub fn instructor_count(conn: &Connection) -> Result<usize> {
    Ok(conn.query_row("SELECT COUNT(*) FROM instructor", [], |r| r.get(0))?)
}

pub fn get_stats(conn: &Connection) -> Result<Stats> {
    let terms: usize = conn.query_row("SELECT COUNT(DISTINCT term) FROM course", [], |r| r.get(0))?;
    Ok(Stats {
        courses: course_count(conn)?,
        instructors: instructor_count(conn)?,
        terms,
    })
}
