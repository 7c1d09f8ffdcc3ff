pub mod import;
pub mod layout;

use std::path::Path;

use rusqlite::{params, Connection, OpenFlags, OptionalExtension};
use tracing::debug;

use crate::error::{PipelineError, Result};

/// First data row; row 1 holds the headers.
pub const FIRST_DATA_ROW: usize = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Processed {
    Pending,
    Done,
}

impl Processed {
    /// Spreadsheet flag cells: "T"/"F", plus the usual boolean spellings.
    pub fn from_cell(cell: Option<&str>) -> Self {
        match cell.map(|c| c.trim().to_ascii_uppercase()) {
            Some(c) if matches!(c.as_str(), "T" | "TRUE" | "Y" | "YES" | "1") => Self::Done,
            _ => Self::Pending,
        }
    }
}

/// One row of a term sheet as stored; grade and GPA cells stay raw text until normalization.
#[derive(Debug, Clone, PartialEq)]
pub struct SourceRow {
    pub sheet: String,
    pub row: usize,
    pub course_code: String,
    pub department: Option<String>,
    pub course_number: Option<String>,
    pub course_title: Option<String>,
    pub instructors: Option<String>,
    pub grades: [Option<String>; 7],
    pub gpa: Option<String>,
    pub processed: Processed,
}

impl SourceRow {
    /// Department, number and title are all present.
    pub fn is_enriched(&self) -> bool {
        [&self.department, &self.course_number, &self.course_title]
            .iter()
            .all(|v| v.as_deref().is_some_and(|s| !s.trim().is_empty()))
    }
}

/// Catalog payload written back onto a row.
#[derive(Debug, Clone, PartialEq)]
pub struct Enrichment {
    pub course_code: String,
    pub department: String,
    pub course_number: String,
    pub course_title: String,
    pub instructors: Vec<String>,
}

/// Instructor cell delimiter.
pub const INSTRUCTOR_DELIMITER: &str = "; ";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SheetProgress {
    pub sheet: String,
    pub total: usize,
    pub done: usize,
}

/// Row-addressable tabular store that doubles as the enrichment checkpoint.
pub trait RecordStore {
    fn sheet_names(&self) -> Result<Vec<String>>;

    /// Highest row number in the sheet, or `FIRST_DATA_ROW - 1` when it has no data rows.
    fn max_row(&self, sheet: &str) -> Result<usize>;

    fn row(&self, sheet: &str, row: usize) -> Result<Option<SourceRow>>;

    fn rows(&self, sheet: &str) -> Result<Vec<SourceRow>>;

    /// Write the payload and flip the row to done in one durable step.
    fn commit_enrichment(&mut self, sheet: &str, row: usize, enrichment: &Enrichment) -> Result<()>;

    /// Flush to durable storage.
    fn save(&mut self) -> Result<()>;

    /// Lowest pending row at or after `from`.
    fn next_pending(&self, sheet: &str, from: usize) -> Result<Option<usize>> {
        for row in from.max(FIRST_DATA_ROW)..=self.max_row(sheet)? {
            if let Some(r) = self.row(sheet, row)? {
                if r.processed == Processed::Pending {
                    return Ok(Some(row));
                }
            }
        }
        Ok(None)
    }
}

/// SQLite-backed workbook: one file per source workbook, one `sheets` entry per term.
pub struct SqliteWorkbook {
    conn: Connection,
}

const ROW_COLUMNS: &str = "sheet, row_num, course_code, department, course_number, \
     course_title, instructors, grade_a, grade_b, grade_c, grade_d, grade_f, grade_p, grade_np, \
     gpa_avg, processed";

const PRAGMAS: &str = "PRAGMA journal_mode=WAL; PRAGMA synchronous=FULL; PRAGMA foreign_keys=ON;";

impl SqliteWorkbook {
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
            std::fs::create_dir_all(dir).ok();
        }
        let conn = Connection::open(path)?;
        conn.execute_batch(PRAGMAS)?;
        Self::init(conn)
    }

    /// Open a workbook that `import` already created. A missing file is an error, never a
    /// fresh empty workbook.
    pub fn open_existing(path: &Path) -> Result<Self> {
        if !path.is_file() {
            return Err(PipelineError::WorkbookMissing(path.to_path_buf()));
        }
        let flags = OpenFlags::SQLITE_OPEN_READ_WRITE
            | OpenFlags::SQLITE_OPEN_URI
            | OpenFlags::SQLITE_OPEN_NO_MUTEX;
        let conn = Connection::open_with_flags(path, flags)?;
        conn.execute_batch(PRAGMAS)?;
        Self::init(conn)
    }

    #[cfg(test)]
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch("PRAGMA foreign_keys=ON;")?;
        Self::init(conn)
    }

    fn init(conn: Connection) -> Result<Self> {
        conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS sheets (
                name        TEXT PRIMARY KEY,
                position    INTEGER NOT NULL,
                source      TEXT,
                imported_at TEXT NOT NULL DEFAULT (datetime('now'))
            );

            CREATE TABLE IF NOT EXISTS sheet_rows (
                sheet         TEXT NOT NULL REFERENCES sheets(name),
                row_num       INTEGER NOT NULL,
                course_code   TEXT NOT NULL,
                department    TEXT,
                course_number TEXT,
                course_title  TEXT,
                instructors   TEXT,
                grade_a       TEXT,
                grade_b       TEXT,
                grade_c       TEXT,
                grade_d       TEXT,
                grade_f       TEXT,
                grade_p       TEXT,
                grade_np      TEXT,
                gpa_avg       TEXT,
                processed     BOOLEAN NOT NULL DEFAULT 0,
                enriched_at   TEXT,
                PRIMARY KEY (sheet, row_num)
            );
            CREATE INDEX IF NOT EXISTS idx_rows_pending ON sheet_rows(sheet, processed, row_num);
            ",
        )?;
        Ok(Self { conn })
    }

    pub fn has_sheet(&self, name: &str) -> Result<bool> {
        let found = self
            .conn
            .query_row("SELECT 1 FROM sheets WHERE name = ?1", params![name], |_| Ok(()))
            .optional()?;
        Ok(found.is_some())
    }

    /// Add a sheet and its rows in one transaction. Row numbers are assigned from
    /// `FIRST_DATA_ROW`.
    pub fn insert_sheet(
        &mut self,
        name: &str,
        source: Option<&str>,
        rows: &[SourceRow],
    ) -> Result<usize> {
        let tx = self.conn.transaction()?;
        {
            let position: i64 = tx.query_row(
                "SELECT COALESCE(MAX(position) + 1, 0) FROM sheets",
                [],
                |r| r.get(0),
            )?;
            tx.execute(
                "INSERT INTO sheets (name, position, source) VALUES (?1, ?2, ?3)",
                params![name, position, source],
            )?;
            let mut stmt = tx.prepare(&format!(
                "INSERT INTO sheet_rows ({}) \
                 VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11,?12,?13,?14,?15,?16)",
                ROW_COLUMNS
            ))?;
            for (i, r) in rows.iter().enumerate() {
                let [a, b, c, d, f, p, np] = &r.grades;
                stmt.execute(params![
                    name,
                    (FIRST_DATA_ROW + i) as i64,
                    r.course_code,
                    r.department,
                    r.course_number,
                    r.course_title,
                    r.instructors,
                    a, b, c, d, f, p, np,
                    r.gpa,
                    r.processed == Processed::Done,
                ])?;
            }
        }
        tx.commit()?;
        Ok(rows.len())
    }

    pub fn progress(&self) -> Result<Vec<SheetProgress>> {
        let mut stmt = self.conn.prepare(
            "SELECT s.name, COUNT(r.row_num), COALESCE(SUM(r.processed), 0)
             FROM sheets s LEFT JOIN sheet_rows r ON r.sheet = s.name
             GROUP BY s.name
             ORDER BY s.position",
        )?;
        let rows = stmt
            .query_map([], |row| {
                Ok(SheetProgress {
                    sheet: row.get(0)?,
                    total: row.get(1)?,
                    done: row.get(2)?,
                })
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    fn map_row(row: &rusqlite::Row) -> rusqlite::Result<SourceRow> {
        let row_num: i64 = row.get(1)?;
        let done: bool = row.get(15)?;
        Ok(SourceRow {
            sheet: row.get(0)?,
            row: row_num as usize,
            course_code: row.get(2)?,
            department: row.get(3)?,
            course_number: row.get(4)?,
            course_title: row.get(5)?,
            instructors: row.get(6)?,
            grades: [
                row.get(7)?,
                row.get(8)?,
                row.get(9)?,
                row.get(10)?,
                row.get(11)?,
                row.get(12)?,
                row.get(13)?,
            ],
            gpa: row.get(14)?,
            processed: if done { Processed::Done } else { Processed::Pending },
        })
    }
}

impl RecordStore for SqliteWorkbook {
    fn sheet_names(&self) -> Result<Vec<String>> {
        let mut stmt = self.conn.prepare("SELECT name FROM sheets ORDER BY position")?;
        let names = stmt
            .query_map([], |row| row.get(0))?
            .collect::<std::result::Result<Vec<String>, _>>()?;
        Ok(names)
    }

    fn max_row(&self, sheet: &str) -> Result<usize> {
        let max: Option<i64> = self.conn.query_row(
            "SELECT MAX(row_num) FROM sheet_rows WHERE sheet = ?1",
            params![sheet],
            |r| r.get(0),
        )?;
        Ok(max.map(|m| m as usize).unwrap_or(FIRST_DATA_ROW - 1))
    }

    fn row(&self, sheet: &str, row: usize) -> Result<Option<SourceRow>> {
        let found = self
            .conn
            .query_row(
                &format!(
                    "SELECT {} FROM sheet_rows WHERE sheet = ?1 AND row_num = ?2",
                    ROW_COLUMNS
                ),
                params![sheet, row as i64],
                Self::map_row,
            )
            .optional()?;
        Ok(found)
    }

    fn rows(&self, sheet: &str) -> Result<Vec<SourceRow>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {} FROM sheet_rows WHERE sheet = ?1 ORDER BY row_num",
            ROW_COLUMNS
        ))?;
        let rows = stmt
            .query_map(params![sheet], Self::map_row)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    fn commit_enrichment(&mut self, sheet: &str, row: usize, e: &Enrichment) -> Result<()> {
        let tx = self.conn.transaction()?;
        let updated = tx.execute(
            "UPDATE sheet_rows
             SET department = ?3, course_number = ?4, course_code = ?5, course_title = ?6,
                 instructors = ?7,
                 gpa_avg = COALESCE(NULLIF(TRIM(gpa_avg), ''), '0'),
                 processed = 1, enriched_at = datetime('now')
             WHERE sheet = ?1 AND row_num = ?2",
            params![
                sheet,
                row as i64,
                e.department,
                e.course_number,
                e.course_code,
                e.course_title,
                e.instructors.join(INSTRUCTOR_DELIMITER),
            ],
        )?;
        if updated != 1 {
            return Err(rusqlite::Error::QueryReturnedNoRows.into());
        }
        tx.commit()?;
        debug!(sheet, row, "Row committed");
        Ok(())
    }

    fn save(&mut self) -> Result<()> {
        // In-memory databases report the pragma as a no-op row.
        self.conn
            .query_row("PRAGMA wal_checkpoint(PASSIVE)", [], |_| Ok(()))
            .optional()?;
        Ok(())
    }

    fn next_pending(&self, sheet: &str, from: usize) -> Result<Option<usize>> {
        let next: Option<i64> = self.conn.query_row(
            "SELECT MIN(row_num) FROM sheet_rows \
             WHERE sheet = ?1 AND processed = 0 AND row_num >= ?2",
            params![sheet, from.max(FIRST_DATA_ROW) as i64],
            |r| r.get(0),
        )?;
        Ok(next.map(|n| n as usize))
    }
}
