use crate::error::Result;
use crate::workbook::{RecordStore, SourceRow, FIRST_DATA_ROW};

/// Lowest-indexed pending row of the sheet, or `None` when every row is done.
pub fn find_resume_point<S: RecordStore + ?Sized>(store: &S, sheet: &str) -> Result<Option<usize>> {
    store.next_pending(sheet, FIRST_DATA_ROW)
}

/// Walks one sheet forward from its resume point, yielding only pending rows.
///
/// The cursor only moves forward: a row that fails stays pending in the store but is not
/// revisited until the next run.
pub struct RowScanner {
    sheet: String,
    cursor: Option<usize>,
}

impl RowScanner {
    pub fn new<S: RecordStore + ?Sized>(store: &S, sheet: &str) -> Result<Self> {
        Ok(Self {
            sheet: sheet.to_string(),
            cursor: find_resume_point(store, sheet)?,
        })
    }

    #[cfg(test)]
    pub fn sheet(&self) -> &str {
        &self.sheet
    }

    /// Row the next call to `next` will consider.
    #[cfg(test)]
    pub fn position(&self) -> Option<usize> {
        self.cursor
    }

    /// The next pending row at or after the cursor; advances past it.
    pub fn next<S: RecordStore + ?Sized>(&mut self, store: &S) -> Result<Option<SourceRow>> {
        let Some(from) = self.cursor else {
            return Ok(None);
        };
        let Some(row_num) = store.next_pending(&self.sheet, from)? else {
            self.cursor = None;
            return Ok(None);
        };
        self.cursor = Some(row_num + 1);
        store.row(&self.sheet, row_num)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workbook::tests::{enrichment, row};
    use crate::workbook::{Processed, SqliteWorkbook};

    const G: [&str; 7] = ["1", "1", "1", "1", "1", "1", "1"];

    fn workbook(flags: &[Processed]) -> SqliteWorkbook {
        let mut wb = SqliteWorkbook::open_in_memory().unwrap();
        let rows: Vec<_> = flags
            .iter()
            .enumerate()
            .map(|(i, p)| SourceRow {
                processed: *p,
                ..row(&format!("{}", 10000 + i), G, None)
            })
            .collect();
        wb.insert_sheet("Fall 2019", None, &rows).unwrap();
        wb
    }

    fn drain(wb: &SqliteWorkbook) -> Vec<usize> {
        let mut scanner = RowScanner::new(wb, "Fall 2019").unwrap();
        let mut seen = Vec::new();
        while let Some(r) = scanner.next(wb).unwrap() {
            seen.push(r.row);
        }
        seen
    }

    use Processed::{Done, Pending};

    #[test]
    fn resume_point_is_lowest_pending() {
        let wb = workbook(&[Done, Done, Pending, Done, Pending]);
        assert_eq!(find_resume_point(&wb, "Fall 2019").unwrap(), Some(4));
    }

    #[test]
    fn all_done_has_no_resume_point() {
        let wb = workbook(&[Done, Done]);
        assert_eq!(find_resume_point(&wb, "Fall 2019").unwrap(), None);
        assert!(drain(&wb).is_empty());
        let empty = SqliteWorkbook::open_in_memory().unwrap();
        assert_eq!(find_resume_point(&empty, "Fall 2019").unwrap(), None);
    }

    #[test]
    fn never_emits_done_rows() {
        let wb = workbook(&[Pending, Done, Pending, Done, Done, Pending]);
        assert_eq!(drain(&wb), vec![2, 4, 7]);
    }

    #[test]
    fn failures_do_not_halt_the_scan() {
        // nothing is committed for any row, as when every lookup fails
        let wb = workbook(&[Pending, Pending, Pending]);
        let mut scanner = RowScanner::new(&wb, "Fall 2019").unwrap();
        assert_eq!(scanner.next(&wb).unwrap().unwrap().row, 2);
        assert_eq!(scanner.next(&wb).unwrap().unwrap().row, 3);
        assert_eq!(scanner.next(&wb).unwrap().unwrap().row, 4);
        assert!(scanner.next(&wb).unwrap().is_none());
        assert_eq!(scanner.position(), None);
    }

    #[test]
    fn interrupted_run_resumes_at_lowest_pending() {
        let mut wb = workbook(&[Pending, Pending, Pending, Pending]);
        let mut scanner = RowScanner::new(&wb, "Fall 2019").unwrap();
        // row 2 succeeds, row 3 fails, row 4 succeeds, then the run stops
        let r = scanner.next(&wb).unwrap().unwrap();
        wb.commit_enrichment(scanner.sheet(), r.row, &enrichment("10000")).unwrap();
        scanner.next(&wb).unwrap().unwrap();
        let r = scanner.next(&wb).unwrap().unwrap();
        wb.commit_enrichment("Fall 2019", r.row, &enrichment("10002")).unwrap();

        assert_eq!(find_resume_point(&wb, "Fall 2019").unwrap(), Some(3));
        assert_eq!(drain(&wb), vec![3, 5]);
    }
}
