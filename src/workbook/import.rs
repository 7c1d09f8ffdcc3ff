use std::io::Read;
use std::path::Path;

use anyhow::{bail, Context, Result};
use tracing::{info, warn};

use super::layout::{Field, SheetLayout, GRADE_FIELDS};
use super::{Processed, SourceRow, SqliteWorkbook};
use crate::term::Term;

pub enum ImportOutcome {
    Imported { sheet: String, rows: usize },
    AlreadyPresent { sheet: String },
}

/// "fall_2019.csv" → "fall 2019".
pub fn sheet_name_from_path(path: &Path) -> Option<String> {
    let stem = path.file_stem()?.to_str()?;
    let name = stem.replace(['_', '-'], " ");
    let name = name.split_whitespace().collect::<Vec<_>>().join(" ");
    if name.is_empty() {
        None
    } else {
        Some(name)
    }
}

/// Import one CSV export as a sheet named by its canonical term label ("FALL 2019").
/// Existing sheets are left untouched so re-running an import never resets processed flags.
pub fn import_csv(
    workbook: &mut SqliteWorkbook,
    path: &Path,
    sheet: Option<&str>,
    legacy_columns: bool,
) -> Result<ImportOutcome> {
    let label = match sheet {
        Some(s) => s.trim().to_string(),
        None => sheet_name_from_path(path)
            .with_context(|| format!("Cannot derive a sheet name from {:?}", path))?,
    };
    let sheet = Term::parse(&label)
        .with_context(|| format!("Sheet name {:?} is not a term label", label))?
        .to_string();

    if workbook.has_sheet(&sheet)? {
        warn!(sheet = %sheet, "Sheet already imported, skipping");
        return Ok(ImportOutcome::AlreadyPresent { sheet });
    }

    let file = std::fs::File::open(path).with_context(|| format!("Failed to open {:?}", path))?;
    let rows = read_rows(file, &sheet, legacy_columns)?;
    let count = workbook.insert_sheet(&sheet, path.to_str(), &rows)?;
    info!(sheet = %sheet, rows = count, "Imported sheet from {:?}", path);
    Ok(ImportOutcome::Imported { sheet, rows: count })
}

/// Parse CSV rows through a layout resolved once from the header row.
pub fn read_rows<R: Read>(reader: R, sheet: &str, legacy_columns: bool) -> Result<Vec<SourceRow>> {
    let mut csv_reader = csv::ReaderBuilder::new()
        .has_headers(true)
        .flexible(true)
        .from_reader(reader);

    let layout = if legacy_columns {
        SheetLayout::legacy()
    } else {
        let headers = csv_reader.headers()?.clone();
        SheetLayout::from_headers(sheet, headers.iter())?
    };

    let mut rows = Vec::new();
    for (i, record) in csv_reader.records().enumerate() {
        let record = record.with_context(|| format!("Bad CSV record {} in {}", i + 2, sheet))?;
        let Some(code) = layout.get(&record, Field::CourseCode) else {
            if record.iter().any(|c| !c.trim().is_empty()) {
                bail!("Row {} in {} has no course code", i + 2, sheet);
            }
            continue;
        };
        let cell = |f: Field| layout.get(&record, f).map(str::to_string);
        rows.push(SourceRow {
            sheet: sheet.to_string(),
            row: 0,
            course_code: code.to_string(),
            department: cell(Field::Department),
            course_number: cell(Field::CourseNumber),
            course_title: cell(Field::CourseTitle),
            instructors: cell(Field::Instructors),
            grades: GRADE_FIELDS.map(cell),
            gpa: cell(Field::Gpa),
            processed: Processed::from_cell(layout.get(&record, Field::Processed)),
        });
    }
    Ok(rows)
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;
    use crate::workbook::RecordStore;

    const CSV: &str = "\
Course Code,Dept,Course No.,Title,Instructor,A,B,C,D,F,P,NP,Avg GPA,Processed
1234,,,,,10,8,3,1,0,2,0,3.42,F
34250,COMPSCI,161,ALGORITHMS,SHINDLER M.,1,2,3,4,5,6,7,,T
,,,,,,,,,,,,,
";

    #[test]
    fn sheet_names_from_file_stems() {
        assert_eq!(
            sheet_name_from_path(Path::new("data/Fall 2019.csv")).as_deref(),
            Some("Fall 2019")
        );
        assert_eq!(
            sheet_name_from_path(Path::new("summer_2020.csv")).as_deref(),
            Some("summer 2020")
        );
        assert_eq!(sheet_name_from_path(Path::new("/")), None);
    }

    #[test]
    fn reads_named_columns() {
        let rows = read_rows(CSV.as_bytes(), "Fall 2019", false).unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].course_code, "1234");
        assert_eq!(rows[0].department, None);
        assert_eq!(rows[0].grades[0].as_deref(), Some("10"));
        assert_eq!(rows[0].gpa.as_deref(), Some("3.42"));
        assert_eq!(rows[0].processed, Processed::Pending);
        assert_eq!(rows[1].department.as_deref(), Some("COMPSCI"));
        assert_eq!(rows[1].grades[6].as_deref(), Some("7"));
        assert_eq!(rows[1].gpa, None);
        assert_eq!(rows[1].processed, Processed::Done);
    }

    #[test]
    fn reads_legacy_letter_columns() {
        let csv = "\
Year,Term,Dept,Num,Code,Title,Instructors,A,B,C,D,F,P,NP,GPA,Processed
2019,Fall,I&C SCI,32A,36000,PROGRAMMING,PATTIS R.,5,4,3,2,1,0,0,3.1,F
";
        let rows = read_rows(csv.as_bytes(), "Fall 2019", true).unwrap();
        assert_eq!(rows[0].course_code, "36000");
        assert_eq!(rows[0].department.as_deref(), Some("I&C SCI"));
        assert_eq!(rows[0].instructors.as_deref(), Some("PATTIS R."));
        assert_eq!(rows[0].gpa.as_deref(), Some("3.1"));
    }

    #[test]
    fn missing_code_in_populated_row_is_error() {
        let csv = "Code,A,B,C,D,F,P,NP\n,1,1,1,1,1,1,1\n";
        assert!(read_rows(csv.as_bytes(), "Fall 2019", false).is_err());
    }

    #[test]
    fn import_is_not_repeated() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("Fall 2019.csv");
        std::fs::File::create(&path).unwrap().write_all(CSV.as_bytes()).unwrap();

        let mut wb = SqliteWorkbook::open_in_memory().unwrap();
        let first = import_csv(&mut wb, &path, None, false).unwrap();
        assert!(matches!(first, ImportOutcome::Imported { rows: 2, .. }));
        wb.commit_enrichment("FALL 2019", 2, &crate::workbook::tests::enrichment("01234"))
            .unwrap();

        let second = import_csv(&mut wb, &path, None, false).unwrap();
        assert!(matches!(second, ImportOutcome::AlreadyPresent { .. }));
        assert_eq!(wb.next_pending("FALL 2019", 0).unwrap(), None);
    }

    #[test]
    fn differently_cased_labels_share_one_sheet() {
        let dir = tempfile::tempdir().unwrap();
        let lower = dir.path().join("fall_2019.csv");
        let upper = dir.path().join("Fall 2019.csv");
        for path in [&lower, &upper] {
            std::fs::File::create(path).unwrap().write_all(CSV.as_bytes()).unwrap();
        }

        let mut wb = SqliteWorkbook::open_in_memory().unwrap();
        let first = import_csv(&mut wb, &lower, None, false).unwrap();
        let ImportOutcome::Imported { sheet, .. } = first else {
            panic!("expected the first import to create a sheet");
        };
        assert_eq!(sheet, "FALL 2019");

        let second = import_csv(&mut wb, &upper, None, false).unwrap();
        assert!(matches!(second, ImportOutcome::AlreadyPresent { sheet } if sheet == "FALL 2019"));
        let third = import_csv(&mut wb, &upper, Some("  fall   2019 "), false).unwrap();
        assert!(matches!(third, ImportOutcome::AlreadyPresent { .. }));
        assert_eq!(wb.sheet_names().unwrap(), vec!["FALL 2019"]);
    }

    #[test]
    fn rejects_non_term_sheet_names() {
        let mut wb = SqliteWorkbook::open_in_memory().unwrap();
        assert!(import_csv(&mut wb, Path::new("grades.csv"), None, false).is_err());
    }
}
