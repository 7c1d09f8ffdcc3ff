use std::collections::HashMap;

use crate::error::{PipelineError, Result};

/// Logical columns of a grade sheet, independent of physical order or header spelling.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Field {
    CourseCode,
    Department,
    CourseNumber,
    CourseTitle,
    Instructors,
    GradeA,
    GradeB,
    GradeC,
    GradeD,
    GradeF,
    GradeP,
    GradeNp,
    Gpa,
    Processed,
}

pub const GRADE_FIELDS: [Field; 7] = [
    Field::GradeA,
    Field::GradeB,
    Field::GradeC,
    Field::GradeD,
    Field::GradeF,
    Field::GradeP,
    Field::GradeNp,
];

const REQUIRED: [Field; 8] = [
    Field::CourseCode,
    Field::GradeA,
    Field::GradeB,
    Field::GradeC,
    Field::GradeD,
    Field::GradeF,
    Field::GradeP,
    Field::GradeNp,
];

impl Field {
    pub fn name(&self) -> &'static str {
        match self {
            Self::CourseCode => "course_code",
            Self::Department => "department",
            Self::CourseNumber => "course_number",
            Self::CourseTitle => "course_title",
            Self::Instructors => "instructors",
            Self::GradeA => "grade_a_count",
            Self::GradeB => "grade_b_count",
            Self::GradeC => "grade_c_count",
            Self::GradeD => "grade_d_count",
            Self::GradeF => "grade_f_count",
            Self::GradeP => "grade_p_count",
            Self::GradeNp => "grade_np_count",
            Self::Gpa => "gpa_avg",
            Self::Processed => "processed",
        }
    }

    /// Header spellings seen across export versions, compared after `header_key`.
    fn aliases(&self) -> &'static [&'static str] {
        match self {
            Self::CourseCode => &["coursecode", "code", "ccode", "courseid"],
            Self::Department => &["department", "dept", "deptcode", "deptname"],
            Self::CourseNumber => &["coursenumber", "coursenum", "courseno", "number", "num"],
            Self::CourseTitle => &["coursetitle", "title", "coursename"],
            Self::Instructors => {
                &["instructors", "instructor", "instructorname", "instructornames"]
            }
            Self::GradeA => &["a", "gradea", "gradeacount", "acount"],
            Self::GradeB => &["b", "gradeb", "gradebcount", "bcount"],
            Self::GradeC => &["c", "gradec", "gradeccount", "ccount"],
            Self::GradeD => &["d", "graded", "gradedcount", "dcount"],
            Self::GradeF => &["f", "gradef", "gradefcount", "fcount"],
            Self::GradeP => &["p", "gradep", "gradepcount", "pcount", "pass"],
            Self::GradeNp => &["np", "gradenp", "gradenpcount", "npcount", "nopass"],
            Self::Gpa => &["gpa", "avggpa", "averagegpa", "gpaavg", "gpaaverage"],
            Self::Processed => &["processed", "done"],
        }
    }

    fn all() -> [Field; 14] {
        [
            Self::CourseCode,
            Self::Department,
            Self::CourseNumber,
            Self::CourseTitle,
            Self::Instructors,
            Self::GradeA,
            Self::GradeB,
            Self::GradeC,
            Self::GradeD,
            Self::GradeF,
            Self::GradeP,
            Self::GradeNp,
            Self::Gpa,
            Self::Processed,
        ]
    }
}

fn header_key(header: &str) -> String {
    header
        .chars()
        .filter(|c| c.is_ascii_alphanumeric())
        .collect::<String>()
        .to_ascii_lowercase()
}

/// Field → column index map, resolved once per sheet.
#[derive(Debug, Clone)]
pub struct SheetLayout {
    columns: HashMap<Field, usize>,
}

impl SheetLayout {
    /// Resolve a header row. Unknown headers are ignored; the first header matching a field
    /// wins.
    pub fn from_headers<'a>(
        sheet: &str,
        headers: impl IntoIterator<Item = &'a str>,
    ) -> Result<Self> {
        let keys: Vec<String> = headers.into_iter().map(header_key).collect();
        let mut columns = HashMap::new();
        for field in Field::all() {
            if let Some(idx) = keys.iter().position(|k| field.aliases().contains(&k.as_str())) {
                columns.insert(field, idx);
            }
        }

        let missing: Vec<&str> = REQUIRED
            .iter()
            .filter(|f| !columns.contains_key(*f))
            .map(|f| f.name())
            .collect();
        if !missing.is_empty() {
            return Err(PipelineError::layout(
                sheet,
                format!("missing required columns: {}", missing.join(", ")),
            ));
        }
        Ok(Self { columns })
    }

    /// Fixed letter layout of the original grade workbooks: C..G metadata, H..N grades,
    /// O average GPA, P processed flag.
    pub fn legacy() -> Self {
        let letters = [
            (Field::Department, 'C'),
            (Field::CourseNumber, 'D'),
            (Field::CourseCode, 'E'),
            (Field::CourseTitle, 'F'),
            (Field::Instructors, 'G'),
            (Field::GradeA, 'H'),
            (Field::GradeB, 'I'),
            (Field::GradeC, 'J'),
            (Field::GradeD, 'K'),
            (Field::GradeF, 'L'),
            (Field::GradeP, 'M'),
            (Field::GradeNp, 'N'),
            (Field::Gpa, 'O'),
            (Field::Processed, 'P'),
        ];
        let columns = letters
            .into_iter()
            .map(|(field, letter)| (field, (letter as u8 - b'A') as usize))
            .collect();
        Self { columns }
    }

    pub fn column(&self, field: Field) -> Option<usize> {
        self.columns.get(&field).copied()
    }

    /// Trimmed cell value, `None` when the column is absent or the cell is blank.
    pub fn get<'r>(&self, record: &'r csv::StringRecord, field: Field) -> Option<&'r str> {
        let idx = self.column(field)?;
        let value = record.get(idx)?.trim();
        if value.is_empty() {
            None
        } else {
            Some(value)
        }
    }
}
