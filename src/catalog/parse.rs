use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;

use super::CatalogRecord;

/// Placeholder the catalog lists when no instructor is assigned.
pub const UNASSIGNED_INSTRUCTOR: &str = "STAFF";

#[derive(Debug, thiserror::Error)]
#[error("catalog response is not well-formed XML: {0}")]
pub struct ParseError(String);

#[derive(Default)]
struct Section {
    course_code: Option<String>,
    instructors: Vec<String>,
}

enum Capture {
    None,
    CourseCode,
    Instructor,
}

/// Find the first section whose `course_code` equals `target` and read its enclosing
/// department and course attributes plus the sibling instructor list.
///
/// Expected nesting: `department[@dept_code] > course[@course_number, @course_title] >
/// section > (course_code, sec_instructors > instructor*)`.
pub fn find_course(
    xml: &str,
    target: &str,
    year_term: &str,
) -> Result<Option<CatalogRecord>, ParseError> {
    let mut reader = Reader::from_str(xml);
    let mut buf = Vec::new();

    let mut dept: Option<String> = None;
    let mut course: Option<(String, String)> = None;
    let mut section: Option<Section> = None;
    let mut in_instructors = false;
    let mut capture = Capture::None;
    let mut text = String::new();

    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(e)) => match e.name().as_ref() {
                b"department" => dept = Some(attr(&e, b"dept_code")?),
                b"course" => {
                    course = Some((attr(&e, b"course_number")?, attr(&e, b"course_title")?));
                }
                b"section" => section = Some(Section::default()),
                b"course_code" if section.is_some() => {
                    capture = Capture::CourseCode;
                    text.clear();
                }
                b"sec_instructors" if section.is_some() => in_instructors = true,
                b"instructor" if in_instructors => {
                    capture = Capture::Instructor;
                    text.clear();
                }
                _ => {}
            },
            Ok(Event::Text(e)) if !matches!(capture, Capture::None) => {
                let unescaped = e.unescape().map_err(|e| ParseError(e.to_string()))?;
                text.push_str(&unescaped);
            }
            Ok(Event::CData(e)) if !matches!(capture, Capture::None) => {
                text.push_str(&String::from_utf8_lossy(&e));
            }
            Ok(Event::End(e)) => match e.name().as_ref() {
                b"course_code" => {
                    if let (Capture::CourseCode, Some(s)) = (&capture, section.as_mut()) {
                        s.course_code = Some(text.trim().to_string());
                    }
                    capture = Capture::None;
                }
                b"instructor" => {
                    if let (Capture::Instructor, Some(s)) = (&capture, section.as_mut()) {
                        s.instructors.push(text.clone());
                    }
                    capture = Capture::None;
                }
                b"sec_instructors" => in_instructors = false,
                b"section" => {
                    if let Some(s) = section.take() {
                        if s.course_code.as_deref() == Some(target) {
                            let (course_number, course_title) = course.clone().unwrap_or_default();
                            return Ok(Some(CatalogRecord {
                                department: dept.clone().unwrap_or_default(),
                                course_number,
                                course_title,
                                instructors: filter_instructors(
                                    s.instructors.iter().map(String::as_str),
                                ),
                                year_term: year_term.to_string(),
                                collided_with: None,
                            }));
                        }
                    }
                }
                b"course" => course = None,
                b"department" => dept = None,
                _ => {}
            },
            Ok(Event::Eof) => break,
            Err(e) => return Err(ParseError(e.to_string())),
            _ => {}
        }
        buf.clear();
    }
    Ok(None)
}

/// Drop whitespace-only entries and the unassigned placeholder; trim and dedupe, keeping order.
pub fn filter_instructors<'a>(entries: impl IntoIterator<Item = &'a str>) -> Vec<String> {
    let mut names: Vec<String> = Vec::new();
    for entry in entries {
        let name = entry.trim();
        if name.is_empty() || name == UNASSIGNED_INSTRUCTOR {
            continue;
        }
        if !names.iter().any(|n| n == name) {
            names.push(name.to_string());
        }
    }
    names
}

fn attr(e: &BytesStart, name: &[u8]) -> Result<String, ParseError> {
    let Some(a) = e.try_get_attribute(name).map_err(|e| ParseError(e.to_string()))? else {
        return Ok(String::new());
    };
    let value = a.unescape_value().map_err(|e| ParseError(e.to_string()))?;
    Ok(value.trim().to_string())
}
