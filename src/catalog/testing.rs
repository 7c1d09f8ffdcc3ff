use std::cell::RefCell;
use std::collections::HashMap;
use std::time::Instant;

use super::client::TransportError;
use super::{CatalogRequest, CatalogTransport};

const EMPTY_RESULTS: &str = "<websoc_results><course_list/></websoc_results>";

/// Canned catalog responses keyed by `YearTerm` (and optionally course code).
/// Unknown requests get an empty result document.
#[derive(Default)]
pub struct FakeTransport {
    responses: HashMap<(String, Option<String>), Result<String, TransportError>>,
    calls: RefCell<Vec<(String, String, Instant)>>,
}

impl FakeTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn respond(mut self, year_term: &str, response: Result<String, TransportError>) -> Self {
        self.responses.insert((year_term.to_string(), None), response);
        self
    }

    pub fn respond_code(
        mut self,
        year_term: &str,
        code: &str,
        response: Result<String, TransportError>,
    ) -> Self {
        self.responses
            .insert((year_term.to_string(), Some(code.to_string())), response);
        self
    }

    pub fn sent(&self) -> Vec<String> {
        self.calls.borrow().iter().map(|(yt, _, _)| yt.clone()).collect()
    }

    pub fn sent_codes(&self) -> Vec<String> {
        self.calls.borrow().iter().map(|(_, code, _)| code.clone()).collect()
    }

    pub fn sent_at(&self) -> Vec<Instant> {
        self.calls.borrow().iter().map(|(_, _, at)| *at).collect()
    }
}

impl CatalogTransport for FakeTransport {
    async fn send(&self, request: &CatalogRequest) -> Result<String, TransportError> {
        let code = request.course_code.to_string();
        self.calls
            .borrow_mut()
            .push((request.year_term.clone(), code.clone(), Instant::now()));
        self.responses
            .get(&(request.year_term.clone(), Some(code)))
            .or_else(|| self.responses.get(&(request.year_term.clone(), None)))
            .cloned()
            .unwrap_or_else(|| Ok(EMPTY_RESULTS.to_string()))
    }
}

/// Minimal catalog document with one department/course/section.
pub fn course_xml(
    dept: &str,
    number: &str,
    title: &str,
    code: &str,
    instructors: &[&str],
) -> String {
    let instructors: String = instructors
        .iter()
        .map(|name| format!("<instructor>{}</instructor>", escape(name)))
        .collect();
    format!(
        "<?xml version=\"1.0\"?><websoc_results><course_list><term>\
         <department dept_code=\"{}\"><course course_number=\"{}\" course_title=\"{}\">\
         <section><course_code>{}</course_code><sec_instructors>\n{}\n</sec_instructors></section>\
         </course></department></term></course_list></websoc_results>",
        escape(dept),
        escape(number),
        escape(title),
        code,
        instructors
    )
}

fn escape(s: &str) -> String {
    s.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
}
