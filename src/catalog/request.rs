use tracing::debug;

use crate::term::{CourseCode, Term};

/// One POST to the catalog service for a single `YearTerm` and course code.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CatalogRequest {
    pub endpoint: String,
    pub user_agent: String,
    pub year_term: String,
    pub course_code: CourseCode,
}

impl CatalogRequest {
    /// URL-encoded form body. Cancelled courses are excluded; every class type and division
    /// is allowed.
    pub fn body(&self) -> String {
        format!(
            "Submit=Display+XML+Results&YearTerm={}&Breadth=ANY&Dept=+ALL&Division=ANY&\
             ClassType=ALL&FullCourses=ANY&CancelledCourses=Exclude&CourseCodes={}",
            self.year_term, self.course_code
        )
    }
}

#[derive(Debug, Clone)]
pub struct RequestBuilder {
    endpoint: String,
    user_agent: String,
}

impl RequestBuilder {
    pub fn new(endpoint: impl Into<String>, user_agent: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            user_agent: user_agent.into(),
        }
    }

    /// One request for a simple term, one per session (in table order) for a split term.
    pub fn build_requests(&self, term: &Term, course_code: &CourseCode) -> Vec<CatalogRequest> {
        let requests: Vec<CatalogRequest> = term
            .year_terms()
            .into_iter()
            .map(|year_term| CatalogRequest {
                endpoint: self.endpoint.clone(),
                user_agent: self.user_agent.clone(),
                year_term,
                course_code: course_code.clone(),
            })
            .collect();
        debug!(
            term = %term,
            kind = ?term.kind(),
            course_code = %course_code,
            requests = requests.len(),
            "Built catalog requests"
        );
        requests
    }
}
