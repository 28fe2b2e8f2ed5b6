use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Default timeout for Canvas requests
pub const DEFAULT_TIMEOUT_SECONDS: u64 = 30;

/// Page size requested from paginated endpoints
pub const PER_PAGE: u32 = 50;

/// Connection settings for a Canvas instance: the API root and a scoped
/// access token sent as a bearer credential.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CanvasConfig {
    pub base_url: String,
    pub token: String,
}

impl CanvasConfig {
    pub fn new(base_url: &str, token: &str) -> Self {
        Self {
            base_url: base_url.trim().trim_end_matches('/').to_string(),
            token: token.trim().to_string(),
        }
    }

    /// Environment fallback, the non-interactive path for cron-style syncs.
    pub fn from_env() -> Option<Self> {
        let base_url = std::env::var("CANVAS_BASE_URL").ok().filter(|s| !s.is_empty())?;
        let token = std::env::var("CANVAS_TOKEN").ok().filter(|s| !s.is_empty())?;
        Some(Self::new(&base_url, &token))
    }
}

#[derive(Debug, Error)]
pub enum CanvasError {
    #[error("canvas returned HTTP {status}: {body}")]
    Status { status: u16, body: String },
    #[error("canvas transport error: {0}")]
    Transport(String),
    #[error("canvas response decode failed: {0}")]
    Decode(String),
}

#[derive(Debug, Clone, Deserialize)]
pub struct CanvasCourse {
    pub id: i64,
    pub name: String,
    pub start_at: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct OutcomeRef {
    pub id: i64,
    pub title: String,
}

/// Items from the outcome_group_links endpoint wrap the outcome itself.
#[derive(Debug, Clone, Deserialize)]
pub struct OutcomeLink {
    pub outcome: OutcomeRef,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CanvasAssignment {
    pub id: i64,
    pub name: String,
    pub points_possible: Option<f64>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct EnrollmentUser {
    pub sortable_name: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CanvasEnrollment {
    pub user_id: i64,
    pub user: EnrollmentUser,
}

/// Links in an outcome result come back as strings, not integers.
#[derive(Debug, Clone, Deserialize)]
pub struct OutcomeResultLinks {
    pub user: String,
    pub learning_outcome: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct OutcomeResult {
    pub id: i64,
    pub score: Option<f64>,
    pub mastery: Option<bool>,
    pub submitted_or_assessed_at: Option<String>,
    pub links: OutcomeResultLinks,
}

/// outcome_results pages are an envelope, unlike the plain-array endpoints.
#[derive(Debug, Deserialize)]
struct OutcomeResultsPage {
    outcome_results: Vec<OutcomeResult>,
}

pub struct CanvasClient {
    agent: ureq::Agent,
    config: CanvasConfig,
}

impl CanvasClient {
    pub fn new(config: CanvasConfig) -> Self {
        let agent = ureq::AgentBuilder::new()
            .timeout(Duration::from_secs(DEFAULT_TIMEOUT_SECONDS))
            .build();
        Self { agent, config }
    }

    fn api_url(&self, path: &str) -> String {
        format!("{}/api/v1/{}", self.config.base_url, path)
    }

    fn get_page(&self, url: &str) -> Result<(serde_json::Value, Option<String>), CanvasError> {
        let response = self
            .agent
            .get(url)
            .set("Authorization", &format!("Bearer {}", self.config.token))
            .call();
        match response {
            Ok(res) => {
                let next = res.header("link").and_then(parse_next_link);
                let value: serde_json::Value = res
                    .into_json()
                    .map_err(|e| CanvasError::Decode(e.to_string()))?;
                Ok((value, next))
            }
            Err(ureq::Error::Status(status, res)) => {
                let body = res.into_string().unwrap_or_default();
                Err(CanvasError::Status { status, body })
            }
            Err(ureq::Error::Transport(e)) => Err(CanvasError::Transport(e.to_string())),
        }
    }

    /// Walk a plain-array endpoint across all of its pages.
    fn get_all(&self, first_url: &str) -> Result<Vec<serde_json::Value>, CanvasError> {
        let mut items = Vec::new();
        let mut url = Some(first_url.to_string());
        while let Some(u) = url {
            let (value, next) = self.get_page(&u)?;
            match value {
                serde_json::Value::Array(page) => items.extend(page),
                other => {
                    return Err(CanvasError::Decode(format!(
                        "expected a JSON array page, got {}",
                        other
                    )))
                }
            }
            url = next;
        }
        Ok(items)
    }

    fn decode_items<T: serde::de::DeserializeOwned>(
        items: Vec<serde_json::Value>,
    ) -> Result<Vec<T>, CanvasError> {
        items
            .into_iter()
            .map(|v| serde_json::from_value(v).map_err(|e| CanvasError::Decode(e.to_string())))
            .collect()
    }

    /// Courses the teacher can import: active teaching enrollments.
    pub fn get_courses(&self) -> Result<Vec<CanvasCourse>, CanvasError> {
        let url = self.api_url(&format!(
            "courses?enrollment_type=teacher&enrollment_state=available&per_page={}",
            PER_PAGE
        ));
        Self::decode_items(self.get_all(&url)?)
    }

    pub fn get_outcome_links(&self, course_id: i64) -> Result<Vec<OutcomeRef>, CanvasError> {
        let url = self.api_url(&format!(
            "courses/{}/outcome_group_links?outcome_style=full&per_page={}",
            course_id, PER_PAGE
        ));
        let links: Vec<OutcomeLink> = Self::decode_items(self.get_all(&url)?)?;
        Ok(links.into_iter().map(|l| l.outcome).collect())
    }

    pub fn get_assignments(&self, course_id: i64) -> Result<Vec<CanvasAssignment>, CanvasError> {
        let url = self.api_url(&format!("courses/{}/assignments?per_page={}", course_id, PER_PAGE));
        Self::decode_items(self.get_all(&url)?)
    }

    pub fn get_enrollments(&self, course_id: i64) -> Result<Vec<CanvasEnrollment>, CanvasError> {
        let url = self.api_url(&format!(
            "courses/{}/enrollments?type[]=StudentEnrollment&state[]=active&per_page={}",
            course_id, PER_PAGE
        ));
        Self::decode_items(self.get_all(&url)?)
    }

    /// Outcome results live at the course context; restrict to the outcomes
    /// the caller tracks.
    pub fn get_outcome_results(
        &self,
        course_id: i64,
        outcome_ids: &[i64],
    ) -> Result<Vec<OutcomeResult>, CanvasError> {
        let mut url = self.api_url(&format!(
            "courses/{}/outcome_results?per_page={}",
            course_id, PER_PAGE
        ));
        for id in outcome_ids {
            url.push_str(&format!("&outcome_ids[]={}", id));
        }

        let mut results = Vec::new();
        let mut next = Some(url);
        while let Some(u) = next {
            let (value, n) = self.get_page(&u)?;
            let page: OutcomeResultsPage =
                serde_json::from_value(value).map_err(|e| CanvasError::Decode(e.to_string()))?;
            results.extend(page.outcome_results);
            next = n;
        }
        Ok(results)
    }

    /// Write one grade into the gradebook.
    pub fn put_submission_grade(
        &self,
        course_id: i64,
        assignment_id: i64,
        user_canvas_id: i64,
        posted_grade: f64,
    ) -> Result<(), CanvasError> {
        let url = self.api_url(&format!(
            "courses/{}/assignments/{}/submissions/{}",
            course_id, assignment_id, user_canvas_id
        ));
        let grade = posted_grade.to_string();
        let response = self
            .agent
            .put(&url)
            .set("Authorization", &format!("Bearer {}", self.config.token))
            .send_form(&[("submission[posted_grade]", grade.as_str())]);
        match response {
            Ok(_) => Ok(()),
            Err(ureq::Error::Status(status, res)) => {
                let body = res.into_string().unwrap_or_default();
                Err(CanvasError::Status { status, body })
            }
            Err(ureq::Error::Transport(e)) => Err(CanvasError::Transport(e.to_string())),
        }
    }
}

/// Pull the rel="next" target out of an RFC 5988 Link header.
fn parse_next_link(header: &str) -> Option<String> {
    for part in header.split(',') {
        let part = part.trim();
        let Some((url, params)) = part.split_once(';') else {
            continue;
        };
        let url = url.trim().trim_start_matches('<').trim_end_matches('>');
        if params.split(';').any(|p| p.trim() == "rel=\"next\"") {
            return Some(url.to_string());
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn next_link_parsed_from_canvas_header() {
        let header = "<https://canvas.test/api/v1/courses?page=1&per_page=50>; rel=\"current\",\
                      <https://canvas.test/api/v1/courses?page=2&per_page=50>; rel=\"next\",\
                      <https://canvas.test/api/v1/courses?page=1&per_page=50>; rel=\"first\"";
        assert_eq!(
            parse_next_link(header).as_deref(),
            Some("https://canvas.test/api/v1/courses?page=2&per_page=50")
        );
    }

    #[test]
    fn next_link_absent_on_last_page() {
        let header = "<https://canvas.test/api/v1/courses?page=2>; rel=\"current\",\
                      <https://canvas.test/api/v1/courses?page=1>; rel=\"first\"";
        assert_eq!(parse_next_link(header), None);
    }

    #[test]
    fn outcome_result_decodes_canvas_shape() {
        let raw = serde_json::json!({
            "hidden": false,
            "hide_points": false,
            "id": 200559,
            "links": {
                "alignment": "assignment_259284",
                "assignment": "assignment_259284",
                "learning_outcome": "16987",
                "user": "31871"
            },
            "mastery": true,
            "percent": 0.75,
            "possible": 4.0,
            "score": 3.0,
            "submitted_or_assessed_at": "2021-03-04T17:46:29Z"
        });
        let result: OutcomeResult = serde_json::from_value(raw).expect("decode outcome result");
        assert_eq!(result.id, 200559);
        assert_eq!(result.score, Some(3.0));
        assert_eq!(result.mastery, Some(true));
        assert_eq!(result.links.user, "31871");
        assert_eq!(result.links.learning_outcome, "16987");
    }

    #[test]
    fn enrollment_decodes_nested_user() {
        let raw = serde_json::json!({
            "id": 7,
            "user_id": 31871,
            "type": "StudentEnrollment",
            "enrollment_state": "active",
            "user": { "id": 31871, "sortable_name": "Doe, Jane" }
        });
        let enrollment: CanvasEnrollment = serde_json::from_value(raw).expect("decode enrollment");
        assert_eq!(enrollment.user_id, 31871);
        assert_eq!(enrollment.user.sortable_name, "Doe, Jane");
    }

    #[test]
    fn config_normalizes_trailing_slash() {
        let config = CanvasConfig::new("https://canvas.test/", "tok");
        assert_eq!(config.base_url, "https://canvas.test");
    }
}
