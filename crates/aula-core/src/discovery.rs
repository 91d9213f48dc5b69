//! Discovery of the joinable live session for a lecture.
//!
//! The one request/response call the realtime core depends on; all other
//! CRUD (auth, enrollment, materials) lives with the app shell.

use std::sync::OnceLock;

use regex::Regex;
use serde::Deserialize;

use crate::errors::AulaError;

#[derive(Debug, Deserialize)]
struct ActiveSessionResponse {
    session_id: String,
}

fn lecture_id_pattern() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^[A-Za-z0-9][A-Za-z0-9_-]{0,63}$").expect("static pattern"))
}

/// Client for the lecture service's active-session lookup.
pub struct SessionDirectory {
    base_url: String,
    http: reqwest::Client,
}

impl SessionDirectory {
    /// `base_url` is the lecture service root, e.g. `https://aula.example.com`.
    pub fn new(base_url: &str) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            http: reqwest::Client::new(),
        }
    }

    /// Look up the currently joinable session for a lecture. `None` means
    /// no live session right now.
    pub async fn active_session_id(&self, lecture_id: &str) -> Result<Option<String>, AulaError> {
        let url = self.endpoint(lecture_id)?;
        tracing::debug!("looking up active session: {url}");

        let resp = self
            .http
            .get(&url)
            .send()
            .await
            .map_err(|e| AulaError::Http(e.to_string()))?;

        if resp.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !resp.status().is_success() {
            return Err(AulaError::Api(format!(
                "lecture service returned status {}",
                resp.status()
            )));
        }

        let data: ActiveSessionResponse = resp
            .json()
            .await
            .map_err(|e| AulaError::Api(format!("invalid active-session response: {e}")))?;
        Ok(Some(data.session_id))
    }

    fn endpoint(&self, lecture_id: &str) -> Result<String, AulaError> {
        if !lecture_id_pattern().is_match(lecture_id) {
            return Err(AulaError::InvalidLectureId(lecture_id.to_string()));
        }
        Ok(format!(
            "{}/api/v1/lectures/{}/active-session",
            self.base_url,
            urlencoding::encode(lecture_id)
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn endpoint_is_built_from_base_and_lecture() {
        let directory = SessionDirectory::new("https://aula.example.com/");
        assert_eq!(
            directory.endpoint("phys-101").unwrap(),
            "https://aula.example.com/api/v1/lectures/phys-101/active-session"
        );
    }

    #[test]
    fn lecture_ids_are_validated() {
        let directory = SessionDirectory::new("https://aula.example.com");
        assert!(matches!(
            directory.endpoint("").unwrap_err(),
            AulaError::InvalidLectureId(_)
        ));
        assert!(matches!(
            directory.endpoint("../admin").unwrap_err(),
            AulaError::InvalidLectureId(_)
        ));
        assert!(directory.endpoint("lec_2024-B").is_ok());
    }
}
