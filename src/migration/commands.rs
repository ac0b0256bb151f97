use std::collections::BTreeMap;

use axum::{
    body::Bytes,
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::{json, Value};

use crate::{db::OldCourseProgress, error::ValidationError, remote::validate_key};

use super::{engine::MigrationEngine, legacy::parse_legacy_value};

const ENABLE_LOGS: bool = true;

use crate::{log_error, log_warn};

/// Validated `POST /migrate` body.
#[derive(Debug, PartialEq)]
pub struct MigrateRequest {
    pub user_id: String,
    pub course_progress_map: BTreeMap<String, OldCourseProgress>,
}

impl MigrateRequest {
    /// Checks required fields and that every id is usable as a remote path segment.
    /// Course entries with a malformed body, or more than `max_videos` videos, are
    /// skipped, not rejected.
    pub fn from_json(body: &Value, max_videos: u32) -> Result<Self, ValidationError> {
        let user_id = body
            .get("userId")
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|id| !id.is_empty())
            .ok_or(ValidationError::MissingField("userId"))?;
        validate_key("userId", user_id)?;

        let entries = match body.get("courseProgressMap") {
            None | Some(Value::Null) => return Err(ValidationError::MissingField("courseProgressMap")),
            Some(Value::Object(entries)) => entries,
            Some(_) => {
                return Err(ValidationError::InvalidValue {
                    field: "courseProgressMap",
                    reason: "expected an object keyed by course id".into(),
                })
            }
        };

        let mut course_progress_map = BTreeMap::new();
        for (course_id, entry) in entries {
            validate_key("courseId", course_id)?;
            match parse_legacy_value(entry.clone(), max_videos) {
                Ok(parsed) => {
                    course_progress_map.insert(course_id.clone(), parsed);
                }
                Err(err) => log_warn!("ignoring course {course_id} in migrate request: {err:#}"),
            }
        }

        Ok(Self {
            user_id: user_id.to_string(),
            course_progress_map,
        })
    }
}

fn bad_request(message: impl Into<String>) -> Response {
    (
        StatusCode::BAD_REQUEST,
        Json(json!({ "error": message.into() })),
    )
        .into_response()
}

pub async fn migrate_handler(State(engine): State<MigrationEngine>, body: Bytes) -> Response {
    let body: Value = match serde_json::from_slice(&body) {
        Ok(body) => body,
        Err(err) => return bad_request(format!("invalid JSON body: {err}")),
    };

    let request = match MigrateRequest::from_json(&body, engine.max_legacy_videos()) {
        Ok(request) => request,
        Err(err) => return bad_request(err.to_string()),
    };

    // a panic inside the migration must not take the server down
    let task = tokio::spawn(async move {
        engine
            .migrate_old_data(&request.user_id, &request.course_progress_map)
            .await
    });

    match task.await {
        Ok(result) if result.success => (
            StatusCode::OK,
            Json(json!({
                "success": true,
                "message": "Migration completed successfully",
                "data": result,
            })),
        )
            .into_response(),
        Ok(result) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({
                "error": result.error.clone().unwrap_or_else(|| "Migration failed".to_string()),
                "data": result,
            })),
        )
            .into_response(),
        Err(err) => {
            log_error!("migration task failed: {err}");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({ "error": "Internal server error" })),
            )
                .into_response()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MAX: u32 = 1_000;

    #[test]
    fn requires_user_id_and_map() {
        assert_eq!(
            MigrateRequest::from_json(&json!({"courseProgressMap": {}}), MAX),
            Err(ValidationError::MissingField("userId"))
        );
        assert_eq!(
            MigrateRequest::from_json(&json!({"userId": "  ", "courseProgressMap": {}}), MAX),
            Err(ValidationError::MissingField("userId"))
        );
        assert_eq!(
            MigrateRequest::from_json(&json!({"userId": "u1"}), MAX),
            Err(ValidationError::MissingField("courseProgressMap"))
        );
        assert!(matches!(
            MigrateRequest::from_json(&json!({"userId": "u1", "courseProgressMap": [1]}), MAX),
            Err(ValidationError::InvalidValue { .. })
        ));
    }

    #[test]
    fn malformed_courses_are_skipped() {
        let request = MigrateRequest::from_json(&json!({
            "userId": "u1",
            "courseProgressMap": {
                "web-development": {"completedVideos": 3, "totalVideos": 10, "progress": 30},
                "broken": "nope",
                "endless": {"completedVideos": 3, "totalVideos": 1e12}
            }
        }), MAX)
        .unwrap();
        assert_eq!(request.user_id, "u1");
        assert_eq!(request.course_progress_map.len(), 1);
        assert_eq!(request.course_progress_map["web-development"].completed_videos, 3);
    }

    #[test]
    fn ids_that_are_not_plain_path_segments_are_rejected() {
        let traversal = MigrateRequest::from_json(&json!({
            "userId": "u1",
            "courseProgressMap": {
                "web-development": {"completedVideos": 3, "totalVideos": 10},
                "../../../alerts/x": {"completedVideos": 1, "totalVideos": 2}
            }
        }), MAX);
        assert!(matches!(
            traversal,
            Err(ValidationError::InvalidValue { field: "courseId", .. })
        ));

        for user_id in ["a/b", "u.1", "#u", "$u", "u[0]", "u?x"] {
            assert!(
                matches!(
                    MigrateRequest::from_json(&json!({"userId": user_id, "courseProgressMap": {}}), MAX),
                    Err(ValidationError::InvalidValue { field: "userId", .. })
                ),
                "userId {user_id}"
            );
        }
    }
}
