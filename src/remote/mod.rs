//! Hierarchical key/value remote store (realtime-database style).
//!
//! Paths are slash separated and relative to the database root. Values are
//! JSON; objects are trees whose children are addressable by extending the path.

mod memory;
mod rest;

pub use memory::MemoryRemoteStore;
pub use rest::RestRemoteStore;

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{Map, Value};

use crate::db::VideoKey;
use crate::error::{RemoteError, ValidationError};

pub type RemoteResult<T> = Result<T, RemoteError>;

#[async_trait]
pub trait RemoteStore: Send + Sync {
    /// Value at `path`, or `None` when nothing is stored there.
    async fn get(&self, path: &str) -> RemoteResult<Option<Value>>;

    /// Replaces the value at `path`.
    async fn set(&self, path: &str, value: Value) -> RemoteResult<()>;

    /// Writes the given children under `path`, leaving other children untouched.
    async fn update(&self, path: &str, fields: Map<String, Value>) -> RemoteResult<()>;

    async fn remove(&self, path: &str) -> RemoteResult<()>;

    /// Appends `value` to the collection at `path` under a generated id.
    async fn push(&self, path: &str, value: Value) -> RemoteResult<String>;

    /// Children of the collection at `path` whose `field` equals `value`.
    async fn query_equal(
        &self,
        path: &str,
        field: &str,
        value: &Value,
    ) -> RemoteResult<Vec<(String, Value)>>;
}

pub type SharedRemote = Arc<dyn RemoteStore>;

pub const ALERTS_PATH: &str = "alerts";

pub fn user_videos_path(user_id: &str) -> String {
    format!("users/{user_id}/videos")
}

pub fn video_path(key: &VideoKey) -> String {
    format!(
        "users/{}/videos/{}_{}",
        key.user_id, key.course_id, key.video_id
    )
}

pub fn courses_path(user_id: &str) -> String {
    format!("users/{user_id}/courses")
}

pub fn overall_path(user_id: &str) -> String {
    format!("users/{user_id}/overall")
}

/// Characters a single path segment may not contain: the separator, the
/// realtime-database key blacklist, and the URL query marker.
const FORBIDDEN_KEY_CHARS: &[char] = &['/', '.', '#', '$', '[', ']', '?'];

/// Checks that `value` can be used as one remote path segment.
pub fn validate_key(field: &'static str, value: &str) -> Result<(), ValidationError> {
    if value.trim().is_empty() {
        return Err(ValidationError::MissingField(field));
    }
    if let Some(bad) = value
        .chars()
        .find(|c| FORBIDDEN_KEY_CHARS.contains(c) || c.is_control())
    {
        return Err(ValidationError::InvalidValue {
            field,
            reason: format!("{value:?} contains forbidden character {bad:?}"),
        });
    }
    Ok(())
}

pub(crate) fn split_path(path: &str) -> Vec<&str> {
    path.split('/').filter(|segment| !segment.is_empty()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn video_path_matches_remote_layout() {
        let key = VideoKey::new("u1", "web-development", "video-3");
        assert_eq!(video_path(&key), "users/u1/videos/web-development_video-3");
        assert_eq!(courses_path("u1"), "users/u1/courses");
        assert_eq!(overall_path("u1"), "users/u1/overall");
    }

    #[test]
    fn keys_must_be_single_plain_segments() {
        assert!(validate_key("userId", "u1").is_ok());
        assert!(validate_key("courseId", "web-development").is_ok());
        assert!(validate_key("courseId", "data_science").is_ok());

        assert_eq!(
            validate_key("userId", " "),
            Err(ValidationError::MissingField("userId"))
        );
        for bad in ["../../../alerts/x", "a/b", "v1.2", "a#b", "$root", "x[0]", "q?x", "tab\tkey"] {
            assert!(
                matches!(
                    validate_key("courseId", bad),
                    Err(ValidationError::InvalidValue { field: "courseId", .. })
                ),
                "{bad}"
            );
        }
    }

    #[test]
    fn split_path_ignores_empty_segments() {
        assert_eq!(split_path("/users//u1/"), vec!["users", "u1"]);
        assert!(split_path("").is_empty());
    }
}
