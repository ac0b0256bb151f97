pub mod alert;
pub mod course_progress;
pub mod migration;
pub mod video_progress;

pub use alert::{Alert, AlertKind};
pub use course_progress::{CourseProgress, OverallProgress, QUIZ_UNLOCK_PERCENT};
pub use migration::{MigrationResult, OldCourseProgress};
pub use video_progress::{
    ContinueLearning, StoredVideoProgress, VideoKey, VideoProgress, VideoProgressPatch,
    ViolationCounter, ViolationCounts,
};
