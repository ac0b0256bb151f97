use serde::{Deserialize, Serialize};

/// Course percentage at which the quiz opens.
pub const QUIZ_UNLOCK_PERCENT: u32 = 80;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct CourseProgress {
    #[serde(default)]
    pub course_id: String,
    pub total_videos: u32,
    pub completed_videos: u32,
    pub progress: u32,
    pub quiz_unlocked: bool,
    #[serde(default)]
    pub last_updated: i64,
}

impl CourseProgress {
    /// Derives the percentage and quiz flag from raw counts.
    pub fn from_counts(course_id: &str, total_videos: u32, completed_videos: u32, now_ms: i64) -> Self {
        let completed_videos = completed_videos.min(total_videos);
        let progress = if total_videos == 0 {
            0
        } else {
            ((f64::from(completed_videos) / f64::from(total_videos)) * 100.0).round() as u32
        }
        .min(100);

        Self {
            course_id: course_id.to_string(),
            total_videos,
            completed_videos,
            progress,
            quiz_unlocked: progress >= QUIZ_UNLOCK_PERCENT,
            last_updated: now_ms,
        }
    }

    pub fn is_complete(&self) -> bool {
        self.progress == 100
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct OverallProgress {
    pub overall_progress: u32,
    pub total_courses: u32,
    pub completed_courses: u32,
    #[serde(default)]
    pub last_updated: i64,
}

impl OverallProgress {
    /// Rounded mean of the course percentages.
    pub fn from_courses<'a, I>(courses: I, now_ms: i64) -> Self
    where
        I: IntoIterator<Item = &'a CourseProgress>,
    {
        let mut total_courses = 0u32;
        let mut completed_courses = 0u32;
        let mut sum = 0u64;
        for course in courses {
            total_courses += 1;
            sum += u64::from(course.progress.min(100));
            if course.is_complete() {
                completed_courses += 1;
            }
        }

        let overall_progress = if total_courses == 0 {
            0
        } else {
            (sum as f64 / f64::from(total_courses)).round() as u32
        };

        Self {
            overall_progress: overall_progress.min(100),
            total_courses,
            completed_courses,
            last_updated: now_ms,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn eight_of_ten_is_eighty_and_unlocks_quiz() {
        let course = CourseProgress::from_counts("c", 10, 8, 0);
        assert_eq!(course.progress, 80);
        assert!(course.quiz_unlocked);
    }

    #[test]
    fn quiz_locked_at_seventy_nine() {
        let course = CourseProgress::from_counts("c", 100, 79, 0);
        assert_eq!(course.progress, 79);
        assert!(!course.quiz_unlocked);

        let course = CourseProgress::from_counts("c", 100, 80, 0);
        assert!(course.quiz_unlocked);
    }

    #[test]
    fn completed_is_clamped_to_total() {
        let course = CourseProgress::from_counts("c", 4, 9, 0);
        assert_eq!(course.completed_videos, 4);
        assert_eq!(course.progress, 100);
        assert!(course.is_complete());
    }

    #[test]
    fn empty_course_is_zero_percent() {
        let course = CourseProgress::from_counts("c", 0, 0, 0);
        assert_eq!(course.progress, 0);
        assert!(!course.quiz_unlocked);
    }

    #[test]
    fn overall_is_rounded_mean() {
        let courses = vec![
            CourseProgress::from_counts("a", 10, 3, 0),
            CourseProgress::from_counts("b", 2, 2, 0),
            CourseProgress::from_counts("c", 3, 0, 0),
        ];
        let overall = OverallProgress::from_courses(&courses, 0);
        // (30 + 100 + 0) / 3 = 43.33
        assert_eq!(overall.overall_progress, 43);
        assert_eq!(overall.total_courses, 3);
        assert_eq!(overall.completed_courses, 1);
    }

    #[test]
    fn overall_of_nothing_is_zero() {
        let overall = OverallProgress::from_courses(&Vec::<CourseProgress>::new(), 0);
        assert_eq!(overall.overall_progress, 0);
        assert_eq!(overall.total_courses, 0);
    }
}
