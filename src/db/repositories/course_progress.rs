use std::collections::BTreeMap;

use anyhow::Result;
use rusqlite::{params, OptionalExtension};

use crate::db::{
    connection::Database,
    helpers::to_u32,
    models::{CourseProgress, OverallProgress},
};

impl Database {
    pub async fn set_course_video_count(
        &self,
        user_id: &str,
        course_id: &str,
        total_videos: u32,
    ) -> Result<()> {
        let user_id = user_id.to_string();
        let course_id = course_id.to_string();
        self.execute(move |conn| {
            conn.execute(
                "INSERT INTO course_catalog (user_id, course_id, total_videos)
                 VALUES (?1, ?2, ?3)
                 ON CONFLICT(user_id, course_id) DO UPDATE SET total_videos = excluded.total_videos",
                params![user_id, course_id, i64::from(total_videos)],
            )?;
            Ok(())
        })
        .await
    }

    pub async fn get_course_catalog(&self, user_id: &str) -> Result<BTreeMap<String, u32>> {
        let user_id = user_id.to_string();
        self.execute(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT course_id, total_videos FROM course_catalog WHERE user_id = ?1",
            )?;
            let mut rows = stmt.query(params![user_id])?;
            let mut catalog = BTreeMap::new();
            while let Some(row) = rows.next()? {
                let course_id: String = row.get(0)?;
                let total = to_u32(row.get(1)?, "total_videos")?;
                catalog.insert(course_id, total);
            }
            Ok(catalog)
        })
        .await
    }

    /// Replaces the denormalised aggregates for a user in one transaction.
    pub async fn replace_progress_cache(
        &self,
        user_id: &str,
        courses: &[CourseProgress],
        overall: &OverallProgress,
    ) -> Result<()> {
        let user_id = user_id.to_string();
        let courses = courses.to_vec();
        let overall = overall.clone();
        self.execute(move |conn| {
            let tx = conn.transaction()?;
            tx.execute(
                "DELETE FROM course_progress_cache WHERE user_id = ?1",
                params![user_id],
            )?;
            for course in &courses {
                tx.execute(
                    "INSERT INTO course_progress_cache (
                        user_id, course_id, total_videos, completed_videos,
                        progress, quiz_unlocked, last_updated
                     ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                    params![
                        user_id,
                        course.course_id,
                        i64::from(course.total_videos),
                        i64::from(course.completed_videos),
                        i64::from(course.progress),
                        course.quiz_unlocked as i64,
                        course.last_updated,
                    ],
                )?;
            }
            tx.execute(
                "INSERT INTO overall_progress_cache (
                    user_id, overall_progress, total_courses, completed_courses, last_updated
                 ) VALUES (?1, ?2, ?3, ?4, ?5)
                 ON CONFLICT(user_id) DO UPDATE SET
                    overall_progress = excluded.overall_progress,
                    total_courses = excluded.total_courses,
                    completed_courses = excluded.completed_courses,
                    last_updated = excluded.last_updated",
                params![
                    user_id,
                    i64::from(overall.overall_progress),
                    i64::from(overall.total_courses),
                    i64::from(overall.completed_courses),
                    overall.last_updated,
                ],
            )?;
            tx.commit()?;
            Ok(())
        })
        .await
    }

    pub async fn get_cached_course_progress(&self, user_id: &str) -> Result<Vec<CourseProgress>> {
        let user_id = user_id.to_string();
        self.execute(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT course_id, total_videos, completed_videos, progress, quiz_unlocked, last_updated
                 FROM course_progress_cache
                 WHERE user_id = ?1
                 ORDER BY course_id",
            )?;
            let mut rows = stmt.query(params![user_id])?;
            let mut courses = Vec::new();
            while let Some(row) = rows.next()? {
                courses.push(CourseProgress {
                    course_id: row.get(0)?,
                    total_videos: to_u32(row.get(1)?, "total_videos")?,
                    completed_videos: to_u32(row.get(2)?, "completed_videos")?,
                    progress: to_u32(row.get(3)?, "progress")?,
                    quiz_unlocked: row.get::<_, i64>(4)? != 0,
                    last_updated: row.get(5)?,
                });
            }
            Ok(courses)
        })
        .await
    }

    pub async fn get_cached_overall_progress(&self, user_id: &str) -> Result<Option<OverallProgress>> {
        let user_id = user_id.to_string();
        self.execute(move |conn| {
            let row = conn
                .query_row(
                    "SELECT overall_progress, total_courses, completed_courses, last_updated
                     FROM overall_progress_cache WHERE user_id = ?1",
                    params![user_id],
                    |row| {
                        Ok((
                            row.get::<_, i64>(0)?,
                            row.get::<_, i64>(1)?,
                            row.get::<_, i64>(2)?,
                            row.get::<_, i64>(3)?,
                        ))
                    },
                )
                .optional()?;

            match row {
                Some((overall, total, completed, last_updated)) => Ok(Some(OverallProgress {
                    overall_progress: to_u32(overall, "overall_progress")?,
                    total_courses: to_u32(total, "total_courses")?,
                    completed_courses: to_u32(completed, "completed_courses")?,
                    last_updated,
                })),
                None => Ok(None),
            }
        })
        .await
    }
}
