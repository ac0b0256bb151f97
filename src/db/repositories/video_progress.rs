use anyhow::Result;
use rusqlite::{params, Row};

use crate::db::{
    connection::Database,
    helpers::{to_i64, to_u32, to_u64},
    models::{StoredVideoProgress, VideoKey, VideoProgress, ViolationCounts},
};

const VIDEO_COLUMNS: &str = "user_id, course_id, video_id, last_position, total_duration,
     valid_watch_time, completed, tab_switches, face_missing_events, auto_pauses,
     skip_count, last_sync_time, updated_at, dirty, revision";

fn row_to_video(row: &Row) -> Result<StoredVideoProgress> {
    let record = VideoProgress {
        course_id: row.get("course_id")?,
        video_id: row.get("video_id")?,
        last_position: row.get("last_position")?,
        total_duration: row.get("total_duration")?,
        valid_watch_time: row.get("valid_watch_time")?,
        completed: row.get::<_, i64>("completed")? != 0,
        violations: ViolationCounts {
            tab_switches: to_u32(row.get("tab_switches")?, "tab_switches")?,
            face_missing_events: to_u32(row.get("face_missing_events")?, "face_missing_events")?,
            auto_pauses: to_u32(row.get("auto_pauses")?, "auto_pauses")?,
            skip_count: to_u32(row.get("skip_count")?, "skip_count")?,
        },
        last_sync_time: row.get("last_sync_time")?,
        updated_at: row.get("updated_at")?,
    };

    Ok(StoredVideoProgress {
        user_id: row.get("user_id")?,
        record,
        dirty: row.get::<_, i64>("dirty")? != 0,
        revision: to_u64(row.get("revision")?, "revision")?,
    })
}

impl Database {
    /// Writes the full record; never a partial column update.
    pub async fn upsert_video_progress(
        &self,
        user_id: &str,
        record: &VideoProgress,
        dirty: bool,
        revision: u64,
    ) -> Result<()> {
        let user_id = user_id.to_string();
        let record = record.clone();
        self.execute(move |conn| {
            conn.execute(
                "INSERT INTO video_progress (
                    user_id, course_id, video_id, last_position, total_duration,
                    valid_watch_time, completed, tab_switches, face_missing_events,
                    auto_pauses, skip_count, last_sync_time, updated_at, dirty, revision
                 ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15)
                 ON CONFLICT(user_id, course_id, video_id) DO UPDATE SET
                    last_position = excluded.last_position,
                    total_duration = excluded.total_duration,
                    valid_watch_time = excluded.valid_watch_time,
                    completed = excluded.completed,
                    tab_switches = excluded.tab_switches,
                    face_missing_events = excluded.face_missing_events,
                    auto_pauses = excluded.auto_pauses,
                    skip_count = excluded.skip_count,
                    last_sync_time = excluded.last_sync_time,
                    updated_at = excluded.updated_at,
                    dirty = excluded.dirty,
                    revision = excluded.revision",
                params![
                    user_id,
                    record.course_id,
                    record.video_id,
                    record.last_position,
                    record.total_duration,
                    record.valid_watch_time,
                    record.completed as i64,
                    i64::from(record.violations.tab_switches),
                    i64::from(record.violations.face_missing_events),
                    i64::from(record.violations.auto_pauses),
                    i64::from(record.violations.skip_count),
                    record.last_sync_time,
                    record.updated_at,
                    dirty as i64,
                    to_i64(revision)?,
                ],
            )?;
            Ok(())
        })
        .await
    }

    pub async fn load_all_video_progress(&self) -> Result<Vec<StoredVideoProgress>> {
        self.execute(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {VIDEO_COLUMNS} FROM video_progress ORDER BY user_id, course_id, video_id"
            ))?;

            let mut rows = stmt.query([])?;
            let mut records = Vec::new();
            while let Some(row) = rows.next()? {
                records.push(row_to_video(row)?);
            }
            Ok(records)
        })
        .await
    }

    pub async fn get_video_progress_row(&self, key: &VideoKey) -> Result<Option<StoredVideoProgress>> {
        let key = key.clone();
        self.execute(move |conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {VIDEO_COLUMNS} FROM video_progress
                 WHERE user_id = ?1 AND course_id = ?2 AND video_id = ?3"
            ))?;

            let mut rows = stmt.query(params![key.user_id, key.course_id, key.video_id])?;
            match rows.next()? {
                Some(row) => Ok(Some(row_to_video(row)?)),
                None => Ok(None),
            }
        })
        .await
    }

    /// Removes every progress row and cached aggregate for a user.
    pub async fn delete_user_progress(&self, user_id: &str) -> Result<usize> {
        let user_id = user_id.to_string();
        self.execute(move |conn| {
            let tx = conn.transaction()?;
            let removed = tx.execute(
                "DELETE FROM video_progress WHERE user_id = ?1",
                params![user_id],
            )?;
            tx.execute(
                "DELETE FROM course_catalog WHERE user_id = ?1",
                params![user_id],
            )?;
            tx.execute(
                "DELETE FROM course_progress_cache WHERE user_id = ?1",
                params![user_id],
            )?;
            tx.execute(
                "DELETE FROM overall_progress_cache WHERE user_id = ?1",
                params![user_id],
            )?;
            tx.commit()?;
            Ok(removed)
        })
        .await
    }
}
