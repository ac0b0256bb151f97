mod course_progress;
mod local_storage;
mod video_progress;
