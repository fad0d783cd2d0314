use crate::db::*;
use crate::types::{BatchId, Status};
use tempfile::NamedTempFile;

mod migrations;

fn batch_record(id: &str, status: Status) -> BatchRecord {
    BatchRecord {
        id: id.to_string(),
        title: format!("Batch {id}"),
        status: status.as_str().to_string(),
        downloaded_bytes: 0,
        total_bytes: 400,
        error_kind: None,
        error_message: None,
        notification_seen: false,
        created_at: 0,
        updated_at: 0,
    }
}

fn file_record(batch_id: &str, file_id: &str, position: i64) -> FileRecord {
    FileRecord {
        batch_id: batch_id.to_string(),
        file_id: file_id.to_string(),
        url: format!("https://example.com/{file_id}"),
        path: format!("/downloads/{batch_id}/{file_id}"),
        current_bytes: 0,
        total_bytes: 100 * (position + 1),
        status: "queued".to_string(),
        position,
    }
}

async fn open_db() -> (Database, NamedTempFile) {
    let temp_file = NamedTempFile::new().unwrap();
    let db = Database::new(temp_file.path()).await.unwrap();
    (db, temp_file)
}
