//! State written through one handle is visible after reopening the file.

use chrono::{TimeZone, Utc};
use rawflow_db::{CheckpointState, NewRawRecord, RawflowDb, MIGRATIONS};
use tempfile::TempDir;

#[tokio::test]
async fn checkpoint_and_raw_rows_survive_reopen() {
    let tmp = TempDir::new().unwrap();
    let path = tmp.path().join("rawflow.sqlite3");

    let start = Utc.with_ymd_and_hms(2024, 3, 10, 0, 0, 0).unwrap();
    let state = CheckpointState {
        params_key: "abc".to_string(),
        plugin_name: "tapd".to_string(),
        connection_id: "7".to_string(),
        table: "tapd_api_worklogs".to_string(),
        params: "{}".to_string(),
        latest_success_start: start,
        latest_success_end: start,
        time_after: None,
        created_at: start,
        updated_at: start,
    };

    {
        let db = RawflowDb::open(&path).await.unwrap();
        db.apply_pending_migrations().await.unwrap();
        db.ensure_raw_table("tapd_api_worklogs").await.unwrap();
        db.raw_insert_batch(
            "tapd_api_worklogs",
            "abc",
            "{}",
            &[NewRawRecord {
                data: br#"{"id":1}"#.to_vec(),
                url: "timesheets".to_string(),
                input: None,
            }],
        )
        .await
        .unwrap();
        db.checkpoint_commit(&state).await.unwrap();
        db.close().await;
    }

    let db = RawflowDb::open(&path).await.unwrap();
    assert!(db.has_migration_history().await.unwrap());
    assert!(db.pending_migrations().await.unwrap().is_empty());
    assert_eq!(db.applied_migrations().await.unwrap().len(), MIGRATIONS.len());
    assert_eq!(db.checkpoint_load("abc").await.unwrap(), Some(state));
    assert_eq!(
        db.raw_list_live("tapd_api_worklogs", "abc").await.unwrap().len(),
        1
    );
}
