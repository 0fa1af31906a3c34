pub mod fake_upstream;

use std::time::{Duration, Instant};

use pica_core::policy::Policy;
use pica_core::scheduler::Scheduler;
use pica_core::sources::SourceKind;
use pica_core::store::{Library, TaskRecord, TaskStatus};

/// Scheduler over a fresh temp storage dir and on-disk database, the way
/// the server wires it at boot.
pub async fn fresh_scheduler(policy: Policy) -> (Scheduler, tempfile::TempDir) {
    let tmp = tempfile::tempdir().expect("tempdir");
    let db = Library::open_at(tmp.path().join("library.db"))
        .await
        .expect("open library");
    let scheduler = Scheduler::new(db, tmp.path().to_path_buf(), policy);
    (scheduler, tmp)
}

/// Point the nhentai adapter at a fake upstream.
pub async fn seed_nhentai_auth(scheduler: &Scheduler, base: &str) {
    scheduler
        .db()
        .put_auth(
            SourceKind::Nhentai,
            &serde_json::json!({
                "apiBaseUrl": base,
                "coverBaseUrl": base,
                "imageBaseUrl": base,
            }),
        )
        .await
        .expect("seed auth");
}

/// Poll the task row until it reaches `status` or the timeout trips.
pub async fn wait_for_status(
    scheduler: &Scheduler,
    id: &str,
    status: TaskStatus,
    timeout: Duration,
) -> TaskRecord {
    let deadline = Instant::now() + timeout;
    loop {
        let task = scheduler
            .db()
            .get_task(id)
            .await
            .expect("get task")
            .expect("task row exists");
        if task.status == status {
            return task;
        }
        assert!(
            Instant::now() < deadline,
            "task {id} stuck in {} waiting for {}",
            task.status.as_str(),
            status.as_str()
        );
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
}

/// Default gallery fixture: 2 pages (jpg, png) plus a cover.
pub fn nhentai_gallery_json() -> serde_json::Value {
    serde_json::json!({
        "media_id": "1",
        "title": {"pretty": "Metamorphosis"},
        "images": {
            "cover": {"t": "j"},
            "pages": [{"t": "j"}, {"t": "p"}]
        },
        "tags": [{"type": "artist", "name": "shindol"}]
    })
}
