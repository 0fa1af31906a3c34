//! Restart safety: stranded running tasks fail, queued tasks survive.

mod common;

use std::time::Duration;

use common::fake_upstream::{FakeUpstream, Route};
use common::{seed_nhentai_auth, wait_for_status};
use pica_core::policy::Policy;
use pica_core::scheduler::Scheduler;
use pica_core::sources::SourceKind;
use pica_core::store::{Library, TaskParams, TaskStatus};

const WAIT: Duration = Duration::from_secs(20);

fn serve_one_page_gallery(server: &FakeUpstream, gallery: &str) {
    server.route(
        &format!("/api/gallery/{gallery}"),
        Route::json(serde_json::json!({
            "media_id": gallery,
            "title": {"pretty": format!("g{gallery}")},
            "images": {"cover": {"t": "j"}, "pages": [{"t": "j"}]},
            "tags": []
        })),
    );
    server.route(
        &format!("/galleries/{gallery}/cover.jpg"),
        Route::bytes("image/jpeg", b"cover".to_vec()),
    );
    server.route(
        &format!("/galleries/{gallery}/1.jpg"),
        Route::bytes("image/jpeg", b"page".to_vec()),
    );
}

#[tokio::test]
async fn boot_recovery_fails_running_and_replays_queue() {
    let server = FakeUpstream::start();
    serve_one_page_gallery(&server, "101");
    serve_one_page_gallery(&server, "102");

    let tmp = tempfile::tempdir().unwrap();
    let db_path = tmp.path().join("library.db");

    // Simulate the previous process dying mid-run: one task stranded in
    // `running`, two still queued.
    let stranded;
    let queued_a;
    let queued_b;
    {
        let db = Library::open_at(&db_path).await.unwrap();
        stranded = db
            .insert_task(SourceKind::Nhentai, "100", &TaskParams::default())
            .await
            .unwrap();
        db.set_task_status(&stranded, TaskStatus::Running)
            .await
            .unwrap();
        queued_a = db
            .insert_task(SourceKind::Nhentai, "101", &TaskParams::default())
            .await
            .unwrap();
        queued_b = db
            .insert_task(SourceKind::Nhentai, "102", &TaskParams::default())
            .await
            .unwrap();
    }

    // "Restart": fresh handle over the same database, recovery before work.
    let db = Library::open_at(&db_path).await.unwrap();
    let scheduler = Scheduler::new(db, tmp.path().to_path_buf(), Policy::default());
    seed_nhentai_auth(&scheduler, server.url()).await;
    scheduler.recover_and_start().await.unwrap();

    let task = wait_for_status(&scheduler, &stranded, TaskStatus::Failed, WAIT).await;
    assert_eq!(task.message.as_deref(), Some("server restarted"));

    // No queued task is lost: both run to completion on the new process.
    wait_for_status(&scheduler, &queued_a, TaskStatus::Succeeded, WAIT).await;
    wait_for_status(&scheduler, &queued_b, TaskStatus::Succeeded, WAIT).await;
    assert!(scheduler.db().comic_exists("nhentai101").await.unwrap());
    assert!(scheduler.db().comic_exists("nhentai102").await.unwrap());
}
