//! End-to-end tests for failure classification and the retry queue.

mod common;

use common::*;
use hifi_dl::catalog::{CatalogItem, QualityTier};
use hifi_dl::config::DownloadSettings;
use hifi_dl::pipeline::{
    DownloadNotice, DownloadService, JobKind, PipelineError, RetryItem, RetryOutcome, RetryReason,
};
use std::sync::atomic::Ordering;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

fn drain(notices: &mut tokio::sync::broadcast::Receiver<DownloadNotice>) -> Vec<DownloadNotice> {
    let mut out = Vec::new();
    while let Ok(notice) = notices.try_recv() {
        out.push(notice);
    }
    out
}

async fn settle(service: &DownloadService) {
    tokio::time::timeout(Duration::from_secs(10), service.wait_until_settled())
        .await
        .expect("service did not settle");
}

#[tokio::test]
async fn test_auto_retry_recovers_after_outage() {
    let release = album(ALBUM_ID, ALBUM_TITLE);
    let single = track(TRACK_1_ID, 1, "One More Time", 320).with_album(&release);
    // One full pass over the lossless tiers fails.
    let catalog = FakeCatalog::new()
        .with_track(single.clone())
        .with_stream(TRACK_1_ID, QualityTier::HiRes192, payload(TRACK_1_ID, QualityTier::HiRes192))
        .fail_first_resolves(3);
    let harness = TestHarness::new(catalog);
    let service = harness.service(DownloadSettings::default(), Duration::from_millis(10));
    let mut notices = service.subscribe();

    service.submit_track(single);
    let queued = wait_for_notice(&mut notices, |n| matches!(n, DownloadNotice::RetryQueued { .. })).await;
    assert!(matches!(
        queued,
        DownloadNotice::RetryQueued {
            reason: RetryReason::QualityUnavailable,
            auto_retry: true,
            offer_save_anyway: false,
            ..
        }
    ));
    wait_for_notice(&mut notices, |n| matches!(n, DownloadNotice::RetrySucceeded { .. })).await;
    settle(&service).await;

    assert!(service.retry_queue().is_empty());
    assert_eq!(
        harness.saved_files(),
        vec!["Daft Punk/Discovery/01 - One More Time.flac"]
    );
}

#[tokio::test]
async fn test_auto_retry_stops_after_three_attempts() {
    let release = album(ALBUM_ID, ALBUM_TITLE);
    let single = track(TRACK_1_ID, 1, "One More Time", 320).with_album(&release);
    let harness = TestHarness::new(FakeCatalog::new().with_track(single.clone()));
    let service = harness.service(DownloadSettings::default(), Duration::from_millis(10));
    let mut notices = service.subscribe();

    service.submit_track(single);
    settle(&service).await;

    let notices = drain(&mut notices);
    let queued = notices
        .iter()
        .filter(|n| matches!(n, DownloadNotice::RetryQueued { .. }))
        .count();
    assert_eq!(queued, 1);
    assert!(notices.iter().any(|n| matches!(
        n,
        DownloadNotice::Failed {
            attempts: Some((3, 3)),
            ..
        }
    )));
    assert!(!notices
        .iter()
        .any(|n| matches!(n, DownloadNotice::RetrySucceeded { .. })));

    // First run plus three retries, three lossless tiers each.
    assert_eq!(harness.catalog.resolved_tiers(TRACK_1_ID).len(), 12);
    assert!(service.retry_queue().is_empty());
    assert!(harness.saved_files().is_empty());
}

#[tokio::test]
async fn test_cancelling_retry_job_stops_the_download() {
    let release = album(ALBUM_ID, ALBUM_TITLE);
    let single = track(TRACK_1_ID, 1, "One More Time", 320).with_album(&release);
    let catalog = FakeCatalog::new()
        .with_track(single.clone())
        .with_stream(TRACK_1_ID, QualityTier::HiRes192, payload(TRACK_1_ID, QualityTier::HiRes192))
        .fail_first_resolves(3)
        .hold_streams();
    let harness = TestHarness::new(catalog);
    let service = harness.service(DownloadSettings::default(), Duration::from_millis(10));
    let mut notices = service.subscribe();

    service.submit_track(single);
    wait_for_notice(&mut notices, |n| matches!(n, DownloadNotice::RetryQueued { .. })).await;

    // The automatic retry gets past resolving and blocks on the transfer.
    let retry_job = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            if harness.catalog.held.load(Ordering::SeqCst) > 0 {
                let running = service
                    .scheduler()
                    .snapshot()
                    .into_iter()
                    .find(|job| job.kind == JobKind::Retry && job.running);
                if let Some(job) = running {
                    return job;
                }
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("retry job never started");

    assert!(service.cancel_job(&retry_job.id));
    wait_for_notice(&mut notices, |n| matches!(n, DownloadNotice::Cancelled { .. })).await;
    settle(&service).await;

    assert_eq!(service.scheduler().running_count(), 0);
    assert!(service.scheduler().snapshot().is_empty());
    let items = service.retry_queue().items();
    assert_eq!(items.len(), 1);
    assert_eq!(items[0].attempts, 0);
    assert!(harness.saved_files().is_empty());
}

#[tokio::test]
async fn test_unknown_error_waits_for_a_single_manual_retry() {
    let harness = TestHarness::new(FakeCatalog::new());
    let service = harness.service(DownloadSettings::default(), Duration::from_millis(10));

    service.submit_album("missing-album", Some("Missing".to_string()), None);
    settle(&service).await;

    let items = service.retry_queue().items();
    assert_eq!(items.len(), 1);
    let item = &items[0];
    assert_eq!(item.reason, RetryReason::UnknownError);
    assert!(!item.auto_retry);
    assert_eq!(item.max_attempts, 1);
    assert_eq!(item.attempts, 0);
    assert!(matches!(item.item, CatalogItem::Album { ref album_id, .. } if album_id == "missing-album"));

    let outcome = service.retry(&item.id).await;
    assert!(matches!(outcome, RetryOutcome::Exhausted { .. }));
    assert!(service.retry_queue().is_empty());
    assert_eq!(service.retry(&item.id).await, RetryOutcome::NotFound);
}

#[tokio::test]
async fn test_album_track_failure_becomes_track_retry_item() {
    let fetched = fetched_album(
        album(ALBUM_ID, ALBUM_TITLE),
        vec![
            track(TRACK_1_ID, 1, "One More Time", 320),
            track(TRACK_2_ID, 2, "Aerodynamic", 212),
            track(TRACK_3_ID, 3, "Digital Love", 301),
        ],
    );
    let catalog = FakeCatalog::new()
        .with_album(fetched.clone())
        .with_stream(TRACK_1_ID, QualityTier::Cd, payload(TRACK_1_ID, QualityTier::Cd))
        .with_stream(TRACK_3_ID, QualityTier::Cd, payload(TRACK_3_ID, QualityTier::Cd));
    let harness = TestHarness::new(catalog);
    // Long delay: only the initial run happens during the test.
    let service = harness.service(DownloadSettings::default(), Duration::from_secs(60));
    let mut notices = service.subscribe();

    service.submit_album(ALBUM_ID, None, None);
    let saved = wait_for_notice(&mut notices, |n| matches!(n, DownloadNotice::AlbumSaved { .. })).await;
    assert_eq!(
        saved,
        DownloadNotice::AlbumSaved {
            title: ALBUM_TITLE.to_string(),
            saved: 2,
            failed: 1,
        }
    );

    let items = service.retry_queue().items();
    assert_eq!(items.len(), 1);
    let item = &items[0];
    assert_eq!(item.reason, RetryReason::QualityUnavailable);
    assert!(item.auto_retry);
    assert!(matches!(item.item, CatalogItem::Track(ref t) if t.id == TRACK_2_ID));
    assert_eq!(
        item.album.as_ref().map(|a| a.album.id.as_str()),
        Some(ALBUM_ID)
    );

    assert_eq!(
        harness.saved_files(),
        vec![
            "Daft Punk/Discovery/01 - One More Time.flac",
            "Daft Punk/Discovery/03 - Digital Love.flac",
        ]
    );

    service.shutdown();
    settle(&service).await;
}

#[tokio::test]
async fn test_album_rerun_reports_every_failed_track() {
    let fetched = fetched_album(
        album(ALBUM_ID, ALBUM_TITLE),
        vec![
            track(TRACK_1_ID, 1, "One More Time", 320),
            track(TRACK_2_ID, 2, "Aerodynamic", 212),
            track(TRACK_3_ID, 3, "Digital Love", 301),
        ],
    );
    let catalog = FakeCatalog::new()
        .with_album(fetched.clone())
        .with_stream(TRACK_1_ID, QualityTier::Cd, payload(TRACK_1_ID, QualityTier::Cd));
    let harness = TestHarness::new(catalog);
    let item = RetryItem {
        id: "retry-1".to_string(),
        item: CatalogItem::Album {
            album_id: ALBUM_ID.to_string(),
            title: Some(ALBUM_TITLE.to_string()),
        },
        settings: DownloadSettings::default(),
        album: Some(fetched),
        reason: RetryReason::ProcessingError,
        attempts: 1,
        max_attempts: 3,
        last_error: "archive write failed".to_string(),
        created_at: chrono::Utc::now(),
        auto_retry: true,
        degraded: None,
    };

    let err = harness
        .orchestrator
        .rerun(&item, &CancellationToken::new())
        .await
        .expect_err("two tracks have no stream");
    let PipelineError::AlbumIncomplete { failures } = &err else {
        panic!("unexpected error: {err}");
    };
    let titles: Vec<&str> = failures.iter().map(|(title, _)| title.as_str()).collect();
    assert_eq!(titles, vec!["Aerodynamic", "Digital Love"]);
    assert_eq!(err.retry_reason(), Some(RetryReason::QualityUnavailable));
}

#[tokio::test]
async fn test_retry_all_runs_manual_items_in_order() {
    let harness = TestHarness::new(FakeCatalog::new());
    let service = harness.service(DownloadSettings::default(), Duration::from_millis(10));

    service.submit_album("gone-1", None, None);
    service.submit_album("gone-2", None, None);
    settle(&service).await;
    let ids: Vec<String> = service
        .retry_queue()
        .items()
        .into_iter()
        .map(|i| i.id)
        .collect();
    assert_eq!(ids.len(), 2);

    let outcomes = service.retry_all().await;
    assert_eq!(
        outcomes.iter().map(|(id, _)| id.clone()).collect::<Vec<_>>(),
        ids
    );
    assert!(outcomes
        .iter()
        .all(|(_, o)| matches!(o, RetryOutcome::Exhausted { .. })));
    assert!(service.retry_queue().is_empty());
}
