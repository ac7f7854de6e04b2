//! Move and replay jobs, including resumption after an interrupted run.

mod common;

use std::sync::Arc;
use std::time::Duration;

use chrono::Duration as ChronoDuration;
use common::{feed, harness, harness_with, wait_for_job};
use databus_core::jobs::run_move_batch;
use databus_core::{
    BusError, BusSettings, Clock, Databus, JobService, JobSettings, PollOptions, SqliteJobService,
    SubscribeParams,
};
use databus_types::{datetime_from_ms, JobSpec, JobStatus};

fn small_batches() -> BusSettings {
    BusSettings {
        jobs: JobSettings {
            move_batch_size: 30,
            replay_batch_size: 30,
            ..JobSettings::default()
        },
        ..BusSettings::default()
    }
}

fn job_rows(bus: &Databus) -> i64 {
    let conn = bus.pool().get().expect("connection");
    conn.query_row("SELECT COUNT(*) FROM bus_jobs", [], |row| row.get(0))
        .expect("count jobs")
}

#[tokio::test]
async fn move_relocates_every_event() {
    let h = harness_with(small_batches());
    h.bus.subscribe(SubscribeParams::new("from", "")).await.unwrap();
    h.bus.subscribe(SubscribeParams::new("to", r#"table("other")"#)).await.unwrap();
    for i in 0..100 {
        feed(&h.bus, "review", &format!("r{i}"), &[]).await;
    }
    // One event is mid-flight when the move starts.
    let claimed = h
        .bus
        .poll(
            "from",
            PollOptions {
                limit: 1,
                ignore_long_poll: true,
                claim_ttl_secs: 600,
                ..PollOptions::default()
            },
        )
        .await
        .unwrap();
    assert_eq!(claimed.len(), 1);

    let id = h.bus.move_async("from", "to").await.unwrap();
    let bus = h.bus.clone();
    let status = wait_for_job(|| {
        let bus = bus.clone();
        let id = id.clone();
        async move { bus.get_move_status(&id).await.unwrap().status }
    })
    .await;
    assert_eq!(status, JobStatus::Complete);

    let report = h.bus.get_move_status(&id).await.unwrap();
    assert_eq!(report.processed, 100);
    assert_eq!(report.from, "from");
    assert_eq!(report.to, "to");
    assert!(report.completed_at.is_some());

    assert_eq!(h.bus.event_count("from").await.unwrap(), 0);
    assert_eq!(h.bus.event_count("to").await.unwrap(), 100);
    assert_eq!(h.bus.claim_count("to").await.unwrap(), 1);
    assert!(h.bus.get_subscription("from").await.is_ok());

    // The moved claim can still be acknowledged by its holder.
    let acked = h
        .bus
        .acknowledge("to", Some(vec![claimed[0].event_key.clone()]))
        .await
        .unwrap();
    assert_eq!(acked, 1);
}

#[tokio::test]
async fn move_validates_arguments() {
    let h = harness();
    assert!(matches!(
        h.bus.move_async("", "to").await,
        Err(BusError::MissingParameter("from"))
    ));
    assert!(matches!(
        h.bus.move_async("from", "").await,
        Err(BusError::MissingParameter("to"))
    ));
    assert!(matches!(
        h.bus.move_async("same", "same").await,
        Err(BusError::InvalidParameter(_))
    ));
    assert_eq!(job_rows(&h.bus), 0);

    assert!(matches!(
        h.bus.get_move_status("no-such-job").await,
        Err(BusError::UnknownJob(_))
    ));
}

#[tokio::test]
async fn interrupted_move_resumes_without_loss_or_duplication() {
    let h = harness_with(small_batches());
    h.bus.subscribe(SubscribeParams::new("from", "")).await.unwrap();
    h.bus.subscribe(SubscribeParams::new("to", "")).await.unwrap();
    for i in 0..100 {
        h.bus.inject_event("from", "review", &format!("r{i}")).await.unwrap();
    }

    // A previous process accepted the job and committed one batch before
    // dying.
    let jobs = SqliteJobService::new(h.pool.clone(), Arc::clone(&h.clock) as Arc<dyn Clock>);
    let record = jobs
        .submit(JobSpec::Move {
            from: "from".to_string(),
            to: "to".to_string(),
        })
        .unwrap();
    jobs.mark_running(&record.id).unwrap();
    {
        let conn = h.pool.get().unwrap();
        let progress =
            run_move_batch(&conn, &record.id, "from", "to", 30, h.clock.now_ms()).unwrap();
        assert_eq!(progress.processed, 30);
        assert!(!progress.done);
    }

    // A fresh process over the same database picks the job back up.
    let restarted = Databus::new(
        h.pool.clone(),
        Arc::clone(&h.clock) as Arc<dyn Clock>,
        small_batches(),
    );
    assert_eq!(restarted.resume_jobs().await.unwrap(), 1);

    let status = wait_for_job(|| {
        let bus = restarted.clone();
        let id = record.id.clone();
        async move { bus.get_move_status(&id).await.unwrap().status }
    })
    .await;
    assert_eq!(status, JobStatus::Complete);

    let report = restarted.get_move_status(&record.id).await.unwrap();
    assert_eq!(report.processed, 100);
    assert_eq!(restarted.event_count("from").await.unwrap(), 0);
    assert_eq!(restarted.event_count("to").await.unwrap(), 100);

    // Nothing left to resume.
    assert_eq!(restarted.resume_jobs().await.unwrap(), 0);
}

#[tokio::test]
async fn replay_outside_window_creates_no_job() {
    let h = harness();
    h.bus.subscribe(SubscribeParams::new("s1", "")).await.unwrap();

    let too_old = datetime_from_ms(h.clock.now_ms()) - ChronoDuration::hours(51);
    assert!(matches!(
        h.bus.replay_async_since("s1", Some(too_old)).await,
        Err(BusError::ReplayWindowExceeded { window_secs, .. }) if window_secs == 50 * 3600
    ));
    assert!(matches!(
        h.bus.replay_async_since("missing", None).await,
        Err(BusError::UnknownSubscription(_))
    ));
    assert_eq!(job_rows(&h.bus), 0);
}

#[tokio::test]
async fn replay_uses_the_current_filter() {
    let h = harness_with(small_batches());
    h.bus
        .subscribe(SubscribeParams::new("s1", r#"table("answer")"#))
        .await
        .unwrap();
    feed(&h.bus, "review", "r1", &[]).await;
    feed(&h.bus, "answer", "a1", &[]).await;
    feed(&h.bus, "review", "r2", &["re-etl"]).await;
    h.clock.advance_secs(60);

    // Switch the subscription to reviews and start from an empty buffer.
    h.bus
        .subscribe(SubscribeParams::new("s1", r#"table("review")"#))
        .await
        .unwrap();
    h.bus.purge("s1").await.unwrap();

    let since = datetime_from_ms(h.clock.now_ms()) - ChronoDuration::hours(1);
    let id = h.bus.replay_async_since("s1", Some(since)).await.unwrap();
    let status = wait_for_job(|| {
        let bus = h.bus.clone();
        let id = id.clone();
        async move { bus.get_replay_status(&id).await.unwrap().status }
    })
    .await;
    assert_eq!(status, JobStatus::Complete);

    let report = h.bus.get_replay_status(&id).await.unwrap();
    assert_eq!(report.subscription, "s1");
    assert_eq!(report.since, Some(since));
    assert_eq!(report.processed, 1);

    let events = h.bus.peek("s1", 10).await.unwrap();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].table, "review");
    assert_eq!(events[0].key, "r1");

    // A replay id is not a move id.
    assert!(matches!(
        h.bus.get_move_status(&id).await,
        Err(BusError::UnknownJob(_))
    ));
}

#[tokio::test]
async fn sweep_prunes_finished_jobs_after_retention() {
    let h = harness_with(BusSettings {
        job_retention: Duration::from_secs(3600),
        ..BusSettings::default()
    });
    h.bus.subscribe(SubscribeParams::new("s1", "")).await.unwrap();
    let id = h.bus.replay_async_since("s1", None).await.unwrap();
    let status = wait_for_job(|| {
        let bus = h.bus.clone();
        let id = id.clone();
        async move { bus.get_replay_status(&id).await.unwrap().status }
    })
    .await;
    assert_eq!(status, JobStatus::Complete);

    assert_eq!(h.bus.sweep().await.unwrap().jobs, 0);
    h.clock.advance_secs(3601);
    assert_eq!(h.bus.sweep().await.unwrap().jobs, 1);
    assert!(matches!(
        h.bus.get_replay_status(&id).await,
        Err(BusError::UnknownJob(_))
    ));
}
