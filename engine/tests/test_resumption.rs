mod harness;

use anyhow::Result;
use common::{JobId, RecordStatus};
use engine::{EngineError, StartOutcome, capture_witness};
use harness::*;
use store::{EmployeeEntry, Fetch, ProcessedRecordEntry};

/// Rebuilds the exact durable state a worker crash leaves behind: witness
/// and totals recorded, rows `1..=crashed_at` committed (employees, ledger,
/// counters, checkpoint), job still in `processing`.
async fn stage_crashed_job(h: &Harness, rows: usize, crashed_at: usize) -> JobId {
    let job = stage_unwitnessed_job(h, rows, crashed_at).await;
    let witness = capture_witness(&h.absolute_path("staff.csv")).unwrap();
    h.db
        .set_file_witness(&job, witness.size as i64, &witness.hash, &witness.modified)
        .await
        .unwrap();
    job
}

/// Same staging, but without the integrity witness: a job from before
/// witnesses were recorded.
async fn stage_unwitnessed_job(h: &Harness, rows: usize, crashed_at: usize) -> JobId {
    let content = sequential_csv(rows);
    let job = h.make_job("staff.csv", &content).await;
    h.db.set_total_rows(&job, rows as i64).await.unwrap();
    h.db.mark_job_processing(&job).await.unwrap();

    let mut txn = h.db.begin_chunk().await.unwrap();
    for i in 1..=crashed_at {
        let number = format!("EMP-{i:03}");
        let email = format!("emp{i}@example.com");
        let mut entry = EmployeeEntry::new(&number, &format!("First{i}"), &format!("Last{i}"), &email);
        entry.department = Some("Engineering".into());
        entry.salary = Some((50_000 + i) as f64);
        entry.currency = Some("KES".into());
        entry.country_code = Some("KE".into());
        entry.start_date = Some("2022-01-01".into());
        txn.insert_employee(&entry).await.unwrap();
        txn.upsert_ledger(&ProcessedRecordEntry::new(
            &job,
            Some(number.as_str()),
            Some(email.as_str()),
            i as u64,
            RecordStatus::Processed,
        ))
        .await
        .unwrap();
        txn.mark_row_processed(&job, true, i as u64).await.unwrap();
    }
    txn.commit().await.unwrap();
    job
}

/// Scenario: crash after row 20 of 50, restart, finish cleanly.
#[tokio::test]
async fn test_resume_after_crash_continues_at_checkpoint() -> Result<()> {
    let h = setup().await;
    let job = stage_crashed_job(&h, 50, 20).await;

    let before = h.db.fetch_by(&job).await?;
    assert_eq!(before.last_processed_row, 20);
    assert_eq!(before.status, "processing");

    let outcome = h.service.start_or_resume(&job).await?;
    assert_eq!(outcome, StartOutcome::Completed);

    let entry = h.db.fetch_by(&job).await?;
    assert_eq!(entry.status, "completed");
    assert_eq!(entry.processed_rows, 50);
    assert_eq!(entry.successful_rows, 50);
    assert_eq!(entry.error_rows, 0);
    assert_eq!(entry.last_processed_row, 50);

    // No double inserts, no duplicate ledger rows.
    assert_eq!(h.db.count_employees().await?, 50);
    assert_eq!(h.db.count_ledger_rows(&job).await?, 50);
    let report = h.service.validate_ledger(&job).await?;
    assert!(report.is_consistent());

    // Row 21 (the first resumed row) landed with its own data.
    let resumed = h.db.find_employee_by_number("EMP-021").await?.unwrap();
    assert_eq!(resumed.salary, Some(50_021.0));

    let logs = h.db.fetch_resumption_logs(&job).await?;
    let events: Vec<&str> = logs.iter().map(|l| l.event_type.as_str()).collect();
    assert!(events.contains(&"resumption_attempt"));
    assert!(events.contains(&"resumption_success"));
    assert!(
        logs.iter()
            .any(|l| l.event_type == "integrity_check" && l.passed())
    );
    Ok(())
}

/// Boundary: crash one row short of the end; exactly one row remains.
#[tokio::test]
async fn test_resume_at_final_row_boundary() -> Result<()> {
    let h = setup().await;
    let job = stage_crashed_job(&h, 50, 49).await;

    h.service.start_or_resume(&job).await?;

    let entry = h.db.fetch_by(&job).await?;
    assert_eq!(entry.status, "completed");
    assert_eq!(entry.processed_rows, 50);
    assert!(h.db.find_employee_by_number("EMP-050").await?.is_some());
    Ok(())
}

/// Scenario: the file changes on disk between runs. Resumption is refused,
/// the job does not move, and the audit log says why.
#[tokio::test]
async fn test_integrity_mismatch_refuses_resumption() -> Result<()> {
    let h = setup().await;
    let job = stage_crashed_job(&h, 50, 20).await;

    // One byte changed, same length.
    let tampered = sequential_csv(50).replace("First21", "Xirst21");
    h.write_file("staff.csv", &tampered);

    let err = h.service.start_or_resume(&job).await.unwrap_err();
    assert!(matches!(err, EngineError::IntegrityRefused(_)));

    let entry = h.db.fetch_by(&job).await?;
    assert_eq!(entry.status, "processing", "refusal must not move the job");
    assert_eq!(entry.processed_rows, 20, "counters must not advance");
    assert_eq!(h.db.count_employees().await?, 20);

    let logs = h.db.fetch_resumption_logs(&job).await?;
    let failed_check = logs
        .iter()
        .find(|l| l.event_type == "integrity_check" && !l.passed())
        .expect("a failed integrity check is logged");
    assert!(
        failed_check
            .details
            .as_deref()
            .unwrap()
            .contains("file hash changed")
    );
    assert!(
        logs.iter()
            .any(|l| l.event_type == "resumption_failure" && !l.passed())
    );
    Ok(())
}

/// A deleted input is refused the same way.
#[tokio::test]
async fn test_missing_file_refuses_resumption() -> Result<()> {
    let h = setup().await;
    let job = stage_crashed_job(&h, 10, 5).await;
    std::fs::remove_file(h.absolute_path("staff.csv"))?;

    let err = h.service.start_or_resume(&job).await.unwrap_err();
    assert!(matches!(err, EngineError::IntegrityRefused(_)));

    let entry = h.db.fetch_by(&job).await?;
    assert_eq!(entry.status, "processing");
    assert_eq!(entry.processed_rows, 5);
    Ok(())
}

/// An mtime that drifted without a content change is a warning, never a
/// refusal.
#[tokio::test]
async fn test_mtime_drift_alone_does_not_refuse() -> Result<()> {
    let h = setup().await;
    let job = stage_crashed_job(&h, 10, 5).await;

    // Rewrite identical bytes; only the mtime moves.
    h.write_file("staff.csv", &sequential_csv(10));

    let outcome = h.service.start_or_resume(&job).await?;
    assert_eq!(outcome, StartOutcome::Completed);

    let entry = h.db.fetch_by(&job).await?;
    assert_eq!(entry.processed_rows, 10);
    Ok(())
}

/// Legacy jobs with no recorded witness: compute, trust, and log it.
#[tokio::test]
async fn test_legacy_job_computes_witness_on_resume() -> Result<()> {
    let h = setup().await;
    let job = stage_unwitnessed_job(&h, 10, 4).await;

    let outcome = h.service.start_or_resume(&job).await?;
    assert_eq!(outcome, StartOutcome::Completed);

    let entry = h.db.fetch_by(&job).await?;
    assert!(entry.has_witness(), "witness recorded during the resume");
    assert_eq!(entry.processed_rows, 10);

    let logs = h.db.fetch_resumption_logs(&job).await?;
    assert!(logs.iter().any(|l| {
        l.event_type == "integrity_check"
            && l.passed()
            && l.details.as_deref().unwrap_or_default().contains("legacy calculated")
    }));
    Ok(())
}

/// Restore-from-backup rewinds counters to the pre-resume snapshot and
/// re-queues the job; a rerun converges on the same employees.
#[tokio::test]
async fn test_restore_from_backup_rewinds_and_requeues() -> Result<()> {
    let h = setup().await;
    let job = stage_crashed_job(&h, 30, 10).await;

    // Resume to completion; the resume snapshots counters (10) first.
    h.service.start_or_resume(&job).await?;
    assert_eq!(h.db.fetch_by(&job).await?.processed_rows, 30);

    // completed clears resumption metadata, so restore must refuse...
    let err = h.service.restore_from_backup(&job).await.unwrap_err();
    assert!(matches!(err, EngineError::NoBackup(_)));
    Ok(())
}

/// Restore while the job is wedged mid-flight: counters rewind to the
/// snapshot, the job re-queues, and the rerun converges. Reprocessed rows
/// are caught by the ledger and skipped, so no employee is written twice.
#[tokio::test]
async fn test_restore_then_rerun_converges() -> Result<()> {
    let h = setup().await;
    // Crashed at row 20; the resume that got it there started from row 10
    // and snapshotted those counters first.
    let job = stage_crashed_job(&h, 30, 20).await;
    let metadata = engine::ResumptionMetadata {
        backup: Some(engine::CounterBackup {
            processed_rows: 10,
            successful_rows: 10,
            error_rows: 0,
            last_processed_row: 10,
            created_at: store::now_rfc3339(),
        }),
        integrity_note: None,
    };
    h.db
        .set_resumption_metadata(&job, Some(&metadata.to_json()))
        .await?;

    h.service.restore_from_backup(&job).await?;
    let restored = h.db.fetch_by(&job).await?;
    assert_eq!(restored.status, "pending");
    assert_eq!(restored.processed_rows, 10);
    assert_eq!(restored.last_processed_row, 10);

    h.service.start_or_resume(&job).await?;
    let entry = h.db.fetch_by(&job).await?;
    assert_eq!(entry.status, "completed");
    assert_eq!(entry.processed_rows, 30);
    // Rows 11..=20 were already in the ledger, so the rerun skips them as
    // duplicates; rows 21..=30 are fresh successes.
    assert_eq!(entry.successful_rows, 20);
    assert_eq!(entry.error_rows, 10);

    assert_eq!(h.db.count_employees().await?, 30);
    let report = h.service.validate_ledger(&job).await?;
    assert!(report.is_consistent(), "{report:?}");
    Ok(())
}
