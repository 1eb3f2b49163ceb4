// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! PostgreSQL store tests. Require `TEST_DATABASE_URL`.

mod common;

use std::sync::Arc;

use common::*;

use accessdoc_core::lifecycle::{DocumentStatus, JobStatus, PipelineStep};
use accessdoc_core::persistence::{
    BackendKind, DocumentRepository, DocumentStatusUpdate, JobAggregate, JobGroupBy,
    JobRepository, JobStatusUpdate, ListQuery, NewDocument, NewJob, PersistenceManager,
    QuotaRepository, SqliteStore, StoreHealth, UsageIncrement,
};
use accessdoc_core::quota::{QuotaWindow, ResourceType};

#[tokio::test]
async fn test_document_status_is_guarded() {
    skip_if_no_db!();
    let Some(store) = postgres_store().await else {
        eprintln!("Skipping test: failed to connect to TEST_DATABASE_URL");
        return;
    };
    let org = unique_org();
    let owner = format!("owner-{}", org);

    let doc = store
        .create_document(NewDocument::new(&owner, &org, "a.pdf").created_at(fixed_now()))
        .await
        .unwrap();

    // pending -> completed is not a legal transition.
    let skip = DocumentStatusUpdate::at(DocumentStatus::Completed, fixed_now());
    assert!(!store.update_document_status(&doc.id, &skip).await.unwrap());

    let processing = DocumentStatusUpdate::at(DocumentStatus::Processing, fixed_now());
    assert!(store.update_document_status(&doc.id, &processing).await.unwrap());
    assert!(!store.update_document_status(&doc.id, &processing).await.unwrap());

    let failed = DocumentStatusUpdate::at(DocumentStatus::Failed, fixed_now())
        .with_error("structure detection crashed");
    assert!(store.update_document_status(&doc.id, &failed).await.unwrap());

    let fetched = store.get_document(&doc.id).await.unwrap().unwrap();
    assert_eq!(fetched.status, DocumentStatus::Failed);
    assert_eq!(fetched.error.as_deref(), Some("structure detection crashed"));
    assert_eq!(fetched.completed_at, Some(fixed_now()));

    let page = store
        .list_documents_by_owner(&owner, &ListQuery::default().with_status(DocumentStatus::Failed))
        .await
        .unwrap();
    assert_eq!(page.total, 1);
    assert_eq!(page.items[0].id, doc.id);
}

#[tokio::test]
async fn test_only_one_worker_claims_a_job() {
    skip_if_no_db!();
    let Some(store) = postgres_store().await else {
        eprintln!("Skipping test: failed to connect to TEST_DATABASE_URL");
        return;
    };
    let store = Arc::new(store);
    let org = unique_org();

    let doc = store
        .create_document(NewDocument::new("user-1", &org, "a.pdf"))
        .await
        .unwrap();
    let job = store
        .create_job(NewJob::for_document(&doc, PipelineStep::Ocr))
        .await
        .unwrap();

    let mut handles = Vec::new();
    for worker in 0..8 {
        let store = store.clone();
        let id = job.id.clone();
        handles.push(tokio::spawn(async move {
            store
                .claim_job(&id, &format!("worker-{}", worker), fixed_now())
                .await
                .unwrap()
        }));
    }

    let mut winners = 0;
    for handle in handles {
        if handle.await.unwrap() {
            winners += 1;
        }
    }
    assert_eq!(winners, 1);

    let claimed = store.get_job(&job.id).await.unwrap().unwrap();
    assert_eq!(claimed.status, JobStatus::Running);
    assert!(claimed.worker_id.is_some());
    assert_eq!(store.count_active_jobs(&org).await.unwrap(), 1);
}

#[tokio::test]
async fn test_job_aggregates_by_step() {
    skip_if_no_db!();
    let Some(store) = postgres_store().await else {
        eprintln!("Skipping test: failed to connect to TEST_DATABASE_URL");
        return;
    };
    let org = unique_org();

    let doc = store
        .create_document(NewDocument::new("user-1", &org, "a.pdf"))
        .await
        .unwrap();
    for step in [PipelineStep::Route, PipelineStep::Ocr, PipelineStep::Ocr] {
        let job = store
            .create_job(NewJob::for_document(&doc, step).created_at(secs_ago(120)))
            .await
            .unwrap();
        store.claim_job(&job.id, "worker-1", secs_ago(100)).await.unwrap();
        let running = store.get_job(&job.id).await.unwrap().unwrap();
        store
            .update_job_status(&job.id, &JobStatusUpdate::completed(&running, None, fixed_now()))
            .await
            .unwrap();
    }

    let rows = store
        .aggregate_jobs(&JobAggregate {
            organization_id: Some(org.clone()),
            ..JobAggregate::by(JobGroupBy::Step)
        })
        .await
        .unwrap();

    let ocr = rows.iter().find(|r| r.key == "ocr").unwrap();
    assert_eq!(ocr.count, 2);
    let average = ocr.average.unwrap();
    assert!((average - 100.0).abs() < 0.001, "average {}", average);
    assert_eq!(rows.iter().find(|r| r.key == "route").unwrap().count, 1);
}

#[tokio::test]
async fn test_concurrent_usage_increments_are_not_lost() {
    skip_if_no_db!();
    let Some(store) = postgres_store().await else {
        eprintln!("Skipping test: failed to connect to TEST_DATABASE_URL");
        return;
    };
    let store = Arc::new(store);
    let org = unique_org();
    let window = QuotaWindow::containing(ResourceType::ApiCallsMonthly.period(), fixed_now())
        .unwrap();

    let mut handles = Vec::new();
    for _ in 0..20 {
        let store = store.clone();
        let increment = UsageIncrement {
            organization_id: org.clone(),
            resource_type: ResourceType::ApiCallsMonthly,
            window,
            amount: 5,
            at: fixed_now(),
        };
        handles.push(tokio::spawn(async move {
            store.increment_usage(&increment).await.unwrap()
        }));
    }
    for handle in handles {
        handle.await.unwrap();
    }

    let usage = store
        .get_usage(&org, ResourceType::ApiCallsMonthly, window.start)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(usage.current_usage, 100);
}

#[tokio::test]
async fn test_sqlite_primary_mirrors_into_postgres() {
    skip_if_no_db!();
    let Some(postgres) = postgres_store().await else {
        eprintln!("Skipping test: failed to connect to TEST_DATABASE_URL");
        return;
    };
    let postgres = Arc::new(postgres);
    let sqlite = Arc::new(SqliteStore::in_memory().await.unwrap());
    let manager = PersistenceManager::new(sqlite.clone()).with_mirror(postgres.clone());
    assert_eq!(manager.mirror_backend(), Some(BackendKind::Postgres));

    let org = unique_org();
    let doc = manager
        .create_document(NewDocument::new("user-1", &org, "a.pdf").created_at(fixed_now()))
        .await
        .unwrap();
    let job = manager
        .create_job(NewJob::for_document(&doc, PipelineStep::Route).created_at(fixed_now()))
        .await
        .unwrap();
    manager.claim_job(&job.id, "worker-1", fixed_now()).await.unwrap();

    assert_eq!(
        sqlite.get_document(&doc.id).await.unwrap(),
        postgres.get_document(&doc.id).await.unwrap()
    );
    assert_eq!(
        sqlite.get_job(&job.id).await.unwrap(),
        postgres.get_job(&job.id).await.unwrap()
    );
    assert_eq!(manager.stats().failures, 0);

    let health = manager.mirror_health().await.unwrap().unwrap();
    assert!(health.healthy);
    assert_eq!(health.backend, BackendKind::Postgres);
    assert!(postgres.health_check().await.unwrap().documents >= 1);
}
