mod common;

use common::TestHarness;
use pretty_assertions::assert_eq;

use foreman::database::work_orders::{CreateWorkOrderRequest, UpdateWorkOrderRequest, WorkOrder};

fn titled(title: &str) -> CreateWorkOrderRequest {
    CreateWorkOrderRequest {
        title: title.to_string(),
        ..Default::default()
    }
}

fn depends_on(ids: &[&str]) -> UpdateWorkOrderRequest {
    UpdateWorkOrderRequest {
        depends_on: Some(ids.iter().map(|id| id.to_string()).collect()),
        ..Default::default()
    }
}

#[tokio::test]
async fn test_update_rejects_dependency_cycle() {
    let h = TestHarness::new().await;
    let project = h.project("alpha").await;
    let a = h.work_order(&project.id, titled("Schema")).await;
    let b = h.work_order(&project.id, titled("API")).await;
    let c = h.work_order(&project.id, titled("UI")).await;
    let db = &h.state.db;

    WorkOrder::update(db, &b.id, depends_on(&[a.id.as_str()])).await.unwrap();
    WorkOrder::update(db, &c.id, depends_on(&[b.id.as_str()])).await.unwrap();

    let err = WorkOrder::update(db, &a.id, depends_on(&[c.id.as_str()]))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), "dependency_cycle");
    let path = err.details()["cycle_path"].as_array().unwrap().len();
    assert_eq!(path, 4);

    let err = WorkOrder::update(db, &a.id, depends_on(&[a.id.as_str()]))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), "dependency_cycle");

    let err = WorkOrder::update(db, &a.id, depends_on(&["missing"]))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), "validation");

    // Rejected edits leave the stored graph untouched.
    let a = WorkOrder::require(db, &a.id).await.unwrap();
    assert!(a.depends_on.is_empty());
}

#[tokio::test]
async fn test_create_rejects_unknown_dependency() {
    let h = TestHarness::new().await;
    let project = h.project("alpha").await;

    let err = WorkOrder::create(
        &h.state.db,
        &project.id,
        CreateWorkOrderRequest {
            depends_on: vec!["ghost".to_string()],
            ..titled("Orphan")
        },
    )
    .await
    .unwrap_err();
    assert_eq!(err.kind(), "validation");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_edits_cannot_form_a_cycle() {
    let h = TestHarness::new().await;
    let project = h.project("alpha").await;

    for round in 0..10 {
        let a = h.work_order(&project.id, titled(&format!("A{}", round))).await;
        let b = h.work_order(&project.id, titled(&format!("B{}", round))).await;

        let forward = {
            let db = h.state.db.clone();
            let (a, b) = (a.id.clone(), b.id.clone());
            tokio::spawn(async move { WorkOrder::update(&db, &a, depends_on(&[b.as_str()])).await })
        };
        let backward = {
            let db = h.state.db.clone();
            let (a, b) = (a.id.clone(), b.id.clone());
            tokio::spawn(async move { WorkOrder::update(&db, &b, depends_on(&[a.as_str()])).await })
        };

        let results = [forward.await.unwrap(), backward.await.unwrap()];
        let accepted = results.iter().filter(|r| r.is_ok()).count();
        assert_eq!(accepted, 1, "round {} accepted both edges", round);
        for result in &results {
            if let Err(e) = result {
                assert_eq!(e.kind(), "dependency_cycle");
            }
        }

        let a = WorkOrder::require(&h.state.db, &a.id).await.unwrap();
        let b = WorkOrder::require(&h.state.db, &b.id).await.unwrap();
        assert!(a.depends_on.is_empty() || b.depends_on.is_empty());
    }
}
