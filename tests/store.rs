use std::sync::Arc;
use std::time::Duration;

use sheetbase::sheets::{
    ApiOp, BatchOperation, CellValue, FieldValue, Filter, FilterOperator, MemorySheetsApi, OperationStatus,
    Query, Record, RetryPolicy, SchemaRegistry, SheetError, SheetStore, SheetsClient, SortDirection,
    StructureStatus,
};

fn fast_retry() -> RetryPolicy {
    RetryPolicy {
        max_attempts: 3,
        base_delay_ms: 1,
        max_delay_ms: 4,
        jitter_ms: 0,
    }
}

async fn setup() -> (Arc<MemorySheetsApi>, SheetStore) {
    let api = Arc::new(MemorySheetsApi::new());
    let store = SheetStore::new(SheetsClient::new(api.clone(), fast_retry()), SchemaRegistry::builtin());
    store.initialize_sheets().await.unwrap();
    (api, store)
}

fn task(title: &str, status: &str) -> Record {
    Record::new()
        .with("project_id", "project_1")
        .with("title", title)
        .with("status", status)
}

#[tokio::test]
async fn test_create_then_read_round_trip() {
    let (_api, store) = setup().await;

    let input = task("Write report", "todo")
        .with("priority", "high")
        .with("estimated_hours", 3.5)
        .with("due_date", chrono::NaiveDate::from_ymd_opt(2024, 6, 30).unwrap())
        .with("assignee", "0042");
    let id = store.create("tasks", input.clone()).await.unwrap();

    let found = store.read("tasks", Some(&id)).await.unwrap();
    assert_eq!(found.len(), 1);
    let record = &found[0];

    assert_eq!(record.id(), Some(id.as_str()));
    for (field, value) in input.iter() {
        assert_eq!(record.get(field), Some(value), "field {}", field);
    }
}

#[tokio::test]
async fn test_update_changes_only_the_given_field() {
    let (_api, store) = setup().await;
    let id = store
        .create("tasks", task("Fix bug", "todo").with("assignee", "sam"))
        .await
        .unwrap();
    let before = store.get("tasks", &id).await.unwrap().unwrap();

    let changed = store
        .update("tasks", &id, Record::new().with("status", "in_progress"))
        .await
        .unwrap();
    assert!(changed);

    let after = store.get("tasks", &id).await.unwrap().unwrap();
    assert_eq!(after.get("status"), Some(&FieldValue::String("in_progress".into())));
    for (field, value) in before.iter() {
        if field != "status" && field != "updated_at" {
            assert_eq!(after.get(field), Some(value), "field {}", field);
        }
    }
}

#[tokio::test]
async fn test_update_missing_record_returns_false() {
    let (_api, store) = setup().await;
    let changed = store
        .update("tasks", "task_missing", Record::new().with("status", "review"))
        .await
        .unwrap();
    assert!(!changed);
}

#[tokio::test]
async fn test_delete_then_read_is_empty() {
    let (api, store) = setup().await;
    let ids = store
        .batch_create("tasks", vec![task("a", "todo"), task("b", "todo"), task("c", "todo")])
        .await
        .unwrap();

    assert!(store.delete("tasks", &ids[1]).await.unwrap());
    assert!(store.read("tasks", Some(&ids[1])).await.unwrap().is_empty());
    assert!(!store.delete("tasks", &ids[1]).await.unwrap());

    // The row is blanked in place; its neighbours keep their positions
    let remaining: Vec<String> = store
        .read("tasks", None)
        .await
        .unwrap()
        .iter()
        .filter_map(|r| r.id().map(str::to_string))
        .collect();
    assert_eq!(remaining, vec![ids[0].clone(), ids[2].clone()]);
    let rows = api.rows("tasks").unwrap();
    assert_eq!(rows.len(), 4);
    assert!(rows[2].is_empty());
}

#[tokio::test]
async fn test_rate_limited_delete_is_retried() {
    let (api, store) = setup().await;
    let id = store
        .create("clients", Record::new().with("name", "Acme"))
        .await
        .unwrap();
    api.fail_next(ApiOp::Clear, SheetError::RateLimited("429".into()));

    assert!(store.delete("clients", &id).await.unwrap());
    assert_eq!(api.calls(ApiOp::Clear), 2);
    assert!(store.get("clients", &id).await.unwrap().is_none());
}

/// A delete racing an update of a later record must not move that record
#[tokio::test(start_paused = true)]
async fn test_concurrent_delete_leaves_other_records_intact() {
    let api = Arc::new(MemorySheetsApi::new().with_latency(Duration::from_millis(20)));
    let store = SheetStore::new(SheetsClient::new(api.clone(), fast_retry()), SchemaRegistry::builtin());
    store.initialize_sheets().await.unwrap();
    let ids = store
        .batch_create(
            "clients",
            ["A", "B", "C", "D"]
                .iter()
                .map(|name| Record::new().with("name", *name))
                .collect(),
        )
        .await
        .unwrap();

    let (deleted, updated) = tokio::join!(
        store.delete("clients", &ids[1]),
        store.update("clients", &ids[2], Record::new().with("notes", "vip")),
    );
    assert!(deleted.unwrap());
    assert!(updated.unwrap());

    let records = store.read("clients", None).await.unwrap();
    let names: Vec<(String, String)> = records
        .iter()
        .map(|r| (r.id().unwrap().to_string(), r.get("name").unwrap().to_string()))
        .collect();
    assert_eq!(
        names,
        vec![
            (ids[0].clone(), "A".to_string()),
            (ids[2].clone(), "C".to_string()),
            (ids[3].clone(), "D".to_string()),
        ]
    );
    let c = store.get("clients", &ids[2]).await.unwrap().unwrap();
    assert_eq!(c.get("notes"), Some(&FieldValue::String("vip".into())));
}

#[tokio::test]
async fn test_existing_caller_id_is_rejected_even_after_throttling() {
    let (api, store) = setup().await;
    store
        .create("clients", Record::new().with("id", "client_x").with("name", "Old"))
        .await
        .unwrap();
    api.fail_next(ApiOp::Append, SheetError::RateLimited("429".into()));

    let err = store
        .create("clients", Record::new().with("id", "client_x").with("name", "New"))
        .await
        .unwrap_err();
    let issues = err.issues().expect("validation error");
    assert_eq!(issues[0].field, "id");
    assert_eq!(api.calls(ApiOp::Append), 1);

    let stored = store.read("clients", Some("client_x")).await.unwrap();
    assert_eq!(stored.len(), 1);
    assert_eq!(stored[0].get("name"), Some(&FieldValue::String("Old".into())));
}

#[tokio::test]
async fn test_new_caller_id_survives_throttled_append() {
    let (api, store) = setup().await;
    api.fail_next(ApiOp::Append, SheetError::RateLimited("429".into()));

    let id = store
        .create("clients", Record::new().with("id", "client_y").with("name", "New"))
        .await
        .unwrap();
    assert_eq!(id, "client_y");
    assert_eq!(api.calls(ApiOp::Append), 2);
    assert_eq!(store.read("clients", Some("client_y")).await.unwrap().len(), 1);

    let err = store
        .batch_create(
            "clients",
            vec![
                Record::new().with("id", "client_z").with("name", "Z1"),
                Record::new().with("id", "client_z").with("name", "Z2"),
            ],
        )
        .await
        .unwrap_err();
    assert_eq!(err.issues().unwrap()[0].record_index, Some(1));
}

#[tokio::test]
async fn test_rows_without_id_are_not_records() {
    let text = |s: &str| CellValue::String(s.to_string());
    let api = Arc::new(MemorySheetsApi::new().with_sheet(
        "clients",
        vec![
            vec![text("id"), text("name")],
            vec![text("client_1"), text("Acme")],
            vec![CellValue::Empty, text("Stray note")],
        ],
    ));
    let store = SheetStore::new(SheetsClient::new(api, fast_retry()), SchemaRegistry::builtin());

    let records = store.read("clients", None).await.unwrap();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].id(), Some("client_1"));
}

#[tokio::test]
async fn test_batch_create_keeps_input_order_in_one_append() {
    let (api, store) = setup().await;
    let records: Vec<Record> = (0..5).map(|i| task(&format!("t{}", i), "todo")).collect();

    let ids = store.batch_create("tasks", records).await.unwrap();
    assert_eq!(ids.len(), 5);
    assert_eq!(api.calls(ApiOp::Append), 1);

    let stored = store.read("tasks", None).await.unwrap();
    let stored_ids: Vec<&str> = stored.iter().filter_map(|r| r.id()).collect();
    assert_eq!(stored_ids, ids.iter().map(String::as_str).collect::<Vec<_>>());
}

#[tokio::test]
async fn test_caller_supplied_ids_are_kept() {
    let (_api, store) = setup().await;
    let id = store
        .create("clients", Record::new().with("id", "client_acme").with("name", "Acme"))
        .await
        .unwrap();
    assert_eq!(id, "client_acme");
}

#[tokio::test]
async fn test_validation_issues_are_returned_as_data() {
    let (api, store) = setup().await;

    let err = store
        .create("tasks", Record::new().with("status", "someday").with("estimated_hours", "soon"))
        .await
        .unwrap_err();

    let issues = err.issues().expect("validation error");
    let fields: Vec<&str> = issues.iter().map(|i| i.field.as_str()).collect();
    assert_eq!(fields, vec!["project_id", "title", "status", "estimated_hours"]);
    assert_eq!(api.calls(ApiOp::Append), 0);

    let direct = store
        .validate_record_data("tasks", &task("ok", "todo").with("id", "task_1"))
        .unwrap();
    assert!(direct.is_empty());
}

#[tokio::test]
async fn test_unknown_table_is_not_found() {
    let (_api, store) = setup().await;
    assert!(store.read("widgets", None).await.unwrap_err().is_not_found());
    assert!(store.create("widgets", Record::new()).await.unwrap_err().is_not_found());
    assert!(store.validate_record_data("widgets", &Record::new()).unwrap_err().is_not_found());
}

#[tokio::test]
async fn test_errors_carry_table_and_operation() {
    let (api, store) = setup().await;
    api.fail_next(ApiOp::Read, SheetError::Auth("token expired".into()));

    let err = store.read("tasks", None).await.unwrap_err();
    assert!(matches!(err.root(), SheetError::Auth(_)));
    assert!(err.to_string().starts_with("read on 'tasks' failed"));
    assert_eq!(api.calls(ApiOp::Read), 1);
}

#[tokio::test]
async fn test_query_filter_sort_and_page() {
    let (_api, store) = setup().await;
    let records: Vec<Record> = (1..=25)
        .map(|i| {
            task(&format!("t{:02}", i), if i % 5 == 0 { "completed" } else { "todo" })
                .with("estimated_hours", i as f64)
        })
        .collect();
    store.batch_create("tasks", records).await.unwrap();

    let completed = store
        .query("tasks", &Query::new().filter(Filter::eq("status", "completed")))
        .await
        .unwrap();
    assert_eq!(completed.len(), 5);

    let page = store
        .query(
            "tasks",
            &Query::new()
                .sort_by("estimated_hours", SortDirection::Desc)
                .limit(10)
                .offset(10),
        )
        .await
        .unwrap();
    let hours: Vec<FieldValue> = page.iter().filter_map(|r| r.get("estimated_hours").cloned()).collect();
    assert_eq!(hours.first(), Some(&FieldValue::Number(15.0)));
    assert_eq!(hours.last(), Some(&FieldValue::Number(6.0)));

    let big = Query::new()
        .filter(Filter::new("estimated_hours", FilterOperator::Gte, 20.0))
        .limit(2);
    assert_eq!(store.count("tasks", &big).await.unwrap(), 6);
}

#[tokio::test]
async fn test_aggregate_over_query() {
    let (_api, store) = setup().await;
    store
        .batch_create(
            "tasks",
            vec![
                task("a", "todo").with("actual_hours", 2.0),
                task("b", "todo").with("actual_hours", 3.0),
                task("c", "completed").with("actual_hours", 10.0),
                task("d", "completed"),
            ],
        )
        .await
        .unwrap();

    let todo = store
        .aggregate("tasks", &Query::new().filter(Filter::eq("status", "todo")), "actual_hours")
        .await
        .unwrap();
    assert_eq!(todo.sum, 5.0);
    assert_eq!(todo.avg, Some(2.5));

    let by_status = store
        .aggregate_by("tasks", &Query::new(), "status", "actual_hours")
        .await
        .unwrap();
    assert_eq!(by_status["completed"].sum, 10.0);
    assert_eq!(by_status["completed"].missing, 1);
}

#[tokio::test]
async fn test_batch_update_reports_partial_failure() {
    let (api, store) = setup().await;
    let ids = store
        .batch_create("tasks", vec![task("a", "todo"), task("b", "todo"), task("c", "todo")])
        .await
        .unwrap();

    // First write fails permanently; the batch stops there
    api.fail_next(ApiOp::Write, SheetError::Permanent("bad range".into()));

    let ops = vec![
        BatchOperation::Update {
            table: "tasks".into(),
            id: ids[0].clone(),
            changes: Record::new().with("status", "review"),
        },
        BatchOperation::Update {
            table: "tasks".into(),
            id: ids[1].clone(),
            changes: Record::new().with("status", "review"),
        },
        BatchOperation::Create {
            table: "tasks".into(),
            record: task("d", "todo"),
        },
    ];
    let report = store.batch_update(ops).await;

    assert!(!report.all_applied());
    assert!(matches!(report.outcomes[0].status, OperationStatus::Failed { .. }));
    assert_eq!(report.outcomes[1].status, OperationStatus::Skipped);
    assert_eq!(report.outcomes[2].status, OperationStatus::Skipped);
    assert_eq!(store.read("tasks", None).await.unwrap().len(), 3);
}

#[tokio::test]
async fn test_batch_update_continues_past_invalid_and_missing() {
    let (_api, store) = setup().await;
    let id = store.create("tasks", task("a", "todo")).await.unwrap();

    let ops = vec![
        BatchOperation::Update {
            table: "tasks".into(),
            id: id.clone(),
            changes: Record::new().with("status", "nonsense"),
        },
        BatchOperation::Update {
            table: "tasks".into(),
            id: "task_missing".into(),
            changes: Record::new().with("status", "review"),
        },
        BatchOperation::Update {
            table: "tasks".into(),
            id: id.clone(),
            changes: Record::new().with("status", "completed"),
        },
        BatchOperation::Create {
            table: "tasks".into(),
            record: task("b", "todo"),
        },
    ];
    let report = store.batch_update(ops).await;

    assert!(matches!(report.outcomes[0].status, OperationStatus::Invalid { .. }));
    assert_eq!(report.outcomes[1].status, OperationStatus::NotFound);
    assert_eq!(report.outcomes[2].status, OperationStatus::Applied { id: id.clone() });
    assert!(matches!(report.outcomes[3].status, OperationStatus::Applied { .. }));
    assert_eq!(report.applied_count(), 2);

    let record = store.get("tasks", &id).await.unwrap().unwrap();
    assert_eq!(record.get("status"), Some(&FieldValue::String("completed".into())));
}

/// Concurrent read-modify-write on the same record: the later write wins and
/// the earlier change is lost without an error.
#[tokio::test(start_paused = true)]
async fn test_concurrent_updates_last_write_wins() {
    let api = Arc::new(MemorySheetsApi::new().with_latency(Duration::from_millis(20)));
    let store = SheetStore::new(SheetsClient::new(api, fast_retry()), SchemaRegistry::builtin());
    store.initialize_sheets().await.unwrap();
    let id = store.create("tasks", task("shared", "todo")).await.unwrap();

    let (first, second) = tokio::join!(
        store.update("tasks", &id, Record::new().with("assignee", "alex")),
        store.update("tasks", &id, Record::new().with("priority", "urgent")),
    );
    assert!(first.unwrap());
    assert!(second.unwrap());

    // Both read the original row, so whichever write landed last erased the other change
    let record = store.get("tasks", &id).await.unwrap().unwrap();
    let kept = [record.contains("assignee"), record.contains("priority")];
    assert_eq!(kept.iter().filter(|k| **k).count(), 1);
}

#[tokio::test]
async fn test_transient_read_failures_are_retried() {
    let (api, store) = setup().await;
    store.create("tasks", task("a", "todo")).await.unwrap();
    api.fail_next(ApiOp::Read, SheetError::RateLimited("429".into()));
    api.fail_next(ApiOp::Read, SheetError::Transient("503".into()));

    assert_eq!(store.read("tasks", None).await.unwrap().len(), 1);
    assert_eq!(api.calls(ApiOp::Read), 3);
}

#[tokio::test]
async fn test_structure_validation() {
    let text = |s: &str| CellValue::String(s.to_string());
    let api = Arc::new(
        MemorySheetsApi::new()
            .with_sheet("clients", vec![vec![text("id"), text("name")]])
            .with_sheet("projects", vec![]),
    );
    let store = SheetStore::new(SheetsClient::new(api.clone(), fast_retry()), SchemaRegistry::builtin());
    api.fail_next(ApiOp::ReadHeader, SheetError::Auth("denied".into()));

    let reports = store.validate_all_sheets().await;
    assert_eq!(reports.len(), 4);
    let statuses: Vec<StructureStatus> = reports.iter().map(|r| r.status).collect();
    // One of the four reads was refused; the rest reflect the live sheets
    assert_eq!(statuses.iter().filter(|s| **s == StructureStatus::Unreachable).count(), 1);
    assert!(reports.iter().all(|r| !r.is_valid()));

    let clients = store.validate_sheet_structure("clients").await.unwrap();
    assert_eq!(clients.status, StructureStatus::Drifted);
    assert!(clients.messages().iter().any(|m| m.contains("email")));
    let tasks = store.validate_sheet_structure("tasks").await.unwrap();
    assert_eq!(tasks.status, StructureStatus::MissingSheet);
}
