//! Catalog integration tests.
//!
//! These need a real Postgres; set `ARKIV_TEST_DB_URL` to run them. Without
//! it every test returns early, so the default suite stays hermetic.

use arkiv::catalog::{ArchiveType, Catalog, ItemStatus};

async fn test_catalog() -> Option<Catalog> {
    let url = std::env::var("ARKIV_TEST_DB_URL").ok()?;
    let catalog = Catalog::connect(&url).await.expect("test database reachable");
    catalog.migrate().await.expect("schema applies");
    Some(catalog)
}

#[tokio::test]
async fn capture_creation_assigns_base62_short_ids() {
    let Some(catalog) = test_catalog().await else { return };

    let url_id = catalog
        .upsert_archived_url("https://example.com/ids")
        .await
        .unwrap();
    let capture = catalog.create_capture(url_id, None).await.unwrap();

    assert_eq!(capture.short_id.len(), 5);
    assert!(capture.short_id.bytes().all(|b| b.is_ascii_alphanumeric()));

    let found = catalog
        .capture_by_short_id(&capture.short_id)
        .await
        .unwrap()
        .expect("capture resolvable by short id");
    assert_eq!(found.id, capture.id);
    assert_eq!(found.original_url, "https://example.com/ids");
}

#[tokio::test]
async fn one_item_per_capture_and_type() {
    let Some(catalog) = test_catalog().await else { return };

    let url_id = catalog
        .upsert_archived_url("https://example.com/unique-items")
        .await
        .unwrap();
    let capture = catalog.create_capture(url_id, None).await.unwrap();

    let first = catalog.create_item(capture.id, ArchiveType::Mhtml).await.unwrap();
    let second = catalog.create_item(capture.id, ArchiveType::Mhtml).await.unwrap();
    assert_eq!(first, second, "duplicate create resolves to the same row");

    let items = catalog.items_for_capture(capture.id).await.unwrap();
    assert_eq!(items.len(), 1);
    assert_eq!(items[0].status, ItemStatus::Pending);
    assert_eq!(items[0].retry_count, 0);
    assert!(items[0].storage_key.is_empty());
}

#[tokio::test]
async fn processing_transition_is_a_single_winner_cas() {
    let Some(catalog) = test_catalog().await else { return };

    let url_id = catalog
        .upsert_archived_url("https://example.com/cas")
        .await
        .unwrap();
    let capture = catalog.create_capture(url_id, None).await.unwrap();
    let item_id = catalog.create_item(capture.id, ArchiveType::Screenshot).await.unwrap();

    // Two workers that loaded the same snapshot race; exactly one wins.
    let first = catalog
        .try_begin_processing(item_id, ItemStatus::Pending, 0)
        .await
        .unwrap();
    let second = catalog
        .try_begin_processing(item_id, ItemStatus::Pending, 0)
        .await
        .unwrap();
    assert!(first);
    assert!(!second);

    let item = catalog
        .item(capture.id, ArchiveType::Screenshot)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(item.status, ItemStatus::Processing);
    assert_eq!(item.retry_count, 1);
}

/// Retry budget and operator reset live in one test: `reset_failed` is
/// global, so running them in parallel against a shared database would
/// interfere.
#[tokio::test]
async fn retry_budget_caps_then_operator_reset_restores_it() {
    let Some(catalog) = test_catalog().await else { return };

    let url_id = catalog
        .upsert_archived_url("https://example.com/retries")
        .await
        .unwrap();
    let capture = catalog.create_capture(url_id, None).await.unwrap();
    let item_id = catalog.create_item(capture.id, ArchiveType::Git).await.unwrap();

    for attempt in 0..3 {
        let item = catalog.item(capture.id, ArchiveType::Git).await.unwrap().unwrap();
        assert_eq!(item.retry_count, attempt);
        assert!(
            catalog
                .try_begin_processing(item_id, item.status, item.retry_count)
                .await
                .unwrap()
        );
        catalog.fail_item(item_id).await.unwrap();
    }

    // Budget exhausted: the transition refuses a fourth attempt.
    let item = catalog.item(capture.id, ArchiveType::Git).await.unwrap().unwrap();
    assert_eq!(item.retry_count, 3);
    assert!(
        !catalog
            .try_begin_processing(item_id, item.status, item.retry_count)
            .await
            .unwrap()
    );

    // Operator bulk retry resets the budget and the status.
    let reset = catalog.reset_failed().await.unwrap();
    assert!(reset.iter().any(|p| p.item_id == item_id));

    let item = catalog.item(capture.id, ArchiveType::Git).await.unwrap().unwrap();
    assert_eq!(item.status, ItemStatus::Pending);
    assert_eq!(item.retry_count, 0);
    assert!(
        catalog
            .try_begin_processing(item_id, item.status, item.retry_count)
            .await
            .unwrap()
    );
}

#[tokio::test]
async fn completion_records_storage_key_and_size() {
    let Some(catalog) = test_catalog().await else { return };

    let url_id = catalog
        .upsert_archived_url("https://example.com/completion")
        .await
        .unwrap();
    let capture = catalog.create_capture(url_id, None).await.unwrap();
    let item_id = catalog.create_item(capture.id, ArchiveType::Mhtml).await.unwrap();

    catalog
        .try_begin_processing(item_id, ItemStatus::Pending, 0)
        .await
        .unwrap();
    let key = format!("{}/mhtml.mhtml.zst", capture.short_id);
    catalog.complete_item(item_id, &key, ".mhtml", 12_345).await.unwrap();

    let item = catalog.item(capture.id, ArchiveType::Mhtml).await.unwrap().unwrap();
    assert_eq!(item.status, ItemStatus::Completed);
    assert_eq!(item.storage_key, key);
    assert_eq!(item.extension, ".mhtml");
    assert_eq!(item.file_size, 12_345);
}

#[tokio::test]
async fn logs_append_incrementally() {
    let Some(catalog) = test_catalog().await else { return };

    let url_id = catalog
        .upsert_archived_url("https://example.com/logs")
        .await
        .unwrap();
    let capture = catalog.create_capture(url_id, None).await.unwrap();
    let item_id = catalog.create_item(capture.id, ArchiveType::Mhtml).await.unwrap();

    catalog.append_log(item_id, "line one\n").await.unwrap();
    catalog.append_log(item_id, "line two\n").await.unwrap();

    let (_, logs) = catalog
        .item_logs(capture.id, ArchiveType::Mhtml)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(logs, "line one\nline two\n");
}
