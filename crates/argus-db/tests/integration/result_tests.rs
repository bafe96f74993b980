use argus_core::models::{ExtractionResult, NewResult, ProductFields, StrategyKind, Variant};
use argus_core::traits::ResultStore;
use argus_db::{Database, ResultRepository};
use uuid::Uuid;

use crate::integration::common::setup_test_db;

fn new_result(url: &str, title: &str, strategy: StrategyKind) -> NewResult {
    NewResult {
        task_id: Uuid::new_v4(),
        url: url.into(),
        canonical_link: None,
        result: ExtractionResult {
            strategy_used: strategy,
            confidence: 0.82,
            fields: ProductFields {
                title: Some(title.into()),
                price: Some(199_000.0),
                currency: Some("IRT".into()),
                original_price: Some(250_000.0),
                images: vec!["https://cdn.example/1.jpg".into()],
                variants: vec![Variant {
                    name: Some("Blue".into()),
                    price: Some(199_000.0),
                    ..Default::default()
                }],
                ..Default::default()
            },
            fallback_count: 1,
        },
        content_hash: "ab".repeat(32),
    }
}

#[tokio::test]
async fn save_and_retrieve_result() {
    let (pool, _container) = setup_test_db().await;
    let repo = ResultRepository::new(pool);

    let new = new_result("https://shop.example/p/1", "Widget X", StrategyKind::DomHeuristic);
    let id = repo.save(&new).await.unwrap();
    assert!(!id.is_nil());

    let stored = repo.get(id).await.unwrap().expect("Should find the result");
    assert_eq!(stored.task_id, new.task_id);
    assert_eq!(stored.url, "https://shop.example/p/1");
    assert_eq!(stored.result, new.result);
    assert_eq!(stored.content_hash, new.content_hash);
    assert_eq!(stored.result.fields.discount_percent(), Some(20.4));
}

#[tokio::test]
async fn latest_for_url_returns_most_recent() {
    let (pool, _container) = setup_test_db().await;
    let repo = ResultRepository::new(pool);

    let url = "https://shop.example/p/1";
    repo.save(&new_result(url, "First", StrategyKind::StructuredData))
        .await
        .unwrap();
    // Small delay to ensure different timestamps
    tokio::time::sleep(std::time::Duration::from_millis(10)).await;
    let second = repo
        .save(&new_result(url, "Second", StrategyKind::LlmAssisted))
        .await
        .unwrap();

    let latest = ResultStore::latest_for_url(&repo, url).await.unwrap().unwrap();
    assert_eq!(latest.id, second);
    assert_eq!(latest.result.fields.title.as_deref(), Some("Second"));
    assert_eq!(latest.result.strategy_used, StrategyKind::LlmAssisted);

    let history = repo.history(url, 10).await.unwrap();
    assert_eq!(history.len(), 2);
    assert_eq!(history[0].id, second);
}

#[tokio::test]
async fn latest_for_url_matches_canonical_link() {
    let (pool, _container) = setup_test_db().await;
    let repo = ResultRepository::new(pool);

    let mut new = new_result(
        "https://shop.example/p/1?color=blue",
        "Widget X",
        StrategyKind::StructuredData,
    );
    new.canonical_link = Some("https://shop.example/p/1".into());
    let id = repo.save(&new).await.unwrap();

    let found = repo
        .latest_for_url("https://shop.example/p/1")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(found.id, id);
    assert!(repo.latest_for_url("https://other.example/").await.unwrap().is_none());
}

#[tokio::test]
async fn health_check_succeeds() {
    let (pool, _container) = setup_test_db().await;
    Database::from_pool(pool).health_check().await.unwrap();
}
