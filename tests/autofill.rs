// tests/autofill.rs
//
// Viewport-fill pagination driven through the service against a paged stub source.
//
// Covered:
// - continuous near-end signal → at most `max_consecutive_iterations` fetches
// - a user trigger resets the counter
// - throttle: consecutive automatic fetches are spaced by more than the interval
// - exhausted listings stop early
// - manual load_more appends and advances the page

use serde_json::json;
use std::sync::Arc;
use std::time::Duration;

use catalog_aggregator::config::AppConfig;
use catalog_aggregator::pagination::{HaltReason, Paged};
use catalog_aggregator::registry::{Source, SourceRegistry};
use catalog_aggregator::transport::StubTransport;
use catalog_aggregator::{CatalogQuery, CatalogService};

/// Source `srcX` serving `cat1` pages 1..=pages, one item per page.
fn paged_service(page_count: u32, pages: u32) -> (Arc<StubTransport>, CatalogService) {
    let mut stub = StubTransport::new();
    // Highest pages first so that the `pg=1` prefix does not shadow `pg=10`.
    for pg in (1..=pages).rev() {
        stub = stub.json(
            &format!("http://x.test/api?ac=videolist&t=cat1&pg={pg}"),
            Duration::from_millis(30),
            json!({
                "page": pg,
                "pagecount": page_count,
                "list": [{"vod_id": pg, "vod_name": format!("item {pg}")}]
            }),
        );
    }
    let stub = Arc::new(stub);
    let registry =
        SourceRegistry::new(vec![Source::new("srcX", "X", "http://x.test/api")]).unwrap();
    let svc = CatalogService::new(AppConfig::default(), registry, stub.clone());
    (stub, svc)
}

#[tokio::test(start_paused = true)]
async fn continuous_trigger_is_capped() {
    let (stub, svc) = paged_service(50, 12);
    let query = CatalogQuery::browse("srcX", "cat1", 1);
    let (first, _) = svc.browse_category("srcX", "cat1", 1).await.unwrap();
    assert_eq!(first.page_count, 50);
    assert!(first.has_more());

    let mut fill = svc.auto_fill_state();
    fill.user_trigger();
    let started = tokio::time::Instant::now();
    let (res, report) = svc.auto_fill(&query, first, &mut fill, |_| true).await;

    assert_eq!(report.fetched, 5);
    assert_eq!(report.halted, HaltReason::IterationCap);
    assert_eq!(res.page, 6);
    assert_eq!(res.items.len(), 6);
    assert!(res.has_more(), "cap applies regardless of has_more");
    assert!(started.elapsed() > Duration::from_millis(4 * 400));
    assert_eq!(stub.calls().len(), 6);

    // Still near the end, no new user trigger: nothing more is fetched.
    let (res, report) = svc.auto_fill(&query, res, &mut fill, |_| true).await;
    assert_eq!(report.fetched, 0);
    assert_eq!(stub.calls().len(), 6);

    fill.user_trigger();
    let (res, report) = svc.auto_fill(&query, res, &mut fill, |_| true).await;
    assert_eq!(report.fetched, 5);
    assert_eq!(res.page, 11);
    let titles: Vec<_> = res.items.iter().map(|i| i.title.clone()).collect();
    assert_eq!(titles.first().map(String::as_str), Some("item 1"));
    assert_eq!(titles.last().map(String::as_str), Some("item 11"));
}

#[tokio::test(start_paused = true)]
async fn five_page_listing_stops_when_exhausted() {
    let (stub, svc) = paged_service(5, 5);
    let query = CatalogQuery::browse("srcX", "cat1", 1);
    let (first, _) = svc.browse_category("srcX", "cat1", 1).await.unwrap();
    assert_eq!(first.page_count, 5);

    let mut fill = svc.auto_fill_state();
    let (res, report) = svc.auto_fill(&query, first, &mut fill, |_| true).await;
    assert!(report.fetched <= 5);
    assert_eq!(report.fetched, 4);
    assert_eq!(report.halted, HaltReason::Exhausted);
    assert_eq!(res.page, 5);
    assert!(!res.has_more());
    assert_eq!(stub.calls().len(), 5);
}

#[tokio::test(start_paused = true)]
async fn near_end_signal_controls_the_loop() {
    let (_, svc) = paged_service(50, 12);
    let query = CatalogQuery::browse("srcX", "cat1", 1);
    let (first, _) = svc.browse_category("srcX", "cat1", 1).await.unwrap();

    let mut fill = svc.auto_fill_state();
    // The viewport is filled once three items are on screen.
    let (res, report) = svc
        .auto_fill(&query, first, &mut fill, |r| r.items.len() < 3)
        .await;
    assert_eq!(report.fetched, 2);
    assert_eq!(report.halted, HaltReason::NotNearEnd);
    assert_eq!(res.items.len(), 3);
}

#[tokio::test(start_paused = true)]
async fn manual_load_more_appends() {
    let (_, svc) = paged_service(3, 3);
    let query = CatalogQuery::browse("srcX", "cat1", 1);
    let (first, _) = svc.browse_category("srcX", "cat1", 1).await.unwrap();
    let second = svc.load_more(&query, first).await.unwrap();
    assert_eq!(second.page, 2);
    assert_eq!(second.items.len(), 2);
    let third = svc.load_more(&query, second).await.unwrap();
    let done = svc.load_more(&query, third.clone()).await.unwrap();
    assert_eq!(done, third, "nothing more to load");
}
