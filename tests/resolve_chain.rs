// tests/resolve_chain.rs
//
// Identifier resolution over the HTTP backend with a scripted video-site API.
//
// Covered:
// - bare episode reference → one dependent lookup, first episode id
// - season link with 1-based episode index; out of range → NotFound, no fallthrough
// - show reference → show lookup then season lookup
// - item link with part index
// - upstream envelope errors, unresolvable input
// - comment feed fetched for the resolved id
// - successful resolutions are cached
// - camelCase input names from web clients
// - malformed explicit ids never reach the upstream API

use serde_json::json;
use std::sync::Arc;
use std::time::Duration;

use catalog_aggregator::cache::CacheStatus;
use catalog_aggregator::config::AppConfig;
use catalog_aggregator::registry::SourceRegistry;
use catalog_aggregator::resolve::{ResolveInput, Rule};
use catalog_aggregator::transport::StubTransport;
use catalog_aggregator::{CatalogError, CatalogService};

const API: &str = "http://bili.test";
const COMMENTS: &str = "http://comment.test";

fn zero() -> Duration {
    Duration::ZERO
}

fn api_stub() -> StubTransport {
    StubTransport::new()
        .json(
            "http://bili.test/pgc/view/web/season?ep_id=123456",
            zero(),
            json!({"code": 0, "result": {"episodes": [{"cid": 998877}, {"cid": 2}]}}),
        )
        .json(
            "http://bili.test/pgc/web/season/section?season_id=4242",
            zero(),
            json!({"code": 0, "result": {"main_section": {"episodes": [
                {"cid": 5001}, {"cid": 5002}, {"cid": "5003"}
            ]}}}),
        )
        .json(
            "http://bili.test/pgc/review/user?media_id=28229233",
            zero(),
            json!({"code": 0, "result": {"media": {"season_id": 4242}}}),
        )
        .json(
            "http://bili.test/x/web-interface/view?bvid=BV1xx411c7mD",
            zero(),
            json!({"code": 0, "data": {"pages": [{"cid": 71}, {"cid": 72}]}}),
        )
        .json(
            "http://bili.test/x/web-interface/view?bvid=BV1gone00000",
            zero(),
            json!({"code": -404, "message": "啥都木有"}),
        )
        .route(
            "http://comment.test/998877.xml",
            zero(),
            catalog_aggregator::transport::StubReply::Respond {
                status: 200,
                body: r#"<?xml version="1.0"?><i><d p="1">hi</d></i>"#.into(),
            },
        )
}

fn setup() -> (Arc<StubTransport>, CatalogService) {
    let stub = Arc::new(api_stub());
    let config = AppConfig {
        resolver_api_base: API.into(),
        resolver_comment_base: COMMENTS.into(),
        ..AppConfig::default()
    };
    let svc = CatalogService::new(config, SourceRegistry::default(), stub.clone());
    (stub, svc)
}

#[tokio::test]
async fn bare_episode_reference_needs_one_lookup() {
    let (stub, svc) = setup();
    let (id, _) = svc
        .resolve_identifier(&ResolveInput::link("ep123456"))
        .await
        .unwrap();
    assert_eq!(id.canonical_id, "998877");
    assert_eq!(id.rule, Rule::Episode);
    assert_eq!(stub.calls().len(), 1);
    assert_eq!(stub.calls_to("http://bili.test/pgc/web/season/section"), 0);
    assert_eq!(stub.calls_to("http://bili.test/pgc/review/user"), 0);
}

#[tokio::test]
async fn season_link_selects_episode_by_one_based_index() {
    let (_, svc) = setup();
    let mut input = ResolveInput::link("https://www.bilibili.com/bangumi/play/ss4242");
    input.ep = Some(3);
    let (id, _) = svc.resolve_identifier(&input).await.unwrap();
    assert_eq!(id.canonical_id, "5003");
    assert_eq!(id.rule, Rule::Season);
}

#[tokio::test]
async fn out_of_range_episode_is_terminal_not_found() {
    let (stub, svc) = setup();
    let mut input = ResolveInput::link("https://www.bilibili.com/bangumi/play/ss4242");
    input.ep = Some(4);
    // Would resolve if the chain fell through to the explicit id.
    input.explicit_id = Some("1".into());
    let err = svc.resolve_identifier(&input).await.unwrap_err();
    assert!(matches!(err, CatalogError::NotFound(_)), "got {err:?}");
    assert_eq!(err.status_code(), 404);
    assert_eq!(stub.calls().len(), 1);
}

#[tokio::test]
async fn show_reference_resolves_through_its_season() {
    let (stub, svc) = setup();
    let mut input = ResolveInput::link("https://www.bilibili.com/bangumi/media/md28229233/");
    input.ep = Some(2);
    let (id, _) = svc.resolve_identifier(&input).await.unwrap();
    assert_eq!(id.canonical_id, "5002");
    assert_eq!(id.rule, Rule::Show);
    let calls = stub.calls();
    assert_eq!(calls.len(), 2);
    assert!(calls[0].contains("media_id=28229233"));
    assert!(calls[1].contains("season_id=4242"));
}

#[tokio::test]
async fn item_link_and_explicit_item_field() {
    let (_, svc) = setup();
    let (id, _) = svc
        .resolve_identifier(&ResolveInput::link(
            "https://www.bilibili.com/video/BV1xx411c7mD?p=2",
        ))
        .await
        .unwrap();
    assert_eq!(id.canonical_id, "72");

    let input = ResolveInput {
        item_id: Some("BV1xx411c7mD".into()),
        ..ResolveInput::default()
    };
    let (id, _) = svc.resolve_identifier(&input).await.unwrap();
    assert_eq!(id.canonical_id, "71");
    assert_eq!(id.rule, Rule::ExplicitFields);

    let input = ResolveInput {
        item_id: Some("BV1xx411c7mD".into()),
        p: Some(3),
        ..ResolveInput::default()
    };
    assert!(matches!(
        svc.resolve_identifier(&input).await,
        Err(CatalogError::NotFound(_))
    ));
}

#[tokio::test]
async fn upstream_errors_and_unresolvable_input() {
    let (_, svc) = setup();
    let err = svc
        .resolve_identifier(&ResolveInput::link("https://www.bilibili.com/video/BV1gone00000"))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), "http");

    let err = svc
        .resolve_identifier(&ResolveInput::link("https://example.com/watch/42"))
        .await
        .unwrap_err();
    assert!(matches!(err, CatalogError::Unresolvable(_)));
    assert_eq!(err.status_code(), 422);

    let err = svc
        .resolve_identifier(&ResolveInput::default())
        .await
        .unwrap_err();
    assert!(matches!(err, CatalogError::Unresolvable(_)));
}

#[tokio::test]
async fn comment_feed_follows_resolution() {
    let (stub, svc) = setup();
    let (id, xml) = svc
        .fetch_comment_feed(&ResolveInput::link("https://www.bilibili.com/bangumi/play/ep123456"))
        .await
        .unwrap();
    assert_eq!(id.canonical_id, "998877");
    assert!(xml.contains("<d p=\"1\">hi</d>"));
    assert_eq!(stub.calls_to(COMMENTS), 1);

    // No stub route for this id's feed → network error surfaces.
    let input = ResolveInput {
        explicit_id: Some("1".into()),
        ..ResolveInput::default()
    };
    assert!(svc.fetch_comment_feed(&input).await.is_err());
}

#[tokio::test]
async fn resolutions_are_cached() {
    let (stub, svc) = setup();
    let input = ResolveInput::link("ep123456");
    let (_, s1) = svc.resolve_identifier(&input).await.unwrap();
    let (_, s2) = svc.resolve_identifier(&input).await.unwrap();
    assert_eq!((s1, s2), (CacheStatus::Miss, CacheStatus::Hit));
    assert_eq!(stub.calls().len(), 1);
}

#[tokio::test]
async fn episode_path_input_needs_one_lookup() {
    let (stub, svc) = setup();
    let input: ResolveInput = serde_json::from_value(json!({"episodePath": "ep123456"})).unwrap();
    let (id, _) = svc.resolve_identifier(&input).await.unwrap();
    assert_eq!(id.canonical_id, "998877");
    assert_eq!(id.rule, Rule::Episode);
    assert_eq!(stub.calls(), vec!["http://bili.test/pgc/view/web/season?ep_id=123456"]);

    let input: ResolveInput =
        serde_json::from_value(json!({"seasonId": "4242", "episodeIndex": 2})).unwrap();
    let (id, _) = svc.resolve_identifier(&input).await.unwrap();
    assert_eq!(id.canonical_id, "5002");
    assert_eq!(id.rule, Rule::ExplicitFields);
}

#[tokio::test]
async fn malformed_explicit_ids_are_rejected_before_any_call() {
    let (stub, svc) = setup();
    let item = ResolveInput {
        item_id: Some("BV1&x=evil".into()),
        ..ResolveInput::default()
    };
    let err = svc.resolve_identifier(&item).await.unwrap_err();
    assert_eq!(err.status_code(), 422);

    let traversal = ResolveInput {
        explicit_id: Some("../admin/secret?".into()),
        ..ResolveInput::default()
    };
    assert!(matches!(
        svc.fetch_comment_feed(&traversal).await,
        Err(CatalogError::Unresolvable(_))
    ));
    assert!(stub.calls().is_empty(), "nothing reached upstream: {:?}", stub.calls());
}
