use std::time::Duration;

use httpmock::prelude::*;
use posthog::{Client, ClientConfig, DecisionSource, Error, EvaluationContext, FlagValue};
use serde_json::json;

const DEFINITIONS_PATH: &str = "/api/feature_flag/local_evaluation/";

fn init_logger() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn config(server: &MockServer) -> ClientConfig {
    ClientConfig::new("phc_test")
        .with_host(server.base_url())
        .with_personal_api_key("phx_test")
        .with_sync_mode(true)
        .with_feature_flag_events(false)
        .with_request_timeout(Duration::from_secs(2))
}

fn definitions() -> serde_json::Value {
    json!({
        "flags": [
            {
                "id": 1,
                "key": "pro-feature",
                "active": true,
                "filters": {
                    "groups": [{
                        "properties": [{"key": "plan", "value": ["pro", "enterprise"], "operator": "exact", "type": "person"}],
                        "rollout_percentage": 100
                    }],
                    "payloads": {"true": "{\"limit\": 10}"}
                }
            },
            {
                "id": 2,
                "key": "company-beta",
                "active": true,
                "filters": {
                    "aggregation_group_type_index": 0,
                    "groups": [{"properties": [], "rollout_percentage": 100}]
                }
            }
        ],
        "group_type_mapping": {"0": "company"},
        "cohorts": {}
    })
}

#[test]
fn polls_definitions_and_evaluates_locally() {
    init_logger();
    let server = MockServer::start();
    let poll = server.mock(|when, then| {
        when.method(GET)
            .path(DEFINITIONS_PATH)
            .query_param("token", "phc_test")
            .header("authorization", "Bearer phx_test");
        then.status(200).json_body(definitions());
    });
    let remote = server.mock(|when, then| {
        when.method(POST).path("/flags/");
        then.status(200).json_body(json!({"flags": {}}));
    });

    let client = Client::new(config(&server)).unwrap();
    client.wait_for_definitions().unwrap();
    poll.assert();

    let pro = EvaluationContext::new("user-1").with_person_property("plan", "pro");
    let decision = client.evaluate_flag("pro-feature", &pro).unwrap();
    assert_eq!(decision.value, FlagValue::Boolean(true));
    assert_eq!(decision.source, DecisionSource::Local);
    assert_eq!(decision.payload, Some(json!({"limit": 10})));

    let free = EvaluationContext::new("user-2").with_person_property("plan", "free");
    assert_eq!(client.is_feature_enabled("pro-feature", &free), Some(false));

    let member = EvaluationContext::new("user-1").with_group("company", "acme");
    assert_eq!(client.is_feature_enabled("company-beta", &member), Some(true));

    remote.assert_hits(0);
    client.shutdown().unwrap();
}

#[test]
fn missing_property_falls_back_to_remote() {
    init_logger();
    let server = MockServer::start();
    server.mock(|when, then| {
        when.method(GET).path(DEFINITIONS_PATH);
        then.status(200).json_body(definitions());
    });
    let remote = server.mock(|when, then| {
        when.method(POST)
            .path("/flags/")
            .query_param("v", "2")
            .json_body_partial(r#"{"distinct_id": "user-3", "flag_keys_to_evaluate": ["pro-feature"]}"#);
        then.status(200).json_body(json!({
            "flags": {"pro-feature": {"key": "pro-feature", "enabled": true, "reason": {"code": "condition_match", "description": "Matched condition set 1"}}}
        }));
    });

    let client = Client::new(config(&server)).unwrap();
    client.wait_for_definitions().unwrap();

    let decision = client
        .evaluate_flag("pro-feature", &EvaluationContext::new("user-3"))
        .unwrap();
    assert_eq!(decision.source, DecisionSource::Remote);
    assert!(decision.value.is_enabled());
    remote.assert_hits(1);
}

#[test]
fn get_all_flags_uses_local_results() {
    init_logger();
    let server = MockServer::start();
    server.mock(|when, then| {
        when.method(GET).path(DEFINITIONS_PATH);
        then.status(200).json_body(definitions());
    });

    let client = Client::new(config(&server).with_only_evaluate_locally(true)).unwrap();
    client.wait_for_definitions().unwrap();

    let context = EvaluationContext::new("user-1")
        .with_person_property("plan", "enterprise")
        .with_group("company", "acme");
    let all = client.get_all_flags_and_payloads(&context);
    assert_eq!(all.flags.len(), 2);
    assert_eq!(all.flags["pro-feature"], FlagValue::Boolean(true));
    assert_eq!(all.payloads["pro-feature"], json!({"limit": 10}));

    let only_pro = client.get_all_flags(&context.with_flag_keys(["pro-feature"]));
    assert_eq!(only_pro.keys().collect::<Vec<_>>(), ["pro-feature"]);
}

#[test]
fn invalid_personal_api_key_is_surfaced() {
    init_logger();
    let server = MockServer::start();
    let poll = server.mock(|when, then| {
        when.method(GET).path(DEFINITIONS_PATH);
        then.status(401).json_body(json!({"detail": "Invalid personal API key."}));
    });

    let client = Client::new(config(&server).with_poll_interval(Duration::from_millis(10))).unwrap();
    assert!(matches!(client.wait_for_definitions(), Err(Error::Unauthorized)));

    // The poller stops instead of retrying.
    std::thread::sleep(Duration::from_millis(100));
    poll.assert_hits(1);
    client.shutdown().unwrap();
}

#[test]
fn unreachable_server_without_cache_yields_nothing() {
    init_logger();
    let client = Client::new(
        ClientConfig::new("phc_test")
            .with_host("http://127.0.0.1:1")
            .with_personal_api_key("phx_test")
            .with_sync_mode(true)
            .with_max_retries(0)
            .with_request_timeout(Duration::from_secs(1)),
    )
    .unwrap();

    assert!(matches!(client.wait_for_definitions(), Err(Error::Network(_))));
    assert_eq!(
        client.evaluate_flag("pro-feature", &EvaluationContext::new("user-1")),
        None
    );
}

#[test]
fn quota_limited_definitions_fall_back_to_remote() {
    init_logger();
    let server = MockServer::start();
    server.mock(|when, then| {
        when.method(GET).path(DEFINITIONS_PATH);
        then.status(402).json_body(json!({"detail": "quota limited"}));
    });
    let remote = server.mock(|when, then| {
        when.method(POST).path("/flags/");
        then.status(200).json_body(json!({
            "flags": {"pro-feature": {"key": "pro-feature", "enabled": false}}
        }));
    });

    let client = Client::new(config(&server)).unwrap();
    assert!(matches!(client.wait_for_definitions(), Err(Error::QuotaLimited)));

    let context = EvaluationContext::new("user-1").with_person_property("plan", "pro");
    assert_eq!(client.is_feature_enabled("pro-feature", &context), Some(false));
    remote.assert_hits(1);
}
