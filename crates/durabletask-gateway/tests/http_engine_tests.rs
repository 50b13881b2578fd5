//! HTTP engine client against a mock scheduler.

use std::sync::Arc;

use durabletask_gateway::credential::{AnonymousCredential, CredentialProvider, StaticTokenCredential};
use durabletask_gateway::inventory::InMemoryInventory;
use durabletask_gateway::prelude::*;
use serde_json::json;
use wiremock::matchers::{any, body_partial_json, header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn gateway(credential: Arc<dyn CredentialProvider>) -> TaskHubGateway {
    let resolver = ConnectionResolver::new(
        Arc::new(HttpEngineConnector::with_client(reqwest::Client::new())),
        credential,
    );
    TaskHubGateway::new(
        resolver,
        Arc::new(InMemoryInventory::new()),
        GatewayOptions {
            page_size: 2,
            max_concurrency: None,
        },
    )
}

fn authed() -> TaskHubGateway {
    gateway(Arc::new(StaticTokenCredential::new("test-token")))
}

#[tokio::test]
async fn test_list_instances_follows_continuation_tokens() {
    let mock_server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/v1/taskhubs/orders/instances/query"))
        .and(body_partial_json(json!({"continuationToken": "page-2"})))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "instances": [
                {"instanceId": "order-3", "name": "ProcessOrder", "runtimeStatus": "ORCHESTRATION_STATUS_COMPLETED", "output": 3}
            ]
        })))
        .expect(1)
        .mount(&mock_server)
        .await;

    Mock::given(method("POST"))
        .and(path("/v1/taskhubs/orders/instances/query"))
        .and(header("x-taskhub", "orders"))
        .and(header("Authorization", "Bearer test-token"))
        .and(body_partial_json(json!({"pageSize": 2, "fetchInputsAndOutputs": true})))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "instances": [
                {"instanceId": "order-1", "name": "ProcessOrder", "runtimeStatus": "Running", "input": {"id": 1}},
                {"instanceId": "order-2", "name": "ProcessOrder", "runtimeStatus": "Suspended"}
            ],
            "continuationToken": "page-2"
        })))
        .expect(1)
        .mount(&mock_server)
        .await;

    let instances = authed()
        .list_instances("orders", &mock_server.uri(), &CancellationToken::new())
        .await
        .unwrap();

    let ids: Vec<&str> = instances.iter().map(|i| i.instance_id.as_str()).collect();
    assert_eq!(ids, vec!["order-1", "order-2", "order-3"]);
    assert_eq!(instances[0].input, Some(json!({"id": 1})));
    assert_eq!(instances[1].status, OrchestrationStatus::Suspended);
    assert_eq!(instances[2].status, OrchestrationStatus::Completed);
}

#[tokio::test]
async fn test_undecodable_items_are_skipped() {
    let mock_server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/v1/taskhubs/orders/instances/query"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "instances": [
                {"instanceId": "good", "runtimeStatus": "Running"},
                {"name": "NoId"},
                {"instanceId": "bad", "runtimeStatus": 7}
            ]
        })))
        .mount(&mock_server)
        .await;

    let instances = authed()
        .list_instances("orders", &mock_server.uri(), &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(instances.len(), 1);
    assert_eq!(instances[0].instance_id, "good");
}

#[tokio::test]
async fn test_resolve_makes_no_network_call() {
    let mock_server = MockServer::start().await;
    Mock::given(any())
        .respond_with(ResponseTemplate::new(200))
        .expect(0)
        .mount(&mock_server)
        .await;

    let gateway = authed();
    gateway.resolver().resolve("orders", &mock_server.uri()).unwrap();
    gateway.resolver().resolve("orders", &mock_server.uri()).unwrap();
}

#[tokio::test]
async fn test_create_instance_sends_parsed_input() {
    let mock_server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/v1/taskhubs/orders/instances"))
        .and(body_partial_json(json!({"name": "ProcessOrder", "input": 42})))
        .respond_with(ResponseTemplate::new(201).set_body_json(json!({"instanceId": "abc123"})))
        .expect(1)
        .mount(&mock_server)
        .await;

    let created = authed()
        .create_instance(
            "orders",
            &mock_server.uri(),
            "ProcessOrder",
            Some("42"),
            None,
            &CancellationToken::new(),
        )
        .await
        .unwrap();

    assert_eq!(created.instance_id, "abc123");
}

#[tokio::test]
async fn test_create_instance_with_invalid_json_sends_nothing() {
    let mock_server = MockServer::start().await;
    Mock::given(any())
        .respond_with(ResponseTemplate::new(200))
        .expect(0)
        .mount(&mock_server)
        .await;

    let err = authed()
        .create_instance(
            "orders",
            &mock_server.uri(),
            "ProcessOrder",
            Some("{bad json"),
            None,
            &CancellationToken::new(),
        )
        .await
        .unwrap_err();

    assert!(err.is_invalid_argument());
}

#[tokio::test]
async fn test_terminate_reports_per_instance_failures() {
    let mock_server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/v1/taskhubs/orders/instances/a/terminate"))
        .and(body_partial_json(json!({"reason": "cleanup"})))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&mock_server)
        .await;

    Mock::given(method("POST"))
        .and(path("/v1/taskhubs/orders/instances/b/terminate"))
        .respond_with(ResponseTemplate::new(500).set_body_string("engine exploded"))
        .expect(1)
        .mount(&mock_server)
        .await;

    let ids = vec!["a".to_string(), "b".to_string()];
    let err = authed()
        .terminate_instances("orders", &mock_server.uri(), &ids, Some("cleanup"), &CancellationToken::new())
        .await
        .unwrap_err();

    let report = err.batch_report().expect("batch report");
    assert_eq!(report.succeeded, vec!["a"]);
    assert_eq!(report.failed.len(), 1);
    assert_eq!(report.failed[0].instance_id, "b");
    assert_eq!(report.failed[0].error.status(), Some(500));
}

#[tokio::test]
async fn test_delete_escapes_instance_ids_and_maps_not_found() {
    let mock_server = MockServer::start().await;

    Mock::given(method("DELETE"))
        .and(path("/v1/taskhubs/orders/instances/a%2Fb"))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&mock_server)
        .await;

    Mock::given(method("DELETE"))
        .and(path("/v1/taskhubs/orders/instances/missing"))
        .respond_with(ResponseTemplate::new(404).set_body_string("no such instance"))
        .expect(1)
        .mount(&mock_server)
        .await;

    let ids = vec!["a/b".to_string(), "missing".to_string()];
    let err = authed()
        .delete_instances("orders", &mock_server.uri(), &ids, &CancellationToken::new())
        .await
        .unwrap_err();

    let report = err.batch_report().expect("batch report");
    assert_eq!(report.succeeded, vec!["a/b"]);
    assert!(matches!(report.failed[0].error, UpstreamError::NotFound(_)));
}

#[tokio::test]
async fn test_continuation_token_cycle_is_an_error() {
    let mock_server = MockServer::start().await;

    for (token, next) in [("A", "B"), ("B", "A")] {
        Mock::given(method("POST"))
            .and(path("/v1/taskhubs/orders/instances/query"))
            .and(body_partial_json(json!({"continuationToken": token})))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "instances": [],
                "continuationToken": next
            })))
            .expect(1)
            .mount(&mock_server)
            .await;
    }

    Mock::given(method("POST"))
        .and(path("/v1/taskhubs/orders/instances/query"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "instances": [],
            "continuationToken": "A"
        })))
        .expect(1)
        .mount(&mock_server)
        .await;

    let err = authed()
        .list_instances("orders", &mock_server.uri(), &CancellationToken::new())
        .await
        .unwrap_err();
    assert_eq!(err.kind(), "UpstreamFailure");
    assert!(err.to_string().contains("'A' was already used"), "{err}");
}

#[tokio::test]
async fn test_dot_segments_never_reach_the_scheduler() {
    let mock_server = MockServer::start().await;

    Mock::given(any())
        .respond_with(ResponseTemplate::new(200))
        .expect(0)
        .mount(&mock_server)
        .await;

    let gateway = authed();
    let cancel = CancellationToken::new();

    let err = gateway
        .delete_instances("orders", &mock_server.uri(), &["..".to_string()], &cancel)
        .await
        .unwrap_err();
    assert!(err.is_invalid_argument(), "{err}");

    let err = gateway
        .terminate_instances("orders", &mock_server.uri(), &["a".to_string(), ".".to_string()], None, &cancel)
        .await
        .unwrap_err();
    assert!(err.is_invalid_argument(), "{err}");

    for hub in [".", ".."] {
        let err = gateway
            .suspend_instances(hub, &mock_server.uri(), &["a".to_string()], None, &cancel)
            .await
            .unwrap_err();
        assert!(err.is_invalid_argument(), "{hub}: {err}");
    }

    let err = gateway
        .create_instance("orders", &mock_server.uri(), "ProcessOrder", None, Some(".."), &cancel)
        .await
        .unwrap_err();
    assert!(err.is_invalid_argument(), "{err}");

    // The engine client refuses them too when called directly.
    let resolver = ConnectionResolver::new(
        Arc::new(HttpEngineConnector::with_client(reqwest::Client::new())),
        Arc::new(AnonymousCredential),
    );
    let handle = resolver.resolve("orders", &mock_server.uri()).unwrap();
    let direct = handle.engine().purge_instance("..").await.unwrap_err();
    assert!(matches!(direct, UpstreamError::Rejected(_)));
    let direct = handle.engine().terminate_instance(".", None).await.unwrap_err();
    assert!(matches!(direct, UpstreamError::Rejected(_)));

    assert!(mock_server.received_requests().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_anonymous_connection_sends_no_authorization() {
    let mock_server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/v1/taskhubs/local/instances/x/suspend"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&mock_server)
        .await;

    gateway(Arc::new(AnonymousCredential))
        .suspend_instances("local", &mock_server.uri(), &["x".to_string()], None, &CancellationToken::new())
        .await
        .unwrap();

    let requests = mock_server.received_requests().await.unwrap();
    assert_eq!(requests.len(), 1);
    assert!(requests[0].headers.get("authorization").is_none());
    assert_eq!(
        requests[0].headers.get("x-taskhub").unwrap().to_str().unwrap(),
        "local"
    );
}

#[tokio::test]
async fn test_query_server_error_is_upstream_failure() {
    let mock_server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/v1/taskhubs/orders/instances/query"))
        .respond_with(ResponseTemplate::new(503).set_body_string("maintenance"))
        .mount(&mock_server)
        .await;

    let err = authed()
        .list_instances("orders", &mock_server.uri(), &CancellationToken::new())
        .await
        .unwrap_err();

    assert_eq!(err.kind(), "UpstreamFailure");
    assert!(err.to_string().contains("ListInstances failed on 'orders'"));
}
