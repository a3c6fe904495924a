//! Both routers driven end to end over the in-memory bus: one process
//! hosting a service and a separate connection acting as caller.

use std::error::Error;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use buskit_core::{Auth, ExternalRequest, ExternalResponse, InternalRequest, InternalResponse, User, Value};
use buskit_server::bus::{ConnectionManager, MemoryBus};
use buskit_server::service::{
    setup_status, ErrorNotifier, ExternalClient, ExternalRouter, HandlerContext, InternalClient,
    InternalRouter, ServiceConfig, ServiceContext,
};
use buskit_server::ConnectionError;
use http::{Method, StatusCode};
use parking_lot::Mutex;

const TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Default)]
struct CountingNotifier {
    errors: Mutex<Vec<String>>,
    warnings: Mutex<Vec<String>>,
}

impl ErrorNotifier for CountingNotifier {
    fn notify_error(&self, err: &(dyn Error + 'static), _meta: &serde_json::Value) {
        self.errors.lock().push(err.to_string());
    }

    fn notify_warning(&self, err: &(dyn Error + 'static), _meta: &serde_json::Value) {
        self.warnings.lock().push(err.to_string());
    }
}

struct Harness {
    bus: MemoryBus,
    service: ServiceContext,
    notifier: Arc<CountingNotifier>,
}

impl Harness {
    async fn start() -> Self {
        let bus = MemoryBus::new();
        let connection = ConnectionManager::new(Arc::new(bus.connector()), Duration::from_millis(10));
        connection.connect(&[], "users-service").await;
        let notifier = Arc::new(CountingNotifier::default());
        let service =
            ServiceContext::new(connection, ServiceConfig::default()).with_notifier(notifier.clone());
        Self {
            bus,
            service,
            notifier,
        }
    }

    async fn caller(&self) -> Arc<ConnectionManager> {
        let connection = ConnectionManager::new(Arc::new(self.bus.connector()), Duration::from_millis(10));
        connection.connect(&[], "gateway").await;
        connection
    }

    async fn internal_client(&self) -> InternalClient {
        InternalClient::new(self.caller().await, TIMEOUT)
    }

    async fn external_client(&self) -> ExternalClient {
        ExternalClient::new(self.caller().await, TIMEOUT)
    }
}

fn signed_in(mut request: ExternalRequest) -> ExternalRequest {
    let auth = Auth {
        plain_token: "t0k3n".to_string(),
        user: Some(User {
            email: "ada@example.com".to_string(),
            ..User::default()
        }),
        ..Auth::default()
    };
    request.set_auth(&auth).unwrap();
    request
}

#[tokio::test]
async fn internal_get_user_reads_arguments() {
    let harness = Harness::start().await;
    let router = InternalRouter::queue_subscribe(&harness.service, "users").await.unwrap();
    router.add_handler("GetUser", |_ctx: HandlerContext, req: InternalRequest| async move {
        let id = req.param("id").and_then(Value::as_str).unwrap_or_default().to_string();
        let user: Value = [("id", Value::from(id)), ("name", Value::from("Ada"))]
            .into_iter()
            .collect();
        Ok(InternalResponse::ok(user))
    });

    let client = harness.internal_client().await;
    let args: Value = [("id", Value::from("42"))].into_iter().collect();
    let resp = client
        .request_reply(&InternalRequest::new("users", "GetUser", args))
        .await
        .unwrap();

    assert!(resp.error.is_none());
    let body = resp.body.unwrap();
    assert_eq!(body.get("id").and_then(Value::as_str), Some("42"));
    assert_eq!(body.get("name").and_then(Value::as_str), Some("Ada"));
}

#[tokio::test]
async fn internal_structured_arguments_round_trip() {
    let harness = Harness::start().await;
    let router = InternalRouter::subscribe(&harness.service, "echo").await.unwrap();
    router.add_handler("Echo", |_ctx: HandlerContext, req: InternalRequest| async move {
        Ok(InternalResponse::ok(req.arguments))
    });

    let nested: Value = [
        ("flag", Value::Bool(true)),
        ("count", Value::Int(-3)),
        ("ratio", Value::Float(0.5)),
        ("precise", Value::Float(914_817_646.630_354_5)),
        ("big", Value::UInt(u64::MAX)),
        ("tags", Value::Array(vec![Value::from("a"), Value::Null])),
        ("inner", [("k", Value::from("v"))].into_iter().collect()),
    ]
    .into_iter()
    .collect();

    let resp = harness
        .internal_client()
        .await
        .request_reply(&InternalRequest::new("echo", "Echo", nested.clone()))
        .await
        .unwrap();
    assert_eq!(resp.body, Some(nested));
}

#[tokio::test]
async fn internal_unknown_function_and_status() {
    let harness = Harness::start().await;
    let router = InternalRouter::queue_subscribe(&harness.service, "users").await.unwrap();
    setup_status(&router, None);
    let client = harness.internal_client().await;

    let resp = client
        .request_reply(&InternalRequest::new("users", "Nope", Value::Null))
        .await
        .unwrap();
    assert_eq!(resp.error.as_deref(), Some("handler not found"));

    let resp = client
        .request_reply(&InternalRequest::new("users", "Status", Value::Null))
        .await
        .unwrap();
    assert_eq!(resp.body, Some(Value::from("OK")));
}

#[tokio::test]
async fn external_user_route_matches_and_misses() {
    let harness = Harness::start().await;
    let router = ExternalRouter::queue_subscribe(&harness.service, "users").await.unwrap();
    router
        .add_handler(Method::GET, "/users/(?P<id>[^/]+)", |_ctx, req: ExternalRequest| async move {
            ExternalResponse::success(req.param("id").unwrap_or_default())
        })
        .unwrap();
    let client = harness.external_client().await;

    let resp = client
        .request_reply(&signed_in(ExternalRequest::new("users", "GET", "/users/42")))
        .await
        .unwrap();
    assert_eq!(resp.status_code(), StatusCode::OK);
    assert_eq!(resp.body, Some(Value::from("42")));

    let resp = client
        .request_reply(&signed_in(ExternalRequest::new("users", "GET", "/users/")))
        .await
        .unwrap();
    assert_eq!(resp.status_code(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn external_auth_is_enforced_before_handler() {
    let harness = Harness::start().await;
    let router = ExternalRouter::queue_subscribe(&harness.service, "users").await.unwrap();
    let calls = Arc::new(AtomicU32::new(0));
    let counter = calls.clone();
    router
        .add_handler(Method::GET, "/me", move |_ctx, req: ExternalRequest| {
            counter.fetch_add(1, Ordering::SeqCst);
            async move {
                let email = req
                    .auth
                    .and_then(|auth| auth.user)
                    .map(|user| user.email)
                    .unwrap_or_default();
                ExternalResponse::success(email)
            }
        })
        .unwrap();
    let client = harness.external_client().await;

    let resp = client
        .request_reply(&ExternalRequest::new("users", "GET", "/me"))
        .await
        .unwrap();
    assert_eq!(resp.status_code(), StatusCode::UNAUTHORIZED);
    assert_eq!(calls.load(Ordering::SeqCst), 0);

    let resp = client
        .request_reply(&signed_in(ExternalRequest::new("users", "GET", "/me")))
        .await
        .unwrap();
    assert_eq!(resp.status_code(), StatusCode::OK);
    assert_eq!(resp.body, Some(Value::from("ada@example.com")));
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn external_panic_gets_one_reply_and_one_notification() {
    let harness = Harness::start().await;
    let router = ExternalRouter::queue_subscribe(&harness.service, "users").await.unwrap();
    router
        .add_public_handler(Method::POST, "/crash", |_ctx, _req| async {
            let limits: Vec<u8> = Vec::new();
            ExternalResponse::success(i64::from(limits[1]))
        })
        .unwrap();
    let client = harness.external_client().await;

    let resp = client
        .request_reply(&ExternalRequest::new("users", "POST", "/crash"))
        .await
        .unwrap();
    assert_eq!(resp.status_code(), StatusCode::INTERNAL_SERVER_ERROR);
    assert!(resp.body.is_none());

    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(harness.notifier.errors.lock().len(), 1);
}

#[tokio::test]
async fn external_handler_uses_error_classifier() {
    let harness = Harness::start().await;
    let router = ExternalRouter::queue_subscribe(&harness.service, "users").await.unwrap();
    router
        .add_handler(Method::DELETE, "/users/(?P<id>[^/]+)", |ctx: HandlerContext, req: ExternalRequest| async move {
            match req.param_document_id("id") {
                Ok(_) => {
                    let err = anyhow::anyhow!("user not found");
                    ctx.respond_error(&err, serde_json::json!({ "path": req.path }))
                }
                Err(err) => ExternalResponse::bad_request(vec![err.to_string()]),
            }
        })
        .unwrap();
    let client = harness.external_client().await;

    let resp = client
        .request_reply(&signed_in(ExternalRequest::new("users", "DELETE", "/users/bogus")))
        .await
        .unwrap();
    assert_eq!(resp.status_code(), StatusCode::BAD_REQUEST);
    let errors = resp.body.unwrap();
    assert_eq!(
        errors.get("errors").and_then(Value::as_array).and_then(|e| e.first()).and_then(Value::as_str),
        Some("\"bogus\" is not a valid id")
    );

    let resp = client
        .request_reply(&signed_in(ExternalRequest::new(
            "users",
            "DELETE",
            "/users/5f1b2c3d4e5f6a7b8c9d0e1f",
        )))
        .await
        .unwrap();
    assert_eq!(resp.status_code(), StatusCode::NOT_FOUND);
    assert_eq!(harness.notifier.errors.lock().len(), 1);
}

#[tokio::test]
async fn subscribing_the_same_subject_twice_is_rejected() {
    let harness = Harness::start().await;
    InternalRouter::queue_subscribe(&harness.service, "users").await.unwrap();

    let err = InternalRouter::subscribe(&harness.service, "users")
        .await
        .err()
        .unwrap();
    assert!(matches!(err, ConnectionError::DuplicateActiveHandler { ref name } if name == "users.internal subscriber"));

    // Different namespace, different subject.
    ExternalRouter::queue_subscribe(&harness.service, "users").await.unwrap();
}

#[tokio::test]
async fn subscriptions_survive_reconnect() {
    let bus = MemoryBus::new();
    let transport = bus.connect_client("users-service").unwrap();
    let connection = ConnectionManager::new(Arc::new(bus.connector()), Duration::from_millis(10));
    connection.set_connection(transport.clone()).await.unwrap();
    let service = ServiceContext::new(connection, ServiceConfig::default());

    let router = InternalRouter::queue_subscribe(&service, "users").await.unwrap();
    router.add_handler("Ping", |_ctx: HandlerContext, _req: InternalRequest| async {
        Ok(InternalResponse::ok("pong"))
    });
    assert_eq!(bus.subscriber_count("users.internal"), 1);

    transport.simulate_reconnect();
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(bus.subscriber_count("users.internal"), 1);

    let caller = ConnectionManager::new(Arc::new(bus.connector()), Duration::from_millis(10));
    caller.connect(&[], "caller").await;
    let resp = InternalClient::new(caller, TIMEOUT)
        .request_reply(&InternalRequest::new("users", "Ping", Value::Null))
        .await
        .unwrap();
    assert_eq!(resp.body, Some(Value::from("pong")));
}

#[tokio::test]
async fn connect_waits_for_bus_to_come_online() {
    let bus = MemoryBus::new();
    bus.set_online(false);
    let connection = ConnectionManager::new(Arc::new(bus.connector()), Duration::from_millis(10));
    let service = ServiceContext::new(connection.clone(), ServiceConfig::default());
    let router = InternalRouter::queue_subscribe(&service, "users").await.unwrap();
    router.add_handler("Ping", |_ctx: HandlerContext, _req: InternalRequest| async {
        Ok(InternalResponse::ok("pong"))
    });

    let connecting = tokio::spawn({
        let connection = connection.clone();
        async move { connection.connect(&["nats://bus:4222".to_string()], "users").await }
    });
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(!connection.is_connected());

    bus.set_online(true);
    connecting.await.unwrap();
    assert!(connection.is_connected());
    assert_eq!(bus.subscriber_count("users.internal"), 1);
}
