//! Integration tests for the server lifecycle.

use std::convert::Infallible;
use std::future::{ready, Ready};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};

use callguard::config::ServerSettings;
use callguard::logging::{LogLevel, MemorySink};
use callguard::server::{GrpcServer, ServerError};
use tonic::body::Body;
use tonic::codegen::http;
use tonic::server::NamedService;
use tower::{BoxError, Service};

/// Service answering every request with an empty response.
#[derive(Clone)]
struct Ping;

impl NamedService for Ping {
    const NAME: &'static str = "ping.v1.Ping";
}

impl Service<http::Request<Body>> for Ping {
    type Response = http::Response<Body>;
    type Error = Infallible;
    type Future = Ready<Result<Self::Response, Self::Error>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, _request: http::Request<Body>) -> Self::Future {
        ready(Ok(http::Response::new(Body::default())))
    }
}

fn settings(address: &str) -> ServerSettings {
    ServerSettings {
        address: address.to_string(),
        shutdown_timeout_secs: 1,
    }
}

#[tokio::test]
async fn test_full_lifecycle() {
    let sink = Arc::new(MemorySink::new());
    let cleaned = Arc::new(AtomicBool::new(false));
    let cleaned_flag = Arc::clone(&cleaned);

    let result = GrpcServer::new(settings("127.0.0.1:0"))
        .with_sink(sink.clone())
        .with_registrar(|server| Ok(server.add_service(Ping)))
        .with_cleanup(move || async move {
            cleaned_flag.store(true, Ordering::SeqCst);
            Ok::<(), BoxError>(())
        })
        .run_until(async {})
        .await;

    assert!(result.is_ok());
    assert!(cleaned.load(Ordering::SeqCst));

    let info = sink.messages_at(LogLevel::Info);
    assert!(info[0].starts_with("server started at: 127.0.0.1:"));
    assert_eq!(
        &info[1..],
        [
            "shutting down server...",
            "initiating cleanup",
            "server successfully shutdown"
        ]
    );
}

#[tokio::test]
async fn test_cleanup_failure_is_logged_not_returned() {
    let sink = Arc::new(MemorySink::new());

    let result = GrpcServer::new(settings("127.0.0.1:0"))
        .with_sink(sink.clone())
        .with_registrar(|server| Ok(server.add_service(Ping)))
        .with_cleanup(|| async { Err::<(), BoxError>("pool already closed".into()) })
        .run_until(async {})
        .await;

    assert!(result.is_ok());
    assert!(sink
        .messages_at(LogLevel::Error)
        .contains(&"error during cleanup: pool already closed".to_string()));
    assert!(sink.contains("server successfully shutdown"));
}

#[tokio::test]
async fn test_listener_accepts_connections_until_shutdown() {
    let sink = Arc::new(MemorySink::new());

    let bound = GrpcServer::new(settings("127.0.0.1:0"))
        .with_sink(sink.clone())
        .with_registrar(|server| Ok(server.add_service(Ping)))
        .bind()
        .await
        .unwrap();
    let addr = bound.local_addr();
    assert_ne!(addr.port(), 0);

    let connected = Arc::new(AtomicBool::new(false));
    let connected_flag = Arc::clone(&connected);
    bound
        .serve_until(async move {
            let stream = tokio::net::TcpStream::connect(addr).await;
            connected_flag.store(stream.is_ok(), Ordering::SeqCst);
        })
        .await
        .unwrap();

    assert!(connected.load(Ordering::SeqCst));
    assert!(sink.contains(&format!("server started at: {addr}")));
}

#[tokio::test]
async fn test_invalid_address() {
    let sink = Arc::new(MemorySink::new());

    let err = GrpcServer::new(settings("not an address"))
        .with_sink(sink.clone())
        .with_registrar(|server| Ok(server.add_service(Ping)))
        .run_until(async {})
        .await
        .unwrap_err();

    assert!(matches!(err, ServerError::InvalidAddress { .. }));
    let errors = sink.messages_at(LogLevel::Error);
    assert_eq!(errors.len(), 1);
    assert!(errors[0].starts_with("FATAL invalid listen address not an address"));
}

#[tokio::test]
async fn test_address_in_use() {
    let taken = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let address = taken.local_addr().unwrap().to_string();
    let sink = Arc::new(MemorySink::new());

    let err = GrpcServer::new(settings(&address))
        .with_sink(sink.clone())
        .with_registrar(|server| Ok(server.add_service(Ping)))
        .run_until(async {})
        .await
        .unwrap_err();

    assert!(matches!(err, ServerError::Bind { .. }));
    assert!(sink.contains(&format!("FATAL error listening to {address}")));
}

#[tokio::test]
async fn test_registrar_failure() {
    let sink = Arc::new(MemorySink::new());
    let cleaned = Arc::new(AtomicBool::new(false));
    let cleaned_flag = Arc::clone(&cleaned);

    let err = GrpcServer::new(settings("127.0.0.1:0"))
        .with_sink(sink.clone())
        .with_registrar(|_server| Err("reflection descriptor missing".into()))
        .with_cleanup(move || async move {
            cleaned_flag.store(true, Ordering::SeqCst);
            Ok::<(), BoxError>(())
        })
        .run_until(async {})
        .await
        .unwrap_err();

    assert!(matches!(err, ServerError::Register(_)));
    assert_eq!(
        err.to_string(),
        "error registering services: reflection descriptor missing"
    );
    assert!(!cleaned.load(Ordering::SeqCst));
    assert!(sink.contains("FATAL error registering services"));
}

#[tokio::test]
async fn test_missing_registrar() {
    let sink = Arc::new(MemorySink::new());

    let err = GrpcServer::new(settings("127.0.0.1:0"))
        .with_sink(sink.clone())
        .run_until(async {})
        .await
        .unwrap_err();

    assert!(matches!(err, ServerError::MissingRegistrar));
}
