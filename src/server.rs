//! gRPC server lifecycle
//!
//! [`GrpcServer`] binds the listener, lets the caller register services, serves until a
//! shutdown signal arrives, drains in-flight calls and finally runs a cleanup operation.
//!
//! ```no_run
//! use std::sync::Arc;
//! use callguard::config::CallguardConfig;
//! use callguard::logging::TracingSink;
//! use callguard::server::GrpcServer;
//!
//! # use tonic::transport::{server::Router, Server};
//! # async fn run(
//! #     register: impl FnOnce(&mut Server) -> Router + Send + 'static,
//! # ) -> Result<(), callguard::server::ServerError> {
//! let config = CallguardConfig::from_env().unwrap_or_default();
//! GrpcServer::new(config.server)
//!     .with_sink(Arc::new(TracingSink::new()))
//!     .with_registrar(move |server| Ok(register(server)))
//!     .with_cleanup(|| async { Ok(()) })
//!     .run()
//!     .await
//! # }
//! ```

use std::future::Future;
use std::net::{AddrParseError, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use thiserror::Error;
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tokio_stream::wrappers::TcpListenerStream;
use tonic::transport::server::Router;
use tonic::transport::Server;
use tower::BoxError;

use crate::config::ServerSettings;
use crate::logging::{LogSink, TracingSink};

/// Registers services on the server builder.
pub type Registrar = Box<dyn FnOnce(&mut Server) -> Result<Router, BoxError> + Send>;

/// Runs once after the server stopped serving.
pub type Cleanup = Box<dyn FnOnce() -> BoxFuture<'static, Result<(), BoxError>> + Send>;

/// Errors that stop the server from starting or serving.
#[derive(Debug, Error)]
pub enum ServerError {
    /// The configured address is not a socket address.
    #[error("invalid listen address {address}: {source}")]
    InvalidAddress {
        address: String,
        #[source]
        source: AddrParseError,
    },

    /// The listener could not be bound.
    #[error("error listening to {address}: {source}")]
    Bind {
        address: String,
        #[source]
        source: std::io::Error,
    },

    /// No registrar was configured.
    #[error("no service registrar configured")]
    MissingRegistrar,

    /// The registrar failed.
    #[error("error registering services: {0}")]
    Register(#[source] BoxError),

    /// The transport failed while serving.
    #[error("failed to serve: {0}")]
    Serve(#[from] tonic::transport::Error),
}

/// Server lifecycle around a `tonic` router.
pub struct GrpcServer {
    settings: ServerSettings,
    sink: Arc<dyn LogSink>,
    builder: Server,
    registrar: Option<Registrar>,
    cleanup: Option<Cleanup>,
}

impl GrpcServer {
    /// Creates a server logging through `tracing`.
    pub fn new(settings: ServerSettings) -> Self {
        Self {
            settings,
            sink: Arc::new(TracingSink::new()),
            builder: Server::builder(),
            registrar: None,
            cleanup: None,
        }
    }

    /// Sets the sink used for lifecycle messages.
    pub fn with_sink(mut self, sink: Arc<dyn LogSink>) -> Self {
        self.sink = sink;
        self
    }

    /// Replaces the transport builder, e.g. to set timeouts or concurrency limits.
    pub fn with_builder(mut self, builder: Server) -> Self {
        self.builder = builder;
        self
    }

    /// Sets the function registering services.
    pub fn with_registrar<F>(mut self, registrar: F) -> Self
    where
        F: FnOnce(&mut Server) -> Result<Router, BoxError> + Send + 'static,
    {
        self.registrar = Some(Box::new(registrar));
        self
    }

    /// Sets the operation run after shutdown. Its failure is logged, not returned.
    pub fn with_cleanup<F, Fut>(mut self, cleanup: F) -> Self
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<(), BoxError>> + Send + 'static,
    {
        self.cleanup = Some(Box::new(move || -> BoxFuture<'static, Result<(), BoxError>> {
            Box::pin(cleanup())
        }));
        self
    }

    /// Binds the listener and registers services.
    pub async fn bind(mut self) -> Result<BoundServer, ServerError> {
        let sink = Arc::clone(&self.sink);
        let fatal = |err: ServerError| {
            sink.fatal(format_args!("{err}"));
            err
        };

        let address: SocketAddr =
            self.settings
                .address
                .parse()
                .map_err(|source| ServerError::InvalidAddress {
                    address: self.settings.address.clone(),
                    source,
                })
                .map_err(fatal)?;

        let listener = TcpListener::bind(address)
            .await
            .map_err(|source| ServerError::Bind {
                address: self.settings.address.clone(),
                source,
            })
            .map_err(fatal)?;
        let local_addr = listener.local_addr().unwrap_or(address);

        let registrar = self
            .registrar
            .take()
            .ok_or(ServerError::MissingRegistrar)
            .map_err(fatal)?;
        let router = registrar(&mut self.builder)
            .map_err(ServerError::Register)
            .map_err(fatal)?;

        Ok(BoundServer {
            listener,
            local_addr,
            router,
            drain_timeout: Duration::from_secs(self.settings.shutdown_timeout_secs),
            sink: self.sink,
            cleanup: self.cleanup,
        })
    }

    /// Serves until SIGINT or SIGTERM.
    pub async fn run(self) -> Result<(), ServerError> {
        let sink = Arc::clone(&self.sink);
        self.run_until(shutdown_signal(sink)).await
    }

    /// Serves until `shutdown` completes.
    pub async fn run_until<F>(self, shutdown: F) -> Result<(), ServerError>
    where
        F: Future<Output = ()>,
    {
        self.bind().await?.serve_until(shutdown).await
    }
}

/// A server with its listener bound and services registered.
pub struct BoundServer {
    listener: TcpListener,
    local_addr: SocketAddr,
    router: Router,
    drain_timeout: Duration,
    sink: Arc<dyn LogSink>,
    cleanup: Option<Cleanup>,
}

impl BoundServer {
    /// The address the listener is bound to.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Serves until `shutdown` completes, then drains and cleans up.
    pub async fn serve_until<F>(self, shutdown: F) -> Result<(), ServerError>
    where
        F: Future<Output = ()>,
    {
        let Self {
            listener,
            local_addr,
            router,
            drain_timeout,
            sink,
            cleanup,
        } = self;

        let (drain_tx, drain_rx) = oneshot::channel::<()>();
        let serve = router.serve_with_incoming_shutdown(TcpListenerStream::new(listener), async {
            let _ = drain_rx.await;
        });
        tokio::pin!(serve);
        tokio::pin!(shutdown);

        sink.info(format_args!("server started at: {local_addr}"));

        tokio::select! {
            served = &mut serve => {
                if let Err(err) = served {
                    let err = ServerError::from(err);
                    sink.fatal(format_args!("{err}"));
                    return Err(err);
                }
            }
            () = &mut shutdown => {
                sink.info(format_args!("shutting down server..."));
                let _ = drain_tx.send(());
                match tokio::time::timeout(drain_timeout, &mut serve).await {
                    Ok(Ok(())) => {}
                    Ok(Err(err)) => sink.error(format_args!("error while draining calls: {err}")),
                    Err(_) => sink.warn(format_args!(
                        "calls still in flight after {drain_timeout:?}, stopping anyway"
                    )),
                }
            }
        }

        if let Some(cleanup) = cleanup {
            sink.info(format_args!("initiating cleanup"));
            if let Err(err) = cleanup().await {
                sink.error(format_args!("error during cleanup: {err}"));
            }
        }

        sink.info(format_args!("server successfully shutdown"));
        Ok(())
    }
}

/// Completes on SIGINT or, on unix, SIGTERM.
pub async fn shutdown_signal(sink: Arc<dyn LogSink>) {
    let interrupt = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            sink.error(format_args!("failed to listen for SIGINT: {err}"));
            futures::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(err) => {
                sink.error(format_args!("failed to listen for SIGTERM: {err}"));
                futures::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = futures::future::pending::<()>();

    tokio::select! {
        () = interrupt => {}
        () = terminate => {}
    }
}
