//! Owns the running session and serves it over HTTP.
//!
//! The coordinator builds the registry, starts the broadcast dispatcher,
//! creates the orchestrator with a shutdown flag, and exposes the gateway
//! routes. Plain TCP goes through `axum::serve`; TLS through `axum-server`.

use crate::broadcast::Dispatcher;
use crate::config::SessionSettings;
use crate::network::{self, Gateway};
use crate::orchestrator::Orchestrator;
use crate::registry::Registry;
use crate::trivia::QuestionProvider;
use axum::Router;
use axum_server::tls_rustls::RustlsConfig;
use log::info;
use mosaic_shared::BROADCAST_QUEUE_CAPACITY;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::watch;

const TLS_DRAIN_SECS: u64 = 5;

pub struct Coordinator {
    gateway: Arc<Gateway>,
    shutdown: watch::Sender<bool>,
}

impl Coordinator {
    /// Must be called inside a tokio runtime; the dispatcher task starts here.
    pub fn new(
        settings: SessionSettings,
        questions: Arc<dyn QuestionProvider>,
        host_token: String,
        origins: Vec<String>,
    ) -> Self {
        let registry = Arc::new(Registry::new(settings.max_players));
        let (dispatcher, _) = Dispatcher::spawn(Arc::clone(&registry), BROADCAST_QUEUE_CAPACITY);
        let (shutdown, shutdown_rx) = watch::channel(false);
        let orchestrator = Arc::new(Orchestrator::new(
            registry,
            dispatcher,
            questions,
            settings,
            shutdown_rx,
        ));

        Self {
            gateway: Arc::new(Gateway::new(orchestrator, host_token, origins)),
            shutdown,
        }
    }

    pub fn orchestrator(&self) -> &Arc<Orchestrator> {
        self.gateway.orchestrator()
    }

    pub fn router(&self) -> Router {
        network::router(Arc::clone(&self.gateway))
    }

    /// Stops every orchestrator timer and starts graceful server shutdown.
    pub fn shutdown(&self) {
        if !self.shutdown.send_replace(true) {
            info!("Shutdown requested");
        }
    }

    pub fn is_shutting_down(&self) -> bool {
        *self.shutdown.borrow()
    }

    fn shutdown_signal(&self) -> impl Future<Output = ()> + Send + 'static {
        let mut flag = self.shutdown.subscribe();
        async move {
            let _ = flag.wait_for(|stopped| *stopped).await;
        }
    }

    pub async fn serve(&self, listener: TcpListener) -> std::io::Result<()> {
        info!("Listening on ws://{}", listener.local_addr()?);
        axum::serve(listener, self.router())
            .with_graceful_shutdown(self.shutdown_signal())
            .await
    }

    pub async fn serve_tls(&self, address: SocketAddr, tls: RustlsConfig) -> std::io::Result<()> {
        let handle = axum_server::Handle::new();
        let signal = self.shutdown_signal();
        let drain = handle.clone();
        tokio::spawn(async move {
            signal.await;
            drain.graceful_shutdown(Some(Duration::from_secs(TLS_DRAIN_SECS)));
        });

        info!("Listening on wss://{}", address);
        axum_server::bind_rustls(address, tls)
            .handle(handle)
            .serve(self.router().into_make_service())
            .await
    }
}
