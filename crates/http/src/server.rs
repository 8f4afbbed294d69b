use crate::error::Error;

use std::future::IntoFuture;
use std::net::SocketAddr;
use std::sync::Arc;

use axum::Router;
use parking_lot::Mutex;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{error, info};

/// Plain HTTP server for the subscription API.
#[derive(Clone)]
pub struct HttpServer {
    listen_addr: SocketAddr,
    local_addr: Arc<Mutex<Option<SocketAddr>>>,
    shutdown_token: CancellationToken,
    task_tracker: TaskTracker,
}

impl HttpServer {
    /// Creates a new server that will listen on `listen_addr` once started.
    #[must_use]
    pub fn new(listen_addr: SocketAddr) -> Self {
        Self {
            listen_addr,
            local_addr: Arc::new(Mutex::new(None)),
            shutdown_token: CancellationToken::new(),
            task_tracker: TaskTracker::new(),
        }
    }

    /// The address actually bound, once started. Differs from the listen
    /// address when port 0 was requested.
    #[must_use]
    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.local_addr.lock()
    }

    /// Binds the listener and serves `router` until [`Self::shutdown`].
    ///
    /// # Errors
    ///
    /// Returns [`Error::AlreadyStarted`] on a second call and
    /// [`Error::Bind`] if the address cannot be bound.
    pub async fn start(&self, router: Router) -> Result<JoinHandle<()>, Error> {
        if self.task_tracker.is_closed() {
            return Err(Error::AlreadyStarted);
        }
        self.task_tracker.close();

        let listener = TcpListener::bind(self.listen_addr)
            .await
            .map_err(|source| Error::Bind {
                addr: self.listen_addr,
                source,
            })?;

        let local_addr = listener.local_addr().map_err(|source| Error::Bind {
            addr: self.listen_addr,
            source,
        })?;
        *self.local_addr.lock() = Some(local_addr);

        info!(%local_addr, "http server listening");

        let shutdown_token = self.shutdown_token.clone();
        let handle = self.task_tracker.spawn(async move {
            tokio::select! {
                result = axum::serve(listener, router.into_make_service()).into_future() => {
                    if let Err(e) = result {
                        error!(error = %e, "http server exited");
                    }
                }
                () = shutdown_token.cancelled() => {}
            }
        });

        Ok(handle)
    }

    /// Stops serving and waits for the server task to finish.
    pub async fn shutdown(&self) {
        info!("http server shutting down...");

        self.shutdown_token.cancel();
        self.task_tracker.wait().await;

        info!("http server shutdown");
    }
}
