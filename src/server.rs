//! HTTP server and graceful shutdown.
//!
//! # Graceful shutdown and Kubernetes
//!
//! When Kubernetes terminates a pod it sends **SIGTERM** and waits
//! `terminationGracePeriodSeconds` (default 30 s) before sending SIGKILL.
//!
//! [`ServerHandle::stop`] (and [`Server::serve`] on a signal) reacts by:
//! 1. Immediately stopping `accept`: no new connections are made.
//! 2. Closing idle keep-alive connections and answering requests already in
//!    flight with `connection: close`.
//! 3. Waiting up to `drain_timeout` for those requests, then dropping the
//!    connections that are left.
//! 4. Stopping the worker threads.
//!
//! Keep `drain_timeout` below `terminationGracePeriodSeconds`.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpStream;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::conn::Connection;
use crate::error::Error;
use crate::listener::{Accepted, Listener};
use crate::pipeline::App;
use crate::router::Router;
use crate::scheduler::Scheduler;
use crate::shutdown::{self, Phase, Trigger, Watch};

/// How long accept pauses after the process ran out of descriptors, unless a
/// connection closes first.
const EXHAUSTED_BACKOFF: Duration = Duration::from_millis(100);

/// How long dropped connections get to unwind after the drain deadline.
const CLOSE_GRACE: Duration = Duration::from_secs(1);

/// The HTTP server.
pub struct Server {
    config: Config,
}

impl Server {
    pub fn new(config: Config) -> Self {
        Self { config }
    }

    /// A server on `addr` with every other setting at its default.
    ///
    /// # Panics
    ///
    /// Panics if `addr` is not a valid `host:port` string.
    ///
    /// # Example
    ///
    /// ```rust,no_run
    /// use weft::Server;
    /// let server = Server::bind("0.0.0.0:3000");
    /// ```
    pub fn bind(addr: &str) -> Self {
        let addr: SocketAddr = addr
            .parse()
            .unwrap_or_else(|e| panic!("invalid socket address `{addr}`: {e}"));
        Self::new(Config { addr, ..Config::default() })
    }

    /// Binds, starts the workers and begins accepting connections.
    ///
    /// Returns once the listener is bound. Bind to port `0` and read
    /// [`ServerHandle::local_addr`] to let the OS pick a port.
    pub async fn start(self, router: Router) -> Result<ServerHandle, Error> {
        let config = self.config;
        config.validate()?;

        let listener = Listener::bind(config.addr).await?;
        let local_addr = listener.local_addr()?;
        let scheduler = Arc::new(Scheduler::new(config.worker_threads, config.max_connections)?);
        let drain_timeout = config.drain_timeout;

        info!(
            addr = %local_addr,
            workers = scheduler.worker_count(),
            routes = router.len(),
            max_connections = config.max_connections,
            "weft listening"
        );

        let app = Arc::new(App::new(router, config));
        let (trigger, watch) = Trigger::new();
        let acceptor = tokio::spawn(accept_loop(listener, Arc::clone(&scheduler), app, watch));

        Ok(ServerHandle { local_addr, trigger, acceptor, scheduler, drain_timeout })
    }

    /// Serves `router` until SIGTERM or Ctrl-C, then drains.
    ///
    /// Returns only after the graceful shutdown has finished.
    pub async fn serve(self, router: Router) -> Result<(), Error> {
        let handle = self.start(router).await?;
        shutdown::signal().await;
        info!("shutdown signal received");
        handle.stop().await;
        Ok(())
    }
}

/// A running server.
///
/// Dropping the handle leaves the server running; call
/// [`stop`](ServerHandle::stop) to shut it down.
pub struct ServerHandle {
    local_addr: SocketAddr,
    trigger: Trigger,
    acceptor: JoinHandle<()>,
    scheduler: Arc<Scheduler>,
    drain_timeout: Duration,
}

impl ServerHandle {
    /// The address the listener is bound to.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Connections currently admitted.
    pub fn connections(&self) -> usize {
        self.scheduler.admission.in_flight()
    }

    /// Stops accepting, drains in-flight requests for up to `drain_timeout`,
    /// drops whatever is left and stops the workers.
    pub async fn stop(self) {
        let admission = &self.scheduler.admission;
        info!(in_flight = admission.in_flight(), "draining connections");

        self.trigger.advance(Phase::Draining);
        if let Err(e) = self.acceptor.await {
            error!("acceptor task failed: {e}");
        }

        if !admission.drained(self.drain_timeout).await {
            warn!(
                in_flight = admission.in_flight(),
                timeout = ?self.drain_timeout,
                "drain timed out, closing remaining connections"
            );
            self.trigger.advance(Phase::Closing);
            if !admission.drained(CLOSE_GRACE).await {
                warn!(in_flight = admission.in_flight(), "connections still open at shutdown");
            }
        }

        match Arc::into_inner(self.scheduler) {
            Some(scheduler) => scheduler.shutdown().await,
            None => error!("scheduler still shared at shutdown, workers left running"),
        }
        info!("weft stopped");
    }
}

// ── Accept loop ───────────────────────────────────────────────────────────────

/// Admits, accepts and hands each connection to a worker until draining
/// begins.
async fn accept_loop(listener: Listener, scheduler: Arc<Scheduler>, app: Arc<App>, mut watch: Watch) {
    loop {
        // `biased` checks drain first so a stop wins over a queued connection.
        let ticket = tokio::select! {
            biased;
            () = watch.draining() => break,
            ticket = scheduler.admission.admit() => match ticket {
                Some(ticket) => ticket,
                None => break,
            },
        };

        let accepted = tokio::select! {
            biased;
            () = watch.draining() => break,
            accepted = listener.accept() => accepted,
        };

        match accepted {
            Accepted::Connection(stream, peer) => {
                // detach from this runtime; the worker registers it with its own
                let stream = match stream.into_std() {
                    Ok(stream) => stream,
                    Err(e) => {
                        warn!(%peer, "failed to hand off connection: {e}");
                        continue;
                    }
                };
                let app = Arc::clone(&app);
                let watch = watch.clone();
                scheduler.spawn(async move {
                    let _ticket = ticket;
                    match TcpStream::from_std(stream) {
                        Ok(stream) => Connection::new(stream, app, watch, Some(peer)).serve().await,
                        Err(e) => warn!(%peer, "failed to register connection: {e}"),
                    }
                });
            }
            Accepted::Exhausted(e) => {
                drop(ticket);
                warn!(in_flight = scheduler.admission.in_flight(), "accept failed, backing off: {e}");
                tokio::select! {
                    biased;
                    () = watch.draining() => break,
                    () = scheduler.admission.released() => {}
                    () = tokio::time::sleep(EXHAUSTED_BACKOFF) => {}
                }
            }
        }
    }
    debug!("acceptor stopped");
}
