//! `VigilServer` builder and server loop.
//!
//! This is the composition root. It ties the layers together:
//! transport → session gate → hub ← telemetry publisher, with the REST
//! surface and the session authority on the side, and the hub registered
//! as the authority's revocation listener.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use vigil_hub::HubHandle;
use vigil_session::{MemorySessionStore, SessionAuthority};
use vigil_telemetry::{MetricsSampler, ProcfsSampler, TelemetryPublisher};
use vigil_transport::WebSocketTransport;

use crate::VigilError;
use crate::accounts::{AccountService, MemoryUserDirectory, PasswordHashing};
use crate::api::{self, AppState};
use crate::config::ServerConfig;
use crate::gate::SessionGate;
use crate::handler::{ConnectionHandler, SessionLiveness};

/// The session authority as the server wires it: in-memory rows, the hub
/// as revocation listener.
pub type Authority = SessionAuthority<MemorySessionStore, HubHandle>;

/// The account service as the server wires it.
pub type Accounts = AccountService<MemoryUserDirectory, MemorySessionStore, HubHandle>;

/// Pause after a failed `accept` so a persistent error (out of file
/// descriptors) doesn't spin.
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// An account created while building the server.
struct SeedUser {
    username: String,
    password: String,
    is_admin: bool,
}

/// Builder for configuring and starting a Vigil server.
///
/// # Example
///
/// ```rust,ignore
/// let server = VigilServer::builder()
///     .config(ServerConfig::from_env()?)
///     .build()
///     .await?;
/// server.run(shutdown).await
/// ```
pub struct VigilServerBuilder {
    config: ServerConfig,
    hashing: PasswordHashing,
    users: Vec<SeedUser>,
}

impl VigilServerBuilder {
    /// Creates a new builder with default settings.
    pub fn new() -> Self {
        Self {
            config: ServerConfig::default(),
            hashing: PasswordHashing::default(),
            users: Vec::new(),
        }
    }

    /// Replaces the whole configuration.
    pub fn config(mut self, config: ServerConfig) -> Self {
        self.config = config;
        self
    }

    /// Sets the REST listener address.
    pub fn http_addr(mut self, addr: &str) -> Self {
        self.config.http_addr = addr.to_string();
        self
    }

    /// Sets the realtime (WebSocket) listener address.
    pub fn realtime_addr(mut self, addr: &str) -> Self {
        self.config.realtime_addr = addr.to_string();
        self
    }

    /// Sets the argon2 cost used for stored passwords.
    pub fn password_hashing(mut self, hashing: PasswordHashing) -> Self {
        self.hashing = hashing;
        self
    }

    /// Creates an account at startup, in addition to the configured admin.
    pub fn user(mut self, username: &str, password: &str, is_admin: bool) -> Self {
        self.users.push(SeedUser {
            username: username.to_string(),
            password: password.to_string(),
            is_admin,
        });
        self
    }

    /// Builds the server with the procfs sampler.
    pub async fn build(self) -> Result<VigilServer<ProcfsSampler>, VigilError> {
        self.build_with_sampler(ProcfsSampler::default()).await
    }

    /// Builds the server with a caller-supplied metrics sampler.
    ///
    /// Binds both listeners, starts the hub, and creates seed accounts.
    /// Nothing is served until [`VigilServer::run`].
    pub async fn build_with_sampler<M: MetricsSampler>(
        self,
        sampler: M,
    ) -> Result<VigilServer<M>, VigilError> {
        let config = self.config.check()?;

        let http = TcpListener::bind(&config.http_addr).await?;
        let transport =
            WebSocketTransport::bind(&config.realtime_addr, config.transport_config()).await?;

        let (hub, hub_task) = HubHandle::spawn(config.hub_config());
        let authority: Arc<Authority> = Arc::new(
            SessionAuthority::new(config.jwt_secret.as_bytes(), config.session_config())
                .with_listener(hub.clone()),
        );
        let accounts = Arc::new(
            AccountService::new(MemoryUserDirectory::new(), Arc::clone(&authority))
                .with_hashing(self.hashing),
        );

        let admin = config.admin.as_ref().map(|admin| SeedUser {
            username: admin.username.clone(),
            password: admin.password.clone(),
            is_admin: true,
        });
        for user in admin.into_iter().chain(self.users) {
            accounts
                .create_user(&user.username, &user.password, user.is_admin)
                .await?;
        }

        Ok(VigilServer {
            config,
            http,
            transport,
            hub,
            hub_task,
            authority,
            accounts,
            sampler,
        })
    }
}

impl Default for VigilServerBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// A built Vigil server.
///
/// Call [`run()`](Self::run) to start serving.
pub struct VigilServer<M> {
    config: ServerConfig,
    http: TcpListener,
    transport: WebSocketTransport,
    hub: HubHandle,
    hub_task: JoinHandle<()>,
    authority: Arc<Authority>,
    accounts: Arc<Accounts>,
    sampler: M,
}

impl VigilServer<ProcfsSampler> {
    /// Creates a new builder.
    pub fn builder() -> VigilServerBuilder {
        VigilServerBuilder::new()
    }
}

impl<M: MetricsSampler> VigilServer<M> {
    /// Address of the REST listener.
    pub fn http_addr(&self) -> std::io::Result<SocketAddr> {
        self.http.local_addr()
    }

    /// Address of the realtime listener.
    pub fn realtime_addr(&self) -> std::io::Result<SocketAddr> {
        self.transport.local_addr()
    }

    pub fn hub(&self) -> &HubHandle {
        &self.hub
    }

    pub fn authority(&self) -> &Arc<Authority> {
        &self.authority
    }

    pub fn accounts(&self) -> &Arc<Accounts> {
        &self.accounts
    }

    /// Serves until `shutdown` fires.
    ///
    /// On shutdown the hub evicts every live connection with
    /// `ServerShutdown`, and this returns only after every connection task,
    /// the REST server, the publisher, and the expiry sweep have finished.
    pub async fn run(self, shutdown: CancellationToken) -> Result<(), VigilError> {
        let Self {
            config,
            http,
            transport,
            hub,
            hub_task,
            authority,
            accounts,
            sampler,
        } = self;

        let sweeper = authority.spawn_expiry_sweep(shutdown.child_token());

        let publisher = TelemetryPublisher::new(sampler, hub.clone(), config.publisher_config());
        let publisher_task = tokio::spawn(publisher.run(shutdown.child_token()));

        let app = api::router(AppState {
            accounts,
            hub: hub.clone(),
        });
        let http_shutdown = shutdown.clone();
        let http_task = tokio::spawn(async move {
            axum::serve(http, app)
                .with_graceful_shutdown(async move { http_shutdown.cancelled().await })
                .await
        });

        let gate = Arc::new(SessionGate::new(Arc::clone(&authority)));
        let handler = ConnectionHandler::new(
            hub.clone(),
            Arc::clone(&authority) as Arc<dyn SessionLiveness>,
            config.handler_config(),
            shutdown.child_token(),
        );
        let connections = TaskTracker::new();

        tracing::info!(
            http = %config.http_addr,
            realtime = %config.realtime_addr,
            path = %config.realtime_path,
            "vigil server running"
        );

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                accepted = transport.accept() => match accepted {
                    Ok(pending) => {
                        let gate = Arc::clone(&gate);
                        let handler = handler.clone();
                        connections.spawn(async move {
                            let peer = pending.peer_addr();
                            match pending.upgrade(gate.as_ref()).await {
                                Ok((conn, admitted)) => {
                                    if let Err(e) = handler.serve(conn, admitted).await {
                                        tracing::debug!(%peer, error = %e, "connection ended with error");
                                    }
                                }
                                Err(e) => tracing::debug!(%peer, error = %e, "upgrade refused"),
                            }
                        });
                    }
                    Err(e) => {
                        tracing::error!(error = %e, "accept failed");
                        tokio::time::sleep(ACCEPT_BACKOFF).await;
                    }
                },
            }
        }

        tracing::info!("shutting down");
        drop(transport);
        match hub.shutdown().await {
            Ok(evicted) => tracing::info!(evicted, "hub stopped"),
            Err(e) => tracing::warn!(error = %e, "hub already stopped"),
        }

        connections.close();
        connections.wait().await;

        match publisher_task.await {
            Ok(stats) => tracing::info!(
                published = stats.published,
                failures = stats.failures,
                "telemetry publisher finished"
            ),
            Err(e) => tracing::error!(error = %e, "telemetry publisher panicked"),
        }
        if let Err(e) = sweeper.await {
            tracing::error!(error = %e, "session sweep panicked");
        }
        if let Err(e) = hub_task.await {
            tracing::error!(error = %e, "hub actor panicked");
        }
        let served = match http_task.await {
            Ok(result) => result.map_err(VigilError::from),
            Err(e) => {
                tracing::error!(error = %e, "http server panicked");
                Ok(())
            }
        };

        tracing::info!("vigil server stopped");
        served
    }
}
