//! Startup and shutdown orchestration.
//!
//! Startup: build the shared pipeline, start one listener per callback
//! port, register every CCU interface, then report readiness. Shutdown runs
//! the reverse: report stopping, unregister, stop the listeners.

use hmbridge_db::{create_pool, DbRuntimeSettings, PersistenceGateway, PoolError};
use std::collections::BTreeMap;
use std::net::SocketAddr;
use thiserror::Error;
use tokio::task::JoinHandle;

use crate::config::{Config, ConfigError};
use crate::listener::{ListenerError, RpcListener};
use crate::notifier::{NotifyError, TransitionNotifier};
use crate::pipeline::{DeviceFilter, Pipeline};
use crate::registration::{RegistrationClient, RegistrationError};
use crate::state::{CachePolicy, StateCache};
use crate::watchdog;

/// Errors that abort startup.
#[derive(Debug, Error)]
pub enum StartupError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Pool(#[from] PoolError),

    #[error(transparent)]
    Notifier(#[from] NotifyError),

    #[error("failed to build registration client: {0}")]
    Client(#[from] reqwest::Error),

    #[error(transparent)]
    Listener(#[from] ListenerError),

    #[error(transparent)]
    Registration(#[from] RegistrationError),
}

/// Builds the pipeline shared by all listeners.
///
/// # Errors
///
/// Returns `StartupError` if the access gate, the database pool or the
/// notifier cannot be built.
pub fn build_pipeline(config: &Config) -> Result<Pipeline, StartupError> {
    let gate = config.access_gate()?;

    let pool = create_pool(
        &config.database.path,
        DbRuntimeSettings {
            busy_timeout_ms: config.database.busy_timeout_ms,
            pool_max_size: config.database.pool_max_size,
            idle_timeout_secs: config.database.idle_timeout_secs,
        },
    )?;

    let notifier = if config.notifier.enabled {
        Some(TransitionNotifier::new(&config.notifier)?)
    } else {
        tracing::info!("transition notifications disabled");
        None
    };

    Ok(Pipeline {
        gate,
        filter: DeviceFilter::new(&config.monitored_devices()),
        policy: CachePolicy::new(
            &config.devices.state_tracked,
            config.devices.tracked_params.as_deref(),
        ),
        cache: StateCache::new(),
        gateway: PersistenceGateway::new(pool),
        notifier,
    })
}

/// A running bridge: listeners up and every interface registered.
pub struct Bridge {
    pipeline: Pipeline,
    listeners: Vec<RpcListener>,
    registration: RegistrationClient,
    watchdog: Option<JoinHandle<()>>,
}

impl Bridge {
    /// Starts listeners and registers with the CCU.
    ///
    /// Listeners are running before the first `init` call goes out, so the
    /// CCU's immediate callbacks are not lost. If any registration fails,
    /// every interface is unregistered and the listeners are stopped again.
    ///
    /// # Errors
    ///
    /// Returns `StartupError` for invalid configuration, a port that cannot
    /// be bound, or a failed registration.
    pub async fn start(config: &Config) -> Result<Self, StartupError> {
        config.validate()?;
        let pipeline = build_pipeline(config)?;

        let groups = config.interfaces_by_port();
        let mut listeners = Vec::with_capacity(groups.len());
        for (port, interfaces) in &groups {
            let name = interfaces
                .iter()
                .map(|i| i.name.as_str())
                .collect::<Vec<_>>()
                .join(",");
            let mut listener = RpcListener::new(
                name,
                SocketAddr::new(config.server.host, *port),
                pipeline.clone(),
            );
            if let Err(e) = listener.start().await {
                stop_all(&mut listeners).await;
                return Err(e.into());
            }
            listeners.push(listener);
        }

        let bound: BTreeMap<u16, u16> = groups
            .keys()
            .zip(&listeners)
            .map(|(port, listener)| {
                (*port, listener.local_addr().map_or(*port, |addr| addr.port()))
            })
            .collect();
        let sessions = RegistrationClient::sessions_from_config(config, |interface| {
            let port = interface.callback_port.unwrap_or(config.server.port);
            bound.get(&port).copied().unwrap_or(port)
        });

        let registration = match RegistrationClient::new(sessions) {
            Ok(client) => client,
            Err(e) => {
                stop_all(&mut listeners).await;
                return Err(e.into());
            }
        };
        if let Err(e) = registration.register_all().await {
            registration.unregister_all().await;
            stop_all(&mut listeners).await;
            return Err(e.into());
        }

        watchdog::ready();
        watchdog::status(&format!(
            "listening on {} port(s), {} interface(s) registered",
            listeners.len(),
            registration.sessions().len()
        ));
        let interval = watchdog::watchdog_interval(
            config.watchdog.interval_secs,
            std::env::var("WATCHDOG_USEC").ok().as_deref(),
        );
        let watchdog = tokio::spawn(watchdog::start_watchdog_task(interval));

        tracing::info!(
            listeners = listeners.len(),
            interfaces = registration.sessions().len(),
            "bridge running"
        );

        Ok(Self {
            pipeline,
            listeners,
            registration,
            watchdog: Some(watchdog),
        })
    }

    pub fn pipeline(&self) -> &Pipeline {
        &self.pipeline
    }

    pub fn cache(&self) -> &StateCache {
        &self.pipeline.cache
    }

    /// Bound addresses of the running listeners.
    pub fn local_addrs(&self) -> Vec<SocketAddr> {
        self.listeners
            .iter()
            .filter_map(RpcListener::local_addr)
            .collect()
    }

    pub fn registration(&self) -> &RegistrationClient {
        &self.registration
    }

    /// Unregisters from the CCU and stops every listener. Unregistration
    /// failures do not hold up the shutdown.
    pub async fn shutdown(mut self) {
        tracing::info!("shutting down bridge");
        watchdog::stopping();

        self.registration.unregister_all().await;
        stop_all(&mut self.listeners).await;

        if let Some(task) = self.watchdog.take() {
            task.abort();
        }
        tracing::info!("bridge shut down");
    }
}

async fn stop_all(listeners: &mut [RpcListener]) {
    for listener in listeners.iter_mut() {
        listener.stop().await;
    }
}
