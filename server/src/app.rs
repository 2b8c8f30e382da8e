//! Assembly of the running server.
//!
//! The axum state is the sole owner of pool, collection, caches, and
//! settings; there are no process-wide singletons. Teardown stops the
//! collectors before the listener goes away.

use std::path::PathBuf;
use std::sync::Arc;

use axum::Router;
use qpy_protocol::PACKAGE_EXTENSION;
use qpy_protocol::WorkerResourceLimits;
use tracing::info;

use crate::cache::FileLimitLru;
use crate::collector::PackageCollection;
use crate::settings::Settings;
use crate::settings::SettingsError;
use crate::settings::WorkerSettings;
use crate::web;
use crate::worker::WorkerPool;
use crate::worker::pool::WorkerFactory;

#[derive(thiserror::Error, Debug)]
pub enum AppError {
    #[error(transparent)]
    Settings(#[from] SettingsError),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("failed to start a collector: {0}")]
    Collector(#[from] crate::collector::CollectorError),
}

#[derive(Clone)]
pub struct AppState {
    pub settings: Arc<Settings>,
    pub pool: Arc<WorkerPool>,
    pub packages: Arc<PackageCollection>,
}

pub struct App {
    state: AppState,
}

impl App {
    pub async fn new(settings: Settings) -> Result<Self, AppError> {
        let package_cache = Arc::new(FileLimitLru::new(
            &settings.cache_package.directory,
            settings.cache_package.size,
            PACKAGE_EXTENSION,
            "Package cache",
        )?);
        let repo_index_cache = Arc::new(FileLimitLru::new(
            &settings.cache_repo_index.directory,
            settings.cache_repo_index.size,
            "gz",
            "Repo index cache",
        )?);

        let factory = WorkerFactory {
            kind: settings.worker.kind,
            executable: worker_executable(&settings.worker),
            limits: WorkerResourceLimits {
                max_memory: settings.worker.per_worker_memory,
                max_cpu_time_seconds_per_call: settings.worker.max_cpu_time_seconds_per_call,
            },
        };
        let pool = Arc::new(WorkerPool::new(
            settings.worker.max_workers,
            settings.worker.max_memory,
            factory,
        ));

        let packages = PackageCollection::new(
            &settings.collector,
            package_cache,
            repo_index_cache,
            pool.clone(),
        )
        .await;

        Ok(Self {
            state: AppState {
                settings: Arc::new(settings),
                pool,
                packages,
            },
        })
    }

    pub fn state(&self) -> AppState {
        self.state.clone()
    }

    pub fn router(&self) -> Router {
        web::router(self.state.clone())
    }

    /// Starts the collectors, binds the listener, and serves until SIGTERM
    /// or ctrl-c.
    pub async fn serve(self) -> Result<(), AppError> {
        self.state.packages.start().await?;

        let address = format!(
            "{}:{}",
            self.state.settings.webservice.listen_address,
            self.state.settings.webservice.listen_port,
        );
        let listener = tokio::net::TcpListener::bind(&address).await?;
        info!("listening on {address}");

        let packages = self.state.packages.clone();
        axum::serve(listener, self.router())
            .with_graceful_shutdown(shutdown_signal())
            .await?;

        packages.stop().await;
        Ok(())
    }
}

fn worker_executable(settings: &WorkerSettings) -> PathBuf {
    if let Some(executable) = &settings.executable {
        return executable.clone();
    }
    // Default to the worker binary installed next to the server.
    std::env::current_exe()
        .ok()
        .and_then(|exe| Some(exe.parent()?.join("qpy-worker")))
        .unwrap_or_else(|| PathBuf::from("qpy-worker"))
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        let mut terminate = match tokio::signal::unix::signal(
            tokio::signal::unix::SignalKind::terminate(),
        ) {
            Ok(signal) => signal,
            Err(_) => return std::future::pending().await,
        };
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = terminate.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}
