//! telemesh: a per-request policy and telemetry mediation plane. Requests
//! arrive as wire-compressed attribute bags; configuration arrives as
//! `---`-separated resource documents; adapters do the actual enforcement
//! and telemetry. This crate wires the subsystem crates into a runnable,
//! transport-free service.

pub mod config;
pub mod errors;
pub mod service;

use std::sync::Arc;

use tokio::task::JoinHandle;
use tracing::info;

use telemesh_attr::GlobalWords;
use telemesh_config_center::{FsBackend, StoreBackend};
use telemesh_dispatcher::planner::KINDS;
use telemesh_dispatcher::{Dispatcher, Planner, PlannerConfig};
use telemesh_expr::Evaluator;
use telemesh_template::adapter::{AdapterInfo, AdapterRegistry};

pub use config::MeshConfig;
pub use errors::ServiceError;
pub use service::{
    CheckRequest, CheckResponse, MeshService, QuotaParams, QuotaResponse, ReportRequest,
};

/// The built-in adapter inventory, re-exported for deployments that take the
/// stock set.
pub use telemesh_adapters as adapters;

/// A running mesh: the service façade plus the config machinery feeding it.
pub struct Mesh {
    pub service: Arc<MeshService>,
    backend: Arc<FsBackend>,
    planner_worker: JoinHandle<()>,
}

impl Mesh {
    /// Boots the full stack: evaluator, planner, dispatcher, fs config
    /// backend, and the service façade. The planner starts consuming config
    /// events immediately.
    pub async fn start(
        config: MeshConfig,
        adapters: Vec<AdapterInfo>,
    ) -> Result<Mesh, ServiceError> {
        let evaluator = Arc::new(Evaluator::new(config.expression_cache_size));
        let registry = Arc::new(AdapterRegistry::new(adapters));
        let planner = Arc::new(Planner::new(
            Arc::clone(&evaluator),
            registry,
            PlannerConfig {
                drain_grace: config.drain_grace(),
            },
        ));
        let dispatcher = Arc::new(Dispatcher::new(planner.table_handle(), evaluator));

        let backend = Arc::new(
            FsBackend::new(&config.config_root).with_poll_interval(config.poll_interval()),
        );
        let events = backend.watch();
        backend
            .init(KINDS.iter().map(|k| k.to_string()).collect())
            .await
            .map_err(|err| ServiceError::Startup(err.to_string()))?;

        let planner_worker = tokio::spawn(Arc::clone(&planner).run(events));

        let service = Arc::new(MeshService::new(
            dispatcher,
            GlobalWords::standard(),
            config,
        ));
        info!("mesh started");
        Ok(Mesh {
            service,
            backend,
            planner_worker,
        })
    }

    /// Forces one config poll; tests use this instead of waiting for the
    /// backend tick.
    pub async fn poll_config(&self) {
        self.backend.poll_once().await;
    }

    pub fn shutdown(&self) {
        self.backend.stop();
        self.planner_worker.abort();
    }
}

impl Drop for Mesh {
    fn drop(&mut self) {
        self.shutdown();
    }
}
