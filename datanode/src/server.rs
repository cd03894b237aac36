use std::net::SocketAddr;

use anyhow::Context;
use hyper::service::{make_service_fn, service_fn};
use hyper::{Body, Request, Response};
use tokio::task::JoinHandle;

use crate::cluster::LocalCluster;
use crate::config;
use crate::metrics;

/// The replica group plus its metrics endpoint.
pub struct Server {
    cluster: LocalCluster,
    metrics_server: Option<JoinHandle<()>>,
}

impl Server {
    /// Starts the replicas described by the loaded runtime config.
    pub async fn start() -> anyhow::Result<Self> {
        let config = config::instance()
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone();
        metrics::init_registry();
        let addr: SocketAddr = config
            .metrics_addr
            .parse()
            .with_context(|| format!("invalid metrics address {}", config.metrics_addr))?;
        let metrics_server = start_metrics_server(addr)?;

        let cluster = LocalCluster::start(config).context("failed to recover replicas")?;
        log::info!("replicas {:?} started", cluster.ids());
        Ok(Server {
            cluster,
            metrics_server: Some(metrics_server),
        })
    }

    pub fn cluster(&self) -> &LocalCluster {
        &self.cluster
    }

    pub async fn stop(mut self) {
        for id in self.cluster.ids() {
            if let Some(sm) = self.cluster.state_machine(id) {
                log::info!("replica {} status before stop: {:?}", id, sm.status());
            }
        }
        self.cluster.shutdown().await;
        if let Some(server) = self.metrics_server.take() {
            server.abort();
        }
        log::info!("server stop");
    }
}

fn start_metrics_server(addr: SocketAddr) -> anyhow::Result<JoinHandle<()>> {
    let make_svc = make_service_fn(move |_| async move {
        Ok::<_, hyper::Error>(service_fn(move |_: Request<Body>| async move {
            Ok::<_, hyper::Error>(Response::new(Body::from(metrics::gather())))
        }))
    });
    let server = hyper::Server::try_bind(&addr)
        .with_context(|| format!("failed to bind metrics server on {}", addr))?
        .serve(make_svc);
    let handle = tokio::spawn(async move {
        if let Err(e) = server.await {
            log::error!("metrics server failed: {}", e);
        }
    });
    log::info!("metrics server started on {}", addr);
    Ok(handle)
}
