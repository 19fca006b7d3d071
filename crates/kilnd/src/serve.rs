//! `kilnd serve`: wire the subsystems together and run the HTTP server.

use std::net::SocketAddr;
use std::sync::Arc;

use kiln_api::{ApiKeyAuth, AppState};
use kiln_audit::{Auditor, ElasticsearchConfig, ElasticsearchSink, StoreSink};
use kiln_cluster::{ClusterOrchestrator, KubeOrchestrator, KubeSettings, SimulatedCluster};
use kiln_core::KilnConfig;
use kiln_core::config::{AuditBackend, AuditSection, ClusterBackend, ClusterSection};
use kiln_pipeline::{Pipeline, PipelineSettings};
use kiln_state::AuditStore;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

pub async fn run(config: KilnConfig) -> anyhow::Result<()> {
    info!("Kiln daemon starting");

    // ── Shutdown signal ────────────────────────────────────────

    let shutdown = CancellationToken::new();
    {
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            match tokio::signal::ctrl_c().await {
                Ok(()) => {
                    info!("shutdown signal received");
                    shutdown.cancel();
                }
                Err(e) => error!(error = %e, "failed to listen for CTRL+C"),
            }
        });
    }

    // ── Initialize subsystems ──────────────────────────────────

    let cluster = build_cluster(&config.cluster).await?;

    let (auditor, audit_store) = tokio::select! {
        built = build_auditor(&config.audit) => built?,
        _ = shutdown.cancelled() => {
            info!("shutdown during startup");
            return Ok(());
        }
    };
    info!(backend = auditor.backend_name(), "audit initialized");

    let settings = PipelineSettings::from_config(&config)?;
    info!(
        poll_attempts = settings.poll_attempts,
        poll_interval = ?settings.poll_interval,
        settle_delay = ?settings.settle_delay,
        promotion_policy = ?settings.promotion_policy,
        "pipeline initialized"
    );
    let pipeline = Pipeline::new(cluster, auditor, settings);

    let auth = ApiKeyAuth::new(&config.server.api_key, &config.server.secret_salt);
    if !auth.is_configured() {
        warn!("no API key configured; /api and /ws will reject every request");
    }
    if config.server.webhook_secret.is_none() {
        warn!("no webhook secret configured; /webhook will reject every request");
    }

    let state = AppState {
        pipeline,
        auth: Arc::new(auth),
        webhook_secret: config.server.webhook_secret.as_deref().map(Arc::from),
        audit_store,
        shutdown: shutdown.clone(),
    };

    // ── Start API server ───────────────────────────────────────

    let router = kiln_api::build_router(state);
    let addr = SocketAddr::from(([0, 0, 0, 0], config.server.port));
    info!(%addr, "API server starting");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown.clone().cancelled_owned())
        .await?;

    info!("Kiln daemon stopped");
    Ok(())
}

async fn build_cluster(section: &ClusterSection) -> anyhow::Result<Arc<dyn ClusterOrchestrator>> {
    match section.backend {
        ClusterBackend::Kubernetes => {
            let settings = KubeSettings {
                kubeconfig: section.kubeconfig.clone(),
                test_image: section.test_image.clone(),
                payload_path: section.payload_path.clone(),
                ..KubeSettings::default()
            };
            let orchestrator = KubeOrchestrator::connect(settings).await?;
            info!(test_image = %section.test_image, "kubernetes orchestrator initialized");
            Ok(Arc::new(orchestrator))
        }
        ClusterBackend::Simulated => {
            warn!("using the simulated cluster; nothing is deployed for real");
            Ok(Arc::new(SimulatedCluster::new()))
        }
    }
}

/// Build the auditor. An unreachable Elasticsearch disables auditing
/// rather than failing startup.
async fn build_auditor(section: &AuditSection) -> anyhow::Result<(Auditor, Option<AuditStore>)> {
    match section.backend {
        AuditBackend::Disabled => Ok((Auditor::disabled(), None)),
        AuditBackend::Local => {
            std::fs::create_dir_all(&section.data_dir)?;
            let path = section.data_dir.join("audit.redb");
            let store = AuditStore::open(&path)?;
            info!(path = ?path, "local audit store opened");
            let sink = StoreSink::new(store.clone());
            Ok((Auditor::new(Arc::new(sink)), Some(store)))
        }
        AuditBackend::Elasticsearch => {
            let es = ElasticsearchConfig {
                url: section.elasticsearch_url.clone(),
                index: section.index.clone(),
                connect_attempts: section.connect_attempts,
                connect_interval: section.connect_interval()?,
                request_timeout: section.request_timeout()?,
            };
            match ElasticsearchSink::connect(&es).await {
                Ok(sink) => Ok((Auditor::new(Arc::new(sink)), None)),
                Err(e) => {
                    error!(error = %e, "elasticsearch unavailable, audit disabled");
                    Ok((Auditor::disabled(), None))
                }
            }
        }
    }
}
