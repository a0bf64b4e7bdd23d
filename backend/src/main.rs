use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use leadflow_backend::{
    config::Config,
    database,
    handlers::AppState,
    jobs::ExecutionScheduler,
    notifications::BroadcastNotifier,
    store::PgStore,
    workflows::LeadAutomation,
};
use sqlx::PgPool;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv::dotenv().ok();

    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("leadflow_backend=info,tower_http=info")),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = Config::from_env()?;
    let db_pool = database::create_pool(&config.database_url).await?;

    database::migrate(&db_pool).await?;

    // Delivery channels subscribe here; until one does, log what would go out
    let notifier = Arc::new(BroadcastNotifier::default());
    let mut outbox = notifier.subscribe();
    tokio::spawn(async move {
        while let Ok(notification) = outbox.recv().await {
            tracing::info!(
                user_id = %notification.user_id,
                title = %notification.title,
                "Notification ready for delivery"
            );
        }
    });

    let shutdown = CancellationToken::new();
    let state = Arc::new(AppState::new(HashMap::new()));
    let mut provisioner = TenantProvisioner {
        pool: db_pool.clone(),
        notifier: notifier.clone(),
        config: config.clone(),
        state: state.clone(),
        shutdown: shutdown.clone(),
        workers: Vec::new(),
    };
    provisioner.sync().await?;
    tracing::info!("Automation loaded for {} tenants", state.tenant_count().await);
    let provisioning = tokio::spawn(provisioner.run(config.tenant_refresh_interval()));

    let app = leadflow_backend::app(state);

    let listener = tokio::net::TcpListener::bind(&config.server_addr).await?;
    tracing::info!("Server running on {}", config.server_addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(shutdown.clone()))
        .await?;

    shutdown.cancel();
    if let Err(e) = provisioning.await {
        tracing::error!("Tenant provisioning task ended abnormally: {}", e);
    }
    db_pool.close().await;

    Ok(())
}

/// Starts automation and a scheduler for every active tenant it has not seen yet
struct TenantProvisioner {
    pool: PgPool,
    notifier: Arc<BroadcastNotifier>,
    config: Config,
    state: Arc<AppState<PgStore>>,
    shutdown: CancellationToken,
    workers: Vec<JoinHandle<()>>,
}

impl TenantProvisioner {
    async fn sync(&mut self) -> anyhow::Result<usize> {
        let mut added = 0;
        for tenant_id in database::active_tenants(&self.pool).await? {
            if self.state.has_tenant(tenant_id).await {
                continue;
            }
            let store = Arc::new(PgStore::new(self.pool.clone(), tenant_id));
            let automation = Arc::new(LeadAutomation::new(
                store,
                self.notifier.clone(),
                self.config.automation.clone(),
                self.config.scheduler.clone(),
            ));

            let scheduler = ExecutionScheduler::new(automation.clone(), tenant_id.to_string());
            self.workers.push(tokio::spawn(scheduler.run(self.shutdown.child_token())));
            self.state.insert_tenant(tenant_id, automation).await;
            added += 1;
        }
        Ok(added)
    }

    /// Re-read the tenant list until shutdown, then wait for the schedulers
    async fn run(mut self, every: Duration) {
        let mut refresh = interval(every);
        refresh.set_missed_tick_behavior(MissedTickBehavior::Delay);
        refresh.tick().await;

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = refresh.tick() => match self.sync().await {
                    Ok(0) => {}
                    Ok(added) => tracing::info!(added, "New tenants provisioned"),
                    Err(e) => tracing::warn!(error = %e, "Refreshing the tenant list failed"),
                },
            }
        }

        for worker in self.workers {
            if let Err(e) = worker.await {
                tracing::error!("Scheduler task ended abnormally: {}", e);
            }
        }
    }
}

async fn shutdown_signal(shutdown: CancellationToken) {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("Failed to listen for shutdown signal: {}", e);
    }
    tracing::info!("Shutdown signal received");
    shutdown.cancel();
}
