use std::{net::SocketAddr, sync::Arc, time::Duration};

// signage-engine
//
// Background service of a signage player:
//   - collect from the CMS on a timer
//   - keep the content library in sync
//   - publish the playback loop for the renderer over loopback HTTP

use anyhow::Context;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use signage_engine::cache::{ContentCache, RemoteFetcher};
use signage_engine::clock::{Clock, SystemClock};
use signage_engine::config::{
    EngineConfig, FILES_PREFIX, STATS_CLEANUP_INTERVAL_SECS, STATS_MAX_OPEN_AGE_SECS,
};
use signage_engine::db::Db;
use signage_engine::logs::{self, CmsLogLayer, LogStore};
use signage_engine::player::Player;
use signage_engine::schedule::{EngineOptions, Predicates, ScheduleEngine};
use signage_engine::server::{build_router, shutdown_signal, AppState};
use signage_engine::session::{SessionClient, SessionOptions};
use signage_engine::stats::StatsStore;
use signage_engine::xmds::{HttpTransport, XmdsClient, XmdsIdentity};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);

    let (cms_layer, log_rx) = CmsLogLayer::new(Arc::clone(&clock));
    tracing_subscriber::registry()
        .with(EnvFilter::from_default_env().add_directive("info".parse()?))
        .with(tracing_subscriber::fmt::layer())
        .with(cms_layer)
        .init();

    let cfg = EngineConfig::from_env()?;
    if !cfg.is_configured() {
        anyhow::bail!("SIGNAGE_CMS_URL and SIGNAGE_CMS_KEY must be set");
    }

    let db = Db::open(&cfg.db_path).await?;
    let log_store = LogStore::new(db.clone());
    let stats = StatsStore::new(db.clone(), Arc::clone(&clock));

    // Open stats from a previous run can never be closed.
    stats.clear().await.context("failed to reset stats")?;

    let transport = HttpTransport::new(cfg.cms_url.clone(), cfg.xmds_version)?;
    let xmds = XmdsClient::new(Arc::new(transport), XmdsIdentity::from_config(&cfg));

    let fetcher = RemoteFetcher::new(xmds.clone())?;
    let cache = ContentCache::new(
        db.clone(),
        cfg.library_dir.clone(),
        FILES_PREFIX,
        Arc::new(fetcher),
        cfg.max_concurrent_downloads,
    )
    .await?;

    let engine = Arc::new(ScheduleEngine::new(
        Arc::clone(&clock),
        EngineOptions { share_of_voice_targets: cfg.share_of_voice_targets },
        Predicates::default(),
    ));

    let session = Arc::new(SessionClient::new(
        xmds.clone(),
        Arc::clone(&clock),
        Arc::clone(&engine),
        log_store.clone(),
        Some(stats.clone()),
        SessionOptions {
            collect_interval_secs: cfg.collect_interval_secs,
            stats_enabled: cfg.stats_enabled,
            library_dir: cfg.library_dir.clone(),
        },
    ));

    let player = Player::new(xmds, cache.clone(), Arc::clone(&engine));

    let cancel = CancellationToken::new();
    let mut tasks = JoinSet::new();
    tasks.spawn(logs::run_writer(log_rx, log_store, cancel.clone()));
    tasks.spawn(player.run(session.feed(), cancel.clone()));
    tasks.spawn(
        Arc::clone(&engine).run(Duration::from_secs(cfg.assess_interval_secs), cancel.clone()),
    );
    tasks.spawn(Arc::clone(&session).start(cfg.collect_interval_secs, cancel.clone()));
    tasks.spawn(Arc::clone(&session).run_log_drain(cancel.clone()));
    tasks.spawn(stats.clone().run_cleanup(
        Duration::from_secs(STATS_CLEANUP_INTERVAL_SECS),
        STATS_MAX_OPEN_AGE_SECS,
        cancel.clone(),
    ));

    let app = build_router(AppState {
        version: env!("CARGO_PKG_VERSION").to_string(),
        cache,
        engine,
        session,
        stats,
    });

    // Loopback only; the renderer lives on the same box.
    let addr: SocketAddr = cfg.bind.parse().with_context(|| format!("invalid bind address {}", cfg.bind))?;
    info!("signage engine starting on http://{addr}");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    cancel.cancel();
    while let Some(joined) = tasks.join_next().await {
        if let Err(e) = joined {
            warn!("background task ended abnormally: {e}");
        }
    }
    info!("signage engine stopped");

    Ok(())
}
