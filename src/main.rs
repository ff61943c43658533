//! book-mirror - mirrors live order books from the terminal server's
//! multiplexed books stream and serves them over HTTP.

use anyhow::{Context, Result};
use clap::Parser;
use std::sync::Arc;
use tokio::{net::TcpListener, sync::broadcast};
use tracing::{debug, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use book_mirror::{
    api::create_router,
    config::{load_env, MirrorConfig},
    AssetSubscription, BookMirror, BookStore,
};

#[derive(Parser, Debug)]
#[command(name = "book-mirror", about = "Order book mirror client")]
struct Args {
    /// Books stream URL
    #[arg(long, env = "BOOK_MIRROR_WS_URL")]
    ws_url: Option<String>,

    /// Comma separated asset ids to mirror at startup
    #[arg(long, env = "BOOK_MIRROR_ASSETS", value_delimiter = ',')]
    assets: Vec<String>,

    /// HTTP port for /health, /metrics and /books
    #[arg(long, env = "BOOK_MIRROR_HTTP_PORT", default_value = "8090")]
    http_port: u16,

    /// Coalescing window (ms)
    #[arg(long, env = "BOOK_MIRROR_FLUSH_WINDOW_MS")]
    flush_window_ms: Option<u64>,
}

#[tokio::main]
async fn main() -> Result<()> {
    load_env();
    init_tracing();

    let args = Args::parse();

    let mut config = MirrorConfig::from_env();
    if let Some(url) = args.ws_url {
        config.ws_url = url;
    }
    if let Some(ms) = args.flush_window_ms.filter(|ms| *ms > 0) {
        config.flush_window_ms = ms;
    }

    info!("Starting book mirror");
    info!("  Books stream: {}", config.ws_url);
    info!("  Flush window: {}ms", config.flush_window_ms);
    info!("  HTTP port: {}", args.http_port);

    let mirror = Arc::new(BookMirror::new(config));

    tokio::spawn(log_trades(mirror.store().subscribe_trades()));
    tokio::spawn(log_frames(mirror.store().clone()));

    let assets: Vec<AssetSubscription> = args
        .assets
        .iter()
        .map(|id| id.trim())
        .filter(|id| !id.is_empty())
        .map(AssetSubscription::new)
        .collect();
    if !assets.is_empty() {
        let diff = mirror.set_desired(assets).await;
        info!(count = diff.added.len(), "Registered startup assets");
    }

    let listener = TcpListener::bind(("0.0.0.0", args.http_port))
        .await
        .with_context(|| format!("Failed to bind HTTP port {}", args.http_port))?;
    info!("HTTP server listening on port {}", args.http_port);

    axum::serve(listener, create_router(mirror.clone()))
        .with_graceful_shutdown(async {
            tokio::signal::ctrl_c().await.ok();
            info!("Shutdown signal received");
        })
        .await
        .context("HTTP server failed")?;

    mirror.shutdown().await;
    info!("Book mirror stopped");
    Ok(())
}

fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "book_mirror=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}

async fn log_trades(mut trades: broadcast::Receiver<book_mirror::TradeNotice>) {
    loop {
        match trades.recv().await {
            Ok(notice) => info!(
                asset_id = %notice.asset_id,
                side = notice.trade.side.as_str(),
                price = notice.trade.price,
                size = notice.trade.size,
                "trade"
            ),
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                warn!(skipped, "trade log lagging");
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

/// One debug line per asset per frame
async fn log_frames(store: Arc<BookStore>) {
    let mut frames = store.subscribe_frame();
    while frames.changed().await.is_ok() {
        let frame = *frames.borrow_and_update();
        let snap = store.snapshot();
        for (asset_id, book) in &snap.books {
            if !book.is_displayable() {
                continue;
            }
            debug!(
                frame,
                asset_id = %asset_id,
                best_bid = ?book.best_bid(),
                best_ask = ?book.best_ask(),
                spread_bps = ?book.spread_bps(),
                "top of book"
            );
        }
    }
}
