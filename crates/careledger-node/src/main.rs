use std::{net::SocketAddr, sync::Arc};

use careledger_core::chain::Chain;
use careledger_node::{config::Args, router, writer::AnchorHandle, AppState};
use careledger_storage::{ChainStore, MemoryStore, SledStore};
use clap::Parser;
use tracing::{info, warn};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info,tower_http=debug")),
        )
        .init();

    let args = Args::parse();
    let store: Arc<dyn ChainStore> = if args.in_memory {
        warn!("running with an in-memory store; the chain is lost on exit");
        Arc::new(MemoryStore::new())
    } else {
        Arc::new(SledStore::open(&args.data_dir)?)
    };
    let chain = Chain::with_config(store.clone(), args.ledger_config());
    let genesis = tokio::task::spawn_blocking({
        let chain = chain.clone();
        move || chain.ensure_genesis()
    })
    .await??;
    info!(hash = %genesis.hash, difficulty = chain.config().difficulty, "chain ready");

    if args.api_token.is_none() {
        warn!("no API token configured; authenticated routes are open");
    }

    let (anchors, writer) = AnchorHandle::spawn(chain.clone());
    let state = AppState::new(chain, anchors, args.api_token.clone(), args.request_timeout());
    let app = router(state);

    let addr: SocketAddr = args.listen.parse()?;
    info!("careledger-node listening on http://{addr}");
    axum::serve(tokio::net::TcpListener::bind(addr).await?, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("shutdown requested");
        })
        .await?;

    // Router state held the last handles; the writer drains its queue and exits.
    writer.await?;
    store.flush()?;
    Ok(())
}
