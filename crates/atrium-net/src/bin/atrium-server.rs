//! The Atrium world server binary.

use std::rc::Rc;

use atrium_assets::{AssetError, AssetFetcher};
use atrium_net::{Config, Server};
use futures_util::future::LocalBoxFuture;
use tracing::info;
use tracing_subscriber::EnvFilter;

/// Downloader backed by the local asset directory the upload collaborator
/// writes into. Content-addressed URLs map straight to file names.
struct DirFetcher {
    root: std::path::PathBuf,
}

impl AssetFetcher for DirFetcher {
    fn fetch<'a>(&'a self, url: &'a str) -> LocalBoxFuture<'a, Result<Vec<u8>, AssetError>> {
        Box::pin(async move {
            let parsed = atrium_assets::AssetUrl::parse(url)?;
            let path = self
                .root
                .join(format!("{}.{}", parsed.hash(), parsed.ext().as_str()));
            tokio::fs::read(&path).await.map_err(|e| AssetError::Fetch {
                url: url.to_owned(),
                reason: e.to_string(),
            })
        })
    }
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let config = Config::from_env();
    info!(world = %config.world, addr = %config.listen_addr, "starting");

    let assets_dir = std::env::var("ATRIUM_ASSETS_DIR").unwrap_or_else(|_| "assets".to_owned());
    let fetcher = Rc::new(DirFetcher {
        root: assets_dir.into(),
    });

    // Single-threaded cooperative: one runtime thread, one LocalSet.
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;
    let local = tokio::task::LocalSet::new();
    runtime.block_on(local.run_until(async move {
        let server = Server::bind(config, fetcher).await?;
        info!(addr = ?server.local_addr().map_err(|e| atrium_net::NetError::Transport(e.to_string()))?, "listening");
        server.run().await
    }))?;
    Ok(())
}
