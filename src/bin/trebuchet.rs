use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use trebuchet::{logger, CertificateAuthority, Config, ProxyServer};

/// Intercepting HTTP/HTTPS proxy for application security testing.
///
/// HTTPS traffic is intercepted with certificates signed by a local root;
/// clients must trust `<ca-dir>/ca.crt`.
#[derive(Parser, Debug)]
#[command(name = "trebuchet")]
#[command(version, about)]
struct Cli {
  /// YAML configuration file; a missing file means defaults
  #[arg(short = 'c', long, default_value = "config/config.yaml")]
  config: PathBuf,

  /// Listen address, `host:port` or `:port`
  #[arg(short = 'l', long)]
  listen: Option<String>,

  /// Log level or filter directive
  #[arg(long)]
  log_level: Option<String>,

  /// Directory holding the root certificate and key
  #[arg(long)]
  ca_dir: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
  let cli = Cli::parse();
  let mut config =
    Config::load(&cli.config).with_context(|| format!("failed to load config from {:?}", cli.config))?;
  if let Some(listen) = cli.listen {
    config.server.listen = listen;
  }
  if let Some(level) = cli.log_level {
    config.server.log_level = level;
  }
  if let Some(dir) = cli.ca_dir {
    config.ca.dir = dir;
  }

  logger::init(&config.server.log_level)?;

  let authority = CertificateAuthority::bootstrap(&config.ca.dir)
    .await
    .context("certificate authority bootstrap failed")?;
  if let Some(path) = authority.ca_cert_path() {
    tracing::info!("[MAIN] clients must trust {}", path.display());
  }

  let mut builder = ProxyServer::builder()
    .authority(Arc::new(authority))
    .client(config.client()?)
    .store(config.store())
    .tunnel_options(config.tunnel_options())
    .injector(config.injector.enabled)
    .payloads(&config.injector.path_payload, &config.injector.value_payload)
    .shutdown_grace(config.shutdown_grace());
  if let Some(cache) = config.leaf_cache() {
    builder = builder.leaf_cache(cache);
  }
  let server = builder
    .bind(&config.listen_addr())
    .await
    .context("cannot start listener")?;

  let registry = server.registry().clone();
  let serve = server.run_until(async {
    if let Err(e) = tokio::signal::ctrl_c().await {
      tracing::error!("[MAIN] cannot listen for ctrl-c: {}", e);
      std::future::pending::<()>().await;
    }
  });
  tokio::pin!(serve);
  tokio::select! {
    served = &mut serve => served?,
    _ = second_ctrl_c() => {
      tracing::warn!("[MAIN] second ctrl-c, closing {} tunnel(s) now", registry.live());
      registry.close_all();
      serve.await?;
    }
  }
  tracing::info!("[MAIN] bye");
  Ok(())
}

/// Resolves on the second ctrl-c; the first one starts the drain.
async fn second_ctrl_c() {
  for _ in 0..2 {
    if tokio::signal::ctrl_c().await.is_err() {
      std::future::pending::<()>().await;
    }
  }
}
