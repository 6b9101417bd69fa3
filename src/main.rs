use bifrost_sync::{SyncEngine, TcpTransport, config, logging};
use clap::Parser;
use log::{error, info};

#[derive(Parser)]
#[command(
	name = "bifrost-sync",
	about = "Bifrost - client-side real-time synchronization engine"
)]
struct Cli {
	/// Sync server address (host:port), overriding configuration
	#[arg(long)]
	server: Option<String>,
	/// Client identifier, overriding configuration
	#[arg(long)]
	client_id: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
	let cli = Cli::parse();

	let mut settings = match config::load() {
		Ok(s) => s,
		Err(e) => {
			eprintln!("failed to load config, using defaults: {}", e);
			config::Settings::default()
		}
	};
	if let Some(server) = cli.server {
		settings.server_addr = server;
	}
	if let Some(client_id) = cli.client_id {
		settings.client_id = client_id;
	}

	logging::init_logging(settings.log_level)?;

	let opts = settings.sync_options()?;
	let transport = TcpTransport::new(settings.server_addr.clone());
	let engine = SyncEngine::new(transport, settings.client_id.clone(), opts)?;

	engine.events().subscribe(|event| info!("event: {}", event.name()));

	info!(
		"connecting to {} as {}",
		settings.server_addr, settings.client_id
	);
	if let Err(e) = engine.connect().await {
		error!("connect failed: {}", e);
	}

	tokio::signal::ctrl_c().await?;
	info!("shutting down");
	engine.shutdown().await;
	Ok(())
}
