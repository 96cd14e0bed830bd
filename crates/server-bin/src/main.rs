//! meridian server binary.
//!
//! Runs one server process: a unified server, or the data-server or
//! render-server half of a split configuration.

use std::path::PathBuf;

use anyhow::Context;
use clap::{Parser, ValueEnum};
use meridian_proto::ServerRole;
use meridian_server::ServerConfig;
use tokio_util::sync::CancellationToken;
use tracing::info;

/// Server command line arguments. Flags override the config file.
#[derive(Parser, Debug)]
#[command(name = "meridian-server")]
#[command(about = "Server process for replicated proxy state")]
struct Args {
	/// Config file (defaults to `<config dir>/meridian/server.toml` if present)
	#[arg(short, long, value_name = "PATH")]
	config: Option<PathBuf>,

	/// Listen host
	#[arg(long)]
	host: Option<String>,

	/// Listen port
	#[arg(short, long)]
	port: Option<u16>,

	/// Process role
	#[arg(long, value_enum)]
	role: Option<RoleArg>,

	/// Reported process count
	#[arg(long)]
	process_count: Option<u32>,

	/// Connect to a listening client at `host:port` instead of listening
	#[arg(long, value_name = "ADDR")]
	reverse_connect: Option<String>,

	/// Verbose logging
	#[arg(short, long)]
	verbose: bool,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum RoleArg {
	DataServer,
	RenderServer,
	Combined,
}

impl From<RoleArg> for ServerRole {
	fn from(role: RoleArg) -> Self {
		match role {
			RoleArg::DataServer => Self::DataServer,
			RoleArg::RenderServer => Self::RenderServer,
			RoleArg::Combined => Self::Combined,
		}
	}
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
	let args = Args::parse();

	setup_tracing(args.verbose);

	let config = load_config(&args)?;
	info!(
		role = ?config.role,
		addr = %config.bind_addr(),
		reverse = ?config.reverse_connect_to,
		"starting meridian-server"
	);

	let shutdown = CancellationToken::new();
	let signal = shutdown.clone();
	tokio::spawn(async move {
		if tokio::signal::ctrl_c().await.is_ok() {
			info!("interrupt received");
			signal.cancel();
		}
	});

	meridian_server::ipc::run(config, shutdown).await?;
	Ok(())
}

fn load_config(args: &Args) -> anyhow::Result<ServerConfig> {
	let path = args.config.clone().or_else(|| {
		dirs::config_dir()
			.map(|dir| dir.join("meridian").join("server.toml"))
			.filter(|p| p.exists())
	});
	let mut config = match &path {
		Some(path) => ServerConfig::load(path)
			.with_context(|| format!("loading {}", path.display()))?,
		None => ServerConfig::default(),
	};

	if let Some(host) = &args.host {
		config.host.clone_from(host);
	}
	if let Some(port) = args.port {
		config.port = port;
	}
	if let Some(role) = args.role {
		config.role = role.into();
	}
	if let Some(count) = args.process_count {
		config.process_count = count;
	}
	if args.reverse_connect.is_some() {
		config.reverse_connect_to.clone_from(&args.reverse_connect);
	}
	Ok(config)
}

fn setup_tracing(verbose: bool) {
	use std::fs::OpenOptions;

	use tracing_subscriber::EnvFilter;
	use tracing_subscriber::fmt::format::FmtSpan;
	use tracing_subscriber::prelude::*;

	let filter = || {
		EnvFilter::try_from_default_env().unwrap_or_else(|_| {
			if verbose {
				EnvFilter::new("meridian_server=trace,debug")
			} else {
				EnvFilter::new("meridian_server=info,warn")
			}
		})
	};

	// MERIDIAN_LOG_DIR redirects logs to a per-pid file
	if let Some(log_dir) = std::env::var("MERIDIAN_LOG_DIR").ok().map(PathBuf::from)
		&& std::fs::create_dir_all(&log_dir).is_ok()
	{
		let log_path = log_dir.join(format!("meridian-server.{}.log", std::process::id()));

		if let Ok(file) = OpenOptions::new().create(true).append(true).open(&log_path) {
			let file_layer = tracing_subscriber::fmt::layer()
				.with_writer(file)
				.with_ansi(false)
				.with_span_events(FmtSpan::CLOSE)
				.with_target(true);

			tracing_subscriber::registry()
				.with(filter())
				.with(file_layer)
				.init();

			info!(path = ?log_path, "server tracing initialized");
			return;
		}
	}

	tracing_subscriber::fmt().with_env_filter(filter()).init();
}
