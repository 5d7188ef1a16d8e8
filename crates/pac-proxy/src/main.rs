use anyhow::Context;
use clap::Parser;
use pac_proxy::config::Config;
use pac_proxy::proxy::ProxyServer;
use std::path::PathBuf;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "pac-proxy", version, about = "Forward proxy routed by a PAC script")]
struct Args {
    /// Routing script defining FindProxyForURL(url, host)
    #[arg(value_name = "PAC_FILE", required_unless_present = "config")]
    pac_file: Option<PathBuf>,

    #[arg(short, long, env = "PAC_PROXY_PORT")]
    port: Option<u16>,

    /// Address to listen on
    #[arg(long)]
    bind: Option<String>,

    /// How often the routing script is checked for changes
    #[arg(long, value_name = "MS")]
    reload_interval_ms: Option<u64>,

    /// YAML configuration file; command line flags take precedence
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Emit logs as JSON
    #[arg(long)]
    log_json: bool,
}

impl Args {
    fn into_config(self) -> Result<Config, anyhow::Error> {
        let mut config = match (&self.config, &self.pac_file) {
            (Some(path), _) => Config::from_file(path)?,
            (None, Some(pac_file)) => Config::new(pac_file),
            (None, None) => anyhow::bail!("a PAC file or --config is required"),
        };

        if let Some(pac_file) = self.pac_file {
            config.script.path = pac_file;
        }
        if let Some(port) = self.port {
            config.listen.port = port;
        }
        if let Some(bind) = self.bind {
            config.listen.host = bind;
        }
        if let Some(interval) = self.reload_interval_ms {
            config.script.reload_interval_ms = interval;
        }
        config.validate()?;
        Ok(config)
    }
}

fn init_tracing(json: bool) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("pac_proxy=info"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

async fn run(args: Args) -> Result<(), anyhow::Error> {
    let config = args.into_config().context("invalid configuration")?;
    let server = ProxyServer::bind(&config).await?;
    server
        .run_until(async {
            if let Err(err) = tokio::signal::ctrl_c().await {
                error!("Failed to listen for Ctrl-C: {}", err);
                std::future::pending::<()>().await;
            }
        })
        .await?;
    info!("Stopped");
    Ok(())
}

#[tokio::main]
async fn main() {
    let args = Args::parse();
    init_tracing(args.log_json);

    if let Err(err) = run(args).await {
        error!("{:#}", err);
        std::process::exit(1);
    }
}
