use clap::Parser;
use orchestrator::{Config, Orchestrator};

/// webmod - web-based HTTP/HTTPS intercepting proxy
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// API listen host
    #[arg(long)]
    api_host: Option<String>,

    /// API listen port
    #[arg(long)]
    api_port: Option<u16>,

    /// Proxy listen host
    #[arg(long)]
    proxy_host: Option<String>,

    /// Proxy listen port
    #[arg(long)]
    proxy_port: Option<u16>,

    /// Database connection URL
    #[arg(long)]
    database_url: Option<String>,

    /// Directory holding the root CA key and certificate
    #[arg(long)]
    cert_dir: Option<std::path::PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();
    orchestrator::logging::init_logging(&args.log_level);

    let mut config = Config::from_env();
    if let Some(host) = args.api_host {
        config.api_host = host;
    }
    if let Some(port) = args.api_port {
        config.api_port = port;
    }
    if let Some(host) = args.proxy_host {
        config.proxy_host = host;
    }
    if let Some(port) = args.proxy_port {
        config.proxy_port = port;
    }
    if let Some(url) = args.database_url {
        config.database_url = url;
    }
    if let Some(dir) = args.cert_dir {
        config.cert_dir = dir;
    }

    println!("webmod starting");
    println!("  proxy: {}:{}", config.proxy_host, config.proxy_port);
    println!("  api:   http://{}:{}", config.api_host, config.api_port);
    println!("  db:    {}", config.database_url);

    let orchestrator = Orchestrator::new(config).await?;

    let server = orchestrator.start();
    tokio::select! {
        result = server => result?,
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("shutting down");
            orchestrator.shutdown().await;
        }
    }

    Ok(())
}
