use std::env;
use std::path::PathBuf;
use std::sync::Arc;

use mrepo_cache::server::run_server;
use mrepo_cache::{
    AppConfig, CacheStorage, DiskStorage, HttpOrigin, Interceptor, MemoryStorage, Notifier, Origin,
    VersionController,
};

fn print_usage() {
    eprintln!("Usage: mrepo-cache [OPTIONS]");
    eprintln!();
    eprintln!("Serves the application through a versioned offline cache.");
    eprintln!();
    eprintln!("Options:");
    eprintln!("  --config <PATH>     TOML configuration file");
    eprintln!("  --origin <URL>      Origin server (default: http://127.0.0.1:5000)");
    eprintln!("  --host <HOST>       Bind address (default: 127.0.0.1)");
    eprintln!("  --port <PORT>       Bind port (default: 8787)");
    eprintln!("  --ephemeral         Keep stores in memory only");
    eprintln!("  -h, --help          Show this help");
    eprintln!();
    eprintln!("Environment: MREPO_ORIGIN, MREPO_CACHE_DIR, MREPO_HOST, MREPO_PORT, RUST_LOG");
}

struct Args {
    config: Option<PathBuf>,
    origin: Option<String>,
    host: Option<String>,
    port: Option<u16>,
    ephemeral: bool,
}

fn value(args: &[String], i: usize, flag: &str) -> String {
    args.get(i).cloned().unwrap_or_else(|| {
        eprintln!("Error: {flag} requires a value");
        std::process::exit(1);
    })
}

fn parse_args() -> Args {
    let args: Vec<String> = env::args().skip(1).collect();
    let mut parsed = Args {
        config: None,
        origin: None,
        host: None,
        port: None,
        ephemeral: false,
    };

    let mut i = 0;
    while i < args.len() {
        match args[i].as_str() {
            "-h" | "--help" => {
                print_usage();
                std::process::exit(0);
            }
            "--config" => {
                i += 1;
                parsed.config = Some(PathBuf::from(value(&args, i, "--config")));
            }
            "--origin" => {
                i += 1;
                parsed.origin = Some(value(&args, i, "--origin"));
            }
            "--host" => {
                i += 1;
                parsed.host = Some(value(&args, i, "--host"));
            }
            "--port" => {
                i += 1;
                let raw = value(&args, i, "--port");
                parsed.port = Some(raw.parse().unwrap_or_else(|_| {
                    eprintln!("Error: invalid port: {raw}");
                    std::process::exit(1);
                }));
            }
            "--ephemeral" => parsed.ephemeral = true,
            other => {
                eprintln!("Error: unknown argument: {other}");
                print_usage();
                std::process::exit(1);
            }
        }
        i += 1;
    }
    parsed
}

#[tokio::main]
async fn main() -> mrepo_cache::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = parse_args();
    let mut config = AppConfig::load(args.config.as_deref())?;
    if let Some(origin) = args.origin {
        config.server.origin = origin;
    }
    if let Some(host) = args.host {
        config.server.host = host;
    }
    if let Some(port) = args.port {
        config.server.port = port;
    }
    config.validate()?;

    let origin: Arc<dyn Origin> = Arc::new(HttpOrigin::new(config.server.origin_url()?)?);
    let storage: Arc<dyn CacheStorage> = if args.ephemeral {
        log::info!("Using in-memory stores");
        Arc::new(MemoryStorage::new())
    } else {
        log::info!("Using stores in {}", config.paths.store_dir.display());
        Arc::new(DiskStorage::new(&config.paths.store_dir))
    };

    let controller = Arc::new(VersionController::new(
        config.cache.clone(),
        Arc::clone(&origin),
        storage,
        Notifier::default(),
    )?);
    let interceptor = Arc::new(Interceptor::new(Arc::clone(&controller), origin));

    let installing = Arc::clone(&controller);
    tokio::spawn(async move { installing.install().await });

    run_server(&config.server, controller, interceptor).await
}
