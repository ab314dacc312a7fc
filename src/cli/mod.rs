//! CLI mode for deck-cache: install, inspect and serve the offline cache.

mod progress;

use std::path::PathBuf;
use std::sync::Arc;

use tokio::io::AsyncWriteExt;

use crate::storage::{Cache, CacheStorage};
use crate::{
    AppConfig, DiskCacheStorage, HttpFetcher, InstallProgress, Registration, Request,
    UpdateOutcome,
};

use progress::{InstallBar, print_cache, print_update};

type DiskRegistration = Registration<DiskCacheStorage, HttpFetcher>;

/// A parsed command line.
#[derive(Debug, Default, PartialEq, Eq)]
struct Args {
    config: Option<PathBuf>,
    cache_dir: Option<PathBuf>,
    scope: Option<String>,
    command: Command,
}

#[derive(Debug, Default, PartialEq, Eq)]
enum Command {
    Update,
    Fetch {
        urls: Vec<String>,
        output: Option<PathBuf>,
    },
    List,
    Clear,
    Serve {
        host: Option<String>,
        port: Option<u16>,
    },
    #[default]
    Help,
}

fn print_usage() {
    eprintln!("Usage: deck-cache [OPTIONS] <COMMAND>");
    eprintln!();
    eprintln!("Commands:");
    eprintln!("  update              Pre-fetch the resource list and drop stale caches");
    eprintln!("  fetch <url>...      Answer requests from cache, else from the network");
    eprintln!("  list                Show caches and their entries");
    eprintln!("  clear               Delete every cache");
    eprintln!("  serve               Serve requests over HTTP through the cache");
    eprintln!();
    eprintln!("Options:");
    eprintln!("  -c, --config <FILE>     Config file (default: platform config dir)");
    eprintln!("  -d, --cache-dir <DIR>   Cache directory (default: platform cache dir)");
    eprintln!("  -s, --scope <URL>       Base URL for relative resources");
    eprintln!("  -o, --output <FILE>     fetch: write the body to FILE");
    eprintln!("      --host <HOST>       serve: bind address");
    eprintln!("  -p, --port <PORT>       serve: bind port");
    eprintln!("  -h, --help              Show this help");
}

/// Returns the value following flag `args[*i]`, advancing `i`.
fn take_value(args: &[String], i: &mut usize) -> Result<String, String> {
    let flag = &args[*i];
    *i += 1;
    args.get(*i)
        .cloned()
        .ok_or_else(|| format!("{flag} requires a value"))
}

fn parse_args(args: &[String]) -> Result<Args, String> {
    let mut parsed = Args::default();
    let mut command: Option<String> = None;
    let mut positional = Vec::new();
    let mut output = None;
    let mut host = None;
    let mut port = None;

    let mut i = 0;
    while i < args.len() {
        match args[i].as_str() {
            "-c" | "--config" => parsed.config = Some(take_value(args, &mut i)?.into()),
            "-d" | "--cache-dir" => parsed.cache_dir = Some(take_value(args, &mut i)?.into()),
            "-s" | "--scope" => parsed.scope = Some(take_value(args, &mut i)?),
            "-o" | "--output" => output = Some(PathBuf::from(take_value(args, &mut i)?)),
            "--host" => host = Some(take_value(args, &mut i)?),
            "-p" | "--port" => {
                let value = take_value(args, &mut i)?;
                port = Some(value.parse().map_err(|_| format!("Invalid port: {value}"))?);
            }
            "-h" | "--help" => return Ok(Args::default()),
            arg if arg.starts_with('-') => return Err(format!("Unknown option: {arg}")),
            arg if command.is_none() => command = Some(arg.to_string()),
            arg => positional.push(arg.to_string()),
        }
        i += 1;
    }

    parsed.command = match command.as_deref() {
        None | Some("help") => Command::Help,
        Some("update") => Command::Update,
        Some("fetch") if positional.is_empty() => {
            return Err("fetch requires at least one URL".to_string());
        }
        Some("fetch") if output.is_some() && positional.len() > 1 => {
            return Err("--output takes a single URL".to_string());
        }
        Some("fetch") => Command::Fetch {
            urls: positional,
            output,
        },
        Some("list") => Command::List,
        Some("clear") => Command::Clear,
        Some("serve") => Command::Serve { host, port },
        Some(other) => return Err(format!("Unknown command: {other}")),
    };
    Ok(parsed)
}

fn load_config(args: &Args) -> crate::Result<AppConfig> {
    let path = args
        .config
        .clone()
        .unwrap_or_else(|| AppConfig::default().paths.config_file);
    let mut config = AppConfig::load(&path)?;
    if let Some(dir) = &args.cache_dir {
        config.paths.cache_dir.clone_from(dir);
    }
    if let Some(scope) = &args.scope {
        config.worker.scope.clone_from(scope);
    }
    Ok(config)
}

/// Creates a registration over the on-disk store, adopting a complete
/// generation from an earlier run if there is one.
async fn open_registration(config: &AppConfig) -> crate::Result<DiskRegistration> {
    let storage = Arc::new(DiskCacheStorage::new(&config.paths.cache_dir));
    let fetcher = Arc::new(HttpFetcher::new()?);
    let mut registration = Registration::new(storage, fetcher);
    registration.restore(config.worker.clone()).await?;
    Ok(registration)
}

async fn run_update(config: &AppConfig, registration: &mut DiskRegistration) -> crate::Result<()> {
    let bar = Arc::new(InstallBar::new());
    let progress: Arc<dyn InstallProgress> = bar.clone();
    let outcome = registration.update(config.worker.clone(), &progress).await;
    bar.finish();

    match outcome? {
        UpdateOutcome::Unchanged => {
            println!("Cache {} is up to date.", config.worker.cache_name);
        }
        UpdateOutcome::Activated { install, activate } => print_update(&install, &activate),
    }
    Ok(())
}

async fn run_fetch(
    config: &AppConfig,
    registration: &DiskRegistration,
    urls: &[String],
    output: Option<&PathBuf>,
) -> crate::Result<()> {
    let mut stdout = tokio::io::stdout();

    for raw in urls {
        let request = Request::get(config.worker.resolve(raw)?);
        let hits_before = registration.active().map(|w| w.stats().snapshot().hits);

        let response = registration.fetch(&request).await?;

        let hits_after = registration.active().map(|w| w.stats().snapshot().hits);
        let source = if hits_after > hits_before { "cache" } else { "network" };
        eprintln!(
            "{} {} ({}, {})",
            response.status,
            request.url,
            crate::format_bytes(response.len()),
            source
        );

        if let Some(path) = output {
            tokio::fs::write(path, &response.body).await?;
        } else {
            stdout.write_all(&response.body).await?;
        }
    }
    stdout.flush().await?;
    Ok(())
}

async fn run_list(config: &AppConfig, storage: &DiskCacheStorage) -> crate::Result<()> {
    let names = storage.keys().await?;
    if names.is_empty() {
        println!("No caches in {}", storage.root().display());
        return Ok(());
    }
    for name in names {
        let Some(cache) = storage.open_existing(&name).await? else {
            continue;
        };
        let entries = cache.entries().await?;
        print_cache(&name, name == config.worker.cache_name, &entries);
    }
    Ok(())
}

async fn run_clear(storage: &DiskCacheStorage) -> crate::Result<()> {
    let mut deleted = 0;
    for name in storage.keys().await? {
        if storage.delete(&name).await? {
            log::info!("Deleted cache {name}");
            deleted += 1;
        }
    }
    println!("Deleted {deleted} cache(s).");
    Ok(())
}

#[cfg(feature = "server")]
async fn run_serve(
    config: &AppConfig,
    mut registration: DiskRegistration,
    host: Option<String>,
    port: Option<u16>,
) -> crate::Result<()> {
    let progress: Arc<dyn InstallProgress> = Arc::new(crate::NoProgress);
    match registration.update(config.worker.clone(), &progress).await {
        Ok(UpdateOutcome::Unchanged) => {}
        Ok(UpdateOutcome::Activated { install, .. }) => log::info!(
            "Installed {} ({} resources, {})",
            install.cache_name,
            install.resources,
            crate::format_bytes(install.bytes)
        ),
        // Keep serving with whatever generation (if any) is active.
        Err(e) => log::error!("Update failed: {e}"),
    }

    let scope = config.worker.scope_url()?;
    let host = host.unwrap_or_else(|| config.server.host.clone());
    let port = port.unwrap_or(config.server.port);
    crate::server::run_server(Arc::new(registration), scope, &host, port).await
}

#[cfg(not(feature = "server"))]
async fn run_serve(
    _config: &AppConfig,
    _registration: DiskRegistration,
    _host: Option<String>,
    _port: Option<u16>,
) -> crate::Result<()> {
    eprintln!("Server support not compiled in");
    std::process::exit(1);
}

/// Runs the CLI with the process arguments.
///
/// # Errors
///
/// Returns an error if the selected command fails.
pub async fn run() -> crate::Result<()> {
    let raw: Vec<String> = std::env::args().skip(1).collect();
    let args = match parse_args(&raw) {
        Ok(args) => args,
        Err(msg) => {
            eprintln!("Error: {msg}");
            eprintln!();
            print_usage();
            std::process::exit(2);
        }
    };

    if args.command == Command::Help {
        print_usage();
        return Ok(());
    }

    let config = load_config(&args)?;
    log::debug!("Cache directory: {}", config.paths.cache_dir.display());

    match args.command {
        Command::Update => {
            let mut registration = open_registration(&config).await?;
            run_update(&config, &mut registration).await
        }
        Command::Fetch { urls, output } => {
            let registration = open_registration(&config).await?;
            run_fetch(&config, &registration, &urls, output.as_ref()).await
        }
        Command::List => run_list(&config, &DiskCacheStorage::new(&config.paths.cache_dir)).await,
        Command::Clear => run_clear(&DiskCacheStorage::new(&config.paths.cache_dir)).await,
        Command::Serve { host, port } => {
            let registration = open_registration(&config).await?;
            run_serve(&config, registration, host, port).await
        }
        Command::Help => Ok(()),
    }
}
