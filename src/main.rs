//! kmodd - kernel module cache daemon, resolver client and loader.

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use std::collections::HashSet;
use std::path::{Path, PathBuf};

use kmodd::cache::{self, load_blacklist, ModuleCache};
use kmodd::client;
use kmodd::config::Config;
use kmodd::daemon;
use kmodd::loader::{LinuxKernel, Loader};
use kmodd::module::ModuleFile;
use kmodd::server::{CacheServer, ServerConfig};

/// Metadata fields `info` reports, in display order.
const INFO_FIELDS: &[&str] = &[
    "filename",
    "license",
    "author",
    "description",
    "version",
    "srcversion",
    "vermagic",
    "intree",
    "firmware",
    "alias",
    "depends",
    "parm",
];

#[derive(Parser)]
#[command(name = "kmodd")]
#[command(about = "Kernel module cache daemon and dependency-resolving loader")]
#[command(
    after_help = "QUICK START:\n  kmodd serve --foreground   Run the cache daemon\n  kmodd probe ext4           Resolve a name/alias through the daemon\n  kmodd load ext4            Load a module with its dependencies\n  kmodd info ./ext4.ko       Dump embedded module metadata"
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the module cache daemon
    Serve {
        /// Stay in the foreground (do not daemonize)
        #[arg(long)]
        foreground: bool,
        /// Only resolve names and aliases; never issue the kernel load
        #[arg(long)]
        resolve_only: bool,
        /// Unix socket path (default: /run/kmodd.sock)
        #[arg(long)]
        socket: Option<PathBuf>,
        /// Module tree to scan (default: /lib/modules/<release>)
        #[arg(long)]
        module_root: Option<PathBuf>,
        /// Blacklist file (default: /etc/kmodd.blacklist)
        #[arg(long)]
        blacklist: Option<PathBuf>,
        /// Append log output to this file. Without it a daemonized server
        /// logs to stderr, which daemonization redirects to /dev/null
        #[arg(long)]
        log_file: Option<PathBuf>,
    },

    /// Resolve a module name or alias through the daemon
    Probe {
        /// Module name or alias
        identifier: String,
        /// Unix socket path (default: /run/kmodd.sock)
        #[arg(long)]
        socket: Option<PathBuf>,
    },

    /// Build the cache in-process and load a module with its dependencies
    Load {
        /// Module name or alias
        identifier: String,
        /// Parameter string passed to the kernel for the target module
        #[arg(long, default_value = "")]
        params: String,
        /// Skip dependency resolution
        #[arg(long)]
        no_deps: bool,
        /// Module tree to scan (default: /lib/modules/<release>)
        #[arg(long)]
        module_root: Option<PathBuf>,
        /// Blacklist file (default: /etc/kmodd.blacklist)
        #[arg(long)]
        blacklist: Option<PathBuf>,
    },

    /// Print a module file's embedded metadata fields
    Info {
        /// Path to a .ko file
        path: PathBuf,
    },

    /// Print a module file's declared dependencies, one per line
    Deps {
        /// Path to a .ko file
        path: PathBuf,
    },
}

fn main() -> Result<()> {
    // Load .env if present
    dotenvy::dotenv().ok();
    let config = Config::load();
    let cli = Cli::parse();

    // A daemonized server loses stderr to /dev/null, so `serve` may route
    // its log output to a file instead.
    let log_file = match &cli.command {
        Commands::Serve { log_file, .. } => log_file.clone().or_else(|| config.log_file.clone()),
        _ => None,
    };
    init_logging(log_file.as_deref())?;

    match cli.command {
        Commands::Serve {
            foreground,
            resolve_only,
            socket,
            module_root,
            blacklist,
            log_file: _,
        } => cmd_serve(&config, foreground, resolve_only, socket, module_root, blacklist),

        Commands::Probe { identifier, socket } => {
            let socket = socket.unwrap_or_else(|| config.socket_path.clone());
            cmd_probe(&socket, &identifier)
        }

        Commands::Load {
            identifier,
            params,
            no_deps,
            module_root,
            blacklist,
        } => cmd_load(&config, &identifier, &params, !no_deps, module_root, blacklist),

        Commands::Info { path } => cmd_info(&path),

        Commands::Deps { path } => cmd_deps(&path),
    }
}

fn init_logging(log_file: Option<&Path>) -> Result<()> {
    let mut builder =
        env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"));
    if let Some(path) = log_file {
        let file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .with_context(|| format!("cannot open log file {}", path.display()))?;
        builder.target(env_logger::Target::Pipe(Box::new(file)));
    }
    builder.init();
    Ok(())
}

fn cmd_serve(
    config: &Config,
    foreground: bool,
    resolve_only: bool,
    socket: Option<PathBuf>,
    module_root: Option<PathBuf>,
    blacklist: Option<PathBuf>,
) -> Result<()> {
    let module_root = match module_root.or_else(|| config.module_root.clone()) {
        Some(root) => root,
        None => cache::default_module_root().context("cannot determine kernel release")?,
    };
    let server_config = ServerConfig {
        socket_path: socket.unwrap_or_else(|| config.socket_path.clone()),
        module_root,
        blacklist_path: blacklist.unwrap_or_else(|| config.blacklist_path.clone()),
        perform_load: !resolve_only,
    };

    // Bind and build before detaching so startup failures land on stderr.
    let server = CacheServer::init(&server_config)?;
    if !foreground {
        daemon::daemonize(Path::new(daemon::WORKING_DIRECTORY))
            .context("failed to daemonize")?;
    }
    server.run()?;
    Ok(())
}

fn cmd_probe(socket: &Path, identifier: &str) -> Result<()> {
    match client::request(socket, identifier)? {
        Some(path) => {
            println!("{}", path.display());
            Ok(())
        }
        None => bail!("module '{}' not found", identifier),
    }
}

fn cmd_load(
    config: &Config,
    identifier: &str,
    params: &str,
    with_dependencies: bool,
    module_root: Option<PathBuf>,
    blacklist: Option<PathBuf>,
) -> Result<()> {
    let module_root = match module_root.or_else(|| config.module_root.clone()) {
        Some(root) => root,
        None => cache::default_module_root().context("cannot determine kernel release")?,
    };
    let blacklist_path = blacklist.unwrap_or_else(|| config.blacklist_path.clone());
    let blacklist: HashSet<String> = load_blacklist(&blacklist_path)
        .with_context(|| format!("cannot read blacklist {}", blacklist_path.display()))?;

    let cache = ModuleCache::generate(&module_root, &blacklist)?;
    let loader = Loader::new(&cache, LinuxKernel);
    loader.load(identifier, params, with_dependencies)?;
    Ok(())
}

fn cmd_info(path: &Path) -> Result<()> {
    let module = ModuleFile::open(path)?;
    println!("name:           {}", module.name());
    for key in INFO_FIELDS {
        for value in module.fields(key) {
            println!("{:<15} {}", format!("{key}:"), value);
        }
    }
    Ok(())
}

fn cmd_deps(path: &Path) -> Result<()> {
    let module = ModuleFile::open(path)?;
    for dependency in module.dependencies() {
        println!("{dependency}");
    }
    Ok(())
}
