//! Fujian - Python execution server with HTTP and WebSocket APIs.
//!
//! Usage:
//!   fujian [serve] [--port 1987]        # Start the server
//!   fujian exec [FILE]                  # Run one snippet and print the outcome

use std::io::Read;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::process::exit;

use anyhow::Context;
use clap::{Parser, Subcommand};

use fujian::executor::Executor;
use fujian::http_server;
use fujian::namespace::NamespaceSettings;
use fujian::state::{ServerConfig, DEFAULT_ALLOW_ORIGIN, DEFAULT_PORT};

#[derive(Parser, Debug)]
#[command(name = "fujian")]
#[command(about = "Python execution server with HTTP and WebSocket APIs")]
struct Args {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Start the server (the default)
    Serve(ServeArgs),
    /// Run code from FILE (or stdin) in a fresh namespace and print the outcome as JSON
    Exec {
        file: Option<PathBuf>,

        #[command(flatten)]
        python: PythonArgs,
    },
}

#[derive(clap::Args, Debug)]
struct ServeArgs {
    /// Address to bind
    #[arg(long, default_value_t = IpAddr::V4(Ipv4Addr::LOCALHOST))]
    host: IpAddr,

    /// Port to listen on
    #[arg(long, default_value_t = DEFAULT_PORT)]
    port: u16,

    /// Value of the Access-Control-Allow-Origin response header
    #[arg(long, default_value = DEFAULT_ALLOW_ORIGIN)]
    allow_origin: String,

    /// Additional origin prefix accepted for websocket connections
    #[arg(long = "extra-origin")]
    extra_origins: Vec<String>,

    #[command(flatten)]
    python: PythonArgs,
}

impl Default for ServeArgs {
    fn default() -> Self {
        Self {
            host: IpAddr::V4(Ipv4Addr::LOCALHOST),
            port: DEFAULT_PORT,
            allow_origin: DEFAULT_ALLOW_ORIGIN.to_string(),
            extra_origins: Vec::new(),
            python: PythonArgs::default(),
        }
    }
}

#[derive(clap::Args, Debug, Default)]
struct PythonArgs {
    /// Directory of Python modules to add to sys.path
    #[arg(long = "stdlib-path")]
    stdlib_paths: Vec<PathBuf>,

    /// Do not search for a host Python standard library
    #[arg(long)]
    no_host_stdlib: bool,
}

impl PythonArgs {
    fn settings(self) -> NamespaceSettings {
        let settings = NamespaceSettings {
            module_paths: self.stdlib_paths,
        };
        if self.no_host_stdlib {
            settings
        } else {
            settings.with_host_stdlib()
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // stdout belongs to `exec` output; logs go to stderr.
    tracing_subscriber::fmt().with_writer(std::io::stderr).init();

    let args = Args::parse();

    match args.command {
        Some(Commands::Serve(serve)) => serve_with(serve).await,
        None => serve_with(ServeArgs::default()).await,
        Some(Commands::Exec { file, python }) => {
            let failed = exec_once(file, python).await?;
            if failed {
                exit(1);
            }
            Ok(())
        }
    }
}

async fn serve_with(args: ServeArgs) -> anyhow::Result<()> {
    let config = ServerConfig {
        addr: SocketAddr::new(args.host, args.port),
        allow_origin: args.allow_origin,
        extra_origins: args.extra_origins,
        namespace: args.python.settings(),
    };
    http_server::run_server(config).await
}

/// Returns whether the code raised.
async fn exec_once(file: Option<PathBuf>, python: PythonArgs) -> anyhow::Result<bool> {
    let code = match &file {
        Some(path) => std::fs::read_to_string(path)
            .with_context(|| format!("failed to read {}", path.display()))?,
        None => {
            let mut code = String::new();
            std::io::stdin()
                .read_to_string(&mut code)
                .context("failed to read stdin")?;
            code
        }
    };

    let executor = Executor::spawn(python.settings())?;
    let outcome = executor.run(code).await?;
    println!("{}", serde_json::to_string_pretty(&outcome)?);
    Ok(outcome.failed())
}
