//! hoptun Server Binary
//!
//! Usage: hoptun-server [OPTIONS]
//!
//! Options:
//!   -c, --config <FILE>      Path to configuration file
//!   --show-ports <FILE>      Print the current hop window of every route
//!   --generate-secret        Print a fresh base32 secret
//!   -h, --help               Print help information

use std::env;
use std::path::Path;
use std::sync::Arc;

use hoptun::crypto::SharedSecret;
use hoptun::hopping::{current_step, PortWindow};
use hoptun::server::{load_server_configs, Server};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing; respects RUST_LOG (e.g. RUST_LOG=debug)
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let args: Vec<String> = env::args().collect();

    if args.len() < 2 {
        print_usage();
        return Ok(());
    }

    match args[1].as_str() {
        "-h" | "--help" => {
            print_usage();
        }
        "--generate-secret" => {
            println!("{}", SharedSecret::generate().to_base32());
        }
        "-c" | "--config" => {
            if args.len() < 3 {
                eprintln!("Error: --config requires a file path");
                return Ok(());
            }
            run_server(&args[2]).await?;
        }
        "--show-ports" => {
            if args.len() < 3 {
                eprintln!("Error: --show-ports requires a config file path");
                return Ok(());
            }
            show_ports(&args[2])?;
        }
        _ => {
            eprintln!("Unknown option: {}", args[1]);
            print_usage();
        }
    }

    Ok(())
}

fn print_usage() {
    println!(
        r#"hoptun Server - port-hopping tunnel

USAGE:
    hoptun-server [OPTIONS]

OPTIONS:
    -c, --config <FILE>      Path to configuration file (JSON, or TOML by extension)
    --show-ports <FILE>      Print the current hop window of every route
    --generate-secret        Print a fresh base32 secret
    -h, --help               Print help information

EXAMPLES:
    Generate a shared secret:
        hoptun-server --generate-secret

    Run the server:
        hoptun-server --config server.json
"#
    );
}

fn show_ports(config_path: &str) -> anyhow::Result<()> {
    let configs = load_server_configs(Path::new(config_path))?;

    for config in &configs {
        let step = current_step(config.step_seconds);
        let window = PortWindow::new(&config.secret, step, config.port_range);
        println!("[{}] step {}", config.name, step);
        for candidate in window.candidates() {
            println!("    port {} (step {})", candidate.port, candidate.step);
        }
    }

    Ok(())
}

async fn run_server(config_path: &str) -> anyhow::Result<()> {
    let configs = load_server_configs(Path::new(config_path))?;

    let mut servers = Vec::with_capacity(configs.len());
    for config in configs {
        tracing::info!(
            route = %config.name,
            protocol = %config.protocol,
            range = %format!("{}-{}", config.port_range.min, config.port_range.max),
            target = %config.target,
            "starting route"
        );
        servers.push(Arc::new(Server::new(config)?));
    }

    let mut routes = tokio::task::JoinSet::new();
    for server in &servers {
        let server = Arc::clone(server);
        routes.spawn(async move {
            let name = server.config().name.clone();
            (name, server.run().await)
        });
    }

    let mut failed = false;
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("shutting down");
                for server in &servers {
                    server.shutdown();
                }
                break;
            }
            finished = routes.join_next() => match finished {
                Some(Ok((name, Err(e)))) => {
                    tracing::error!(route = %name, "route failed: {}", e);
                    failed = true;
                }
                Some(Ok((_, Ok(())))) => {}
                Some(Err(e)) => {
                    tracing::error!("route task panicked: {}", e);
                    failed = true;
                }
                None => break,
            }
        }
    }

    while let Some(finished) = routes.join_next().await {
        if let Ok((name, Err(e))) = finished {
            tracing::error!(route = %name, "route failed: {}", e);
            failed = true;
        }
    }

    if failed {
        anyhow::bail!("one or more routes failed");
    }
    Ok(())
}
