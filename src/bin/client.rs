//! hoptun Client Binary
//!
//! Usage: hoptun-client [OPTIONS]
//!
//! Options:
//!   -c, --config <FILE>  Path to configuration file
//!   -t, --test <FILE>    Dial every stream endpoint once
//!   --generate-secret    Print a fresh base32 secret
//!   -h, --help           Print help information

use std::env;
use std::path::Path;
use std::sync::Arc;

use hoptun::client::{load_client_configs, Client, Dialer};
use hoptun::config::Protocol;
use hoptun::crypto::SharedSecret;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
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
        "-t" | "--test" => {
            if args.len() < 3 {
                eprintln!("Error: --test requires a config file path");
                return Ok(());
            }
            test_connection(&args[2]).await?;
        }
        "-c" | "--config" => {
            if args.len() < 3 {
                eprintln!("Error: --config requires a file path");
                return Ok(());
            }
            run_client(&args[2]).await?;
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
        r#"hoptun Client - port-hopping tunnel

USAGE:
    hoptun-client [OPTIONS]

OPTIONS:
    -c, --config <FILE>  Path to configuration file (JSON, or TOML by extension)
    -t, --test <FILE>    Dial every stream endpoint once and report the port used
    --generate-secret    Print a fresh base32 secret
    -h, --help           Print help information

CONFIGURATION FILE FORMAT (JSON):
    {{
        "name": "ssh",
        "server_host": "tunnel.example.com",
        "port_range": {{ "min": 20000, "max": 20100 }},
        "protocol": "tcp",
        "totp_secret": "<base32>",
        "step_seconds": 30,
        "bind_ip": "127.0.0.1",
        "bind_port": 2222
    }}

EXAMPLES:
    Test connection:
        hoptun-client --test client.json

    Run the client:
        hoptun-client --config client.json
"#
    );
}

async fn test_connection(config_path: &str) -> anyhow::Result<()> {
    let configs = load_client_configs(Path::new(config_path))?;

    for config in &configs {
        if config.protocol != Protocol::Tcp {
            println!("[{}] skipped: datagram endpoints cannot be probed", config.name);
            continue;
        }

        let dialer = Dialer::new(config);
        let window = dialer.window();
        match dialer.connect(&window).await {
            Ok((_, candidate)) => println!(
                "[{}] connected to {}:{} (step {})",
                config.name, config.server_host, candidate.port, candidate.step
            ),
            Err(e) => println!("[{}] failed: {}", config.name, e),
        }
    }

    Ok(())
}

async fn run_client(config_path: &str) -> anyhow::Result<()> {
    let configs = load_client_configs(Path::new(config_path))?;

    let mut endpoints = tokio::task::JoinSet::new();
    for config in configs {
        let client = Arc::new(Client::new(config)?);
        endpoints.spawn(async move {
            let name = client.config().name.clone();
            (name, client.run().await)
        });
    }

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("shutting down");
                endpoints.abort_all();
                return Ok(());
            }
            finished = endpoints.join_next() => match finished {
                Some(Ok((name, Err(e)))) => {
                    anyhow::bail!("endpoint {} failed: {}", name, e);
                }
                Some(Ok((_, Ok(())))) => {}
                Some(Err(e)) => anyhow::bail!("endpoint task panicked: {}", e),
                None => return Ok(()),
            }
        }
    }
}
