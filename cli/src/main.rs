//! chainsock CLI: talk to a node over a persistent IPC or WebSocket connection.
//!
//! Usage:
//! ```bash
//! # One JSON-RPC call over the default geth IPC socket
//! chainsock call --method eth_blockNumber
//!
//! # Call with params over a websocket
//! chainsock call --ws ws://127.0.0.1:8546 --method eth_getBalance --params '["0xde0b...", "latest"]'
//!
//! # Liveness probe
//! chainsock ping --ipc ~/.ethereum/geth.ipc
//!
//! # Print five new heads, then unsubscribe
//! chainsock subscribe --ws ws://127.0.0.1:8546 --kind newHeads --count 5
//! ```

mod logging;

use std::env;
use std::path::{Path, PathBuf};
use std::process;
use std::time::Instant;

use anyhow::{anyhow, bail, Context};
use chainsock_core::{PersistentConnection, PersistentProvider, ProviderConfig, ProviderError, SocketConnector};
use chainsock_ipc::{default_ipc_path, ipc_provider};
use chainsock_ws::ws_provider;
use serde::Deserialize;
use serde_json::Value;

use crate::logging::{init_tracing, LogConfig};

/// Contents of the `--config` file.
#[derive(Debug, Default, Deserialize)]
struct CliConfig {
    #[serde(default)]
    provider: ProviderConfig,
    #[serde(default)]
    log: LogConfig,
}

enum Endpoint {
    Ipc(PathBuf),
    Ws(String),
}

#[tokio::main]
async fn main() {
    let args: Vec<String> = env::args().collect();
    if args.len() < 2 {
        print_usage();
        process::exit(1);
    }

    let result = match args[1].as_str() {
        "call" => cmd_call(&args[2..]).await,
        "ping" => cmd_ping(&args[2..]).await,
        "subscribe" => cmd_subscribe(&args[2..]).await,
        "version" | "--version" | "-V" => {
            println!("chainsock {}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
        "help" | "--help" | "-h" => {
            print_usage();
            Ok(())
        }
        other => {
            eprintln!("Unknown command: {other}");
            print_usage();
            process::exit(1);
        }
    };

    if let Err(e) = result {
        eprintln!("Error: {e:#}");
        process::exit(1);
    }
}

fn print_usage() {
    println!("chainsock {}", env!("CARGO_PKG_VERSION"));
    println!("JSON-RPC over persistent IPC and WebSocket connections\n");
    println!("USAGE:");
    println!("    chainsock <COMMAND> [FLAGS]\n");
    println!("COMMANDS:");
    println!("    call       Send one JSON-RPC call and print the result");
    println!("    ping       Check the node answers over the socket");
    println!("    subscribe  Print subscription notifications");
    println!("    version    Print version");
    println!("    help       Print this help\n");
    println!("ENDPOINT FLAGS:");
    println!("    --ipc <PATH>        IPC socket path  [default: geth's default path]");
    println!("    --ws <URL>          WebSocket URL");
    println!("    --config <FILE>     JSON file with `provider` and `log` sections");
    println!("    --log-level <LVL>   trace | debug | info | warn | error\n");
    println!("CALL FLAGS:");
    println!("    --method <NAME>     RPC method  [required]");
    println!("    --params <JSON>     JSON array of params  [default: []]\n");
    println!("SUBSCRIBE FLAGS:");
    println!("    --kind <KIND>       newHeads | logs | newPendingTransactions  [default: newHeads]");
    println!("    --params <JSON>     extra eth_subscribe params  [default: []]");
    println!("    --count <N>         stop after N notifications  [default: unlimited]");
}

/// Shared setup for every networked command: config, logging and endpoint.
fn setup(args: &[String]) -> anyhow::Result<(Endpoint, ProviderConfig)> {
    let mut config = match parse_flag(args, "--config") {
        Some(path) => load_config(Path::new(&path))?,
        None => CliConfig::default(),
    };
    if let Some(level) = parse_flag(args, "--log-level") {
        config.log.level = level;
    }
    init_tracing(&config.log);

    let endpoint = match (parse_flag(args, "--ws"), parse_flag(args, "--ipc")) {
        (Some(_), Some(_)) => bail!("--ws and --ipc are mutually exclusive"),
        (Some(url), None) => Endpoint::Ws(url),
        (None, Some(path)) => Endpoint::Ipc(PathBuf::from(path)),
        (None, None) => Endpoint::Ipc(
            default_ipc_path().ok_or_else(|| anyhow!("no --ipc or --ws given and no default IPC path"))?,
        ),
    };
    tracing::debug!(provider = ?config.provider, "loaded configuration");
    Ok((endpoint, config.provider))
}

fn load_config(path: &Path) -> anyhow::Result<CliConfig> {
    let raw = std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    let config: CliConfig = serde_json::from_str(&raw).with_context(|| format!("parsing {}", path.display()))?;
    config.provider.validate()?;
    Ok(config)
}

async fn cmd_call(args: &[String]) -> anyhow::Result<()> {
    let (endpoint, config) = setup(args)?;
    let method = parse_flag(args, "--method").context("--method is required")?;
    let params = parse_params(args)?;

    let result = match endpoint {
        Endpoint::Ipc(path) => call(ipc_provider(path, config), method, params).await?,
        Endpoint::Ws(url) => call(ws_provider(url, config), method, params).await?,
    };
    println!("{}", serde_json::to_string_pretty(&result)?);
    Ok(())
}

async fn call<C: SocketConnector>(
    provider: PersistentProvider<C>,
    method: String,
    params: Vec<Value>,
) -> anyhow::Result<Value> {
    let conn = PersistentConnection::new(provider);
    let response = conn
        .with_connection(move |p| Box::pin(async move { p.make_request(&method, params).await }))
        .await?;
    Ok(response.into_result().map_err(ProviderError::Rpc)?)
}

async fn cmd_ping(args: &[String]) -> anyhow::Result<()> {
    let (endpoint, config) = setup(args)?;
    match endpoint {
        Endpoint::Ipc(path) => ping(ipc_provider(path, config)).await,
        Endpoint::Ws(url) => ping(ws_provider(url, config)).await,
    }
}

async fn ping<C: SocketConnector>(provider: PersistentProvider<C>) -> anyhow::Result<()> {
    println!("Pinging {provider}...");
    let conn = PersistentConnection::new(provider);
    let (latency, version) = conn
        .with_connection(|p| {
            Box::pin(async move {
                let start = Instant::now();
                p.is_connected(true).await?;
                let latency = start.elapsed();
                let version: String = p.call("web3_clientVersion", vec![]).await?;
                Ok((latency, version))
            })
        })
        .await?;

    println!("  Status:   OK");
    println!("  Client:   {version}");
    println!("  Latency:  {}ms", latency.as_millis());
    Ok(())
}

async fn cmd_subscribe(args: &[String]) -> anyhow::Result<()> {
    let (endpoint, config) = setup(args)?;
    let kind = parse_flag(args, "--kind").unwrap_or_else(|| "newHeads".to_string());
    let params = parse_params(args)?;
    let count = parse_flag(args, "--count")
        .map(|n| n.parse::<usize>().context("--count must be a non-negative integer"))
        .transpose()?;

    match endpoint {
        Endpoint::Ipc(path) => subscribe(ipc_provider(path, config), kind, params, count).await,
        Endpoint::Ws(url) => subscribe(ws_provider(url, config), kind, params, count).await,
    }
}

async fn subscribe<C: SocketConnector>(
    provider: PersistentProvider<C>,
    kind: String,
    params: Vec<Value>,
    count: Option<usize>,
) -> anyhow::Result<()> {
    let conn = PersistentConnection::new(provider);
    conn.with_connection(move |p| {
        Box::pin(async move {
            let id = p.subscribe(&kind, params).await?;
            eprintln!("Subscribed to {kind} as {id}");
            let mut seen = 0;
            while count.map_or(true, |max| seen < max) {
                let note = p.next_notification(&id).await?;
                println!("{note}");
                seen += 1;
            }
            p.unsubscribe(&id).await?;
            Ok(())
        })
    })
    .await?;
    Ok(())
}

fn parse_params(args: &[String]) -> anyhow::Result<Vec<Value>> {
    match parse_flag(args, "--params") {
        Some(raw) => serde_json::from_str(&raw).context("--params must be a JSON array"),
        None => Ok(vec![]),
    }
}

fn parse_flag(args: &[String], flag: &str) -> Option<String> {
    let pos = args.iter().position(|a| a == flag)?;
    args.get(pos + 1).cloned()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(raw: &[&str]) -> Vec<String> {
        raw.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn flags_are_read_by_name() {
        let a = args(&["--ws", "ws://localhost:8546", "--method", "eth_chainId"]);
        assert_eq!(parse_flag(&a, "--method").as_deref(), Some("eth_chainId"));
        assert_eq!(parse_flag(&a, "--ipc"), None);
        assert_eq!(parse_flag(&args(&["--method"]), "--method"), None);
    }

    #[test]
    fn params_must_be_an_array() {
        let ok = parse_params(&args(&["--params", r#"["latest", false]"#])).unwrap();
        assert_eq!(ok, vec![Value::from("latest"), Value::from(false)]);
        assert!(parse_params(&args(&["--params", r#"{"a":1}"#])).is_err());
        assert!(parse_params(&args(&[])).unwrap().is_empty());
    }

    #[test]
    fn config_sections_default_independently() {
        let config: CliConfig = serde_json::from_str(r#"{"provider": {"request_timeout_ms": 2500}}"#).unwrap();
        assert_eq!(config.provider.request_timeout_ms, 2500);
        assert_eq!(config.provider.max_connection_retries, 5);
        assert_eq!(config.log.level, "warn");
    }
}
