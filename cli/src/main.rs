//! chainrelay CLI: query blockchain nodes from the terminal.
//!
//! Every command goes through the blocking failover ladder: the local node
//! alone when `--local` (or `local_node` in the config file) is set, the
//! hosted nodes in order otherwise.
//!
//! Usage:
//! ```bash
//! chainrelay block
//! chainrelay call --method eth_getBalance --params '["0xabc…", "latest"]' --returns bignumber
//! chainrelay tx 0x5c50…
//! chainrelay --local http://localhost:8545 call --method net_version
//! ```

mod logging;

use std::env;
use std::process;
use std::sync::Arc;

use anyhow::{anyhow, bail, Context, Result};
use serde_json::Value;

use chainrelay_client::{BlockingLadder, Dispatcher};
use chainrelay_core::config::ClientConfig;
use chainrelay_core::context::ClientContext;
use chainrelay_core::returns::ReturnKind;

use logging::{init_tracing, LogConfig};

fn main() {
    let args: Vec<String> = env::args().skip(1).collect();
    if args.is_empty() {
        print_usage();
        process::exit(1);
    }

    let log = LogConfig {
        level: if has_flag(&args, "--verbose") { "debug".into() } else { "warn".into() },
        json: has_flag(&args, "--json-logs"),
        ..LogConfig::default()
    };
    init_tracing(&log);

    if let Err(e) = run(&args) {
        eprintln!("Error: {e:#}");
        process::exit(1);
    }
}

fn run(args: &[String]) -> Result<()> {
    let Some(command) = args.iter().find(|a| !a.starts_with("--") && !is_flag_value(args, a)) else {
        print_usage();
        return Ok(());
    };

    match command.as_str() {
        "call" => cmd_call(args),
        "block" => cmd_block(args),
        "tx" => cmd_tx(args),
        "sha3" => {
            let input = positional(args, "sha3").ok_or_else(|| anyhow!("sha3 needs an input"))?;
            println!("{}", Dispatcher::sha3(&input));
            Ok(())
        }
        "version" => {
            println!("chainrelay {}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
        "help" => {
            print_usage();
            Ok(())
        }
        other => {
            print_usage();
            bail!("unknown command: {other}")
        }
    }
}

fn print_usage() {
    println!("chainrelay {}", env!("CARGO_PKG_VERSION"));
    println!("Query blockchain nodes with local-first failover\n");
    println!("USAGE:");
    println!("    chainrelay [FLAGS] <COMMAND>\n");
    println!("COMMANDS:");
    println!("    call       Send one JSON-RPC call");
    println!("    block      Print the latest block number");
    println!("    tx <HASH>  Fetch a transaction by hash");
    println!("    sha3 <IN>  Keccak-256 of hex (0x…) or UTF-8 input");
    println!("    version    Print version");
    println!("    help       Print this help\n");
    println!("FLAGS:");
    println!("    --config <FILE>    JSON client config");
    println!("    --local <URL>      Use only this node; never fall back to hosted nodes");
    println!("    --verbose          Debug logging (RUST_LOG overrides)");
    println!("    --json-logs        Emit logs as JSON lines\n");
    println!("CALL FLAGS:");
    println!("    --method <NAME>    Full method name, e.g. eth_chainId  [required]");
    println!("    --params <JSON>    JSON array of params  [default: []]");
    println!("    --returns <KIND>   raw | number | bignumber | fixed | address | hash ([] suffix for arrays)");
}

fn load_config(args: &[String]) -> Result<ClientConfig> {
    let mut config = match parse_flag(args, "--config") {
        Some(path) => {
            let text = std::fs::read_to_string(&path).with_context(|| format!("reading {path}"))?;
            ClientConfig::from_json_str(&text).with_context(|| format!("parsing {path}"))?
        }
        None => ClientConfig::default(),
    };
    if let Some(local) = parse_flag(args, "--local") {
        config = config.with_local_node(local);
    }
    if config.http_nodes().is_empty() {
        bail!("no node configured: pass --local or list hosted_nodes in --config");
    }
    Ok(config)
}

fn ladder(args: &[String]) -> Result<BlockingLadder> {
    let config = load_config(args)?;
    tracing::debug!(nodes = ?config.http_nodes(), local = config.local_node.is_some(), "ladder");
    Ok(BlockingLadder::from_config(Arc::new(ClientContext::new()), &config))
}

fn cmd_call(args: &[String]) -> Result<()> {
    let method = parse_flag(args, "--method").ok_or_else(|| anyhow!("--method is required"))?;
    let params = match parse_flag(args, "--params") {
        Some(raw) => match serde_json::from_str::<Value>(&raw).context("--params is not JSON")? {
            Value::Array(items) => items,
            other => vec![other],
        },
        None => Vec::new(),
    };
    let returns: ReturnKind = match parse_flag(args, "--returns") {
        Some(kind) => kind.parse()?,
        None => ReturnKind::Raw,
    };

    let result = ladder(args)?.call(&method, params, &returns)?;
    print_json(&result);
    Ok(())
}

fn cmd_block(args: &[String]) -> Result<()> {
    let block = ladder(args)?.call("eth_blockNumber", vec![], &ReturnKind::Number)?;
    println!("{block}");
    Ok(())
}

fn cmd_tx(args: &[String]) -> Result<()> {
    let hash = positional(args, "tx").ok_or_else(|| anyhow!("tx needs a hash"))?;
    let tx = ladder(args)?.call("eth_getTransactionByHash", vec![Value::String(hash.clone())], &ReturnKind::Raw)?;
    if tx.is_null() {
        bail!("transaction {hash} not found");
    }
    print_json(&tx);
    Ok(())
}

fn print_json(value: &Value) {
    println!("{}", serde_json::to_string_pretty(value).unwrap_or_default());
}

// --- Argument helpers ---

const VALUE_FLAGS: [&str; 5] = ["--config", "--local", "--method", "--params", "--returns"];

fn parse_flag(args: &[String], flag: &str) -> Option<String> {
    let pos = args.iter().position(|a| a == flag)?;
    args.get(pos + 1).cloned()
}

fn has_flag(args: &[String], flag: &str) -> bool {
    args.iter().any(|a| a == flag)
}

fn is_flag_value(args: &[String], candidate: &String) -> bool {
    args.windows(2)
        .any(|w| VALUE_FLAGS.contains(&w[0].as_str()) && std::ptr::eq(&w[1], candidate))
}

/// The first bare argument after `command`.
fn positional(args: &[String], command: &str) -> Option<String> {
    let start = args.iter().position(|a| a == command)? + 1;
    args[start..]
        .iter()
        .find(|a| !a.starts_with("--") && !is_flag_value(args, a))
        .cloned()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn argv(s: &str) -> Vec<String> {
        s.split_whitespace().map(str::to_string).collect()
    }

    #[test]
    fn flag_values_are_not_commands() {
        let args = argv("--local http://localhost:8545 tx 0xabc");
        assert_eq!(parse_flag(&args, "--local").as_deref(), Some("http://localhost:8545"));
        assert_eq!(positional(&args, "tx").as_deref(), Some("0xabc"));
    }

    #[test]
    fn local_flag_shadows_hosted_nodes() {
        let config = load_config(&argv("--local http://127.0.0.1:8545 block")).unwrap();
        assert_eq!(config.http_nodes(), vec!["http://127.0.0.1:8545".to_string()]);
    }
}
