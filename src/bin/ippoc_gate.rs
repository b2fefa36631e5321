// This file is part of Ippoc Gate and is licensed under the GNU Affero General Public License v3.0 or later.
// See the LICENSE file in the project root for license details.

#![forbid(unsafe_code)]

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{bail, ensure, Context, Result};
use clap::{Args, Parser, Subcommand};
use ippoc_gate::security::audit::generate_token_secret;
use ippoc_gate::trust::{JsonTrustStore, TrustStore};
use ippoc_gate::{
    unix_millis, CapabilityScope, Gateway, GatewayConfig, NodeIdentity, PeerKey, TrustTable,
};
use ippoc_gate::net::MemoryLink;
use tracing_subscriber::EnvFilter;
use zeroize::Zeroizing;

#[derive(Parser)]
#[command(name = "ippoc-gate", about = "Trust-gated capability gateway utility CLI")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Generate a node signing key.
    Keygen(KeygenArgs),
    /// Print the peer key of a node signing key.
    PeerKey(KeyArgs),
    #[command(subcommand)]
    Config(ConfigCommand),
    #[command(subcommand)]
    Trust(TrustCommand),
    /// List capability scopes and what they grant.
    Scopes,
    /// Run handshakes between two in-process gateways.
    Demo(DemoArgs),
}

#[derive(Args)]
struct KeygenArgs {
    #[arg(long, value_name = "FILE")]
    out: PathBuf,
    #[arg(long)]
    force: bool,
}

#[derive(Args)]
struct KeyArgs {
    #[arg(long, value_name = "FILE", default_value = "node.key")]
    key: PathBuf,
}

#[derive(Subcommand)]
enum ConfigCommand {
    Init(ConfigArgs),
    Show(ConfigArgs),
}

#[derive(Args)]
struct ConfigArgs {
    #[arg(long, value_name = "FILE", default_value = "gateway.json")]
    path: PathBuf,
}

#[derive(Subcommand)]
enum TrustCommand {
    Ls(StoreArgs),
    Drop(PeerArgs),
    Reinstate(PeerArgs),
    Forget(PeerArgs),
}

#[derive(Args, Clone)]
struct StoreArgs {
    #[arg(long, default_value = "trust.json")]
    store: PathBuf,
}

#[derive(Args)]
struct PeerArgs {
    peer: PeerKey,
    #[command(flatten)]
    common: StoreArgs,
}

#[derive(Args)]
struct DemoArgs {
    #[arg(long, default_value_t = 11)]
    rounds: u32,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();
    let cli = Cli::parse();
    match cli.command {
        Command::Keygen(args) => handle_keygen(args),
        Command::PeerKey(args) => handle_peer_key(args),
        Command::Config(cmd) => handle_config(cmd),
        Command::Trust(cmd) => handle_trust(cmd),
        Command::Scopes => {
            handle_scopes();
            Ok(())
        }
        Command::Demo(args) => handle_demo(args).await,
    }
}

fn handle_keygen(args: KeygenArgs) -> Result<()> {
    if args.out.exists() && !args.force {
        bail!("{} already exists; pass --force to overwrite", args.out.display());
    }
    let identity = NodeIdentity::generate();
    let encoded = Zeroizing::new(hex::encode(&*identity.secret_bytes()));
    fs::write(&args.out, encoded.as_bytes())
        .with_context(|| format!("failed to write {}", args.out.display()))?;
    println!("{}", identity.peer_key());
    Ok(())
}

fn load_identity(path: &Path) -> Result<NodeIdentity> {
    let text = Zeroizing::new(
        fs::read_to_string(path).with_context(|| format!("failed to read {}", path.display()))?,
    );
    let secret = Zeroizing::new(
        hex::decode(text.trim()).with_context(|| format!("{} is not hex", path.display()))?,
    );
    NodeIdentity::from_secret_bytes(secret)
        .with_context(|| format!("{} does not hold an Ed25519 secret key", path.display()))
}

fn handle_peer_key(args: KeyArgs) -> Result<()> {
    let identity = load_identity(&args.key)?;
    println!("{}", identity.peer_key());
    Ok(())
}

fn handle_config(command: ConfigCommand) -> Result<()> {
    match command {
        ConfigCommand::Init(args) => {
            ensure!(
                !args.path.exists(),
                "{} already exists",
                args.path.display()
            );
            GatewayConfig::default()
                .save_to_path(&args.path)
                .with_context(|| format!("failed to save {}", args.path.display()))?;
            println!("wrote default config to {}", args.path.display());
        }
        ConfigCommand::Show(args) => {
            let config = GatewayConfig::load_from_path(&args.path)
                .with_context(|| format!("failed to load {}", args.path.display()))?;
            println!("{}", serde_json::to_string_pretty(&config)?);
        }
    }
    Ok(())
}

fn handle_trust(command: TrustCommand) -> Result<()> {
    match command {
        TrustCommand::Ls(args) => {
            let store = JsonTrustStore::new(&args.store);
            let entries = store
                .load()
                .with_context(|| format!("failed to load {}", args.store.display()))?;
            if entries.is_empty() {
                println!("no peers");
                return Ok(());
            }
            for entry in entries {
                let record = entry.record;
                println!(
                    "{} {} successes={} failures={} updated={}",
                    entry.peer,
                    record.level,
                    record.total_successes,
                    record.total_failures,
                    record.last_updated
                );
            }
            Ok(())
        }
        TrustCommand::Drop(args) => update_trust(args, |table, peer, now| {
            table.drop_peer(peer, now);
            true
        }),
        TrustCommand::Reinstate(args) => {
            update_trust(args, |table, peer, now| table.reinstate(peer, now))
        }
        TrustCommand::Forget(args) => update_trust(args, |table, peer, _| table.forget(peer)),
    }
}

fn update_trust(
    args: PeerArgs,
    change: impl FnOnce(&TrustTable, &PeerKey, u64) -> bool,
) -> Result<()> {
    let store = JsonTrustStore::new(&args.common.store);
    let table = TrustTable::default();
    table
        .load_from(&store)
        .with_context(|| format!("failed to load {}", args.common.store.display()))?;
    if !change(&table, &args.peer, unix_millis()) {
        bail!("no applicable record for {}", args.peer);
    }
    table
        .save_to(&store)
        .with_context(|| format!("failed to save {}", args.common.store.display()))?;
    println!("{} is now {}", args.peer, table.level(&args.peer));
    Ok(())
}

fn handle_scopes() {
    for scope in CapabilityScope::ALL {
        let covers: Vec<&str> = scope
            .covered_scopes()
            .iter()
            .map(|covered| covered.as_str())
            .collect();
        let mut notes = Vec::new();
        if matches!(scope, CapabilityScope::Admin | CapabilityScope::Security) {
            notes.push("grants every scope".to_string());
        }
        if !covers.is_empty() {
            notes.push(format!("covers {}", covers.join(", ")));
        }
        if scope.bypasses_scope_check() {
            notes.push("bypasses scope checks (audited)".to_string());
        }
        if scope.is_single_use() {
            notes.push("single use".to_string());
        }
        println!("{:<14} {}", scope, notes.join("; "));
    }
}

async fn handle_demo(args: DemoArgs) -> Result<()> {
    ensure!(args.rounds > 0, "--rounds must be positive");
    let config = GatewayConfig::default();
    let alice = Gateway::new(config.clone(), NodeIdentity::generate(), generate_token_secret())?;
    let bob = Gateway::new(config, NodeIdentity::generate(), generate_token_secret())?;
    println!("alice {}", alice.peer_key());
    println!("bob   {}", bob.peer_key());
    for round in 1..=args.rounds {
        let (to_bob, to_alice) = MemoryLink::pair();
        let (outbound, inbound) = tokio::join!(alice.connect(&to_bob), bob.accept(&to_alice));
        let outbound = outbound.context("alice failed to authenticate bob")?;
        let inbound = inbound.context("bob failed to authenticate alice")?;
        println!(
            "round {round:>3}: alice sees bob as {}, bob sees alice as {}",
            outbound.level,
            bob.trust().level(&inbound.peer)
        );
    }
    Ok(())
}
