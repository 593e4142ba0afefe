use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;

use lorachain_core::blockchain::genesis::GenesisConfig;
use lorachain_core::codec::dictionary::DictionaryRegistry;
use lorachain_core::codec::Codec;
use lorachain_core::config::{NodeConfig, Region};
use lorachain_core::crypto::keys::Keypair;
use lorachain_core::events::EventBus;
use lorachain_core::kernel::Inner as KernelInner;
use lorachain_core::mesh::radio::ChannelHub;
use lorachain_core::mesh::routing::NodeType;
use lorachain_core::mesh::MeshService;
use lorachain_core::metrics::Metrics;
use lorachain_core::storage::ChainStore;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to data directory
    #[arg(long, default_value = "./data/lorachain")]
    data_dir: String,

    /// Node configuration file (JSON); defaults apply when omitted
    #[arg(long)]
    config: Option<String>,

    /// Genesis configuration file (JSON)
    #[arg(long)]
    genesis: Option<String>,

    /// Regulatory region: EU, US, CA, MX, JP, AU, NZ, BR, AR, CUSTOM
    #[arg(long)]
    region: Option<String>,

    /// Node capability: full, light, mining
    #[arg(long, default_value = "full")]
    node_type: String,

    /// Hex-encoded node secret key; generated fresh when omitted
    #[arg(long)]
    node_key: Option<String>,

    /// Mine blocks continuously to this address
    #[arg(long)]
    mine_to: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let mut args = Args::parse();

    if let Ok(v) = std::env::var("LORACHAIN_DATA_DIR") {
        if !v.trim().is_empty() {
            args.data_dir = v;
        }
    }
    if args.config.is_none() {
        if let Ok(v) = std::env::var("LORACHAIN_CONFIG") {
            if !v.trim().is_empty() {
                args.config = Some(v);
            }
        }
    }
    if args.region.is_none() {
        if let Ok(v) = std::env::var("LORACHAIN_REGION") {
            if !v.trim().is_empty() {
                args.region = Some(v);
            }
        }
    }

    let mut config = match &args.config {
        Some(path) => NodeConfig::load(path).context("loading node config")?,
        None => NodeConfig::default(),
    };
    if let Some(region) = &args.region {
        config.region = Region::from_str(region)?;
    }
    config.validate()?;

    let node_type = match args.node_type.as_str() {
        "full" => NodeType::Full,
        "light" => NodeType::Light,
        "mining" => NodeType::Mining,
        other => anyhow::bail!("unknown node type '{}'", other),
    };

    let node_key = Arc::new(match &args.node_key {
        Some(secret) => {
            Keypair::from_secret_hex(secret).context("parsing --node-key")?
        }
        None => Keypair::generate(),
    });

    println!("Starting LoraChain node");
    println!("Node id:  {}", node_key.address());
    println!("Region:   {}", config.region.name());
    println!("Channel:  {} MHz, SF{}, {} kHz", config.frequency_mhz, config.spreading_factor, config.bandwidth_khz);
    println!("Data dir: {}", args.data_dir);

    let storage = ChainStore::open(Path::new(&args.data_dir))?;

    let genesis = match &args.genesis {
        Some(path) => GenesisConfig::load(path).context("loading genesis config")?,
        None => default_genesis(&config),
    };

    let events = EventBus::default();
    let metrics = Metrics::new();
    let kernel = KernelInner::open(genesis, storage.clone(), events, metrics)?;
    println!(
        "Chain {} ready at height {} (tip {})",
        kernel.chain_id,
        kernel.chain_height(),
        kernel.tip_hash()
    );

    // The transmission port is a seam: hardware drivers attach here. The
    // in-process hub keeps the node runnable without a radio.
    let hub = ChannelHub::new();
    let port = Arc::new(hub.endpoint());

    let codec = Codec::new(&config, DictionaryRegistry::new())?;
    let mesh = MeshService::new(
        config,
        node_key,
        node_type,
        kernel.clone(),
        storage,
        codec,
        port,
    )?;

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    let mesh_task = tokio::spawn(mesh.clone().run(shutdown_rx));

    if let Some(miner_address) = args.mine_to {
        let kernel_miner = kernel.clone();
        let mesh_miner = mesh.clone();
        tokio::spawn(async move {
            loop {
                match kernel_miner.mine_block(&miner_address) {
                    Ok(Some(block)) => {
                        log::info!("mined block {} at height {}", block.hash, block.index());
                        let _ = mesh_miner.broadcast_block(block);
                    }
                    Ok(None) => break,
                    Err(e) => log::warn!("mining failed: {}", e),
                }
                tokio::time::sleep(std::time::Duration::from_secs(1)).await;
            }
        });
    }

    tokio::signal::ctrl_c().await?;
    println!("Shutting down...");
    let _ = shutdown_tx.send(true);
    let _ = mesh_task.await;
    kernel.close()?;
    Ok(())
}

/// Development genesis: a fresh chain with no allocations, parameters
/// drawn from the node config.
fn default_genesis(config: &NodeConfig) -> GenesisConfig {
    GenesisConfig {
        chain_id: "lorachain-dev".into(),
        network_params: lorachain_core::blockchain::genesis::NetworkParams {
            initial_difficulty: config.min_difficulty.max(2),
            mining_reward: config.mining_reward,
            max_block_size_bytes: config.max_block_size_bytes,
            target_block_time_s: config.target_block_time_s,
            adjustment_period_blocks: config.adjustment_period_blocks,
            max_retarget_ratio: config.max_difficulty_ratio,
            min_difficulty: config.min_difficulty,
            max_difficulty: config.max_difficulty,
        },
        initial_allocations: vec![],
        total_supply: 0,
        timestamp: 1_735_689_600_000, // 2025-01-01T00:00:00Z
        metadata: Default::default(),
    }
}
