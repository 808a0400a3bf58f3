//! Bitcoin SV full node (`bitcoind`) on regtest or testnet

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use clap::{Arg, ArgAction, Command};
use tracing::{info, warn};

use sdk_core::record::keys;
use sdk_core::{ComponentRecord, ComponentState, LaunchMode};

use crate::error::SdkResult;
use crate::node_rpc::{self, DEFAULT_RPC_HOST, RPC_PASSWORD, RPC_USER, RpcEndpoint};
use crate::plugin::{Network, Plugin, PluginContext, PluginDescriptor, SourceTier};
use crate::supervisor::{LaunchCommand, LaunchSpec, LivenessConfig};

pub const DEFAULT_RPC_PORT: u16 = 18332;
pub const DEFAULT_P2P_PORT: u16 = 18444;
pub const DEFAULT_ZMQ_PORT: u16 = 28332;

/// Time between the RPC `stop` plus interrupt and the hard kill. The node flushes its
/// block index and chainstate on shutdown; killing it early corrupts the datadir and
/// forces a reindex on the next start.
pub const STOP_GRACE: Duration = Duration::from_secs(10);

const ZMQ_PORT_KEY: &str = "zmq_port";

/// Environment overrides honoured by `start`
mod env {
    pub const RPC_PORT: &str = "NODE_PORT";
    pub const P2P_PORT: &str = "NODE_P2P_PORT";
    pub const ZMQ_PORT: &str = "NODE_ZMQ_PORT";
    pub const RPC_ALLOW_IP: &str = "NODE_RPCALLOWIP";
    pub const RPC_BIND: &str = "NODE_RPCBIND";
    pub const BINARY: &str = "NODE_BINARY";
}

const DEFAULT_BINARY: &str = "bitcoind";

#[derive(Debug, Clone)]
pub struct NodePlugin {
    descriptor: PluginDescriptor,
}

impl NodePlugin {
    pub fn new() -> Self {
        Self {
            descriptor: PluginDescriptor::new("node", SourceTier::Builtin)
                .with_default_port(DEFAULT_RPC_PORT)
                .with_reserved_ports([DEFAULT_RPC_PORT, DEFAULT_P2P_PORT])
                .with_graceful_wait(STOP_GRACE),
        }
    }
}

impl Default for NodePlugin {
    fn default() -> Self {
        Self::new()
    }
}

/// Resolved ports and network for one node launch
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NodePorts {
    pub rpc: u16,
    pub p2p: u16,
    pub zmq: u16,
}

fn env_port(name: &str) -> Option<u16> {
    std::env::var(name).ok().and_then(|v| v.trim().parse().ok())
}

fn binary() -> String {
    std::env::var(env::BINARY)
        .ok()
        .filter(|b| !b.is_empty())
        .unwrap_or_else(|| DEFAULT_BINARY.to_string())
}

/// `bitcoind` arguments for one instance
pub fn node_args(
    datadir: &std::path::Path,
    ports: NodePorts,
    network: Network,
    extra: &[String],
) -> Vec<String> {
    let mut args = vec![
        format!("-datadir={}", datadir.display()),
        format!("-rpcport={}", ports.rpc),
        format!("-port={}", ports.p2p),
        format!("-rpcuser={RPC_USER}"),
        format!("-rpcpassword={RPC_PASSWORD}"),
        "-server=1".to_string(),
        "-txindex=1".to_string(),
        format!("-zmqpubhashblock=tcp://127.0.0.1:{}", ports.zmq),
        "-excessiveblocksize=10000000000".to_string(),
        "-maxstackmemoryusageconsensus=0".to_string(),
        "-genesisactivationheight=1".to_string(),
        "-rest=1".to_string(),
        "-printtoconsole".to_string(),
        format!("-{}", network.as_str()),
    ];
    if let Ok(ip) = std::env::var(env::RPC_ALLOW_IP) {
        if !ip.is_empty() {
            args.push(format!("-rpcallowip={ip}"));
        }
    }
    if let Ok(bind) = std::env::var(env::RPC_BIND) {
        if !bind.is_empty() {
            args.push(format!("-rpcbind={bind}"));
        }
    }
    args.extend(extra.iter().cloned());
    args
}

fn endpoint_for(record: &ComponentRecord) -> RpcEndpoint {
    RpcEndpoint::from_record(record, DEFAULT_RPC_PORT)
}

/// Whether `program` resolves to an executable on PATH
fn on_path(program: &str) -> bool {
    if std::path::Path::new(program).is_absolute() {
        return std::path::Path::new(program).is_file();
    }
    let Some(path) = std::env::var_os("PATH") else {
        return false;
    };
    std::env::split_paths(&path).any(|dir| {
        let candidate = dir.join(program);
        candidate.is_file() || (cfg!(windows) && candidate.with_extension("exe").is_file())
    })
}

#[async_trait]
impl Plugin for NodePlugin {
    fn descriptor(&self) -> &PluginDescriptor {
        &self.descriptor
    }

    fn extend_start_cli(&self, mut cmd: Command) -> (Command, Vec<String>) {
        let mut ids = Vec::new();
        for network in Network::FLAGS {
            cmd = cmd.arg(
                Arg::new(network.as_str())
                    .long(network.as_str())
                    .action(ArgAction::SetTrue)
                    .help(format!("run the node on {}", network.as_str())),
            );
            ids.push(network.as_str().to_string());
        }
        (cmd, ids)
    }

    async fn install(&self, _ctx: &PluginContext<'_>) -> SdkResult<()> {
        let program = binary();
        if on_path(&program) {
            info!("Found node binary '{}'", program);
        } else {
            warn!(
                "Node binary '{}' not found on PATH; install Bitcoin SV or set {}",
                program,
                env::BINARY
            );
        }
        Ok(())
    }

    async fn start(&self, ctx: &PluginContext<'_>) -> SdkResult<()> {
        let network = ctx.network()?;
        let alloc = ctx.allocate()?;
        let rpc = match env_port(env::RPC_PORT) {
            Some(port) => port,
            None => alloc.port.unwrap_or(DEFAULT_RPC_PORT),
        };
        let p2p = match env_port(env::P2P_PORT) {
            Some(port) => port,
            None => ctx.allocate_port(&alloc.id, DEFAULT_P2P_PORT)?,
        };
        let zmq = match env_port(env::ZMQ_PORT) {
            Some(port) => port,
            None => ctx.allocate_port(&alloc.id, DEFAULT_ZMQ_PORT)?,
        };
        let ports = NodePorts { rpc, p2p, zmq };

        let endpoint = RpcEndpoint::local(ports.rpc);
        let record = ComponentRecord::new(&alloc.id, ctx.component_type())
            .with_status_endpoint(endpoint.status_endpoint())
            .with_metadata(keys::DATADIR, alloc.datadir.display().to_string())
            .with_metadata(keys::RPCPORT, ports.rpc)
            .with_metadata(keys::P2P_PORT, ports.p2p)
            .with_metadata(keys::RPCHOST, DEFAULT_RPC_HOST)
            .with_metadata(ZMQ_PORT_KEY, ports.zmq);

        let command = LaunchCommand::new(binary())
            .with_args(node_args(
                &alloc.datadir,
                ports,
                network,
                &ctx.inputs().component_args,
            ))
            .with_env(BTreeMap::new());
        let spec = LaunchSpec::new(command, record, ctx.log_file(&alloc.id)?);
        let mode = ctx.launch_mode(LaunchMode::NewTerminal);
        let record = ctx.launch(spec, mode).await?;
        if mode == LaunchMode::Inline {
            return Ok(());
        }

        if node_rpc::wait_until_ready(&endpoint, &LivenessConfig::default()).await {
            info!(component_id = %record.id, "Node {} is ready on port {}", record.id, ports.rpc);
        } else {
            warn!(component_id = %record.id, "Node {} did not answer RPC", record.id);
            ctx.app()
                .registry()
                .transition(&record.id, record.pid, ComponentState::Failed)?;
        }
        Ok(())
    }

    async fn stop(&self, ctx: &PluginContext<'_>) -> SdkResult<()> {
        let client = node_rpc::client(Duration::from_secs(2))?;
        for record in ctx.target_records()? {
            if record.is_running() {
                // best effort; the process tree is still interrupted afterwards
                if let Err(e) = node_rpc::stop(&client, &endpoint_for(&record)).await {
                    warn!(component_id = %record.id, "RPC stop failed: {}", e);
                }
            }
            ctx.stop_record(&record).await?;
        }
        Ok(())
    }
}
