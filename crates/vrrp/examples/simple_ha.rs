//! Simple HA node example
//!
//! Runs one VRRP node against a logging engine stub and prints its status
//! every few seconds. Start it on two hosts (or two addresses of one host)
//! with different priorities to watch an election and failover.
//!
//! Usage:
//!   sudo target/release/examples/simple_ha <local-ip> <peer-or-group-ip> [priority]
//!
//! Or with capabilities:
//!   sudo setcap cap_net_raw+ep target/release/examples/simple_ha
//!   target/release/examples/simple_ha 10.0.0.1 224.0.0.18 150

use async_trait::async_trait;
use common::Result;
use std::env;
use std::net::IpAddr;
use std::process;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tokio::time::interval;
use tracing::info;
use vrrp::{Engine, HAConfig, HAState, HAStatus, IpHAConn, Node, NodeConfig};

/// Engine stub: logs transitions and status, never requests failover, and
/// always hands back the configuration the node started with.
struct LogEngine {
    config: HAConfig,
}

#[async_trait]
impl Engine for LogEngine {
    async fn ha_state(&self, state: HAState) -> Result<()> {
        info!(%state, "engine notified of state change");
        Ok(())
    }

    async fn ha_update(&self, status: HAStatus) -> Result<bool> {
        info!(
            state = %status.state,
            transitions = status.transitions,
            sent = status.sent,
            received = status.received,
            "engine received status update"
        );
        Ok(false)
    }

    async fn ha_config(&self) -> Result<HAConfig> {
        Ok(self.config.clone())
    }
}

#[tokio::main]
async fn main() -> std::result::Result<(), Box<dyn std::error::Error>> {
    common::logging::init();

    let args: Vec<String> = env::args().collect();
    if args.len() < 3 {
        eprintln!("usage: {} <local-ip> <peer-or-group-ip> [priority]", args[0]);
        process::exit(2);
    }

    let local_addr: IpAddr = args[1].parse()?;
    let remote_addr: IpAddr = args[2].parse()?;
    let priority: u8 = if args.len() > 3 { args[3].parse()? } else { 100 };

    let config = NodeConfig {
        ha: HAConfig {
            enabled: true,
            local_addr,
            remote_addr,
            priority,
            vrid: 60,
        },
        ..Default::default()
    };
    config.validate()?;

    println!("HA node configuration:");
    println!("  VRID:            {}", config.ha.vrid);
    println!("  Priority:        {}", priority);
    println!("  Local address:   {}", local_addr);
    println!("  Remote address:  {}", remote_addr);
    println!("  Advert interval: {:?}", config.master_advert_interval);
    println!();

    let conn = Arc::new(IpHAConn::new(local_addr, remote_addr)?);
    let engine = Arc::new(LogEngine {
        config: config.ha.clone(),
    });
    let node = Arc::new(Node::new(config, conn, engine)?);

    let runner = Arc::clone(&node);
    let run_handle = tokio::spawn(async move { runner.run().await });

    let monitor = Arc::clone(&node);
    tokio::spawn(async move {
        let mut tick = interval(Duration::from_secs(5));
        tick.tick().await; // Skip first immediate tick
        loop {
            tick.tick().await;
            let status = monitor.status().await;
            println!(
                "state={} transitions={} sent={} received={} queued={}",
                status.state,
                status.transitions,
                status.sent,
                status.received,
                status.received_queued
            );
        }
    });

    println!("Press Ctrl+C to shut down gracefully...");
    signal::ctrl_c().await?;
    println!("shutting down...");

    node.shutdown().await;
    match run_handle.await? {
        Ok(()) => {
            let status = node.status().await;
            println!(
                "final state={} sent={} received={}",
                status.state, status.sent, status.received
            );
            Ok(())
        }
        Err(e) => Err(e.into()),
    }
}
