// Copyright (c) 2025-2026 Archipel Contributors
// SPDX-License-Identifier: MPL-2.0
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
use std::net::SocketAddr;
use std::path::PathBuf;

use clap::{Parser, Subcommand};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use archipel_core::{FileId, Node, NodeConfig, NodeEvent, NodeIdentity};

#[derive(Parser)]
#[command(name = "archipel")]
#[command(about = "Archipel peer-to-peer node")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Generate a fresh identity keypair and print it.
    GenIdentity,
    /// Print the node id for the stored identity.
    Id {
        #[arg(long, default_value_t = archipel_core::config::DEFAULT_TCP_PORT)]
        port: u16,
        #[arg(long, default_value = ".")]
        data_dir: PathBuf,
    },
    /// Run a node.
    Start {
        #[arg(long, default_value_t = archipel_core::config::DEFAULT_TCP_PORT)]
        port: u16,
        #[arg(long, default_value = ".")]
        data_dir: PathBuf,
        #[arg(long, default_value = ".")]
        download_dir: PathBuf,
        /// Disable multicast discovery (gossip/manual connections only).
        #[arg(long)]
        no_discovery: bool,
        /// Bootstrap peer address to connect to at startup.
        #[arg(long)]
        connect: Option<SocketAddr>,
        /// File to share once the node is up.
        #[arg(long)]
        share: Option<PathBuf>,
        /// File id (hex) to download once the node is up.
        #[arg(long)]
        download: Option<String>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let cli = Cli::parse();
    match cli.command {
        Command::GenIdentity => {
            let identity = NodeIdentity::generate();
            println!(
                "private_key: {}",
                hex::encode(identity.signing.to_bytes())
            );
            println!(
                "public_key: {}",
                hex::encode(identity.verifying_key().to_bytes())
            );
            println!("id: {}", identity.id);
        }
        Command::Id { port, data_dir } => {
            let identity = NodeIdentity::load_or_generate(&data_dir, port)?;
            println!("{}", identity.id);
        }
        Command::Start {
            port,
            data_dir,
            download_dir,
            no_discovery,
            connect,
            share,
            download,
        } => {
            let node = Node::start(NodeConfig {
                tcp_port: port,
                data_dir,
                download_dir,
                enable_discovery: !no_discovery,
                ..NodeConfig::default()
            })
            .await?;
            info!(id = %node.id(), addr = %node.local_addr(), "node up");

            if let Some(addr) = connect {
                match node.connect_to(addr).await {
                    Ok(peer) => info!(%peer, "bootstrap connection established"),
                    Err(err) => warn!(%addr, %err, "bootstrap connection failed"),
                }
            }
            if let Some(path) = share {
                let manifest = node.share_file(&path).await?;
                info!(file_id = %manifest.file_id, "sharing file");
            }
            if let Some(hex_id) = download {
                node.download_file(FileId::from_hex(&hex_id)?).await?;
            }

            let mut events = node.subscribe();
            loop {
                match events.recv().await {
                    Ok(event) => print_event(event),
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "event stream lagged");
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                }
            }
        }
    }
    Ok(())
}

fn print_event(event: NodeEvent) {
    match event {
        NodeEvent::PeerNew { id, ip, tcp_port } => {
            info!(peer = %id, %ip, tcp_port, "peer discovered");
        }
        NodeEvent::PeerLost { id } => info!(peer = %id, "peer lost"),
        NodeEvent::Message {
            from,
            content,
            is_relayed,
        } => info!(%from, is_relayed, "message: {content}"),
        NodeEvent::FileShared { manifest } => {
            info!(file_id = %manifest.file_id, filename = %manifest.filename, "file shared");
        }
        NodeEvent::TransferProgress {
            file_id,
            completed,
            total,
        } => info!(%file_id, "transfer progress {completed}/{total}"),
        NodeEvent::TransferComplete { file_id, path } => {
            info!(%file_id, path = %path.display(), "transfer complete");
        }
        NodeEvent::DhtUpdate { file_id, provider } => {
            info!(%file_id, %provider, "provider learned");
        }
    }
}
