use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use log::{error, info};
use tokio::io::{AsyncBufReadExt, BufReader};
use uuid::Uuid;

use meshnet::{
    Config, MeshNode, NoFormation, NodeEvent, StaticAddresses, TransferStatus,
};

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let config = match std::env::args().nth(1) {
        Some(path) => Config::load(Path::new(&path))
            .with_context(|| format!("loading config from {path}"))?,
        None => Config::default(),
    };

    let addrs = Arc::new(StaticAddresses::from_config(&config));
    let node = Arc::new(MeshNode::new(config));
    node.start(addrs, Arc::new(NoFormation)).await?;
    info!("this node is {} ({})", node.node_id(), node.display_name());

    tokio::spawn(print_events(node.clone()));

    println!("commands: /peers  /send <text>  /file <path>  /accept <file_id> <path>  /reject <file_id>  /quit");
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        let line = tokio::select! {
            line = lines.next_line() => line?,
            _ = tokio::signal::ctrl_c() => None,
        };
        let Some(line) = line else { break };
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        if line == "/quit" {
            break;
        }
        if let Err(err) = run_command(&node, line).await {
            error!("{err:#}");
        }
    }

    node.stop().await?;
    Ok(())
}

async fn run_command(node: &MeshNode, line: &str) -> Result<()> {
    let (cmd, rest) = line.split_once(' ').unwrap_or((line, ""));
    match cmd {
        "/peers" => {
            let peers = node.peers();
            if peers.is_empty() {
                println!("no peers known");
            }
            for peer in peers {
                let state = if peer.active { "active" } else { "stale" };
                println!("  {} at {} ({state})", peer.peer_id, peer.addr);
            }
        }
        "/send" => {
            let msg_id = node.send_text(rest, None).await?;
            println!("sent {msg_id}");
        }
        "/file" => {
            let file_id = node.send_file(Path::new(rest), None, None).await?;
            println!("offering file as transfer {file_id}");
        }
        "/accept" => {
            let mut parts = rest.splitn(2, ' ');
            let file_id: Uuid = parts
                .next()
                .unwrap_or_default()
                .parse()
                .context("usage: /accept <file_id> <save path>")?;
            let save_path = PathBuf::from(parts.next().context("missing save path")?);
            node.accept_file(file_id, &save_path).await?;
            println!("accepted {file_id} -> {}", save_path.display());
        }
        "/reject" => {
            let file_id: Uuid = rest.parse().context("usage: /reject <file_id>")?;
            node.reject_file(file_id).await?;
            println!("rejected {file_id}");
        }
        other => println!("unknown command {other}"),
    }
    Ok(())
}

async fn print_events(node: Arc<MeshNode>) {
    let mut events = node.subscribe();
    while let Ok(event) = events.recv().await {
        match event {
            NodeEvent::MessageReceived(msg) => {
                println!("[{}] {}", msg.sender_id, msg.text().unwrap_or_default());
            }
            NodeEvent::PeerConnected { peer_id, addr } => {
                println!("* peer {peer_id} joined from {addr}");
            }
            NodeEvent::PeerDisconnected { peer_id } => {
                println!("* peer {peer_id} went quiet");
            }
            NodeEvent::FileInfoReceived {
                file_id,
                sender_id,
                filename,
                size,
                ..
            } => {
                println!(
                    "* {sender_id} offers '{filename}' ({size} bytes); /accept {file_id} <path> or /reject {file_id}"
                );
            }
            NodeEvent::TransferUpdated { file_id, status } => {
                if matches!(status, TransferStatus::Complete | TransferStatus::Failed) {
                    println!("* transfer {file_id} is now {status:?}");
                }
            }
        }
    }
}
