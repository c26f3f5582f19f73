use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use log::info;

use libsmbfs::rpc::LeaseState;
use libsmbfs::rpc::memory::InMemoryServer;
use libsmbfs::{ClientConfig, OpenFlags, SmbShare};

#[derive(Debug, Clone, Copy, ValueEnum)]
enum Scenario {
    /// Open/close repeatedly and show the cached handle being reused.
    DeferredClose,
    /// Drop the session under an open handle and reopen through the durable handle.
    Reconnect,
    /// Break the lease under a deferred handle.
    LeaseBreak,
}

#[derive(Debug, Parser)]
#[command(name = "smbfs-demo", about = "Drive the SMB handle core against an in-memory server")]
struct Args {
    /// JSON client configuration; defaults apply when omitted.
    #[arg(short, long)]
    config: Option<PathBuf>,

    #[arg(short, long, value_enum, default_value = "deferred-close")]
    scenario: Scenario,

    #[arg(long, default_value = "/share/demo.txt")]
    path: String,
}

async fn deferred_close(share: &SmbShare, server: &InMemoryServer, path: &str) -> Result<()> {
    let node = share.lookup(path);
    for round in 0..3 {
        let token = share.open_for_access(&node, OpenFlags::READ).await?;
        let data = share.read(&node, &token, 0, 64).await?;
        share.close_handle(&node, token).await?;
        info!(
            "round {round}: read {} bytes, server opens so far {}",
            data.len(),
            server.stats().opens
        );
    }
    println!("deferred: {:?}", share.deferred_stats());
    println!("server opens: {} (three local opens)", server.stats().opens);
    Ok(())
}

async fn reconnect(share: &SmbShare, server: &InMemoryServer, path: &str) -> Result<()> {
    let node = share.lookup(path);
    let token = share
        .open_for_access(&node, OpenFlags::READ | OpenFlags::WRITE)
        .await?;
    share.write(&node, &token, 0, b"before drop").await?;
    server.drop_session();
    share.notify_session_dropped();
    share.write(&node, &token, 0, b"after drop!").await?;
    println!(
        "state {:?}, reclaims {}, reopen attempts {}",
        node.reconnect_state(),
        server.stats().reclaims,
        node.reopen_attempts()
    );
    share.close_handle(&node, token).await?;
    Ok(())
}

async fn lease_break(share: &SmbShare, server: &InMemoryServer, path: &str) -> Result<()> {
    let node = share.lookup(path);
    let token = share.open_for_access(&node, OpenFlags::READ).await?;
    share.close_handle(&node, token).await?;
    println!("after close: {:?}", share.deferred_stats());
    share
        .on_lease_break(node.lease_key(), LeaseState::READ_CACHING)
        .await?;
    println!(
        "after break: {:?}, server handles {}",
        share.deferred_stats(),
        server.open_handle_count(path)
    );
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::init();
    let args = Args::parse();

    let config = match &args.config {
        Some(path) => ClientConfig::from_file(path)
            .with_context(|| format!("loading config {}", path.display()))?,
        None => ClientConfig::default(),
    };

    let server = Arc::new(InMemoryServer::new());
    server.create_file(&args.path, b"hello from the in-memory share");
    let share = SmbShare::new(server.clone(), config);
    let reaper = share.spawn_deferred_reaper();

    match args.scenario {
        Scenario::DeferredClose => deferred_close(&share, &server, &args.path).await?,
        Scenario::Reconnect => reconnect(&share, &server, &args.path).await?,
        Scenario::LeaseBreak => lease_break(&share, &server, &args.path).await?,
    }

    share.shutdown().await;
    reaper.abort();
    info!("done, {} server handles left open", server.open_handle_count(&args.path));
    Ok(())
}
