#![allow(dead_code)]

use std::sync::Arc;

use libsmbfs::rpc::memory::InMemoryServer;
use libsmbfs::{ClientConfig, SmbShare};

pub const FILE: &str = "/share/file.txt";
pub const CONTENT: &[u8] = b"0123456789abcdef";

pub fn init_logger() {
    let _ = env_logger::builder().is_test(true).try_init();
}

pub fn setup_with(config: ClientConfig) -> (Arc<InMemoryServer>, Arc<SmbShare>) {
    init_logger();
    let server = Arc::new(InMemoryServer::new());
    server.create_file(FILE, CONTENT);
    let share = SmbShare::new(server.clone(), config);
    (server, share)
}

pub fn setup() -> (Arc<InMemoryServer>, Arc<SmbShare>) {
    setup_with(ClientConfig::default())
}

/// Short break waits so tests that race a break do not sleep for long.
pub fn fast_config() -> ClientConfig {
    ClientConfig {
        lease_break_wait_retries: 3,
        lease_break_wait_interval_ms: 5,
        ..Default::default()
    }
}
