pub mod atomic_writer;
pub mod block_applier;
pub mod cache;
pub mod catchup;
pub mod chain_client;
pub mod claim_resolver;
pub mod codec;
pub mod command_router;
pub mod config;
pub mod errors;
pub mod header_store;
pub mod mempool;
pub mod metrics;
pub mod session;
pub mod storage;
pub mod subscription;
pub mod telemetry;
pub mod types;
pub mod uri;
