//! Process-level entry points: `run_file_backend`/`stop_file_backend`.
//! CLI argument parsing and process bootstrapping live in the binary
//! crate; this module is the library surface a `main.rs` or test
//! harness calls into.

use std::sync::Arc;

use tracing::info;

use crate::cache::{decode_file_meta_entry, preload, CuckooTable, FileMetaEntry, OccupancyMode, FILE_META_ENTRY_WIRE_SIZE};
use crate::config::BackendConfig;
use crate::event_loop::{self, StopFlag};
use crate::file_service::FileService;
use crate::rdma::verbs::Verbs;
use crate::session::{CmEvent, ConnectionRegistry};

/// Everything the running backend owns: the session registry, the shared
/// metadata cache, and the stop flag as an explicit handle passed into
/// the event-loop entry, rather than process-global mutable state.
pub struct FileBackend {
    pub registry: ConnectionRegistry,
    pub cache: CuckooTable<FileMetaEntry>,
    pub stop: StopFlag,
}

impl FileBackend {
    /// Construct the registry and cache from config, optionally
    /// streaming in a preload file.
    pub fn init(cfg: &BackendConfig, verbs: Arc<dyn Verbs>) -> crate::error::Result<Self> {
        let registry = ConnectionRegistry::new(
            cfg.session.max_clients,
            cfg.session.ctrl_msg_size,
            cfg.ring.request_ring_bytes,
            cfg.ring.response_ring_bytes,
            cfg.session.max_outstanding_io,
            cfg.ring.response_batching,
            cfg.ring.use_immediate_write,
            verbs,
        )?;
        let mode = match cfg.cache.occupancy_mode {
            crate::config::OccupancyMode::PerBucket => OccupancyMode::PerBucket,
            crate::config::OccupancyMode::PerItem => OccupancyMode::PerItem,
        };
        let mut cache = CuckooTable::new(cfg.cache.bucket_count, cfg.cache.bucket_size, mode);
        if let Some(path) = &cfg.cache.preload_path {
            let n = preload::load_into(path, &mut cache, FILE_META_ENTRY_WIRE_SIZE, decode_file_meta_entry)?;
            info!(path, n, "preloaded metadata cache entries");
        }
        Ok(Self {
            registry,
            cache,
            stop: StopFlag::new(),
        })
    }
}

/// Starts the backend event loop against `server_ip`/`server_port` with
/// the given client/buffer limits. Blocks the calling thread running the
/// event loop until [`stop_file_backend`] is called on the returned
/// [`event_loop::StopFlag`].
pub fn run_file_backend(
    cfg: BackendConfig,
    fs: Arc<dyn FileService>,
    verbs: Arc<dyn Verbs>,
    cm_events: &mut dyn Iterator<Item = (u64, CmEvent, Option<u8>)>,
) -> crate::error::Result<StopFlag> {
    let mut backend = FileBackend::init(&cfg, verbs)?;
    let stop = backend.stop.clone();
    info!(
        server_ip = %cfg.network.server_ip,
        server_port = cfg.network.server_port,
        max_clients = cfg.session.max_clients,
        "starting file backend event loop"
    );
    event_loop::run(&mut backend.registry, fs.as_ref(), &mut backend.cache, &cfg.event_loop, cm_events, &stop);
    Ok(stop)
}

/// Sets the shared stop flag the event loop polls once per iteration.
pub fn stop_file_backend(stop: &StopFlag) {
    stop.stop();
}
