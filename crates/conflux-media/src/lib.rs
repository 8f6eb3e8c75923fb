pub mod active_speaker;
pub mod codecs;
pub mod factory;
pub mod router;
pub mod stats;
pub mod worker_pool;

pub use conflux_core::error::RouterError;
pub use factory::MediasoupBackendFactory;
pub use router::MediasoupRouter;
pub use worker_pool::WorkerPool;
