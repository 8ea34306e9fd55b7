pub mod core;
pub mod jobs;
pub mod scheduler;
pub mod transport;
pub mod worker_info;
pub mod worker_pool;
