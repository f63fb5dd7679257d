pub mod asr;
pub mod audio;
pub mod config;
pub mod error;
pub mod ingest;
pub mod lock;
pub mod schedule;
pub mod storage;
pub mod utils;

pub use config::Settings;

/// Load `.env` into the process environment so `RUST_LOG` and friends apply.
pub fn init_env() {
    dotenv::dotenv().ok();
}
