pub mod config;
pub mod sheets;

pub use config::{ConfigError, StoreConfig};
pub use sheets::{
    BatchOperation, BatchReport, Filter, FilterOperator, Query, Record, SchemaRegistry, SheetError,
    SheetStore, SheetsClient, SortDirection,
};

use tracing_subscriber::EnvFilter;

/// Install the fmt subscriber. `RUST_LOG` overrides the default `info` level.
/// Calling it twice is harmless.
pub fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}
