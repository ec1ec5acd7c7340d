//! Persistence of fetched items.
//!
//! # Submodules
//!
//! - [`raw_store`]: per-source append-only JSON files, deduplicated by link
//!
//! # Output Structure
//!
//! ```text
//! raw_data_dir/
//! ├── .fetch_state.json          # last successful fetch per channel
//! ├── ria_20250314_1200.json     # one file per source per run
//! └── lenta_20250314_1200.json
//! ```

pub mod raw_store;

pub use raw_store::{PersistOutcome, RawStore, read_records};
