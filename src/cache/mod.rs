//! Record caches kept current by storage notifications.
//!
//! - **Notification bus**: typed subscriptions, one channel per record type;
//!   listeners run in subscription order and a failing listener never fails
//!   the mutation that triggered it.
//! - **Record cache**: a read-through snapshot of every record of one type,
//!   rebuilt from storage on demand. Concurrent refreshes share one rebuild.
//!
//! ## Configuration
//!
//! ```toml
//! [cache]
//! enabled = true
//! warm_on_startup = false
//! ```

pub mod bus;
mod config;
pub(crate) mod lock;
pub mod snapshot;

pub use bus::{
    Epoch, ListenerError, NotificationBus, NotificationBusBuilder, RecordListener,
    StorageEvent, StorageOperation,
};
pub use config::CacheConfig;
pub use snapshot::{CacheError, CacheState, RecordCache, Snapshot};
