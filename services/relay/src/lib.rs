pub mod accounting;
pub mod config;
pub mod proxy;

pub use accounting::{
    build_store, Accounting, CounterMode, CounterStore, MemoryCounterStore, RespCounterStore,
    TrafficAccountant, UpdatePolicy,
};
pub use config::Config;
pub use proxy::{
    AckMode, CloseReason, Direction, Listener, ListenerConfig, ListenerStats, RelaySession,
    SessionContext, SessionSummary, Upstream,
};
