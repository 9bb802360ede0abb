//! eBPF telemetry receiver
//!
//! Drains the ring and perf buffers an eBPF instrumentation agent shares
//! over the descriptor exchange, decodes their OpenTelemetry payloads and
//! forwards them to a downstream consumer. Handles are hot-swapped whenever
//! the agent restarts, and JVM runtime metrics are scraped from the
//! agent's per-process metric maps on a timer.

pub mod admin;
pub mod config;
pub mod decode;
pub mod error;
pub mod manager;
pub mod map;
pub mod metrics;
pub mod pressure;
pub mod proto;
pub mod read_loop;
pub mod reader;
pub mod receiver;
pub mod sink;
pub mod telemetry;
pub mod util;

pub use config::{ReceiverConfig, Signal};
pub use error::{ConsumeError, DecodeError, ReaderError, ReceiverError};
pub use manager::{HandleConsumer, ManagedHandle, MapManager, ManagerState};
pub use read_loop::{BatchSink, ReadLoop, ReadLoopConsumer};
pub use receiver::{EbpfReceiver, ReceiverOptions};
pub use telemetry::{ReceiverTelemetry, SignalTelemetry};
