//! procbridge: correlated request/response messaging with a worker subprocess
//! over its stdin/stdout.

pub mod bridge;
pub mod config;
pub mod correlator;
pub mod error;
mod events;
pub mod logging;
pub mod supervisor;
pub mod wire;
pub mod worker;

pub use bridge::Bridge;
pub use config::{BridgeConfig, CommandSpawner, CommandSpec, WorkerSpawner};
pub use correlator::{Correlator, PendingResponse};
pub use error::{BridgeError, ErrorCode, SpawnError};
pub use events::BridgeEvent;
pub use supervisor::{ExitInfo, ProcessState, ProcessSupervisor};
pub use wire::{
    Envelope, EnvelopeBuilder, FrameEncoder, FrameReader, MESSAGE_DELIMITER, MessageId,
    PROCESS_ALIVE, Query,
};
pub use worker::{RequestHandler, WorkerConfig, run_worker, serve};
