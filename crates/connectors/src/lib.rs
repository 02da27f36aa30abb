//! VoiceDock Connectors
//!
//! Concrete agent workers. Each connector implements the worker contract from
//! `voicedock-connector-core` and translates its agent's output into
//! `MessageEvent`s.

pub mod process;

pub use process::{ProcessWorker, ProcessWorkerFactory};
pub use voicedock_connector_core::{
    AgentWorker, InferenceConfig, MessageEvent, MessageSink, WorkerError, WorkerFactory,
    WorkerSpec,
};
