//! Worker core of a request/response broker endpoint.
//!
//! A [`RequestWorker`] owns one main endpoint and an optional heartbeat
//! endpoint and runs a single event loop thread that receives requests,
//! dispatches them to attached command handlers and transmits whatever any
//! thread queued through [`SendWorker::queue_send`].

pub mod auth;
pub mod client;
pub mod config;
pub mod heartbeat;
pub mod logging;
pub mod message;
pub mod queue;
pub mod shutdown;
pub mod transport;
pub mod utils;
pub mod wire;
pub mod worker;

pub use message::{Identity, IncomingMessage, OutgoingMessage};
pub use worker::{
    CommandHandler, QueueSendCallback, RequestWorker, SendWorker, WorkerConfig, WorkerError,
};
