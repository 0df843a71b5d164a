//! An asynchronous dispatch engine for a queue-based symmetric-crypto
//! accelerator.
//!
//! The engine drives caller-built [`CryptoRequest`]s through a fixed
//! pipeline: validation, per-direction queue-pair selection, cyclic
//! slot allocation, buffer mapping (pooled copy for small payloads,
//! scatter-gather otherwise), descriptor construction, and admission
//! onto the hardware ring. Completions arrive out of band through
//! [`SecContext::complete`], which correlates the descriptor tag back
//! to its slot, re-verifies AEAD decryption tags in software, and
//! fires the caller's callback exactly once.
//!
//! The hardware side is abstracted behind [`QueueTransport`] and
//! [`SglPool`]; [`sim::SimDevice`] implements both in software and
//! backs the test suite.

pub mod descriptor;
pub mod dispatch;
pub mod error;
pub mod os;
pub mod pool;
pub mod queue;
pub mod request;
pub mod sim;
pub mod transport;

mod mapper;
mod prelude;

pub use self::descriptor::SecDescriptor;
pub use self::dispatch::{SecConfig, SecContext};
pub use self::error::{Errno, Error};
pub use self::queue::{QueuePair, SlotId, SubmitOutcome};
pub use self::request::{
    CipherAlg, CipherMode, Completion, CryptoRequest, CryptoRequestBuilder, Direction,
    RequestState, ScatterList,
};
pub use self::sim::SimDevice;
pub use self::transport::{QueueTransport, SglPool};

pub type Result<T> = core::result::Result<T, Error>;
