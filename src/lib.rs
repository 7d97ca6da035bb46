//! Reliable sequenced message-queue and transport core for market-data
//! distribution and order management.
//!
//! The crate provides the pieces a recorder/replayer, publisher/subscriber
//! link or in-process telemetry fan-out is built from: a sequence-keyed
//! priority queue with gap arithmetic (`pqueue`), reliable receive/transmit
//! state machines over it (`rx`, `tx`), a shared-memory byte ring with
//! futex blocking and dead-reader reclamation (`ring`), and a link/engine
//! lifecycle layer coordinating many links over shared Rx/Tx threads
//! (`link`, `engine`, `sched`).

pub mod capture;
pub mod clock;
pub mod engine;
pub mod error;
pub mod iobuf;
pub mod link;
pub mod pqueue;
pub mod ring;
pub mod rx;
pub mod sched;
pub mod seq;
pub mod telemetry;
pub mod tx;

pub use clock::{Clock, QuantaClock, SystemClock};
pub use engine::{Engine, EngineConfig, EngineState, StateCounts};
pub use error::{Error, Result};
pub use iobuf::IoBuf;
pub use link::{Link, LinkHandler, LinkState};
pub use pqueue::{Item, PQueue};
pub use ring::{Ring, RingConfig, RingFn, RingReader, RingWriter, Topology, WaitStrategy};
pub use rx::{Rx, RxHandler};
pub use seq::{Gap, MsgId, SeqNo, SEQ_NONE};
pub use tx::{Tx, TxHandle, TxPool, TxSink};
