//! Staged pipeline runtime. Each node is a message sink owning a bounded
//! inbound queue and a pool of worker threads, and forwards its output to
//! exactly one downstream sink. Pipelines are built bottom-up, sink first;
//! dropping the head of the pipeline propagates termination leaf-ward: a
//! node's teardown terminates its own queue, joins its workers and only then
//! terminates the downstream sink.

mod duplex_caller;
mod duplex_split;
mod mod_base_caller;
mod pairing;
mod queue;
mod read_filter;
mod scaler;
mod writer;

pub use duplex_caller::DuplexCallerNode;
pub use duplex_split::{DuplexSplitNode, DuplexSplitSettings};
pub use mod_base_caller::ModBaseCallerNode;
pub use pairing::PairingNode;
pub use queue::WorkQueue;
pub use read_filter::ReadFilterNode;
pub use scaler::ScalerNode;
pub use writer::{WriterNode, WriterOutput};

use crate::reads::{Read, ReadPair};
use rust_htslib::bam;

/// Default bound on a node's inbound queue.
pub const DEFAULT_MAX_MESSAGES: usize = 1000;

/// A unit of work flowing between pipeline nodes. Queues carry messages by
/// move; a read is owned by exactly one node at a time.
#[derive(Debug)]
pub enum Message {
    Read(Box<Read>),
    Pair(Box<ReadPair>),
    Alignment(bam::Record),
}

/// A pipeline node able to receive messages.
pub trait MessageSink: Send + Sync {
    /// Enqueues a message, blocking while the node's queue is full. Messages
    /// pushed after termination are dropped: the downstream is gone.
    fn push_message(&self, message: Message);

    /// Marks the node's queue as closed. Queued messages still drain.
    fn terminate(&self);
}
