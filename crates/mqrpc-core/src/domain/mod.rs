//! Domain model (correlation ids, queue names, envelopes, requests, errors).

pub mod envelope;
pub mod errors;
pub mod ids;
pub mod naming;
pub mod task;

pub use self::envelope::{ReplyEnvelope, ReplyMeta, STATUS_INTERNAL_ERROR, STATUS_OK};
pub use self::errors::{ErrorKind, RpcError};
pub use self::ids::CorrelationId;
pub use self::naming::{queue_name, reply_queue_name};
pub use self::task::TaskRequest;
