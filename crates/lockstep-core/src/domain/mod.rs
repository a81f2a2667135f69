//! Domain model (ids, jobs, lifecycle events, errors).

pub mod errors;
pub mod events;
pub mod ids;
pub mod job;

pub use self::errors::{ErrorKind, HandlerError, PoolError, QueueError, SessionError};
pub use self::events::{JobEvent, JobEventKind};
pub use self::ids::{JobId, TenantId};
pub use self::job::{Job, JobKind};
