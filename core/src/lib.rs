pub mod error;
pub mod interaction;

pub use error::{BindAttempt, BindError, CancelReason, ResolveError, SessionError};
pub use interaction::{AccountInfo, EnvCandidate, ErrorContext, InteractiveResult, ResultKind};
