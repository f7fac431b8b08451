use crate::Destination;
use std::sync::Arc;

/// Terminal errors delivered to subscribers.
///
/// Each subscriber observes at most one of these, after which its stream
/// ends.
#[derive(Clone, Debug, thiserror::Error)]
pub enum Error {
    /// No resolver can handle the destination. This is an input error and is
    /// never retried.
    #[error("cannot resolve {0}")]
    Unresolvable(Destination),

    /// The destination's resolver failed permanently.
    #[error("resolution failed: {0}")]
    Resolver(Arc<anyhow::Error>),

    /// The subscriber did not keep up with updates and was detached.
    #[error("subscriber fell behind destination updates")]
    Lagged,
}

impl Error {
    pub fn resolver(error: anyhow::Error) -> Self {
        Self::Resolver(Arc::new(error))
    }
}
