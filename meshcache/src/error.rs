use std::io;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ClusterError {
    #[error("not enough replicas")]
    /// The write requested replication but the cluster does not currently
    /// know enough peers. The local write has already happened.
    NotEnoughReplicas,

    #[error("data not found")]
    /// The key is absent locally and no peer answered before the get timeout.
    NotFound,

    #[error("an IO error occurred: {0}")]
    Io(#[from] io::Error),

    #[error("the listen port must be a positive number")]
    InvalidListenPort,

    #[error("a seed address is required when join is enabled")]
    MissingSeedAddress,

    #[error("cluster-wide delete is not supported")]
    /// Deletion propagation is explicitly out of scope for this design.
    DeleteUnsupported,

    #[error("local storage error: {0}")]
    Storage(#[source] anyhow::Error),
}
