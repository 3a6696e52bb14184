use thiserror::Error;

/// Configuration validation errors.
#[derive(Debug, Error)]
pub enum ValidationError {
    /// The worker pool cannot be empty.
    #[error("`workers.count` cannot be zero")]
    WorkerCountZero,
    /// A bounded run must perform at least one iteration.
    #[error("`workers.max_iterations` cannot be zero")]
    MaxIterationsZero,
    /// The contended record's table must be named.
    #[error("`record.table` cannot be empty")]
    EmptyTableName,
    /// TLS is enabled but no trusted root certificates are provided.
    #[error("Invalid TLS config: `trusted_root_certs` must be set when `enabled` is true")]
    MissingTrustedRootCerts,
}
