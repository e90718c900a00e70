#[derive(Debug, thiserror::Error)]
pub enum CoordinatorError {
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },
}
