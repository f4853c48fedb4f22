use thiserror::Error;

pub type Result<T> = std::result::Result<T, BurrowError>;

#[derive(Debug, Error)]
pub enum BurrowError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("host not found: '{0}'")]
    HostNotFound(String),

    #[error("backup #{num} not found for host '{host}'")]
    BackupNotFound { host: String, num: u32 },

    #[error("backup #{0} has keep set; pass the override flag to delete it")]
    KeepSet(u32),

    #[error("cannot merge: {0}")]
    CannotMerge(String),

    #[error("invalid on-disk format: {0}")]
    InvalidFormat(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] rmp_serde::encode::Error),

    #[error("deserialization error: {0}")]
    Deserialization(#[from] rmp_serde::decode::Error),

    #[error("host '{0}' is locked by the server")]
    Locked(String),

    #[error("server is running; stop it before migrating")]
    ServerRunning,

    #[error("decompression error: {0}")]
    Decompression(String),

    #[error("unknown compression tag: {0}")]
    UnknownCompressionTag(u8),

    #[error("{0}")]
    Other(String),
}
