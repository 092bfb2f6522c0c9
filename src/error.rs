use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Invalid arguments: {0}")]
    InvalidArgs(String),

    #[error("Invalid JID: {0}")]
    InvalidJid(String),

    #[error("No Signal session for {0}")]
    NoSession(String),

    #[error("Unknown ciphertext type: {0}")]
    UnknownCiphertextType(String),

    #[error("Group ID is required")]
    MissingGroupId,

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Database error: {0}")]
    Database(String),

    #[error("Cipher error: {0}")]
    Cipher(String),

    #[error("Directory resolver error: {0}")]
    Resolver(String),

    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),
}
