/*!
Error types shared by the sync engine, the store and the http service
*/
use std::time::Duration;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// transport failure or an error reported by the remote api
    #[error("history fetch error: {0}")]
    Fetch(String),

    #[error("history fetch timed out after {0:?}")]
    Timeout(Duration),

    /// rendered straight to clients, keep the message short
    #[error("user exist")]
    UserExists(String),

    #[error("store error: {0}")]
    Store(#[from] sled::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Errors worth retrying on the next sync tick
    pub fn is_transient(&self) -> bool {
        matches!(self, Error::Fetch(_) | Error::Timeout(_))
    }
}

impl From<String> for Error {
    fn from(s: String) -> Self {
        Error::Other(s)
    }
}

impl From<&str> for Error {
    fn from(s: &str) -> Self {
        Error::Other(s.to_string())
    }
}

impl From<sled::transaction::TransactionError<Error>> for Error {
    fn from(e: sled::transaction::TransactionError<Error>) -> Self {
        match e {
            sled::transaction::TransactionError::Abort(e) => e,
            sled::transaction::TransactionError::Storage(e) => Error::Store(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn duplicate_user_message_is_client_facing() {
        let e = Error::UserExists("rj".to_string());
        assert_eq!(e.to_string(), "user exist");
        assert!(!e.is_transient());
    }

    #[test]
    fn fetch_failures_are_transient() {
        assert!(Error::Fetch("connection reset".into()).is_transient());
        assert!(Error::Timeout(Duration::from_secs(30)).is_transient());
        assert!(!Error::from("boom").is_transient());
    }

    #[test]
    fn aborted_transactions_unwrap_to_inner_error() {
        let e: Error = sled::transaction::TransactionError::Abort(Error::UserExists(
            "rj".to_string(),
        ))
        .into();
        assert!(matches!(e, Error::UserExists(ref u) if u == "rj"));
    }
}
