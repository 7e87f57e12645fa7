use std::io;
use std::path::Path;
use std::sync::PoisonError;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug)]
pub enum Error {
    IoError(io::Error),
    Decode(&'static str, io::Error),
    ChecksumMismatch,
    MutexPoisoned,
    InvalidData(String),
    InvalidSchema(String),
    InvalidOperation(String),
    // Directory listing or fragment metadata load failed (uri, reason)
    Directory(String, String),
    // A consolidation node could not be rewritten (node fragments, reason)
    Consolidation(String, String),
    // Global-order merge failure, terminal for the query
    Merge(String),
    // Query misuse or buffers too small to make progress
    Query(String),
}

impl Error {
    pub fn directory(uri: impl AsRef<Path>, reason: impl std::fmt::Display) -> Self {
        Error::Directory(uri.as_ref().display().to_string(), reason.to_string())
    }

    pub fn consolidation<S: AsRef<str>>(node: &[S], reason: impl std::fmt::Display) -> Self {
        let names: Vec<&str> = node.iter().map(|s| s.as_ref()).collect();
        Error::Consolidation(names.join(", "), reason.to_string())
    }

    pub fn out_of_order(uri: impl AsRef<Path>, coords: &[u64]) -> Self {
        Error::Merge(format!(
            "cell {:?} in fragment {} is out of global order",
            coords,
            uri.as_ref().display()
        ))
    }
}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Self {
        Error::IoError(err)
    }
}

impl<T> From<PoisonError<T>> for Error {
    fn from(_: PoisonError<T>) -> Self {
        Error::MutexPoisoned
    }
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Error::IoError(err) => write!(f, "I/O error: {}", err),
            Error::Decode(field, err) => write!(f, "Failed to decode {}: {}", field, err),
            Error::ChecksumMismatch => write!(f, "Checksum mismatch"),
            Error::MutexPoisoned => write!(f, "Mutex was poisoned"),
            Error::InvalidData(msg) => write!(f, "Invalid data: {}", msg),
            Error::InvalidSchema(msg) => write!(f, "Invalid schema: {}", msg),
            Error::InvalidOperation(msg) => write!(f, "Invalid operation: {}", msg),
            Error::Directory(uri, reason) => {
                write!(f, "Array directory error at {}: {}", uri, reason)
            }
            Error::Consolidation(node, reason) => {
                write!(f, "Consolidation of [{}] failed: {}", node, reason)
            }
            Error::Merge(msg) => write!(f, "Merge error: {}", msg),
            Error::Query(msg) => write!(f, "Query error: {}", msg),
        }
    }
}

impl std::error::Error for Error {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_directory_error_names_uri() {
        let err = Error::directory("/arrays/a/__fragments/__1_1_abc_2", "missing metadata");
        let msg = err.to_string();
        assert!(msg.contains("__1_1_abc_2"));
        assert!(msg.contains("missing metadata"));
    }

    #[test]
    fn test_consolidation_error_lists_node() {
        let err = Error::consolidation(&["__1_1_a_2", "__2_2_b_2"], "disk full");
        assert_eq!(
            err.to_string(),
            "Consolidation of [__1_1_a_2, __2_2_b_2] failed: disk full"
        );
    }

    #[test]
    fn test_poison_maps_to_mutex_poisoned() {
        let lock = std::sync::Mutex::new(0);
        let _ = std::panic::catch_unwind(|| {
            let _guard = lock.lock().unwrap();
            panic!("poison");
        });
        let err: Error = lock.lock().unwrap_err().into();
        assert!(matches!(err, Error::MutexPoisoned));
    }
}
