use std::io;
use std::sync::{Mutex, MutexGuard};

pub type NetworkResult<T> = Result<T, NetworkError>;

/// Two-level error plumbing used throughout the crate. `Wait` signals that an
/// operation made as much progress as the socket allowed and should be retried
/// on the next readiness event; `Fatal` errors close the connection.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum NetworkError {
    Wait,
    Fatal(ErrorType),
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum ErrorType {
    /// The server acceptor could not be bound.
    Bind,
    /// The client could not resolve a hostname.
    Resolve,
    /// The transport-level connect failed.
    ConnectFailed,
    /// The peer produced the wrong scrambled reply, or handshake I/O failed.
    HandshakeFailed,
    /// Message extract from a too-small body.
    Underflow,
    /// Queue pop or peek on an empty queue.
    Empty,
    /// Any other read/write failure.
    Io(io::ErrorKind),
}

impl From<io::Error> for NetworkError {
    #[inline]
    fn from(io_error: io::Error) -> Self {
        match io_error.kind() {
            io::ErrorKind::WouldBlock => NetworkError::Wait,
            kind => NetworkError::Fatal(ErrorType::Io(kind)),
        }
    }
}

pub trait ErrorUtils {
    fn has_failed(&self) -> bool;
}

impl<T> ErrorUtils for NetworkResult<T> {
    #[inline]
    fn has_failed(&self) -> bool {
        match self {
            Ok(_) => false,
            Err(NetworkError::Wait) => false,
            Err(NetworkError::Fatal(_)) => true,
        }
    }
}

/// Locks a mutex, folding poisoning away. All state guarded by these locks is
/// safe to observe after a panicking writer: queues and connection state are
/// updated in single operations.
#[inline]
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_would_block_folds_to_wait() {
        let err: NetworkError = io::Error::from(io::ErrorKind::WouldBlock).into();
        assert_eq!(err, NetworkError::Wait);
        assert!(!Err::<(), _>(err).has_failed());
    }

    #[test]
    fn test_io_error_is_fatal() {
        let err: NetworkError = io::Error::from(io::ErrorKind::ConnectionReset).into();
        assert_eq!(
            err,
            NetworkError::Fatal(ErrorType::Io(io::ErrorKind::ConnectionReset))
        );
        assert!(Err::<(), _>(err).has_failed());
    }
}
