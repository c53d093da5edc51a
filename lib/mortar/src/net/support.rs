use std::io;
use std::net;

pub type NetworkResult<T> = Result<T, NetworkError>;

/// Two-level transport error: `Wait` means the operation would block and
/// should be retried on the next readiness event, `Fatal` means the
/// descriptor is beyond recovery.
#[derive(Debug, Eq, PartialEq)]
pub enum NetworkError {
    Wait,
    Fatal(ErrorType),
}

#[derive(Debug, Eq, PartialEq)]
pub enum ErrorType {
    AddrParse,
    BufferOverrun,
    PeerClosed,
    PoolClosed,
    Unsupported,
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

impl From<net::AddrParseError> for NetworkError {
    #[inline]
    fn from(_: net::AddrParseError) -> Self {
        NetworkError::Fatal(ErrorType::AddrParse)
    }
}

pub trait ErrorUtils {
    fn has_failed(&self) -> bool;
}

impl<T> ErrorUtils for NetworkResult<T> {
    fn has_failed(&self) -> bool {
        match self {
            Ok(_) => false,
            Err(NetworkError::Wait) => false,
            _ => true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_would_block_folds_to_wait() {
        let err: NetworkError = io::Error::from(io::ErrorKind::WouldBlock).into();

        assert_eq!(err, NetworkError::Wait);
    }

    #[test]
    fn test_hard_io_is_fatal() {
        let err: NetworkError = io::Error::from(io::ErrorKind::ConnectionReset).into();

        assert_eq!(
            err,
            NetworkError::Fatal(ErrorType::Io(io::ErrorKind::ConnectionReset))
        );
    }

    #[test]
    fn test_wait_has_not_failed() {
        let result: NetworkResult<()> = Err(NetworkError::Wait);

        assert!(!result.has_failed());
        assert!(Err::<(), _>(NetworkError::Fatal(ErrorType::PeerClosed)).has_failed());
        assert!(!Ok::<_, NetworkError>(5).has_failed());
    }
}
