//! Remote sessions to managed nodes

mod backoff;
mod ssh;

pub use backoff::{ExponentialBackoff, RetryGate};
pub use ssh::{classify_io_error, test_connection, SshConnector, SshSession, TEST_CONNECTION_TIMEOUT};
