//! Stream abstraction
//!
//! Upstream links operate on this boxed type so the dialing layer (plain
//! TCP, TLS, in-memory pipes in tests) stays pluggable.

use tokio::io::{AsyncRead, AsyncWrite};

/// The byte stream an upstream link runs over
pub type Stream = Box<dyn AsyncReadWrite + Unpin + Send>;

/// Combined trait for async read + write
pub trait AsyncReadWrite: AsyncRead + AsyncWrite {}

impl<T: AsyncRead + AsyncWrite> AsyncReadWrite for T {}

/// Trait for types that can be converted into a Stream
pub trait IntoStream {
    fn into_stream(self) -> Stream;
}

impl<T> IntoStream for T
where
    T: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    fn into_stream(self) -> Stream {
        Box::new(self)
    }
}
