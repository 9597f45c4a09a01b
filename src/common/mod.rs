//! Common types and abstractions
//!
//! This module defines the core types used throughout the crate:
//! - FlowKey: 5-tuple identity of a flow
//! - Address: upstream endpoint address representation
//! - Stream: unified async I/O abstraction for upstream links

mod address;
mod flow;
mod stream;

pub use address::Address;
pub use flow::{Direction, FlowKey, IpProtocol};
pub use stream::{AsyncReadWrite, IntoStream, Stream};

// Re-export error types from crate root
pub use crate::error::{Error, Result};
