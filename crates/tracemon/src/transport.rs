//! Remote command execution seam
//!
//! Session runners program against this narrow contract only; concrete
//! transports (SSH, serial consoles, container exec) live outside the
//! crate. Connection retries and the fault budget are the runner's job,
//! so implementations surface every failure instead of retrying.

use crate::error::TransportError;
use crate::flow::CommandOutput;

/// A remote session capable of running shell commands
///
/// Implementations are driven from a single runner thread; none of the
/// methods are called concurrently.
pub trait Transport: Send {
    /// Establish the session
    fn connect(&mut self) -> Result<(), TransportError>;

    /// Tear the session down; called even after a failed connect
    fn disconnect(&mut self) -> Result<(), TransportError>;

    /// Run `command` to completion and capture its output
    fn exec(&mut self, command: &str) -> Result<CommandOutput, TransportError>;

    /// Launch `command` without waiting for completion
    fn start(&mut self, command: &str) -> Result<(), TransportError>;

    fn is_connected(&self) -> bool;
}
