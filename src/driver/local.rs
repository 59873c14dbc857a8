//! Local command driver.

use super::{CommandLine, Driver, DriverError, DriverHandle, DriverKind, start_command};
use crate::node::Node;

/// Runs the node's `cmd` parameter through `sh -c`.
///
/// Params: `cmd` (required), `shell` (default `sh`).
pub struct CmdDriver;

impl CmdDriver {
    pub(super) fn command(node: &Node) -> Result<CommandLine, DriverError> {
        let cmd = node.param("cmd").ok_or(DriverError::MissingParam {
            driver: DriverKind::Cmd,
            param: "cmd",
        })?;
        let shell = node.param("shell").unwrap_or("sh");
        Ok(CommandLine::new([shell, "-c", cmd]))
    }
}

impl Driver for CmdDriver {
    fn kind(&self) -> DriverKind {
        DriverKind::Cmd
    }

    fn start(&self, node: &Node, rows: u16, cols: u16) -> Result<DriverHandle, DriverError> {
        start_command(&Self::command(node)?, rows, cols)
    }
}
