//! IPMI serial-over-LAN driver.

use super::{CommandLine, Driver, DriverError, DriverHandle, DriverKind, start_command};
use crate::node::Node;

/// Activates a SOL session with `ipmitool`.
///
/// Params: `host` (the BMC address, required), `user`, `password`, `port` and
/// `interface` (default `lanplus`). The password travels in `IPMI_PASSWORD`
/// and is picked up with `-E`.
pub struct IpmiDriver;

impl IpmiDriver {
    pub(super) fn command(node: &Node) -> Result<CommandLine, DriverError> {
        let host = node.host().ok_or(DriverError::MissingParam {
            driver: DriverKind::Ipmitool,
            param: "host",
        })?;
        let interface = node.param("interface").unwrap_or("lanplus");

        let mut argv: Vec<String> = vec![
            "ipmitool".into(),
            "-I".into(),
            interface.into(),
            "-H".into(),
            host.into(),
        ];
        if let Some(port) = node.param("port") {
            argv.extend(["-p".into(), port.into()]);
        }
        if let Some(user) = node.param("user") {
            argv.extend(["-U".into(), user.into()]);
        }
        if node.param("password").is_some() {
            argv.push("-E".into());
        }
        argv.extend(["sol".into(), "activate".into()]);

        let mut command = CommandLine::new(argv);
        if let Some(password) = node.param("password") {
            command = command.env("IPMI_PASSWORD", password);
        }
        Ok(command)
    }
}

impl Driver for IpmiDriver {
    fn kind(&self) -> DriverKind {
        DriverKind::Ipmitool
    }

    fn start(&self, node: &Node, rows: u16, cols: u16) -> Result<DriverHandle, DriverError> {
        start_command(&Self::command(node)?, rows, cols)
    }
}
