//! SSH driver.

use super::{CommandLine, Driver, DriverError, DriverHandle, DriverKind, start_command};
use crate::node::Node;

/// Opens a remote shell with the system `ssh` client.
///
/// Params: `host` (required), `user`, `port`, `identity` (key file), and
/// `password`. A password is handed to `sshpass -e` through the environment.
pub struct SshDriver;

impl SshDriver {
    pub(super) fn command(node: &Node) -> Result<CommandLine, DriverError> {
        let host = node.host().ok_or(DriverError::MissingParam {
            driver: DriverKind::Ssh,
            param: "host",
        })?;

        let mut argv: Vec<String> = Vec::new();
        if node.param("password").is_some() {
            argv.extend(["sshpass".into(), "-e".into()]);
        }
        argv.extend(["ssh".into(), "-tt".into()]);
        if let Some(port) = node.param("port") {
            argv.extend(["-p".into(), port.into()]);
        }
        if let Some(user) = node.param("user") {
            argv.extend(["-l".into(), user.into()]);
        }
        if let Some(identity) = node.param("identity") {
            argv.extend(["-i".into(), identity.into()]);
        }
        argv.push(host.into());

        let mut command = CommandLine::new(argv);
        if let Some(password) = node.param("password") {
            command = command.env("SSHPASS", password);
        }
        Ok(command)
    }
}

impl Driver for SshDriver {
    fn kind(&self) -> DriverKind {
        DriverKind::Ssh
    }

    fn start(&self, node: &Node, rows: u16, cols: u16) -> Result<DriverHandle, DriverError> {
        start_command(&Self::command(node)?, rows, cols)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_minimal_command() {
        let node = Node::new("n1", "ssh").with_param("host", "10.0.0.1");
        let command = SshDriver::command(&node).unwrap();
        assert_eq!(command.argv, ["ssh", "-tt", "10.0.0.1"]);
        assert!(command.env.is_empty());
    }

    #[test]
    fn test_full_command() {
        let node = Node::new("n1", "ssh")
            .with_param("host", "10.0.0.1")
            .with_param("port", "2222")
            .with_param("user", "admin")
            .with_param("password", "secret");
        let command = SshDriver::command(&node).unwrap();
        assert_eq!(
            command.argv,
            ["sshpass", "-e", "ssh", "-tt", "-p", "2222", "-l", "admin", "10.0.0.1"]
        );
        assert!(!command.argv.iter().any(|arg| arg == "secret"));
        assert_eq!(command.env, [("SSHPASS".to_string(), "secret".to_string())]);
    }

    #[test]
    fn test_missing_host() {
        let node = Node::new("n1", "ssh").with_param("user", "admin");
        assert!(matches!(
            SshDriver::command(&node),
            Err(DriverError::MissingParam { param: "host", .. })
        ));
    }
}
