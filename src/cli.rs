//! Command-line interface for congo.

use clap::{Parser, Subcommand};
use std::collections::BTreeMap;
use std::path::PathBuf;

/// Parse a `key=value` pair.
pub fn parse_pair(s: &str) -> Result<(String, String), String> {
    let (key, value) = s
        .split_once('=')
        .ok_or_else(|| format!("expected key=value, got '{s}'"))?;
    let key = key.trim();
    if key.is_empty() {
        return Err(format!("empty key in '{s}'"));
    }
    Ok((key.to_string(), value.trim().to_string()))
}

/// Parse a list of `key=value` pairs separated by `sep`.
///
/// Empty segments are skipped, so `"a=1,,b=2,"` is accepted. A repeated key
/// keeps its last value.
pub fn parse_key_values(s: &str, sep: char) -> Result<BTreeMap<String, String>, String> {
    s.split(sep)
        .filter(|segment| !segment.trim().is_empty())
        .map(parse_pair)
        .collect()
}

/// Parse a boolean written the way operators tend to write them.
pub fn parse_bool(s: &str) -> Result<bool, String> {
    match s.trim().to_ascii_lowercase().as_str() {
        "true" | "yes" | "on" | "1" => Ok(true),
        "false" | "no" | "off" | "0" => Ok(false),
        other => Err(format!("expected a boolean, got '{other}'")),
    }
}

/// Node attributes given as positional `key=value` words.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NodeAttrs {
    pub driver: Option<String>,
    pub ondemand: Option<bool>,
}

impl NodeAttrs {
    /// Interpret `driver=..` and `ondemand=..`; anything else is an error.
    pub fn from_pairs(pairs: &[(String, String)]) -> Result<Self, String> {
        let mut attrs = Self::default();
        for (key, value) in pairs {
            match key.as_str() {
                "driver" => attrs.driver = Some(value.clone()),
                "ondemand" => attrs.ondemand = Some(parse_bool(value)?),
                other => {
                    return Err(format!(
                        "unknown attribute '{other}' (expected driver or ondemand; use --params for driver parameters)"
                    ));
                }
            }
        }
        Ok(attrs)
    }
}

/// Console aggregation server and client.
#[derive(Debug, Parser)]
#[command(name = "congo", version, about)]
pub struct Cli {
    /// Path to the Unix socket.
    #[arg(long, env = "CONGO_SOCKET")]
    pub socket: Option<PathBuf>,

    /// Server configuration file (TOML).
    #[arg(long, env = "CONGO_CONFIG")]
    pub config: Option<PathBuf>,

    /// Enable verbose logging.
    #[arg(short, long)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Run the server in the foreground.
    Server,

    /// Check that the server is up.
    Ping,

    /// List nodes.
    List {
        /// Output in JSON format (for piping to jq).
        #[arg(long)]
        json: bool,

        /// Print `name host` pairs only.
        #[arg(long, conflicts_with = "json")]
        hosts: bool,
    },

    /// Show a node and the state of its console.
    Show {
        /// Node name.
        name: String,
    },

    /// Register a node.
    ///
    /// Example: `congo create web1 driver=ssh ondemand=false --params host=10.0.0.5,user=root`
    Create {
        /// Node name.
        name: String,

        /// `driver=<cmd|ssh|ipmitool>` and optionally `ondemand=<bool>`.
        #[arg(value_name = "KEY=VALUE", value_parser = parse_pair)]
        attrs: Vec<(String, String)>,

        /// Driver parameters as comma-separated `key=value` pairs.
        #[arg(long, short, value_name = "K=V,...", value_parser = parse_params)]
        params: Option<BTreeMap<String, String>>,
    },

    /// Replace a node's parameters and/or on-demand flag.
    Update {
        /// Node name.
        name: String,

        /// `ondemand=<bool>`.
        #[arg(value_name = "KEY=VALUE", value_parser = parse_pair)]
        attrs: Vec<(String, String)>,

        /// New driver parameters; replaces the existing set.
        #[arg(long, short, value_name = "K=V,...", value_parser = parse_params)]
        params: Option<BTreeMap<String, String>>,
    },

    /// Remove a node, closing its console.
    Delete {
        /// Node name.
        name: String,
    },

    /// Register every node listed in a JSON file (`[{"name": .., "driver": .., ...}]`).
    BulkCreate {
        /// Path to the JSON file, or `-` for stdin.
        file: PathBuf,
    },

    /// Remove every node listed in a JSON file (`[{"name": ..}]`).
    BulkDelete {
        /// Path to the JSON file, or `-` for stdin.
        file: PathBuf,
    },

    /// Open or close the consoles of several nodes.
    State {
        /// `open` or `close`.
        state: String,

        /// Node names.
        #[arg(required = true)]
        names: Vec<String>,
    },

    /// Turn output recording for a node on or off.
    ///
    /// While on, the console stays open without viewers.
    Logging {
        /// Node name.
        name: String,

        /// `on` or `off`.
        #[arg(value_parser = parse_bool, action = clap::ArgAction::Set)]
        state: bool,
    },

    /// Attach to a node's console interactively.
    ///
    /// Press Ctrl+E, c, . to detach.
    Console {
        /// Node name.
        name: String,
    },

    /// Print recent console output.
    Tail {
        /// Node name.
        name: String,

        /// Number of bytes to show.
        #[arg(short = 'c', long, default_value = "4096")]
        bytes: usize,

        /// Show raw output including ANSI escape codes.
        #[arg(long)]
        raw: bool,
    },

    /// Shut down the server.
    Shutdown,
}

fn parse_params(s: &str) -> Result<BTreeMap<String, String>, String> {
    parse_key_values(s, ',')
}
