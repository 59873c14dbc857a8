//! congo: console aggregation server

use congo::attach::run_console;
use congo::protocol::AttachEndReason;
use congo::{
    Cli, Client, Command, Config, Drivers, Node, NodeAttrs, NodeManager, NodeName, NodeUpdate,
    Request, Response, Server, default_socket_path,
};
use clap::Parser;
use serde::Deserialize;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

type CliResult = Result<(), Box<dyn std::error::Error>>;

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    // Initialize logging
    let filter = if cli.verbose {
        EnvFilter::new("congo=debug")
    } else if matches!(cli.command, Command::Server) {
        EnvFilter::new("congo=info")
    } else {
        EnvFilter::new("congo=warn")
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    let result = match cli.command {
        Command::Server => run_server(cli.socket, cli.config.as_deref()).await,
        Command::Console { name } => {
            let socket_path = cli.socket.unwrap_or_else(default_socket_path);
            // A pending stdin read would keep the runtime from shutting down.
            let code = match run_console_command(socket_path, &name).await {
                Ok(()) => 0,
                Err(e) => {
                    error!("{}", e);
                    1
                }
            };
            std::process::exit(code);
        }
        cmd => {
            let socket_path = cli.socket.unwrap_or_else(default_socket_path);
            run_client(socket_path, cmd).await
        }
    };

    if let Err(e) = result {
        error!("{}", e);
        std::process::exit(1);
    }
}

async fn run_server(socket: Option<PathBuf>, config_path: Option<&Path>) -> CliResult {
    let config = Config::load(config_path)?;
    let socket_path = socket
        .or_else(|| config.socket_path.clone())
        .unwrap_or_else(default_socket_path);

    let manager = Arc::new(NodeManager::from_config(&config, Drivers::with_defaults()));
    manager.start().await?;

    let server = Server::new(socket_path, manager);
    let shutdown = server.shutdown_handle();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Interrupted");
            let _ = shutdown.send(());
        }
    });

    server.run().await?;
    Ok(())
}

async fn run_console_command(socket_path: PathBuf, name: &str) -> CliResult {
    let client = Client::new(socket_path);
    let (response, stream) = client.attach(name).await?;

    let stream = match (response, stream) {
        (Response::AttachStarted { writable, .. }, Some(stream)) => {
            if writable {
                eprintln!("Connected to {name}. Escape: Ctrl+E c .\r");
            } else {
                eprintln!("Connected to {name} (read-only). Escape: Ctrl+E c .\r");
            }
            stream
        }
        (response, _) => return Err(response_error(response)),
    };

    match run_console(stream, name).await? {
        AttachEndReason::Detached => eprintln!("\r\nDetached from {name}"),
        AttachEndReason::ConsoleClosed { reason } => {
            eprintln!("\r\nConsole {name} closed: {reason}");
        }
        AttachEndReason::Error { message } => return Err(message.into()),
    }
    Ok(())
}

/// Entry of a bulk-delete file. Extra fields are ignored so a bulk-create file
/// can be reused.
#[derive(Debug, Deserialize)]
struct NameEntry {
    name: String,
}

fn read_input(path: &Path) -> Result<String, std::io::Error> {
    if path == Path::new("-") {
        let mut text = String::new();
        std::io::stdin().read_to_string(&mut text)?;
        Ok(text)
    } else {
        std::fs::read_to_string(path)
    }
}

fn response_error(response: Response) -> Box<dyn std::error::Error> {
    match response {
        Response::Error { kind, message } => format!("{kind}: {message}").into(),
        other => format!("unexpected response: {other:?}").into(),
    }
}

#[allow(clippy::too_many_lines)] // Command dispatch function, splitting would reduce clarity
async fn run_client(socket_path: PathBuf, command: Command) -> CliResult {
    let mut client = Client::new(socket_path);
    let json = matches!(command, Command::List { json: true, .. });
    let raw = matches!(command, Command::Tail { raw: true, .. });

    let request = match command {
        Command::Ping => Request::Ping,
        Command::List { hosts: true, .. } => Request::ListHosts,
        Command::List { .. } => Request::List,
        Command::Show { name } => Request::Show { name },
        Command::Create { name, attrs, params } => {
            let attrs = NodeAttrs::from_pairs(&attrs)?;
            let mut node = Node::new(name, attrs.driver.unwrap_or_default())
                .with_ondemand(attrs.ondemand.unwrap_or(true));
            node.params = params.unwrap_or_default();
            Request::Create { node }
        }
        Command::Update { name, attrs, params } => {
            let attrs = NodeAttrs::from_pairs(&attrs)?;
            if attrs.driver.is_some() {
                return Err("the driver of a node cannot be changed".into());
            }
            if attrs.ondemand.is_none() && params.is_none() {
                return Err("nothing to update: give ondemand=<bool> and/or --params".into());
            }
            Request::Update {
                name,
                update: NodeUpdate {
                    params,
                    ondemand: attrs.ondemand,
                },
            }
        }
        Command::Delete { name } => Request::Delete { name },
        Command::BulkCreate { file } => {
            let nodes: Vec<Node> = serde_json::from_str(&read_input(&file)?)?;
            Request::CreateBulk { nodes }
        }
        Command::BulkDelete { file } => {
            let entries: Vec<NameEntry> = serde_json::from_str(&read_input(&file)?)?;
            Request::DeleteBulk {
                nodes: entries.into_iter().map(|e| NodeName { name: e.name }).collect(),
            }
        }
        Command::State { state, names } => Request::SetState {
            nodes: names.into_iter().map(|name| NodeName { name }).collect(),
            state,
        },
        Command::Logging { name, state } => Request::Logging { name, on: state },
        Command::Tail { name, bytes, .. } => Request::Tail { name, bytes },
        Command::Shutdown => Request::Shutdown,
        Command::Server | Command::Console { .. } => {
            return Err("not a client command".into());
        }
    };

    match client.request(request).await? {
        Response::Ok => {}
        Response::Pong => println!("pong"),
        Response::Nodes { nodes } => {
            if json {
                println!("{}", serde_json::to_string(&nodes)?);
            } else if nodes.is_empty() {
                println!("(no nodes)");
            } else {
                for node in nodes {
                    println!(
                        "{}\t{}\t{}\t{}",
                        node.name,
                        node.driver,
                        if node.ondemand { "ondemand" } else { "always" },
                        node.host().unwrap_or("-"),
                    );
                }
            }
        }
        Response::Hosts { hosts } => {
            for (name, host) in hosts {
                println!("{name}\t{host}");
            }
        }
        Response::Node {
            node,
            console,
            warning,
        } => {
            let value = serde_json::json!({ "node": node, "console": console });
            println!("{}", serde_json::to_string_pretty(&value)?);
            if let Some(warning) = warning {
                eprintln!("warning: {warning}");
            }
        }
        Response::Created { name, warning } => {
            println!("{name}");
            if let Some(warning) = warning {
                eprintln!("warning: {warning}");
            }
        }
        Response::Bulk { result } => {
            println!("{}", serde_json::to_string_pretty(&result)?);
            let failed = result.failure_count();
            if failed > 0 {
                return Err(format!("{failed} of {} items failed", result.item_count()).into());
            }
        }
        Response::Output { data } => {
            let data = if raw {
                data
            } else {
                strip_ansi_escapes::strip(&data)
            };
            let mut stdout = std::io::stdout();
            stdout.write_all(&data)?;
            if !data.ends_with(b"\n") && !data.is_empty() {
                stdout.write_all(b"\n")?;
            }
            stdout.flush()?;
        }
        other => return Err(response_error(other)),
    }

    Ok(())
}
