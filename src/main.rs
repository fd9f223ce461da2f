//! Daemon entry point and a minimal one-shot client for scripting and tests.

use clap::{Parser, Subcommand};
use gumshoe::client::DaemonClient;
use std::path::PathBuf;
use std::process::ExitCode;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the debugger daemon in the foreground.
    Serve {
        /// Socket path (defaults to the runtime dir).
        #[arg(long, env = "GUMSHOE_SOCKET")]
        socket: Option<PathBuf>,
    },
    /// Call a single tool on the daemon (starting it if needed) and print
    /// the JSON result.
    Call {
        /// Tool name, e.g. `launch`, `breakpoint`, `run`.
        tool: String,
        /// Tool arguments as a JSON object.
        params: Option<String>,
        #[arg(long, env = "GUMSHOE_SOCKET")]
        socket: Option<PathBuf>,
    },
}

fn main() -> ExitCode {
    gumshoe::log::init();

    let args = Args::parse();
    match args.command {
        Command::Serve { socket } => {
            let socket = socket.unwrap_or_else(gumshoe::daemon::default_socket_path);
            if let Err(e) = gumshoe::daemon::serve(&socket) {
                eprintln!("daemon failed: {e}");
                return ExitCode::FAILURE;
            }
            ExitCode::SUCCESS
        }
        Command::Call {
            tool,
            params,
            socket,
        } => {
            let params = match params {
                Some(raw) => match serde_json::from_str(&raw) {
                    Ok(value) => value,
                    Err(e) => {
                        eprintln!("bad params json: {e}");
                        return ExitCode::FAILURE;
                    }
                },
                None => serde_json::json!({}),
            };

            let mut client = match DaemonClient::connect_or_start(socket) {
                Ok(client) => client,
                Err(e) => {
                    eprintln!("cannot reach daemon: {e}");
                    return ExitCode::FAILURE;
                }
            };
            match client.call(&tool, params) {
                Ok(result) => {
                    println!("{}", serde_json::to_string_pretty(&result).unwrap_or_default());
                    ExitCode::SUCCESS
                }
                Err(e) => {
                    eprintln!("{e}");
                    ExitCode::FAILURE
                }
            }
        }
    }
}
