//! # Status console
//!
//! Interactive console which sends status events to the coordinator, standing in for a subsystem
//! or the operator control station. Each line is `<source> <payload> [--safety]`, for example:
//!
//! ```text
//! Rover $ drive goal_received
//! Rover $ control estop --safety
//! ```

use color_eyre::{eyre::WrapErr, Report};
use comms_if::{
    net::{zmq, MonitoredSocket, SocketOptions},
    status::{StatusCmd, StatusEvent},
};
use rustyline::{error::ReadlineError, DefaultEditor};
use structopt::StructOpt;

const PROMPT: &str = "Rover $ ";
const HISTORY_PATH: &str = "status_cli_history.txt";

#[derive(Debug, StructOpt)]
#[structopt(name = "status_cli", about = "Send status events to the rover coordinator")]
struct Opt {
    /// The coordinator's status endpoint
    #[structopt(long, default_value = "tcp://localhost:5100")]
    endpoint: String,
}

fn main() -> Result<(), Report> {
    color_eyre::install()?;

    let opt = Opt::from_args();

    let ctx = zmq::Context::new();
    let socket_options = SocketOptions {
        block_on_first_connect: false,
        linger: 1000,
        send_timeout: 1000,
        ..Default::default()
    };
    let socket = MonitoredSocket::new(&ctx, zmq::PUSH, socket_options, &opt.endpoint)
        .wrap_err("Could not create the status socket")?;

    println!("Sending status events to {}", opt.endpoint);
    println!("Enter `<source> <payload> [--safety]`, `help`, or `exit`\n");

    let mut rl = DefaultEditor::new().wrap_err("Could not start the line editor")?;
    if rl.load_history(HISTORY_PATH).is_err() {
        println!("No history detected");
    }

    loop {
        let line = match rl.readline(PROMPT) {
            Ok(line) => line,
            Err(ReadlineError::Interrupted) | Err(ReadlineError::Eof) => break,
            Err(e) => return Err(e).wrap_err("Could not read the line"),
        };

        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        rl.add_history_entry(line).ok();

        match line {
            "exit" | "quit" => break,
            "help" => {
                StatusCmd::clap().print_help().ok();
                println!();
                continue;
            }
            _ => (),
        }

        let event = match parse(line) {
            Ok(e) => e,
            Err(e) => {
                println!("{}", e);
                continue;
            }
        };

        if !socket.connected() {
            println!("Coordinator not connected, the event will be sent once it connects");
        }

        let json = event
            .to_json()
            .wrap_err("Could not serialize the status event")?;

        match socket.send(&json, 0) {
            Ok(()) => println!("Sent {}", json),
            Err(e) => println!("Could not send the event: {}", e),
        }
    }

    if let Err(e) = rl.save_history(HISTORY_PATH) {
        println!("Could not save history: {}", e);
    }

    println!("Exiting...");

    Ok(())
}

/// Parse a console line into a status event.
fn parse(line: &str) -> Result<StatusEvent, structopt::clap::Error> {
    let args = std::iter::once("status").chain(line.split_whitespace());

    StatusCmd::from_iter_safe(args).map(StatusEvent::from)
}
