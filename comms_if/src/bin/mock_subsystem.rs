//! Mock subsystem directive server
//!
//! Binds a REP socket on the given endpoint and acknowledges every directive it receives, so the
//! coordinator can be exercised on the bench without the real subsystem processes.

use comms_if::{
    directive::{CommandDirective, DirectiveResponse},
    net::{MonitoredSocket, SocketOptions},
    status::SubsystemId,
};
use structopt::StructOpt;

#[derive(Debug, StructOpt)]
#[structopt(name = "mock_subsystem")]
struct Opt {
    /// The subsystem to pretend to be
    subsystem: SubsystemId,

    /// The endpoint to bind to, such as `tcp://*:5101`
    endpoint: String,

    /// Reject every directive instead of accepting it
    #[structopt(long)]
    reject: bool,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let opt = Opt::from_args();

    let ctx = zmq::Context::new();

    let socket_options = SocketOptions {
        bind: true,
        block_on_first_connect: false,
        ..Default::default()
    };

    let socket = MonitoredSocket::new(&ctx, zmq::REP, socket_options, &opt.endpoint)?;

    println!("Mock {} subsystem running on {}", opt.subsystem, opt.endpoint);

    let response = match opt.reject {
        true => DirectiveResponse::Rejected,
        false => DirectiveResponse::Accepted,
    };

    loop {
        let msg = socket.recv_msg(0)?;

        match msg.as_str().map(serde_json::from_str::<CommandDirective>) {
            Some(Ok(d)) if d.target == opt.subsystem => {
                println!("Recieved {}, responding {:?}", d, response);
                socket.send(&serde_json::to_string(&response)?, 0)?;
            }
            Some(Ok(d)) => {
                println!("Recieved {} addressed to another subsystem, rejecting", d);
                socket.send(&serde_json::to_string(&DirectiveResponse::Rejected)?, 0)?;
            }
            Some(Err(e)) => {
                println!("Recieved invalid directive: {}", e);
                socket.send(&serde_json::to_string(&DirectiveResponse::Rejected)?, 0)?;
            }
            None => {
                println!("Received no data");
                socket.send(&serde_json::to_string(&DirectiveResponse::Rejected)?, 0)?;
            }
        }
    }
}
