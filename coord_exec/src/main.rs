//! Rover coordinator executable entry point.
//!
//! # Architecture
//!
//! The executable runs the following threads:
//!
//!     - Coordinator: takes status events from the ingress queue and evaluates the rules
//!     - Dispatch: delivers the coordinator's directives to the subsystems
//!     - Status server: recieves status events from the network (unless a script is given)
//!     - TM server: publishes state updates (unless running offline)
//!
//! When an event script is given the main thread replays it into the ingress queue, otherwise it
//! waits for the coordinator to stop. Ctrl-C closes the ingress queue, stopping the coordinator
//! once the queue has drained.

// ---------------------------------------------------------------------------
// IMPORTS
// ---------------------------------------------------------------------------

// External
use color_eyre::{
    eyre::{eyre, WrapErr},
    Report,
};
use log::{debug, info, warn};
use std::{
    path::PathBuf,
    sync::{
        atomic::{AtomicBool, Ordering},
        mpsc, Arc,
    },
    thread,
    time::{Duration, Instant},
};
use structopt::StructOpt;

// Internal
use comms_if::net::{zmq, NetParams};
use coord_lib::{
    actor::CoordinatorActor,
    coordinator::{Coordinator, Transition},
    directive_client::ZmqDirectiveClient,
    dispatch::{CommandDispatch, LogSink},
    ingress::{self, IngressSender},
    params::CoordParams,
    rules::RuleTable,
    status_server::StatusServer,
    tm_server::{StateUpdate, TmServer},
};
use util::{
    host,
    logger::{logger_init, LevelFilter},
    script_interpreter::{PendingEvents, ScriptInterpreter},
    session::Session,
};

// ---------------------------------------------------------------------------
// CONSTANTS
// ---------------------------------------------------------------------------

/// Period at which the script is checked for due events.
const SCRIPT_PERIOD_S: f64 = 0.05;

/// File in the session directory the transition history is saved to.
const HISTORY_FILE: &str = "transitions.json";

// ---------------------------------------------------------------------------
// STRUCTS
// ---------------------------------------------------------------------------

#[derive(Debug, StructOpt)]
#[structopt(name = "coord_exec", about = "Rover high-level coordinator")]
struct Opt {
    /// Event script to replay instead of recieving status events from the network
    #[structopt(parse(from_os_str))]
    script: Option<PathBuf>,

    /// Coordinator parameter file, relative to $ROVER_SW_ROOT/params
    #[structopt(long, default_value = "coordinator.toml")]
    params: String,

    /// Log directives instead of sending them, and don't publish telemetry
    #[structopt(long)]
    offline: bool,

    /// Log at debug level
    #[structopt(short, long)]
    verbose: bool,
}

// ---------------------------------------------------------------------------
// FUNCTIONS
// ---------------------------------------------------------------------------

/// Executable main function, entry point.
fn main() -> Result<(), Report> {
    color_eyre::install()?;

    let opt = Opt::from_args();

    // ---- EARLY INITIALISATION ----

    let session = Session::new("coord_exec", "sessions").wrap_err("Failed to create the session")?;

    logger_init(
        match opt.verbose {
            true => LevelFilter::Debug,
            false => LevelFilter::Info,
        },
        &session,
    )
    .wrap_err("Failed to initialise logging")?;

    info!("Rover Coordinator\n");
    info!(
        "Running on: {:#?}",
        host::get_uname().wrap_err("Failed to get host information")?
    );
    info!("Session directory: {:?}\n", session.session_root);
    debug!("CLI arguments: {:?}", opt);

    // ---- LOAD PARAMETERS ----

    let coord_params: CoordParams =
        util::params::load(&opt.params).wrap_err("Could not load coordinator params")?;
    coord_params
        .check_tuning()
        .wrap_err("Invalid coordinator params")?;
    let table = RuleTable::from_params(&coord_params).wrap_err("Invalid coordinator rules")?;

    info!(
        "{} rules over {} states loaded, starting in {}",
        table.num_rules(),
        table.enabled().len(),
        table.initial()
    );

    let use_network = !opt.offline || opt.script.is_none();
    let net_params: Option<NetParams> = match use_network {
        true => Some(util::params::load("net.toml").wrap_err("Could not load net params")?),
        false => None,
    };

    // ---- LOAD SCRIPT ----

    let script = match opt.script {
        Some(ref path) => {
            info!("Loading script from {:?}", path);

            let si = ScriptInterpreter::new(path).wrap_err("Failed to load script")?;

            info!(
                "Loaded script lasts {:.02} s and contains {} events\n",
                si.get_duration(),
                si.get_num_events()
            );

            Some(si)
        }
        None => {
            info!("No script provided, status events will be recieved from the network\n");
            None
        }
    };

    // ---- INITIALISE QUEUES ----

    let (ingress_tx, ingress_rx) = ingress::channel(&coord_params.ingress);
    let (directive_tx, directive_rx) = mpsc::channel();
    let (update_tx, update_rx) = mpsc::channel::<StateUpdate>();
    let stop = Arc::new(AtomicBool::new(false));

    {
        let ingress_tx = ingress_tx.clone();
        let stop = stop.clone();
        ctrlc::set_handler(move || {
            info!("Interrupt recieved, stopping");
            stop.store(true, Ordering::Relaxed);
            ingress_tx.close();
        })
        .wrap_err("Failed to set the interrupt handler")?;
    }

    // ---- INITIALISE NETWORK ----

    let zmq_ctx = zmq::Context::new();

    let dispatch_jh = match (opt.offline, net_params.as_ref()) {
        (false, Some(net)) => {
            let client = ZmqDirectiveClient::new(&zmq_ctx, net)
                .wrap_err("Failed to initialise the directive client")?;
            info!("Directive client initialised");

            CommandDispatch::new(client, coord_params.dispatch.clone(), ingress_tx.clone())
                .spawn(directive_rx)
        }
        _ => {
            info!("Running offline, directives will only be logged");

            CommandDispatch::new(LogSink, coord_params.dispatch.clone(), ingress_tx.clone())
                .spawn(directive_rx)
        }
    }
    .wrap_err("Failed to start the dispatch thread")?;

    let status_jh = match (script.is_none(), net_params.as_ref()) {
        (true, Some(net)) => {
            let server = StatusServer::new(&zmq_ctx, net, ingress_tx.clone())
                .wrap_err("Failed to initialise the status server")?;
            info!("Status server listening on {}", net.status_endpoint);

            Some(
                server
                    .spawn(stop.clone())
                    .wrap_err("Failed to start the status server")?,
            )
        }
        _ => None,
    };

    let tm_jh = match (opt.offline, net_params.as_ref()) {
        (false, Some(net)) => {
            let mut tm_server =
                TmServer::new(&zmq_ctx, net).wrap_err("Failed to initialise the TM server")?;
            info!("TM server publishing on {}", net.tm_endpoint);

            Some(
                thread::Builder::new()
                    .name("tm_server".into())
                    .spawn(move || {
                        for update in update_rx.iter() {
                            if let Err(e) = tm_server.send(&update) {
                                warn!("Could not publish state update: {}", e);
                            }
                        }
                    })
                    .wrap_err("Failed to start the TM server")?,
            )
        }
        _ => None,
    };

    info!("Network initialisation complete");

    // ---- START COORDINATOR ----

    let coordinator =
        Coordinator::new(table).with_history_len(coord_params.actor.history_len);
    let mut actor = CoordinatorActor::new(coordinator, ingress_rx, directive_tx, &coord_params.actor);
    if tm_jh.is_some() {
        actor = actor.with_updates(update_tx);
    }
    let state = actor.state_handle();

    let actor_jh = actor
        .spawn()
        .wrap_err("Failed to start the coordinator thread")?;

    // ---- MAIN LOOP ----

    if let Some(si) = script {
        run_script(si, &ingress_tx, &stop);
        ingress_tx.close();
    }

    let coordinator = actor_jh
        .join()
        .map_err(|_| eyre!("The coordinator thread panicked"))?;

    // ---- SHUTDOWN ----

    stop.store(true, Ordering::Relaxed);

    if let Some(jh) = status_jh {
        jh.join().map_err(|_| eyre!("The status server panicked"))?;
    }
    dispatch_jh
        .join()
        .map_err(|_| eyre!("The dispatch thread panicked"))?;
    if let Some(jh) = tm_jh {
        jh.join().map_err(|_| eyre!("The TM server panicked"))?;
    }

    let snapshot = state.snapshot();
    info!(
        "Coordinator stopped in {} after {} events and {} transitions",
        snapshot.state, snapshot.num_events, snapshot.num_transitions
    );

    let history: Vec<Transition> = coordinator.history().cloned().collect();
    session.save(HISTORY_FILE, history);

    session.exit();

    Ok(())
}

/// Replay the script into the ingress queue, returning once it has ended and the queue has been
/// drained, or a stop is requested.
fn run_script(mut si: ScriptInterpreter, ingress: &IngressSender, stop: &AtomicBool) {
    let start = Instant::now();

    while !stop.load(Ordering::Relaxed) {
        match si.get_pending_events(start.elapsed().as_secs_f64()) {
            PendingEvents::None => (),
            PendingEvents::Some(events) => {
                for event in events {
                    debug!("Script event {}/{}", event.source, event.payload);

                    if let Err(e) = ingress.submit(event) {
                        warn!("Script event not queued: {}", e);
                    }
                }
            }
            PendingEvents::EndOfScript => {
                if ingress.pending() == 0 {
                    info!("End of event script reached, stopping");
                    break;
                }
            }
        }

        thread::sleep(Duration::from_secs_f64(SCRIPT_PERIOD_S));
    }
}
