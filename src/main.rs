//! Entry point for `virtual-tcp`.
//!
//! Loads a flow (flow file or Wireshark JSON export) and either serves it as a
//! virtual service, replays it as a virtual client, or dumps it to a flow file.

use std::fs::File;
use std::io::BufReader;
use std::path::PathBuf;
use std::thread;

use anyhow::{Context, Result};
use clap::{ArgAction, Parser};

use virtual_tcp::config::{DEFAULT_MAX_CONNECTION_COUNT, DEFAULT_READ_BUFFER_SIZE};
use virtual_tcp::{
    capture, flow_file, ClientConfig, DriverState, Flow, ServiceConfig, VirtualTcpClient,
    VirtualTcpService,
};

/// Virtualizes a TCP service or client by replaying a packet flow.
#[derive(Parser)]
#[command(author, version, about)]
struct Cli {
    /// Flow file, or a Wireshark JSON export when --server-address is given.
    config_file: PathBuf,

    /// Port the virtual service listens on for the flow's default port.
    #[arg(short, long, default_value_t = 0)]
    port: u16,

    /// Run as a virtual client against this server (host:port).
    #[arg(short = 't', long)]
    target_server_address: Option<String>,

    /// Receive buffer size per connection.
    #[arg(short = 'b', long, default_value_t = DEFAULT_READ_BUFFER_SIZE)]
    read_buffer_size_bytes: usize,

    /// Flow instances served at the same time.
    #[arg(short = 'c', long, default_value_t = DEFAULT_MAX_CONNECTION_COUNT)]
    max_concurrent_connections: usize,

    /// Server address (ip or ip:port) in the Wireshark JSON export.
    #[arg(short = 'a', long)]
    server_address: Option<String>,

    /// Write the loaded flow to this flow file and exit.
    #[arg(short = 'd', long)]
    dump_file: Option<PathBuf>,

    /// -v for debug output, -vv for trace.
    #[arg(short, long, action = ArgAction::Count)]
    verbose: u8,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let flow = load_flow(&cli)?;

    if let Some(dump_file) = &cli.dump_file {
        flow_file::save(&flow, dump_file)
            .with_context(|| format!("writing flow to {}", dump_file.display()))?;
        return Ok(());
    }

    match &cli.target_server_address {
        Some(address) => run_client(&cli, address, flow),
        None => run_service(&cli, flow),
    }
}

fn init_logging(verbose: u8) {
    let mut builder =
        env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"));
    match verbose {
        0 => {}
        1 => {
            builder.filter_level(log::LevelFilter::Debug);
        }
        _ => {
            builder.filter_level(log::LevelFilter::Trace);
        }
    }
    builder.init();
}

fn load_flow(cli: &Cli) -> Result<Flow> {
    let path = &cli.config_file;
    match &cli.server_address {
        Some(server_address) => {
            let file =
                File::open(path).with_context(|| format!("opening {}", path.display()))?;
            capture::from_wireshark_json(BufReader::new(file), server_address)
                .with_context(|| format!("converting Wireshark export {}", path.display()))
        }
        None => flow_file::load(path).with_context(|| format!("loading flow {}", path.display())),
    }
}

fn run_service(cli: &Cli, flow: Flow) -> Result<()> {
    let mut config = ServiceConfig::default()
        .with_port(cli.port)
        .with_read_buffer_size(cli.read_buffer_size_bytes)
        .with_max_connections(cli.max_concurrent_connections);
    // a recorded single-port flow is served on --port when one is given
    if let [logical] = flow.ports().as_slice() {
        if *logical != 0 && cli.port != 0 {
            config = config.with_port_mapping(*logical, cli.port);
        }
    }

    let mut service = VirtualTcpService::new(config);
    service.set_flow(flow).context("installing flow")?;
    service.start().context("starting virtual service")?;
    log::info!("virtual service listening on ports {:?}", service.ports());
    loop {
        thread::park();
    }
}

fn run_client(cli: &Cli, address: &str, flow: Flow) -> Result<()> {
    let config = ClientConfig::new(address).with_read_buffer_size(cli.read_buffer_size_bytes);
    let mut client = VirtualTcpClient::new(config);
    client.set_flow(flow).context("installing flow")?;
    match client.run().context("running virtual client")? {
        DriverState::Completed => Ok(()),
        state => anyhow::bail!("virtual client flow ended as {state:?}"),
    }
}
