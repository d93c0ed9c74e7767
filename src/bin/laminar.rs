/*
 * laminar is the Laminar server: a replicated multi-topic event log. It
 * binds a client-facing and a cluster-facing TCP socket, recovers its state
 * from the data directory, and runs until the operator types `stop` on the
 * console. A fresh node starts as the leader of a single-node cluster;
 * membership grows through UPDATE_CONFIG mutations submitted by clients.
 */

#![warn(clippy::all)]

use laminar::error::Result;
use laminar::server::console;
use laminar::Server;

use log::info;
use std::net::{IpAddr, Ipv4Addr, SocketAddr, TcpListener};
use std::path::Path;

fn main() {
    if let Err(err) = run() {
        eprintln!("Fatal start-up error: {err}");
        std::process::exit(1);
    }
}

fn run() -> Result<()> {
    let args = clap::command!()
        .about("Laminar replicated event log server")
        .arg(
            clap::Arg::new("clientIp")
                .long("clientIp")
                .help("IP address to bind for client connections")
                .default_value("0.0.0.0"),
        )
        .arg(
            clap::Arg::new("clientPort")
                .long("clientPort")
                .help("Port to bind for client connections")
                .default_value("9600"),
        )
        .arg(
            clap::Arg::new("clusterIp")
                .long("clusterIp")
                .help("IP address to bind for cluster peer connections")
                .default_value("0.0.0.0"),
        )
        .arg(
            clap::Arg::new("clusterPort")
                .long("clusterPort")
                .help("Port to bind for cluster peer connections")
                .default_value("9700"),
        )
        .arg(
            clap::Arg::new("data")
                .long("data")
                .help("Directory for the mutation and event logs")
                .default_value("data"),
        )
        .arg(
            clap::Arg::new("logLevel")
                .long("logLevel")
                .help("Log level")
                .default_value("info"),
        )
        .get_matches();

    let loglevel = args.get_one::<String>("logLevel").unwrap().parse::<simplelog::LevelFilter>()?;
    let mut logconfig = simplelog::ConfigBuilder::new();
    if loglevel != simplelog::LevelFilter::Debug {
        logconfig.add_filter_allow_str("laminar");
    }
    simplelog::SimpleLogger::init(loglevel, logconfig.build())?;

    let client_addr = parse_addr(
        args.get_one::<String>("clientIp").unwrap(),
        args.get_one::<String>("clientPort").unwrap(),
    )?;
    let cluster_addr = parse_addr(
        args.get_one::<String>("clusterIp").unwrap(),
        args.get_one::<String>("clusterPort").unwrap(),
    )?;

    let client_listener = TcpListener::bind(client_addr)?;
    let peer_listener = TcpListener::bind(cluster_addr)?;
    let data = Path::new(args.get_one::<String>("data").unwrap());

    let server =
        Server::new(data, advertised(peer_listener.local_addr()?), advertised(client_listener.local_addr()?))?;
    info!("Client socket bound: {client_addr}");
    info!("Cluster socket bound: {cluster_addr}");
    info!("Data directory: {}", data.display());
    info!("Node {} ready", server.entry().id);

    let (stop_tx, stop_rx) = crossbeam::channel::bounded(1);
    std::thread::spawn(move || console::run(stop_tx));
    server.serve(client_listener, peer_listener, stop_rx)
}

fn parse_addr(ip: &str, port: &str) -> Result<SocketAddr> {
    let ip: IpAddr = ip.parse()?;
    let port: u16 = port
        .parse()
        .map_err(|_| laminar::error::Error::InvalidInput(format!("invalid port {port}")))?;
    Ok(SocketAddr::new(ip, port))
}

/// The address to advertise in configs and identity exchanges. A wildcard
/// bind address is not reachable by peers, so fall back to loopback.
fn advertised(addr: SocketAddr) -> SocketAddr {
    if addr.ip().is_unspecified() {
        return SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), addr.port());
    }
    addr
}
