//! The operator console: a thread reading commands from stdin. The only
//! command is `stop`, which shuts the node down; trailing arguments are
//! ignored.

use crossbeam::channel::Sender;
use log::info;
use std::io::BufRead as _;

pub fn run(stop_tx: Sender<()>) {
    let stdin = std::io::stdin();
    for line in stdin.lock().lines() {
        let Ok(line) = line else { break };
        match line.split_whitespace().next() {
            Some("stop") => {
                stop_tx.send(()).ok();
                return;
            }
            Some(command) => info!("Unknown console command {command}; try: stop"),
            None => {}
        }
    }
    // On stdin EOF (e.g. a daemonized node) keep the stop channel open and
    // let the server run; dropping it would read as a stop request.
    loop {
        std::thread::park();
    }
}
