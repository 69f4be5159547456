// Jackson Coxson
// Streams the device system log

use std::io::Write;

use amdevice::syslog_relay::SyslogRelayClient;
use clap::{Arg, Command};

mod common;

#[tokio::main]
async fn main() {
    env_logger::init();

    let matches = Command::new("amdevice_syslog")
        .about("Relay system logs")
        .arg(
            Arg::new("udid")
                .long("udid")
                .value_name("UDID")
                .help("UDID of the device, the first attached device if omitted"),
        )
        .get_matches();

    let device = match common::get_device(matches.get_one::<String>("udid")).await {
        Ok(d) => d,
        Err(e) => {
            eprintln!("{e}");
            return;
        }
    };

    let mut relay = SyslogRelayClient::connect(&device)
        .await
        .expect("Unable to connect to syslog relay");
    let mut stdout = std::io::stdout();
    while let Some(chunk) = relay.next_chunk().await.expect("Failed to read next log") {
        print!("{chunk}");
        stdout.flush().expect("Unable to flush stdout");
    }
}
