// Jackson Coxson
// Lists attached devices and optionally follows attach and detach events

use clap::{Arg, Command};

use amdevice::DiscoveryEvent;

mod common;

#[tokio::main]
async fn main() {
    env_logger::init();

    let matches = Command::new("amdevice_list")
        .about("List attached devices")
        .arg(
            Arg::new("watch")
                .long("watch")
                .short('w')
                .help("Keep printing devices as they come and go")
                .action(clap::ArgAction::SetTrue),
        )
        .arg(
            Arg::new("about")
                .long("about")
                .help("Show about information")
                .action(clap::ArgAction::SetTrue),
        )
        .get_matches();

    if matches.get_flag("about") {
        println!("amdevice_list - list devices attached to this host");
        println!("Copyright (c) 2025 Jackson Coxson");
        return;
    }

    let discovery = match common::discover().await {
        Ok(d) => d,
        Err(e) => {
            eprintln!("{e}");
            return;
        }
    };
    let watch = matches.get_flag("watch");

    loop {
        let events = discovery
            .check_for_devices(Some(common::DISCOVERY_TIMEOUT))
            .await
            .expect("Unable to check for devices");
        for event in events {
            match event {
                DiscoveryEvent::Found(device) => println!("+ {}", device.identifier()),
                DiscoveryEvent::Lost(id) => println!("- {id}"),
            }
        }
        if !watch {
            break;
        }
    }
    discovery.stop().await.expect("Unable to stop discovery");
}
