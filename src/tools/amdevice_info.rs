// Jackson Coxson
// Prints device properties

use clap::{Arg, Command};

mod common;

#[tokio::main]
async fn main() {
    env_logger::init();

    let matches = Command::new("amdevice_info")
        .about("Get information from the device")
        .arg(
            Arg::new("udid")
                .long("udid")
                .value_name("UDID")
                .help("UDID of the device, the first attached device if omitted"),
        )
        .arg(
            Arg::new("key")
                .long("key")
                .short('k')
                .value_name("KEY")
                .help("Print a single lockdown value such as ProductVersion"),
        )
        .arg(
            Arg::new("about")
                .long("about")
                .help("Show about information")
                .action(clap::ArgAction::SetTrue),
        )
        .get_matches();

    if matches.get_flag("about") {
        println!("amdevice_info - get information from the device");
        println!("Copyright (c) 2025 Jackson Coxson");
        return;
    }

    let device = match common::get_device(matches.get_one::<String>("udid")).await {
        Ok(d) => d,
        Err(e) => {
            eprintln!("{e}");
            return;
        }
    };

    match matches.get_one::<String>("key") {
        Some(key) => match device.get_value(key).await {
            Ok(Some(value)) => println!("{value:#?}"),
            Ok(None) => eprintln!("{key} is not set"),
            Err(e) => eprintln!("Unable to read {key}: {e}"),
        },
        None => match device.device_info().await {
            Ok(info) => println!("{info:#?}"),
            Err(e) => eprintln!("Unable to read device info: {e}"),
        },
    }
}
