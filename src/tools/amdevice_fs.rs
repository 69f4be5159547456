// Jackson Coxson
// Browse, pull, push and remove device files

use std::path::PathBuf;

use amdevice::file_system::DeviceFileSystem;
use clap::{value_parser, Arg, Command};

mod common;

#[tokio::main]
async fn main() {
    env_logger::init();

    let matches = Command::new("amdevice_fs")
        .about("Manage files on the device")
        .arg(
            Arg::new("udid")
                .long("udid")
                .value_name("UDID")
                .help("UDID of the device, the first attached device if omitted"),
        )
        .arg(
            Arg::new("app")
                .long("app")
                .value_name("BUNDLE_ID")
                .help("Work inside this application's container")
                .global(true),
        )
        .subcommand(
            Command::new("ls")
                .about("Lists a directory tree")
                .arg(Arg::new("path").index(1)),
        )
        .subcommand(
            Command::new("pull")
                .about("Downloads a file, to stdout when no destination is given")
                .arg(Arg::new("path").required(true).index(1))
                .arg(
                    Arg::new("save")
                        .index(2)
                        .value_parser(value_parser!(PathBuf)),
                ),
        )
        .subcommand(
            Command::new("push")
                .about("Uploads a file")
                .arg(
                    Arg::new("file")
                        .required(true)
                        .index(1)
                        .value_parser(value_parser!(PathBuf)),
                )
                .arg(Arg::new("path").required(true).index(2)),
        )
        .subcommand(
            Command::new("rm")
                .about("Removes a file from the application's sandbox")
                .arg(Arg::new("path").required(true).index(1)),
        )
        .get_matches();

    let device = match common::get_device(matches.get_one::<String>("udid")).await {
        Ok(d) => d,
        Err(e) => {
            eprintln!("{e}");
            return;
        }
    };
    let app = matches.get_one::<String>("app").cloned();
    let fs = DeviceFileSystem::new(device, app.clone());

    let res = match matches.subcommand() {
        Some(("ls", sub)) => fs
            .list_files(sub.get_one::<String>("path").map(String::as_str))
            .await
            .map(|paths| paths.iter().for_each(|p| println!("{p}"))),
        Some(("pull", sub)) => {
            let path = sub.get_one::<String>("path").expect("No path passed");
            let save = sub.get_one::<PathBuf>("save");
            fs.get_file(path, save.map(PathBuf::as_path)).await.map(|_| ())
        }
        Some(("push", sub)) => {
            let file = sub.get_one::<PathBuf>("file").expect("No file passed");
            let path = sub.get_one::<String>("path").expect("No path passed");
            fs.put_file(file, path).await
        }
        Some(("rm", sub)) => {
            let Some(app) = app else {
                eprintln!("rm needs --app");
                return;
            };
            let path = sub.get_one::<String>("path").expect("No path passed");
            fs.delete_file(path, &app).await
        }
        _ => {
            eprintln!("Invalid usage, pass -h for help");
            return;
        }
    };

    if let Err(e) = res {
        eprintln!("{e}");
    }
}
