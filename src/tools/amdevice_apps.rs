// Jackson Coxson
// Lists, installs, launches and removes applications

use std::path::PathBuf;

use amdevice::{
    application_manager::{ApplicationManager, ApplicationManagerOptions},
    debug_server::RunOptions,
};
use clap::{value_parser, Arg, Command};

mod common;

#[tokio::main]
async fn main() {
    env_logger::init();

    let matches = Command::new("amdevice_apps")
        .about("Manage applications on the device")
        .arg(
            Arg::new("udid")
                .long("udid")
                .value_name("UDID")
                .help("UDID of the device, the first attached device if omitted"),
        )
        .arg(
            Arg::new("ddi")
                .long("ddi")
                .value_name("PATH")
                .value_parser(value_parser!(PathBuf))
                .help("Developer disk image to mount before launching")
                .global(true),
        )
        .subcommand(Command::new("list").about("Lists installed user applications"))
        .subcommand(
            Command::new("install")
                .about("Installs an application package")
                .arg(
                    Arg::new("package")
                        .required(true)
                        .index(1)
                        .value_parser(value_parser!(PathBuf)),
                ),
        )
        .subcommand(
            Command::new("uninstall")
                .about("Removes an application")
                .arg(Arg::new("bundle_id").required(true).index(1)),
        )
        .subcommand(
            Command::new("start")
                .about("Launches an application")
                .arg(Arg::new("bundle_id").required(true).index(1))
                .arg(
                    Arg::new("justlaunch")
                        .long("justlaunch")
                        .help("Detach once the application is running")
                        .action(clap::ArgAction::SetTrue),
                ),
        )
        .subcommand(
            Command::new("stop")
                .about("Kills a running application")
                .arg(Arg::new("bundle_id").required(true).index(1)),
        )
        .get_matches();

    let device = match common::get_device(matches.get_one::<String>("udid")).await {
        Ok(d) => d,
        Err(e) => {
            eprintln!("{e}");
            return;
        }
    };

    let justlaunch = matches
        .subcommand_matches("start")
        .is_some_and(|m| m.get_flag("justlaunch"));
    let apps = ApplicationManager::new(
        device,
        ApplicationManagerOptions {
            developer_disk_image: matches.get_one::<PathBuf>("ddi").cloned(),
            run: RunOptions {
                justlaunch,
                watch: false,
            },
        },
    );

    let res = match matches.subcommand() {
        Some(("list", _)) => apps.applications_live_sync_status().await.map(|list| {
            for app in list {
                let live_sync = if app.is_live_sync_supported {
                    " (LiveSync)"
                } else {
                    ""
                };
                println!("{}{live_sync}", app.application_identifier);
            }
        }),
        Some(("install", sub)) => {
            let package = sub.get_one::<PathBuf>("package").expect("No package passed");
            apps.install_application(package).await
        }
        Some(("uninstall", sub)) => {
            let id = sub.get_one::<String>("bundle_id").expect("No bundle id passed");
            apps.uninstall_application(id).await
        }
        Some(("start", sub)) => {
            let id = sub.get_one::<String>("bundle_id").expect("No bundle id passed");
            match apps.start_application(id).await {
                Ok(()) if !justlaunch => apps
                    .watch_application_output(|text| print!("{text}"))
                    .await
                    .map(|signal| {
                        if let Some(signal) = signal {
                            eprintln!("Application stopped with signal {signal}");
                        }
                    }),
                res => res,
            }
        }
        Some(("stop", sub)) => {
            let id = sub.get_one::<String>("bundle_id").expect("No bundle id passed");
            apps.stop_application(id).await
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
