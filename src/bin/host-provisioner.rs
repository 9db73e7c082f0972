use std::process::ExitCode;

use host_provisioner::report::EXIT_FATAL;
use host_provisioner::{Config, Installer};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

fn usage() -> String {
    format!(
        "{name} {version}\n\n\
         Installs the service binary, registers it with systemd and provisions\n\
         NVIDIA drivers when a GPU is present.\n\n\
         Usage:\n  {name}\n\n\
         Configuration is read from ${env} or {path} when present.\n\
         Set RUST_LOG to change log verbosity.",
        name = env!("CARGO_PKG_NAME"),
        version = env!("CARGO_PKG_VERSION"),
        env = host_provisioner::config::CONFIG_ENV,
        path = host_provisioner::config::DEFAULT_CONFIG_PATH,
    )
}

fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(std::io::stderr)
                .with_target(false),
        )
        .init();
}

fn main() -> ExitCode {
    let args: Vec<String> = std::env::args().skip(1).collect();
    match args.as_slice() {
        [] => {}
        [flag] if flag == "--help" || flag == "-h" => {
            println!("{}", usage());
            return ExitCode::SUCCESS;
        }
        [flag] if flag == "--version" || flag == "-V" => {
            println!("{} {}", env!("CARGO_PKG_NAME"), env!("CARGO_PKG_VERSION"));
            return ExitCode::SUCCESS;
        }
        _ => {
            eprintln!("{}", usage());
            return ExitCode::from(EXIT_FATAL);
        }
    }

    init_tracing();

    let installer = match Config::load().and_then(Installer::new) {
        Ok(installer) => installer,
        Err(e) => {
            tracing::error!("{:#}", e);
            return ExitCode::from(EXIT_FATAL);
        }
    };

    match installer.run() {
        Ok(report) => ExitCode::from(report.exit_code),
        Err(e) => {
            tracing::error!("{}", e);
            ExitCode::from(EXIT_FATAL)
        }
    }
}
