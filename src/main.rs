use clap::Parser as _;
use tracing_subscriber::{layer::SubscriberExt as _, util::SubscriberInitExt as _};
use vitolink::commands;

#[derive(clap::Parser)]
#[clap(version, about, author)]
enum Commands {
    Events(commands::events::Args),
    Read(commands::read::Args),
    Write(commands::write::Args),
    Raw(commands::raw::Args),
}

fn end<E: std::error::Error>(r: Result<(), E>) {
    std::process::exit(match r {
        Ok(_) => 0,
        Err(e) => {
            eprintln!("error: {e}");
            let mut cause = e.source();
            while let Some(e) = cause {
                eprintln!("  because: {e}");
                cause = e.source();
            }
            1
        }
    });
}

fn main() {
    let filter = std::env::var("VITOLINK_LOG")
        .unwrap_or_default()
        .parse::<tracing_subscriber::filter::targets::Targets>()
        .unwrap_or_default();
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(filter)
        .init();
    match Commands::parse() {
        Commands::Events(args) => end(commands::events::run(args)),
        Commands::Read(args) => end(commands::read::run(args)),
        Commands::Write(args) => end(commands::write::run(args)),
        Commands::Raw(args) => end(commands::raw::run(args)),
    }
}
