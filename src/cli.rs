//! Command-line interface (§6): `octopusmq /path/to/settings.json
//! [--daemon] [--help]`.

use std::path::PathBuf;

use clap::Parser;

#[derive(Parser, Debug)]
#[command(name = "octopusmq")]
#[command(author, version, about = "Multi-protocol message broker with a UDP bridge subsystem", long_about = None)]
pub struct Args {
    /// Path to the JSON settings file.
    pub settings: PathBuf,

    /// Detach and run in the background.
    #[arg(long, default_value_t = false)]
    pub daemon: bool,
}
