use clap::Parser;

use std::path::PathBuf;

use super::constants::ENV_CONF_PATH;

const LONG_ABOUT: &str = "\
htraced receives trace spans sent from instrumented processes and stores them \
across a set of sharded key/value stores on the local disks. It exposes a REST \
interface for queries and an optional binary RPC endpoint.

Configuration options normally live in the htraced.conf file; -D options are \
an alternate way of setting them when launching the daemon.";

#[derive(Debug, Parser)]
#[command(name = "htraced")]
#[command(version, about = "Trace span collection and query daemon", long_about = LONG_ABOUT)]
pub struct Cli {
    /// Set configuration key 'k' to value 'v' (-Dk=v), or to true (-Dk)
    #[arg(short = 'D', value_name = "KEY[=VALUE]")]
    pub defines: Vec<String>,

    /// Path to a key=value configuration file
    #[arg(long, short = 'c', env = ENV_CONF_PATH)]
    pub config: Option<PathBuf>,
}

pub fn parse() -> Cli {
    Cli::parse()
}
