//! Command-line surface (§4.11, §6).

use clap::Parser;

#[derive(Debug, Parser)]
#[command(name = "tapnetd", about = "Per-tap DHCP/ND responder for guest interfaces")]
pub struct Args {
    /// Path to the configuration file.
    #[arg(short = 'c', long = "config", default_value = "/etc/tapnetd/tapnetd.conf")]
    pub config: std::path::PathBuf,

    /// Enable debug-level logging.
    #[arg(short = 'd', long = "debug")]
    pub debug: bool,

    /// Stay attached to the controlling terminal instead of daemonizing.
    #[arg(short = 'f', long = "foreground")]
    pub foreground: bool,
}
