//! Command-line surface: a config file path plus the handful of flags that
//! control daemon-level behaviour (logging, foreground/background, the
//! pidfile, privilege drop, and the config-check-only mode).

use clap::Parser;
use std::path::PathBuf;

/// Watches directory subtrees for changes and runs handler programs in
/// response.
#[derive(Parser, Debug, Clone)]
#[command(name = "direvent", version, about, long_about = None)]
pub struct Args {
    /// Configuration file. Defaults to the compiled-in system path.
    pub config: Option<PathBuf>,

    /// Increase debug verbosity. May be given more than once.
    #[arg(short = 'd', action = clap::ArgAction::Count)]
    pub debug: u8,

    /// Log to syslog using the given facility instead of stderr.
    #[arg(short = 'F', value_name = "FACILITY")]
    pub facility: Option<String>,

    /// Remain in the foreground instead of daemonizing.
    #[arg(short = 'f')]
    pub foreground: bool,

    /// Tag syslog output with the given string instead of the program name.
    #[arg(short = 'L', value_name = "TAG")]
    pub tag: Option<String>,

    /// Write the daemon's pid to FILE.
    #[arg(short = 'P', value_name = "FILE")]
    pub pidfile: Option<PathBuf>,

    /// Parse the configuration file and exit: 0 if valid, 1 otherwise.
    #[arg(short = 't')]
    pub check_config: bool,

    /// Run handler processes as USER instead of root.
    #[arg(short = 'u', value_name = "USER")]
    pub user: Option<String>,
}

impl Args {
    pub fn parse_args() -> Self {
        Args::parse()
    }

    /// Verbosity translated into an `env_logger`/`log` filter level. `-d`
    /// once is `debug`, twice or more is `trace`; with no `-d` at all the
    /// daemon logs at `info`.
    pub fn log_level(&self) -> log::LevelFilter {
        match self.debug {
            0 => log::LevelFilter::Info,
            1 => log::LevelFilter::Debug,
            _ => log::LevelFilter::Trace,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn command_is_well_formed() {
        Args::command().debug_assert();
    }

    #[test]
    fn parses_config_path_and_flags() {
        let args = Args::parse_from(["direvent", "-f", "-t", "/etc/direvent.conf"]);
        assert!(args.foreground);
        assert!(args.check_config);
        assert_eq!(args.config, Some(PathBuf::from("/etc/direvent.conf")));
    }

    #[test]
    fn repeated_debug_flag_raises_verbosity() {
        let args = Args::parse_from(["direvent", "-d", "-d"]);
        assert_eq!(args.log_level(), log::LevelFilter::Trace);
    }

    #[test]
    fn no_debug_flag_defaults_to_info() {
        let args = Args::parse_from(["direvent"]);
        assert_eq!(args.log_level(), log::LevelFilter::Info);
    }
}
