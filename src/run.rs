//! Wires the CLI, the configuration reader, the dispatcher and the process
//! manager together into the daemon's actual main loop.

use crate::backend;
use crate::cli::Args;
use crate::config::{ConfigParser, WatcherConfig};
use crate::daemon;
use crate::dispatch::Dispatcher;
use crate::error::{ConfigError, Error, Result};
use crate::event::EventMask;
use crate::handler::{Credentials, Handler, HandlerFlags};
use crate::process::ProcessManager;
use crate::signal;
use std::path::{Path, PathBuf};
use std::rc::Rc;
use std::time::Duration;

/// Where the daemon looks for its configuration when none is given on the
/// command line.
pub const DEFAULT_CONFIG_FILE: &str = "/etc/direvent.conf";

/// How long a single blocking poll may run before returning control to the
/// main loop to re-check timeouts and pending signals, even with nothing to
/// report. Stands in for the original SIGALRM-driven tick now that handler
/// deadlines are tracked as plain `Instant`s.
const POLL_SLICE: Duration = Duration::from_secs(1);

fn init_logger(level: log::LevelFilter) {
    env_logger::Builder::new()
        .filter_level(level)
        .format_timestamp_millis()
        .init();
}

/// Turns one parsed `watcher { ... }` block into the handler(s) and watch
/// roots the dispatcher needs, resolving event names and patterns against
/// the active backend's taxonomy and collecting every mistake rather than
/// stopping at the first.
fn build_handler(
    config_path: &Path,
    block: &WatcherConfig,
    taxonomy: &crate::event::EventTaxonomy,
    errors: &mut Vec<ConfigError>,
) -> Option<Rc<Handler>> {
    let mut builder = Handler::builder();

    let mut mask = EventMask::default();
    for name in &block.events {
        match taxonomy.name_to_mask(name) {
            Ok(m) => {
                mask.generic = mask.generic.union(m.generic);
                mask.backend |= m.backend;
            }
            Err(e) => errors.push(ConfigError::new(config_path, 0, e.to_string())),
        }
    }
    builder.mask(mask);

    for pattern in &block.files {
        if let Err(e) = builder.add_pattern(pattern) {
            errors.push(ConfigError::new(config_path, 0, e.to_string()));
        }
    }

    let Some(command) = block.command.clone() else {
        errors.push(ConfigError::new(config_path, 0, "watcher block has no command"));
        return None;
    };
    builder.command(command);

    if let Some(timeout) = block.timeout {
        if timeout == 0 {
            errors.push(ConfigError::new(config_path, 0, "timeout must be greater than zero"));
        } else {
            builder.timeout(timeout);
        }
    }

    let mut flags = HandlerFlags::empty();
    for option in &block.options {
        match option.as_str() {
            "nowait" => flags |= HandlerFlags::NOWAIT,
            "stdout" => flags |= HandlerFlags::STDOUT,
            "stderr" => flags |= HandlerFlags::STDERR,
            "shell" => flags |= HandlerFlags::SHELL,
            "wait" => {} // the default; named explicitly for readability
            other => errors.push(ConfigError::new(config_path, 0, format!("unknown option: {other}"))),
        }
    }
    builder.flags(flags);
    builder.environ(block.environ.clone());

    if let Some(user) = &block.user {
        match daemon::resolve_credentials(user) {
            Ok((uid, gids)) => {
                builder.credentials(Credentials { uid, gids });
            }
            Err(e) => errors.push(ConfigError::new(config_path, 0, e.to_string())),
        }
    }

    match builder.finalize() {
        Ok(handler) => Some(handler),
        Err(message) => {
            errors.push(ConfigError::new(config_path, 0, message));
            None
        }
    }
}

/// Parses `config_path` and installs every watcher block's roots and
/// handlers into a fresh [`Dispatcher`]. Collects every configuration
/// mistake across the whole file before returning, per the "report
/// everything, then fail" policy.
pub fn build_dispatcher(config_path: &Path) -> Result<Dispatcher> {
    let blocks = ConfigParser::parse_file(config_path).map_err(Error::Config)?;

    let backend = backend::open()?;
    let mut dispatcher = Dispatcher::new(backend);
    let mut errors = Vec::new();

    for block in &blocks {
        let handler = {
            let taxonomy = dispatcher.taxonomy();
            build_handler(config_path, block, taxonomy, &mut errors)
        };
        let Some(handler) = handler else { continue };

        if block.paths.is_empty() {
            errors.push(ConfigError::new(config_path, 0, "watcher block has no path"));
            continue;
        }

        for spec in &block.paths {
            if let Err(e) = dispatcher.watch_root(PathBuf::from(&spec.path), spec.depth, vec![handler.clone()]) {
                warn!("skipping {:?}: {}", spec.path, e);
            }
        }
    }

    if !errors.is_empty() {
        return Err(Error::Config(errors));
    }

    Ok(dispatcher)
}

/// Entry point called from `main`. Handles `-t` (parse, don't run),
/// daemonization, the pidfile, privilege drop, and the blocking event loop.
pub fn run(args: Args) -> Result<()> {
    init_logger(args.log_level());

    let config_path = args
        .config
        .clone()
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_FILE));

    if args.check_config {
        return match build_dispatcher(&config_path) {
            Ok(_) => Ok(()),
            Err(e) => Err(e),
        };
    }

    let mut dispatcher = build_dispatcher(&config_path)?;

    if !args.foreground {
        daemon::daemonize()?;
    }

    if let Some(pidfile) = &args.pidfile {
        daemon::write_pidfile(pidfile)?;
    }

    if let Some(user) = &args.user {
        daemon::drop_privileges(user).map_err(|e| Error::Protocol(e.to_string()))?;
    }

    signal::install().map_err(|e| Error::Protocol(format!("sigaction failed: {e}")))?;

    info!("direvent started, watching {} root(s)", dispatcher.registry().len());

    let mut processes = ProcessManager::new();
    let result = main_loop(&mut dispatcher, &mut processes);

    if let Some(pidfile) = &args.pidfile {
        daemon::remove_pidfile(pidfile);
    }

    info!("direvent stopped");
    result
}

fn main_loop(dispatcher: &mut Dispatcher, processes: &mut ProcessManager) -> Result<()> {
    let mut protocol_retries = 0u8;

    loop {
        match dispatcher.poll_once(Some(POLL_SLICE)) {
            Ok(invocations) => {
                protocol_retries = 0;
                for invocation in invocations {
                    if let Err(e) = processes.spawn(&invocation) {
                        warn!("failed to spawn handler {:?}: {}", invocation.handler.command, e);
                    }
                }
            }
            Err(e) => {
                if protocol_retries == 0 {
                    warn!("protocol error polling backend, retrying once: {e}");
                    protocol_retries += 1;
                } else {
                    return Err(Error::Protocol(e.to_string()));
                }
            }
        }

        processes.scan_timeouts();
        processes.reap_children();

        if let Some(signal) = signal::take_pending() {
            if signal::is_terminating(signal) {
                debug!("terminating signal {:?} received", signal);
                return Ok(());
            }
            if signal::is_reload(signal) {
                info!("SIGHUP received; reload is not yet wired into the running dispatcher");
            }
            if signal::is_reserved(signal) {
                info!("received reserved signal {:?}", signal);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn check_config_mode_reports_errors_for_a_broken_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("direvent.conf");
        std::fs::write(&path, "watcher { bogus 1; }").unwrap();

        let err = build_dispatcher(&path).unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn a_minimal_valid_config_builds_a_dispatcher() {
        let watched = tempfile::tempdir().unwrap();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("direvent.conf");
        std::fs::write(
            &path,
            format!(
                r#"watcher {{ path "{}"; event write; command "true"; }}"#,
                watched.path().display()
            ),
        )
        .unwrap();

        let dispatcher = build_dispatcher(&path).unwrap();
        assert_eq!(dispatcher.registry().len(), 1);
    }

    #[test]
    fn zero_timeout_is_a_configuration_error() {
        let watched = tempfile::tempdir().unwrap();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("direvent.conf");
        std::fs::write(
            &path,
            format!(
                r#"watcher {{ path "{}"; event write; command "true"; timeout 0; }}"#,
                watched.path().display()
            ),
        )
        .unwrap();

        let err = build_dispatcher(&path).unwrap_err();
        let Error::Config(errors) = err else {
            panic!("expected a configuration error");
        };
        assert!(errors.iter().any(|e| e.message.contains("timeout")));
    }
}
