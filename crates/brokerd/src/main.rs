mod cli;

use broker_core::Broker;
use daemonize::Daemonize;
use signal_hook::consts::signal::{SIGHUP, SIGINT, SIGPIPE, SIGTERM};
use signal_hook::flag;
use std::process;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

/// How long a single event-loop tick sleeps between iterations. Coarse on purpose: the
/// broker's own readiness polling inside `Server::sync` is non-blocking, so this just
/// bounds how often an idle loop wakes up to check signals and timeouts.
const TICK_SLEEP: Duration = Duration::from_millis(10);

fn main() {
    let config = cli::parse();

    if config.print_config {
        match serdeconv::to_toml_string(&config) {
            Ok(toml) => print!("{}", toml),
            Err(err) => {
                eprintln!("failed to render config: {}", err);
                process::exit(1);
            }
        }
        return;
    }

    let logger = broker_support::logging::init(config.verbosity);

    if let Err(err) = rlimit::setrlimit(rlimit::Resource::NOFILE, config.rlimit_nofile(), config.rlimit_nofile()) {
        slog::warn!(logger, "failed to raise fd limit"; "error" => %err);
    }

    if config.daemonize {
        let mut daemon = Daemonize::new();
        if let Some(pidfile) = &config.pidfile {
            daemon = daemon.pid_file(pidfile);
        }
        if let Some(user) = &config.user {
            daemon = daemon.user(user.as_str());
        }
        if let Err(err) = daemon.start() {
            slog::error!(logger, "failed to daemonize"; "error" => %err);
            process::exit(1);
        }
    } else if let Some(pidfile) = &config.pidfile {
        if let Err(err) = std::fs::write(pidfile, format!("{}\n", process::id())) {
            slog::warn!(logger, "failed to write pid file"; "error" => %err);
        }
    }

    // A consumer that disconnects mid-write would otherwise raise SIGPIPE and kill the
    // whole process on the next send to that socket; ignore it and let the write return
    // EPIPE instead, which `Connection::send` already turns into a fatal per-connection error.
    if let Err(err) = unsafe { signal_hook::low_level::register(SIGPIPE, || {}) } {
        slog::error!(logger, "failed to ignore SIGPIPE"; "error" => %err);
        process::exit(1);
    }

    let shutdown_flag = Arc::new(AtomicBool::new(false));
    let reload_flag = Arc::new(AtomicBool::new(false));

    for result in [
        flag::register(SIGINT, Arc::clone(&shutdown_flag)),
        flag::register(SIGTERM, Arc::clone(&shutdown_flag)),
        flag::register(SIGHUP, Arc::clone(&reload_flag)),
    ] {
        if let Err(err) = result {
            slog::error!(logger, "failed to install signal handler"; "error" => %err);
            process::exit(1);
        }
    }

    let mut broker = match Broker::bind(&config, logger.clone()) {
        Ok(broker) => broker,
        Err(err) => {
            slog::error!(logger, "failed to bind"; "error" => %err);
            process::exit(1);
        }
    };

    slog::info!(logger, "brokerd started"; "pid" => process::id());

    loop {
        if shutdown_flag.swap(false, Ordering::Relaxed) {
            broker.begin_shutdown(Instant::now());
        }
        if reload_flag.swap(false, Ordering::Relaxed) {
            broker.handle_sighup();
        }

        if !broker.tick(Instant::now()) {
            break;
        }

        thread::sleep(TICK_SLEEP);
    }

    if let Some(pidfile) = &config.pidfile {
        let _ = std::fs::remove_file(pidfile);
    }

    slog::info!(logger, "brokerd stopped");
}
