//! Argument parsing. Grounded on `authenticator/src/main.rs`'s `clap::{App, Arg}`
//! builder usage, generalized from two required positional paths to the broker's full
//! flag surface.

use broker_core::Config;
use clap::{App, Arg};

pub fn parse() -> Config {
    let matches = App::new("brokerd")
        .version("1.0")
        .author("Bush Hammer Industries")
        .about("Runs the message broker daemon.")
        .arg(
            Arg::with_name("port")
                .short("p")
                .long("port")
                .takes_value(true)
                .help("Listen port"),
        )
        .arg(
            Arg::with_name("interface")
                .short("l")
                .long("listen")
                .takes_value(true)
                .multiple(true)
                .number_of_values(1)
                .help("Listen interface (may repeat; default all)"),
        )
        .arg(
            Arg::with_name("maxconns")
                .short("c")
                .long("maxconns")
                .takes_value(true)
                .help("Max concurrent connections"),
        )
        .arg(
            Arg::with_name("peer")
                .short("S")
                .long("peer")
                .takes_value(true)
                .multiple(true)
                .number_of_values(1)
                .help("Peer broker to federate with, host:port (may repeat)"),
        )
        .arg(
            Arg::with_name("daemonize")
                .short("d")
                .long("daemonize")
                .help("Daemonize after startup"),
        )
        .arg(
            Arg::with_name("user")
                .short("u")
                .long("user")
                .takes_value(true)
                .help("Drop privileges to this user after binding"),
        )
        .arg(
            Arg::with_name("pidfile")
                .short("P")
                .long("pidfile")
                .takes_value(true)
                .help("Write the daemon's pid to this file"),
        )
        .arg(
            Arg::with_name("verbose")
                .short("v")
                .long("verbose")
                .multiple(true)
                .help("Increase log verbosity (repeatable)"),
        )
        .arg(
            Arg::with_name("print-config")
                .long("print-config")
                .help("Print the resolved configuration as TOML and exit, without binding"),
        )
        .get_matches();

    let mut config = Config::default();

    if let Some(port) = matches.value_of("port") {
        config.port = port.parse().unwrap_or(Config::DEFAULT_PORT);
    }
    if let Some(interfaces) = matches.values_of("interface") {
        config.interfaces = interfaces.map(String::from).collect();
    }
    if let Some(maxconns) = matches.value_of("maxconns") {
        config.maxconns = maxconns.parse().unwrap_or(Config::DEFAULT_MAXCONNS);
    }
    if let Some(peers) = matches.values_of("peer") {
        config.peers = peers.map(String::from).collect();
    }
    config.daemonize = matches.is_present("daemonize");
    config.user = matches.value_of("user").map(String::from);
    config.pidfile = matches.value_of("pidfile").map(String::from);
    config.verbosity = matches.occurrences_of("verbose");
    config.print_config = matches.is_present("print-config");

    config
}
