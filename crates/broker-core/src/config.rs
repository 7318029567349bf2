//! Process configuration. Grounded on `server/game/core/src/config.rs`'s `GameConfig`
//! shape (a `serde`-derived struct with a `Default` impl matching the documented
//! defaults) and on `gamerunner_config.rs`'s pattern of dumping `Default::default()` as
//! TOML for diagnostics — `brokerd` exposes the same as a `--print-config` flag.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub port: u16,
    pub interfaces: Vec<String>,
    pub maxconns: usize,
    pub peers: Vec<String>,
    pub daemonize: bool,
    pub user: Option<String>,
    pub pidfile: Option<String>,
    pub verbosity: u64,
    /// Not persisted: a CLI-only flag asking `brokerd` to dump this struct as TOML and
    /// exit instead of binding.
    #[serde(skip)]
    pub print_config: bool,
}

impl Config {
    pub const DEFAULT_PORT: u16 = 13700;
    pub const DEFAULT_MAXCONNS: usize = 1024;
    pub const DEFAULT_INTERFACE: &'static str = "0.0.0.0";

    /// File descriptors the process should be able to open: two per connection (one for
    /// the socket, held across accept and close) plus three for stdio/listener.
    pub fn rlimit_nofile(&self) -> u64 {
        (2 * self.maxconns + 3) as u64
    }

    /// Resolves `-l` (repeatable; defaults to "all interfaces") into the concrete
    /// addresses `Server::bind` should listen on, one listener per `-l` occurrence.
    pub fn listen_addrs(&self) -> Vec<std::net::SocketAddr> {
        let interfaces: Vec<&str> = if self.interfaces.is_empty() {
            vec![Self::DEFAULT_INTERFACE]
        } else {
            self.interfaces.iter().map(String::as_str).collect()
        };

        let resolved: Vec<std::net::SocketAddr> = interfaces
            .into_iter()
            .filter_map(|iface| format!("{}:{}", iface, self.port).parse().ok())
            .collect();

        if resolved.is_empty() {
            // Every `-l` value failed to parse; fall back to listening everywhere
            // rather than silently starting a broker with no listeners at all.
            vec![format!("{}:{}", Self::DEFAULT_INTERFACE, self.port).parse().expect("valid address")]
        } else {
            resolved
        }
    }
}

impl Default for Config {
    fn default() -> Config {
        Config {
            port: Self::DEFAULT_PORT,
            interfaces: Vec::new(),
            maxconns: Self::DEFAULT_MAXCONNS,
            peers: Vec::new(),
            daemonize: false,
            user: None,
            pidfile: None,
            verbosity: 0,
            print_config: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_port_matches_wire_spec() {
        assert_eq!(Config::default().port, 13700);
    }

    #[test]
    fn rlimit_formula_matches_two_times_maxconns_plus_three() {
        let config = Config { maxconns: 1024, ..Config::default() };
        assert_eq!(config.rlimit_nofile(), 2 * 1024 + 3);
    }

    #[test]
    fn default_round_trips_through_toml() {
        let toml = serdeconv::to_toml_string(&Config::default()).unwrap();
        let parsed: Config = serdeconv::from_toml_str(&toml).unwrap();
        assert_eq!(parsed.port, Config::default().port);
    }

    #[test]
    fn no_interfaces_listens_on_all() {
        let config = Config { port: 9999, ..Config::default() };
        assert_eq!(config.listen_addrs(), vec!["0.0.0.0:9999".parse().unwrap()]);
    }

    #[test]
    fn repeated_interfaces_yield_one_listener_each() {
        let config = Config {
            port: 9999,
            interfaces: vec!["127.0.0.1".to_string(), "10.0.0.5".to_string()],
            ..Config::default()
        };
        assert_eq!(
            config.listen_addrs(),
            vec!["127.0.0.1:9999".parse().unwrap(), "10.0.0.5:9999".parse().unwrap()]
        );
    }
}
