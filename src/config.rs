use crate::{
    error::TetherError,
    lease::Lease,
    v4::options::{OptionCode, Options},
};
use bytes::Bytes;
use clap::Parser;
use std::{
    collections::BTreeMap,
    fs, io,
    net::Ipv4Addr,
    path::{Path, PathBuf},
    time::Duration,
};

mod file;

pub const DEFAULT_CONFIG_PATH: &str = "/etc/dhclient.conf";
pub const DEFAULT_LEASE_DB_DIR: &str = "/var/db";
pub const RESOLV_TAIL_PATH: &str = "/etc/resolv.conf.tail";

#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
pub struct Args {
    /// Stay in the foreground and log to stderr
    #[arg(short = 'd', conflicts_with = "quiet")]
    pub foreground: bool,

    /// Only log warnings and errors
    #[arg(short = 'q')]
    pub quiet: bool,

    /// Decline leases carrying options with no known name
    #[arg(short = 'u')]
    pub reject_unknown: bool,

    /// Configuration file
    #[arg(short = 'c', default_value = DEFAULT_CONFIG_PATH)]
    pub config: PathBuf,

    /// Comma separated list of option names to ignore in leases
    #[arg(short = 'i')]
    pub ignore: Option<String>,

    /// Lease database
    #[arg(short = 'l')]
    pub lease_db: Option<PathBuf>,

    /// File receiving the offered and effective options of each lease
    #[arg(short = 'L')]
    pub option_db: Option<PathBuf>,

    /// Unprivileged user the network-facing process runs as
    #[arg(long, default_value = "_dhcp")]
    pub user: String,

    /// Directory the network-facing process is confined to
    #[arg(long, default_value = "/var/empty")]
    pub chroot: PathBuf,

    /// The network interface to configure (e.g., 'eth0')
    pub interface: String,
}

impl Args {
    pub fn lease_db_path(&self) -> PathBuf {
        match &self.lease_db {
            Some(path) => path.clone(),
            None => Path::new(DEFAULT_LEASE_DB_DIR).join(format!("dhclient.leases.{}", self.interface)),
        }
    }
}

/// What to do with an option value when a lease is bound.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OptionAction {
    /// Use the value only when the server sent none.
    Default(Bytes),
    /// Always use the value.
    Supersede(Bytes),
    /// Put the value before the server's.
    Prepend(Bytes),
    /// Put the value after the server's.
    Append(Bytes),
}

#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub interface: String,
    pub client_port: u16,
    pub server_port: u16,

    pub link_timeout: Duration,
    pub timeout: Duration,
    pub select_interval: Duration,
    pub reboot_timeout: Duration,
    pub retry_interval: Duration,
    pub backoff_cutoff: Duration,
    pub initial_interval: Duration,

    pub requested_options: Vec<OptionCode>,
    pub required_options: Vec<OptionCode>,
    pub ignored_options: Vec<OptionCode>,
    pub option_actions: BTreeMap<OptionCode, OptionAction>,
    pub send_options: Options,

    pub filename: Option<String>,
    pub server_name: Option<String>,
    pub address: Option<Ipv4Addr>,
    pub next_server: Option<Ipv4Addr>,

    pub reject_list: Vec<Ipv4Addr>,
    pub static_leases: Vec<Lease>,
    pub resolv_tail: Option<String>,
    pub unknown_ok: bool,
}

impl ClientConfig {
    pub fn new(interface: String) -> Self {
        Self {
            interface,
            client_port: crate::v4::framing::CLIENT_PORT,
            server_port: crate::v4::framing::SERVER_PORT,
            link_timeout: Duration::from_secs(10),
            timeout: Duration::from_secs(30),
            select_interval: Duration::ZERO,
            reboot_timeout: Duration::from_secs(1),
            retry_interval: Duration::from_secs(1),
            backoff_cutoff: Duration::from_secs(10),
            initial_interval: Duration::from_secs(1),
            // Classless static routes must be requested before routers.
            requested_options: vec![
                OptionCode::SUBNET_MASK,
                OptionCode::BROADCAST_ADDRESS,
                OptionCode::TIME_OFFSET,
                OptionCode::CLASSLESS_STATIC_ROUTES,
                OptionCode::ROUTERS,
                OptionCode::DOMAIN_NAME,
                OptionCode::DOMAIN_SEARCH,
                OptionCode::DOMAIN_NAME_SERVERS,
                OptionCode::HOST_NAME,
                OptionCode::BOOTFILE_NAME,
                OptionCode::TFTP_SERVER_NAME,
            ],
            required_options: Vec::new(),
            ignored_options: Vec::new(),
            option_actions: BTreeMap::new(),
            send_options: Options::new(),
            filename: None,
            server_name: None,
            address: None,
            next_server: None,
            reject_list: Vec::new(),
            static_leases: Vec::new(),
            resolv_tail: None,
            unknown_ok: true,
        }
    }

    /// Builds the configuration from the command line, the config file
    /// and `/etc/resolv.conf.tail`. A missing config file is not an error.
    pub fn load(args: &Args) -> Result<Self, TetherError> {
        let mut config = Self::new(args.interface.clone());

        match fs::read_to_string(&args.config) {
            Ok(text) => {
                config.apply_file(&text)?;
                tracing::debug!("Read configuration from {}", args.config.display());
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }

        if args.reject_unknown {
            config.unknown_ok = false;
        }
        if let Some(list) = &args.ignore {
            match parse_ignore_list(list) {
                Some(codes) => config.ignored_options = codes,
                None => tracing::warn!("Ignoring invalid -i option list '{}'", list),
            }
        }

        config.resolv_tail = read_resolv_tail(Path::new(RESOLV_TAIL_PATH))?;
        Ok(config)
    }

    /// Layers the statements of a config file over the current values.
    pub fn apply_file(&mut self, text: &str) -> Result<(), TetherError> {
        file::apply(self, text)
    }

    /// Sends `htype 1 + hw` as the client identifier unless one, even an
    /// empty one, was configured explicitly.
    pub fn set_default_client_identifier(&mut self, hw: [u8; 6]) {
        if self.send_options.contains(OptionCode::CLIENT_IDENTIFIER) {
            return;
        }
        let mut id = Vec::with_capacity(hw.len() + 1);
        id.push(crate::v4::message::HTYPE_ETHER);
        id.extend_from_slice(&hw);
        self.send_options.insert(OptionCode::CLIENT_IDENTIFIER, id);
    }

    /// The client identifier sent with every request, if non-empty.
    pub fn client_identifier(&self) -> Option<&Bytes> {
        self.send_options
            .get(OptionCode::CLIENT_IDENTIFIER)
            .filter(|id| !id.is_empty())
    }

    pub fn is_rejected(&self, server: Ipv4Addr) -> bool {
        self.reject_list.contains(&server)
    }

    /// The parameter request list as sent on the wire.
    pub fn parameter_request_list(&self) -> Vec<u8> {
        self.requested_options.iter().map(|code| code.get()).collect()
    }
}

/// Parses a list of option names separated by commas or spaces.
/// Duplicates are dropped; `None` if any name is unknown.
pub fn parse_ignore_list(list: &str) -> Option<Vec<OptionCode>> {
    let mut codes = Vec::new();
    for name in list.split([',', ' ']).filter(|name| !name.is_empty()) {
        let code = OptionCode::from_name(&name.to_ascii_lowercase())?;
        if !codes.contains(&code) {
            codes.push(code);
        }
    }
    Some(codes)
}

fn read_resolv_tail(path: &Path) -> Result<Option<String>, TetherError> {
    match fs::read_to_string(path) {
        Ok(tail) if tail.is_empty() => Ok(None),
        Ok(tail) => Ok(Some(tail)),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = ClientConfig::new("em0".to_string());
        assert_eq!(config.timeout, Duration::from_secs(30));
        assert_eq!(config.backoff_cutoff, Duration::from_secs(10));
        assert_eq!(config.select_interval, Duration::ZERO);
        assert!(config.unknown_ok);
        assert_eq!(
            config.parameter_request_list(),
            vec![1, 28, 2, 121, 3, 15, 119, 6, 12, 67, 66]
        );
    }

    #[test]
    fn test_default_client_identifier() {
        let hw = [0x00, 0x0c, 0x29, 0xa8, 0x92, 0xf4];
        let mut config = ClientConfig::new("em0".to_string());
        config.set_default_client_identifier(hw);
        assert_eq!(
            config.client_identifier().unwrap().as_ref(),
            &[1, 0x00, 0x0c, 0x29, 0xa8, 0x92, 0xf4]
        );

        // An explicitly empty identifier suppresses the default.
        let mut config = ClientConfig::new("em0".to_string());
        config.send_options.insert(OptionCode::CLIENT_IDENTIFIER, Bytes::new());
        config.set_default_client_identifier(hw);
        assert!(config.client_identifier().is_none());
    }

    #[test]
    fn test_ignore_list() {
        assert_eq!(
            parse_ignore_list("routers, domain-name-servers,routers"),
            Some(vec![OptionCode::ROUTERS, OptionCode::DOMAIN_NAME_SERVERS])
        );
        assert_eq!(parse_ignore_list("no-such-option"), None);
    }

    #[test]
    fn test_args_parse() {
        let args = Args::try_parse_from(["tether", "-d", "-u", "-i", "host-name", "em0"]).unwrap();
        assert!(args.foreground);
        assert!(args.reject_unknown);
        assert_eq!(args.interface, "em0");
        assert_eq!(args.lease_db_path(), PathBuf::from("/var/db/dhclient.leases.em0"));
        assert_eq!(args.user, "_dhcp");

        assert!(Args::try_parse_from(["tether", "-d", "-q", "em0"]).is_err());
    }
}
