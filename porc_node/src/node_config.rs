use std::collections::HashMap;
use std::net::SocketAddr;
use std::num::ParseIntError;
use std::str::FromStr;

use anyhow::{anyhow, Context, Error};
use config::{Config, File as CfgFile, FileFormat as CfgFileFormat};
use serde::{de, Deserialize, Deserializer};
use serde_yaml::Value;
use clap::{Arg, ArgMatches, builder::PossibleValue, Command, ValueEnum, value_parser};
use hex::FromHex;
use porc::core::relay::server::DEFAULT_CONNECTIONS_LIMIT;
use porc::crypto::*;

use crate::keys::load_keys;

/// Config for threading.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Deserialize)]
pub enum Threads {
    /// Detect number of threads automatically by the number of CPU cores.
    Auto,
    /// Exact number of threads.
    N(u16)
}

impl FromStr for Threads {
    type Err = ParseIntError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s == "auto" {
            Ok(Threads::Auto)
        } else {
            u16::from_str(s).map(Threads::N)
        }
    }
}

/// Specifies where to write logs.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Deserialize)]
pub enum LogType {
    Stderr,
    Stdout,
    Syslog,
    None,
}

impl ValueEnum for LogType {
    fn value_variants<'a>() -> &'a [Self] {
        use self::LogType::*;
        &[Stderr, Stdout, Syslog, None]
    }

    fn to_possible_value<'a>(&self) -> Option<PossibleValue> {
        use self::LogType::*;
        Some(match self {
            Stderr => PossibleValue::new("Stderr"),
            Stdout => PossibleValue::new("Stdout"),
            Syslog => PossibleValue::new("Syslog"),
            None => PossibleValue::new("None")
        })
    }
}

fn de_threads<'de, D>(deserializer: D) -> Result<Threads, D::Error> where D: Deserializer<'de> {
    let s = String::deserialize(deserializer)?;

    Threads::from_str(&s)
        .map_err(|e| de::Error::custom(format!("threads: {:?}", e)))
}

/// Config parsed from command line arguments or from a config file.
#[derive(Clone, Debug, Deserialize)]
pub struct NodeConfig {
    /// Port to accept connections on, on all interfaces.
    pub port: u16,
    /// Address every final hop connects its destination to. Circuits ending
    /// here can't carry data when it's not set.
    #[serde(default)]
    pub destination: Option<SocketAddr>,
    /// Maximum number of live transport sessions.
    #[serde(rename = "connections-limit")]
    pub connections_limit: usize,
    /// Relay SecretKey
    #[serde(skip_deserializing)]
    pub sk: Option<SecretKey>,
    /// True if the SecretKey was passed as an argument instead of environment
    /// variable. Necessary to print a warning since the logger backend is not
    /// initialized when we parse arguments.
    #[serde(skip_deserializing)]
    pub sk_passed_as_arg: bool,
    /// Path to the file where relay keys are stored.
    /// Required with config.
    #[serde(rename = "keys-file")]
    pub keys_file: Option<String>,
    /// Number of threads for execution.
    #[serde(deserialize_with = "de_threads")]
    pub threads: Threads,
    /// Specifies where to write logs.
    #[serde(rename = "log-type")]
    pub log_type: LogType,
    /// Unused fields while parsing config file
    #[serde(flatten)]
    pub unused: HashMap<String, Value>,
}

/// What the command line asks for.
pub enum Action {
    /// Run the relay.
    Run(NodeConfig),
    /// Print the relay public key and exit.
    DerivePk(PublicKey),
}

fn create_sk_arg() -> Arg {
    Arg::new("secret-key")
        .short('s')
        .long("secret-key")
        .help("Relay secret key. Note that you should not pass the key via \
               arguments due to security reasons. Use this argument for \
               test purposes only. In the real world use the environment \
               variable instead")
        .num_args(1)
        .conflicts_with("keys-file")
        .env("PORC_SECRET_KEY")
        .hide(true)
}

fn create_keys_file_arg() -> Arg {
    Arg::new("keys-file")
        .short('k')
        .long("keys-file")
        .help("Path to the file where relay keys are stored")
        .num_args(1)
        .conflicts_with("secret-key")
}

fn app() -> Command {
    Command::new(crate_name!())
        .version(crate_version!())
        .about(crate_description!())
        .args_conflicts_with_subcommands(true)
        .subcommand(Command::new("config")
            .arg(Arg::new("cfg-file")
                .index(1)
                .help("Load settings from saved config file. \
                    Config file format is YAML")
                .num_args(1)
                .required(true)))
        .subcommand(Command::new("derive-pk")
            .about("Derive PK from either --keys-file or from env:PORC_SECRET_KEY")
            .arg(create_sk_arg())
            .arg(create_keys_file_arg()
                .required_unless_present("secret-key")))
        // here go args without subcommands
        .arg(Arg::new("port")
            .index(1)
            .help("TCP port to accept connections on")
            .num_args(1)
            .value_parser(value_parser!(u16))
            .required(true))
        .arg(create_sk_arg())
        .arg(create_keys_file_arg())
        .arg(Arg::new("destination")
            .short('d')
            .long("destination")
            .help("Address final hops deliver circuit data to")
            .num_args(1)
            .value_parser(value_parser!(SocketAddr)))
        .arg(Arg::new("connections-limit")
            .short('c')
            .long("connections-limit")
            .help("Maximum number of live connections the relay can hold")
            .num_args(1)
            .value_parser(value_parser!(usize))
            .default_value("512"))
        .arg(Arg::new("threads")
            .short('j')
            .long("threads")
            .help("Number of threads to use. The value 'auto' means that the \
                   number of threads will be determined automatically by the \
                   number of CPU cores")
            .num_args(1)
            .value_parser(value_parser!(Threads))
            .default_value("1"))
        .arg(Arg::new("log-type")
            .short('l')
            .long("log-type")
            .help("Where to write logs")
            .num_args(1)
            .value_parser(value_parser!(LogType))
            .default_value("Stderr"))
}

/// Parse command line arguments.
pub fn cli_parse() -> Result<Action, Error> {
    let matches = app().get_matches();
    action(&matches)
}

fn action(matches: &ArgMatches) -> Result<Action, Error> {
    match matches.subcommand() {
        Some(("derive-pk", m)) => run_derive_pk(m).map(Action::DerivePk),
        Some(("config", m)) => run_config(m).map(Action::Run),
        _ => run_args(matches).map(Action::Run),
    }
}

fn parse_sk(s: &str) -> Result<SecretKey, Error> {
    let sk_bytes: [u8; crypto_box::KEY_SIZE] = FromHex::from_hex(s)
        .map_err(|e| anyhow!("Invalid relay secret key: {}", e))?;
    Ok(SecretKey::from(sk_bytes))
}

/// Parse settings from a saved file.
fn parse_config(config_path: &str) -> Result<NodeConfig, Error> {
    let config_file = Config::builder()
        .set_default("log-type", "Stderr").context("Can't set default value for `log-type`")?
        .set_default("threads", "1").context("Can't set default value for `threads`")?
        .set_default("connections-limit", DEFAULT_CONNECTIONS_LIMIT as u64).context("Can't set default value for `connections-limit`")?
        .add_source(CfgFile::new(config_path, CfgFileFormat::Yaml))
        .build()
        .with_context(|| format!("Can't build config file {}", config_path))?;

    config_file.try_deserialize().context("Can't deserialize config")
}

fn run_derive_pk(matches: &ArgMatches) -> Result<PublicKey, Error> {
    if let Some(s) = matches.get_one::<String>("secret-key") {
        return parse_sk(s).map(|sk| sk.public_key())
    }
    let keys_file = matches.get_one::<String>("keys-file")
        .ok_or_else(|| anyhow!("Neither secret key nor keys file is specified"))?;
    load_keys(keys_file).map(|(pk, _sk)| pk)
}

fn run_config(matches: &ArgMatches) -> Result<NodeConfig, Error> {
    let config_path = matches.get_one::<String>("cfg-file")
        .ok_or_else(|| anyhow!("Config file is not specified"))?;

    parse_config(config_path)
}

fn run_args(matches: &ArgMatches) -> Result<NodeConfig, Error> {
    let port = matches.get_one::<u16>("port").copied()
        .ok_or_else(|| anyhow!("Port is not specified"))?;

    let destination = matches.get_one::<SocketAddr>("destination").copied();

    let connections_limit = matches.get_one::<usize>("connections-limit").copied()
        .unwrap_or(DEFAULT_CONNECTIONS_LIMIT);

    let sk = matches.get_one::<String>("secret-key")
        .map(|s| parse_sk(s))
        .transpose()?;

    // the value source tells a command line value from the environment
    let sk_passed_as_arg = matches.value_source("secret-key") == Some(clap::parser::ValueSource::CommandLine);

    let keys_file = matches.get_one("keys-file").cloned();

    let threads = matches.get_one("threads").copied().unwrap_or(Threads::N(1));

    let log_type = matches.get_one("log-type").copied().unwrap_or(LogType::Stderr);

    Ok(NodeConfig {
        port,
        destination,
        connections_limit,
        sk,
        sk_passed_as_arg,
        keys_file,
        threads,
        log_type,
        unused: HashMap::new(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::fs;
    use std::path::PathBuf;

    const SK: &str = "d5ff9ceafe9e1145bc807dc94b4ee911a5878705b5f9ee68f6ccc51e498f313c";

    fn temp_path(name: &str) -> PathBuf {
        std::env::temp_dir().join(format!("porc-node-{}-{}", std::process::id(), name))
    }

    fn parse(args: &[&str]) -> NodeConfig {
        let matches = app().get_matches_from(args);
        run_args(&matches).unwrap()
    }

    #[test]
    fn args_port_only() {
        let config = parse(&["porc-node", "--keys-file", "./keys", "33445"]);
        assert_eq!(config.port, 33445);
        assert_eq!(config.keys_file.unwrap(), "./keys");
        assert!(config.destination.is_none());
        assert_eq!(config.connections_limit, DEFAULT_CONNECTIONS_LIMIT);
        assert_eq!(config.threads, Threads::N(1));
        assert_eq!(config.log_type, LogType::Stderr);
        assert!(config.sk.is_none());
    }

    #[test]
    fn args_port_required() {
        let matches = app().try_get_matches_from(vec![
            "porc-node",
            "--keys-file",
            "./keys",
        ]);
        assert!(matches.is_err());
    }

    #[test]
    fn args_invalid_port() {
        let matches = app().try_get_matches_from(vec![
            "porc-node",
            "--keys-file",
            "./keys",
            "port",
        ]);
        assert!(matches.is_err());
    }

    #[test]
    fn args_with_secret_key() {
        let config = parse(&["porc-node", "--secret-key", SK, "33445"]);
        assert!(config.sk_passed_as_arg);
        let sk = parse_sk(SK).unwrap();
        assert_eq!(config.sk.unwrap().public_key(), sk.public_key());
    }

    #[test]
    fn args_invalid_secret_key() {
        let matches = app().get_matches_from(vec![
            "porc-node",
            "--secret-key",
            "abcd",
            "33445",
        ]);
        assert!(run_args(&matches).is_err());
    }

    #[test]
    fn args_without_keys() {
        let config = parse(&["porc-node", "33445"]);
        assert_eq!(config.port, 33445);
        assert!(config.keys_file.is_none());
        assert!(config.sk.is_none());
        assert!(!config.sk_passed_as_arg);
    }

    #[test]
    fn args_keys_file_and_secret_key_conflicts() {
        let matches = app().try_get_matches_from(vec![
            "porc-node",
            "--keys-file",
            "./keys",
            "--secret-key",
            SK,
            "33445",
        ]);
        assert!(matches.is_err());
    }

    #[test]
    fn args_destination() {
        let config = parse(&["porc-node", "--keys-file", "./keys", "--destination", "127.0.0.1:8080", "33445"]);
        assert_eq!(config.destination, Some("127.0.0.1:8080".parse().unwrap()));
    }

    #[test]
    fn args_connections_limit() {
        let config = parse(&["porc-node", "--keys-file", "./keys", "--connections-limit", "42", "33445"]);
        assert_eq!(config.connections_limit, 42);
    }

    #[test]
    fn args_threads() {
        let config = parse(&["porc-node", "--keys-file", "./keys", "--threads", "42", "33445"]);
        assert_eq!(config.threads, Threads::N(42));
        let config = parse(&["porc-node", "--keys-file", "./keys", "--threads", "auto", "33445"]);
        assert_eq!(config.threads, Threads::Auto);
    }

    #[test]
    fn args_log_type() {
        let config = parse(&["porc-node", "--keys-file", "./keys", "--log-type", "None", "33445"]);
        assert_eq!(config.log_type, LogType::None);
    }

    #[test]
    fn args_derive_pk_keys_file() {
        let matches = app().get_matches_from(vec![
            "porc-node",
            "derive-pk",
            "--keys-file",
            "./keys",
        ]);
        let matches = matches.subcommand_matches("derive-pk").unwrap();
        assert_eq!("./keys", matches.get_one::<String>("keys-file").unwrap());
    }

    #[test]
    fn args_derive_pk_requires_key() {
        let matches = app().try_get_matches_from(vec![
            "porc-node",
            "derive-pk",
        ]);
        assert!(matches.is_err());
    }

    #[test]
    fn derive_pk_from_secret_key() {
        let matches = app().get_matches_from(vec![
            "porc-node",
            "derive-pk",
            "--secret-key",
            SK,
        ]);
        let pk = match action(&matches).unwrap() {
            Action::DerivePk(pk) => pk,
            Action::Run(_) => panic!("Unexpected action"),
        };
        assert_eq!(pk, parse_sk(SK).unwrap().public_key());
    }

    #[test]
    fn config_file() {
        let path = temp_path("config.yml");
        fs::write(&path, "\
port: 33445
keys-file: ./keys
destination: 127.0.0.1:8080
connections-limit: 42
threads: auto
log-type: Stdout
motd: unknown key
").unwrap();

        let config = parse_config(path.to_str().unwrap()).unwrap();
        fs::remove_file(&path).unwrap();

        assert_eq!(config.port, 33445);
        assert_eq!(config.keys_file.unwrap(), "./keys");
        assert_eq!(config.destination, Some("127.0.0.1:8080".parse().unwrap()));
        assert_eq!(config.connections_limit, 42);
        assert_eq!(config.threads, Threads::Auto);
        assert_eq!(config.log_type, LogType::Stdout);
        assert!(config.unused.contains_key("motd"));
    }

    #[test]
    fn config_file_defaults() {
        let path = temp_path("config-defaults.yml");
        fs::write(&path, "port: 33445\nkeys-file: ./keys\n").unwrap();

        let config = parse_config(path.to_str().unwrap()).unwrap();
        fs::remove_file(&path).unwrap();

        assert!(config.destination.is_none());
        assert_eq!(config.connections_limit, DEFAULT_CONNECTIONS_LIMIT);
        assert_eq!(config.threads, Threads::N(1));
        assert_eq!(config.log_type, LogType::Stderr);
        assert!(config.unused.is_empty());
    }

    #[test]
    fn config_file_without_keys_file() {
        let path = temp_path("config-no-keys.yml");
        fs::write(&path, "port: 33445\n").unwrap();

        let config = parse_config(path.to_str().unwrap()).unwrap();
        fs::remove_file(&path).unwrap();

        assert_eq!(config.port, 33445);
        assert!(config.keys_file.is_none());
    }
}
