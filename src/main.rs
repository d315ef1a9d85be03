//! redis-ippool-tool - management CLI for Redis-backed IP lease pools.
//!
//! Pool management actions (`-a`/`-d`/`-r`/`-s`) accumulate in command
//! line order and run serially against the named pool; `-p` adjusts the
//! allocation prefix of the most recently added action. Exit codes:
//! 0 on success, 1 on runtime failure, 64 on usage errors.

use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Arg, ArgAction, value_parser};
use tracing::error;

use redis_ippool_tool::config::Settings;
use redis_ippool_tool::{Action, NodePool, NodePoolConfig, Operation, run_operations};

/// BSD sysexits code for command line usage errors.
const EX_USAGE: i32 = 64;

const DEFAULT_PORT: u16 = 6379;

fn cli() -> clap::Command {
    clap::Command::new("redis-ippool-tool")
        .about("Redis IP pool management tool")
        .disable_version_flag(true)
        .after_help(
            "<prefix> is range \"127.0.0.1-127.0.0.254\" or CIDR network \"127.0.0.1/24\" \
             or host \"127.0.0.1\"\n\
             CIDR host bits set start address, e.g. 127.0.0.200/24 -> 127.0.0.200-127.0.0.254\n\
             CIDR /32 or /128 excludes upper broadcast address",
        )
        .arg(
            Arg::new("add")
                .short('a')
                .value_name("prefix")
                .action(ArgAction::Append)
                .help("Add addresses/prefixes to the pool"),
        )
        .arg(
            Arg::new("delete")
                .short('d')
                .value_name("prefix")
                .action(ArgAction::Append)
                .help("Delete addresses/prefixes in this range"),
        )
        .arg(
            Arg::new("release")
                .short('r')
                .value_name("prefix")
                .action(ArgAction::Append)
                .help("Release addresses/prefixes in this range"),
        )
        .arg(
            Arg::new("show")
                .short('s')
                .value_name("prefix")
                .action(ArgAction::Append)
                .help("Show addresses/prefixes in this range"),
        )
        .arg(
            Arg::new("prefix")
                .short('p')
                .value_name("prefix_len")
                .action(ArgAction::Append)
                .value_parser(value_parser!(u8))
                .help(
                    "Length of prefix to allocate (defaults to 32/128). Used primarily \
                     for IPv6 where a prefix is allocated to an intermediary router, \
                     which in turn allocates sub-prefixes to the devices it serves",
                ),
        )
        .arg(
            Arg::new("import")
                .short('i')
                .value_name("file")
                .help("Import entries from ISC lease file [NYI]"),
        )
        .arg(
            Arg::new("export")
                .short('I')
                .action(ArgAction::SetTrue)
                .help("Output active entries in ISC lease file format [NYI]"),
        )
        .arg(
            Arg::new("stats")
                .short('S')
                .action(ArgAction::SetTrue)
                .help("Print pool statistics [NYI]"),
        )
        .arg(
            Arg::new("option")
                .short('o')
                .value_name("attr=value")
                .action(ArgAction::Append)
                .help("Set a backend-specific option [NYI]"),
        )
        .arg(
            Arg::new("file")
                .short('f')
                .value_name("file")
                .value_parser(value_parser!(PathBuf))
                .help("Load options from a settings file"),
        )
        .arg(
            Arg::new("verbose")
                .short('x')
                .action(ArgAction::Count)
                .help("Increase the verbosity level"),
        )
        .arg(Arg::new("server").value_name("server[:port]").required(true))
        .arg(Arg::new("pool").value_name("pool").required(true))
        .arg(Arg::new("range").value_name("range"))
}

fn init_tracing(verbosity: u8) {
    let default_level = match verbosity {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

/// Split `host`, `host:port`, or `[v6]:port`. A bare IPv6 literal (more
/// than one colon, no brackets) is a host without a port.
fn parse_server(text: &str) -> Result<(String, u16), String> {
    let bad_port = |p: &str| format!("invalid port in server argument: {p}");

    if let Some(rest) = text.strip_prefix('[') {
        let (host, tail) = rest
            .split_once(']')
            .ok_or_else(|| format!("unterminated '[' in server argument: {text}"))?;
        let port = match tail.strip_prefix(':') {
            Some(port_text) => port_text.parse().map_err(|_| bad_port(port_text))?,
            None if tail.is_empty() => DEFAULT_PORT,
            None => return Err(format!("trailing junk in server argument: {text}")),
        };
        return Ok((host.to_string(), port));
    }

    match text.match_indices(':').count() {
        0 => Ok((text.to_string(), DEFAULT_PORT)),
        1 => {
            let (host, port_text) = text.split_once(':').unwrap_or((text, ""));
            let port = port_text.parse().map_err(|_| bad_port(port_text))?;
            Ok((host.to_string(), port))
        }
        _ => Ok((text.to_string(), DEFAULT_PORT)),
    }
}

struct PendingOp {
    index: usize,
    action: Action,
    text: String,
    prefix: u8,
}

/// Recover the interleaved action list from the parsed matches. clap
/// groups repeated options by id; the argument indices restore the
/// command line order, which is the order operations must run in.
fn collect_operations(matches: &clap::ArgMatches) -> Result<Vec<PendingOp>, String> {
    let mut pending: Vec<PendingOp> = Vec::new();
    for (id, action) in [
        ("add", Action::Add),
        ("delete", Action::Remove),
        ("release", Action::Release),
        ("show", Action::Show),
    ] {
        if let Some(values) = matches.get_many::<String>(id) {
            let indices = matches.indices_of(id).expect("indices follow values");
            for (text, index) in values.zip(indices) {
                pending.push(PendingOp {
                    index,
                    action,
                    text: text.clone(),
                    prefix: 0,
                });
            }
        }
    }
    pending.sort_by_key(|op| op.index);

    if let Some(values) = matches.get_many::<u8>("prefix") {
        let indices = matches.indices_of("prefix").expect("indices follow values");
        for (value, index) in values.zip(indices) {
            let target = pending.iter_mut().take_while(|op| op.index < index).last();
            match target {
                Some(op) => op.prefix = *value,
                None => {
                    return Err(
                        "Prefix may only be specified after a pool management action".to_string(),
                    );
                }
            }
        }
    }

    Ok(pending)
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> ExitCode {
    let matches = match cli().try_get_matches() {
        Ok(matches) => matches,
        Err(error)
            if matches!(
                error.kind(),
                clap::error::ErrorKind::DisplayHelp | clap::error::ErrorKind::DisplayVersion
            ) =>
        {
            let _ = error.print();
            return ExitCode::SUCCESS;
        }
        Err(error) => {
            let _ = error.print();
            std::process::exit(EX_USAGE);
        }
    };

    init_tracing(matches.get_count("verbose"));

    let pending = match collect_operations(&matches) {
        Ok(pending) => pending,
        Err(message) => {
            error!("{message}");
            std::process::exit(EX_USAGE);
        }
    };

    if pending.is_empty() {
        error!("Nothing to do!");
        return ExitCode::FAILURE;
    }

    let settings = match matches.get_one::<PathBuf>("file") {
        Some(path) => match Settings::from_file(path) {
            Ok(settings) => settings,
            Err(error) => {
                error!("{error}");
                return ExitCode::FAILURE;
            }
        },
        None => Settings::default(),
    };

    let server_arg = matches
        .get_one::<String>("server")
        .expect("required argument");
    let (host, port) = match parse_server(server_arg) {
        Ok(server) => server,
        Err(message) => {
            error!("{message}");
            std::process::exit(EX_USAGE);
        }
    };

    let pool = matches
        .get_one::<String>("pool")
        .expect("required argument")
        .as_bytes()
        .to_vec();
    let range_id = matches
        .get_one::<String>("range")
        .map(|text| text.as_bytes().to_vec());

    // Parse every range before touching the server so a typo in the
    // third operation cannot leave the first two half-applied.
    let mut operations = Vec::with_capacity(pending.len());
    for op in &pending {
        match Operation::parse(op.action, &op.text, pool.clone(), range_id.clone(), op.prefix) {
            Ok(operation) => operations.push(operation),
            Err(error) => {
                error!("Failed parsing \"{}\": {error}", op.text);
                return ExitCode::FAILURE;
            }
        }
    }

    let mut pool_config = NodePoolConfig::new(host, port);
    pool_config.password = settings.password.clone();
    pool_config.connect_timeout = settings.connect_timeout();
    pool_config.command_timeout = settings.command_timeout();

    let mut cluster = match NodePool::connect(pool_config).await {
        Ok(cluster) => cluster,
        Err(error) => {
            error!("Failed connecting: {error}");
            return ExitCode::FAILURE;
        }
    };

    if let Err(error) = run_operations(&mut cluster, &operations).await {
        error!("{error}");
        return ExitCode::FAILURE;
    }

    if matches.get_one::<String>("import").is_some() {
        error!("NOT YET IMPLEMENTED");
    }
    if matches.get_flag("export") {
        error!("NOT YET IMPLEMENTED");
    }
    if matches.get_flag("stats") {
        error!("NOT YET IMPLEMENTED");
    }
    if matches.get_many::<String>("option").is_some() {
        error!("NOT YET IMPLEMENTED");
    }

    ExitCode::SUCCESS
}
