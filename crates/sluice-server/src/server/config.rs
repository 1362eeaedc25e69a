use anyhow::bail;
use clap::Parser;
use core::time::Duration;
use std::path::PathBuf;
use tracing_subscriber::filter::LevelFilter;

/// Runtime configuration for the `sluice-server` binary.
///
/// All values are parsed from CLI arguments or environment variables (a
/// `.env` file is loaded first). The pool size and the rate limit settings
/// have no defaults: the server refuses to start without them.
#[derive(Parser, Debug, Clone)]
#[command(
    name = "sluice-server",
    version,
    about = "An HTTP front end for a bounded worker pool with per-client rate limiting"
)]
pub struct CliArgs {
    /// Number of workers in the pool.
    ///
    /// At most this many jobs run at once; further requests wait for a worker
    /// to free up.
    ///
    /// Environment variable: `HTTP_WORKER_POOL_SIZE`
    #[arg(long, env = "HTTP_WORKER_POOL_SIZE")]
    pub pool_size: usize,

    /// Requests each client may make per window.
    ///
    /// Environment variable: `HTTP_RATE_LIMIT`
    #[arg(long, env = "HTTP_RATE_LIMIT")]
    pub rate_limit: u64,

    /// Length of the rate limit window, in seconds.
    ///
    /// Every counter is cleared at once when the window elapses.
    ///
    /// Environment variable: `HTTP_RATE_LIMIT_WINDOW`
    #[arg(long, env = "HTTP_RATE_LIMIT_WINDOW")]
    pub rate_limit_window: u64,

    /// Address to listen on.
    ///
    /// Environment variable: `SERVER_ADDR`
    #[arg(long, env = "SERVER_ADDR", default_value_t = String::from("0.0.0.0:8080"))]
    pub server_addr: String,

    /// Give up on a request if no worker accepts its job within this many
    /// milliseconds. Waits indefinitely when unset.
    ///
    /// Environment variable: `DISPATCH_TIMEOUT_MS`
    #[arg(long, env = "DISPATCH_TIMEOUT_MS")]
    pub dispatch_timeout_ms: Option<u64>,

    /// Give up on a request if its job has not finished within this many
    /// milliseconds of being accepted. Waits indefinitely when unset.
    ///
    /// Environment variable: `JOB_TIMEOUT_MS`
    #[arg(long, env = "JOB_TIMEOUT_MS")]
    pub job_timeout_ms: Option<u64>,

    /// Seconds to wait for each worker to acknowledge shutdown.
    ///
    /// Environment variable: `SHUTDOWN_TIMEOUT`
    #[arg(long, env = "SHUTDOWN_TIMEOUT", default_value_t = 3)]
    pub shutdown_timeout: u64,

    /// Fixed client key used for every request. Intended for local testing
    /// without a proxy that sets `REMOTE_ADDR` or `X-Forwarded-For`.
    ///
    /// Environment variable: `MOCK_REMOTE_ADDR`
    #[arg(long, env = "MOCK_REMOTE_ADDR")]
    pub mock_remote_addr: Option<String>,

    /// Append every log line to this file, in addition to the console.
    ///
    /// Environment variable: `LOGGER_LOG_FILE`
    #[arg(long, env = "LOGGER_LOG_FILE")]
    pub log_file: Option<PathBuf>,

    /// Append `ERROR` events to this file as well.
    ///
    /// Environment variable: `LOGGER_ERROR_LOG_FILE`
    #[arg(long, env = "LOGGER_ERROR_LOG_FILE")]
    pub error_log_file: Option<PathBuf>,

    /// Minimum level written to the console and log files. `RUST_LOG`, when
    /// set, takes precedence. `FATAL` is accepted as an alias for `ERROR`.
    ///
    /// Environment variable: `LOGGER_LOG_LEVEL`
    #[arg(long, env = "LOGGER_LOG_LEVEL", default_value = "info", value_parser = parse_log_level)]
    pub log_level: LevelFilter,

    /// Turn off console and file logging entirely.
    ///
    /// Environment variable: `LOGGER_DISABLED`
    #[arg(
        long,
        env = "LOGGER_DISABLED",
        default_value_t = false,
        action = clap::ArgAction::Set
    )]
    pub log_disabled: bool,
}

fn parse_log_level(level: &str) -> Result<LevelFilter, String> {
    if level.trim().eq_ignore_ascii_case("fatal") {
        return Ok(LevelFilter::ERROR);
    }
    level
        .trim()
        .parse()
        .map_err(|_| format!("unknown log level `{level}`"))
}

/// Where log output goes.
#[derive(Debug, Clone)]
pub struct LogConfig {
    pub file: Option<PathBuf>,
    pub error_file: Option<PathBuf>,
    pub level: LevelFilter,
    pub disabled: bool,
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub pool_size: usize,
    pub rate_limit: u64,
    pub rate_limit_window: Duration,
    pub server_addr: String,
    pub dispatch_timeout: Option<Duration>,
    pub job_timeout: Option<Duration>,
    pub shutdown_timeout: Duration,
    pub mock_remote_addr: Option<String>,
    pub log: LogConfig,
}

impl TryFrom<CliArgs> for ServerConfig {
    type Error = anyhow::Error;

    fn try_from(args: CliArgs) -> Result<Self, Self::Error> {
        if args.pool_size == 0 {
            bail!("HTTP_WORKER_POOL_SIZE must be greater than 0");
        }

        if args.rate_limit == 0 {
            bail!("HTTP_RATE_LIMIT must be greater than 0");
        }

        if args.rate_limit_window == 0 {
            bail!("HTTP_RATE_LIMIT_WINDOW must be greater than 0");
        }

        if args.dispatch_timeout_ms == Some(0) {
            bail!("DISPATCH_TIMEOUT_MS must be greater than 0 when set");
        }

        if args.job_timeout_ms == Some(0) {
            bail!("JOB_TIMEOUT_MS must be greater than 0 when set");
        }

        Ok(Self {
            pool_size: args.pool_size,
            rate_limit: args.rate_limit,
            rate_limit_window: Duration::from_secs(args.rate_limit_window),
            server_addr: args.server_addr,
            dispatch_timeout: args.dispatch_timeout_ms.map(Duration::from_millis),
            job_timeout: args.job_timeout_ms.map(Duration::from_millis),
            shutdown_timeout: Duration::from_secs(args.shutdown_timeout),
            mock_remote_addr: args
                .mock_remote_addr
                .filter(|addr| !addr.trim().is_empty()),
            log: LogConfig {
                file: args.log_file,
                error_file: args.error_log_file,
                level: args.log_level,
                disabled: args.log_disabled,
            },
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args() -> CliArgs {
        CliArgs::try_parse_from([
            "sluice-server",
            "--pool-size",
            "4",
            "--rate-limit",
            "10",
            "--rate-limit-window",
            "60",
            "--job-timeout-ms",
            "250",
        ])
        .unwrap()
    }

    #[test]
    fn valid_arguments_produce_a_config() {
        let config = ServerConfig::try_from(args()).unwrap();

        assert_eq!(config.pool_size, 4);
        assert_eq!(config.rate_limit, 10);
        assert_eq!(config.rate_limit_window, Duration::from_secs(60));
        assert_eq!(config.job_timeout, Some(Duration::from_millis(250)));
        assert_eq!(config.shutdown_timeout, Duration::from_secs(3));
    }

    #[test]
    fn zero_values_are_rejected_at_startup() {
        let cases: [(fn(&mut CliArgs), &str); 5] = [
            (|a| a.pool_size = 0, "HTTP_WORKER_POOL_SIZE"),
            (|a| a.rate_limit = 0, "HTTP_RATE_LIMIT"),
            (|a| a.rate_limit_window = 0, "HTTP_RATE_LIMIT_WINDOW"),
            (|a| a.dispatch_timeout_ms = Some(0), "DISPATCH_TIMEOUT_MS"),
            (|a| a.job_timeout_ms = Some(0), "JOB_TIMEOUT_MS"),
        ];

        for (zero_out, expected) in cases {
            let mut args = args();
            zero_out(&mut args);
            let err = ServerConfig::try_from(args).unwrap_err();
            assert!(err.to_string().contains(expected), "{expected}: {err}");
        }
    }

    #[test]
    fn blank_mock_address_is_ignored() {
        let mut blank = args();
        blank.mock_remote_addr = Some("  ".to_owned());
        assert_eq!(ServerConfig::try_from(blank).unwrap().mock_remote_addr, None);

        let mut fixed = args();
        fixed.mock_remote_addr = Some("127.0.0.1".to_owned());
        assert_eq!(
            ServerConfig::try_from(fixed).unwrap().mock_remote_addr.as_deref(),
            Some("127.0.0.1")
        );
    }

    #[test]
    fn logging_defaults_to_console_at_info() {
        let log = ServerConfig::try_from(args()).unwrap().log;
        assert_eq!(log.level, LevelFilter::INFO);
        assert_eq!(log.file, None);
        assert_eq!(log.error_file, None);
        assert!(!log.disabled);
    }

    #[test]
    fn logger_flags_are_parsed() {
        let args = CliArgs::try_parse_from([
            "sluice-server",
            "--pool-size",
            "1",
            "--rate-limit",
            "1",
            "--rate-limit-window",
            "1",
            "--log-file",
            "logs/sluice.log",
            "--error-log-file",
            "logs/sluice.err.log",
            "--log-level",
            "FATAL",
            "--log-disabled",
            "true",
        ])
        .unwrap();
        let log = ServerConfig::try_from(args).unwrap().log;

        assert_eq!(log.file, Some(PathBuf::from("logs/sluice.log")));
        assert_eq!(log.error_file, Some(PathBuf::from("logs/sluice.err.log")));
        assert_eq!(log.level, LevelFilter::ERROR);
        assert!(log.disabled);
    }

    #[test]
    fn log_levels_are_case_insensitive() {
        assert_eq!(parse_log_level("INFO"), Ok(LevelFilter::INFO));
        assert_eq!(parse_log_level("debug"), Ok(LevelFilter::DEBUG));
        assert_eq!(parse_log_level("Fatal"), Ok(LevelFilter::ERROR));
        assert!(parse_log_level("loud").is_err());
    }
}
