//! Command-line interface for the runspace-coordinator demo shell.
//!
//! Uses lexopt for minimal binary size overhead.

use std::ffi::OsString;
use std::path::PathBuf;

/// Command-line arguments.
#[derive(Debug, Clone, Default)]
pub struct Args {
    /// Path to configuration file.
    pub config: Option<PathBuf>,
    /// Log level (error, warn, info, debug, trace).
    pub log_level: Option<String>,
    /// Oldest accepted engine version (overrides config file).
    pub min_engine_version: Option<String>,
    /// Skip the identity probe after each command.
    pub no_probe: bool,
    /// Show version and exit.
    pub version: bool,
    /// Show help and exit.
    pub help: bool,
}

/// Parse command-line arguments.
pub fn parse_args() -> Result<Args, ArgsError> {
    parse_args_from(std::env::args_os())
}

/// Parse arguments from an iterator (for testing).
pub fn parse_args_from<I>(args: I) -> Result<Args, ArgsError>
where
    I: IntoIterator<Item = OsString>,
{
    use lexopt::prelude::*;

    let mut result = Args::default();
    let mut parser = lexopt::Parser::from_iter(args);

    while let Some(arg) = parser.next()? {
        match arg {
            Short('h') | Long("help") => {
                result.help = true;
            }
            Short('V') | Long("version") => {
                result.version = true;
            }
            Short('c') | Long("config") => {
                result.config = Some(parser.value()?.parse()?);
            }
            Short('l') | Long("log-level") => {
                result.log_level = Some(parser.value()?.parse()?);
            }
            Long("min-engine-version") => {
                let value: String = parser.value()?.parse()?;
                if value.parse::<crate::engine::EngineVersion>().is_err() {
                    return Err(ArgsError::InvalidValue("min-engine-version", value));
                }
                result.min_engine_version = Some(value);
            }
            Long("no-probe") => {
                result.no_probe = true;
            }
            Value(val) => {
                return Err(ArgsError::UnexpectedArgument(val.to_string_lossy().into()));
            }
            _ => return Err(arg.unexpected().into()),
        }
    }

    Ok(result)
}

/// Print help message.
pub fn print_help() {
    let version = env!("CARGO_PKG_VERSION");
    println!(
        r#"runspace-coordinator {version}
Interactive shell over a coordinated interpreter session

USAGE:
    runspace-coordinator [OPTIONS]

OPTIONS:
    -c, --config <FILE>             Path to configuration file (JSON)
    -l, --log-level <LVL>           Log level (error, warn, info, debug, trace)
        --min-engine-version <V>    Oldest accepted engine version [default: 5.1]
        --no-probe                  Skip the identity probe after each command
    -h, --help                      Print help
    -V, --version                   Print version

ENVIRONMENT VARIABLES:
    RUNSPACE_COORDINATOR_LOG_LEVEL          Log level (overrides config)
    RUNSPACE_COORDINATOR_MIN_ENGINE_VERSION Minimum engine version (overrides config)
    RUST_LOG                                Alternative log level setting

COMMANDS:
    exit        Leave the shell
    Ctrl+C      Abort the running command

EXAMPLES:
    # Start with defaults
    runspace-coordinator

    # Verbose coordinator logging
    runspace-coordinator -l debug

    # Start with config file
    runspace-coordinator -c ./coordinator.json
"#
    );
}

/// Print version.
pub fn print_version() {
    println!("runspace-coordinator {}", env!("CARGO_PKG_VERSION"));
}

/// Argument parsing errors.
#[derive(Debug)]
pub enum ArgsError {
    /// Lexopt parsing error.
    Lexopt(lexopt::Error),
    /// Invalid argument value.
    InvalidValue(&'static str, String),
    /// Unexpected positional argument.
    UnexpectedArgument(String),
}

impl std::fmt::Display for ArgsError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Lexopt(e) => write!(f, "{}", e),
            Self::InvalidValue(name, value) => {
                write!(f, "invalid value for --{}: '{}'", name, value)
            }
            Self::UnexpectedArgument(arg) => {
                write!(f, "unexpected argument: '{}'", arg)
            }
        }
    }
}

impl std::error::Error for ArgsError {}

impl From<lexopt::Error> for ArgsError {
    fn from(e: lexopt::Error) -> Self {
        Self::Lexopt(e)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(args: &[&str]) -> Vec<OsString> {
        std::iter::once("runspace-coordinator")
            .chain(args.iter().copied())
            .map(OsString::from)
            .collect()
    }

    #[test]
    fn test_default_args() {
        let result = parse_args_from(args(&[])).unwrap();
        assert!(result.config.is_none());
        assert!(result.log_level.is_none());
        assert!(!result.no_probe);
    }

    #[test]
    fn test_config_file() {
        let result = parse_args_from(args(&["-c", "/etc/config.json"])).unwrap();
        assert_eq!(result.config, Some(PathBuf::from("/etc/config.json")));
    }

    #[test]
    fn test_min_engine_version() {
        let result = parse_args_from(args(&["--min-engine-version", "7.2"])).unwrap();
        assert_eq!(result.min_engine_version.as_deref(), Some("7.2"));
    }

    #[test]
    fn test_invalid_min_engine_version() {
        let result = parse_args_from(args(&["--min-engine-version", "latest"]));
        assert!(matches!(
            result,
            Err(ArgsError::InvalidValue("min-engine-version", _))
        ));
    }

    #[test]
    fn test_no_probe() {
        let result = parse_args_from(args(&["--no-probe"])).unwrap();
        assert!(result.no_probe);
    }

    #[test]
    fn test_help_flag() {
        let result = parse_args_from(args(&["-h"])).unwrap();
        assert!(result.help);

        let result = parse_args_from(args(&["--help"])).unwrap();
        assert!(result.help);
    }

    #[test]
    fn test_version_flag() {
        let result = parse_args_from(args(&["-V"])).unwrap();
        assert!(result.version);

        let result = parse_args_from(args(&["--version"])).unwrap();
        assert!(result.version);
    }

    #[test]
    fn test_log_level() {
        let result = parse_args_from(args(&["-l", "debug"])).unwrap();
        assert_eq!(result.log_level, Some("debug".to_string()));
    }

    #[test]
    fn test_unexpected_argument() {
        let result = parse_args_from(args(&["stray"]));
        assert!(matches!(result, Err(ArgsError::UnexpectedArgument(a)) if a == "stray"));
    }

    #[test]
    fn test_combined_options() {
        let result = parse_args_from(args(&[
            "-c",
            "coordinator.json",
            "-l",
            "trace",
            "--no-probe",
        ]))
        .unwrap();

        assert_eq!(result.config, Some(PathBuf::from("coordinator.json")));
        assert_eq!(result.log_level, Some("trace".to_string()));
        assert!(result.no_probe);
        assert!(!result.help);
    }
}
