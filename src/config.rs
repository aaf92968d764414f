use crate::adapter::engine::Program;
use crate::adapter::process::ProcessConfig;
use crate::dap::transport::ListenAddr;
use anyhow::{bail, Context};
use clap::Parser;
use serde::Deserialize;
use std::fs::read_to_string;
use std::path::{Path, PathBuf};

#[derive(Parser, Debug, Clone, Default)]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// Address to listen on: `stdio`, `tcp://host:port` or `unix:///path`
    /// (default: tcp://127.0.0.1:4711)
    #[clap(long, env = "YADAP_LISTEN")]
    pub listen: Option<String>,

    /// Exit after the first debug session ends (single-client mode).
    #[clap(long, env = "YADAP_ONESHOT")]
    pub oneshot: bool,

    /// Optional log file for adapter diagnostics (no output to stderr).
    #[clap(long, env = "YADAP_LOG_FILE")]
    pub log_file: Option<PathBuf>,

    /// Trace DAP traffic (requests/responses/events) into the log file.
    /// Requires --log-file.
    #[clap(long, env = "YADAP_TRACE_DAP")]
    pub trace_dap: bool,

    /// Configuration file (default: ~/.config/yadap/config.toml if exists)
    #[clap(long, env = "YADAP_CONFIG")]
    pub config: Option<PathBuf>,

    /// Interpreter that evaluates programs (default: sh)
    #[clap(long, env = "YADAP_INTERPRETER")]
    pub interpreter: Option<String>,

    /// Interpreter flag preceding inline source (default: -c)
    #[clap(long, env = "YADAP_SOURCE_FLAG", allow_hyphen_values = true)]
    pub source_flag: Option<String>,

    /// Evaluate inline source
    #[clap(short, long, conflicts_with = "path")]
    pub eval: Option<String>,

    /// Program file to evaluate
    pub path: Option<PathBuf>,
}

/// Content of a configuration file, every key is optional.
#[derive(Debug, Default, PartialEq, Deserialize)]
#[serde(default, rename_all = "kebab-case", deny_unknown_fields)]
pub struct FileConfig {
    pub listen: Option<String>,
    pub oneshot: bool,
    pub log_file: Option<PathBuf>,
    pub trace_dap: bool,
    pub eval: Option<String>,
    pub path: Option<PathBuf>,
    pub engine: ProcessConfig,
}

impl FileConfig {
    const DEFAULT_PATH: &'static str = ".config/yadap/config.toml";

    /// Load configuration from an explicit file, or from the default location if it exists.
    pub fn load(path: Option<&Path>) -> anyhow::Result<Self> {
        let path = match path {
            Some(path) => path.to_path_buf(),
            None => match home::home_dir().map(|home| home.join(Self::DEFAULT_PATH)) {
                Some(path) if path.exists() => path,
                _ => return Ok(Self::default()),
            },
        };

        let data = read_to_string(&path)
            .with_context(|| format!("read config file {}", path.display()))?;
        Self::parse(&data).with_context(|| format!("parse config file {}", path.display()))
    }

    pub fn parse(data: &str) -> anyhow::Result<Self> {
        Ok(toml::de::from_str(data)?)
    }
}

/// Effective adapter configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    pub listen: ListenAddr,
    pub oneshot: bool,
    pub log_file: Option<PathBuf>,
    pub trace_dap: bool,
    pub program: Program,
    pub engine: ProcessConfig,
}

impl Config {
    pub const DEFAULT_LISTEN: &'static str = "tcp://127.0.0.1:4711";

    pub fn from_args(args: Args) -> anyhow::Result<Self> {
        let file = FileConfig::load(args.config.as_deref())?;
        Self::merge(args, file)
    }

    /// Combine command line and file configuration, command line values take precedence.
    pub fn merge(args: Args, file: FileConfig) -> anyhow::Result<Self> {
        let listen = args
            .listen
            .or(file.listen)
            .unwrap_or_else(|| Self::DEFAULT_LISTEN.to_string());
        let listen: ListenAddr = listen
            .parse()
            .with_context(|| format!("invalid listen address {listen:?}"))?;

        let program = match (args.eval, args.path) {
            (Some(source), None) => Program::Source(source),
            (None, Some(path)) => Program::Path(path),
            (Some(_), Some(_)) => bail!("both inline source and program path are given"),
            (None, None) => match (file.eval, file.path) {
                (Some(source), None) => Program::Source(source),
                (None, Some(path)) => Program::Path(path),
                (Some(_), Some(_)) => bail!("config file sets both `eval` and `path`"),
                (None, None) => {
                    bail!("nothing to evaluate, pass --eval <SOURCE> or a program path")
                }
            },
        };

        let engine = ProcessConfig {
            interpreter: args.interpreter.unwrap_or(file.engine.interpreter),
            source_flag: args.source_flag.unwrap_or(file.engine.source_flag),
            args: file.engine.args,
        };

        Ok(Self {
            listen,
            oneshot: args.oneshot || file.oneshot,
            log_file: args.log_file.or(file.log_file),
            trace_dap: args.trace_dap || file.trace_dap,
            program,
            engine,
        })
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_defaults() {
        let args = Args {
            eval: Some("echo hi".to_string()),
            ..Default::default()
        };
        let config = Config::merge(args, FileConfig::default()).unwrap();
        assert_eq!(
            config,
            Config {
                listen: ListenAddr::Tcp("127.0.0.1:4711".to_string()),
                oneshot: false,
                log_file: None,
                trace_dap: false,
                program: Program::Source("echo hi".to_string()),
                engine: ProcessConfig::default(),
            }
        );
    }

    const FILE: &str = r#"
        listen = "unix:///tmp/yadap.sock"
        oneshot = true
        log-file = "/tmp/yadap.log"
        path = "/srv/script.lua"

        [engine]
        interpreter = "lua"
        source-flag = "-e"
        args = ["-W"]
    "#;

    #[test]
    fn test_command_line_overrides_file() {
        struct TestCase {
            args: Args,
            listen: ListenAddr,
            program: Program,
            interpreter: &'static str,
        }
        let test_cases = vec![
            TestCase {
                args: Args::default(),
                listen: ListenAddr::Unix(PathBuf::from("/tmp/yadap.sock")),
                program: Program::Path(PathBuf::from("/srv/script.lua")),
                interpreter: "lua",
            },
            TestCase {
                args: Args {
                    listen: Some("stdio".to_string()),
                    eval: Some("print(1)".to_string()),
                    interpreter: Some("luajit".to_string()),
                    ..Default::default()
                },
                listen: ListenAddr::Stdio,
                program: Program::Source("print(1)".to_string()),
                interpreter: "luajit",
            },
        ];

        for tc in test_cases {
            let config = Config::merge(tc.args, FileConfig::parse(FILE).unwrap()).unwrap();
            assert_eq!(config.listen, tc.listen);
            assert_eq!(config.program, tc.program);
            assert_eq!(config.engine.interpreter, tc.interpreter);
            assert_eq!(config.engine.source_flag, "-e");
            assert_eq!(config.engine.args, vec!["-W".to_string()]);
            assert!(config.oneshot);
            assert_eq!(config.log_file, Some(PathBuf::from("/tmp/yadap.log")));
        }
    }

    #[test]
    fn test_program_is_required() {
        let err = Config::merge(Args::default(), FileConfig::default()).unwrap_err();
        assert!(err.to_string().contains("nothing to evaluate"));

        let file = FileConfig::parse("eval = \"x\"\npath = \"y\"").unwrap();
        assert!(Config::merge(Args::default(), file).is_err());
    }

    #[test]
    fn test_invalid_file() {
        assert!(FileConfig::parse("listen = 1").is_err());
        assert!(FileConfig::parse("unknown-key = true").is_err());
        assert!(FileConfig::load(Some(Path::new("/nonexistent/yadap.toml"))).is_err());
    }

    #[test]
    fn test_invalid_listen_address() {
        let args = Args {
            listen: Some("udp://localhost:1".to_string()),
            eval: Some("true".to_string()),
            ..Default::default()
        };
        let err = Config::merge(args, FileConfig::default()).unwrap_err();
        assert!(format!("{err:#}").contains("invalid listen address"));
    }

    #[test]
    fn test_parse_command_line() {
        let args = Args::try_parse_from([
            "yadap",
            "--listen",
            "tcp://0.0.0.0:5000",
            "--oneshot",
            "--source-flag",
            "-e",
            "script.lua",
        ])
        .unwrap();
        assert_eq!(args.listen.as_deref(), Some("tcp://0.0.0.0:5000"));
        assert!(args.oneshot);
        assert_eq!(args.source_flag.as_deref(), Some("-e"));
        assert_eq!(args.path, Some(PathBuf::from("script.lua")));

        assert!(Args::try_parse_from(["yadap", "-e", "x", "script.lua"]).is_err());
    }
}
