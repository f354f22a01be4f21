//! Command-line surface.

use clap::{ArgAction, Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(
    name = "flm",
    version = flm_engine::FLM_VERSION,
    about = "Local language model runtime for the NPU",
    after_help = "Examples:\n  \
        flm run llama3.2:1b\n  \
        flm serve llama3.2:1b --port 8000\n  \
        flm serve llama3.2:1b --ctx-len 8192 --q-len 10\n  \
        flm pull llama3.2:1b --force\n  \
        flm list --filter installed\n  \
        flm bench llama3.2:1b --prompt bench.json"
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run a model interactively
    Run {
        /// Model tag (family or family:size)
        tag: String,
        /// Context length in tokens
        #[arg(long = "ctx-len", short = 'c')]
        ctx_len: Option<usize>,
        /// Allow high-priority tasks to preempt the runtime
        #[arg(long, action = ArgAction::Set, default_value_t = false)]
        preemption: bool,
        /// Also load the speech-recognition model
        #[arg(long, short = 'a', action = ArgAction::Set, default_value_t = false)]
        asr: bool,
        /// Power mode: powersaver, balanced, performance, turbo
        #[arg(long, default_value = "performance")]
        pmode: String,
    },
    /// Start the HTTP server
    Serve {
        /// Default model tag
        tag: Option<String>,
        /// Bind address
        #[arg(long, default_value = "127.0.0.1")]
        host: String,
        /// Server port (FLM_SERVE_PORT or 52625 when unset)
        #[arg(long, short = 'p')]
        port: Option<u16>,
        /// Maximum concurrent socket connections
        #[arg(long = "socket", short = 's', default_value_t = 10)]
        max_connections: usize,
        /// Maximum queued accelerator requests
        #[arg(long = "q-len", short = 'q', default_value_t = 10)]
        max_npu_queue: usize,
        /// Enable Cross-Origin Resource Sharing
        #[arg(long, action = ArgAction::Set, default_value_t = true)]
        cors: bool,
        /// Context length in tokens
        #[arg(long = "ctx-len", short = 'c')]
        ctx_len: Option<usize>,
        /// Allow high-priority tasks to preempt the runtime
        #[arg(long, action = ArgAction::Set, default_value_t = false)]
        preemption: bool,
        /// Power mode: powersaver, balanced, performance, turbo
        #[arg(long, default_value = "performance")]
        pmode: String,
    },
    /// Download model files if not present
    Pull {
        tag: String,
        /// Re-download even if the model exists
        #[arg(long)]
        force: bool,
    },
    /// Remove a model
    Remove { tag: String },
    /// List catalog models
    List {
        /// Show: all | installed | not-installed
        #[arg(long, default_value = "all")]
        filter: String,
        /// Suppress install markers, for sub-process usage
        #[arg(long)]
        quiet: bool,
        /// Emit JSON instead of human text
        #[arg(long, short = 'j')]
        json: bool,
    },
    /// Benchmark prefill and decode throughput
    Bench {
        tag: String,
        /// Benchmark configuration file
        #[arg(long = "prompt", short = 'i')]
        prompt: Option<PathBuf>,
    },
    /// Show version information
    Version {
        #[arg(long, short = 'j')]
        json: bool,
    },
    /// Show the default server port
    Port,
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_serve_flags_parse() {
        let cli = Cli::parse_from([
            "flm", "serve", "llama3.2:1b", "--port", "8000", "--q-len", "4", "--cors", "false",
            "--ctx-len", "8192",
        ]);
        match cli.command {
            Command::Serve {
                tag,
                port,
                max_npu_queue,
                cors,
                ctx_len,
                ..
            } => {
                assert_eq!(tag.as_deref(), Some("llama3.2:1b"));
                assert_eq!(port, Some(8000));
                assert_eq!(max_npu_queue, 4);
                assert!(!cors);
                assert_eq!(ctx_len, Some(8192));
            }
            other => panic!("parsed {other:?}"),
        }
    }

    #[test]
    fn test_serve_without_tag() {
        let cli = Cli::parse_from(["flm", "serve"]);
        assert!(matches!(cli.command, Command::Serve { tag: None, .. }));
    }

    #[test]
    fn test_list_filter_default() {
        let cli = Cli::parse_from(["flm", "list"]);
        match cli.command {
            Command::List { filter, quiet, json } => {
                assert_eq!(filter, "all");
                assert!(!quiet);
                assert!(!json);
            }
            other => panic!("parsed {other:?}"),
        }
    }
}
