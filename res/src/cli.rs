// CLI argument parsing and definitions

use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Debug, Clone, Parser)]
#[command(name = "res")]
#[command(about = "Run experiment orchestration commands against the local engine")]
#[command(version)]
pub struct Args {
    #[command(subcommand)]
    pub command: Command,

    /// Engine configuration file (defaults to RES_ENGINE_CONFIG)
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Print results as JSON
    #[arg(long, global = true)]
    pub json: bool,

    /// Report per-instance progress on stderr
    #[arg(short, long, global = true)]
    pub progress: bool,
}

#[derive(Debug, Clone, Subcommand)]
pub enum Command {
    /// Execute one command line, e.g. `res exec experiment start lab1`
    Exec {
        /// Command words; quote any argument containing spaces
        #[arg(required = true, trailing_var_arg = true, allow_hyphen_values = true)]
        words: Vec<String>,
    },
    /// Read command lines from stdin until EOF
    Shell,
}

impl Command {
    /// The command line `exec` hands to the engine. A single word is taken
    /// as an already-formed line.
    pub fn line(words: &[String]) -> String {
        if let [line] = words {
            return line.clone();
        }
        words
            .iter()
            .map(|word| res_engine::quote_arg(word))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exec_keeps_words_and_flags() {
        let args = Args::try_parse_from([
            "res", "--json", "exec", "conns", "create", "lab1", "my creds.txt",
        ])
        .unwrap();
        assert!(args.json);
        match args.command {
            Command::Exec { words } => {
                assert_eq!(Command::line(&words), "conns create lab1 \"my creds.txt\"");
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_single_word_is_a_whole_line() {
        let words = vec!["experiment status lab1".to_string()];
        assert_eq!(Command::line(&words), "experiment status lab1");
    }

    #[test]
    fn test_exec_requires_words() {
        assert!(Args::try_parse_from(["res", "exec"]).is_err());
    }
}
