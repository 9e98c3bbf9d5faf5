//! Command-line grammar.
//!
//! A command line is split into shell-style words and parsed by clap into a
//! typed [`CommandLine`]. Managers only ever see the typed value.

use clap::error::{ContextKind, ContextValue, ErrorKind as ClapErrorKind};
use clap::{Args, Parser, Subcommand};

use crate::broker::{DisplaySettings, Endpoint};
use crate::error::{EngineError, Result};
use crate::experiment::{InstanceType, Selector};

const FALLBACK_USAGE: &str = "Usage: <domain> <operation> [arguments...]";

/// Split `line` into words. Quotes group words and are removed; a backslash
/// escapes the next character. `""` yields an empty word.
pub fn tokenize(line: &str) -> Result<Vec<String>> {
    #[derive(Clone, Copy, PartialEq, Eq)]
    enum Mode {
        Normal,
        SingleQuoted,
        DoubleQuoted,
    }

    let mut out = Vec::new();
    let mut current = String::new();
    let mut in_word = false;
    let mut mode = Mode::Normal;
    let mut chars = line.chars();

    while let Some(ch) = chars.next() {
        match mode {
            Mode::Normal => match ch {
                '\'' => {
                    mode = Mode::SingleQuoted;
                    in_word = true;
                }
                '"' => {
                    mode = Mode::DoubleQuoted;
                    in_word = true;
                }
                '\\' => {
                    if let Some(next) = chars.next() {
                        current.push(next);
                    }
                    in_word = true;
                }
                c if c.is_whitespace() => {
                    if in_word {
                        out.push(std::mem::take(&mut current));
                        in_word = false;
                    }
                }
                _ => {
                    current.push(ch);
                    in_word = true;
                }
            },
            Mode::SingleQuoted => {
                if ch == '\'' {
                    mode = Mode::Normal;
                } else {
                    current.push(ch);
                }
            }
            Mode::DoubleQuoted => match ch {
                '"' => mode = Mode::Normal,
                '\\' => {
                    if let Some(next) = chars.next() {
                        current.push(next);
                    }
                }
                _ => current.push(ch),
            },
        }
    }

    if mode != Mode::Normal {
        let quote = if mode == Mode::SingleQuoted { "'" } else { "\"" };
        return Err(EngineError::invalid(
            format!("{quote}{current}"),
            "unterminated quoted string",
        ));
    }
    if in_word {
        out.push(current);
    }
    Ok(out)
}

/// Quote `arg` so [`tokenize`] returns it unchanged as one word.
pub fn quote_arg(arg: &str) -> String {
    let plain = !arg.is_empty()
        && !arg
            .chars()
            .any(|c| c.is_whitespace() || matches!(c, '"' | '\'' | '\\'));
    if plain {
        return arg.to_string();
    }
    let mut quoted = String::with_capacity(arg.len() + 2);
    quoted.push('"');
    for c in arg.chars() {
        if matches!(c, '"' | '\\') {
            quoted.push('\\');
        }
        quoted.push(c);
    }
    quoted.push('"');
    quoted
}

#[derive(Debug, Clone, Parser)]
#[command(name = "res", no_binary_name = true, disable_version_flag = true)]
#[command(about = "Replication Experiment System engine commands")]
pub struct CommandLine {
    #[command(subcommand)]
    pub domain: Domain,
}

#[derive(Debug, Clone, Subcommand)]
pub enum Domain {
    /// Engine-wide status
    #[command(subcommand)]
    Engine(EngineOp),
    /// Hypervisor cache and backend status
    #[command(subcommand)]
    VmManage(VmManageOp),
    /// Import and export experiment packages
    #[command(subcommand)]
    Packager(PackagerOp),
    /// Remote-display users and connections
    #[command(subcommand)]
    Conns(ConnsOp),
    /// Scoring-service accounts
    #[command(subcommand)]
    Challenges(ChallengesOp),
    /// Experiment lifecycle
    #[command(subcommand)]
    Experiment(ExperimentOp),
}

#[derive(Debug, Clone, Subcommand)]
pub enum EngineOp {
    /// Status of every manager
    Status,
}

#[derive(Debug, Clone, Subcommand)]
pub enum VmManageOp {
    /// Cached information about one VM
    Vmstatus { vm_name: String },
    /// Backend status, including pending writes
    Mgrstatus,
    /// Refresh cached VM information in the background
    Refresh {
        /// VM name, or `all`
        #[arg(default_value = "all")]
        vm_name: String,
    },
}

#[derive(Debug, Clone, Subcommand)]
pub enum PackagerOp {
    Status,
    /// Import a package file
    Import { file: String },
    /// Export an experiment to `<path>/<name>.res`
    Export { name: String, path: String },
}

/// Trailing `<itype> <name>` pair; defaults to every instance.
#[derive(Debug, Clone, PartialEq, Eq, Args)]
pub struct SelectorArgs {
    #[arg(value_enum, ignore_case = true, default_value_t = InstanceType::Vm)]
    pub itype: InstanceType,
    #[arg(default_value = "all")]
    pub name: String,
}

impl SelectorArgs {
    pub fn selector(&self) -> Selector {
        Selector::new(self.itype, &self.name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Args)]
pub struct BrokerArgs {
    pub hostname: String,
    pub username: String,
    #[arg(allow_hyphen_values = true)]
    pub password: String,
    pub url_path: String,
    /// http or https
    pub method: String,
}

impl BrokerArgs {
    pub fn endpoint(&self) -> Endpoint {
        Endpoint::new(
            &self.hostname,
            &self.username,
            &self.password,
            &self.url_path,
            &self.method,
        )
    }
}

/// Scoring-service login; the password carries the admin API token.
#[derive(Debug, Clone, PartialEq, Eq, Args)]
pub struct ScoringArgs {
    pub hostname: String,
    pub username: String,
    #[arg(allow_hyphen_values = true)]
    pub password: String,
    pub method: String,
}

impl ScoringArgs {
    pub fn endpoint(&self) -> Endpoint {
        Endpoint::new(&self.hostname, &self.username, &self.password, "", &self.method)
    }
}

#[derive(Debug, Clone, Subcommand)]
pub enum ConnsOp {
    Status,
    /// Broker users, connections and active sessions
    Refresh(BrokerArgs),
    /// Create users and RDP connections for the selected instances
    Create {
        configname: String,
        #[command(flatten)]
        broker: BrokerArgs,
        max_connections: u32,
        max_connections_per_user: u32,
        width: u32,
        height: u32,
        bitdepth: u32,
        /// Credentials file, or `None`
        creds_file: String,
        #[command(flatten)]
        selector: SelectorArgs,
    },
    Remove {
        configname: String,
        #[command(flatten)]
        broker: BrokerArgs,
        creds_file: String,
        #[command(flatten)]
        selector: SelectorArgs,
    },
    /// Remove every connection and user
    Clear(BrokerArgs),
    /// Remote-display URLs
    Open {
        configname: String,
        /// Set number, or `all`
        experimentid: String,
        #[command(flatten)]
        selector: SelectorArgs,
    },
}

impl ConnsOp {
    pub fn display_settings(&self) -> Option<DisplaySettings> {
        match self {
            ConnsOp::Create {
                max_connections,
                max_connections_per_user,
                width,
                height,
                bitdepth,
                ..
            } => Some(DisplaySettings {
                max_connections: *max_connections,
                max_connections_per_user: *max_connections_per_user,
                width: *width,
                height: *height,
                bitdepth: *bitdepth,
            }),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Subcommand)]
pub enum ChallengesOp {
    Status,
    Refresh(ScoringArgs),
    /// Statistics and scoreboard
    Getstats(ScoringArgs),
    Create {
        configname: String,
        #[command(flatten)]
        scoring: ScoringArgs,
        creds_file: String,
        #[command(flatten)]
        selector: SelectorArgs,
    },
    Remove {
        configname: String,
        #[command(flatten)]
        scoring: ScoringArgs,
        creds_file: String,
        #[command(flatten)]
        selector: SelectorArgs,
    },
    Clear(ScoringArgs),
    Open {
        configname: String,
        experimentid: String,
        #[command(flatten)]
        selector: SelectorArgs,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Args)]
pub struct LifecycleArgs {
    pub configname: String,
    #[command(flatten)]
    pub selector: SelectorArgs,
}

#[derive(Debug, Clone, Subcommand)]
pub enum ExperimentOp {
    /// Manager status, or instance states of one experiment
    Status { configname: Option<String> },
    /// Refresh and report every instance state
    Refresh { configname: String },
    /// Clone, configure and snapshot instances
    Create(LifecycleArgs),
    Start(LifecycleArgs),
    Stop(LifecycleArgs),
    Suspend(LifecycleArgs),
    Pause(LifecycleArgs),
    Snapshot(LifecycleArgs),
    /// Stop, restore the current snapshot, start
    Restore(LifecycleArgs),
    Remove(LifecycleArgs),
    /// Run template startup commands in each guest
    Guestcmd(LifecycleArgs),
    /// Run template stored commands in each guest
    Gueststored(LifecycleArgs),
}

/// A parsed line: a command to run, or rendered help.
#[derive(Debug, Clone)]
pub enum Parsed {
    Command(CommandLine),
    Help(String),
}

pub fn parse(line: &str) -> Result<Parsed> {
    let tokens = tokenize(line)?;
    if tokens.is_empty() {
        return Err(EngineError::invalid("", FALLBACK_USAGE));
    }
    match CommandLine::try_parse_from(&tokens) {
        Ok(command) => Ok(Parsed::Command(command)),
        Err(err) => match err.kind() {
            ClapErrorKind::DisplayHelp | ClapErrorKind::DisplayVersion => {
                Ok(Parsed::Help(err.render().to_string()))
            }
            _ => Err(invalid_command(&err, &tokens)),
        },
    }
}

fn invalid_command(err: &clap::Error, tokens: &[String]) -> EngineError {
    let context = match err.kind() {
        ClapErrorKind::InvalidSubcommand => Some(ContextKind::InvalidSubcommand),
        ClapErrorKind::InvalidValue | ClapErrorKind::ValueValidation => Some(ContextKind::InvalidValue),
        ClapErrorKind::UnknownArgument => Some(ContextKind::InvalidArg),
        _ => None,
    };
    let offending = context.and_then(|kind| match err.get(kind) {
        Some(ContextValue::String(value)) => Some(value.clone()),
        Some(ContextValue::Strings(values)) => values.first().cloned(),
        _ => None,
    });
    // Missing pieces are reported against the last word given.
    let token = offending
        .or_else(|| tokens.last().cloned())
        .unwrap_or_default();

    let rendered = err.render().to_string();
    let usage = rendered
        .lines()
        .map(str::trim)
        .find(|line| line.starts_with("Usage:"))
        .unwrap_or(FALLBACK_USAGE)
        .to_string();
    EngineError::invalid(token, usage)
}
