//! Orchestration engine for the Replication Experiment System.
//!
//! Command lines such as `experiment start lab1 set 2` are parsed into typed
//! commands and routed to the experiment, package, connection and challenge
//! managers. Hypervisor work goes through [`res_hypervisor::Hypervisor`];
//! every write is polled to completion before the next one is issued.

pub mod broker;
pub mod command;
pub mod completion;
pub mod config;
pub mod engine;
pub mod error;
pub mod experiment;
pub mod fleet;
pub mod output;
pub mod packager;
pub mod proxy;
pub mod status;
pub mod users;

pub use command::{quote_arg, tokenize};
pub use completion::PollPolicy;
pub use config::{EngineConfig, FanOut};
pub use engine::{Engine, EngineBuilder};
pub use error::{CommandError, EngineError, ErrorKind, Result};
pub use experiment::{ExperimentConfig, ExperimentStore, InstanceType, Selector};
pub use output::{CommandOutput, FleetReport, InstanceOutcome, Outcome, Progress, ProgressEvent};
pub use proxy::EngineHandle;
pub use users::{Credentials, UserAssignment, UserConnections};
