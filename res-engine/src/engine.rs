//! The command router.
//!
//! An [`Engine`] owns one instance of every manager. It is built once with
//! [`EngineBuilder`] and shared behind an `Arc`; every command line goes
//! through [`Engine::execute`].

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

use res_hypervisor::{get_hypervisor, Hypervisor, VmInfo};
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, info, info_span, Instrument};
use uuid::Uuid;

use crate::broker::ctfd::CtfdClient;
use crate::broker::guacamole::GuacamoleClient;
use crate::broker::{ChallengesManager, ConnectionManager, DisplayBroker, ScoringService};
use crate::command::{
    self, ChallengesOp, ConnsOp, Domain, EngineOp, ExperimentOp, PackagerOp, Parsed, VmManageOp,
};
use crate::config::EngineConfig;
use crate::error::{CommandError, Result};
use crate::experiment::{ExperimentManager, ExperimentStore, LifecycleVerb};
use crate::output::{CommandOutput, Progress};
use crate::packager::PackageManager;
use crate::users::{resolve_creds_file, UserConnections, UserPool};

#[derive(Default)]
pub struct EngineBuilder {
    config: Option<EngineConfig>,
    hypervisor: Option<Arc<dyn Hypervisor>>,
    display_broker: Option<Arc<dyn DisplayBroker>>,
    scoring_service: Option<Arc<dyn ScoringService>>,
}

impl EngineBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Use `config` instead of [`EngineConfig::load`].
    pub fn config(mut self, config: EngineConfig) -> Self {
        self.config = Some(config);
        self
    }

    /// Use `hypervisor` instead of the backend named in the configuration.
    pub fn hypervisor(mut self, hypervisor: Arc<dyn Hypervisor>) -> Self {
        self.hypervisor = Some(hypervisor);
        self
    }

    pub fn display_broker(mut self, broker: Arc<dyn DisplayBroker>) -> Self {
        self.display_broker = Some(broker);
        self
    }

    pub fn scoring_service(mut self, scoring: Arc<dyn ScoringService>) -> Self {
        self.scoring_service = Some(scoring);
        self
    }

    pub fn build(self) -> Result<Engine> {
        let config = match self.config {
            Some(config) => config,
            None => EngineConfig::load()?,
        };
        let hypervisor = match self.hypervisor {
            Some(hypervisor) => hypervisor,
            None => get_hypervisor(&config.hypervisor)?,
        };
        let broker = self
            .display_broker
            .unwrap_or_else(|| Arc::new(GuacamoleClient::new()));
        let scoring = self
            .scoring_service
            .unwrap_or_else(|| Arc::new(CtfdClient::new()));

        let store = Arc::new(ExperimentStore::new(&config.experiments_dir));
        let users = Arc::new(UserPool::new(Arc::clone(&store)));
        let policy = config.poll_policy();

        let experiments = ExperimentManager::new(
            Arc::clone(&hypervisor),
            Arc::clone(&store),
            policy,
            config.fan_out,
        );
        let packages = PackageManager::new(Arc::clone(&hypervisor), Arc::clone(&store), policy);
        let connections = ConnectionManager::new(
            broker,
            Arc::clone(&users),
            Arc::clone(&store),
            config.display_host.clone(),
            config.fan_out,
        );
        let challenges = ChallengesManager::new(scoring, Arc::clone(&users), Arc::clone(&store), config.fan_out);

        info!(
            backend = hypervisor.name(),
            host_os = ?hypervisor.host_os(),
            experiments_dir = %config.experiments_dir.display(),
            fan_out = ?config.fan_out,
            "Engine ready"
        );

        Ok(Engine {
            config,
            hypervisor,
            store,
            users,
            experiments,
            packages,
            connections,
            challenges,
        })
    }
}

pub struct Engine {
    config: EngineConfig,
    hypervisor: Arc<dyn Hypervisor>,
    store: Arc<ExperimentStore>,
    users: Arc<UserPool>,
    experiments: ExperimentManager,
    packages: PackageManager,
    connections: ConnectionManager,
    challenges: ChallengesManager,
}

fn to_value<T: Serialize>(value: &T) -> Value {
    serde_json::to_value(value).unwrap_or_else(|e| Value::String(e.to_string()))
}

impl Engine {
    pub fn builder() -> EngineBuilder {
        EngineBuilder::new()
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn hypervisor(&self) -> &Arc<dyn Hypervisor> {
        &self.hypervisor
    }

    pub fn store(&self) -> &ExperimentStore {
        &self.store
    }

    /// Run one command line to completion.
    pub async fn execute(&self, line: &str) -> std::result::Result<CommandOutput, CommandError> {
        self.execute_with_progress(line, &Progress::none()).await
    }

    /// Like [`Engine::execute`], reporting fan-out progress to `progress`.
    pub async fn execute_with_progress(
        &self,
        line: &str,
        progress: &Progress,
    ) -> std::result::Result<CommandOutput, CommandError> {
        let request_id = Uuid::new_v4();
        async {
            info!(command = %line, "Received command");
            match self.dispatch(line, progress).await {
                Ok(output) => {
                    debug!(result = output.kind(), "Command finished");
                    Ok(output)
                }
                Err(e) => {
                    debug!(error_kind = ?e.kind(), error = %e, "Command failed");
                    Err(CommandError::from(e))
                }
            }
        }
        .instrument(info_span!("command", request_id = %request_id))
        .await
    }

    /// The user-to-instance assignment for `config`, from its registered
    /// credentials file or the per-set defaults.
    pub fn generate_users_conns(
        &self,
        config: &str,
        creds_file: Option<&Path>,
    ) -> std::result::Result<Arc<UserConnections>, CommandError> {
        self.users
            .generate_users_conns(config, creds_file)
            .map_err(CommandError::from)
    }

    /// Status of every manager. Reads cached state only.
    pub fn engine_status(&self) -> CommandOutput {
        CommandOutput::Status(BTreeMap::from([
            ("VMMgr".to_string(), to_value(&self.hypervisor.manager_status())),
            ("PackageMgr".to_string(), to_value(&self.packages.status())),
            ("ConnectionMgr".to_string(), to_value(&self.connections.status())),
            ("ExperimentMgr".to_string(), to_value(&self.experiments.status())),
            ("ChallengesMgr".to_string(), to_value(&self.challenges.status())),
        ]))
    }

    async fn dispatch(&self, line: &str, progress: &Progress) -> Result<CommandOutput> {
        let command = match command::parse(line)? {
            Parsed::Help(text) => return Ok(CommandOutput::Message(text)),
            Parsed::Command(command) => command,
        };
        match command.domain {
            Domain::Engine(EngineOp::Status) => Ok(self.engine_status()),
            Domain::VmManage(op) => self.vm_manage(op),
            Domain::Packager(op) => self.packager(op).await,
            Domain::Conns(op) => self.conns(op, progress).await,
            Domain::Challenges(op) => self.challenges(op, progress).await,
            Domain::Experiment(op) => self.experiment(op, progress).await,
        }
    }

    fn vm_manage(&self, op: VmManageOp) -> Result<CommandOutput> {
        match op {
            VmManageOp::Vmstatus { vm_name } => {
                let info = self
                    .hypervisor
                    .vm_info(&vm_name)
                    .unwrap_or_else(|| VmInfo::missing(&vm_name));
                Ok(CommandOutput::status_of(&info))
            }
            VmManageOp::Mgrstatus => Ok(CommandOutput::status_of(&self.hypervisor.manager_status())),
            VmManageOp::Refresh { vm_name } => {
                if vm_name == "all" {
                    self.hypervisor.refresh_all()?;
                } else {
                    self.hypervisor.refresh_vm(&vm_name)?;
                }
                Ok(CommandOutput::message(format!("Refresh requested for {vm_name}")))
            }
        }
    }

    async fn packager(&self, op: PackagerOp) -> Result<CommandOutput> {
        match op {
            PackagerOp::Status => Ok(CommandOutput::status_of(&self.packages.status())),
            PackagerOp::Import { file } => {
                let name = self.packages.import(Path::new(&file)).await?;
                Ok(CommandOutput::message(name))
            }
            PackagerOp::Export { name, path } => {
                let archive = self.packages.export(&name, Path::new(&path)).await?;
                Ok(CommandOutput::message(archive.display().to_string()))
            }
        }
    }

    async fn conns(&self, op: ConnsOp, progress: &Progress) -> Result<CommandOutput> {
        let settings = op.display_settings();
        match op {
            ConnsOp::Status => Ok(CommandOutput::status_of(&self.connections.status())),
            ConnsOp::Refresh(broker) => self.connections.refresh(&broker.endpoint()).await,
            ConnsOp::Create {
                configname,
                broker,
                creds_file,
                selector,
                ..
            } => {
                let creds = resolve_creds_file(&creds_file);
                let report = self
                    .connections
                    .create(
                        &configname,
                        &broker.endpoint(),
                        settings.unwrap_or_default(),
                        creds.as_deref(),
                        &selector.selector(),
                        progress,
                    )
                    .await?;
                Ok(CommandOutput::Fleet(report))
            }
            ConnsOp::Remove {
                configname,
                broker,
                creds_file,
                selector,
            } => {
                let creds = resolve_creds_file(&creds_file);
                let report = self
                    .connections
                    .remove(
                        &configname,
                        &broker.endpoint(),
                        creds.as_deref(),
                        &selector.selector(),
                        progress,
                    )
                    .await?;
                Ok(CommandOutput::Fleet(report))
            }
            ConnsOp::Clear(broker) => self.connections.clear(&broker.endpoint()).await,
            ConnsOp::Open {
                configname,
                experimentid,
                selector,
            } => self
                .connections
                .open(&configname, &experimentid, &selector.selector()),
        }
    }

    async fn challenges(&self, op: ChallengesOp, progress: &Progress) -> Result<CommandOutput> {
        match op {
            ChallengesOp::Status => Ok(CommandOutput::status_of(&self.challenges.status())),
            ChallengesOp::Refresh(scoring) => self.challenges.refresh(&scoring.endpoint()).await,
            ChallengesOp::Getstats(scoring) => self.challenges.getstats(&scoring.endpoint()).await,
            ChallengesOp::Create {
                configname,
                scoring,
                creds_file,
                selector,
            } => {
                let creds = resolve_creds_file(&creds_file);
                let report = self
                    .challenges
                    .create(
                        &configname,
                        &scoring.endpoint(),
                        creds.as_deref(),
                        &selector.selector(),
                        progress,
                    )
                    .await?;
                Ok(CommandOutput::Fleet(report))
            }
            ChallengesOp::Remove {
                configname,
                scoring,
                creds_file,
                selector,
            } => {
                let creds = resolve_creds_file(&creds_file);
                let report = self
                    .challenges
                    .remove(
                        &configname,
                        &scoring.endpoint(),
                        creds.as_deref(),
                        &selector.selector(),
                        progress,
                    )
                    .await?;
                Ok(CommandOutput::Fleet(report))
            }
            ChallengesOp::Clear(scoring) => self.challenges.clear(&scoring.endpoint()).await,
            ChallengesOp::Open {
                configname,
                experimentid,
                selector,
            } => self
                .challenges
                .open(&configname, &experimentid, &selector.selector()),
        }
    }

    async fn experiment(&self, op: ExperimentOp, progress: &Progress) -> Result<CommandOutput> {
        let (verb, args) = match op {
            ExperimentOp::Status { configname: None } => {
                return Ok(CommandOutput::status_of(&self.experiments.status()));
            }
            ExperimentOp::Status {
                configname: Some(config),
            }
            | ExperimentOp::Refresh { configname: config } => {
                let report = self.experiments.refresh(&config, progress).await?;
                return Ok(CommandOutput::Fleet(report));
            }
            ExperimentOp::Create(args) => (LifecycleVerb::Create, args),
            ExperimentOp::Start(args) => (LifecycleVerb::Start, args),
            ExperimentOp::Stop(args) => (LifecycleVerb::Stop, args),
            ExperimentOp::Suspend(args) => (LifecycleVerb::Suspend, args),
            ExperimentOp::Pause(args) => (LifecycleVerb::Pause, args),
            ExperimentOp::Snapshot(args) => (LifecycleVerb::Snapshot, args),
            ExperimentOp::Restore(args) => (LifecycleVerb::Restore, args),
            ExperimentOp::Remove(args) => (LifecycleVerb::Remove, args),
            ExperimentOp::Guestcmd(args) => (LifecycleVerb::GuestCmd, args),
            ExperimentOp::Gueststored(args) => (LifecycleVerb::GuestStored, args),
        };
        let report = self
            .experiments
            .run(verb, &args.configname, &args.selector.selector(), progress)
            .await?;
        Ok(CommandOutput::Fleet(report))
    }
}
