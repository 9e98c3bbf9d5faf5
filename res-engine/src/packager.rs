//! Experiment packages: a gzip tar holding `experiment.yaml` and one
//! `vms/<template>.ova` appliance per template.

use std::fs::{self, File};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use res_hypervisor::{Hypervisor, WriteOp};
use tracing::{info, warn};

use crate::completion::{complete_write, PollPolicy};
use crate::error::{EngineError, Result};
use crate::experiment::store::CONFIG_FILE;
use crate::experiment::{ExperimentConfig, ExperimentStore};
use crate::status::{ManagerStatus, StatusTracker};

pub const PACKAGE_EXTENSION: &str = "res";
const VMS_DIR: &str = "vms";

pub struct PackageManager {
    hypervisor: Arc<dyn Hypervisor>,
    store: Arc<ExperimentStore>,
    policy: PollPolicy,
    status: StatusTracker,
}

impl PackageManager {
    pub fn new(hypervisor: Arc<dyn Hypervisor>, store: Arc<ExperimentStore>, policy: PollPolicy) -> Self {
        Self {
            hypervisor,
            store,
            policy,
            status: StatusTracker::new("PackageMgr"),
        }
    }

    /// Unpack `file`, import its appliances and store its configuration.
    /// Returns the experiment name.
    pub async fn import(&self, file: &Path) -> Result<String> {
        let guard = self.status.begin(format!("import {}", file.display()));
        match self.import_inner(file).await {
            Ok(name) => {
                guard.succeed(format!("imported {name}"));
                Ok(name)
            }
            Err(e) => {
                guard.fail(e.to_string());
                Err(e)
            }
        }
    }

    async fn import_inner(&self, file: &Path) -> Result<String> {
        if !file.is_file() {
            return Err(EngineError::ConfigurationNotFound(format!(
                "package not found: {}",
                file.display()
            )));
        }
        info!(package = %file.display(), "Importing experiment package");

        let temp_dir = tempfile::tempdir()?;
        let (source, destination) = (file.to_path_buf(), temp_dir.path().to_path_buf());
        blocking(move || unpack(&source, &destination)).await?;

        let config_path = temp_dir.path().join(CONFIG_FILE);
        if !config_path.is_file() {
            return Err(EngineError::Config(format!(
                "invalid package {}: {CONFIG_FILE} not found",
                file.display()
            )));
        }
        let config = ExperimentConfig::from_yaml(&fs::read_to_string(&config_path)?)?;

        for appliance in appliances(&temp_dir.path().join(VMS_DIR))? {
            let vm = appliance
                .file_stem()
                .map(|s| s.to_string_lossy().into_owned())
                .unwrap_or_default();
            info!(vm = %vm, "Importing appliance");
            complete_write(self.hypervisor.as_ref(), &vm, &WriteOp::Import(appliance), &self.policy).await?;
        }

        if self.store.exists(&config.name) {
            warn!(config = %config.name, "Replacing existing experiment configuration");
        }
        self.store.save(&config)?;
        Ok(config.name)
    }

    /// Export every template of `name` and pack `<path>/<name>.res`.
    /// Returns the archive path.
    pub async fn export(&self, name: &str, path: &Path) -> Result<PathBuf> {
        let guard = self.status.begin(format!("export {name}"));
        match self.export_inner(name, path).await {
            Ok(archive) => {
                guard.succeed(format!("exported {}", archive.display()));
                Ok(archive)
            }
            Err(e) => {
                guard.fail(e.to_string());
                Err(e)
            }
        }
    }

    async fn export_inner(&self, name: &str, path: &Path) -> Result<PathBuf> {
        let config = self.store.load(name)?;
        let staging = tempfile::tempdir()?;
        let vms_dir = staging.path().join(VMS_DIR);
        fs::create_dir_all(&vms_dir)?;

        for template in config.templates() {
            let destination = vms_dir.join(format!("{}.ova", template.name));
            info!(vm = %template.name, "Exporting appliance");
            complete_write(
                self.hypervisor.as_ref(),
                &template.name,
                &WriteOp::Export(destination),
                &self.policy,
            )
            .await?;
        }
        fs::write(staging.path().join(CONFIG_FILE), config.to_yaml()?)?;

        fs::create_dir_all(path)?;
        let archive = path.join(format!("{}.{PACKAGE_EXTENSION}", config.name));
        let (source, destination) = (staging.path().to_path_buf(), archive.clone());
        blocking(move || pack(&source, &destination)).await?;

        info!(archive = %archive.display(), "Experiment package written");
        Ok(archive)
    }

    pub fn status(&self) -> ManagerStatus {
        self.status.snapshot(0)
    }
}

/// Run archive work off the async workers; packages hold whole appliances.
async fn blocking<T, F>(work: F) -> Result<T>
where
    F: FnOnce() -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(work)
        .await
        .map_err(|e| EngineError::BackendFault(format!("archive task failed: {e}")))?
}

fn unpack(file: &Path, destination: &Path) -> Result<()> {
    let mut archive = tar::Archive::new(GzDecoder::new(File::open(file)?));
    archive
        .unpack(destination)
        .map_err(|e| EngineError::Config(format!("cannot unpack {}: {e}", file.display())))
}

fn pack(staging: &Path, archive: &Path) -> Result<()> {
    let encoder = GzEncoder::new(File::create(archive)?, Compression::default());
    let mut builder = tar::Builder::new(encoder);
    builder.append_dir_all(".", staging)?;
    builder.into_inner()?.finish()?;
    Ok(())
}

/// `.ova` files directly under `dir`, sorted by name. A missing directory holds none.
fn appliances(dir: &Path) -> Result<Vec<PathBuf>> {
    if !dir.is_dir() {
        return Ok(Vec::new());
    }
    let mut found: Vec<PathBuf> = fs::read_dir(dir)?
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|p| p.extension().is_some_and(|ext| ext == "ova"))
        .collect();
    found.sort();
    Ok(found)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::experiment::tests::MIXED;
    use crate::status::OperationOutcome;
    use res_hypervisor::mock::MockHypervisor;
    use res_hypervisor::{VmState, WriteKind};
    use std::time::Duration;
    use tempfile::TempDir;

    fn policy() -> PollPolicy {
        PollPolicy {
            interval: Duration::from_millis(1),
            deadline: None,
        }
    }

    fn manager(mock: Arc<MockHypervisor>, root: &Path) -> PackageManager {
        PackageManager::new(mock, Arc::new(ExperimentStore::new(root)), policy())
    }

    #[tokio::test]
    async fn test_export_then_import_on_fresh_host() {
        let work = TempDir::new().unwrap();
        let source_store = work.path().join("source");
        let target_store = work.path().join("target");
        let out = work.path().join("out");

        let source = Arc::new(
            MockHypervisor::new()
                .with_vm("kali", VmState::Stopped)
                .with_vm("target", VmState::Stopped)
                .with_vm("server", VmState::Stopped),
        );
        let exporter = manager(source.clone(), &source_store);
        exporter
            .store
            .save(&ExperimentConfig::from_yaml(MIXED).unwrap())
            .unwrap();

        let archive = exporter.export("mixed", &out).await.unwrap();
        assert_eq!(archive, out.join("mixed.res"));
        assert!(archive.is_file());

        let fresh = Arc::new(MockHypervisor::new());
        let importer = manager(fresh.clone(), &target_store);
        let name = importer.import(&archive).await.unwrap();

        assert_eq!(name, "mixed");
        assert_eq!(importer.store.load("mixed").unwrap().set_count(), 3);
        let imported: Vec<String> = fresh
            .calls()
            .into_iter()
            .filter(|c| c.kind == WriteKind::Import)
            .map(|c| c.vm)
            .collect();
        assert_eq!(imported, vec!["kali", "server", "target"]);
        assert_eq!(fresh.state_of("server"), Some(VmState::Stopped));
    }

    #[tokio::test]
    async fn test_export_unknown_experiment() {
        let work = TempDir::new().unwrap();
        let packager = manager(Arc::new(MockHypervisor::new()), work.path());
        let error = packager.export("ghost", work.path()).await.unwrap_err();
        assert_eq!(error.kind(), ErrorKind::ConfigurationNotFound);
        let last = packager.status().last_operation.unwrap();
        assert_eq!(last.outcome, OperationOutcome::Failed);
    }

    #[tokio::test]
    async fn test_import_rejects_archive_without_config() {
        let work = TempDir::new().unwrap();
        let bogus = work.path().join("bogus.res");
        {
            let encoder = GzEncoder::new(File::create(&bogus).unwrap(), Compression::default());
            let mut builder = tar::Builder::new(encoder);
            let empty = work.path().join("empty");
            fs::create_dir_all(&empty).unwrap();
            builder.append_dir_all(".", &empty).unwrap();
            builder.into_inner().unwrap().finish().unwrap();
        }
        let packager = manager(Arc::new(MockHypervisor::new()), &work.path().join("store"));
        let error = packager.import(&bogus).await.unwrap_err();
        assert!(error.to_string().contains(CONFIG_FILE));
    }

    #[tokio::test(flavor = "current_thread")]
    async fn test_archive_work_runs_beside_other_tasks() {
        let work = TempDir::new().unwrap();
        let mock = Arc::new(MockHypervisor::new().with_vm("win10", VmState::Stopped));
        let packager = manager(mock, &work.path().join("store"));
        packager
            .store
            .save(&ExperimentConfig::from_yaml("name: solo\ngroups:\n  - templates:\n      - name: win10\n").unwrap())
            .unwrap();

        let ticker = tokio::spawn(async { tokio::task::yield_now().await });
        let archive = packager.export("solo", &work.path().join("out")).await.unwrap();
        ticker.await.unwrap();
        assert!(archive.is_file());

        let corrupt = work.path().join("corrupt.res");
        fs::write(&corrupt, b"not a gzip stream").unwrap();
        let error = packager.import(&corrupt).await.unwrap_err();
        assert!(error.to_string().contains("cannot unpack"), "{error}");
    }
}
