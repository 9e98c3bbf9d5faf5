//! User-to-instance assignment.
//!
//! Each credential pair is handed the instances of one set. Credentials come
//! from a credentials file when one is known for the experiment, otherwise
//! from per-set defaults.

use std::collections::{HashMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, PoisonError, RwLock};

use serde::Serialize;
use tracing::{debug, info, warn};

use crate::error::Result;
use crate::experiment::{ExperimentConfig, ExperimentStore, Instance};

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl Credentials {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
        }
    }

    /// Default credentials for `set` when no credentials file is known.
    pub fn default_for(config: &str, set: u32) -> Self {
        let name = format!("{config}-user{set}");
        Self::new(name.clone(), name)
    }
}

/// Broker-facing details of one assigned instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SessionMetadata {
    pub set: u32,
    pub template: String,
    pub vrdp_port: Option<u16>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AssignedInstance {
    pub clone: String,
    pub session: SessionMetadata,
}

impl From<&Instance> for AssignedInstance {
    fn from(instance: &Instance) -> Self {
        Self {
            clone: instance.name.clone(),
            session: SessionMetadata {
                set: instance.set,
                template: instance.template.clone(),
                vrdp_port: instance.vrdp_port,
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UserAssignment {
    pub username: String,
    pub password: String,
    /// Never empty.
    pub instances: Vec<AssignedInstance>,
}

/// Every user's assignment for one experiment, ordered by set.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize)]
pub struct UserConnections {
    pub config: String,
    pub users: Vec<UserAssignment>,
}

impl UserConnections {
    pub fn lookup(&self, username: &str, password: &str) -> Option<&UserAssignment> {
        self.users
            .iter()
            .find(|user| user.username == username && user.password == password)
    }

    pub fn len(&self) -> usize {
        self.users.len()
    }

    pub fn is_empty(&self) -> bool {
        self.users.is_empty()
    }

    /// Build the assignment: the i-th credential pair gets the instances of set i.
    pub fn build(config: &ExperimentConfig, credentials: Option<&[Credentials]>) -> Self {
        let instances = config.instances();
        let users = (1..=config.set_count())
            .filter_map(|set| {
                let credentials = match credentials {
                    Some(list) => list.get(set as usize - 1)?.clone(),
                    None => Credentials::default_for(&config.name, set),
                };
                let assigned: Vec<AssignedInstance> = instances
                    .iter()
                    .filter(|instance| instance.set == set)
                    .map(AssignedInstance::from)
                    .collect();
                (!assigned.is_empty()).then(|| UserAssignment {
                    username: credentials.username,
                    password: credentials.password,
                    instances: assigned,
                })
            })
            .collect();
        Self {
            config: config.name.clone(),
            users,
        }
    }
}

/// Parse a credentials file: one `user password` or `user,password` pair per
/// line. Blank lines and `#` comments are skipped. A pair seen before is
/// skipped too, so each pair owns at most one set.
pub fn parse_credentials(content: &str) -> Vec<Credentials> {
    let mut seen = HashSet::new();
    content
        .lines()
        .enumerate()
        .filter_map(|(number, line)| {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                return None;
            }
            let mut fields = line
                .split(|c: char| c == ',' || c.is_whitespace())
                .filter(|field| !field.is_empty());
            match (fields.next(), fields.next()) {
                (Some(user), Some(pass)) if !seen.insert((user, pass)) => {
                    warn!(line = number + 1, user, "Skipping repeated credentials");
                    None
                }
                (Some(user), Some(pass)) => Some(Credentials::new(user, pass)),
                _ => {
                    warn!(line = number + 1, "Skipping malformed credentials line");
                    None
                }
            }
        })
        .collect()
}

/// Interpret a `creds_file` argument. `None` (the literal word) or a path that
/// does not exist means no credentials file.
pub fn resolve_creds_file(raw: &str) -> Option<PathBuf> {
    let raw = raw.trim();
    if raw.is_empty() || raw == "None" {
        return None;
    }
    let path = Path::new(raw);
    if !path.exists() {
        debug!(path = %raw, "Credentials file does not exist; using defaults");
        return None;
    }
    Some(fs::canonicalize(path).unwrap_or_else(|_| path.to_path_buf()))
}

pub struct UserPool {
    store: Arc<ExperimentStore>,
    sources: RwLock<HashMap<String, PathBuf>>,
    assignments: RwLock<HashMap<String, Arc<UserConnections>>>,
}

impl UserPool {
    pub fn new(store: Arc<ExperimentStore>) -> Self {
        Self {
            store,
            sources: RwLock::new(HashMap::new()),
            assignments: RwLock::new(HashMap::new()),
        }
    }

    /// Make `path` the credential source for `config` from now on.
    pub fn register_creds_file(&self, config: &str, path: &Path) {
        info!(config, path = %path.display(), "Registered credentials file");
        self.sources
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(config.to_string(), path.to_path_buf());
    }

    pub fn creds_file(&self, config: &str) -> Option<PathBuf> {
        self.sources
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(config)
            .cloned()
    }

    /// Generate (or regenerate) the assignment for `config`.
    ///
    /// `creds_file` overrides the registered source for this call only.
    /// Calling twice with no change in between yields equal results.
    pub fn generate_users_conns(
        &self,
        config: &str,
        creds_file: Option<&Path>,
    ) -> Result<Arc<UserConnections>> {
        let experiment = self.store.load(config)?;
        let source = creds_file
            .map(Path::to_path_buf)
            .or_else(|| self.creds_file(config));

        let credentials = match &source {
            Some(path) => Some(parse_credentials(&fs::read_to_string(path)?)),
            None => None,
        };
        if let Some(list) = &credentials {
            let sets = experiment.set_count() as usize;
            if list.len() > sets {
                warn!(
                    config,
                    pairs = list.len(),
                    sets,
                    "More credential pairs than sets; extra pairs get no instances"
                );
            }
        }

        let connections = Arc::new(UserConnections::build(&experiment, credentials.as_deref()));
        debug!(config, users = connections.len(), "Generated user assignment");
        self.assignments
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(config.to_string(), Arc::clone(&connections));
        Ok(connections)
    }

    /// Last generated assignment, if any.
    pub fn current(&self, config: &str) -> Option<Arc<UserConnections>> {
        self.assignments
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(config)
            .cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::EngineError;
    use crate::experiment::tests::{LAB1, MIXED};
    use tempfile::TempDir;

    fn pool(configs: &[&str]) -> (TempDir, UserPool) {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(ExperimentStore::new(dir.path()));
        for yaml in configs {
            store.save(&ExperimentConfig::from_yaml(yaml).unwrap()).unwrap();
        }
        (dir, UserPool::new(store))
    }

    #[test]
    fn test_parse_credentials_formats() {
        let parsed = parse_credentials("# users\nalice secret\n\nbob,hunter2\ncarol\n  dave \t pw \n");
        assert_eq!(
            parsed,
            vec![
                Credentials::new("alice", "secret"),
                Credentials::new("bob", "hunter2"),
                Credentials::new("dave", "pw"),
            ]
        );
    }

    #[test]
    fn test_default_credentials_one_user_per_set() {
        let (_dir, pool) = pool(&[MIXED]);
        let connections = pool.generate_users_conns("mixed", None).unwrap();

        assert_eq!(connections.len(), 3);
        let user = connections.lookup("mixed-user2", "mixed-user2").unwrap();
        let clones: Vec<&str> = user.instances.iter().map(|i| i.clone.as_str()).collect();
        assert_eq!(clones, vec!["mixed-kali-2", "mixed-target-2"]);
    }

    #[test]
    fn test_creds_file_assigns_distinct_instances() {
        let (dir, pool) = pool(&[LAB1]);
        let creds = dir.path().join("creds.txt");
        fs::write(&creds, "alice secret\nbob hunter2\nextra nope\n").unwrap();

        let connections = pool.generate_users_conns("lab1", Some(&creds)).unwrap();
        assert_eq!(connections.len(), 2);
        assert_eq!(
            connections.lookup("alice", "secret").unwrap().instances[0].clone,
            "lab1-win10-1"
        );
        assert_eq!(
            connections.lookup("bob", "hunter2").unwrap().instances[0].clone,
            "lab1-win10-2"
        );
        assert!(connections.lookup("extra", "nope").is_none());
        assert!(connections.lookup("alice", "wrong").is_none());
    }

    #[test]
    fn test_repeated_pair_gets_one_set() {
        let (dir, pool) = pool(&[LAB1]);
        let creds = dir.path().join("creds.txt");
        fs::write(&creds, "alice secret\nalice secret\nbob hunter2\n").unwrap();

        let connections = pool.generate_users_conns("lab1", Some(&creds)).unwrap();
        let owners: Vec<(&str, &str)> = connections
            .users
            .iter()
            .flat_map(|u| u.instances.iter().map(move |i| (u.username.as_str(), i.clone.as_str())))
            .collect();
        assert_eq!(owners, vec![("alice", "lab1-win10-1"), ("bob", "lab1-win10-2")]);
    }

    #[test]
    fn test_registered_file_is_reused() {
        let (dir, pool) = pool(&[LAB1]);
        let creds = dir.path().join("creds.txt");
        fs::write(&creds, "alice secret\n").unwrap();
        pool.register_creds_file("lab1", &creds);

        let connections = pool.generate_users_conns("lab1", None).unwrap();
        assert!(connections.lookup("alice", "secret").is_some());
        assert_eq!(pool.current("lab1").unwrap(), connections);
    }

    #[test]
    fn test_generation_is_idempotent() {
        let (_dir, pool) = pool(&[LAB1]);
        let first = pool.generate_users_conns("lab1", None).unwrap();
        let second = pool.generate_users_conns("lab1", None).unwrap();
        assert_eq!(*first, *second);
    }

    #[test]
    fn test_unknown_config() {
        let (_dir, pool) = pool(&[LAB1]);
        assert!(matches!(
            pool.generate_users_conns("ghost", None),
            Err(EngineError::ConfigurationNotFound(_))
        ));
    }

    #[test]
    fn test_resolve_creds_file() {
        assert_eq!(resolve_creds_file("None"), None);
        assert_eq!(resolve_creds_file("/no/such/creds.txt"), None);
        let file = tempfile::NamedTempFile::new().unwrap();
        assert!(resolve_creds_file(file.path().to_str().unwrap()).is_some());
    }

    #[test]
    fn test_concurrent_generation_for_different_configs() {
        let (_dir, pool) = pool(&[LAB1, MIXED]);
        let pool = Arc::new(pool);
        let handles: Vec<_> = ["lab1", "mixed", "lab1", "mixed"]
            .into_iter()
            .map(|name| {
                let pool = Arc::clone(&pool);
                std::thread::spawn(move || pool.generate_users_conns(name, None).unwrap().len())
            })
            .collect();
        let sizes: Vec<usize> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        assert_eq!(sizes, vec![2, 3, 2, 3]);
    }
}
