use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;

use tokio::process::Command;

use crate::config::ExecutionConfig;
use crate::coordinator::Coordinator;
use crate::error::DeployError;
use crate::model::Project;

/// A project checkout ready to run tasks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Deployment {
    pub version: String,
    /// Absolute path of the checkout root
    pub path: PathBuf,
    /// Per-worker project secret, passed to recipes
    pub secret: String,
}

/// Per-context cache of project checkouts.
///
/// A project is (re)deployed the first time it is seen and whenever a task
/// arrives with a different `project.version` than the cached one. The
/// checkout lives at `{work_dir}/{context}/{project_id}_{version}`, so
/// redeploying the same version always lands in the same directory.
///
/// A record is only stored once every deployment step succeeded; a failed
/// deployment is attempted again for the next task of that project.
pub struct DeploymentCache {
    context_name: String,
    config: ExecutionConfig,
    coordinator: Arc<dyn Coordinator>,
    deployments: HashMap<i64, Deployment>,
}

impl DeploymentCache {
    pub fn new(
        context_name: impl Into<String>,
        config: ExecutionConfig,
        coordinator: Arc<dyn Coordinator>,
    ) -> Self {
        Self {
            context_name: context_name.into(),
            config,
            coordinator,
            deployments: HashMap::new(),
        }
    }

    pub fn context_name(&self) -> &str {
        &self.context_name
    }

    /// Directory a project version is deployed to.
    pub fn project_path(&self, project: &Project) -> PathBuf {
        self.config
            .work_dir
            .join(&self.context_name)
            .join(format!("{}_{}", project.id, path_component(&project.version)))
    }

    /// Cached deployment of a project, whatever its version.
    pub fn get(&self, project_id: i64) -> Option<&Deployment> {
        self.deployments.get(&project_id)
    }

    /// Make sure `project` is deployed at its current version.
    pub async fn ensure(&mut self, project: &Project) -> Result<Deployment, DeployError> {
        if let Some(deployment) = self
            .deployments
            .get(&project.id)
            .filter(|d| d.version == project.version)
        {
            return Ok(deployment.clone());
        }

        let deployment = self.deploy(project).await?;
        self.deployments.insert(project.id, deployment.clone());
        Ok(deployment)
    }

    async fn deploy(&self, project: &Project) -> Result<Deployment, DeployError> {
        let secret = self
            .coordinator
            .fetch_project_secret(project.id)
            .await
            .map_err(|source| DeployError::Secret {
                project_id: project.id,
                source,
            })?;

        let path = self.project_path(project);
        tracing::info!(
            context = %self.context_name,
            project_id = project.id,
            project = %project.name,
            version = %project.version,
            path = %path.display(),
            "Deploying project"
        );

        match tokio::fs::remove_dir_all(&path).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(source) => return Err(DeployError::Io { path, source }),
        }
        tokio::fs::create_dir_all(&path)
            .await
            .map_err(|source| DeployError::Io {
                path: path.clone(),
                source,
            })?;
        let path = tokio::fs::canonicalize(&path)
            .await
            .map_err(|source| DeployError::Io {
                path: path.clone(),
                source,
            })?;

        let mut clone = Command::new("git");
        clone
            .args(["clone", "--quiet"])
            .arg(&project.clone_url)
            .arg(&path);
        run_checked(clone, "git clone").await?;

        if !project.version.is_empty() {
            let mut checkout = Command::new("git");
            checkout
                .args(["checkout", "--quiet", &project.version])
                .current_dir(&path);
            run_checked(checkout, "git checkout").await?;
        }

        self.run_setup(&path).await?;

        Ok(Deployment {
            version: project.version.clone(),
            path,
            secret,
        })
    }

    /// Run the optional `setup` executable at the checkout root.
    async fn run_setup(&self, path: &Path) -> Result<(), DeployError> {
        let setup = path.join("setup");
        if !is_file(&setup).await {
            return Ok(());
        }

        let mut command = Command::new(&setup);
        command.current_dir(path);
        match run_checked(command, "setup").await {
            Err(DeployError::CommandFailed { status, stderr, .. })
                if !self.config.fail_on_setup_error =>
            {
                tracing::warn!(
                    context = %self.context_name,
                    path = %path.display(),
                    status = %status,
                    stderr = %stderr,
                    "Setup failed, continuing"
                );
                Ok(())
            }
            other => other,
        }
    }
}

/// Run a command to completion and fail unless it exits successfully.
async fn run_checked(mut command: Command, label: &str) -> Result<(), DeployError> {
    let output = command
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .output()
        .await
        .map_err(|source| DeployError::Spawn {
            command: label.to_string(),
            source,
        })?;

    if output.status.success() {
        tracing::debug!(command = label, "Command succeeded");
        Ok(())
    } else {
        Err(DeployError::CommandFailed {
            command: label.to_string(),
            status: output.status.to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        })
    }
}

pub(crate) async fn is_file(path: &Path) -> bool {
    tokio::fs::metadata(path)
        .await
        .map(|m| m.is_file())
        .unwrap_or(false)
}

/// Make a version usable as part of a single path component.
fn path_component(version: &str) -> String {
    version
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_') {
                c
            } else {
                '_'
            }
        })
        .collect::<String>()
        .replace("..", "__")
}
