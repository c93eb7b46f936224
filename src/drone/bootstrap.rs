//! First-run registration.

use std::path::Path;

use crate::coordinator::{Coordinator, CoordinatorClient};
use crate::credentials::WorkerIdentity;
use crate::error::Result;

/// Identity the drone runs under.
#[derive(Debug)]
pub struct Bootstrap {
    pub identity: WorkerIdentity,
    /// Whether the identity was created by this call
    pub registered: bool,
}

/// Load the credential file, registering a new worker if there is none.
///
/// A newly registered identity is saved before returning, so a crash later in
/// startup does not register the drone twice.
pub async fn load_or_register(
    client: &CoordinatorClient,
    credentials: &Path,
    alias: &str,
) -> Result<Bootstrap> {
    if let Some(identity) = WorkerIdentity::load(credentials)? {
        tracing::info!(
            worker_id = identity.id,
            alias = %identity.alias,
            path = %credentials.display(),
            "Loaded worker credentials"
        );
        return Ok(Bootstrap {
            identity,
            registered: false,
        });
    }

    tracing::info!(path = %credentials.display(), alias, "No credentials found, registering");
    let identity = client.register_worker(alias).await?;
    identity.save(credentials)?;

    Ok(Bootstrap {
        identity,
        registered: true,
    })
}

/// Ask for assign access to every visible project. Returns the ids of the
/// projects for which the request was accepted.
pub async fn request_access_to_all(coordinator: &dyn Coordinator) -> Result<Vec<i64>> {
    let projects = coordinator.list_projects().await?;
    let mut granted = Vec::with_capacity(projects.len());

    for project in &projects {
        match coordinator.request_project_access(project.id, true, false).await {
            Ok(status) if status.is_success() => {
                tracing::info!(project_id = project.id, project = %project.name, "Requested project access");
                granted.push(project.id);
            }
            Ok(status) => {
                tracing::warn!(project_id = project.id, status = %status, "Access request refused");
            }
            Err(e) => {
                tracing::warn!(project_id = project.id, error = %e, "Access request failed");
            }
        }
    }

    Ok(granted)
}
