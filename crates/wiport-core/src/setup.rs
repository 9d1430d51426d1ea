//! One-shot destination bootstrap: project get-or-create, then the
//! classification caches and link types every replay worker shares.

use std::time::{Duration, Instant};

use tracing::{error, info, warn};

use crate::classification::{ClassificationError, ClassificationResolver};
use crate::config::MigrationConfig;
use crate::destination::{
    Destination, DestinationError, OperationId, OperationState, ProjectAdmin, ProjectInfo,
    ProjectRequest,
};
use crate::error::ErrorCode;
use crate::links::LinkResolver;

#[derive(Debug, thiserror::Error)]
pub enum SetupError {
    #[error("failed to look up project '{project}': {source}")]
    Lookup {
        project: String,
        #[source]
        source: DestinationError,
    },

    #[error("project '{project}' does not exist")]
    ProjectMissing { project: String },

    #[error("project creation operation failed: {message}")]
    CreationFailed { project: String, message: String },

    #[error("operation did not complete in {} ms", .waited.as_millis())]
    TimedOut { project: String, waited: Duration },

    #[error(transparent)]
    Classification(#[from] ClassificationError),

    #[error("failed to load link types: {0}")]
    LinkTypes(#[source] DestinationError),
}

impl SetupError {
    #[must_use]
    pub const fn code(&self) -> ErrorCode {
        match self {
            Self::Lookup { .. } | Self::ProjectMissing { .. } | Self::CreationFailed { .. } => {
                ErrorCode::ProjectUnavailable
            }
            Self::TimedOut { .. } => ErrorCode::SetupTimedOut,
            Self::Classification(err) => err.code(),
            Self::LinkTypes(err) => err.code(),
        }
    }
}

/// Shared state produced by [`bootstrap`].
#[derive(Debug)]
pub struct Bootstrap {
    pub project: ProjectInfo,
    pub classifications: ClassificationResolver,
    pub links: LinkResolver,
}

/// Fetch the configured project, creating it when it is missing and
/// `setup.create_project_if_missing` is set.
///
/// # Errors
///
/// Returns [`SetupError`] when the project is missing and may not be
/// created, when creation fails, or when it does not finish within
/// `setup.max_wait_ms`.
pub fn ensure_project<A: ProjectAdmin + ?Sized>(
    admin: &A,
    config: &MigrationConfig,
) -> Result<ProjectInfo, SetupError> {
    let name = &config.project;
    info!("Retrieving project info for '{name}'...");

    let existing = admin.get_project(name).map_err(|source| {
        error!("Failed to get project '{name}': {source}");
        SetupError::Lookup {
            project: name.clone(),
            source,
        }
    })?;
    if let Some(project) = existing {
        return Ok(project);
    }

    warn!("Project '{name}' does not exist.");
    if !config.setup.create_project_if_missing {
        return Err(SetupError::ProjectMissing {
            project: name.clone(),
        });
    }

    info!("Creating project '{name}'.");
    let request = ProjectRequest {
        name: name.clone(),
        description: format!("{} project for migration", config.process_template),
        process_template: config.process_template.clone(),
        version_control: "Git".to_string(),
    };
    let lookup_failed = |source: DestinationError| SetupError::Lookup {
        project: name.clone(),
        source,
    };

    info!("Queuing project creation...");
    let operation = admin.queue_create_project(&request).map_err(lookup_failed)?;
    match wait_for_operation(
        admin,
        operation,
        config.setup.poll_interval(),
        config.setup.max_wait(),
    ) {
        Ok(OperationState::Succeeded) => {}
        Ok(OperationState::Failed(message)) => {
            error!("Project creation operation failed: {message}");
            return Err(SetupError::CreationFailed {
                project: name.clone(),
                message,
            });
        }
        Ok(OperationState::InProgress) | Err(None) => {
            let waited = config.setup.max_wait();
            error!("Operation did not complete in {} ms.", waited.as_millis());
            return Err(SetupError::TimedOut {
                project: name.clone(),
                waited,
            });
        }
        Err(Some(source)) => return Err(lookup_failed(source)),
    }

    let project = admin
        .get_project(name)
        .map_err(lookup_failed)?
        .ok_or_else(|| SetupError::ProjectMissing {
            project: name.clone(),
        })?;
    info!("Project created (ID: {})", project.id);
    Ok(project)
}

/// Poll `operation` every `interval` until it completes or `max_wait`
/// elapses.
///
/// Returns the final state, `Err(None)` on timeout, or `Err(Some(_))` if
/// polling itself fails.
pub fn wait_for_operation<A: ProjectAdmin + ?Sized>(
    admin: &A,
    operation: OperationId,
    interval: Duration,
    max_wait: Duration,
) -> Result<OperationState, Option<DestinationError>> {
    let started = Instant::now();
    let mut checks = 0_u32;

    loop {
        info!(" Checking status ({checks})... ");
        checks += 1;
        let state = admin.operation(operation).map_err(Some)?;
        if state.is_completed() {
            return Ok(state);
        }
        if started.elapsed() >= max_wait {
            return Err(None);
        }
        info!("   Pausing {} ms...", interval.as_millis());
        std::thread::sleep(interval.min(max_wait.saturating_sub(started.elapsed())));
    }
}

/// Ensure the project, then build the resolver caches and load link types.
///
/// # Errors
///
/// Returns the first failing setup step.
pub fn bootstrap<D>(destination: &D, config: &MigrationConfig) -> Result<Bootstrap, SetupError>
where
    D: Destination + ProjectAdmin,
{
    let project = ensure_project(destination, config)?;
    let classifications = ClassificationResolver::initialize(destination)?;
    let links = LinkResolver::load(destination, config.ignore_failed_links)
        .map_err(SetupError::LinkTypes)?;
    Ok(Bootstrap {
        project,
        classifications,
        links,
    })
}
