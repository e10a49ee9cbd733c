use thiserror::Error;

use crate::auth::AuthError;
use crate::config::ConfigError;
use crate::environment::EnvError;
use crate::exec::ExecError;
use crate::plan::PlanError;
use crate::store::StoreError;
use crate::tracker::TrackerError;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Plan error: {0}")]
    Plan(#[from] PlanError),

    #[error("Environment error: {0}")]
    Environment(#[from] EnvError),

    #[error("{0}")]
    Execution(#[from] ExecError),

    #[error("Tracker error: {0}")]
    Tracker(#[from] TrackerError),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Auth error: {0}")]
    Auth(#[from] AuthError),

    #[error("Config error: {0}")]
    Config(#[from] ConfigError),
}

impl From<tonic::Status> for Error {
    fn from(status: tonic::Status) -> Self {
        Error::Store(status.into())
    }
}

pub type Result<T> = std::result::Result<T, Error>;
