use thiserror::Error;
use uuid::Uuid;

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("Database error")]
    Database(#[from] sqlx::Error),

    #[error("Migration error")]
    Migration(#[from] sqlx::migrate::MigrateError),

    #[error("IO error")]
    Io(#[from] std::io::Error),

    #[error("Invalid recurrence rule: {0}")]
    InvalidRule(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Instance {0} is cancelled and cannot be edited")]
    AlreadyCancelled(Uuid),

    #[error("No fields provided for update")]
    NoFieldsProvided,

    #[error("Materialization run failed for organization {organization_id}: {detail}")]
    RunFailed { organization_id: Uuid, detail: String },
}

impl EngineError {
    pub fn not_found(what: impl std::fmt::Display) -> Self {
        EngineError::NotFound(what.to_string())
    }
}
