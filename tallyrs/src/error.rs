use thiserror::Error;

pub type Result<T> = std::result::Result<T, TallyError>;

#[derive(Debug, Error)]
pub enum TallyError {
    #[error("unknown reference: {}", .references.join(", "))]
    UnknownReference { references: Vec<String> },
    #[error("circular dependency: {}", .cycle.join(" -> "))]
    CircularDependency { cycle: Vec<String> },
    #[error("syntax error: {0}")]
    Syntax(String),
    #[error("forbidden construct: {0}")]
    ForbiddenConstruct(String),
    #[error("schema validation error: {0}")]
    SchemaValidation(String),
    #[error("routing infeasible: {0}")]
    RoutingInfeasible(String),
    #[error("warehouse execution error: {0}")]
    WarehouseExecution(String),
    #[error("refresh already in progress for {0}")]
    RefreshInProgress(String),
    #[error("config error: {0}")]
    Config(String),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("yaml parse error: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    #[cfg(feature = "duckdb")]
    #[error("duckdb error: {0}")]
    DuckDb(#[from] duckdb::Error),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl TallyError {
    pub fn unknown(reference: impl Into<String>) -> Self {
        TallyError::UnknownReference {
            references: vec![reference.into()],
        }
    }

    /// Stable name of the error kind, for callers that map errors onto their own surface.
    pub fn kind(&self) -> &'static str {
        match self {
            TallyError::UnknownReference { .. } => "UnknownReferenceError",
            TallyError::CircularDependency { .. } => "CircularDependencyError",
            TallyError::Syntax(_) => "SyntaxError",
            TallyError::ForbiddenConstruct(_) => "ForbiddenConstructError",
            TallyError::SchemaValidation(_) => "SchemaValidationError",
            TallyError::RoutingInfeasible(_) => "RoutingInfeasibleError",
            TallyError::WarehouseExecution(_) => "WarehouseExecutionError",
            TallyError::RefreshInProgress(_) => "RefreshInProgressError",
            TallyError::Config(_) => "ConfigError",
            TallyError::Io(_) | TallyError::Yaml(_) | TallyError::Json(_) => "PersistenceError",
            #[cfg(feature = "duckdb")]
            TallyError::DuckDb(_) => "WarehouseExecutionError",
            TallyError::Other(_) => "InternalError",
        }
    }

    /// Collapse any failure raised while talking to the warehouse into `WarehouseExecution`.
    pub(crate) fn into_warehouse(self) -> Self {
        match self {
            TallyError::WarehouseExecution(_) => self,
            other => TallyError::WarehouseExecution(other.to_string()),
        }
    }
}
