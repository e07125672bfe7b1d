//! Derived metrics, rollup tables and query routing for analytical warehouses.
//!
//! A [`SchemaRegistry`] holds the metrics and dimensions of one table. The
//! formula compiler turns calculated metrics into dialect SQL, the optimizer
//! materializes multi-column distinct identities as surrogate key columns, and
//! the router picks the cheapest table (rollup, optimized source or raw) that
//! can answer a query.

pub mod backends;
pub mod config;
pub mod dialect;
pub mod error;
pub mod executor;
pub mod expression;
pub mod formula;
pub mod jobs;
pub mod optimizer;
pub mod reference;
pub mod registry;
pub mod rollup;
pub mod router;
pub mod schema;
pub mod schema_cache;
pub mod service;
pub mod sql_ast;
pub mod store;
pub mod telemetry;
pub mod validation;

pub use backends::{TableStats, Warehouse};
pub use config::TallyConfig;
pub use dialect::{BigQueryDialect, Dialect, DuckDbDialect};
pub use error::{Result, TallyError};
pub use executor::QueryResult;
pub use expression::{ExpressionCompiler, ValidatedExpression};
pub use formula::{cascade_update_dependents, CascadeOutcome, CompiledFormula, FormulaCompiler};
pub use jobs::{BuildState, BuildStatus, RefreshJobs};
pub use optimizer::{
    analyze_composite_keys, generate_key_column_name, CompositeKeyMapping, OptimizedSourceConfig,
    RefreshMode, StalenessReport,
};
pub use registry::SchemaRegistry;
pub use rollup::{RollupBuilder, RollupCatalog, RollupDefinition, RollupMetric, RollupUpdate};
pub use router::{QueryRouter, RollupCandidate, RouteDecision, RouteRequest, RouteSource};
pub use schema::{
    Aggregation, BaseMetric, CalculatedDimension, CalculatedMetric, DataType, Dimension,
    SchemaDocument,
};
pub use service::TableService;
pub use store::{FileStore, RollupStore, SchemaStore};
pub use validation::Validator;
