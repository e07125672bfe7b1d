//! Persistence of schema documents, rollup definitions and optimized-source configs.

use std::fs;
use std::path::{Path, PathBuf};

use chrono::Utc;
use glob::glob;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::debug;

use crate::error::{Result, TallyError};
use crate::optimizer::OptimizedSourceConfig;
use crate::rollup::RollupDefinition;
use crate::schema::SchemaDocument;

const SCHEMA_FILE: &str = "schema.yaml";
const ROLLUPS_FILE: &str = "rollups.yaml";
const OPTIMIZED_SOURCE_FILE: &str = "optimized_source.yaml";

pub trait SchemaStore: Send + Sync {
    fn load(&self, table: &str) -> Result<Option<SchemaDocument>>;

    /// Persist `document`, bumping its version and timestamps in place.
    fn save(&self, document: &mut SchemaDocument) -> Result<()>;

    fn list_tables(&self) -> Result<Vec<String>>;
}

pub trait RollupStore: Send + Sync {
    fn load_rollups(&self, table: &str) -> Result<Vec<RollupDefinition>>;

    /// Replace every stored rollup of `table`.
    fn save_rollups(&self, table: &str, rollups: &[RollupDefinition]) -> Result<()>;

    fn load_optimized_source(&self, table: &str) -> Result<Option<OptimizedSourceConfig>>;

    fn save_optimized_source(&self, table: &str, config: &OptimizedSourceConfig) -> Result<()>;
}

/// YAML files under `<root>/<table>/`.
#[derive(Debug, Clone)]
pub struct FileStore {
    root: PathBuf,
}

impl FileStore {
    pub fn new<P: AsRef<Path>>(root: P) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn table_dir(&self, table: &str) -> Result<PathBuf> {
        if table.is_empty()
            || table == "."
            || table == ".."
            || table.contains(['/', '\\'])
        {
            return Err(TallyError::SchemaValidation(format!(
                "invalid table name '{table}'"
            )));
        }
        Ok(self.root.join(table))
    }

    fn read<T: DeserializeOwned>(&self, table: &str, file: &str) -> Result<Option<T>> {
        let path = self.table_dir(table)?.join(file);
        if !path.exists() {
            return Ok(None);
        }
        let contents = fs::read_to_string(&path)?;
        Ok(Some(serde_yaml::from_str(&contents)?))
    }

    /// Write through a temporary file so readers never see a partial document.
    fn write<T: Serialize + ?Sized>(&self, table: &str, file: &str, value: &T) -> Result<()> {
        let dir = self.table_dir(table)?;
        fs::create_dir_all(&dir)?;
        let path = dir.join(file);
        let tmp = dir.join(format!(".{file}.tmp"));
        fs::write(&tmp, serde_yaml::to_string(value)?)?;
        fs::rename(&tmp, &path)?;
        debug!(path = %path.display(), "wrote store file");
        Ok(())
    }
}

impl SchemaStore for FileStore {
    fn load(&self, table: &str) -> Result<Option<SchemaDocument>> {
        self.read(table, SCHEMA_FILE)
    }

    fn save(&self, document: &mut SchemaDocument) -> Result<()> {
        let now = Utc::now();
        let previous = (document.version, document.created_at, document.updated_at);
        document.version += 1;
        document.created_at.get_or_insert(now);
        document.updated_at = Some(now);
        let table = document.table.clone();
        if let Err(err) = self.write(&table, SCHEMA_FILE, document) {
            (document.version, document.created_at, document.updated_at) = previous;
            return Err(err);
        }
        Ok(())
    }

    fn list_tables(&self) -> Result<Vec<String>> {
        let pattern = format!("{}/*/{SCHEMA_FILE}", self.root.display());
        let mut tables: Vec<String> = glob(&pattern)
            .map_err(|e| TallyError::Other(e.into()))?
            .flatten()
            .filter_map(|path| {
                path.parent()
                    .and_then(Path::file_name)
                    .map(|name| name.to_string_lossy().into_owned())
            })
            .collect();
        tables.sort();
        Ok(tables)
    }
}

impl RollupStore for FileStore {
    fn load_rollups(&self, table: &str) -> Result<Vec<RollupDefinition>> {
        Ok(self.read(table, ROLLUPS_FILE)?.unwrap_or_default())
    }

    fn save_rollups(&self, table: &str, rollups: &[RollupDefinition]) -> Result<()> {
        self.write(table, ROLLUPS_FILE, rollups)
    }

    fn load_optimized_source(&self, table: &str) -> Result<Option<OptimizedSourceConfig>> {
        self.read(table, OPTIMIZED_SOURCE_FILE)
    }

    fn save_optimized_source(&self, table: &str, config: &OptimizedSourceConfig) -> Result<()> {
        self.write(table, OPTIMIZED_SOURCE_FILE, config)
    }
}
