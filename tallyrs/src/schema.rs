use chrono::{DateTime, Utc};
use serde::{de, Deserializer};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{Result, TallyError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Aggregation {
    Sum,
    Count,
    Avg,
    Min,
    Max,
    CountDistinct,
    ApproxCountDistinct,
}

impl Aggregation {
    /// Distinct counts cannot be summed across a coarser grouping.
    pub fn is_distinct(&self) -> bool {
        matches!(
            self,
            Aggregation::CountDistinct | Aggregation::ApproxCountDistinct
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DataType {
    #[default]
    String,
    Integer,
    Float,
    Date,
    Boolean,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum MetricFormat {
    #[default]
    Number,
    Percent,
    Currency,
    Duration,
}

/// A metric aggregated directly from one or more warehouse columns.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct BaseMetric {
    pub id: String,
    pub display_name: Option<String>,
    pub description: Option<String>,
    pub source_columns: Vec<String>,
    pub aggregation: Aggregation,
    pub category: Option<String>,
    pub format: MetricFormat,
    pub decimal_places: Option<u8>,
}

impl BaseMetric {
    pub fn new(id: impl Into<String>, column: impl Into<String>, aggregation: Aggregation) -> Self {
        Self {
            id: id.into(),
            display_name: None,
            description: None,
            source_columns: vec![column.into()],
            aggregation,
            category: None,
            format: MetricFormat::default(),
            decimal_places: None,
        }
    }

    /// Distinct count over a multi-column identity.
    pub fn distinct_over(id: impl Into<String>, columns: &[&str]) -> Self {
        Self {
            source_columns: columns.iter().map(|c| c.to_string()).collect(),
            ..Self::new(id, "", Aggregation::CountDistinct)
        }
    }

    pub fn is_composite(&self) -> bool {
        self.source_columns.len() > 1
    }

    pub fn validate(&self) -> Result<()> {
        check_id(&self.id)?;
        if self.source_columns.is_empty() || self.source_columns.iter().any(|c| c.is_empty()) {
            return Err(TallyError::SchemaValidation(format!(
                "base metric {} needs at least one non-empty source column",
                self.id
            )));
        }
        if self.is_composite() && !self.aggregation.is_distinct() {
            return Err(TallyError::SchemaValidation(format!(
                "base metric {} uses {} columns; multi-column metrics require COUNT_DISTINCT",
                self.id,
                self.source_columns.len()
            )));
        }
        Ok(())
    }
}

impl<'de> Deserialize<'de> for BaseMetric {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        #[derive(Deserialize)]
        #[serde(deny_unknown_fields)]
        struct Raw {
            id: String,
            display_name: Option<String>,
            description: Option<String>,
            // Accept either a single column or a column list
            #[serde(default)]
            source_column: Option<String>,
            #[serde(default)]
            source_columns: Option<Vec<String>>,
            aggregation: Aggregation,
            category: Option<String>,
            #[serde(default)]
            format: MetricFormat,
            decimal_places: Option<u8>,
        }

        let raw = Raw::deserialize(deserializer)?;
        let source_columns = match (raw.source_columns, raw.source_column) {
            (Some(cols), _) => cols,
            (None, Some(col)) => vec![col],
            (None, None) => {
                return Err(de::Error::custom(format!(
                    "base metric {}: either source_column or source_columns must be specified",
                    raw.id
                )))
            }
        };

        let metric = BaseMetric {
            id: raw.id,
            display_name: raw.display_name,
            description: raw.description,
            source_columns,
            aggregation: raw.aggregation,
            category: raw.category,
            format: raw.format,
            decimal_places: raw.decimal_places,
        };
        metric.validate().map_err(de::Error::custom)?;
        Ok(metric)
    }
}

/// A metric defined as a formula over other metrics.
///
/// `compiled_sql` and both dependency lists are derived by the formula compiler
/// and are rewritten whenever the formula or one of its dependencies changes.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct CalculatedMetric {
    pub id: String,
    pub display_name: Option<String>,
    pub description: Option<String>,
    pub category: Option<String>,
    pub formula: String,
    #[serde(default)]
    pub compiled_sql: String,
    #[serde(default)]
    pub depends_on_base: Vec<String>,
    #[serde(default)]
    pub depends_on_calculated: Vec<String>,
    #[serde(default)]
    pub format: MetricFormat,
}

impl CalculatedMetric {
    pub fn new(id: impl Into<String>, formula: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            display_name: None,
            description: None,
            category: None,
            formula: formula.into(),
            compiled_sql: String::new(),
            depends_on_base: Vec::new(),
            depends_on_calculated: Vec::new(),
            format: MetricFormat::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct Dimension {
    pub id: String,
    pub display_name: Option<String>,
    pub description: Option<String>,
    pub column_name: String,
    pub data_type: DataType,
    pub is_filterable: bool,
    pub is_groupable: bool,
}

impl Dimension {
    pub fn new(id: impl Into<String>, column_name: impl Into<String>, data_type: DataType) -> Self {
        Self {
            id: id.into(),
            display_name: None,
            description: None,
            column_name: column_name.into(),
            data_type,
            is_filterable: true,
            is_groupable: true,
        }
    }
}

impl<'de> Deserialize<'de> for Dimension {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let value = Value::deserialize(deserializer)?;
        match value {
            // Shorthand: a bare column name is a groupable string dimension of the same id
            Value::String(s) => Ok(Dimension::new(s.clone(), s, DataType::String)),
            other => {
                #[derive(Deserialize)]
                #[serde(deny_unknown_fields)]
                struct Full {
                    id: String,
                    display_name: Option<String>,
                    description: Option<String>,
                    column_name: Option<String>,
                    #[serde(default)]
                    data_type: DataType,
                    #[serde(default = "default_true")]
                    is_filterable: bool,
                    #[serde(default = "default_true")]
                    is_groupable: bool,
                }
                let full = Full::deserialize(other).map_err(de::Error::custom)?;
                Ok(Dimension {
                    column_name: full.column_name.unwrap_or_else(|| full.id.clone()),
                    id: full.id,
                    display_name: full.display_name,
                    description: full.description,
                    data_type: full.data_type,
                    is_filterable: full.is_filterable,
                    is_groupable: full.is_groupable,
                })
            }
        }
    }
}

/// A row-level derived dimension; its expression references raw columns as `{column}`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct CalculatedDimension {
    pub id: String,
    pub display_name: Option<String>,
    pub description: Option<String>,
    pub sql_expression: String,
    #[serde(default)]
    pub compiled_sql: String,
    #[serde(default)]
    pub depends_on: Vec<String>,
    #[serde(default)]
    pub data_type: DataType,
    #[serde(default = "default_true")]
    pub is_filterable: bool,
    #[serde(default = "default_true")]
    pub is_groupable: bool,
}

impl CalculatedDimension {
    pub fn new(id: impl Into<String>, sql_expression: impl Into<String>, data_type: DataType) -> Self {
        Self {
            id: id.into(),
            display_name: None,
            description: None,
            sql_expression: sql_expression.into(),
            compiled_sql: String::new(),
            depends_on: Vec::new(),
            data_type,
            is_filterable: true,
            is_groupable: true,
        }
    }
}

/// Persisted schema record for one logical table.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct SchemaDocument {
    pub table: String,
    pub source_table: String,
    #[serde(default = "default_date_column")]
    pub date_column: String,
    #[serde(default)]
    pub base_metrics: Vec<BaseMetric>,
    #[serde(default)]
    pub calculated_metrics: Vec<CalculatedMetric>,
    #[serde(default)]
    pub dimensions: Vec<Dimension>,
    #[serde(default)]
    pub calculated_dimensions: Vec<CalculatedDimension>,
    #[serde(default)]
    pub version: u64,
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
}

impl SchemaDocument {
    pub fn new(table: impl Into<String>, source_table: impl Into<String>) -> Self {
        Self {
            table: table.into(),
            source_table: source_table.into(),
            date_column: default_date_column(),
            base_metrics: Vec::new(),
            calculated_metrics: Vec::new(),
            dimensions: Vec::new(),
            calculated_dimensions: Vec::new(),
            version: 0,
            created_at: None,
            updated_at: None,
        }
    }
}

/// Virtual metrics every table exposes without declaring them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SystemMetric {
    /// Inclusive number of days between the earliest and latest date in scope.
    DaysInRange,
}

impl SystemMetric {
    pub const ALL: [SystemMetric; 1] = [SystemMetric::DaysInRange];

    pub fn id(&self) -> &'static str {
        match self {
            SystemMetric::DaysInRange => "days_in_range",
        }
    }

    pub fn from_id(id: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|m| m.id() == id)
    }
}

/// Any metric addressable by id from a formula.
#[derive(Debug, Clone, Copy)]
pub enum MetricKind<'a> {
    Base(&'a BaseMetric),
    Calculated(&'a CalculatedMetric),
    System(SystemMetric),
}

/// Either kind of dimension, addressable by id.
#[derive(Debug, Clone, Copy)]
pub enum DimensionKind<'a> {
    Column(&'a Dimension),
    Calculated(&'a CalculatedDimension),
}

impl DimensionKind<'_> {
    pub fn id(&self) -> &str {
        match self {
            DimensionKind::Column(d) => &d.id,
            DimensionKind::Calculated(d) => &d.id,
        }
    }
}

pub(crate) fn check_id(id: &str) -> Result<()> {
    if crate::reference::is_valid_token(id) {
        Ok(())
    } else {
        Err(TallyError::Syntax(format!(
            "invalid id '{id}': ids start with a letter or underscore and contain only letters, digits and underscores"
        )))
    }
}

fn default_true() -> bool {
    true
}

fn default_date_column() -> String {
    "date".to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn base_metric_accepts_single_or_multiple_columns() {
        let yaml = r#"
id: revenue
source_column: revenue_usd
aggregation: SUM
"#;
        let metric: BaseMetric = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(metric.source_columns, vec!["revenue_usd"]);

        let yaml = r#"
id: unique_searches
source_columns: [visit_id, query]
aggregation: COUNT_DISTINCT
"#;
        let metric: BaseMetric = serde_yaml::from_str(yaml).unwrap();
        assert!(metric.is_composite());
    }

    #[test]
    fn multi_column_requires_distinct_aggregation() {
        let yaml = r#"
id: bad
source_columns: [a, b]
aggregation: SUM
"#;
        let err = serde_yaml::from_str::<BaseMetric>(yaml).unwrap_err();
        assert!(err.to_string().contains("COUNT_DISTINCT"));
    }

    #[test]
    fn dimension_shorthand_uses_id_as_column() {
        let dims: Vec<Dimension> = serde_yaml::from_str("- country\n- id: day\n  column_name: date\n  data_type: DATE\n").unwrap();
        assert_eq!(dims[0].column_name, "country");
        assert!(dims[0].is_groupable);
        assert_eq!(dims[1].column_name, "date");
        assert_eq!(dims[1].data_type, DataType::Date);
    }

    #[test]
    fn system_metric_lookup() {
        assert_eq!(SystemMetric::from_id("days_in_range"), Some(SystemMetric::DaysInRange));
        assert_eq!(SystemMetric::from_id("revenue"), None);
    }
}
