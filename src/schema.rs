//! Table schema and metadata
//!
//! Describes what the encrypted blocks contain: column names and
//! kinds, category counts for the mask-backed columns, and declared
//! magnitude bounds for numeric columns (the aggregators need those to
//! prescale their Newton inputs). The metadata file sits beside the
//! blocks and pins the parameter hash the table was encrypted under.

use serde::{Deserialize, Serialize};

use crate::error::{Result, StatError};
use crate::ops::lbc::LbcConfig;
use crate::params::Profile;

/// Kind of data a column carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ColumnKind {
    /// Real-valued, CKKS-encoded directly.
    Numerical,
    /// Integer-coded categories 1..=S_f with per-value masks.
    Categorical,
    /// Ordered categories 1..=S_f.
    Ordinal,
}

/// One column of an encrypted table.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Column {
    pub name: String,
    pub kind: ColumnKind,
    /// S_f for categorical/ordinal columns.
    #[serde(default)]
    pub categories: usize,
    /// Declared |value| bound for numerical columns; used to prescale
    /// variance inverses.
    #[serde(default)]
    pub value_bound: f64,
}

impl Column {
    pub fn validate(&self) -> Result<()> {
        if self.name.is_empty() {
            return Err(StatError::InvalidConfiguration {
                reason: "column name cannot be empty".into(),
            });
        }
        match self.kind {
            ColumnKind::Numerical => {
                if !(self.value_bound > 0.0) {
                    return Err(StatError::InvalidConfiguration {
                        reason: format!(
                            "numerical column {} needs a positive value_bound",
                            self.name
                        ),
                    });
                }
            }
            ColumnKind::Categorical | ColumnKind::Ordinal => {
                if self.categories < 2 {
                    return Err(StatError::InvalidConfiguration {
                        reason: format!(
                            "column {} needs at least 2 categories, got {}",
                            self.name, self.categories
                        ),
                    });
                }
            }
        }
        Ok(())
    }
}

/// Schema of an encrypted table.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TableSchema {
    pub name: String,
    pub columns: Vec<Column>,
}

impl TableSchema {
    pub fn validate(&self) -> Result<()> {
        if self.name.is_empty() {
            return Err(StatError::InvalidConfiguration {
                reason: "table name cannot be empty".into(),
            });
        }
        if self.columns.is_empty() {
            return Err(StatError::InvalidConfiguration {
                reason: format!("table {} has no columns", self.name),
            });
        }
        let mut seen = std::collections::HashSet::new();
        for column in &self.columns {
            column.validate()?;
            if !seen.insert(column.name.as_str()) {
                return Err(StatError::InvalidConfiguration {
                    reason: format!("duplicate column name {}", column.name),
                });
            }
        }
        Ok(())
    }

    pub fn column(&self, name: &str) -> Option<&Column> {
        self.columns.iter().find(|c| c.name == name)
    }

    /// Looks up a column, failing with a configuration error naming it.
    pub fn require_column(&self, name: &str) -> Result<&Column> {
        self.column(name).ok_or_else(|| StatError::InvalidConfiguration {
            reason: format!("table {} has no column {name}", self.name),
        })
    }
}

/// Runtime metadata stored beside the blocks.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TableMeta {
    pub schema: TableSchema,
    /// Row count R.
    pub rows: usize,
    /// Slot count the blocks were packed with.
    pub slots: usize,
    /// NB = ⌈R / slots⌉.
    pub block_count: usize,
    /// Hash of the parameter profile the blocks were encrypted under.
    pub params_hash: String,
    pub log_scale: u32,
    /// Bit-field geometry the packed mask encodings were produced
    /// with, when the table carries any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lbc: Option<LbcConfig>,
    pub version: String,
}

impl TableMeta {
    pub fn new(schema: TableSchema, rows: usize, profile: &Profile) -> Result<Self> {
        schema.validate()?;
        if rows == 0 {
            return Err(StatError::InvalidConfiguration {
                reason: "table must have at least one row".into(),
            });
        }
        Ok(Self {
            schema,
            rows,
            slots: profile.slots,
            block_count: profile.blocks_for_rows(rows),
            params_hash: profile.params_hash(),
            log_scale: profile.log_scale,
            lbc: None,
            version: "1".into(),
        })
    }

    /// Records the packed-encoding geometry the table's PBMV/BBMV
    /// blocks were built with.
    pub fn with_lbc(mut self, config: LbcConfig) -> Self {
        self.lbc = Some(config);
        self
    }

    pub fn validate(&self) -> Result<()> {
        self.schema.validate()?;
        if self.slots == 0 || self.block_count != self.rows.div_ceil(self.slots) {
            return Err(StatError::InvalidConfiguration {
                reason: format!(
                    "block count {} inconsistent with {} rows over {} slots",
                    self.block_count, self.rows, self.slots
                ),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn schema() -> TableSchema {
        TableSchema {
            name: "survey".into(),
            columns: vec![
                Column {
                    name: "income".into(),
                    kind: ColumnKind::Numerical,
                    categories: 0,
                    value_bound: 1000.0,
                },
                Column {
                    name: "gender".into(),
                    kind: ColumnKind::Categorical,
                    categories: 2,
                    value_bound: 0.0,
                },
            ],
        }
    }

    #[test]
    fn valid_schema_passes() {
        assert!(schema().validate().is_ok());
    }

    #[test]
    fn duplicate_columns_are_rejected() {
        let mut s = schema();
        s.columns.push(s.columns[0].clone());
        assert!(matches!(
            s.validate(),
            Err(StatError::InvalidConfiguration { .. })
        ));
    }

    #[test]
    fn numerical_columns_need_a_bound() {
        let mut s = schema();
        s.columns[0].value_bound = 0.0;
        assert!(s.validate().is_err());
    }

    #[test]
    fn metadata_computes_block_count() {
        let profile = Profile::custom(9, 8, 40, false).unwrap(); // 256 slots
        let meta = TableMeta::new(schema(), 300, &profile).unwrap();
        assert_eq!(meta.block_count, 2);
        assert!(meta.validate().is_ok());
    }

    #[test]
    fn metadata_round_trips_through_json() {
        let profile = Profile::custom(9, 8, 40, false).unwrap();
        let meta = TableMeta::new(schema(), 10, &profile).unwrap();
        let json = serde_json::to_string(&meta).unwrap();
        let back: TableMeta = serde_json::from_str(&json).unwrap();
        assert_eq!(back.rows, 10);
        assert_eq!(back.params_hash, meta.params_hash);
        assert_eq!(back.schema.columns.len(), 2);
    }
}
