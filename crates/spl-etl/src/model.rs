//! Data model for SPL documents and the warehouse tables they map to.

use std::collections::BTreeMap;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// One SPL document, extracted from a single XML file.
///
/// Short-lived: exists only between parser emission and the batch flush that
/// follows transformation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParsedDocument {
    /// UUID of this labeled version, unique across the corpus
    pub document_id: Uuid,
    /// UUID of the product lineage this version belongs to
    pub set_id: Uuid,
    /// Positive revision number within the lineage
    pub version_number: i32,
    pub effective_time: NaiveDate,
    pub product_name: Option<String>,
    pub manufacturer_name: Option<String>,
    pub dosage_form: Option<String>,
    pub route_of_administration: Option<String>,
    /// Distinct NDC codes in first-seen order
    pub ndcs: Vec<String>,
    pub ingredients: Vec<Ingredient>,
    pub packaging: Vec<Packaging>,
    pub marketing_status: Vec<MarketingStatus>,
    /// Canonical JSON equivalent of the source XML tree
    pub raw_payload: serde_json::Value,
    /// Archive-relative path of the source file
    pub source_filename: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Ingredient {
    pub name: Option<String>,
    /// UNII substance code when present
    pub substance_code: Option<String>,
    pub strength_numerator: Option<String>,
    pub strength_denominator: Option<String>,
    pub unit_of_measure: Option<String>,
    pub is_active: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Packaging {
    pub package_ndc: Option<String>,
    pub package_description: Option<String>,
    pub package_type: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MarketingStatus {
    pub marketing_category: Option<String>,
    pub start_date: Option<NaiveDate>,
    pub end_date: Option<NaiveDate>,
}

/// Load mode for a pipeline run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadMode {
    Full,
    Delta,
}

impl LoadMode {
    pub fn as_str(self) -> &'static str {
        match self {
            LoadMode::Full => "FULL",
            LoadMode::Delta => "DELTA",
        }
    }
}

impl std::fmt::Display for LoadMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Terminal state of a row in `etl_load_history`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunStatus {
    Running,
    Success,
    Failed,
}

impl RunStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            RunStatus::Running => "RUNNING",
            RunStatus::Success => "SUCCESS",
            RunStatus::Failed => "FAILED",
        }
    }
}

/// Warehouse tables fed by the transformer, in dependency order
/// (parents before children).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Table {
    SplRawDocuments,
    Products,
    ProductNdcs,
    Ingredients,
    Packaging,
    MarketingStatus,
}

/// Column value type in the intermediate files
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColumnKind {
    Utf8,
    Int64,
    Date,
    Bool,
    /// JSON serialized to a string
    Json,
}

impl Table {
    /// All tables, parents first
    pub const ALL: [Table; 6] = [
        Table::SplRawDocuments,
        Table::Products,
        Table::ProductNdcs,
        Table::Ingredients,
        Table::Packaging,
        Table::MarketingStatus,
    ];

    /// Child tables referencing `products.document_id`
    pub const CHILDREN: [Table; 4] = [
        Table::ProductNdcs,
        Table::Ingredients,
        Table::Packaging,
        Table::MarketingStatus,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Table::SplRawDocuments => "spl_raw_documents",
            Table::Products => "products",
            Table::ProductNdcs => "product_ndcs",
            Table::Ingredients => "ingredients",
            Table::Packaging => "packaging",
            Table::MarketingStatus => "marketing_status",
        }
    }

    pub fn from_name(name: &str) -> Option<Table> {
        Table::ALL.into_iter().find(|t| t.name() == name)
    }

    /// Columns carried by the intermediate files and staging tables.
    ///
    /// Surrogate ids are assigned by the database and `loaded_at` by the
    /// loader at merge time, so neither appears here.
    pub fn columns(self) -> &'static [&'static str] {
        match self {
            Table::SplRawDocuments => &[
                "document_id",
                "set_id",
                "version_number",
                "effective_time",
                "raw_data",
                "source_filename",
            ],
            Table::Products => &[
                "document_id",
                "set_id",
                "version_number",
                "effective_time",
                "product_name",
                "manufacturer_name",
                "dosage_form",
                "route_of_administration",
                "is_latest_version",
            ],
            Table::ProductNdcs => &["document_id", "ndc_code"],
            Table::Ingredients => &[
                "document_id",
                "ingredient_name",
                "substance_code",
                "strength_numerator",
                "strength_denominator",
                "unit_of_measure",
                "is_active_ingredient",
            ],
            Table::Packaging => &[
                "document_id",
                "package_ndc",
                "package_description",
                "package_type",
            ],
            Table::MarketingStatus => &[
                "document_id",
                "marketing_category",
                "start_date",
                "end_date",
            ],
        }
    }

    /// Declared column types, parallel to [`Table::columns`]
    pub fn column_kinds(self) -> &'static [ColumnKind] {
        use ColumnKind::*;
        match self {
            Table::SplRawDocuments => &[Utf8, Utf8, Int64, Date, Json, Utf8],
            Table::Products => &[Utf8, Utf8, Int64, Date, Utf8, Utf8, Utf8, Utf8, Bool],
            Table::ProductNdcs => &[Utf8, Utf8],
            Table::Ingredients => &[Utf8, Utf8, Utf8, Utf8, Utf8, Utf8, Bool],
            Table::Packaging => &[Utf8, Utf8, Utf8, Utf8],
            Table::MarketingStatus => &[Utf8, Utf8, Date, Date],
        }
    }
}

/// One cell of an intermediate row
#[derive(Debug, Clone, PartialEq)]
pub enum Field {
    Null,
    Uuid(Uuid),
    Text(String),
    Int(i64),
    Date(NaiveDate),
    Bool(bool),
    Json(serde_json::Value),
    Timestamp(DateTime<Utc>),
}

impl Field {
    /// Text field from an optional string, mapping `None` to SQL NULL
    pub fn opt_text(value: &Option<String>) -> Field {
        match value {
            Some(s) => Field::Text(s.clone()),
            None => Field::Null,
        }
    }

    /// Date field from an optional date
    pub fn opt_date(value: &Option<NaiveDate>) -> Field {
        match value {
            Some(d) => Field::Date(*d),
            None => Field::Null,
        }
    }
}

/// Typed rows per table, produced by the transformer for one document
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RowBatches {
    batches: BTreeMap<Table, Vec<Vec<Field>>>,
}

impl RowBatches {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, table: Table, row: Vec<Field>) {
        debug_assert_eq!(row.len(), table.columns().len());
        self.batches.entry(table).or_default().push(row);
    }

    pub fn rows(&self, table: Table) -> &[Vec<Field>] {
        self.batches.get(&table).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn total_rows(&self) -> u64 {
        self.batches.values().map(|rows| rows.len() as u64).sum()
    }

    pub fn iter(&self) -> impl Iterator<Item = (Table, &[Vec<Field>])> {
        self.batches.iter().map(|(t, rows)| (*t, rows.as_slice()))
    }
}

/// Trim whitespace and turn empty strings into `None`.
///
/// Applied to every extracted text value for database consistency.
pub fn clean_string(value: &str) -> Option<String> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}

/// Parse an SPL calendar value.
///
/// Accepts `YYYYMMDD`, `YYYYMM` (first of month), and `YYYY` (January 1).
pub fn parse_spl_date(raw: &str) -> Option<NaiveDate> {
    let digits = raw.trim();
    if !digits.chars().all(|c| c.is_ascii_digit()) {
        return None;
    }
    match digits.len() {
        8 => NaiveDate::parse_from_str(digits, "%Y%m%d").ok(),
        6 => {
            let year: i32 = digits[..4].parse().ok()?;
            let month: u32 = digits[4..6].parse().ok()?;
            NaiveDate::from_ymd_opt(year, month, 1)
        }
        4 => {
            let year: i32 = digits.parse().ok()?;
            NaiveDate::from_ymd_opt(year, 1, 1)
        }
        _ => None,
    }
}
