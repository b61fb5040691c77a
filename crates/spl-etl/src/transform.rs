//! Normalization of parsed documents into per-table row batches.
//!
//! Pure function of its input: no I/O, no clock. Surrogate ids are assigned
//! by the database and `loaded_at` by the loader from a single run
//! timestamp, so neither appears in the emitted rows.

use crate::model::{Field, ParsedDocument, RowBatches, Table};

/// Fan one document out into rows for every warehouse table.
///
/// Repeating child elements become one row per occurrence carrying the
/// parent `document_id`. The full-representation row duplicates the
/// identifying fields so `spl_raw_documents` stays independently queryable.
pub fn transform(doc: &ParsedDocument) -> RowBatches {
    let mut batches = RowBatches::new();

    batches.push(
        Table::SplRawDocuments,
        vec![
            Field::Uuid(doc.document_id),
            Field::Uuid(doc.set_id),
            Field::Int(doc.version_number as i64),
            Field::Date(doc.effective_time),
            Field::Json(doc.raw_payload.clone()),
            Field::Text(doc.source_filename.clone()),
        ],
    );

    batches.push(
        Table::Products,
        vec![
            Field::Uuid(doc.document_id),
            Field::Uuid(doc.set_id),
            Field::Int(doc.version_number as i64),
            Field::Date(doc.effective_time),
            Field::opt_text(&doc.product_name),
            Field::opt_text(&doc.manufacturer_name),
            Field::opt_text(&doc.dosage_form),
            Field::opt_text(&doc.route_of_administration),
            // Recomputed per set_id inside the merge transaction
            Field::Bool(false),
        ],
    );

    for ndc in &doc.ndcs {
        batches.push(
            Table::ProductNdcs,
            vec![Field::Uuid(doc.document_id), Field::Text(ndc.clone())],
        );
    }

    for ingredient in &doc.ingredients {
        batches.push(
            Table::Ingredients,
            vec![
                Field::Uuid(doc.document_id),
                Field::opt_text(&ingredient.name),
                Field::opt_text(&ingredient.substance_code),
                Field::opt_text(&ingredient.strength_numerator),
                Field::opt_text(&ingredient.strength_denominator),
                Field::opt_text(&ingredient.unit_of_measure),
                Field::Bool(ingredient.is_active),
            ],
        );
    }

    for package in &doc.packaging {
        batches.push(
            Table::Packaging,
            vec![
                Field::Uuid(doc.document_id),
                Field::opt_text(&package.package_ndc),
                Field::opt_text(&package.package_description),
                Field::opt_text(&package.package_type),
            ],
        );
    }

    for status in &doc.marketing_status {
        batches.push(
            Table::MarketingStatus,
            vec![
                Field::Uuid(doc.document_id),
                Field::opt_text(&status.marketing_category),
                Field::opt_date(&status.start_date),
                Field::opt_date(&status.end_date),
            ],
        );
    }

    batches
}

#[cfg(test)]
mod tests {
    use chrono::NaiveDate;
    use serde_json::json;
    use uuid::Uuid;

    use super::*;
    use crate::model::{Ingredient, MarketingStatus, Packaging};

    fn sample_document() -> ParsedDocument {
        ParsedDocument {
            document_id: Uuid::parse_str("a7f1b9c3-2e44-4f0a-9d36-5b8e2c7d1a90").unwrap(),
            set_id: Uuid::parse_str("0f6c2d84-911b-4e6a-8c25-3d7a1e9b4f52").unwrap(),
            version_number: 4,
            effective_time: NaiveDate::from_ymd_opt(2024, 2, 1).unwrap(),
            product_name: Some("Example Tablets".to_string()),
            manufacturer_name: None,
            dosage_form: Some("TABLET".to_string()),
            route_of_administration: Some("ORAL".to_string()),
            ndcs: vec!["0002-1433-80".to_string(), "0002-1433-61".to_string()],
            ingredients: vec![
                Ingredient {
                    name: Some("ACETAMINOPHEN".to_string()),
                    substance_code: Some("362O9ITL9D".to_string()),
                    strength_numerator: Some("500".to_string()),
                    strength_denominator: Some("1".to_string()),
                    unit_of_measure: Some("mg".to_string()),
                    is_active: true,
                },
                Ingredient::default(),
            ],
            packaging: vec![Packaging {
                package_ndc: Some("0002-1433-80".to_string()),
                package_description: None,
                package_type: Some("BOTTLE".to_string()),
            }],
            marketing_status: vec![MarketingStatus {
                marketing_category: Some("active".to_string()),
                start_date: Some(NaiveDate::from_ymd_opt(2020, 3, 1).unwrap()),
                end_date: None,
            }],
            raw_payload: json!({"@name": "document", "@attrs": {}, "children": []}),
            source_filename: "a/label.xml".to_string(),
        }
    }

    #[test]
    fn test_transform_row_counts() {
        let batches = transform(&sample_document());
        assert_eq!(batches.rows(Table::SplRawDocuments).len(), 1);
        assert_eq!(batches.rows(Table::Products).len(), 1);
        assert_eq!(batches.rows(Table::ProductNdcs).len(), 2);
        assert_eq!(batches.rows(Table::Ingredients).len(), 2);
        assert_eq!(batches.rows(Table::Packaging).len(), 1);
        assert_eq!(batches.rows(Table::MarketingStatus).len(), 1);
        assert_eq!(batches.total_rows(), 8);
    }

    #[test]
    fn test_transform_children_carry_document_id() {
        let doc = sample_document();
        let batches = transform(&doc);
        for table in Table::CHILDREN {
            for row in batches.rows(table) {
                assert_eq!(row[0], Field::Uuid(doc.document_id));
            }
        }
    }

    #[test]
    fn test_transform_nulls_and_flags() {
        let batches = transform(&sample_document());

        let product = &batches.rows(Table::Products)[0];
        assert_eq!(product[5], Field::Null); // manufacturer_name
        assert_eq!(product[8], Field::Bool(false)); // is_latest_version

        let inactive = &batches.rows(Table::Ingredients)[1];
        assert_eq!(inactive[6], Field::Bool(false));
        assert_eq!(inactive[1], Field::Null);
    }

    #[test]
    fn test_transform_rows_match_table_widths() {
        let batches = transform(&sample_document());
        for (table, rows) in batches.iter() {
            for row in rows {
                assert_eq!(row.len(), table.columns().len());
            }
        }
    }

    #[test]
    fn test_transform_is_deterministic() {
        let doc = sample_document();
        assert_eq!(transform(&doc), transform(&doc));
    }
}
