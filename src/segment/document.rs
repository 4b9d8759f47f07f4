//! Derives indexed, sorted and faceted representations of a stored document.

use chrono::DateTime;

use crate::analysis::PerFieldAnalyzer;
use crate::config::{FacetType, FieldConfig, IndexConfig, SortAs};
use crate::data::{DataValue, Document, NumericType, NumericValue};
use crate::error::{ClusterError, Result};
use crate::request::Facet;
use crate::response::SortValue;
use crate::shard::IndexedDocument;

/// Field name reported for the indexing timestamp.
pub const TIMESTAMP_FIELD: &str = "_timestamp";

pub fn build_indexed_document(
    config: &IndexConfig,
    analyzer: &PerFieldAnalyzer,
    unique_id: &str,
    document: &Document,
    timestamp: i64,
) -> Result<IndexedDocument> {
    let mut indexed = IndexedDocument {
        unique_id: unique_id.to_string(),
        timestamp,
        ..Default::default()
    };

    for field_config in &config.settings.field_configs {
        let Some(value) = document.value_at(&field_config.stored_field_name) else {
            continue;
        };
        let scalars = value.scalars();
        if scalars.is_empty() {
            continue;
        }

        add_indexed_values(&mut indexed, field_config, analyzer, &scalars)?;

        if let Some(sort_as) = &field_config.sort_as {
            if let Some(sort_value) = sort_value(sort_as, field_config, &scalars)? {
                indexed
                    .sort_values
                    .insert(sort_as.sort_field_name.clone(), sort_value);
            }
        }

        for facet_as in &field_config.facet_as {
            for scalar in &scalars {
                if let Some(path) = facet_path(facet_as.facet_type, scalar, field_config)? {
                    indexed.facets.push(Facet {
                        label: facet_as.facet_name.clone(),
                        path,
                    });
                }
            }
        }
    }

    // the unique id is always indexed as a single keyword term
    indexed
        .terms
        .insert(config.unique_id_field.clone(), vec![unique_id.to_string()]);
    Ok(indexed)
}

fn add_indexed_values(
    indexed: &mut IndexedDocument,
    field_config: &FieldConfig,
    analyzer: &PerFieldAnalyzer,
    scalars: &[&DataValue],
) -> Result<()> {
    for index_as in &field_config.index_as {
        let name = &index_as.index_field_name;
        match index_as.analyzer.numeric_type() {
            Some(numeric_type) => {
                let values = scalars
                    .iter()
                    .map(|v| {
                        v.to_numeric(numeric_type)
                            .ok_or_else(|| type_error(field_config, numeric_type, v))
                    })
                    .collect::<Result<Vec<_>>>()?;
                indexed.numbers.entry(name.clone()).or_default().extend(values);
            }
            None => {
                let tokens = indexed.terms.entry(name.clone()).or_default();
                for scalar in scalars {
                    if let Some(text) = scalar.to_text() {
                        tokens.extend(analyzer.analyze(name, &text));
                    }
                }
            }
        }
    }
    Ok(())
}

/// Multi-valued fields sort by their smallest value.
fn sort_value(
    sort_as: &SortAs,
    field_config: &FieldConfig,
    scalars: &[&DataValue],
) -> Result<Option<SortValue>> {
    let mut values = Vec::with_capacity(scalars.len());
    for scalar in scalars {
        let value = match sort_as.sort_type.numeric_type() {
            Some(numeric_type) => SortValue::from(
                scalar
                    .to_numeric(numeric_type)
                    .ok_or_else(|| type_error(field_config, numeric_type, scalar))?,
            ),
            None => match scalar.to_text() {
                Some(text) => SortValue::Term(text),
                None => continue,
            },
        };
        values.push(value);
    }
    Ok(values.into_iter().min_by(|a, b| a.compare(b)))
}

fn facet_path(
    facet_type: FacetType,
    value: &DataValue,
    field_config: &FieldConfig,
) -> Result<Option<Vec<String>>> {
    match facet_type {
        FacetType::Standard => Ok(value
            .to_text()
            .filter(|text| !text.is_empty())
            .map(|text| vec![text])),
        FacetType::DateYyyymmdd | FacetType::DateYyyyMmDd => {
            let date = value
                .to_numeric(NumericType::Date)
                .and_then(|millis| match millis {
                    NumericValue::Date(ms) => DateTime::from_timestamp_millis(ms),
                    _ => None,
                })
                .ok_or_else(|| type_error(field_config, NumericType::Date, value))?;
            if facet_type == FacetType::DateYyyymmdd {
                Ok(Some(vec![date.format("%Y%m%d").to_string()]))
            } else {
                Ok(Some(vec![
                    date.format("%Y").to_string(),
                    date.format("%m").to_string(),
                    date.format("%d").to_string(),
                ]))
            }
        }
    }
}

fn type_error(field_config: &FieldConfig, expected: NumericType, found: &DataValue) -> ClusterError {
    ClusterError::invalid_argument(format!(
        "Expecting a {:?} value for document field <{}>, found {:?}",
        expected, field_config.stored_field_name, found
    ))
}
