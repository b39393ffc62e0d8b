//! Seed payload parsing and load statements

use std::collections::BTreeMap;

/// Rows inserted per statement
pub const SEED_BATCH_SIZE: usize = 1000;

/// Parsed CSV seed
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SeedTable {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<String>>,
}

#[derive(Debug, thiserror::Error)]
pub enum SeedError {
    #[error("seed file is empty")]
    Empty,

    #[error("row {row} has {found} fields, expected {expected}")]
    RaggedRow {
        row: usize,
        found: usize,
        expected: usize,
    },

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),
}

impl SeedTable {
    /// Parse a CSV payload with a header row
    pub fn parse(payload: &str) -> Result<Self, SeedError> {
        let mut reader = csv::ReaderBuilder::new()
            .has_headers(true)
            .flexible(true)
            .trim(csv::Trim::Headers)
            .from_reader(payload.as_bytes());

        let columns: Vec<String> = reader.headers()?.iter().map(str::to_string).collect();
        if columns.is_empty() || columns.iter().all(String::is_empty) {
            return Err(SeedError::Empty);
        }

        let mut rows = Vec::new();
        for (i, record) in reader.records().enumerate() {
            let record = record?;
            if record.len() != columns.len() {
                return Err(SeedError::RaggedRow {
                    row: i + 1,
                    found: record.len(),
                    expected: columns.len(),
                });
            }
            rows.push(record.iter().map(str::to_string).collect());
        }

        Ok(Self { columns, rows })
    }

    /// Column definitions, `text` unless overridden
    pub fn column_definitions(&self, column_types: &BTreeMap<String, String>, quote: bool) -> String {
        self.columns
            .iter()
            .map(|column| {
                let data_type = column_types.get(column).map_or("text", String::as_str);
                format!("{} {}", quote_ident(column, quote), data_type)
            })
            .collect::<Vec<_>>()
            .join(", ")
    }

    /// `insert` statements for every row, in batches
    pub fn insert_statements(&self, relation: &str, quote: bool) -> Vec<String> {
        let columns = self
            .columns
            .iter()
            .map(|c| quote_ident(c, quote))
            .collect::<Vec<_>>()
            .join(", ");

        self.rows
            .chunks(SEED_BATCH_SIZE)
            .map(|batch| {
                let values = batch
                    .iter()
                    .map(|row| {
                        let fields = row.iter().map(|v| literal(v)).collect::<Vec<_>>().join(", ");
                        format!("({})", fields)
                    })
                    .collect::<Vec<_>>()
                    .join(", ");
                format!("insert into {} ({}) values {}", relation, columns, values)
            })
            .collect()
    }
}

fn quote_ident(name: &str, quote: bool) -> String {
    if quote {
        format!("\"{}\"", name.replace('"', "\"\""))
    } else {
        name.to_string()
    }
}

/// SQL literal for a CSV field; an empty field is null
fn literal(value: &str) -> String {
    if value.is_empty() {
        "null".to_string()
    } else {
        format!("'{}'", value.replace('\'', "''"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn parse_and_insert() {
        let seed = SeedTable::parse("id,name\n1,O'Brien\n2,\n").unwrap();
        assert_eq!(seed.columns, vec!["id", "name"]);
        assert_eq!(seed.rows.len(), 2);

        let statements = seed.insert_statements("public.people", false);
        assert_eq!(
            statements,
            vec!["insert into public.people (id, name) values ('1', 'O''Brien'), ('2', null)"]
        );
    }

    #[test]
    fn column_type_overrides() {
        let seed = SeedTable::parse("id,name\n1,a\n").unwrap();
        let mut types = BTreeMap::new();
        types.insert("id".to_string(), "integer".to_string());
        assert_eq!(seed.column_definitions(&types, true), "\"id\" integer, \"name\" text");
    }

    #[test]
    fn empty_payload_is_an_error() {
        assert!(matches!(SeedTable::parse(""), Err(SeedError::Empty)));
    }

    #[test]
    fn ragged_rows_are_rejected() {
        let err = SeedTable::parse("a,b\n1,2\n3\n").unwrap_err();
        assert!(matches!(err, SeedError::RaggedRow { row: 2, found: 1, expected: 2 }));
    }

    #[test]
    fn header_only_has_no_inserts() {
        let seed = SeedTable::parse("a,b\n").unwrap();
        assert!(seed.rows.is_empty());
        assert!(seed.insert_statements("t", false).is_empty());
    }

    #[test]
    fn large_seeds_are_batched() {
        let mut payload = String::from("n\n");
        for i in 0..(SEED_BATCH_SIZE + 5) {
            payload.push_str(&format!("{}\n", i));
        }
        let seed = SeedTable::parse(&payload).unwrap();
        assert_eq!(seed.insert_statements("t", false).len(), 2);
    }
}
