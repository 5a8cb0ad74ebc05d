//! Column metadata for a table.
//!
//! A [`Schema`] fixes the column count, per-column [`Type`], and per-column
//! nullability for every tuple a table stores. The engine core never
//! inspects column names except for diagnostics; positional access is the
//! contract everywhere else.

use std::fmt;

use crate::datum::{Datum, Type};
use crate::tuple::Tuple;

/// A single column definition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Column {
    /// Column name (diagnostics only).
    pub name: String,
    /// Column data type.
    pub ty: Type,
    /// Whether NULL is a legal value for this column.
    pub nullable: bool,
}

impl Column {
    /// Creates a nullable column.
    pub fn nullable(name: &str, ty: Type) -> Self {
        Self {
            name: name.to_string(),
            ty,
            nullable: true,
        }
    }

    /// Creates a NOT NULL column.
    pub fn not_null(name: &str, ty: Type) -> Self {
        Self {
            name: name.to_string(),
            ty,
            nullable: false,
        }
    }
}

/// Ordered column definitions for one table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Schema {
    columns: Vec<Column>,
}

impl Schema {
    /// Creates a schema from column definitions.
    ///
    /// # Panics
    ///
    /// Panics on an empty column list; a table without columns stores nothing.
    pub fn new(columns: Vec<Column>) -> Self {
        assert!(!columns.is_empty(), "schema requires at least one column");
        Self { columns }
    }

    /// Returns the number of columns.
    pub fn column_count(&self) -> usize {
        self.columns.len()
    }

    /// Returns the column definition at the given position.
    pub fn column(&self, index: usize) -> &Column {
        &self.columns[index]
    }

    /// Returns all column definitions in order.
    pub fn columns(&self) -> &[Column] {
        &self.columns
    }

    /// Returns the column types in order.
    pub fn types(&self) -> Vec<Type> {
        self.columns.iter().map(|c| c.ty).collect()
    }

    /// Returns the per-column allow-null mask.
    ///
    /// The table caches this mask so the hot not-null check never walks
    /// column structs.
    pub fn allow_null_mask(&self) -> Box<[bool]> {
        self.columns.iter().map(|c| c.nullable).collect()
    }

    /// Returns the position of the first column whose datum violates its
    /// declared type, or `None` if the tuple conforms.
    ///
    /// NULLs conform to any type here; nullability is checked separately.
    pub fn first_type_mismatch(&self, tuple: &Tuple) -> Option<usize> {
        if tuple.values().len() != self.columns.len() {
            return Some(tuple.values().len().min(self.columns.len()));
        }
        tuple.values().iter().enumerate().find_map(|(i, d)| {
            match d {
                Datum::Null => None,
                other => (other.ty() != Some(self.columns[i].ty)).then_some(i),
            }
        })
    }
}

impl fmt::Display for Schema {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("(")?;
        for (i, c) in self.columns.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            write!(f, "{} {}", c.name, c.ty)?;
            if !c.nullable {
                f.write_str(" NOT NULL")?;
            }
        }
        f.write_str(")")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Schema {
        Schema::new(vec![
            Column::not_null("id", Type::Int64),
            Column::nullable("name", Type::Text),
            Column::not_null("score", Type::Float64),
        ])
    }

    #[test]
    fn test_accessors() {
        let schema = sample();
        assert_eq!(schema.column_count(), 3);
        assert_eq!(schema.column(1).name, "name");
        assert_eq!(schema.types(), vec![Type::Int64, Type::Text, Type::Float64]);
        assert_eq!(&*schema.allow_null_mask(), &[false, true, false]);
    }

    #[test]
    fn test_type_mismatch() {
        let schema = sample();
        let good = Tuple::new(vec![
            Datum::Int64(1),
            Datum::text("a"),
            Datum::Float64(0.5),
        ]);
        assert_eq!(schema.first_type_mismatch(&good), None);

        let with_null = Tuple::new(vec![Datum::Int64(1), Datum::Null, Datum::Float64(0.5)]);
        assert_eq!(schema.first_type_mismatch(&with_null), None);

        let bad = Tuple::new(vec![Datum::Int64(1), Datum::Int32(2), Datum::Float64(0.5)]);
        assert_eq!(schema.first_type_mismatch(&bad), Some(1));

        let short = Tuple::new(vec![Datum::Int64(1)]);
        assert_eq!(schema.first_type_mismatch(&short), Some(1));
    }

    #[test]
    fn test_display() {
        let schema = sample();
        assert_eq!(
            schema.to_string(),
            "(id BIGINT NOT NULL, name TEXT, score DOUBLE PRECISION NOT NULL)"
        );
    }

    #[test]
    #[should_panic(expected = "at least one column")]
    fn test_empty_schema_rejected() {
        Schema::new(vec![]);
    }
}
