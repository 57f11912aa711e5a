pub mod rows;
pub mod schema;
pub mod sqlite;

pub use rows::{DecoderRow, MeasurementRow, RowBatch, StatementRow, StoreRow, UnparsableRow};
pub use schema::{ColumnType, TableSchema, TableSchemaBuilder};
pub use sqlite::{FlushCounts, Stores};

/// The five output stores.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Store {
    Decoder,
    Features,
    Measurements,
    Statements,
    Unparsable,
}

impl Store {
    pub const ALL: [Store; 5] = [
        Store::Decoder,
        Store::Features,
        Store::Measurements,
        Store::Statements,
        Store::Unparsable,
    ];

    pub fn label(self) -> &'static str {
        match self {
            Store::Decoder => "decoder",
            Store::Features => "features",
            Store::Measurements => "measurements",
            Store::Statements => "statements",
            Store::Unparsable => "unparsable",
        }
    }
}
