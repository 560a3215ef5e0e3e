pub mod archive;
pub mod ingest;
pub mod layout;
pub mod query;
pub mod rows;
pub mod table;
pub mod util;
pub mod indexing {
    pub mod dictionary;
}
