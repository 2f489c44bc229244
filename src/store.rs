//! Document store for scored master rows
//!
//! One collection holds the latest master dataset. Every load fully
//! replaces it with a delete-then-insert, which is not atomic: a failure
//! between the two steps leaves the collection empty or partial.

use crate::error::ChurnError;
use mongodb::bson::{doc, Bson, Document};
use mongodb::sync::{Client, Collection};
use polars::prelude::*;
use tracing::{debug, info};

pub const DEFAULT_DATABASE: &str = "saas_analytics";
pub const DEFAULT_COLLECTION: &str = "accounts_master";

/// Connection settings, built once at startup and passed down
#[derive(Debug, Clone)]
pub struct StoreConfig {
    pub uri: String,
    pub database: String,
    pub collection: String,
}

/// Storage for the master row set
pub trait MasterStore {
    /// Replace the whole collection with `documents`, returning how many
    /// were written
    fn replace_all(&mut self, documents: Vec<Document>) -> Result<usize, ChurnError>;

    /// Every stored document, without the store-assigned `_id`
    fn fetch_all(&self) -> Result<Vec<Document>, ChurnError>;

    /// Release the store. Consumes it so it cannot be used after.
    fn close(self)
    where
        Self: Sized;
}

/// Replace the store contents and close it, whether or not the write
/// succeeded
pub fn replace_and_close<S: MasterStore>(
    mut store: S,
    documents: Vec<Document>,
) -> Result<usize, ChurnError> {
    let replaced = store.replace_all(documents);
    store.close();
    replaced
}

/// Read every document and close the store, whether or not the read
/// succeeded
pub fn fetch_and_close<S: MasterStore>(store: S) -> Result<Vec<Document>, ChurnError> {
    let fetched = store.fetch_all();
    store.close();
    fetched
}

/// MongoDB-backed store using the blocking driver
pub struct MongoStore {
    client: Client,
    collection: Collection<Document>,
}

impl MongoStore {
    /// Open a client and bind the configured collection
    pub fn connect(config: &StoreConfig) -> Result<Self, ChurnError> {
        let client = Client::with_uri_str(&config.uri)?;
        let collection = client
            .database(&config.database)
            .collection::<Document>(&config.collection);

        info!(
            database = %config.database,
            collection = %config.collection,
            "document store connected"
        );

        Ok(Self { client, collection })
    }
}

impl MasterStore for MongoStore {
    fn replace_all(&mut self, documents: Vec<Document>) -> Result<usize, ChurnError> {
        let deleted = self.collection.delete_many(doc! {}).run()?;
        debug!(deleted = deleted.deleted_count, "previous master rows removed");

        if documents.is_empty() {
            return Ok(0);
        }

        let inserted = self.collection.insert_many(documents).run()?;
        Ok(inserted.inserted_ids.len())
    }

    fn fetch_all(&self) -> Result<Vec<Document>, ChurnError> {
        let cursor = self
            .collection
            .find(doc! {})
            .projection(doc! { "_id": 0 })
            .run()?;
        let documents = cursor.collect::<Result<Vec<_>, _>>()?;
        Ok(documents)
    }

    /// Shut the client down, waiting for its connections to close
    fn close(self) {
        drop(self.collection);
        self.client.shutdown().run();
        debug!("document store closed");
    }
}

/// In-process store with the same replace semantics
#[derive(Debug, Default)]
pub struct MemoryStore {
    documents: Vec<Document>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl MasterStore for MemoryStore {
    fn replace_all(&mut self, documents: Vec<Document>) -> Result<usize, ChurnError> {
        self.documents = documents;
        Ok(self.documents.len())
    }

    fn fetch_all(&self) -> Result<Vec<Document>, ChurnError> {
        Ok(self
            .documents
            .iter()
            .map(|d| {
                let mut d = d.clone();
                d.remove("_id");
                d
            })
            .collect())
    }

    fn close(self) {
        debug!(documents = self.documents.len(), "memory store closed");
    }
}

/// Serialize every row of `df` as a flat document keyed by column name
pub fn frame_to_documents(df: &DataFrame) -> crate::Result<Vec<Document>> {
    let columns = df.get_columns();
    let mut documents = Vec::with_capacity(df.height());

    for row in 0..df.height() {
        let mut document = Document::new();
        for series in columns {
            document.insert(series.name().to_string(), to_bson(series.get(row)?));
        }
        documents.push(document);
    }

    Ok(documents)
}

fn to_bson(value: AnyValue) -> Bson {
    match value {
        AnyValue::Null => Bson::Null,
        AnyValue::Boolean(v) => Bson::Boolean(v),
        AnyValue::String(v) => Bson::String(v.to_string()),
        AnyValue::StringOwned(v) => Bson::String(v.to_string()),
        AnyValue::Int8(v) => Bson::Int32(v.into()),
        AnyValue::Int16(v) => Bson::Int32(v.into()),
        AnyValue::Int32(v) => Bson::Int32(v),
        AnyValue::Int64(v) => Bson::Int64(v),
        AnyValue::UInt8(v) => Bson::Int32(v.into()),
        AnyValue::UInt16(v) => Bson::Int32(v.into()),
        AnyValue::UInt32(v) => Bson::Int64(v.into()),
        AnyValue::UInt64(v) => Bson::Int64(i64::try_from(v).unwrap_or(i64::MAX)),
        AnyValue::Float32(v) => Bson::Double(v.into()),
        AnyValue::Float64(v) => Bson::Double(v),
        other => Bson::String(other.to_string()),
    }
}

/// Numeric field of a document; missing or non-numeric values read as 0
pub fn number_field(document: &Document, key: &str) -> f64 {
    match document.get(key) {
        Some(Bson::Double(v)) if v.is_finite() => *v,
        Some(Bson::Int32(v)) => f64::from(*v),
        Some(Bson::Int64(v)) => *v as f64,
        Some(Bson::Boolean(v)) => f64::from(u8::from(*v)),
        Some(Bson::String(v)) => v.trim().parse().unwrap_or(0.0),
        _ => 0.0,
    }
}

/// Text field of a document; missing and null values read as `None`
pub fn text_field(document: &Document, key: &str) -> Option<String> {
    match document.get(key) {
        None | Some(Bson::Null) => None,
        Some(Bson::String(v)) if v.is_empty() => None,
        Some(Bson::String(v)) => Some(v.clone()),
        Some(other) => Some(other.to_string()),
    }
}
