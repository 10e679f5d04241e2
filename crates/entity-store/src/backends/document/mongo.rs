//! MongoDB document client.

use async_trait::async_trait;
use futures::stream::{StreamExt, TryStreamExt};
use mongodb::bson::doc;
use mongodb::error::{ErrorKind, WriteFailure};
use mongodb::{Client, Collection, Database};

use super::client::{
    DocumentApi, DocumentClientError, DocumentStream, StoredDocument, StoredRevision,
};

const DUPLICATE_KEY_CODE: i32 = 11000;

/// A [`DocumentApi`] backed by a MongoDB database.
///
/// Entities live in `<collection>` and revisions in
/// `<collection>_revisions`.
#[derive(Debug, Clone)]
pub struct MongoDocumentClient {
    client: Client,
    database: Database,
    documents: Collection<StoredDocument>,
    revisions: Collection<StoredRevision>,
}

impl MongoDocumentClient {
    /// Connects using a `mongodb://` or `mongodb+srv://` URI.
    ///
    /// The driver connects lazily; call [`DocumentApi::ping`] to verify
    /// reachability.
    pub async fn connect(
        uri: &str,
        database_name: &str,
        collection: &str,
    ) -> Result<Self, DocumentClientError> {
        let client = Client::with_uri_str(uri).await.map_err(map_mongo_error)?;
        let database = client.database(database_name);
        let documents = database.collection::<StoredDocument>(collection);
        let revisions = database.collection::<StoredRevision>(&format!("{}_revisions", collection));
        Ok(Self {
            client,
            database,
            documents,
            revisions,
        })
    }
}

#[async_trait]
impl DocumentApi for MongoDocumentClient {
    fn client_name(&self) -> &'static str {
        "mongodb"
    }

    async fn ping(&self) -> Result<(), DocumentClientError> {
        self.database
            .run_command(doc! { "ping": 1 })
            .await
            .map_err(map_mongo_error)?;
        Ok(())
    }

    async fn insert_if_absent(&self, doc: &StoredDocument) -> Result<(), DocumentClientError> {
        self.documents
            .insert_one(doc)
            .await
            .map_err(map_mongo_error)?;
        Ok(())
    }

    async fn replace_if_version(
        &self,
        doc: &StoredDocument,
        expected_version: u64,
    ) -> Result<(), DocumentClientError> {
        let expected = to_i64(expected_version)?;
        let result = self
            .documents
            .replace_one(
                doc! {
                    "_id": doc.key.as_str(),
                    "partitionKey": doc.partition_key.as_str(),
                    "version": expected,
                },
                doc,
            )
            .await
            .map_err(map_mongo_error)?;
        if result.matched_count == 0 {
            return Err(DocumentClientError::PreconditionFailed);
        }
        Ok(())
    }

    async fn find_one(&self, key: &str) -> Result<Option<StoredDocument>, DocumentClientError> {
        self.documents
            .find_one(doc! { "_id": key })
            .await
            .map_err(map_mongo_error)
    }

    async fn find(&self, partition_key: Option<&str>) -> Result<DocumentStream, DocumentClientError> {
        let filter = match partition_key {
            Some(pk) => doc! { "partitionKey": pk },
            None => doc! {},
        };
        let cursor = self
            .documents
            .find(filter)
            .sort(doc! { "_id": 1 })
            .await
            .map_err(map_mongo_error)?;
        Ok(cursor.map_err(map_mongo_error).boxed())
    }

    async fn append_revision(&self, revision: &StoredRevision) -> Result<(), DocumentClientError> {
        self.revisions
            .insert_one(revision)
            .await
            .map_err(map_mongo_error)?;
        Ok(())
    }

    async fn revisions(&self, entity_key: &str) -> Result<Vec<StoredRevision>, DocumentClientError> {
        self.revisions
            .find(doc! { "entityKey": entity_key })
            .sort(doc! { "version": 1 })
            .await
            .map_err(map_mongo_error)?
            .try_collect()
            .await
            .map_err(map_mongo_error)
    }

    async fn close(&self) -> Result<(), DocumentClientError> {
        self.client.clone().shutdown().await;
        Ok(())
    }
}

fn to_i64(version: u64) -> Result<i64, DocumentClientError> {
    i64::try_from(version)
        .map_err(|_| DocumentClientError::Internal(format!("version {} exceeds i64", version)))
}

fn map_mongo_error(err: mongodb::error::Error) -> DocumentClientError {
    match err.kind.as_ref() {
        ErrorKind::Write(WriteFailure::WriteError(e)) if e.code == DUPLICATE_KEY_CODE => {
            DocumentClientError::Duplicate
        }
        ErrorKind::ServerSelection { .. } | ErrorKind::Io(_) | ErrorKind::ConnectionPoolCleared { .. } => {
            DocumentClientError::Unavailable(err.to_string())
        }
        ErrorKind::BsonDeserialization(_) => DocumentClientError::Corrupt(err.to_string()),
        _ => DocumentClientError::Internal(err.to_string()),
    }
}
