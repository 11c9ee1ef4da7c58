use bson::{Bson, Document as BsonDocument, doc};
use mongodb::{Collection, Database};

use crate::conversions::bson::{key_from_bson, key_to_bson};
use crate::error::MstreamResult;
use crate::store::progress::DumpProgressStore;
use crate::store::resume::ResumePositionStore;
use crate::types::{DumpProgress, ResumeMarker};

const TOKEN_FIELD: &str = "token";
const COUNT_FIELD: &str = "count";
const COMPLETE_DATE_FIELD: &str = "completeDate";

/// Stores state as one record per collection, keyed by collection name, in two collections of
/// the source database.
#[derive(Debug, Clone)]
pub struct MongoStore {
    resume_markers: Collection<BsonDocument>,
    dump_progress: Collection<BsonDocument>,
}

impl MongoStore {
    pub fn new(
        database: &Database,
        resume_markers_collection: &str,
        dump_progress_collection: &str,
    ) -> Self {
        Self {
            resume_markers: database.collection(resume_markers_collection),
            dump_progress: database.collection(dump_progress_collection),
        }
    }
}

impl ResumePositionStore for MongoStore {
    async fn get_resume_marker(&self, collection: &str) -> MstreamResult<Option<ResumeMarker>> {
        let record = self
            .resume_markers
            .find_one(doc! { "_id": collection })
            .await?;

        let Some(token) = record
            .as_ref()
            .and_then(|record| record.get_document(TOKEN_FIELD).ok())
        else {
            return Ok(None);
        };

        Ok(Some(ResumeMarker::new(bson::to_vec(token)?)))
    }

    async fn write_resume_marker(
        &self,
        collection: &str,
        marker: Option<&ResumeMarker>,
    ) -> MstreamResult<()> {
        match marker {
            Some(marker) => {
                let token = bson::from_slice::<BsonDocument>(marker.as_bytes())?;
                self.resume_markers
                    .update_one(
                        doc! { "_id": collection },
                        doc! { "$set": { TOKEN_FIELD: token } },
                    )
                    .upsert(true)
                    .await?;
            }
            None => {
                self.resume_markers
                    .delete_one(doc! { "_id": collection })
                    .await?;
            }
        }

        Ok(())
    }
}

impl DumpProgressStore for MongoStore {
    async fn get_dump_progress(&self, collection: &str) -> MstreamResult<Option<DumpProgress>> {
        let Some(record) = self
            .dump_progress
            .find_one(doc! { "_id": collection })
            .await?
        else {
            return Ok(None);
        };

        let last_key = match record.get(TOKEN_FIELD) {
            None | Some(Bson::Null) => None,
            Some(token) => Some(key_from_bson(token.clone())),
        };
        let count = match record.get(COUNT_FIELD) {
            Some(Bson::Int64(count)) => u64::try_from(*count).unwrap_or(0),
            Some(Bson::Int32(count)) => u64::try_from(*count).unwrap_or(0),
            _ => 0,
        };
        let completed_at = match record.get(COMPLETE_DATE_FIELD) {
            Some(Bson::DateTime(date)) => Some(date.to_chrono()),
            _ => None,
        };

        let progress = DumpProgress {
            last_key,
            count,
            start_count: 0,
            completed_at,
        };

        Ok(Some(progress.loaded()))
    }

    async fn write_dump_progress(
        &self,
        collection: &str,
        progress: &DumpProgress,
    ) -> MstreamResult<()> {
        let token = match &progress.last_key {
            Some(key) => key_to_bson(key)?,
            None => Bson::Null,
        };
        let completed_at = progress
            .completed_at
            .map_or(Bson::Null, |date| Bson::DateTime(bson::DateTime::from_chrono(date)));
        let count = i64::try_from(progress.count).unwrap_or(i64::MAX);

        self.dump_progress
            .update_one(
                doc! { "_id": collection },
                doc! { "$set": {
                    TOKEN_FIELD: token,
                    COUNT_FIELD: count,
                    COMPLETE_DATE_FIELD: completed_at,
                } },
            )
            .upsert(true)
            .await?;

        Ok(())
    }

    async fn reset_dump_progress(&self, collection: &str) -> MstreamResult<DumpProgress> {
        let progress = DumpProgress::default();
        self.write_dump_progress(collection, &progress).await?;

        Ok(progress)
    }
}
