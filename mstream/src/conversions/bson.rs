use bson::oid::ObjectId;
use bson::{Bson, Document as BsonDocument};
use serde_json::{Number, Value};

use crate::error::{ErrorKind, MstreamResult};
use crate::mstream_error;
use crate::types::{Document, DocumentKey};

const ID_FIELD: &str = "_id";

/// Converts a BSON value to JSON.
///
/// Object ids become their hex string and dates become RFC 3339 strings, which is what the
/// destination indexes them as. Other non-JSON types use relaxed extended JSON.
pub fn bson_to_json(value: Bson) -> Value {
    match value {
        Bson::Null | Bson::Undefined => Value::Null,
        Bson::Boolean(value) => Value::Bool(value),
        Bson::Int32(value) => Value::from(value),
        Bson::Int64(value) => Value::from(value),
        Bson::Double(value) => Number::from_f64(value).map_or(Value::Null, Value::Number),
        Bson::String(value) | Bson::Symbol(value) => Value::String(value),
        Bson::ObjectId(oid) => Value::String(oid.to_hex()),
        Bson::DateTime(date) => match date.try_to_rfc3339_string() {
            Ok(date) => Value::String(date),
            Err(_) => Value::from(date.timestamp_millis()),
        },
        Bson::Decimal128(value) => Value::String(value.to_string()),
        Bson::Array(values) => Value::Array(values.into_iter().map(bson_to_json).collect()),
        Bson::Document(document) => Value::Object(document_to_json(document)),
        other => other.into_relaxed_extjson(),
    }
}

pub fn document_to_json(document: BsonDocument) -> Document {
    document
        .into_iter()
        .map(|(key, value)| (key, bson_to_json(value)))
        .collect()
}

/// Splits a source document into its key and its remaining fields.
pub fn split_document(mut document: BsonDocument) -> MstreamResult<(DocumentKey, Document)> {
    let id = document.remove(ID_FIELD).ok_or_else(|| {
        mstream_error!(ErrorKind::InvalidData, "Document has no `_id` field")
    })?;

    Ok((key_from_bson(id), document_to_json(document)))
}

/// Converts an `_id` value to a key. Every BSON type is accepted; types without a dedicated
/// variant keep their canonical extended JSON so [`key_to_bson`] restores them exactly.
pub fn key_from_bson(value: Bson) -> DocumentKey {
    match value {
        Bson::ObjectId(oid) => DocumentKey::ObjectId(oid.to_hex()),
        Bson::Int32(value) => DocumentKey::Int(value.into()),
        Bson::Int64(value) => DocumentKey::Int(value),
        Bson::String(value) => DocumentKey::String(value),
        other => {
            let id = match &other {
                Bson::Double(value) => value.to_string(),
                other => other.clone().into_relaxed_extjson().to_string(),
            };

            DocumentKey::Other {
                id,
                extended_json: other.into_canonical_extjson().to_string(),
            }
        }
    }
}

pub fn key_to_bson(key: &DocumentKey) -> MstreamResult<Bson> {
    match key {
        DocumentKey::Int(value) => Ok(Bson::Int64(*value)),
        DocumentKey::String(value) => Ok(Bson::String(value.clone())),
        DocumentKey::ObjectId(hex) => ObjectId::parse_str(hex)
            .map(Bson::ObjectId)
            .map_err(|err| {
                mstream_error!(ErrorKind::ConversionError, "Invalid object id", err)
            }),
        DocumentKey::Other { extended_json, .. } => {
            let value: Value = serde_json::from_str(extended_json)?;

            Bson::try_from(value).map_err(|err| {
                mstream_error!(ErrorKind::ConversionError, "Invalid extended JSON key", err)
            })
        }
    }
}
