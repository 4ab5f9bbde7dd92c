//! Map state item sources and sinks: `ItemReader`, `ItemBatcher`,
//! `ResultWriter`.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::definition::{Dynamic, LiteralOrExpr};

/// Reads the item list from a resource instead of the state input.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ItemReader {
    pub resource: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reader_config: Option<ReaderConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parameters: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub arguments: Option<Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ReaderConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_items: Option<LiteralOrExpr<u64>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_items_path: Option<String>,
    /// Reader-specific settings (`InputType`, `CSVHeaders`, ...), passed
    /// through untouched.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl ItemReader {
    pub fn max_items(&self) -> Option<Dynamic<u64>> {
        let config = self.reader_config.as_ref()?;
        Dynamic::from_fields(&config.max_items, &config.max_items_path)
    }
}

/// Groups items into batches of `{ "Items": [...], "BatchInput": ... }`.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ItemBatcher {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_items_per_batch: Option<LiteralOrExpr<u64>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_items_per_batch_path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_input_bytes_per_batch: Option<LiteralOrExpr<u64>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_input_bytes_per_batch_path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub batch_input: Option<Value>,
}

impl ItemBatcher {
    pub fn max_items_per_batch(&self) -> Option<Dynamic<u64>> {
        Dynamic::from_fields(&self.max_items_per_batch, &self.max_items_per_batch_path)
    }

    pub fn max_input_bytes_per_batch(&self) -> Option<Dynamic<u64>> {
        Dynamic::from_fields(
            &self.max_input_bytes_per_batch,
            &self.max_input_bytes_per_batch_path,
        )
    }
}

/// Sends each Map output through a resource call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ResultWriter {
    pub resource: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub writer_config: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parameters: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub arguments: Option<Value>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn reader_config_keeps_unknown_settings() {
        let doc = json!({
            "Resource": "arn:reader",
            "ReaderConfig": { "MaxItemsPath": "$.limit", "InputType": "JSON" }
        });
        let reader: ItemReader = serde_json::from_value(doc.clone()).unwrap();
        assert_eq!(reader.max_items(), Some(Dynamic::Path("$.limit".to_string())));
        assert_eq!(serde_json::to_value(&reader).unwrap(), doc);
    }

    #[test]
    fn batcher_limits() {
        let batcher: ItemBatcher = serde_json::from_value(json!({
            "MaxItemsPerBatch": 2,
            "MaxInputBytesPerBatchPath": "$.bytes"
        }))
        .unwrap();
        assert_eq!(batcher.max_items_per_batch(), Some(Dynamic::Literal(2)));
        assert_eq!(
            batcher.max_input_bytes_per_batch(),
            Some(Dynamic::Path("$.bytes".to_string()))
        );
    }
}
