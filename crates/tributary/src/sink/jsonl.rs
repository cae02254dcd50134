use std::collections::HashMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::Serialize;
use tokio::fs::{self, File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;

use super::{Sink, SinkError};
use crate::record::Record;

const RUN_CONTEXT_FILE: &str = "run_context.json";
const ERRORS_FILE: &str = "errors.jsonl";

/// Collection names whose files would shadow the sink's own files.
const RESERVED_COLLECTIONS: &[&str] = &["errors", "run_context"];

#[derive(Serialize)]
struct Line<'a> {
    id: &'a str,
    properties: &'a Record,
}

#[derive(Serialize)]
struct ErrorLine<'a> {
    collection: &'a str,
    message: &'a str,
}

/// A sink that appends JSON lines to one file per collection.
///
/// ```text
/// <dir>/<collection>.jsonl   {"id": ..., "properties": {...}} per upsert
/// <dir>/errors.jsonl         {"collection": ..., "message": ...} per report
/// <dir>/run_context.json     the opaque run context
/// ```
///
/// Upserts are appended, so a record written twice appears twice; readers
/// keep the last line per id. Collection names must be plain file stems:
/// empty names, path separators, `..` and the reserved names `errors` and
/// `run_context` are rejected.
pub struct JsonlSink {
    dir: PathBuf,
    files: Mutex<HashMap<String, File>>,
}

impl JsonlSink {
    /// Open a sink in `dir`, creating the directory if needed.
    pub async fn create(dir: impl Into<PathBuf>) -> Result<Self, SinkError> {
        let dir = dir.into();
        fs::create_dir_all(&dir).await?;
        tracing::debug!(dir = %dir.display(), "opened jsonl sink");
        Ok(Self {
            dir,
            files: Mutex::new(HashMap::new()),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    async fn append(&self, file_name: String, line: Vec<u8>) -> Result<(), std::io::Error> {
        let mut files = self.files.lock().await;
        let file = match files.entry(file_name) {
            std::collections::hash_map::Entry::Occupied(entry) => entry.into_mut(),
            std::collections::hash_map::Entry::Vacant(entry) => {
                let path = self.dir.join(entry.key());
                let file = OpenOptions::new()
                    .create(true)
                    .append(true)
                    .open(path)
                    .await?;
                entry.insert(file)
            }
        };
        file.write_all(&line).await?;
        file.flush().await
    }
}

fn collection_file(collection: &str) -> Result<String, String> {
    if collection.is_empty()
        || collection.contains(['/', '\\'])
        || collection.contains("..")
        || RESERVED_COLLECTIONS.contains(&collection)
    {
        return Err(format!("invalid collection name {collection:?}"));
    }
    Ok(format!("{collection}.jsonl"))
}

fn encode_line<T: Serialize>(value: &T) -> Result<Vec<u8>, serde_json::Error> {
    let mut line = serde_json::to_vec(value)?;
    line.push(b'\n');
    Ok(line)
}

#[async_trait]
impl Sink for JsonlSink {
    async fn upsert(&self, collection: &str, id: &str, properties: &Record) -> Result<(), SinkError> {
        let write_err = |message: String| SinkError::Write {
            collection: collection.to_string(),
            id: id.to_string(),
            message,
        };
        let file_name = collection_file(collection).map_err(write_err)?;
        let line = encode_line(&Line { id, properties }).map_err(|e| write_err(e.to_string()))?;
        self.append(file_name, line)
            .await
            .map_err(|e| write_err(e.to_string()))
    }

    async fn load_run_context(&self) -> Result<Option<Vec<u8>>, SinkError> {
        match fs::read(self.dir.join(RUN_CONTEXT_FILE)).await {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(SinkError::Context(e.to_string())),
        }
    }

    async fn save_run_context(&self, context: &[u8]) -> Result<(), SinkError> {
        let path = self.dir.join(RUN_CONTEXT_FILE);
        let tmp = self.dir.join(format!("{RUN_CONTEXT_FILE}.tmp"));
        fs::write(&tmp, context)
            .await
            .map_err(|e| SinkError::Context(e.to_string()))?;
        fs::rename(&tmp, &path)
            .await
            .map_err(|e| SinkError::Context(e.to_string()))
    }

    async fn report_collection_error(&self, message: &str, collection: &str) -> Result<(), SinkError> {
        let line = encode_line(&ErrorLine { collection, message })
            .map_err(|e| SinkError::Context(e.to_string()))?;
        self.append(ERRORS_FILE.to_string(), line).await?;
        Ok(())
    }
}
