use std::path::PathBuf;

use futures::future::BoxFuture;
use serde_json::Value;
use tracing::debug;
use uuid::Uuid;

use tollgate_core::error::Result;
use tollgate_core::traits::OutputSink;

/// Writes each composed flyer to `<dir>/flyer_<uuid>.json`.
pub struct JsonFileSink {
    dir: PathBuf,
}

impl JsonFileSink {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }
}

impl OutputSink for JsonFileSink {
    fn write(&self, output: &Value) -> BoxFuture<'_, Result<String>> {
        let body = serde_json::to_vec_pretty(output);
        Box::pin(async move {
            let body = body?;
            tokio::fs::create_dir_all(&self.dir).await?;
            let path = self.dir.join(format!("flyer_{}.json", Uuid::new_v4()));
            tokio::fs::write(&path, body).await?;
            debug!(path = %path.display(), "Flyer persisted");
            Ok(path.display().to_string())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_writes_pretty_json_file() {
        let dir = tempfile::tempdir().unwrap();
        let sink = JsonFileSink::new(dir.path().join("out"));
        let flyer = json!({"headline": "Summer Jazz", "image": "https://images.test/1.png"});

        let location = sink.write(&flyer).await.unwrap();
        let path = PathBuf::from(&location);
        let name = path.file_name().unwrap().to_string_lossy().to_string();
        assert!(name.starts_with("flyer_"));
        assert!(name.ends_with(".json"));

        let written: Value =
            serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(written, flyer);
    }

    #[tokio::test]
    async fn test_each_write_gets_a_fresh_file() {
        let dir = tempfile::tempdir().unwrap();
        let sink = JsonFileSink::new(dir.path());
        let a = sink.write(&json!({"n": 1})).await.unwrap();
        let b = sink.write(&json!({"n": 2})).await.unwrap();
        assert_ne!(a, b);
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 2);
    }
}
