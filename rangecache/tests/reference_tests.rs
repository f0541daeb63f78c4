//! Reference filesystem setup and stale-manifest recovery

mod common;

#[cfg(test)]
mod tests {
    use super::common::{CountingFileSystem, init_tracing, memory_store, source_bytes};
    use bytes::Bytes;
    use rangecache::core::RangeCacheError;
    use rangecache::fs::{
        FileSystem, ManifestSource, ReferenceConfig, ReferenceFileSystem, SharedFileSystem,
    };
    use rangecache::store::SharedStore;
    use serde_json::json;
    use std::sync::Arc;

    async fn target_with_manifest(manifest: serde_json::Value) -> Arc<CountingFileSystem> {
        let fs = CountingFileSystem::new();
        fs.pipe_file("/data/blob.bin", Bytes::from(source_bytes(100)))
            .await
            .unwrap();
        fs.pipe_file("/refs.json", Bytes::from(manifest.to_string()))
            .await
            .unwrap();
        fs
    }

    fn config(target: &Arc<CountingFileSystem>, store: &SharedStore) -> ReferenceConfig {
        ReferenceConfig::new(ManifestSource::Path("/refs.json".to_string()))
            .with_fs(target.clone() as SharedFileSystem)
            .with_store(store.clone())
            .with_key_prefix("ref")
    }

    #[tokio::test]
    async fn test_manifest_and_references_are_cached() {
        let target = target_with_manifest(json!({
            "version": 1,
            "templates": {"blob": "/data/blob.bin"},
            "refs": {
                "group/.meta": "{\"kind\": \"group\"}",
                "group/part.0": ["{{blob}}", 10, 20],
                "whole": ["/data/blob.bin"]
            }
        }))
        .await;
        let store = memory_store();

        let first = ReferenceFileSystem::new(config(&target, &store)).await.unwrap();
        assert_eq!(target.cat_calls(), 1);
        assert_eq!(
            first.cat("group/part.0").await.unwrap(),
            Bytes::from(source_bytes(100)[10..30].to_vec())
        );
        assert_eq!(first.cat("whole").await.unwrap().len(), 100);
        assert_eq!(target.cat_calls(), 3);

        // A second instance finds the manifest and both references in the store
        let second = ReferenceFileSystem::new(config(&target, &store)).await.unwrap();
        second.cat("group/part.0").await.unwrap();
        second.cat("/whole").await.unwrap();
        assert_eq!(target.cat_calls(), 3);
        assert_eq!(second.stats().hits, 3);

        let keys = second.cached_keys().await.unwrap();
        assert!(keys.contains("ref-/refs.json"));
        assert!(keys.contains("ref-/refs.json-group/part.0"));
        assert!(keys.contains("ref-/refs.json-whole"));
    }

    #[tokio::test]
    async fn test_listing_and_ranges() {
        let target = target_with_manifest(json!({
            "a/x": "base64:AAECAwQ=",
            "a/y": ["/data/blob.bin", 0, 50],
            "b": "plain"
        }))
        .await;
        let fs = ReferenceFileSystem::new(config(&target, &memory_store()))
            .await
            .unwrap();

        let names: Vec<String> = fs.ls("/").await.unwrap().into_iter().map(|i| i.name).collect();
        assert_eq!(names, vec!["a".to_string(), "b".to_string()]);

        let info = fs.info("a/y").await.unwrap();
        assert!(info.is_file());
        assert_eq!(info.size, 50);
        assert!(fs.info("a").await.unwrap().is_dir());

        assert_eq!(
            fs.cat_file("a/x", Some(1), Some(3)).await.unwrap(),
            Bytes::from_static(&[1, 2])
        );
        assert!(matches!(
            fs.cat("missing").await,
            Err(RangeCacheError::NotFound(_))
        ));
        assert!(matches!(
            fs.pipe_file("a/z", Bytes::new()).await,
            Err(RangeCacheError::Unsupported(_))
        ));
    }

    #[tokio::test]
    async fn test_stale_manifest_is_invalidated_and_reloaded() {
        init_tracing();
        let target = target_with_manifest(json!({
            "refs": {"part": ["/data/blob.bin", 40, 10]}
        }))
        .await;
        let store = memory_store();

        // Manifest cached before the blob shrank to 100 bytes
        let stale = json!({"refs": {"part": ["/data/blob.bin", 400, 10]}});
        store
            .set("ref-/refs.json", Bytes::from(stale.to_string()), None)
            .await
            .unwrap();
        store
            .set("ref-/refs.json-part", Bytes::from_static(b"old"), None)
            .await
            .unwrap();

        let fs = ReferenceFileSystem::new(config(&target, &store)).await.unwrap();

        assert_eq!(
            fs.cat("part").await.unwrap(),
            Bytes::from(source_bytes(100)[40..50].to_vec())
        );
        let cached = store.get("ref-/refs.json").await.unwrap().unwrap();
        let cached: serde_json::Value = serde_json::from_slice(&cached).unwrap();
        assert_eq!(cached["refs"]["part"][1], 40);
    }

    #[tokio::test]
    async fn test_second_setup_failure_propagates() {
        let target = target_with_manifest(json!({
            "refs": {"part": ["/data/blob.bin", 95, 10]}
        }))
        .await;
        let store = memory_store();

        let err = ReferenceFileSystem::new(config(&target, &store))
            .await
            .unwrap_err();

        assert!(matches!(err, RangeCacheError::InvalidReference(_)));
        // Manifest was fetched once per attempt
        assert_eq!(target.cat_calls(), 2);
    }

    #[tokio::test]
    async fn test_missing_target_file_is_invalid() {
        let target = target_with_manifest(json!({"x": ["/data/gone.bin"]})).await;

        let err = ReferenceFileSystem::new(config(&target, &memory_store()))
            .await
            .unwrap_err();
        assert!(matches!(err, RangeCacheError::InvalidReference(_)));
    }
}
