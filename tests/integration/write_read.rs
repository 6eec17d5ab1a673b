//! Integration test: write/read.
//!
//! Upload objects of varying sizes to a storage node, read them back and
//! query them, and verify content-addressed deduplication.

use reef_integration_tests::{ReefCluster, test_data, test_data_seeded};
use reef_store::relative_path;
use reef_types::Digest;

/// Sizes around the transfer chunk boundary, plus empty and large objects.
#[tokio::test]
async fn test_objects_varying_sizes() {
    let c = ReefCluster::new(1).await;

    let sizes = [0, 1, 4095, 4096, 4097, 100_000];
    let mut objects = Vec::new();
    for (i, size) in sizes.iter().enumerate() {
        let data = test_data_seeded(*size, i as u32 + 1);
        let path = c.upload(0, &data, "bin").await;
        assert_eq!(
            path,
            format!("{}.bin", relative_path(&Digest::from_data(&data)))
        );
        objects.push((path, data));
    }

    for (path, expected) in &objects {
        let got = c.download(0, path).await;
        assert_eq!(&got, expected, "object {path} mismatch");
    }

    c.shutdown().await;
}

/// The same bytes uploaded twice are stored and catalogued once.
#[tokio::test]
async fn test_duplicate_upload_stored_once() {
    let c = ReefCluster::new(1).await;
    let data = test_data(10_000);

    let first = c.upload(0, &data, "").await;
    let second = c.upload(0, &data, "").await;
    assert_eq!(first, second);

    let store = c.storage(0).node().store();
    assert_eq!(store.list().await.unwrap(), vec![Digest::from_data(&data)]);
    assert_eq!(store.staged_count().await.unwrap(), 0);
    assert_eq!(c.tracker().meta().catalog_len().unwrap(), 1);

    c.shutdown().await;
}

/// Query answers by path and by bare digest.
#[tokio::test]
async fn test_query_before_and_after_upload() {
    let c = ReefCluster::new(1).await;
    let server = c.storage_endpoint(0);
    let data = test_data(2048);
    let digest = Digest::from_data(&data);

    let before = c.client().query(&server, &digest.to_hex()).await.unwrap();
    assert!(!before.exists);

    let path = c.upload(0, &data, "txt").await;
    for key in [path, digest.to_hex()] {
        let after = c.client().query(&server, &key).await.unwrap();
        assert!(after.exists);
        assert_eq!(after.file_size, 2048);
    }

    c.shutdown().await;
}
