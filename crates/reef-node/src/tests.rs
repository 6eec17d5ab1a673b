//! Tests for the reef-node crate: tracker and storage services over real
//! loopback connections.

#[cfg(test)]
mod tests {
    use std::net::SocketAddr;
    use std::sync::Arc;
    use std::time::Duration;

    use async_trait::async_trait;
    use reef_meta::MetaStore;
    use reef_net::message::{
        RegisterStorageRequest, RegisterStorageResponse, StatusResponse, SyncPullRequest,
        ValidateRequest,
    };
    use reef_net::{
        ConnectionPool, NetError, Opcode, PoolConfig, PoolStats, Status, read_frame,
        read_frame_or_eof, write_frame,
    };
    use reef_store::relative_path;
    use reef_types::{Digest, FileRecord, InstanceId, InstanceState, ServerEndpoint};
    use reef_worker::{WorkerConfig, WorkerPool};
    use serde::Serialize;
    use serde::de::DeserializeOwned;
    use tempfile::TempDir;
    use tokio::io::AsyncReadExt;
    use tokio::net::{TcpListener, TcpStream};
    use tokio::time;

    use crate::jobs::cursor_name;
    use crate::{
        Client, ConnectionHandler, NodeError, StorageConfig, StorageHandle, StorageNode,
        TrackerConfig, TrackerNode, spawn_server,
    };

    const SECRET: &str = "test-secret";

    /// Wait for a condition to become true within a timeout.
    async fn wait_for<F, Fut>(timeout: Duration, poll_interval: Duration, condition: F)
    where
        F: Fn() -> Fut,
        Fut: std::future::Future<Output = bool>,
    {
        let deadline = time::Instant::now() + timeout;
        loop {
            if condition().await {
                return;
            }
            if time::Instant::now() >= deadline {
                panic!("condition not met within {timeout:?}");
            }
            time::sleep(poll_interval).await;
        }
    }

    async fn start_tracker() -> TrackerNode {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let meta = Arc::new(MetaStore::open_temporary().unwrap());
        TrackerNode::start(TrackerConfig::test_config(SECRET), listener, meta).unwrap()
    }

    async fn start_storage(trackers: Vec<String>) -> (TempDir, StorageHandle) {
        let dir = tempfile::tempdir().unwrap();
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let config = StorageConfig::test_config(SECRET, dir.path(), trackers);
        let node = StorageNode::open(config, listener.local_addr().unwrap()).unwrap();
        let handle = StorageHandle::start(Arc::new(node), listener).unwrap();
        (dir, handle)
    }

    fn endpoint(addr: SocketAddr, secret: &str) -> ServerEndpoint {
        ServerEndpoint::new(&addr.ip().to_string(), addr.port(), secret)
    }

    fn test_client() -> Client {
        Client::new(Arc::new(ConnectionPool::new(PoolConfig::test_config())), 1024)
    }

    fn register_request(id: &str, port: u16) -> RegisterStorageRequest {
        RegisterStorageRequest {
            secret: SECRET.to_string(),
            bind_addr: "127.0.0.1".to_string(),
            advertise_addr: String::new(),
            group: "group1".to_string(),
            instance_id: InstanceId::from(id),
            port,
        }
    }

    async fn send<T: Serialize>(stream: &mut TcpStream, opcode: Opcode, meta: &T) {
        write_frame(stream, opcode, meta, 0).await.unwrap();
    }

    async fn recv<T: DeserializeOwned>(stream: &mut TcpStream) -> T {
        let frame = read_frame(stream).await.unwrap();
        assert_eq!(frame.opcode(), Opcode::Response);
        frame.decode_meta().unwrap()
    }

    // ---- connection state machine ----

    #[tokio::test]
    async fn test_bad_secret_rejected_and_closed() {
        let tracker = start_tracker().await;
        let mut stream = TcpStream::connect(tracker.local_addr()).await.unwrap();

        let validate = ValidateRequest {
            secret: "wrong".to_string(),
        };
        send(&mut stream, Opcode::ConnectValidate, &validate).await;
        let response: StatusResponse = recv(&mut stream).await;

        assert_eq!(response.status, Status::BadSecret);
        assert!(read_frame_or_eof(&mut stream).await.unwrap().is_none());
        tracker.shutdown().await;
    }

    #[tokio::test]
    async fn test_request_before_validation_rejected() {
        let tracker = start_tracker().await;
        let mut stream = TcpStream::connect(tracker.local_addr()).await.unwrap();

        send(&mut stream, Opcode::SyncPull, &SyncPullRequest { last_id: 0 }).await;
        let response: StatusResponse = recv(&mut stream).await;

        assert_eq!(response.status, Status::BadSecret);
        assert!(read_frame_or_eof(&mut stream).await.unwrap().is_none());
        tracker.shutdown().await;
    }

    #[tokio::test]
    async fn test_client_with_wrong_secret_fails_validation() {
        let tracker = start_tracker().await;
        let client = test_client();
        let server = endpoint(tracker.local_addr(), "wrong").tracker();

        let err = client.validate(&server).await.unwrap_err();
        assert!(matches!(err, NetError::BadSecret(_)), "got {err:?}");
        assert_eq!(client.pool().stats(&server), PoolStats::default());
        tracker.shutdown().await;
    }

    // ---- tracker ----

    #[tokio::test]
    async fn test_register_storage_as_first_message() {
        let tracker = start_tracker().await;
        let mut stream = TcpStream::connect(tracker.local_addr()).await.unwrap();

        let mut request = register_request("storage-a", 23001);
        request.bind_addr = "0.0.0.0".to_string();
        send(&mut stream, Opcode::RegisterStorage, &request).await;
        let response: RegisterStorageResponse = recv(&mut stream).await;

        assert_eq!(response.status, Status::Ok);
        assert_eq!(response.look_back_addr, "127.0.0.1");
        assert!(response.group_members.is_empty());

        let id = InstanceId::from("storage-a");
        let instance = tracker.registry().get(&id).await.unwrap();
        assert_eq!(instance.state, InstanceState::Hold);
        assert_eq!(instance.endpoint(), "127.0.0.1:23001");
        assert_eq!(instance.advertised_endpoint(), "127.0.0.1:23001");
        tracker.shutdown().await;
    }

    #[tokio::test]
    async fn test_closing_connection_releases_registration() {
        let tracker = start_tracker().await;
        let mut stream = TcpStream::connect(tracker.local_addr()).await.unwrap();
        send(
            &mut stream,
            Opcode::RegisterStorage,
            &register_request("storage-a", 23001),
        )
        .await;
        let _: RegisterStorageResponse = recv(&mut stream).await;
        drop(stream);

        let registry = tracker.registry().clone();
        wait_for(Duration::from_secs(3), Duration::from_millis(5), || {
            let registry = registry.clone();
            async move {
                registry
                    .get(&InstanceId::from("storage-a"))
                    .await
                    .is_none_or(|i| i.state == InstanceState::Free)
            }
        })
        .await;
        tracker.shutdown().await;
    }

    #[tokio::test]
    async fn test_register_conflict_reported() {
        let tracker = start_tracker().await;

        let mut first = TcpStream::connect(tracker.local_addr()).await.unwrap();
        send(
            &mut first,
            Opcode::RegisterStorage,
            &register_request("x", 23001),
        )
        .await;
        let ok: RegisterStorageResponse = recv(&mut first).await;
        assert_eq!(ok.status, Status::Ok);

        let mut second = TcpStream::connect(tracker.local_addr()).await.unwrap();
        send(
            &mut second,
            Opcode::RegisterStorage,
            &register_request("x", 23002),
        )
        .await;
        let conflict: RegisterStorageResponse = recv(&mut second).await;
        assert_eq!(conflict.status, Status::InstanceConflict);

        let kept = tracker.registry().get(&InstanceId::from("x")).await.unwrap();
        assert_eq!(kept.bind_port, 23001);
        tracker.shutdown().await;
    }

    #[tokio::test]
    async fn test_group_members_exclude_self() {
        let tracker = start_tracker().await;

        let mut a = TcpStream::connect(tracker.local_addr()).await.unwrap();
        send(&mut a, Opcode::RegisterStorage, &register_request("a", 23001)).await;
        let _: RegisterStorageResponse = recv(&mut a).await;

        let mut b = TcpStream::connect(tracker.local_addr()).await.unwrap();
        send(&mut b, Opcode::RegisterStorage, &register_request("b", 23002)).await;
        let response: RegisterStorageResponse = recv(&mut b).await;

        assert_eq!(response.group_members.len(), 1);
        let member = &response.group_members[0];
        assert_eq!(member.instance_id, InstanceId::from("a"));
        assert_eq!(member.addr, "127.0.0.1");
        assert_eq!(member.port, 23001);
        tracker.shutdown().await;
    }

    #[tokio::test]
    async fn test_catalog_register_and_pull() {
        let tracker = start_tracker().await;
        let client = test_client();
        let server = endpoint(tracker.local_addr(), SECRET).tracker();

        for data in [&b"one"[..], b"two"] {
            let file = FileRecord::single(
                Digest::from_data(data),
                data.len() as u64,
                InstanceId::from("s1"),
            );
            client.register_file(&server, file).await.unwrap();
        }

        let first = client.sync_pull(&server, 0).await.unwrap().unwrap();
        assert_eq!(first.id, 1);
        assert_eq!(first.md5, Digest::from_data(b"one"));
        let second = client.sync_pull(&server, first.id).await.unwrap().unwrap();
        assert_eq!(second.id, 2);
        assert!(client.sync_pull(&server, second.id).await.unwrap().is_none());

        // Every exchange, NOT_FOUND included, reused one connection.
        assert_eq!(
            client.pool().stats(&server),
            PoolStats { active: 1, idle: 1 }
        );
        tracker.shutdown().await;
    }

    #[tokio::test]
    async fn test_tracker_refuses_data_operations() {
        let tracker = start_tracker().await;
        let client = test_client();
        let server = endpoint(tracker.local_addr(), SECRET).tracker();

        let err = client.query(&server, "anything").await.unwrap_err();
        assert!(matches!(err, NetError::Status(Status::OperationNotSupported)));

        let mut sink = Vec::new();
        let err = client
            .download(&server, "anything", &mut sink)
            .await
            .unwrap_err();
        assert!(matches!(err, NetError::Status(Status::OperationNotSupported)));
        tracker.shutdown().await;
    }

    // ---- storage ----

    #[tokio::test]
    async fn test_upload_download_query() {
        let (_dir, storage) = start_storage(Vec::new()).await;
        let client = test_client();
        let server = endpoint(storage.local_addr(), SECRET);

        let data = b"hello reef, this spans several chunks ".repeat(100);
        let digest = Digest::from_data(&data);
        let path = client
            .upload(&server, &mut &data[..], data.len() as u64, "txt", Some(digest))
            .await
            .unwrap();
        assert_eq!(path, format!("{}.txt", relative_path(&digest)));

        let mut out = Vec::new();
        let (len, received) = client.download(&server, &path, &mut out).await.unwrap();
        assert_eq!(len, data.len() as u64);
        assert_eq!(received, digest);
        assert_eq!(out, data);

        for key in [path.clone(), digest.to_hex()] {
            let query = client.query(&server, &key).await.unwrap();
            assert!(query.exists);
            assert_eq!(query.file_size, data.len() as u64);
        }

        let missing = client
            .query(&server, &Digest::from_data(b"absent").to_hex())
            .await
            .unwrap();
        assert!(!missing.exists);
        assert_eq!(missing.file_size, 0);

        assert!(storage.node().meta().exists(&digest).unwrap());
        storage.shutdown().await;
    }

    #[tokio::test]
    async fn test_download_missing_is_not_found() {
        let (_dir, storage) = start_storage(Vec::new()).await;
        let client = test_client();
        let server = endpoint(storage.local_addr(), SECRET);

        let mut out = Vec::new();
        let err = client
            .download(&server, &Digest::from_data(b"absent").to_hex(), &mut out)
            .await
            .unwrap_err();
        assert!(matches!(err, NetError::Status(Status::NotFound)));
        assert!(out.is_empty());

        let err = client
            .download(&server, "not/a/path", &mut out)
            .await
            .unwrap_err();
        assert!(matches!(err, NetError::Status(Status::NotFound)));
        storage.shutdown().await;
    }

    #[tokio::test]
    async fn test_upload_digest_mismatch_stores_nothing() {
        let (_dir, storage) = start_storage(Vec::new()).await;
        let client = test_client();
        let server = endpoint(storage.local_addr(), SECRET);

        let data = b"payload".to_vec();
        let err = client
            .upload(
                &server,
                &mut &data[..],
                data.len() as u64,
                "",
                Some(Digest::from_data(b"something else")),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, NetError::Status(Status::InternalError)));

        let store = storage.node().store();
        assert!(!store.contains(&Digest::from_data(&data)).await.unwrap());
        assert_eq!(store.staged_count().await.unwrap(), 0);

        // The body was consumed, so the connection stays usable.
        let query = client.query(&server, &Digest::from_data(&data).to_hex()).await.unwrap();
        assert!(!query.exists);
        assert_eq!(client.pool().stats(&server).active, 1);
        storage.shutdown().await;
    }

    #[tokio::test]
    async fn test_storage_refuses_tracker_operations() {
        let (_dir, storage) = start_storage(Vec::new()).await;
        let client = test_client();
        let server = endpoint(storage.local_addr(), SECRET);

        let err = client.sync_pull(&server, 0).await.unwrap_err();
        assert!(matches!(err, NetError::Status(Status::OperationNotSupported)));
        storage.shutdown().await;
    }

    #[tokio::test]
    async fn test_upload_registers_once_with_tracker() {
        let tracker = start_tracker().await;
        let (_dir, storage) = start_storage(vec![tracker.local_addr().to_string()]).await;
        let client = test_client();
        let server = endpoint(storage.local_addr(), SECRET);

        let data = b"catalogued".to_vec();
        for _ in 0..2 {
            client
                .upload(&server, &mut &data[..], data.len() as u64, "", None)
                .await
                .unwrap();
        }

        assert_eq!(tracker.meta().catalog_len().unwrap(), 1);
        let file = tracker.meta().next_file_after(0).unwrap().unwrap();
        assert_eq!(file.md5, Digest::from_data(&data));
        assert_eq!(file.instance, *storage.node().id());
        assert_eq!(file.total_size(), data.len() as u64);

        storage.shutdown().await;
        tracker.shutdown().await;
    }

    // ---- background jobs ----

    #[tokio::test]
    async fn test_heartbeat_holds_and_shutdown_releases() {
        let tracker = start_tracker().await;
        let (_dir, storage) = start_storage(vec![tracker.local_addr().to_string()]).await;
        let id = storage.node().id().clone();
        let registry = tracker.registry().clone();

        wait_for(Duration::from_secs(3), Duration::from_millis(10), || {
            let registry = registry.clone();
            let id = id.clone();
            async move {
                registry
                    .get(&id)
                    .await
                    .is_some_and(|i| i.state == InstanceState::Hold)
            }
        })
        .await;
        let instance = registry.get(&id).await.unwrap();
        assert_eq!(instance.bind_port, storage.local_addr().port());

        storage.shutdown().await;

        wait_for(Duration::from_secs(3), Duration::from_millis(5), || {
            let registry = registry.clone();
            let id = id.clone();
            async move {
                registry
                    .get(&id)
                    .await
                    .is_none_or(|i| i.state == InstanceState::Free)
            }
        })
        .await;
        tracker.shutdown().await;
    }

    #[tokio::test]
    async fn test_heartbeat_learns_group_members() {
        let tracker = start_tracker().await;
        let trackers = vec![tracker.local_addr().to_string()];
        let (_da, a) = start_storage(trackers.clone()).await;
        let (_db, b) = start_storage(trackers).await;

        let node_a = a.node().clone();
        wait_for(Duration::from_secs(3), Duration::from_millis(10), || {
            let node_a = node_a.clone();
            async move { node_a.members().len() == 1 }
        })
        .await;
        assert_eq!(&a.node().members()[0].instance_id, b.node().id());

        a.shutdown().await;
        b.shutdown().await;
        tracker.shutdown().await;
    }

    #[tokio::test]
    async fn test_sync_replicates_to_group_member() {
        let tracker = start_tracker().await;
        let trackers = vec![tracker.local_addr().to_string()];
        let (_da, a) = start_storage(trackers.clone()).await;
        let (_db, b) = start_storage(trackers).await;
        let client = test_client();

        let data = b"replicate me ".repeat(300);
        let digest = Digest::from_data(&data);
        let path = client
            .upload(
                &endpoint(a.local_addr(), SECRET),
                &mut &data[..],
                data.len() as u64,
                "bin",
                None,
            )
            .await
            .unwrap();

        let node_b = b.node().clone();
        wait_for(Duration::from_secs(5), Duration::from_millis(20), || {
            let node_b = node_b.clone();
            async move { node_b.store().contains(&digest).await.unwrap() }
        })
        .await;
        assert!(b.node().meta().exists(&digest).unwrap());

        let mut out = Vec::new();
        client
            .download(&endpoint(b.local_addr(), SECRET), &path, &mut out)
            .await
            .unwrap();
        assert_eq!(out, data);

        // The owner walks past its own file without fetching it.
        let node_a = a.node().clone();
        wait_for(Duration::from_secs(3), Duration::from_millis(20), || {
            let node_a = node_a.clone();
            async move {
                let cursor = cursor_name(&node_a.trackers()[0]);
                node_a.meta().get_cursor(&cursor).unwrap() == 1
            }
        })
        .await;

        a.shutdown().await;
        b.shutdown().await;
        tracker.shutdown().await;
    }

    // ---- accept loop ----

    /// Holds every connection open until the peer closes it.
    struct HoldOpen;

    #[async_trait]
    impl ConnectionHandler for HoldOpen {
        async fn handle_connection(
            &self,
            mut stream: TcpStream,
            _peer: SocketAddr,
        ) -> Result<(), NodeError> {
            let mut buf = [0u8; 64];
            while stream.read(&mut buf).await? > 0 {}
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_saturated_pool_sheds_connections() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let workers = WorkerPool::new(WorkerConfig {
            ceiling: 1,
            queue_size: 0,
        });
        let server = spawn_server(listener, Arc::new(HoldOpen), workers.clone()).unwrap();

        let first = TcpStream::connect(server.local_addr()).await.unwrap();
        let running = workers.clone();
        wait_for(Duration::from_secs(2), Duration::from_millis(5), || {
            let running = running.clone();
            async move { running.running() == 1 }
        })
        .await;

        let mut second = TcpStream::connect(server.local_addr()).await.unwrap();
        let mut buf = [0u8; 1];
        let n = time::timeout(Duration::from_secs(2), second.read(&mut buf))
            .await
            .expect("shed connection should be closed")
            .unwrap();
        assert_eq!(n, 0);
        assert_eq!(workers.stats().rejected, 1);

        drop(first);
        wait_for(Duration::from_secs(2), Duration::from_millis(5), || {
            let running = running.clone();
            async move { running.running() == 0 }
        })
        .await;
        server.stop().await;
    }

    #[tokio::test]
    async fn test_server_stop_ends_accept_loop() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let server = spawn_server(
            listener,
            Arc::new(HoldOpen),
            WorkerPool::new(WorkerConfig::test_config()),
        )
        .unwrap();
        assert!(server.is_running());
        let addr = server.local_addr();

        server.stop().await;
        assert!(TcpStream::connect(addr).await.is_err());
    }
}
