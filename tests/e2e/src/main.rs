fn main() {
    println!("Run `cargo test -p bridge-e2e` to execute the end-to-end scenarios.");
}

#[cfg(test)]
mod tests {
    use std::fmt::Debug;
    use std::path::Path;
    use std::sync::Arc;
    use std::time::Duration;

    use futures_util::{SinkExt, StreamExt};
    use l4d2_bridge_agent::{AgentClient, AgentConfig, AgentEvent};
    use l4d2_bridge_data_channel::{FileStore, StoreConfig};
    use l4d2_bridge_hub::{
        BridgeEvent, BridgeServer, DeliveryPolicy, EventReceiver, FileSource, HubConfig,
        LargePush, TaskStatus,
    };
    use l4d2_bridge_protocol::constants::DEFAULT_FILE_PATH;
    use l4d2_bridge_protocol::{
        AuthRequest, Body, Envelope, ErrorCode, FileChunk, FileComplete, MessageType,
    };
    use l4d2_bridge_transfer::{checksum_bytes, split_bytes};
    use tempfile::TempDir;
    use tokio::net::TcpStream;
    use tokio::sync::mpsc::UnboundedReceiver;
    use tokio_tungstenite::tungstenite::Message;
    use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

    const TOKEN: &str = "e2e-shared-token";
    const WAIT: Duration = Duration::from_secs(10);
    const MIB: usize = 1024 * 1024;

    /// A hub listening on loopback, optionally with its data channel.
    struct Hub {
        server: Arc<BridgeServer>,
        events: EventReceiver,
        ws_url: String,
        http_url: Option<String>,
        _dir: TempDir,
    }

    impl Hub {
        async fn start(config: HubConfig) -> Self {
            Self::start_inner(config, false).await
        }

        async fn start_with_data_channel(config: HubConfig) -> Self {
            Self::start_inner(config, true).await
        }

        async fn start_inner(config: HubConfig, data_channel: bool) -> Self {
            let dir = tempfile::tempdir().unwrap();
            let store_dir = dir.path().join("store");
            std::fs::create_dir_all(&store_dir).unwrap();
            let store = Arc::new(FileStore::new(StoreConfig::new(&store_dir)));

            let http_url = if data_channel {
                let router =
                    l4d2_bridge_data_channel::router(Arc::clone(&store), TOKEN, DEFAULT_FILE_PATH);
                let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
                let addr = listener.local_addr().unwrap();
                tokio::spawn(async move { axum::serve(listener, router).await });
                Some(format!("http://{addr}{DEFAULT_FILE_PATH}"))
            } else {
                None
            };

            let config = HubConfig {
                token: TOKEN.into(),
                ..config
            };
            let ws_path = config.ws_path.clone();
            let (server, events) = BridgeServer::new(config, store);
            let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
            let addr = listener.local_addr().unwrap();
            let serving = Arc::clone(&server);
            tokio::spawn(async move { serving.serve(listener).await });

            Self {
                server,
                events,
                ws_url: format!("ws://{addr}{ws_path}"),
                http_url,
                _dir: dir,
            }
        }

        fn agent_config(&self, server_id: &str, download_dir: &Path) -> AgentConfig {
            let config =
                AgentConfig::new(&self.ws_url, TOKEN, server_id).with_download_dir(download_dir);
            match &self.http_url {
                Some(url) => config.with_http_url(url),
                None => config,
            }
        }

        async fn agent(&mut self, server_id: &str, download_dir: &Path) -> Agent {
            let (client, events) = AgentClient::connect(self.agent_config(server_id, download_dir))
                .await
                .unwrap();
            wait_for(&mut self.events, |e| {
                matches!(e, BridgeEvent::Connected { server_id: id, .. } if id == server_id)
            })
            .await;
            Agent { client, events }
        }
    }

    impl Drop for Hub {
        fn drop(&mut self) {
            self.server.shutdown();
        }
    }

    struct Agent {
        client: AgentClient,
        events: UnboundedReceiver<AgentEvent>,
    }

    /// Hand-driven agent for scenarios the real client never produces.
    struct RawAgent {
        ws: WebSocketStream<MaybeTlsStream<TcpStream>>,
        server_id: String,
    }

    impl RawAgent {
        async fn connect(url: &str, server_id: &str) -> Self {
            let (ws, _) = tokio_tungstenite::connect_async(url).await.unwrap();
            let mut agent = Self {
                ws,
                server_id: server_id.to_string(),
            };
            agent
                .send(
                    &Body::Auth(AuthRequest {
                        server_id: server_id.to_string(),
                        agent_version: "e2e".into(),
                    }),
                    "",
                )
                .await;
            let ack = agent.recv().await;
            assert_eq!(ack.msg_type, MessageType::AuthAck);
            agent
        }

        async fn send(&mut self, body: &Body, channel: &str) -> String {
            let env = Envelope::signed(body, self.server_id.clone(), channel, TOKEN.as_bytes())
                .unwrap();
            self.ws
                .send(Message::Text(env.to_json().unwrap().into()))
                .await
                .unwrap();
            env.msg_id
        }

        async fn recv(&mut self) -> Envelope {
            loop {
                let frame = tokio::time::timeout(WAIT, self.ws.next())
                    .await
                    .expect("timed out waiting for the hub")
                    .expect("connection ended")
                    .expect("websocket error");
                if let Message::Text(text) = frame {
                    return Envelope::parse(&text).unwrap();
                }
            }
        }

        /// Reads until the hub acknowledges `msg_id`.
        async fn wait_ack(&mut self, msg_id: &str) {
            loop {
                let env = self.recv().await;
                if let Ok(Body::Ack(ack)) = env.body() {
                    if ack.ref_msg_id == msg_id {
                        return;
                    }
                }
            }
        }
    }

    /// Skips events until one matches.
    async fn wait_for<T: Debug>(
        rx: &mut UnboundedReceiver<T>,
        mut pred: impl FnMut(&T) -> bool,
    ) -> T {
        tokio::time::timeout(WAIT, async {
            loop {
                let event = rx.recv().await.expect("event channel closed");
                if pred(&event) {
                    return event;
                }
            }
        })
        .await
        .expect("timed out waiting for event")
    }

    fn pattern(len: usize, seed: u8) -> Vec<u8> {
        (0..len).map(|i| (i % 251) as u8 ^ seed).collect()
    }

    #[tokio::test]
    async fn connect_and_disconnect_are_reported() {
        let mut hub = Hub::start(HubConfig::default()).await;
        let dl = tempfile::tempdir().unwrap();

        let mut agent = hub.agent("server-1", dl.path()).await;
        assert!(hub.server.is_connected("server-1"));
        assert_eq!(hub.server.connected_servers(), vec!["server-1".to_string()]);
        assert!(matches!(
            wait_for(&mut agent.events, |e| matches!(e, AgentEvent::Connected { .. })).await,
            AgentEvent::Connected { server_id, .. } if server_id == "server-1"
        ));

        agent.client.disconnect().await;
        let event = wait_for(&mut hub.events, |e| {
            matches!(e, BridgeEvent::Disconnected { .. })
        })
        .await;
        let BridgeEvent::Disconnected { server_id, .. } = event else {
            unreachable!()
        };
        assert_eq!(server_id, "server-1");
        assert!(!hub.server.is_connected("server-1"));
    }

    #[tokio::test]
    async fn push_without_sessions_is_server_unknown() {
        let hub = Hub::start(HubConfig::default()).await;
        let src = tempfile::tempdir().unwrap();
        let path = src.path().join("map01.vpk");
        std::fs::write(&path, b"map").unwrap();

        let err = tokio::time::timeout(
            WAIT,
            hub.server
                .push_file(None, FileSource::path(&path), "", "group"),
        )
        .await
        .expect("push must not hang")
        .unwrap_err();
        assert_eq!(err.code(), ErrorCode::ServerUnknown);

        let err = hub
            .server
            .push_file(Some("ghost"), FileSource::path(&path), "", "group")
            .await
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::ServerUnknown);
    }

    #[tokio::test]
    async fn ten_megabyte_upload_yields_one_file_notice() {
        let mut hub = Hub::start(HubConfig::default()).await;
        let mut raw = RawAgent::connect(&hub.ws_url, "server-1").await;
        wait_for(&mut hub.events, |e| matches!(e, BridgeEvent::Connected { .. })).await;

        let data = pattern(10 * MIB, 0x5a);
        let sha = checksum_bytes(&data);
        let chunks: Vec<_> = split_bytes(&data, MIB).collect();
        assert_eq!(chunks.len(), 10);

        let chunk_body = |c: &l4d2_bridge_transfer::Chunk| {
            Body::FileChunk(FileChunk {
                transfer_id: "upload-10mb".into(),
                sequence: c.sequence,
                chunk_count: 10,
                offset: c.offset,
                data: c.data.clone(),
                file_name: "map01.vpk".into(),
                total_size: data.len() as u64,
                sha256: sha.clone(),
                task_id: None,
            })
        };
        for chunk in &chunks {
            raw.send(&chunk_body(chunk), "group").await;
        }
        let done = raw
            .send(
                &Body::FileComplete(FileComplete {
                    transfer_id: "upload-10mb".into(),
                    file_name: "map01.vpk".into(),
                    total_size: data.len() as u64,
                    sha256: sha.clone(),
                    task_id: None,
                }),
                "group",
            )
            .await;
        raw.wait_ack(&done).await;

        let received = match wait_for(&mut hub.events, |e| {
            matches!(e, BridgeEvent::FileReceived(_))
        })
        .await
        {
            BridgeEvent::FileReceived(file) => file,
            _ => unreachable!(),
        };
        assert_eq!(received.size, data.len() as u64);
        assert_eq!(received.sha256, sha);
        assert_eq!(received.sender, "server-1");
        assert_eq!(received.channel, "group");
        assert_eq!(std::fs::read(&received.path).unwrap(), data);

        // The hub answers a late copy of the final chunk without a second notice.
        let resend = raw.send(&chunk_body(&chunks[9]), "group").await;
        raw.wait_ack(&resend).await;
        while let Ok(event) = hub.events.try_recv() {
            assert!(
                !matches!(event, BridgeEvent::FileReceived(_)),
                "duplicate notice: {event:?}"
            );
        }
    }

    #[tokio::test]
    async fn silent_agent_is_dropped_on_heartbeat_timeout() {
        let mut hub = Hub::start(HubConfig {
            heartbeat_interval: Duration::from_millis(200),
            ..HubConfig::default()
        })
        .await;
        let mut raw = RawAgent::connect(&hub.ws_url, "quiet").await;
        wait_for(&mut hub.events, |e| matches!(e, BridgeEvent::Connected { .. })).await;

        let event = wait_for(&mut hub.events, |e| {
            matches!(e, BridgeEvent::Disconnected { .. })
        })
        .await;
        assert!(matches!(
            event,
            BridgeEvent::Disconnected { code: ErrorCode::HeartbeatTimeout, .. }
        ));
        assert!(!hub.server.is_connected("quiet"));

        let env = raw.recv().await;
        match env.body().unwrap() {
            Body::Error(err) => assert_eq!(err.code, ErrorCode::HeartbeatTimeout),
            other => panic!("expected ERROR, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn second_login_supersedes_the_first() {
        let mut hub = Hub::start(HubConfig::default()).await;
        let dl = tempfile::tempdir().unwrap();

        let mut first = hub.agent("dup", dl.path()).await;
        let _second = hub.agent("dup", dl.path()).await;

        let event = wait_for(&mut first.events, |e| {
            matches!(e, AgentEvent::Disconnected { .. })
        })
        .await;
        assert!(matches!(
            event,
            AgentEvent::Disconnected { code: ErrorCode::Superseded, .. }
        ));
        assert!(!first.client.is_connected());
        assert!(hub.server.is_connected("dup"));
        assert_eq!(hub.server.connected_servers().len(), 1);
    }

    #[tokio::test]
    async fn broadcast_reaches_every_agent() {
        let mut hub = Hub::start(HubConfig {
            delivery: DeliveryPolicy::Acknowledged,
            ..HubConfig::default()
        })
        .await;
        let alpha_dir = tempfile::tempdir().unwrap();
        let beta_dir = tempfile::tempdir().unwrap();
        let mut alpha = hub.agent("alpha", alpha_dir.path()).await;
        let mut beta = hub.agent("beta", beta_dir.path()).await;

        let data = pattern(300 * 1024, 7);
        let task_id = hub
            .server
            .push_file(None, FileSource::bytes("c5m1.vpk", data.clone()), "new map", "group")
            .await
            .unwrap();

        for agent in [&mut alpha, &mut beta] {
            let AgentEvent::FileReceived(file) = wait_for(&mut agent.events, |e| {
                matches!(e, AgentEvent::FileReceived(_))
            })
            .await
            else {
                unreachable!()
            };
            assert_eq!(file.file_name, "c5m1.vpk");
            assert_eq!(file.sha256, checksum_bytes(&data));
            assert_eq!(file.task_id.as_deref(), Some(task_id.as_str()));
            assert_eq!(std::fs::read(&file.path).unwrap(), data);
        }

        let mut watch = hub.server.tasks().subscribe(&task_id).unwrap();
        let task = tokio::time::timeout(WAIT, watch.wait_for(|t| t.status.is_terminal()))
            .await
            .expect("task should finish")
            .unwrap()
            .clone();
        assert_eq!(task.status, TaskStatus::Succeeded);
        assert_eq!(task.targets.len(), 2);
    }

    #[tokio::test]
    async fn agent_upload_lands_in_the_store() {
        let mut hub = Hub::start(HubConfig::default()).await;
        let dl = tempfile::tempdir().unwrap();
        let agent = hub.agent("uploader", dl.path()).await;

        let src = tempfile::tempdir().unwrap();
        let path = src.path().join("custom.vpk");
        let data = pattern(200 * 1024, 3);
        std::fs::write(&path, &data).unwrap();

        let sent = agent.client.send_file(&path, "group-1").await.unwrap();
        assert_eq!(sent.size, data.len() as u64);

        let started = wait_for(&mut hub.events, |e| {
            matches!(e, BridgeEvent::UploadStarted { .. })
        })
        .await;
        assert!(matches!(
            started,
            BridgeEvent::UploadStarted { size, .. } if size == data.len() as u64
        ));

        let BridgeEvent::FileReceived(file) = wait_for(&mut hub.events, |e| {
            matches!(e, BridgeEvent::FileReceived(_))
        })
        .await
        else {
            unreachable!()
        };
        assert_eq!(file.sender, "uploader");
        assert_eq!(file.channel, "group-1");
        assert_eq!(file.sha256, sent.sha256);
        assert_eq!(std::fs::read(&file.path).unwrap(), data);
    }

    #[tokio::test]
    async fn large_push_goes_through_the_object_store() {
        let mut hub = Hub::start_with_data_channel(HubConfig {
            large_push: LargePush::ObjectStore,
            ..HubConfig::default()
        })
        .await;
        let dl = tempfile::tempdir().unwrap();
        let mut agent = hub.agent("srv-obj", dl.path()).await;

        let src = tempfile::tempdir().unwrap();
        let path = src.path().join("big.vpk");
        let data = pattern(2 * MIB + 17, 9);
        std::fs::write(&path, &data).unwrap();

        hub.server
            .push_file(Some("srv-obj"), FileSource::path(&path), "", "group")
            .await
            .unwrap();

        let AgentEvent::FileReceived(file) = wait_for(&mut agent.events, |e| {
            matches!(
                e,
                AgentEvent::FileReceived(_) | AgentEvent::TransferFailed { .. }
            )
        })
        .await
        else {
            panic!("object store delivery failed")
        };
        assert_eq!(file.size, data.len() as u64);
        assert_eq!(std::fs::read(&file.path).unwrap(), data);
        assert!(file.path.starts_with(dl.path()));
    }
}
