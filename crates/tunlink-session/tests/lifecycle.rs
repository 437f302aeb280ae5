//! End-to-end session flows against an in-memory engine

use async_trait::async_trait;
use chrono::NaiveDate;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tunlink_session::{
    ChannelStore, ConfigError, EngineError, EngineInit, EngineSnapshot, FileStore, MemoryStore,
    MergePolicy, Namespace, Platform, SessionConfig, SessionController, SessionError,
    SessionEvent, SessionIdentity, StartParams, StartRequest, StatusEvent, TunnelEngine,
    VpnState,
};

/// Engine that writes its state into a namespace like a real one would
struct LoopbackEngine {
    store: Arc<dyn ChannelStore>,
    state_key: &'static str,
    snapshot: EngineSnapshot,
    reject: Option<EngineError>,
    starts: Mutex<Vec<StartRequest>>,
}

impl LoopbackEngine {
    fn new(store: Arc<dyn ChannelStore>) -> Self {
        Self {
            store,
            state_key: "vpnStatus",
            snapshot: EngineSnapshot::default(),
            reject: None,
            starts: Mutex::new(Vec::new()),
        }
    }
}

#[async_trait]
impl TunnelEngine for LoopbackEngine {
    async fn initialize(&self, _init: &EngineInit) -> Result<EngineSnapshot, EngineError> {
        Ok(self.snapshot.clone())
    }

    async fn start(&self, request: StartRequest) -> Result<(), EngineError> {
        self.starts.lock().push(request);
        if let Some(e) = &self.reject {
            return Err(e.clone());
        }
        self.store.set_string(self.state_key, "CONNECTING").unwrap();
        self.store.set_string("profileStatus", "1").unwrap();
        self.store.set_string(self.state_key, "CONNECTED").unwrap();
        Ok(())
    }

    async fn stop(&self) -> Result<(), EngineError> {
        self.store.set_string(self.state_key, "DISCONNECTED").unwrap();
        Ok(())
    }

    async fn query_status(&self) -> Result<String, EngineError> {
        self.store
            .get_string(self.state_key)
            .ok_or_else(|| EngineError::unreachable("engine not running"))
    }
}

fn new_year() -> chrono::NaiveDateTime {
    NaiveDate::from_ymd_opt(2025, 1, 1)
        .unwrap()
        .and_hms_opt(0, 0, 0)
        .unwrap()
}

#[tokio::test]
async fn test_start_and_observe() {
    let main: Arc<dyn ChannelStore> = Arc::new(MemoryStore::new(Namespace::main("app")));
    let engine = Arc::new(LoopbackEngine::new(main.clone()));
    let controller = SessionController::new(
        SessionConfig::new(Platform::Android),
        engine.clone(),
        main.clone(),
        None,
    );
    controller.initialize().await.unwrap();

    let states = Arc::new(Mutex::new(Vec::new()));
    let sink = states.clone();
    controller.bus().on_vpn_status(move |s| sink.lock().push(s));

    let code = controller
        .start(
            StartParams::new("client\nremote vpn.example.com 1194", SessionIdentity::new("home", "7"))
                .with_expiry(new_year()),
        )
        .await
        .unwrap();

    assert_eq!(code, 0);
    assert_eq!(
        engine.starts.lock()[0].expire_at.as_deref(),
        Some("2025-01-01 00:00:00")
    );
    assert_eq!(*states.lock(), vec![VpnState::Connecting, VpnState::Connected]);
    assert_eq!(controller.profile_loaded(), Some(true));
    assert_eq!(controller.identity(), Some(SessionIdentity::new("home", "7")));
    assert_eq!(controller.current_status().await, Some(VpnState::Connected));

    controller.stop().await;
    assert_eq!(controller.vpn_state(), Some(VpnState::Disconnected));
}

#[tokio::test]
async fn test_connection_update_reaches_listener() {
    let main: Arc<dyn ChannelStore> = Arc::new(MemoryStore::new(Namespace::main("app")));
    let controller = SessionController::new(
        SessionConfig::new(Platform::Android),
        Arc::new(LoopbackEngine::new(main.clone())),
        main.clone(),
        None,
    );
    controller.initialize().await.unwrap();

    let samples = Arc::new(Mutex::new(Vec::new()));
    let sink = samples.clone();
    controller.bus().on_connection_update(move |e| sink.lock().push(e));

    main.set_string("connectionUpdate", "12:03_2024-12-31 23:59:00_1000_2000")
        .unwrap();
    // Malformed samples are dropped
    main.set_string("connectionUpdate", "12:04_broken").unwrap();

    let expected = StatusEvent {
        duration: "12:03".into(),
        last_packet_receive_at: "2024-12-31 23:59:00".into(),
        bytes_in: "1000".into(),
        bytes_out: "2000".into(),
    };
    assert_eq!(*samples.lock(), vec![expected.clone()]);
    assert_eq!(controller.last_status(), Some(expected));
}

#[tokio::test]
async fn test_rejected_start_returns_code() {
    let main: Arc<dyn ChannelStore> = Arc::new(MemoryStore::new(Namespace::main("app")));
    let mut engine = LoopbackEngine::new(main.clone());
    engine.reject = Some(EngineError::rejected("invalid config").with_detail("4"));

    let controller = SessionController::new(
        SessionConfig::new(Platform::Android),
        Arc::new(engine),
        main.clone(),
        None,
    );
    controller.initialize().await.unwrap();

    let code = controller
        .start(StartParams::new("bad", SessionIdentity::new("home", "7")))
        .await
        .unwrap();
    assert_eq!(code, 4);
    assert_eq!(controller.registry().current_id().as_deref(), Some("7"));
    assert_eq!(controller.vpn_state(), None);
    assert_eq!(controller.current_status().await, None);
}

#[tokio::test]
async fn test_isolated_platform_without_identifiers() {
    let main: Arc<dyn ChannelStore> = Arc::new(MemoryStore::new(Namespace::main("app")));
    let controller = SessionController::new(
        SessionConfig::new(Platform::Ios),
        Arc::new(LoopbackEngine::new(main.clone())),
        main,
        None,
    );

    let err = controller.initialize().await.unwrap_err();
    assert!(matches!(
        err,
        SessionError::Config(ConfigError::MissingIsolationField(_))
    ));
}

#[tokio::test]
async fn test_identity_survives_restart() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("app.json");

    {
        let main: Arc<dyn ChannelStore> =
            Arc::new(FileStore::open(Namespace::main("app"), &path).unwrap());
        let controller = SessionController::new(
            SessionConfig::new(Platform::Android),
            Arc::new(LoopbackEngine::new(main.clone())),
            main,
            None,
        );
        controller.initialize().await.unwrap();
        controller
            .start(StartParams::new("client", SessionIdentity::new("work-vpn", "42")))
            .await
            .unwrap();
        controller.shutdown().await;
    }

    // Process restarts while the tunnel keeps running
    let main: Arc<dyn ChannelStore> =
        Arc::new(FileStore::open(Namespace::main("app"), &path).unwrap());
    let mut engine = LoopbackEngine::new(main.clone());
    engine.snapshot = EngineSnapshot {
        vpn_status: Some("CONNECTED".into()),
        expire_at: Some("2025-01-01 00:00:00".into()),
        ..Default::default()
    };
    let controller = SessionController::new(
        SessionConfig::new(Platform::Android),
        Arc::new(engine),
        main,
        None,
    );

    let recovered = controller.initialize().await.unwrap();
    assert_eq!(recovered.vpn_current_status, Some(VpnState::Connected));
    assert_eq!(recovered.latest_connection_name.as_deref(), Some("work-vpn"));
    assert_eq!(recovered.latest_connection_id.as_deref(), Some("42"));
    assert_eq!(recovered.latest_expire_at, Some(new_year()));

    // The stored state is replayed to a late listener
    let states = Arc::new(Mutex::new(Vec::new()));
    let sink = states.clone();
    controller.bus().on_vpn_status(move |s| sink.lock().push(s));
    assert_eq!(*states.lock(), vec![VpnState::Connected]);
}

#[tokio::test]
async fn test_group_namespace_from_extension() {
    let dir = tempfile::tempdir().unwrap();
    let group_path = dir.path().join("group.app.json");

    let main: Arc<dyn ChannelStore> = Arc::new(MemoryStore::new(Namespace::main("app")));
    let group = Arc::new(FileStore::open(Namespace::group("group.app"), &group_path).unwrap());

    // The extension process writes to its own handle on the same file
    let extension: Arc<dyn ChannelStore> =
        Arc::new(FileStore::open(Namespace::group("group.app"), &group_path).unwrap());
    let mut engine = LoopbackEngine::new(extension);
    engine.state_key = "vpnStatusGroup";

    let mut config = SessionConfig::isolated(Platform::Ios, "group.app", "App VPN", "app.tunnel");
    config.merge_policy = MergePolicy::PreferGroup;

    let controller = SessionController::new(
        config,
        Arc::new(engine),
        main.clone(),
        Some(group.clone() as Arc<dyn ChannelStore>),
    );
    controller.initialize().await.unwrap();
    assert_eq!(controller.bus().wired_count(), 4);

    let stream = controller.bus().event_channel();
    let code = controller
        .start(
            StartParams::new("client", SessionIdentity::new("home", "7"))
                .with_timeout(Duration::from_secs(60)),
        )
        .await
        .unwrap();
    assert_eq!(code, 0);

    group.refresh().unwrap();
    let events = stream.drain();
    assert!(events.contains(&SessionEvent::VpnStatus(VpnState::Connected)));
    assert_eq!(controller.vpn_state(), Some(VpnState::Connected));

    // Group is active, so a stale main value is not forwarded
    main.set_string("vpnStatus", "DISCONNECTED").unwrap();
    assert_eq!(controller.vpn_state(), Some(VpnState::Connected));
    assert!(stream.drain().is_empty());

    controller.bus().close_stream(stream);
}
