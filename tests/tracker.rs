//! End-to-end tracker scenarios against scripted in-memory capture engines.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::time::{timeout, Instant};

use wavecap::proto::{Frame, Hello, OpenReply, OpenRequest};
use wavecap::source::{Connect, NullSink, SourceEvent, SourceState, SourceStatus, Transport};
use wavecap::testing::{OpenScript, Reply, Script, ScriptedConnector};
use wavecap::tracker::RetryPolicy;
use wavecap::{
    Config, DriverBuilder, DriverRegistry, EventBus, SourceTracker, SourceWorker, SOURCE_CLOSED,
    SOURCE_ERROR, SOURCE_OPENED,
};

/// Config with short cadences so retry scenarios converge quickly.
fn fast_config() -> Config {
    Config {
        probe_deadline: Duration::from_secs(5),
        list_deadline: Duration::from_secs(5),
        open_deadline: Duration::from_secs(1),
        retry_interval: Duration::from_millis(50),
        retry_backoff: RetryPolicy {
            first: Duration::from_millis(100),
            cap: Duration::from_secs(2),
            factor: 2.0,
        },
        bus_capacity: 256,
        log_events: true,
    }
}

struct Fixture {
    bus: Arc<EventBus>,
    registry: Arc<DriverRegistry>,
    tracker: Arc<SourceTracker>,
    /// (channel, payload) pairs in delivery order.
    events: Arc<Mutex<Vec<(String, SourceEvent)>>>,
}

fn setup(cfg: Config) -> Fixture {
    let bus = Arc::new(EventBus::new(cfg.bus_capacity));
    let registry = Arc::new(DriverRegistry::new());

    let events: Arc<Mutex<Vec<(String, SourceEvent)>>> = Arc::default();
    let sink = Arc::clone(&events);
    bus.register_listener_multi(&[SOURCE_OPENED, SOURCE_ERROR, SOURCE_CLOSED], move |ev| {
        if let Some(payload) = ev.payload_as::<SourceEvent>() {
            sink.lock()
                .unwrap()
                .push((ev.channel().to_string(), payload.clone()));
        }
    });

    let tracker = SourceTracker::new(cfg, Arc::clone(&bus), Arc::clone(&registry), Arc::new(NullSink));
    Fixture {
        bus,
        registry,
        tracker,
        events,
    }
}

impl Fixture {
    fn channels(&self) -> Vec<String> {
        self.events
            .lock()
            .unwrap()
            .iter()
            .map(|(channel, _)| channel.clone())
            .collect()
    }

    async fn teardown(self) {
        self.tracker.shutdown().await;
        self.bus.shutdown().await;
    }
}

fn ipc_driver(name: &str, script: Script) -> (DriverBuilder, Arc<ScriptedConnector>) {
    let connector = ScriptedConnector::new(name, script);
    let driver = DriverBuilder::new(name, Arc::clone(&connector) as Arc<dyn Connect>);
    (driver, connector)
}

/// Polls `cond` until it holds; paused-clock sleeps auto-advance.
async fn wait_until(mut cond: impl FnMut() -> bool) {
    timeout(Duration::from_secs(30), async {
        while !cond() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

#[tokio::test(start_paused = true)]
async fn probe_race_first_accept_wins() {
    let fixture = setup(fast_config());

    let native = DriverBuilder::new(
        "native",
        ScriptedConnector::new("native", Script::default()) as Arc<dyn Connect>,
    )
    .with_native_probe(|_| false);
    let (slow, _) = ipc_driver("slow", Script::probe_after(Duration::from_millis(200), true));
    let (quick, _) = ipc_driver("quick", Script::probe_after(Duration::from_millis(50), true));

    fixture.registry.register(native);
    fixture.registry.register(slow);
    fixture.registry.register(quick);

    let started = Instant::now();
    let id = fixture.tracker.open_source("wlan0", None).await.unwrap();
    assert!(started.elapsed() < Duration::from_millis(250));

    let sources = fixture.tracker.list_sources().await;
    assert_eq!(sources.len(), 1);
    assert_eq!(sources[0].id, id);
    assert_eq!(sources[0].driver, "quick");
    assert_eq!(sources[0].state, SourceState::Running);

    fixture.teardown().await;
}

#[tokio::test(start_paused = true)]
async fn silent_probes_time_out_without_zombies() {
    let fixture = setup(fast_config());
    let (a, ca) = ipc_driver("mute-a", Script::silent());
    let (b, cb) = ipc_driver("mute-b", Script::silent());
    fixture.registry.register(a);
    fixture.registry.register(b);

    let started = Instant::now();
    let err = fixture.tracker.open_source("wlan0", None).await.unwrap_err();
    assert_eq!(err.as_label(), "probe_timeout");
    assert!(started.elapsed() >= Duration::from_secs(5));

    // No source entry is created for a failed probe, and no engine
    // outlives the coordinator.
    assert!(fixture.tracker.list_sources().await.is_empty());
    wait_until(|| ca.live_engines() == 0 && cb.live_engines() == 0).await;

    fixture.teardown().await;
}

#[tokio::test(start_paused = true)]
async fn failed_open_keeps_the_source_in_error() {
    let fixture = setup(fast_config());
    let script = Script {
        open: Reply::now(OpenScript {
            success: false,
            message: Some("interface is down".into()),
            ..OpenScript::default()
        }),
        ..Script::default()
    };
    let (driver, _) = ipc_driver("pcap", script);
    fixture.registry.register(driver);

    let err = fixture
        .tracker
        .open_source("wlan0", Some("pcap"))
        .await
        .unwrap_err();
    assert_eq!(err.as_label(), "source_rejected");

    // The entry was created anyway and is waiting on the retry timer.
    let sources = fixture.tracker.list_sources().await;
    assert_eq!(sources.len(), 1);
    assert_eq!(sources[0].state, SourceState::Error);
    assert!(sources[0].last_error.as_deref().unwrap().contains("interface is down"));
    assert!(sources[0].retry_in.is_some());
    wait_until({
        let events = Arc::clone(&fixture.events);
        move || {
            events
                .lock()
                .unwrap()
                .iter()
                .any(|(channel, _)| channel == SOURCE_ERROR)
        }
    })
    .await;

    fixture.teardown().await;
}

#[tokio::test(start_paused = true)]
async fn transport_loss_errors_then_retry_recovers() {
    let fixture = setup(fast_config());
    let (driver, connector) = ipc_driver("pcap", Script::default());
    fixture.registry.register(driver);

    let id = fixture.tracker.open_source("wlan0", Some("pcap")).await.unwrap();
    assert_eq!(connector.connects(), 1);

    // The capture engine dies underneath the running source.
    connector.drop_links();

    wait_until({
        let events = Arc::clone(&fixture.events);
        move || {
            events
                .lock()
                .unwrap()
                .iter()
                .any(|(channel, _)| channel == SOURCE_ERROR)
        }
    })
    .await;

    // The retry timer re-opens it from the stored definition.
    wait_until({
        let events = Arc::clone(&fixture.events);
        move || {
            events
                .lock()
                .unwrap()
                .iter()
                .filter(|(channel, _)| channel == SOURCE_OPENED)
                .count()
                >= 2
        }
    })
    .await;

    assert!(connector.connects() >= 2);
    let sources = fixture.tracker.list_sources().await;
    assert_eq!(sources[0].id, id);
    assert_eq!(sources[0].state, SourceState::Running);
    assert_eq!(
        fixture.channels()[..3],
        [
            SOURCE_OPENED.to_string(),
            SOURCE_ERROR.to_string(),
            SOURCE_OPENED.to_string()
        ]
    );

    fixture.teardown().await;
}

#[tokio::test(start_paused = true)]
async fn repeated_failures_back_off() {
    let fixture = setup(fast_config());
    // First connect opens fine, everything after that fails to spawn.
    let connector = ScriptedConnector::with_sequence(
        "pcap",
        vec![Script::default()],
        Script::unspawnable(),
    );
    fixture
        .registry
        .register(DriverBuilder::new("pcap", Arc::clone(&connector) as Arc<dyn Connect>));

    fixture.tracker.open_source("wlan0", Some("pcap")).await.unwrap();
    connector.drop_links();

    // Let several retry rounds fail, then wait for the source to settle
    // back into error with a scheduled re-open.
    timeout(Duration::from_secs(60), async {
        loop {
            let sources = fixture.tracker.list_sources().await;
            if connector.connects() >= 4
                && sources[0].state == SourceState::Error
                && sources[0].retry_in.is_some()
            {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("retries never settled into error");

    fixture.teardown().await;
}

#[tokio::test(start_paused = true)]
async fn runtime_ids_are_never_reused() {
    let fixture = setup(fast_config());
    let (driver, _) = ipc_driver("pcap", Script::default());
    fixture.registry.register(driver);

    let first = fixture.tracker.open_source("wlan0", Some("pcap")).await.unwrap();
    let second = fixture.tracker.open_source("wlan1", Some("pcap")).await.unwrap();
    assert!(fixture.tracker.remove_source(first).await);

    let third = fixture.tracker.open_source("wlan2", Some("pcap")).await.unwrap();
    assert!(third > second);
    assert_ne!(third, first);

    fixture.teardown().await;
}

#[tokio::test(start_paused = true)]
async fn remove_by_uuid_and_unknown_refs() {
    let fixture = setup(fast_config());
    let (driver, _) = ipc_driver("pcap", Script::default());
    fixture.registry.register(driver);

    fixture.tracker.open_source("wlan0", Some("pcap")).await.unwrap();
    let uuid = fixture.tracker.list_sources().await[0].uuid;

    assert!(fixture.tracker.remove_source(uuid).await);
    assert!(!fixture.tracker.remove_source(uuid).await);
    assert!(!fixture.tracker.close_source(999u64).await);
    assert!(fixture.tracker.list_sources().await.is_empty());
    wait_until({
        let events = Arc::clone(&fixture.events);
        move || {
            events
                .lock()
                .unwrap()
                .iter()
                .any(|(channel, _)| channel == SOURCE_CLOSED)
        }
    })
    .await;

    fixture.teardown().await;
}

#[tokio::test(start_paused = true)]
async fn iterate_visits_every_source_then_finalizes() {
    let fixture = setup(fast_config());
    let (driver, _) = ipc_driver("pcap", Script::default());
    fixture.registry.register(driver);

    fixture.tracker.open_source("wlan0", Some("pcap")).await.unwrap();
    fixture.tracker.open_source("wlan1", Some("pcap")).await.unwrap();

    #[derive(Default)]
    struct Collect {
        interfaces: Vec<String>,
        finalized: bool,
    }
    impl SourceWorker for Collect {
        fn handle_source(&mut self, source: &SourceStatus) {
            self.interfaces.push(source.interface.clone());
        }
        fn finalize(&mut self) {
            self.finalized = true;
        }
    }

    let mut worker = Collect::default();
    fixture.tracker.iterate(&mut worker).await;
    assert_eq!(worker.interfaces, ["wlan0", "wlan1"]);
    assert!(worker.finalized);

    fixture.teardown().await;
}

#[tokio::test(start_paused = true)]
async fn list_interfaces_marks_in_use_entries() {
    let fixture = setup(fast_config());
    let connector = ScriptedConnector::new("pcap", Script::default());
    let driver = DriverBuilder::new("pcap", Arc::clone(&connector) as Arc<dyn Connect>)
        .with_native_list(|| {
            ["wlan0", "wlan1"]
                .into_iter()
                .map(|name| wavecap::proto::InterfaceEntry {
                    interface: name.to_string(),
                    driver: String::new(),
                    flags: Default::default(),
                    in_use_uuid: None,
                })
                .collect()
        });
    fixture.registry.register(driver);

    fixture.tracker.open_source("wlan0", Some("pcap")).await.unwrap();

    let mut entries = fixture.tracker.list_interfaces().await;
    entries.sort_by(|a, b| a.interface.cmp(&b.interface));
    assert_eq!(entries.len(), 2);
    assert_eq!(entries[0].interface, "wlan0");
    assert!(entries[0].in_use_uuid.is_some());
    assert!(entries[1].in_use_uuid.is_none());

    fixture.teardown().await;
}

#[tokio::test(start_paused = true)]
async fn remote_hello_negotiates_a_source() {
    let fixture = setup(fast_config());
    let (driver, _) = ipc_driver("pcap", Script::default());
    fixture.registry.register(driver);

    let (local, remote) = tokio::io::duplex(64 * 1024);

    // The remote capture announces itself, then answers the open.
    let uuid = uuid::Uuid::new_v4();
    tokio::spawn(async move {
        let (rd, wr) = tokio::io::split(remote);
        let mut transport = Transport::new(rd, wr);
        transport
            .send(
                Frame::compose(&Hello {
                    driver: "pcap".into(),
                    version: 1,
                    definition: Some("wlan9:channel=11".into()),
                })
                .unwrap(),
            )
            .await
            .unwrap();

        loop {
            let Ok(frame) = transport.recv().await else {
                break;
            };
            if let Ok(open) = frame.payload::<OpenRequest>() {
                let reply = Frame::compose(&OpenReply {
                    transaction: open.transaction,
                    success: true,
                    uuid: Some(uuid),
                    channel_capable: true,
                    message: Some("remote wlan9".into()),
                })
                .unwrap();
                if transport.send(reply).await.is_err() {
                    break;
                }
            }
        }
    });

    let id = fixture.tracker.on_tcp_connection(local).await.unwrap();
    let sources = fixture.tracker.list_sources().await;
    assert_eq!(sources[0].id, id);
    assert_eq!(sources[0].uuid, uuid);
    assert_eq!(sources[0].interface, "wlan9");
    assert_eq!(sources[0].state, SourceState::Running);
    assert_eq!(sources[0].pid, None);

    fixture.teardown().await;
}

#[tokio::test(start_paused = true)]
async fn remote_with_unknown_driver_is_rejected() {
    let fixture = setup(fast_config());
    let (local, remote) = tokio::io::duplex(4096);

    tokio::spawn(async move {
        let (rd, wr) = tokio::io::split(remote);
        let mut transport = Transport::new(rd, wr);
        let _ = transport
            .send(
                Frame::compose(&Hello {
                    driver: "ghost".into(),
                    version: 1,
                    definition: Some("wlan0".into()),
                })
                .unwrap(),
            )
            .await;
    });

    let err = fixture.tracker.on_tcp_connection(local).await.unwrap_err();
    assert_eq!(err.as_label(), "protocol_violation");
    assert!(fixture.tracker.list_sources().await.is_empty());

    fixture.teardown().await;
}

#[tokio::test(start_paused = true)]
async fn set_channel_respects_capability() {
    let fixture = setup(fast_config());

    let capable = Script::default();
    let fixed = Script {
        open: Reply::now(OpenScript {
            channel_capable: false,
            ..OpenScript::default()
        }),
        ..Script::default()
    };
    let (tunable, _) = ipc_driver("tunable", capable);
    let (locked, _) = ipc_driver("locked", fixed);
    fixture.registry.register(tunable);
    fixture.registry.register(locked);

    let a = fixture.tracker.open_source("wlan0", Some("tunable")).await.unwrap();
    let b = fixture.tracker.open_source("wlan1", Some("locked")).await.unwrap();

    fixture.tracker.set_channel(a, "6").await.unwrap();
    let err = fixture.tracker.set_channel(b, "6").await.unwrap_err();
    assert_eq!(err.as_label(), "source_rejected");
    let err = fixture.tracker.set_channel(999u64, "6").await.unwrap_err();
    assert_eq!(err.as_label(), "internal");

    fixture.teardown().await;
}

#[tokio::test(start_paused = true)]
async fn shutdown_closes_every_source() {
    let fixture = setup(fast_config());
    let (driver, connector) = ipc_driver("pcap", Script::default());
    fixture.registry.register(driver);

    fixture.tracker.open_source("wlan0", Some("pcap")).await.unwrap();
    fixture.tracker.open_source("wlan1", Some("pcap")).await.unwrap();

    fixture.tracker.shutdown().await;
    assert!(fixture.tracker.list_sources().await.is_empty());
    wait_until(|| connector.live_engines() == 0).await;
    wait_until({
        let events = Arc::clone(&fixture.events);
        move || {
            events
                .lock()
                .unwrap()
                .iter()
                .filter(|(channel, _)| channel == SOURCE_CLOSED)
                .count()
                == 2
        }
    })
    .await;

    fixture.bus.shutdown().await;
}
