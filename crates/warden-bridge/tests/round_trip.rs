//! Client against a live server backed by the in-memory fake.

mod common;

use std::collections::HashMap;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};

use common::{FakeBackend, SharedBuf, TestServer, eventually};
use warden_bridge::backend::{
    BandwidthLimits, ContainerSpec, CpuLimits, DiskLimits, IpRange, MemoryLimits, NetOutRule,
    NetProtocol, PortRange, ProcessSpec,
};
use warden_bridge::client::{Error, OutputMode, ProcessIo, parse_env};
use warden_bridge::server::ServerConfig;

fn spec(handle: &str) -> ContainerSpec {
    ContainerSpec {
        handle: handle.to_string(),
        ..ContainerSpec::default()
    }
}

fn script(script: &str) -> ProcessSpec {
    ProcessSpec {
        script: script.to_string(),
        ..ProcessSpec::default()
    }
}

#[tokio::test]
async fn ping_and_capacity() {
    let server = TestServer::start(FakeBackend::new()).await;
    let client = server.connect();

    client.ping().await.unwrap();
    let capacity = client.capacity().await.unwrap();
    assert_eq!(capacity.max_containers, 256);
    assert_eq!(capacity.memory_in_bytes, 8 << 30);
}

#[tokio::test]
async fn create_list_destroy() {
    let server = TestServer::start(FakeBackend::new()).await;
    let client = server.connect();

    let handle = client.create(spec("")).await.unwrap();
    assert!(!handle.is_empty());
    let named = client.create(spec("web")).await.unwrap();
    assert_eq!(named, "web");

    let mut handles = client.list(&HashMap::new()).await.unwrap();
    handles.sort();
    assert_eq!(handles, server.backend.handles());

    client.destroy("web").await.unwrap();
    assert_eq!(client.list(&HashMap::new()).await.unwrap(), vec![handle]);

    let err = client.destroy("web").await.unwrap_err();
    assert!(matches!(err, Error::ContainerNotFound { ref handle } if handle == "web"));
}

#[tokio::test]
async fn duplicate_create_is_a_remote_error() {
    let server = TestServer::start(FakeBackend::new()).await;
    let client = server.connect();

    client.create(spec("dup")).await.unwrap();
    let err = client.create(spec("dup")).await.unwrap_err();
    assert_eq!(err.status(), Some(500));
    assert!(err.to_string().contains("handle already exists"));
}

#[tokio::test]
async fn list_filters_by_properties() {
    let server = TestServer::start(FakeBackend::new()).await;
    let client = server.connect();

    let mut tagged = spec("tagged");
    tagged.properties.insert("team".to_string(), "core".to_string());
    tagged.properties.insert("tier".to_string(), "gold".to_string());
    client.create(tagged).await.unwrap();
    client.create(spec("plain")).await.unwrap();

    let filter = HashMap::from([("team".to_string(), "core".to_string())]);
    assert_eq!(client.list(&filter).await.unwrap(), vec!["tagged"]);

    let filter = HashMap::from([("team".to_string(), "other".to_string())]);
    assert!(client.list(&filter).await.unwrap().is_empty());
}

#[tokio::test]
async fn unknown_handle_maps_to_container_not_found() {
    let server = TestServer::start(FakeBackend::new()).await;
    let client = server.connect();

    let err = client.info("ghost").await.unwrap_err();
    assert!(err.is_not_found());
    assert!(matches!(err, Error::ContainerNotFound { ref handle } if handle == "ghost"));

    let err = client
        .run("ghost", script("echo hi"), ProcessIo::default())
        .await
        .unwrap_err();
    assert!(matches!(err, Error::ContainerNotFound { ref handle } if handle == "ghost"));
}

#[tokio::test]
async fn info_round_trips_through_the_wire() {
    let server = TestServer::start(FakeBackend::new()).await;
    let client = server.connect();

    let mut created = spec("box");
    created.properties.insert("owner".to_string(), "ci".to_string());
    client.create(created).await.unwrap();
    let mut process = client
        .run("box", script("exit 0"), ProcessIo::default())
        .await
        .unwrap();
    process.wait().await.unwrap();

    let info = client.info("box").await.unwrap();
    assert_eq!(info.state, "active");
    assert_eq!(info.container_ip, "10.254.0.2");
    assert_eq!(info.container_path, "/var/lib/warden/box");
    assert_eq!(info.process_ids, vec![process.id()]);
    assert_eq!(info.properties.get("owner").map(String::as_str), Some("ci"));
    assert_eq!(info.cpu_stat.usage, 1200);
    assert_eq!(info.memory_stat.rss, 4096);
    assert_eq!(info.mapped_ports[0].container_port, 8080);
}

#[tokio::test]
async fn run_delivers_output_on_auxiliary_streams() {
    let server = TestServer::start(FakeBackend::new()).await;
    let client = server.connect_with(OutputMode::Auxiliary);
    client.create(spec("c1")).await.unwrap();

    let stdout = SharedBuf::default();
    let stderr = SharedBuf::default();
    let io = ProcessIo::default()
        .with_stdout(stdout.clone())
        .with_stderr(stderr.clone());
    let mut process = client.run("c1", script("both"), io).await.unwrap();

    assert_eq!(process.wait().await.unwrap(), 0);
    assert_eq!(stdout.contents(), "out\n");
    assert_eq!(stderr.contents(), "err\n");
}

#[tokio::test]
async fn run_delivers_output_inline() {
    let server = TestServer::start(FakeBackend::new()).await;
    let client = server.connect_with(OutputMode::Inline);
    client.create(spec("c1")).await.unwrap();

    let stdout = SharedBuf::default();
    let mut process = client
        .run(
            "c1",
            script("echo hi"),
            ProcessIo::default().with_stdout(stdout.clone()),
        )
        .await
        .unwrap();

    assert_eq!(process.wait().await.unwrap(), 0);
    assert_eq!(stdout.contents(), "hi\n");
}

#[tokio::test]
async fn output_without_a_sink_is_discarded() {
    let server = TestServer::start(FakeBackend::new()).await;
    let client = server.connect();
    client.create(spec("c1")).await.unwrap();

    let stdout = SharedBuf::default();
    let mut process = client
        .run(
            "c1",
            script("both"),
            ProcessIo::default().with_stdout(stdout.clone()),
        )
        .await
        .unwrap();

    assert_eq!(process.wait().await.unwrap(), 0);
    assert_eq!(stdout.contents(), "out\n");
}

#[tokio::test]
async fn exit_status_is_reported_and_cached() {
    let server = TestServer::start(FakeBackend::new()).await;
    let client = server.connect();
    client.create(spec("c1")).await.unwrap();

    let mut process = client
        .run("c1", script("exit 3"), ProcessIo::default())
        .await
        .unwrap();
    assert_eq!(process.wait().await.unwrap(), 3);
    assert_eq!(process.wait().await.unwrap(), 3);
}

#[tokio::test]
async fn stdin_is_forwarded_and_closed() {
    let server = TestServer::start(FakeBackend::new()).await;
    let client = server.connect_with(OutputMode::Inline);
    client.create(spec("c1")).await.unwrap();

    let stdout = SharedBuf::default();
    let io = ProcessIo::default()
        .with_stdin(&b"ping\npong\n"[..])
        .with_stdout(stdout.clone());
    let mut process = client.run("c1", script("cat"), io).await.unwrap();

    assert_eq!(process.wait().await.unwrap(), 0);
    assert_eq!(stdout.contents(), "ping\npong\n");
}

#[tokio::test]
async fn environment_reaches_the_process() {
    let server = TestServer::start(FakeBackend::new()).await;
    let client = server.connect_with(OutputMode::Inline);
    client.create(spec("c1")).await.unwrap();

    let stdout = SharedBuf::default();
    let process_spec = ProcessSpec {
        script: "env GREETING".to_string(),
        env: parse_env(&["GREETING=hello=world"]).unwrap(),
        ..ProcessSpec::default()
    };
    let mut process = client
        .run(
            "c1",
            process_spec,
            ProcessIo::default().with_stdout(stdout.clone()),
        )
        .await
        .unwrap();

    assert_eq!(process.wait().await.unwrap(), 0);
    assert_eq!(stdout.contents(), "hello=world");
}

#[tokio::test]
async fn process_failure_surfaces_as_process_error() {
    let server = TestServer::start(FakeBackend::new()).await;
    let client = server.connect();
    client.create(spec("c1")).await.unwrap();

    let mut process = client
        .run("c1", script("fail out of memory"), ProcessIo::default())
        .await
        .unwrap();
    let err = process.wait().await.unwrap_err();
    assert!(matches!(err, Error::Process(ref msg) if msg == "out of memory"));
}

#[tokio::test]
async fn vanished_process_yields_an_error_frame() {
    let server = TestServer::start(FakeBackend::new()).await;
    let client = server.connect();
    client.create(spec("c1")).await.unwrap();

    let mut process = client
        .run("c1", script("vanish"), ProcessIo::default())
        .await
        .unwrap();
    let err = process.wait().await.unwrap_err();
    assert!(matches!(err, Error::Process(ref msg) if msg.contains("without an exit status")));
}

#[tokio::test]
async fn attach_follows_a_running_process() {
    let server = TestServer::start(FakeBackend::new()).await;
    let client = server.connect();
    client.create(spec("c1")).await.unwrap();

    let (mut stdin, stdin_reader) = tokio::io::duplex(64);
    let mut running = client
        .run(
            "c1",
            script("cat"),
            ProcessIo::default().with_stdin(stdin_reader),
        )
        .await
        .unwrap();

    let attached_out = SharedBuf::default();
    let mut attached = client
        .attach(
            "c1",
            running.id(),
            ProcessIo::default().with_stdout(attached_out.clone()),
        )
        .await
        .unwrap();
    assert_eq!(attached.id(), running.id());
    assert_ne!(attached.stream_id(), running.stream_id());

    stdin.write_all(b"hello\n").await.unwrap();
    drop(stdin);

    assert_eq!(running.wait().await.unwrap(), 0);
    assert_eq!(attached.wait().await.unwrap(), 0);
    assert_eq!(attached_out.contents(), "hello\n");
}

#[tokio::test]
async fn attach_to_unknown_process_is_not_found() {
    let server = TestServer::start(FakeBackend::new()).await;
    let client = server.connect();
    client.create(spec("c1")).await.unwrap();

    let err = client
        .attach("c1", 99, ProcessIo::default())
        .await
        .unwrap_err();
    assert!(err.is_not_found());
    assert!(matches!(err, Error::Remote { code: 404, .. }));
}

#[tokio::test]
async fn limits_apply_and_read_back() {
    let server = TestServer::start(FakeBackend::new()).await;
    let client = server.connect();
    client.create(spec("c1")).await.unwrap();

    let memory = client
        .limit_memory(
            "c1",
            MemoryLimits {
                limit_in_bytes: 64 << 20,
            },
        )
        .await
        .unwrap();
    assert_eq!(memory.limit_in_bytes, 64 << 20);
    assert_eq!(client.current_memory_limits("c1").await.unwrap(), memory);

    let cpu = client
        .limit_cpu("c1", CpuLimits { limit_in_shares: 512 })
        .await
        .unwrap();
    assert_eq!(client.current_cpu_limits("c1").await.unwrap(), cpu);

    let bandwidth = BandwidthLimits {
        rate_in_bytes_per_second: 1000,
        burst_rate_in_bytes_per_second: 2000,
    };
    assert_eq!(
        client.limit_bandwidth("c1", bandwidth).await.unwrap(),
        bandwidth
    );
    assert_eq!(
        client.current_bandwidth_limits("c1").await.unwrap(),
        bandwidth
    );

    let disk = DiskLimits {
        block_soft: 10,
        block_hard: 20,
        inode_soft: 30,
        inode_hard: 40,
        byte_soft: 50,
        byte_hard: 60,
    };
    assert_eq!(client.limit_disk("c1", disk).await.unwrap(), disk);
    assert_eq!(client.current_disk_limits("c1").await.unwrap(), disk);
}

#[tokio::test]
async fn stream_in_then_stream_out() {
    let server = TestServer::start(FakeBackend::new()).await;
    let client = server.connect();
    client.create(spec("c1")).await.unwrap();

    let payload = b"pretend this is a tarball".to_vec();
    client
        .stream_in("c1", "/tmp/upload", Box::new(std::io::Cursor::new(payload.clone())))
        .await
        .unwrap();
    let container = server.backend.container("c1").unwrap();
    assert_eq!(container.file("/tmp/upload"), Some(payload.clone()));

    let mut reader = client.stream_out("c1", "/tmp/upload").await.unwrap();
    let mut downloaded = Vec::new();
    reader.read_to_end(&mut downloaded).await.unwrap();
    assert_eq!(downloaded, payload);

    let Err(err) = client.stream_out("c1", "/missing").await else {
        panic!("streaming out a missing path succeeded");
    };
    assert_eq!(err.status(), Some(500));
}

#[tokio::test]
async fn copy_in_and_copy_out_reach_the_backend() {
    let server = TestServer::start(FakeBackend::new()).await;
    let client = server.connect();
    client.create(spec("c1")).await.unwrap();

    client.copy_in("c1", "/host/a", "/box/a").await.unwrap();
    client
        .copy_out("c1", "/box/b", "/host/b", "vcap")
        .await
        .unwrap();

    let container = server.backend.container("c1").unwrap();
    assert_eq!(
        container.copies(),
        vec!["in /host/a -> /box/a", "out /box/b -> /host/b (vcap)"]
    );
}

#[tokio::test]
async fn net_in_and_net_out() {
    let server = TestServer::start(FakeBackend::new()).await;
    let client = server.connect();
    client.create(spec("c1")).await.unwrap();

    assert_eq!(client.net_in("c1", 0, 0).await.unwrap(), (61001, 61001));
    assert_eq!(client.net_in("c1", 8000, 80).await.unwrap(), (8000, 80));

    let rule = NetOutRule {
        protocol: NetProtocol::Tcp,
        networks: vec![IpRange {
            start: "10.0.0.1".parse().unwrap(),
            end: "10.0.0.255".parse().unwrap(),
        }],
        ports: vec![PortRange {
            start: 80,
            end: 443,
        }],
        log: true,
    };
    client.net_out("c1", rule.clone()).await.unwrap();
    let container = server.backend.container("c1").unwrap();
    assert_eq!(container.net_out_rules(), vec![rule]);
}

#[tokio::test]
async fn properties_get_set_remove() {
    let server = TestServer::start(FakeBackend::new()).await;
    let client = server.connect();
    client.create(spec("c1")).await.unwrap();

    client.set_property("c1", "color", "blue").await.unwrap();
    assert_eq!(client.get_property("c1", "color").await.unwrap(), "blue");

    client.remove_property("c1", "color").await.unwrap();
    let err = client.get_property("c1", "color").await.unwrap_err();
    assert_eq!(err.status(), Some(500));
}

#[tokio::test]
async fn property_keys_are_percent_encoded() {
    let server = TestServer::start(FakeBackend::new()).await;
    let client = server.connect();
    client.create(spec("c1")).await.unwrap();

    client
        .set_property("c1", "a key/with slash", "v")
        .await
        .unwrap();
    assert_eq!(
        client.get_property("c1", "a key/with slash").await.unwrap(),
        "v"
    );
}

#[tokio::test]
async fn background_stop_replies_before_the_backend_finishes() {
    let server = TestServer::start(FakeBackend::new()).await;
    let client = server.connect();
    client.create(spec("c1")).await.unwrap();
    let container = server.backend.container("c1").unwrap();
    container.hold_stop();

    client.stop("c1", false, true).await.unwrap();
    assert!(!container.is_stopped());

    container.release_stop();
    assert!(eventually(|| container.is_stopped()).await);
}

#[tokio::test]
async fn foreground_stop_waits_for_the_backend() {
    let server = TestServer::start(FakeBackend::new()).await;
    let client = server.connect();
    client.create(spec("c1")).await.unwrap();

    client.stop("c1", true, false).await.unwrap();
    assert!(server.backend.container("c1").unwrap().is_stopped());
}

#[tokio::test]
async fn idle_container_is_destroyed_after_its_grace_time() {
    let server = TestServer::start(FakeBackend::new()).await;
    let client = server.connect();

    let short = ContainerSpec {
        handle: "short".to_string(),
        grace_time: Duration::from_secs(1),
        ..ContainerSpec::default()
    };
    client.create(short).await.unwrap();
    client.create(spec("forever")).await.unwrap();

    tokio::time::sleep(Duration::from_millis(1500)).await;
    assert_eq!(client.list(&HashMap::new()).await.unwrap(), vec!["forever"]);
}

#[tokio::test]
async fn server_default_grace_time_applies_to_new_containers() {
    let config = ServerConfig {
        container_grace_time: Duration::from_secs(1),
        ..ServerConfig::default()
    };
    let server = TestServer::start_with(FakeBackend::new(), config).await;
    let client = server.connect();

    client.create(spec("c1")).await.unwrap();
    let backend = server.backend.clone();
    tokio::time::sleep(Duration::from_millis(1500)).await;
    assert!(backend.container("c1").is_none());
}

#[tokio::test]
async fn existing_containers_are_strapped_on_startup() {
    let backend = FakeBackend::with_containers(&["old"], Duration::from_secs(1));
    let server = TestServer::start(backend).await;

    assert!(server.backend.container("old").is_some());
    tokio::time::sleep(Duration::from_millis(1500)).await;
    assert!(server.backend.container("old").is_none());
}

#[tokio::test]
async fn unreachable_server_fails_to_dial() {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let address = listener.local_addr().unwrap().to_string();
    drop(listener);

    let client = warden_bridge::Connection::new(
        warden_bridge::ConnectionConfig::new(address)
            .with_dial_timeout(Duration::from_millis(200)),
    )
    .unwrap();

    let err = client
        .run("c1", script("echo hi"), ProcessIo::default())
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Dial(_)));
    assert!(matches!(client.ping().await.unwrap_err(), Error::Transport(_)));
}
