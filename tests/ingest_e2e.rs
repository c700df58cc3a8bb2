use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use ftserver::config::Config;
use ftserver::logger::MemoryLogger;
use ftserver::protocol_core::{encode_announcement, parse_message, Announcement, Message};
use ftserver::service::{Deps, RunOptions, Service};
use ftserver::storage::{SpaceProbe, GB};
use ftserver::writer::DiskSink;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;

struct Plenty;

impl SpaceProbe for Plenty {
    fn available(&self, _path: &Path) -> io::Result<u64> {
        Ok(500 * GB)
    }
}

fn test_config(volumes: Vec<PathBuf>) -> Config {
    let mut cfg = Config::default();
    cfg.server.port = 0;
    cfg.server.downstream_port = Some(0);
    cfg.database.enabled = false;
    cfg.storage.volumes = volumes;
    cfg.storage.notify_enabled = false;
    cfg.template.auto_free = false;
    cfg
}

async fn start(cfg: &Config, log: Arc<MemoryLogger>) -> Service {
    let deps = Deps {
        logger: log,
        probe: Arc::new(Plenty),
        sink: Box::new(DiskSink),
        store: None,
    };
    let opts = RunOptions {
        bind_host: "127.0.0.1".into(),
        first_housekeeping: Duration::from_secs(3600),
        sweep_period: Duration::from_secs(60),
    };
    Service::start(cfg, deps, opts).await.expect("service starts")
}

async fn eventually<F: Fn() -> bool>(what: &str, f: F) {
    for _ in 0..500 {
        if f() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("timed out waiting for {what}");
}

fn announcement(filename: &str, size: u64) -> Announcement {
    Announcement {
        gid: "001".into(),
        uid: "002".into(),
        cid: "011".into(),
        tmobs: "2019-04-20T21:30:00.500".into(),
        subpath: "G011_190420".into(),
        filename: filename.into(),
        filesize: size,
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn files_land_on_disk_and_downstream_is_told() {
    let vol = tempfile::tempdir().unwrap();
    let cfg = test_config(vec![vol.path().to_path_buf()]);
    let log = Arc::new(MemoryLogger::default());
    let svc = start(&cfg, log.clone()).await;

    let consumer = TcpStream::connect(svc.downstream_addr().unwrap()).await.unwrap();
    eventually("downstream link", || svc.downstream_attached()).await;
    let mut notices = BufReader::new(consumer).lines();

    let producer = TcpStream::connect(svc.ingest_addr()).await.unwrap();
    let (rd, mut wr) = producer.into_split();
    let mut replies = BufReader::new(rd).lines();

    let payloads: [(&str, &[u8]); 2] = [("G011_a.fit", b"SIMPLE  =  T"), ("G011_b.fit", b"")];
    for (name, body) in payloads {
        wr.write_all(encode_announcement(&announcement(name, body.len() as u64)).as_bytes())
            .await
            .unwrap();
        let ready = replies.next_line().await.unwrap().unwrap();
        assert!(ready.starts_with("filestat status=1"), "{ready}");
        wr.write_all(body).await.unwrap();
        let done = replies.next_line().await.unwrap().unwrap();
        assert_eq!(
            done,
            format!("filestat status=2, gid=001, uid=002, cid=011, filename={name}")
        );
    }

    let dir = vol.path().join("G011_190420");
    for (name, body) in payloads {
        let path = dir.join(name);
        eventually("file on disk", || path.exists()).await;
        assert_eq!(std::fs::read(&path).unwrap(), body);
    }

    for (name, body) in payloads {
        let line = notices.next_line().await.unwrap().unwrap();
        match parse_message(&line).unwrap() {
            Message::Announcement(a) => {
                assert_eq!(a.filename, name);
                assert_eq!(a.filesize, body.len() as u64);
                assert_eq!(Path::new(&a.subpath), dir.as_path());
            }
            other => panic!("unexpected notice {other:?}"),
        }
    }

    // heartbeats are accepted while idle
    wr.write_all(b"filestat status=1\n").await.unwrap();
    drop(wr);
    assert!(replies.next_line().await.unwrap().is_none());
    eventually("registry cleanup", || svc.connections() == 0).await;

    assert_eq!(svc.stop().await, None);
    assert!(log.contains("RECEIVED"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn malformed_announcement_closes_the_connection() {
    let vol = tempfile::tempdir().unwrap();
    let cfg = test_config(vec![vol.path().to_path_buf()]);
    let log = Arc::new(MemoryLogger::default());
    let svc = start(&cfg, log.clone()).await;

    let mut producer = TcpStream::connect(svc.ingest_addr()).await.unwrap();
    producer
        .write_all(b"fileinfo subpath=../etc, filename=passwd, filesize=4\n")
        .await
        .unwrap();
    let mut buf = Vec::new();
    let n = producer.read_to_end(&mut buf).await.unwrap();
    assert_eq!(n, 0, "no status is sent for a rejected announcement");
    eventually("fault logged", || log.contains("unsafe path")).await;
    assert!(!vol.path().join("etc").exists());

    svc.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn stop_drops_idle_connections() {
    let a = tempfile::tempdir().unwrap();
    let b = tempfile::tempdir().unwrap();
    let cfg = test_config(vec![a.path().to_path_buf(), b.path().to_path_buf()]);
    let svc = start(&cfg, Arc::new(MemoryLogger::default())).await;

    let mut idle = TcpStream::connect(svc.ingest_addr()).await.unwrap();
    eventually("connection registered", || svc.connections() == 1).await;
    assert_eq!(svc.pool().current(), a.path());

    assert_eq!(svc.stop().await, None);
    let mut buf = [0u8; 8];
    let n = idle.read(&mut buf).await.unwrap_or(0);
    assert_eq!(n, 0);
}
