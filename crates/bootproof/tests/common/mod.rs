#![allow(dead_code)]

use std::io::{BufRead, BufReader, Read, Write};
use std::net::TcpListener;
use std::sync::{Arc, Mutex};
use std::thread;

use bootproof::appliance::Appliance;
use bootproof::assets::{Asset, MemoryAssetRepository, OsFamily, RecoveryPoint};
use bootproof::broker::{ConnectionBroker, LocalBroker};
use bootproof::clock::ManualClock;
use bootproof::config::Settings;
use bootproof::driver::SimulatedDriver;
use bootproof::model::WeeklySchedule;
use bootproof::notify::{LogNotifier, NoopUploader};
use bootproof::store::MemoryStore;
use bootproof::transaction::TracingSink;

/// 2023-11-14 22:13:20 UTC, a Tuesday.
pub const SNAPSHOT: i64 = 1_700_000_000;
pub const NOW: i64 = SNAPSHOT + 3_600;

pub struct Harness {
    pub app: Appliance,
    pub clock: Arc<ManualClock>,
    pub device: Arc<MemoryStore>,
    pub ephemeral: Arc<MemoryStore>,
    pub assets: Arc<MemoryAssetRepository>,
    pub driver: Arc<SimulatedDriver>,
    pub dir: tempfile::TempDir,
}

/// Weekday business-hours agent with one local recovery point at `SNAPSHOT`.
pub fn agent() -> Asset {
    let mut a = Asset::new("agent-1", OsFamily::Windows);
    a.hostname = "fileserver".into();
    a.backup.schedule = WeeklySchedule::with_hours(&[1, 2, 3, 4, 5], 8..19);
    a.backup.interval_minutes = 60;
    a.add_point(RecoveryPoint::local(SNAPSHOT));
    a
}

pub fn harness(driver: SimulatedDriver, assets: Vec<Asset>) -> Harness {
    harness_with(driver, assets, Arc::new(LocalBroker), Arc::new(MemoryStore::new()))
}

/// `ephemeral` is passed in so driver call hooks can share it.
pub fn harness_with(
    driver: SimulatedDriver,
    assets: Vec<Asset>,
    broker: Arc<dyn ConnectionBroker>,
    ephemeral: Arc<MemoryStore>,
) -> Harness {
    let dir = tempfile::tempdir().expect("tempdir");
    let mut settings = Settings::default();
    settings.paths.screenshots_dir = dir.path().join("screenshots");
    settings.scheduler.utc_offset_minutes = Some(0);
    settings.runner.ready_poll_secs = 5;
    settings.queue.lock_timeout_secs = 2;

    let clock = Arc::new(ManualClock::new(NOW));
    let device = Arc::new(MemoryStore::new());
    let assets = Arc::new(MemoryAssetRepository::with_assets(assets));
    let driver = Arc::new(driver);
    let app = Appliance {
        settings,
        device: device.clone(),
        ephemeral: ephemeral.clone(),
        locks: Arc::new(MemoryStore::new()),
        assets: assets.clone(),
        driver: driver.clone(),
        broker,
        notifier: Arc::new(LogNotifier),
        uploader: Arc::new(NoopUploader),
        clock: clock.clone(),
        sink: Arc::new(TracingSink),
    };
    Harness {
        app,
        clock,
        device,
        ephemeral,
        assets,
        driver,
        dir,
    }
}

#[derive(Debug, Clone)]
pub struct Request {
    pub method: String,
    pub path: String,
    pub authorization: Option<String>,
    pub body: String,
}

/// Minimal HTTP/1.1 server answering each request with the next canned
/// `(status, body)` and closing the connection.
pub struct HttpFixture {
    pub base_url: String,
    requests: Arc<Mutex<Vec<Request>>>,
}

impl HttpFixture {
    pub fn start(responses: Vec<(u16, &'static str)>) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").expect("bind");
        let addr = listener.local_addr().expect("addr");
        let requests = Arc::new(Mutex::new(Vec::new()));
        let seen = requests.clone();
        thread::spawn(move || {
            for (status, body) in responses {
                let Ok((stream, _)) = listener.accept() else {
                    return;
                };
                let mut reader = BufReader::new(stream.try_clone().expect("clone stream"));
                let req = read_request(&mut reader);
                seen.lock().expect("lock").push(req);
                let mut stream = stream;
                let reply = format!(
                    "HTTP/1.1 {status} X\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
                    body.len()
                );
                let _ = stream.write_all(reply.as_bytes());
                let _ = stream.flush();
            }
        });
        Self {
            base_url: format!("http://{addr}"),
            requests,
        }
    }

    pub fn requests(&self) -> Vec<Request> {
        self.requests.lock().expect("lock").clone()
    }
}

fn read_request(reader: &mut impl BufRead) -> Request {
    let mut line = String::new();
    reader.read_line(&mut line).expect("request line");
    let mut parts = line.split_whitespace();
    let method = parts.next().unwrap_or_default().to_string();
    let path = parts.next().unwrap_or_default().to_string();

    let mut content_length = 0usize;
    let mut authorization = None;
    loop {
        let mut header = String::new();
        reader.read_line(&mut header).expect("header");
        let header = header.trim_end();
        if header.is_empty() {
            break;
        }
        if let Some((name, value)) = header.split_once(':') {
            let value = value.trim();
            if name.eq_ignore_ascii_case("content-length") {
                content_length = value.parse().unwrap_or(0);
            } else if name.eq_ignore_ascii_case("authorization") {
                authorization = Some(value.to_string());
            }
        }
    }
    let mut body = vec![0u8; content_length];
    reader.read_exact(&mut body).expect("body");
    Request {
        method,
        path,
        authorization,
        body: String::from_utf8_lossy(&body).into_owned(),
    }
}
