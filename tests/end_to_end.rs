//! Loopback scenarios driving workers, relays and the hub through their
//! public API with short timeouts.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use image::{Rgb, RgbImage};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use mjpeg_relay::capture::jpeg::decode_jpeg;
use mjpeg_relay::capture::{CaptureConfig, CaptureStrategy, Frame, FrameSource, SharedCapture, TestPattern};
use mjpeg_relay::detect::{DetectError, Detection, Detector};
use mjpeg_relay::error::CaptureError;
use mjpeg_relay::gateway::{GatewayConfig, Hub, HubConfig};
use mjpeg_relay::net::bind_reusable;
use mjpeg_relay::protocol::{encode_chunk, ChunkDecoder, Command, CommandReply};
use mjpeg_relay::relay::{RelayConfig, RelayForwarder};
use mjpeg_relay::supervisor::{check_workers, Liveness, SupervisorConfig};
use mjpeg_relay::worker::{
    send_command, CommandChannel, CommandConfig, SharedLabels, StreamConfig, StreamServer, Worker,
    WorkerConfig,
};
use mjpeg_relay::Error;

const LOCALHOST: IpAddr = IpAddr::V4(Ipv4Addr::LOCALHOST);

fn any_port() -> SocketAddr {
    SocketAddr::new(LOCALHOST, 0)
}

async fn closed_addr() -> SocketAddr {
    let listener = TcpListener::bind(any_port()).await.unwrap();
    listener.local_addr().unwrap()
}

/// Next chunk payload from an MJPEG-over-TCP feed
async fn next_payload(socket: &mut TcpStream, decoder: &mut ChunkDecoder) -> Vec<u8> {
    loop {
        if let Some(chunk) = decoder.decode().unwrap() {
            return chunk.payload().to_vec();
        }
        let n = socket.read_buf(decoder.buffer_mut()).await.unwrap();
        assert!(n > 0, "feed closed");
    }
}

const MARKED_FRAMES: u8 = 10;
const FRAME_HOLD: Duration = Duration::from_millis(150);

/// Ten uniform gray frames (level 20 * k) on a shared clock
///
/// Every reader sees frame 0 until the clock starts, then frame k during
/// the k-th hold interval, then the last frame forever.
#[derive(Clone, Default)]
struct MarkedFrames {
    started: Arc<Mutex<Option<Instant>>>,
}

impl MarkedFrames {
    fn start(&self) {
        *self.started.lock().unwrap() = Some(Instant::now());
    }
}

impl CaptureStrategy for MarkedFrames {
    fn name(&self) -> &str {
        "marked-frames"
    }

    fn open(&self) -> Result<Box<dyn FrameSource>, CaptureError> {
        Ok(Box::new(self.clone()))
    }
}

impl FrameSource for MarkedFrames {
    fn read(&mut self) -> Result<RgbImage, CaptureError> {
        std::thread::sleep(Duration::from_millis(5));
        let index = match *self.started.lock().unwrap() {
            Some(started) => {
                let k = started.elapsed().as_millis() / FRAME_HOLD.as_millis();
                k.min(MARKED_FRAMES as u128 - 1) as u8
            }
            None => 0,
        };
        Ok(RgbImage::from_pixel(32, 32, Rgb([index * 20; 3])))
    }
}

fn marker(jpeg: &[u8]) -> u8 {
    let image = decode_jpeg(jpeg).unwrap();
    let level = image.get_pixel(16, 16)[0] as u32;
    ((level + 10) / 20) as u8
}

#[tokio::test]
async fn two_clients_receive_all_marked_frames_in_order() {
    let frames = MarkedFrames::default();
    let capture = SharedCapture::open(vec![Box::new(frames.clone())], CaptureConfig::default()).unwrap();
    let server = Arc::new(StreamServer::new(
        StreamConfig::with_addr(any_port()),
        Arc::new(capture),
    ));
    let listener = server.listen().unwrap();
    let addr = listener.local_addr().unwrap();
    let shutdown = CancellationToken::new();
    let serving = Arc::clone(&server);
    let token = shutdown.clone();
    tokio::spawn(async move { serving.serve(listener, token).await });

    let mut clients = Vec::new();
    for _ in 0..2 {
        let mut socket = TcpStream::connect(addr).await.unwrap();
        let mut decoder = ChunkDecoder::new();
        assert_eq!(marker(&next_payload(&mut socket, &mut decoder).await), 0);
        clients.push((socket, decoder));
    }

    frames.start();

    let collectors: Vec<JoinHandle<Vec<u8>>> = clients
        .into_iter()
        .map(|(mut socket, mut decoder)| {
            tokio::spawn(async move {
                let mut seen = vec![0u8];
                while *seen.last().unwrap() != MARKED_FRAMES - 1 {
                    let mark = marker(&next_payload(&mut socket, &mut decoder).await);
                    if Some(&mark) != seen.last() {
                        seen.push(mark);
                    }
                }
                seen
            })
        })
        .collect();

    let expected: Vec<u8> = (0..MARKED_FRAMES).collect();
    for collector in collectors {
        let seen = tokio::time::timeout(Duration::from_secs(10), collector)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(seen, expected);
    }

    shutdown.cancel();
}

/// Upstream that writes `chunk` every 20 ms to each connection it accepts
fn spawn_feed(listener: TcpListener, chunk: bytes::Bytes) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Ok((mut socket, _)) = listener.accept().await {
            while socket.write_all(&chunk).await.is_ok() {
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        }
    })
}

#[tokio::test]
async fn relay_tracks_upstream_loss_and_recovery() {
    let read_timeout = Duration::from_millis(500);
    let reconnect_delay = Duration::from_millis(200);

    let listener = bind_reusable(any_port()).unwrap();
    let upstream = listener.local_addr().unwrap();
    let chunk = encode_chunk(b"\xff\xd8not really a jpeg\xff\xd9");
    let feed = spawn_feed(listener, chunk.clone());

    let relay = Arc::new(RelayForwarder::new(
        0,
        RelayConfig::new(upstream)
            .reconnect_delay(reconnect_delay)
            .connect_timeout(Duration::from_millis(500))
            .read_timeout(read_timeout),
    ));
    assert!(!relay.connected());

    let shutdown = CancellationToken::new();
    let running = Arc::clone(&relay);
    let token = shutdown.clone();
    tokio::spawn(async move { running.run_until(token).await });

    assert!(relay.wait_connected(Duration::from_secs(2), Duration::from_millis(10)).await);
    let mut subscription = relay.subscribe();
    let forwarded = tokio::time::timeout(Duration::from_secs(2), subscription.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(forwarded, chunk);

    feed.abort();
    let _ = feed.await;
    let lost_at = Instant::now();
    while relay.connected() {
        assert!(
            lost_at.elapsed() < read_timeout + Duration::from_millis(250),
            "still connected after upstream died"
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    let listener = bind_reusable(upstream).unwrap();
    let _feed = spawn_feed(listener, chunk.clone());
    assert!(
        relay
            .wait_connected(reconnect_delay * 2 + Duration::from_secs(1), Duration::from_millis(10))
            .await,
        "relay did not reconnect after upstream recovery"
    );
    assert!(relay.stats().connect_attempts >= 2);

    shutdown.cancel();
}

/// Detector that records the labels of every cycle
#[derive(Default)]
struct RecordingDetector {
    cycles: Mutex<Vec<Vec<String>>>,
}

impl Detector for RecordingDetector {
    fn detect(&self, _frame: &Frame, labels: &[String]) -> Result<Vec<Detection>, DetectError> {
        self.cycles.lock().unwrap().push(labels.to_vec());
        Ok(labels
            .iter()
            .map(|label| Detection::new(label.clone(), 0.9, [2, 2, 20, 20]))
            .collect())
    }
}

#[tokio::test]
async fn set_prompt_changes_detection_labels() {
    let detector = Arc::new(RecordingDetector::default());
    let config = WorkerConfig::default()
        .raw_feed(None)
        .annotated_feed(Some(StreamConfig::with_addr(any_port())))
        .command(Some(CommandConfig::with_addr(any_port())));
    let strategies: Vec<Box<dyn CaptureStrategy>> = vec![Box::new(TestPattern::new(64, 48, 60))];
    let worker = Worker::new(config, strategies)
        .with_detector(detector.clone())
        .bind()
        .await
        .unwrap();
    let command_addr = worker.command_addr().unwrap();
    let feed_addr = worker.annotated_addr().unwrap();
    let labels = worker.labels().clone();

    let shutdown = CancellationToken::new();
    tokio::spawn(worker.run_until(shutdown.clone()));

    let reply = send_command(
        command_addr,
        &Command::set_prompt("a box, a person"),
        Duration::from_secs(2),
    )
    .await
    .unwrap();
    assert_eq!(reply, CommandReply::Ok);
    assert_eq!(labels.snapshot(), vec!["a box", "a person"]);

    let mut socket = TcpStream::connect(feed_addr).await.unwrap();
    let mut decoder = ChunkDecoder::new();
    for _ in 0..2 {
        let jpeg = next_payload(&mut socket, &mut decoder).await;
        assert!(decode_jpeg(&jpeg).is_ok());
    }

    let cycles = detector.cycles.lock().unwrap().clone();
    assert!(!cycles.is_empty());
    for cycle in cycles {
        assert_eq!(cycle, vec!["a box", "a person"]);
    }

    shutdown.cancel();
}

#[tokio::test]
async fn unknown_command_gets_unknown_reply() {
    let channel = Arc::new(CommandChannel::new(
        CommandConfig::with_addr(any_port()),
        SharedLabels::default(),
    ));
    let listener = channel.listen().unwrap();
    let addr = listener.local_addr().unwrap();
    let shutdown = CancellationToken::new();
    let serving = Arc::clone(&channel);
    let token = shutdown.clone();
    tokio::spawn(async move { serving.serve(listener, token).await });

    let mut socket = TcpStream::connect(addr).await.unwrap();
    socket.write_all(br#"{"cmd":"bogus"}"#).await.unwrap();
    socket.shutdown().await.unwrap();
    let mut reply = Vec::new();
    socket.read_to_end(&mut reply).await.unwrap();

    assert_eq!(reply, b"UNKNOWN");
    shutdown.cancel();
}

#[tokio::test]
async fn disconnected_camera_answers_unavailable() {
    let wait = Duration::from_millis(500);
    let config = HubConfig::default()
        .gateway(
            GatewayConfig::default()
                .bind(any_port())
                .camera_wait(wait, Duration::from_millis(50)),
        )
        .supervisor(SupervisorConfig::default().ports(vec![]).auto_start(false))
        .cameras(vec![RelayConfig::new(closed_addr().await)]);
    let hub = Hub::new(config).bind().unwrap();
    let addr = hub.local_addr();
    let shutdown = CancellationToken::new();
    tokio::spawn(hub.run_until(shutdown.clone()));

    let started = Instant::now();
    let response = tokio::time::timeout(Duration::from_secs(5), async {
        let mut socket = TcpStream::connect(addr).await.unwrap();
        socket
            .write_all(b"GET /camera/0 HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n")
            .await
            .unwrap();
        let mut raw = String::new();
        socket.read_to_string(&mut raw).await.unwrap();
        raw
    })
    .await
    .expect("camera request hung");

    assert!(response.starts_with("HTTP/1.1 503"), "{}", response);
    assert!(started.elapsed() >= wait);
    shutdown.cancel();
}

#[tokio::test]
async fn liveness_names_the_closed_port() {
    let a = TcpListener::bind(any_port()).await.unwrap();
    let c = TcpListener::bind(any_port()).await.unwrap();
    let closed = closed_addr().await.port();
    let ports = [
        a.local_addr().unwrap().port(),
        closed,
        c.local_addr().unwrap().port(),
    ];

    let liveness = check_workers(LOCALHOST, &ports, Duration::from_secs(1)).await;
    assert_eq!(liveness, Liveness::Unreachable { port: closed });
}

/// Camera that delivers its warm-up frame, then fails every read and
/// cannot be reopened
struct DyingCamera {
    opens: AtomicUsize,
    reads: Arc<AtomicUsize>,
}

struct DyingSource {
    reads: Arc<AtomicUsize>,
}

impl CaptureStrategy for DyingCamera {
    fn name(&self) -> &str {
        "dying-camera"
    }

    fn open(&self) -> Result<Box<dyn FrameSource>, CaptureError> {
        if self.opens.fetch_add(1, Ordering::SeqCst) > 0 {
            return Err(CaptureError::Open {
                strategy: "dying-camera".into(),
                reason: "device gone".into(),
            });
        }
        Ok(Box::new(DyingSource {
            reads: Arc::clone(&self.reads),
        }))
    }
}

impl FrameSource for DyingSource {
    fn read(&mut self) -> Result<RgbImage, CaptureError> {
        if self.reads.fetch_add(1, Ordering::SeqCst) == 0 {
            Ok(RgbImage::new(8, 8))
        } else {
            Err(CaptureError::Read("sensor unplugged".into()))
        }
    }
}

#[tokio::test]
async fn exhausted_capture_stops_worker_after_budget() {
    let reads = Arc::new(AtomicUsize::new(0));
    let camera = DyingCamera {
        opens: AtomicUsize::new(0),
        reads: Arc::clone(&reads),
    };
    let config = WorkerConfig::default()
        .raw_feed(Some(StreamConfig::with_addr(any_port())))
        .annotated_feed(None)
        .command(None)
        .capture(
            CaptureConfig::default()
                .max_consecutive_failures(4)
                .retry_pause(Duration::from_millis(1)),
        );
    let worker = Worker::new(config, vec![Box::new(camera)]).bind().await.unwrap();
    let feed_addr = worker.raw_addr().unwrap();
    let stopped = tokio::spawn(worker.run_until(CancellationToken::new()));

    let _client = TcpStream::connect(feed_addr).await.unwrap();
    let result = tokio::time::timeout(Duration::from_secs(5), stopped)
        .await
        .expect("worker kept running")
        .unwrap();

    match result {
        Err(Error::Capture(CaptureError::Exhausted {
            consecutive_failures,
        })) => assert_eq!(consecutive_failures, 4),
        other => panic!("expected exhausted capture, got {:?}", other),
    }
    // One warm-up frame, then exactly the failure budget
    assert_eq!(reads.load(Ordering::SeqCst), 1 + 4);
}
