use std::{
    fs,
    io::{self, Write},
    net::SocketAddr,
    time::Duration,
};

use bytes::Bytes;
use proto::{
    message::content_format, Block, Code, Message, OptionNumber, Plain, Purpose, Type,
};
use tokio::{net::UdpSocket, sync::broadcast, time::timeout};
use tracing_subscriber::EnvFilter;

use super::*;

const WAIT: Duration = Duration::from_secs(10);

/// Plays the server on a loopback socket
struct Peer {
    socket: UdpSocket,
    client: Option<SocketAddr>,
}

impl Peer {
    async fn bind() -> Self {
        Self {
            socket: UdpSocket::bind("127.0.0.1:0").await.unwrap(),
            client: None,
        }
    }

    fn addr(&self) -> SocketAddr {
        self.socket.local_addr().unwrap()
    }

    async fn recv(&mut self) -> Message {
        let mut buf = vec![0; 2048];
        let (n, from) = timeout(WAIT, self.socket.recv_from(&mut buf))
            .await
            .expect("request in time")
            .unwrap();
        self.client = Some(from);
        Message::decode(Bytes::copy_from_slice(&buf[..n])).unwrap()
    }

    /// Piggybacked response to `request`
    async fn respond(&self, request: &Message, mut response: Message) {
        response.ty = Type::Acknowledgement;
        response.id = request.id;
        response.token = request.token;
        let bytes = response.to_bytes(2048).unwrap();
        self.socket
            .send_to(&bytes, self.client.unwrap())
            .await
            .unwrap();
    }
}

/// Serve `image` block by block until the client has all of it
async fn serve_image(peer: &mut Peer, resource: &str, image: &[u8]) {
    loop {
        let request = peer.recv().await;
        assert_eq!(request.code, Code::GET);
        assert_eq!(request.uri_path(), resource);
        let asked = request.block2().unwrap().unwrap();
        let offset = asked.offset() as usize;
        let end = (offset + asked.size()).min(image.len());
        let more = end < image.len();

        let mut response = Message::new(Type::Acknowledgement, Code::CONTENT);
        response.set_content_format(content_format::OCTET_STREAM);
        response.options.push(OptionNumber::ETAG, Bytes::from_static(b"v12"));
        response.set_block2(Block::new(asked.num, more, asked.szx).unwrap());
        if asked.num == 0 {
            response
                .options
                .push_uint(OptionNumber::SIZE2, image.len() as u32);
        }
        response.payload = Bytes::copy_from_slice(&image[offset..end]);
        peer.respond(&request, response).await;
        if !more {
            return;
        }
    }
}

fn image(version: &str, len: u32) -> Vec<u8> {
    let mut image = format!("{version}\n").into_bytes();
    image.extend((0..len).map(|i| i as u8));
    image
}

fn config(peer: &Peer) -> ClientConfig {
    ClientConfig {
        destination: peer.addr(),
        local: "127.0.0.1:0".parse().unwrap(),
        poll_interval_ms: 100,
        suspend_debounce_ms: 10,
        ..ClientConfig::default()
    }
}

fn start(config: &ClientConfig, dir: &tempfile::TempDir) -> (Client, JoinHandle<()>) {
    let platform = Platform::host(dir.path(), CancellationToken::new()).unwrap();
    Client::start(config, Plain, Credentials::default(), platform).unwrap()
}

async fn wait_for<T>(
    events: &mut broadcast::Receiver<ClientEvent>,
    mut select: impl FnMut(ClientEvent) -> Option<T>,
) -> T {
    timeout(WAIT, async {
        loop {
            if let Some(found) = select(events.recv().await.unwrap()) {
                return found;
            }
        }
    })
    .await
    .expect("event in time")
}

#[tokio::test]
async fn telemetry_reply_sets_interval() {
    let _guard = subscribe();
    let mut peer = Peer::bind().await;
    let dir = tempfile::tempdir().unwrap();
    let mut config = config(&peer);
    config.telemetry_query = vec!["id=352656".into()];
    let (client, driver) = start(&config, &dir);
    let mut events = client.subscribe();

    client.trigger();
    client.trigger();
    let request = peer.recv().await;
    assert_eq!(request.ty, Type::Confirmable);
    assert_eq!(request.code, Code::POST);
    assert_eq!(request.uri_path(), "s");
    assert_eq!(
        request.options.get(OptionNumber::URI_QUERY).map(|q| &q[..]),
        Some(&b"id=352656"[..])
    );
    assert!(request.payload.starts_with(b"1\n"));

    let mut response = Message::new(Type::Acknowledgement, Code::CHANGED);
    response.options.push_uint(OptionNumber::INTERVAL, 600);
    response.options.push(
        OptionNumber::TIME,
        Bytes::from_static(&[0, 0, 1, 0x8b, 0xcf, 0xe5, 0x68, 0x00]),
    );
    peer.respond(&request, response).await;

    let reply = wait_for(&mut events, |event| match event {
        ClientEvent::Telemetry(reply) => Some(reply),
        _ => None,
    })
    .await;
    assert_eq!(reply.code, "2.04");
    assert_eq!(reply.interval, Some(600));
    assert_eq!(client.status().interval_secs, 600);
    // Two triggers before the engine ran make one message
    assert!(timeout(Duration::from_millis(300), peer.recv()).await.is_err());
    // The first successful exchange confirms the running image
    assert!(dir.path().join("confirmed").exists());

    client.shutdown();
    timeout(WAIT, driver).await.unwrap().unwrap();
}

#[tokio::test]
async fn block_wise_download_is_staged() {
    let _guard = subscribe();
    let mut peer = Peer::bind().await;
    let dir = tempfile::tempdir().unwrap();
    let (client, driver) = start(&config(&peer), &dir);
    let mut events = client.subscribe();

    let image = image("box-1.2.0", 1500);
    client.download("box-1.2.0", false).unwrap();
    serve_image(&mut peer, "fw/box-1.2.0", &image).await;

    let apply = wait_for(&mut events, |event| match event {
        ClientEvent::UpdateFinished { apply } => Some(apply),
        ClientEvent::UpdateCanceled(reason) => panic!("download canceled: {reason}"),
        _ => None,
    })
    .await;
    assert!(!apply);

    let status = client.status();
    assert_eq!(status.update.phase, "ready");
    assert_eq!(status.update.offset, image.len() as u64);
    assert_eq!(fs::read(dir.path().join("staging.bin")).unwrap(), image);
    assert!(dir.path().join("upgrade").exists());
    assert!(status.to_json().contains("\"phase\": \"ready\""));

    // Without apply the staged image waits for an explicit command
    let reboot = timeout(REBOOT_DELAY * 2, async {
        loop {
            if let ClientEvent::Reboot(code) = events.recv().await.unwrap() {
                return code;
            }
        }
    })
    .await;
    assert!(reboot.is_err(), "unexpected reboot: {reboot:?}");

    client.shutdown();
    timeout(WAIT, driver).await.unwrap().unwrap();
}

#[tokio::test]
async fn finished_update_reboots_into_image() {
    let _guard = subscribe();
    let mut peer = Peer::bind().await;
    let dir = tempfile::tempdir().unwrap();
    let (client, driver) = start(&config(&peer), &dir);
    let mut events = client.subscribe();

    let image = image("box-1.3.0", 700);
    client.update("box-1.3.0").unwrap();
    serve_image(&mut peer, "fw/box-1.3.0", &image).await;

    let apply = wait_for(&mut events, |event| match event {
        ClientEvent::UpdateFinished { apply } => Some(apply),
        ClientEvent::Reboot(code) => panic!("reboot before the image was staged: {code}"),
        _ => None,
    })
    .await;
    assert!(apply);
    let code = wait_for(&mut events, |event| match event {
        ClientEvent::Reboot(code) => Some(code),
        _ => None,
    })
    .await;
    assert_eq!(code, RebootCode::Update);
    assert!(dir.path().join("upgrade").exists());

    client.shutdown();
    timeout(WAIT, driver).await.unwrap().unwrap();
}

#[tokio::test]
async fn cancel_withdraws_staged_upgrade() {
    let _guard = subscribe();
    let mut peer = Peer::bind().await;
    let dir = tempfile::tempdir().unwrap();
    let (client, driver) = start(&config(&peer), &dir);
    let mut events = client.subscribe();

    let image = image("box-1.2.1", 100);
    client.download("box-1.2.1", false).unwrap();
    serve_image(&mut peer, "fw/box-1.2.1", &image).await;
    wait_for(&mut events, |event| match event {
        ClientEvent::UpdateFinished { .. } => Some(()),
        _ => None,
    })
    .await;
    assert!(dir.path().join("upgrade").exists());

    assert!(client.cancel());
    assert!(!dir.path().join("upgrade").exists());
    assert!(!dir.path().join("staging.bin").exists());
    let status = client.status();
    assert_eq!(status.update.phase, "canceled");
    assert_eq!(status.update.reason, Some("command"));
    assert_eq!(client.apply(), Err(UpdateError::NotReady));

    client.shutdown();
    timeout(WAIT, driver).await.unwrap().unwrap();
}

#[tokio::test]
async fn cancel_reports_command() {
    let _guard = subscribe();
    let mut peer = Peer::bind().await;
    let dir = tempfile::tempdir().unwrap();
    let (client, driver) = start(&config(&peer), &dir);
    let mut events = client.subscribe();

    client.download("box-2.0.0", false).unwrap();
    assert_eq!(
        client.download("box-2.0.0", false),
        Err(UpdateError::Busy)
    );
    // The first block request goes out once the erase is done; it is never answered
    peer.recv().await;

    assert!(client.cancel());
    assert!(!client.cancel());
    let reason = wait_for(&mut events, |event| match event {
        ClientEvent::UpdateCanceled(reason) => Some(reason),
        _ => None,
    })
    .await;
    assert_eq!(reason, CancelReason::Command);

    let status = client.status();
    assert_eq!(status.update.reason, Some("command"));
    assert_eq!(status.update.reason_code, Some(1));
    assert!(status.to_string().contains("reason: command"));
    assert!(!dir.path().join("staging.bin").exists());

    client.shutdown();
    timeout(WAIT, driver).await.unwrap().unwrap();
}

#[tokio::test]
async fn lost_response_is_retransmitted() {
    let _guard = subscribe();
    let mut peer = Peer::bind().await;
    let dir = tempfile::tempdir().unwrap();
    let config = ClientConfig {
        ack_timeout_ms: 200,
        ..config(&peer)
    };
    let (client, driver) = start(&config, &dir);
    let mut events = client.subscribe();

    client.trigger();
    let first = peer.recv().await;
    let again = peer.recv().await;
    assert_eq!(first.id, again.id);
    assert_eq!(first.token, again.token);
    peer.respond(&again, Message::new(Type::Acknowledgement, Code::CHANGED))
        .await;

    let purpose = wait_for(&mut events, |event| match event {
        ClientEvent::Succeeded { purpose, .. } => Some(purpose),
        _ => None,
    })
    .await;
    assert_eq!(purpose, Purpose::Telemetry);
    let stats = client.stats();
    assert_eq!(stats.successes, 1);
    assert_eq!(stats.retransmissions, 1);

    client.shutdown();
    timeout(WAIT, driver).await.unwrap().unwrap();
}

#[tokio::test]
async fn exhausted_retransmissions_escalate() {
    let _guard = subscribe();
    let mut peer = Peer::bind().await;
    let dir = tempfile::tempdir().unwrap();
    let config = ClientConfig {
        ack_timeout_ms: 20,
        max_retransmissions: 1,
        ..config(&peer)
    };
    let (client, driver) = start(&config, &dir);
    let mut events = client.subscribe();

    for _ in 0..2 {
        client.trigger();
        let error = wait_for(&mut events, |event| match event {
            ClientEvent::Failed { error, .. } => Some(error),
            _ => None,
        })
        .await;
        assert_eq!(error, proto::ExchangeError::TimedOut { retransmissions: 1 });
    }
    let step = wait_for(&mut events, |event| match event {
        ClientEvent::Recovery(step) => Some(step),
        _ => None,
    })
    .await;
    assert_eq!(step, Recovery::ResetSession);
    assert_eq!(client.stats().consecutive_failures, 2);
    // Every request and its one retransmission reached the peer
    for _ in 0..4 {
        peer.recv().await;
    }

    client.shutdown();
    timeout(WAIT, driver).await.unwrap().unwrap();
}

fn subscribe() -> tracing::subscriber::DefaultGuard {
    let sub = tracing_subscriber::FmtSubscriber::builder()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(|| TestWriter)
        .finish();
    tracing::subscriber::set_default(sub)
}

struct TestWriter;

impl Write for TestWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        print!(
            "{}",
            std::str::from_utf8(buf).expect("tried to log invalid UTF-8")
        );
        Ok(buf.len())
    }
    fn flush(&mut self) -> io::Result<()> {
        io::stdout().flush()
    }
}
