//! End-to-end gateway scenarios over loopback TCP with a scripted device.

use std::io::{Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use emberlink::crypto::{self, CbcStream, ServerKeys, crc32, rsa_decrypt, rsa_encrypt};
use emberlink::gateway::handshake::RSA_BLOCK_LEN;
use emberlink::gateway::{ApiCall, cipher};
use emberlink::proto::coap::{Code, MessageType};
use emberlink::proto::{self, Message};
use emberlink::{
    AttributeStore, Command, CommandReply, Config, DeviceId, DirFirmwareStore, GatewayDeps,
    MemoryAttributeStore, MemoryKeyStore, MemoryPublisher, RecordingApiClient, SessionRegistry,
    Value, VarType, attach,
};

const DESCRIBE_DOC: &str = r#"{"v":{"temperature":"int32"},"f":[{"name":"led","args":["string","string"],"returns":"int32"}]}"#;

fn device_id() -> DeviceId {
    DeviceId::from_bytes([0xc0, 0xff, 0xee, 0, 1, 2, 3, 4, 5, 6, 7, 8])
}

struct TestGateway {
    addr: SocketAddr,
    registry: SessionRegistry,
    publisher: MemoryPublisher,
    api: RecordingApiClient,
    attributes: MemoryAttributeStore,
    server_keys: ServerKeys,
    device_keys: ServerKeys,
    _firmware_dir: tempfile::TempDir,
}

impl TestGateway {
    fn start() -> Self {
        let server_keys = ServerKeys::generate().unwrap();
        let device_keys = ServerKeys::generate().unwrap();
        let key_store = MemoryKeyStore::new();
        key_store.insert(device_id(), device_keys.public.clone());

        let publisher = MemoryPublisher::new();
        let api = RecordingApiClient::new();
        let attributes = MemoryAttributeStore::new();
        let registry = SessionRegistry::new();
        let firmware_dir = tempfile::tempdir().unwrap();

        let deps = GatewayDeps {
            config: Arc::new(Config::default()),
            server_keys: Arc::new(server_keys.clone()),
            device_keys: Arc::new(key_store),
            attributes: Arc::new(attributes.clone()),
            api: Arc::new(api.clone()),
            publisher: Arc::new(publisher.clone()),
            firmware: Arc::new(DirFirmwareStore::new(firmware_dir.path(), "production")),
            registry: registry.clone(),
        };

        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        thread::spawn(move || {
            while let Ok((socket, _)) = listener.accept() {
                attach(socket, deps.clone());
            }
        });

        Self {
            addr,
            registry,
            publisher,
            api,
            attributes,
            server_keys,
            device_keys,
            _firmware_dir: firmware_dir,
        }
    }

    fn connect_device(&self) -> FakeDevice {
        FakeDevice::connect(self.addr, &self.device_keys, &self.server_keys)
    }

    fn wait_for_session(&self) -> emberlink::SessionHandle {
        wait_for(
            || self.registry.get(&device_id()),
            Duration::from_secs(2),
            "session in registry",
        )
    }
}

fn wait_for<T>(mut probe: impl FnMut() -> Option<T>, timeout: Duration, what: &str) -> T {
    let deadline = Instant::now() + timeout;
    loop {
        if let Some(value) = probe() {
            return value;
        }
        assert!(Instant::now() < deadline, "timed out waiting for {what}");
        thread::sleep(Duration::from_millis(10));
    }
}

/// Device half of the protocol, scripted from the test thread.
struct FakeDevice {
    stream: TcpStream,
    enc: CbcStream,
    dec: CbcStream,
    counter: u16,
}

impl FakeDevice {
    fn connect(addr: SocketAddr, device_keys: &ServerKeys, server_keys: &ServerKeys) -> Self {
        let mut stream = TcpStream::connect(addr).unwrap();
        stream
            .set_read_timeout(Some(Duration::from_secs(5)))
            .unwrap();

        let mut opening = Vec::new();
        opening.extend_from_slice(&crypto::nonce_40());
        opening.extend_from_slice(device_id().as_bytes());
        stream.write_all(&opening).unwrap();

        let mut challenge = [0u8; RSA_BLOCK_LEN];
        stream.read_exact(&mut challenge).unwrap();
        let challenge = rsa_decrypt(&device_keys.private, &challenge).unwrap();
        assert_eq!(challenge.len(), 60, "seed + hmac digest");

        let secret = crypto::nonce_40();
        stream
            .write_all(&rsa_encrypt(&server_keys.public, &secret).unwrap())
            .unwrap();

        let (key, iv_send, iv_recv) = crypto::split_session_secret(&secret);
        // mirrored orientation: the device writes into the server's
        // receive stream and reads from its send stream
        let enc = CbcStream::new(key, iv_recv);
        let dec = CbcStream::new(key, iv_send);

        let mut device = Self {
            stream,
            enc,
            dec,
            counter: 0,
        };

        let hello_id = device.next_id();
        let mut hello =
            Message::new(MessageType::NonConfirmable, Code::POST, hello_id).with_path("h");
        hello.payload = vec![6, 0, 42, 0, 10, 0]; // product 6, firmware 42, platform 10
        device.send(&hello);

        let server_hello = device.recv();
        assert_eq!(server_hello.uri_path, "h");
        device
    }

    fn next_id(&mut self) -> u16 {
        self.counter += 1;
        self.counter
    }

    fn send(&mut self, msg: &Message) {
        cipher::write_frame(
            &mut self.stream,
            &mut self.enc,
            65_535,
            &proto::coap::encode(msg),
        )
        .unwrap();
    }

    fn recv(&mut self) -> Message {
        let frame = cipher::read_frame(&mut self.stream, &mut self.dec, 65_535).unwrap();
        proto::coap::decode(&frame).unwrap()
    }

    fn ack(&mut self, request: &Message, code: Code, payload: Vec<u8>) {
        let mut reply = Message::new(MessageType::Acknowledgement, code, request.id)
            .with_token(request.token.clone());
        reply.payload = payload;
        self.send(&reply);
    }

    /// Answer the gateway's automatic introspection request.
    fn serve_describe(&mut self) {
        let request = self.recv();
        assert_eq!(request.uri_path, "d");
        self.ack(&request, Code::CONTENT, DESCRIBE_DOC.as_bytes().to_vec());
    }

    fn publish(&mut self, public: bool, name: &str, payload: &[u8], confirmable: bool) -> u16 {
        let id = self.next_id();
        let mtype = if confirmable {
            MessageType::Confirmable
        } else {
            MessageType::NonConfirmable
        };
        let prefix = if public { "E" } else { "e" };
        let mut msg = Message::new(mtype, Code::POST, id).with_path(format!("{prefix}/{name}"));
        msg.payload = payload.to_vec();
        self.send(&msg);
        id
    }
}

#[test]
fn scenario_handshake_hello_ready() {
    let gateway = TestGateway::start();
    let started = Instant::now();
    let _device = gateway.connect_device();
    assert!(
        started.elapsed() < Duration::from_secs(2),
        "server hello must arrive within two seconds"
    );

    let handle = gateway.wait_for_session();
    let reply = handle.execute(Command::Ping).unwrap();
    match reply {
        CommandReply::Ping { connected, .. } => assert!(connected),
        other => panic!("unexpected reply: {other:?}"),
    }

    let online: Vec<_> = gateway
        .publisher
        .published()
        .into_iter()
        .filter(|r| r.name == "spark/status")
        .collect();
    assert_eq!(online.len(), 1);
    assert_eq!(online[0].data.as_deref(), Some(b"online".as_slice()));
}

#[test]
fn scenario_get_variable() {
    let gateway = TestGateway::start();
    let mut device = gateway.connect_device();
    device.serve_describe();
    let handle = gateway.wait_for_session();

    let api_call = thread::spawn(move || {
        handle.execute(Command::GetVar {
            name: "temperature".to_string(),
            vtype: Some(VarType::Int32),
        })
    });

    let request = device.recv();
    assert_eq!(request.uri_path, "v/temperature");
    assert_eq!(request.code, Code::GET);
    assert_eq!(request.token.len(), 1);
    device.ack(&request, Code::CONTENT, vec![0x2a, 0x00, 0x00, 0x00]);

    let reply = api_call.join().unwrap().unwrap();
    assert_eq!(
        reply,
        CommandReply::Var {
            name: "temperature".to_string(),
            value: Value::Int32(42),
            raw: vec![0x2a, 0x00, 0x00, 0x00],
        }
    );
}

#[test]
fn scenario_call_function() {
    let gateway = TestGateway::start();
    let mut device = gateway.connect_device();
    device.serve_describe();
    let handle = gateway.wait_for_session();

    let api_call = thread::spawn(move || {
        handle.execute(Command::CallFn {
            name: "led".to_string(),
            args: "on,5".to_string(),
        })
    });

    let request = device.recv();
    assert_eq!(request.uri_path, "f/led");
    assert_eq!(request.uri_query, vec!["on".to_string(), "5".to_string()]);
    device.ack(&request, Code::CHANGED, 1i32.to_le_bytes().to_vec());

    let reply = api_call.join().unwrap().unwrap();
    assert_eq!(
        reply,
        CommandReply::Function {
            name: "led".to_string(),
            result: 1,
        }
    );
}

#[test]
fn scenario_unknown_function_fails_without_wire_traffic() {
    let gateway = TestGateway::start();
    let mut device = gateway.connect_device();
    device.serve_describe();
    let handle = gateway.wait_for_session();

    let err = handle
        .execute(Command::CallFn {
            name: "reboot".to_string(),
            args: String::new(),
        })
        .unwrap_err();
    assert_eq!(err.to_string(), "Unknown Function: reboot");
}

#[test]
fn scenario_public_event_published_and_acked() {
    let gateway = TestGateway::start();
    let mut device = gateway.connect_device();
    device.serve_describe();
    gateway.wait_for_session();

    let id = device.publish(true, "temp", b"72", true);
    let ack = device.recv();
    assert_eq!(ack.id, id);
    assert!(ack.is_ack());

    let records: Vec<_> = gateway
        .publisher
        .published()
        .into_iter()
        .filter(|r| r.name == "temp")
        .collect();
    assert_eq!(records.len(), 1);
    let record = &records[0];
    assert!(record.is_public);
    assert_eq!(record.ttl_secs, 60);
    assert_eq!(record.data.as_deref(), Some(b"72".as_slice()));
    assert_eq!(record.device_id, device_id());
}

#[test]
fn scenario_rate_limited_event_gets_slowdown() {
    let gateway = TestGateway::start();
    let mut device = gateway.connect_device();
    device.serve_describe();
    gateway.wait_for_session();

    gateway.publisher.set_rate_limited(true);
    let id = device.publish(false, "burst", b"x", true);
    let slowdown = device.recv();
    assert_eq!(slowdown.id, id);
    assert_eq!(slowdown.code, Code::TOO_MANY_REQUESTS);
}

#[test]
fn scenario_claim_code_links_device_and_stays_internal() {
    let gateway = TestGateway::start();
    let mut device = gateway.connect_device();
    device.serve_describe();
    gateway.wait_for_session();

    let id = device.publish(false, "spark/device/claim/code", b"ABCDEF", true);
    let ack = device.recv();
    assert_eq!(ack.id, id);

    wait_for(
        || {
            let attrs = gateway.attributes.get_core_attributes(&device_id());
            (attrs.get("claimCode").map(String::as_str) == Some("ABCDEF")).then_some(())
        },
        Duration::from_secs(1),
        "claim code attribute",
    );
    assert_eq!(
        gateway.api.calls(),
        vec![ApiCall::LinkDevice {
            device_id: device_id(),
            claim_code: "ABCDEF".to_string(),
            product_id: 6,
        }]
    );
    assert!(
        !gateway
            .publisher
            .published()
            .iter()
            .any(|r| r.name.starts_with("spark/device/")),
        "claim-code events are not republished"
    );
}

#[test]
fn scenario_ota_flash_with_one_bad_crc() {
    let gateway = TestGateway::start();
    let mut device = gateway.connect_device();
    device.serve_describe();
    let handle = gateway.wait_for_session();

    let binary: Vec<u8> = (0..1500u32).map(|i| (i % 241) as u8).collect();
    let expected = binary.clone();
    let flash_handle = handle.clone();
    let api_call = thread::spawn(move || flash_handle.execute(Command::Flash { binary: expected }));

    let begin = device.recv();
    assert_eq!(begin.uri_path, "u");
    assert_eq!(begin.code, Code::POST);
    assert_eq!(&begin.payload[..4], &1500u32.to_le_bytes());

    // exclusive lock: every command but ping is refused while flashing
    let err = handle
        .execute(Command::GetVar {
            name: "temperature".to_string(),
            vtype: None,
        })
        .unwrap_err();
    assert_eq!(err.to_string(), "locked during flashing");
    assert!(matches!(
        handle.execute(Command::Ping).unwrap(),
        CommandReply::Ping { connected: true, .. }
    ));

    device.ack(&begin, Code::CHANGED, Vec::new());

    let mut received = Vec::new();
    let mut chunk_frames = 0usize;
    loop {
        let request = device.recv();
        if request.uri_path == "u" && request.code == Code::PUT {
            break; // UpdateDone
        }
        assert_eq!(request.uri_path, "c");
        chunk_frames += 1;
        // second chunk: first receipt carries a corrupted crc
        if chunk_frames == 2 {
            let bad = crc32(&request.payload) ^ 0xdead_beef;
            device.ack(&request, Code::CHANGED, bad.to_le_bytes().to_vec());
            let retransmit = device.recv();
            assert_eq!(retransmit.uri_path, "c");
            assert_eq!(retransmit.payload, request.payload, "same chunk again");
            received.push(retransmit.payload.clone());
            let good = crc32(&retransmit.payload);
            device.ack(&retransmit, Code::CHANGED, good.to_le_bytes().to_vec());
            continue;
        }
        received.push(request.payload.clone());
        let good = crc32(&request.payload);
        device.ack(&request, Code::CHANGED, good.to_le_bytes().to_vec());
    }

    assert_eq!(received.len(), 3, "ceil(1500/512) chunks");
    let mut joined: Vec<u8> = received.concat();
    joined.truncate(binary.len());
    assert_eq!(joined, binary);

    let reply = api_call.join().unwrap().unwrap();
    assert!(matches!(reply, CommandReply::Flash { .. }));

    wait_for(
        || {
            gateway
                .publisher
                .published()
                .into_iter()
                .find(|r| r.name == "spark/flash/status")
                .map(|r| r.data)
        },
        Duration::from_secs(1),
        "flash status event",
    )
    .map(|data| assert_eq!(data, b"success".to_vec()))
    .unwrap();
}

#[test]
fn scenario_subscription_delivery() {
    let gateway = TestGateway::start();
    let mut device = gateway.connect_device();
    device.serve_describe();
    gateway.wait_for_session();

    let id = device.next_id();
    let subscribe =
        Message::new(MessageType::Confirmable, Code::GET, id).with_path("e/button");
    device.send(&subscribe);
    let ack = device.recv();
    assert_eq!(ack.id, id);
    assert_eq!(ack.code, Code::CHANGED);

    // another publisher on the bus fires a matching event
    use emberlink::EventRecord;
    use emberlink::Publisher;
    let record = EventRecord {
        name: "button/pressed".to_string(),
        is_public: true,
        ttl_secs: 30,
        data: Some(b"1".to_vec()),
        device_id: DeviceId::from_bytes([9; 12]),
        user_id: String::new(),
        published_at_secs: 1_700_000_000,
    };
    assert!(gateway.publisher.publish(&record));

    let delivery = device.recv();
    assert_eq!(delivery.uri_path, "E/button/pressed");
    assert_eq!(delivery.mtype, MessageType::NonConfirmable);
    assert_eq!(delivery.max_age, Some(30));
    assert_eq!(delivery.timestamp, Some(1_700_000_000));
    assert_eq!(delivery.payload, b"1");
}

#[test]
fn scenario_disconnect_is_clean_and_single() {
    let gateway = TestGateway::start();
    let mut device = gateway.connect_device();
    device.serve_describe();
    let handle = gateway.wait_for_session();

    drop(device);
    wait_for(
        || gateway.registry.get(&device_id()).is_none().then_some(()),
        Duration::from_secs(2),
        "registry removal",
    );

    let offline: Vec<_> = gateway
        .publisher
        .published()
        .into_iter()
        .filter(|r| r.name == "spark/status" && r.data.as_deref() == Some(b"offline".as_slice()))
        .collect();
    assert_eq!(offline.len(), 1, "exactly one disconnect signal");

    let err = handle.execute(Command::Ping).unwrap_err();
    assert_eq!(err.to_string(), "session disconnected");
}

#[test]
fn scenario_reconnect_supersedes_the_old_session() {
    let gateway = TestGateway::start();
    let mut first = gateway.connect_device();
    first.serve_describe();
    let old = gateway.wait_for_session();
    let old_serial = old.serial();

    let mut second = gateway.connect_device();
    second.serve_describe();

    let new = wait_for(
        || {
            gateway
                .registry
                .get(&device_id())
                .filter(|handle| handle.serial() != old_serial)
        },
        Duration::from_secs(2),
        "replacement session in registry",
    );

    // exactly one teardown: the displaced session's
    wait_for(
        || {
            let offline = gateway
                .publisher
                .published()
                .into_iter()
                .filter(|r| {
                    r.name == "spark/status" && r.data.as_deref() == Some(b"offline".as_slice())
                })
                .count();
            (offline == 1).then_some(())
        },
        Duration::from_secs(2),
        "displaced session offline signal",
    );

    let err = old.execute(Command::Ping).unwrap_err();
    assert_eq!(err.to_string(), "session disconnected");
    assert!(matches!(
        new.execute(Command::Ping).unwrap(),
        CommandReply::Ping { connected: true, .. }
    ));
}

#[test]
fn scenario_bad_counter_disconnects() {
    let gateway = TestGateway::start();
    let mut device = gateway.connect_device();
    device.serve_describe();
    gateway.wait_for_session();

    device.counter += 5; // skip ahead: the next frame id mismatches
    device.publish(false, "skewed", b"x", false);

    wait_for(
        || gateway.registry.get(&device_id()).is_none().then_some(()),
        Duration::from_secs(2),
        "bad-counter disconnect",
    );
}
