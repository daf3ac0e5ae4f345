//! 集成测试共享工具：记录事件的 Facade、轮询等待与原始帧读写。

#![allow(dead_code)]

use std::io::{Read, Write};
use std::net::{SocketAddr, TcpStream};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use spark_comm::{
    AsyncConnResult, Facade, FacadeError, Packet, ProtoReport, ServiceHandle, SessionDestroyInfo,
    SessionId, SessionInfo,
};

pub const WAIT: Duration = Duration::from_secs(5);

/// Facade 事件。
#[derive(Clone, Debug)]
pub enum Event {
    Init(&'static str),
    Start(&'static str),
    Stop(&'static str),
    Destroy(&'static str),
    Created(SessionInfo),
    Destroyed(SessionDestroyInfo),
    AsyncConn(AsyncConnResult),
    Report(ProtoReport),
    Unhandled(Packet),
}

/// 记录全部事件的 Facade。
#[derive(Default)]
pub struct Recorder {
    pub name: &'static str,
    pub fail_init: bool,
    pub fail_start: bool,
    pub events: Arc<Mutex<Vec<Event>>>,
}

impl Recorder {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            ..Self::default()
        }
    }

    /// 与其他 Recorder 共享同一事件日志，便于断言跨 Facade 的顺序。
    pub fn sharing(name: &'static str, events: &Arc<Mutex<Vec<Event>>>) -> Self {
        Self {
            name,
            events: events.clone(),
            ..Self::default()
        }
    }

    fn push(&self, event: Event) {
        self.events.lock().push(event);
    }
}

impl Facade for Recorder {
    fn on_init(&self) -> Result<(), FacadeError> {
        self.push(Event::Init(self.name));
        if self.fail_init {
            return Err(FacadeError::new("init refused"));
        }
        Ok(())
    }

    fn on_destroy(&self) {
        self.push(Event::Destroy(self.name));
    }

    fn on_start(&self) -> Result<(), FacadeError> {
        self.push(Event::Start(self.name));
        if self.fail_start {
            return Err(FacadeError::new("start refused"));
        }
        Ok(())
    }

    fn on_stop(&self) {
        self.push(Event::Stop(self.name));
    }

    fn on_session_create(&self, info: &SessionInfo) {
        self.push(Event::Created(info.clone()));
    }

    fn on_session_destroy(&self, info: &SessionDestroyInfo) {
        self.push(Event::Destroyed(info.clone()));
    }

    fn on_async_conn_result(&self, result: &AsyncConnResult) {
        self.push(Event::AsyncConn(result.clone()));
    }

    fn on_proto_report(&self, report: &ProtoReport) {
        self.push(Event::Report(report.clone()));
    }

    fn on_unhandled_packet(&self, packet: &Packet) {
        self.push(Event::Unhandled(packet.clone()));
    }
}

/// 事件日志的只读视图。
#[derive(Clone, Default)]
pub struct Log(pub Arc<Mutex<Vec<Event>>>);

impl Log {
    pub fn snapshot(&self) -> Vec<Event> {
        self.0.lock().clone()
    }

    pub fn created(&self) -> Vec<SessionInfo> {
        self.snapshot()
            .into_iter()
            .filter_map(|event| match event {
                Event::Created(info) => Some(info),
                _ => None,
            })
            .collect()
    }

    pub fn destroyed(&self) -> Vec<SessionDestroyInfo> {
        self.snapshot()
            .into_iter()
            .filter_map(|event| match event {
                Event::Destroyed(info) => Some(info),
                _ => None,
            })
            .collect()
    }

    pub fn destroyed_count(&self, id: SessionId) -> usize {
        self.destroyed()
            .iter()
            .filter(|info| info.info.session_id == id)
            .count()
    }

    pub fn reports(&self) -> Vec<ProtoReport> {
        self.snapshot()
            .into_iter()
            .filter_map(|event| match event {
                Event::Report(report) => Some(report),
                _ => None,
            })
            .collect()
    }

    pub fn async_results(&self) -> Vec<AsyncConnResult> {
        self.snapshot()
            .into_iter()
            .filter_map(|event| match event {
                Event::AsyncConn(result) => Some(result),
                _ => None,
            })
            .collect()
    }

    pub fn unhandled(&self) -> Vec<Packet> {
        self.snapshot()
            .into_iter()
            .filter_map(|event| match event {
                Event::Unhandled(packet) => Some(packet),
                _ => None,
            })
            .collect()
    }

    /// 仅保留生命周期事件，格式化为 `name:hook`。
    pub fn lifecycle(&self) -> Vec<String> {
        self.snapshot()
            .into_iter()
            .filter_map(|event| match event {
                Event::Init(name) => Some(format!("{name}:init")),
                Event::Start(name) => Some(format!("{name}:start")),
                Event::Stop(name) => Some(format!("{name}:stop")),
                Event::Destroy(name) => Some(format!("{name}:destroy")),
                _ => None,
            })
            .collect()
    }
}

/// 注册一个 Recorder 并返回其日志。
pub fn attach_recorder(service: &ServiceHandle) -> Log {
    let recorder = Recorder::new("recorder");
    let log = Log(recorder.events.clone());
    service
        .register_facade(Arc::new(recorder))
        .expect("register recorder");
    log
}

/// 轮询等待条件成立。
pub fn wait_until(mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + WAIT;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        thread::sleep(Duration::from_millis(5));
    }
    condition()
}

/// `Pull` 模式下反复推进，直到条件成立。
pub fn pump_until(service: &ServiceHandle, mut condition: impl FnMut() -> bool) -> bool {
    wait_until(|| {
        service.on_svc(true).expect("on_svc");
        condition()
    })
}

/// 推进固定帧数。
pub fn pump(service: &ServiceHandle, ticks: usize) {
    for _ in 0..ticks {
        service.on_svc(true).expect("on_svc");
        thread::sleep(Duration::from_millis(2));
    }
}

/// 按默认线格式（大端）编码一帧。
pub fn frame(opcode: i32, status: i32, payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(12 + payload.len());
    out.extend_from_slice(&((12 + payload.len()) as u32).to_be_bytes());
    out.extend_from_slice(&opcode.to_be_bytes());
    out.extend_from_slice(&status.to_be_bytes());
    out.extend_from_slice(payload);
    out
}

/// 从阻塞套接字读取一帧。
pub fn read_frame(stream: &mut TcpStream) -> (i32, i32, Vec<u8>) {
    let mut header = [0u8; 12];
    stream.read_exact(&mut header).expect("read header");
    let len = u32::from_be_bytes([header[0], header[1], header[2], header[3]]) as usize;
    let opcode = i32::from_be_bytes([header[4], header[5], header[6], header[7]]);
    let status = i32::from_be_bytes([header[8], header[9], header[10], header[11]]);
    let mut payload = vec![0u8; len - 12];
    stream.read_exact(&mut payload).expect("read payload");
    (opcode, status, payload)
}

/// 连接到服务并设置读超时，避免测试在失败时挂起。
pub fn client(addr: SocketAddr) -> TcpStream {
    let stream = TcpStream::connect(addr).expect("client connect");
    stream
        .set_read_timeout(Some(WAIT))
        .expect("set read timeout");
    stream.set_nodelay(true).expect("nodelay");
    stream
}

pub fn write_all(stream: &mut TcpStream, bytes: &[u8]) {
    stream.write_all(bytes).expect("client write");
    stream.flush().expect("client flush");
}

/// 将 `0.0.0.0` 监听地址换成回环地址以便连接。
pub fn loopback(addr: SocketAddr) -> SocketAddr {
    SocketAddr::new("127.0.0.1".parse().expect("loopback"), addr.port())
}
