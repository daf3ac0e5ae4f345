//! # service 模块
//!
//! ## 设计动机（Why）
//! - [`Service`] 是唯一的对外入口：拥有轮询器、会话表、分发器、编解码注册表与 Facade 列表，
//!   暴露监听、建连、收发、组播、广播与生命周期控制；
//! - [`ServiceHandle`] 是可廉价克隆的句柄，供 Facade 与处理器在回调中反向调用服务。
//!
//! ## 生命周期（What）
//! - `Created → Started → Stopped` 单调前进；`start` 失败会回滚并停留在 `Created`；
//! - `start(n)`：按注册顺序 `on_init` → 创建 `n` 个轮询器 → 按注册顺序 `on_start` →
//!   `Push` 模式下拉起轮询线程；
//! - `stop()`：逆序 `on_stop` → 关闭监听、取消异步建连 → 各轮询器关闭会话 → 回收线程 →
//!   逆序 `on_destroy`；返回后不会再有任何回调；
//! - 释放 [`Service`] 时自动执行 `stop` 并清空注册表，打断“服务 → Facade → 句柄 → 服务”的引用环。
//!
//! ## 并发（How）
//! - 控制面调用可来自任意线程：会话表为 `DashMap`，分发表与编解码表为 `ArcSwap`，
//!   生命周期转换由独立的互斥锁串行化；
//! - 状态以原子量保存，`on_start` 钩子中可以安全调用 `listen`/`connect`。
//!
//! ## 风险提示（Trade-offs）
//! - `stop` 与释放会关闭服务内部的 Tokio 运行时，不应在异步上下文中调用；
//! - `connect` 会阻塞调用线程，在轮询线程中调用会拖慢同一轮询器上的全部会话。

use std::borrow::Cow;
use std::fmt;
use std::net::SocketAddr;
use std::ops::Deref;
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use bytes::{Bytes, BytesMut};
use dashmap::DashMap;
use parking_lot::{Mutex, MutexGuard, RwLock};
use tokio::sync::watch;

use crate::codec::{CoderRegistry, FrameCodec, LengthPrefixedCodec, PacketCoder};
use crate::config::{DriveMode, ServiceConfig, ServiceKind, frame_interval, validate_fps};
use crate::dispatch::{Dispatcher, PacketHandler, PacketPreHandler};
use crate::error::{self, ServiceError, ServiceErrorKind, map_io_error};
use crate::facade::{
    ConnFailure, ConnToken, DestroyReason, Facade, FacadeRegistry, Initiator, ProtoReport,
    ReportLayer, SessionInfo, SessionOrigin,
};
use crate::packet::{ListenerId, Opcode, Packet, PacketId, SessionId, Status};
use crate::poller::{self, Poller, PollerCommand};
use crate::session::{
    Session, SessionIdAllocator, SessionShared, SessionState, SessionTable, stream_addrs,
};
use crate::transport;

static NEXT_SERVICE_ID: AtomicU32 = AtomicU32::new(1);

/// 对外可见的服务状态。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ServiceState {
    Created,
    Started,
    Stopped,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
enum Phase {
    Created = 0,
    /// `on_start` 执行中，已可监听与建连。
    Starting = 1,
    Started = 2,
    Stopping = 3,
    Stopped = 4,
}

impl Phase {
    fn from_u8(raw: u8) -> Self {
        match raw {
            0 => Phase::Created,
            1 => Phase::Starting,
            2 => Phase::Started,
            3 => Phase::Stopping,
            _ => Phase::Stopped,
        }
    }

    fn is_active(self) -> bool {
        matches!(self, Phase::Starting | Phase::Started)
    }
}

/// `listen` 的结果。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ListenHandle {
    pub listener_id: ListenerId,
    /// 实际绑定地址，端口为 `0` 时可由此取得系统分配的端口。
    pub local_addr: SocketAddr,
}

/// 组播结果：单个目标失败不会中止其余目标。
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct MulticastReport {
    pub delivered: Vec<SessionId>,
    pub failed: Vec<(SessionId, ServiceErrorKind)>,
}

impl MulticastReport {
    pub fn is_complete(&self) -> bool {
        self.failed.is_empty()
    }
}

type CoderNotFoundReporter = Arc<dyn Fn(Opcode) + Send + Sync + 'static>;

struct ListenerEntry {
    local_addr: SocketAddr,
    task: tokio::task::JoinHandle<()>,
}

struct PreEncoded {
    opcode: Opcode,
    payload: Bytes,
}

struct Engine {
    threads: Vec<JoinHandle<()>>,
    shutdown: watch::Sender<bool>,
}

/// 服务内部状态，由 [`Service`] 与全部 [`ServiceHandle`] 共享。
pub(crate) struct ServiceShared {
    id: u32,
    kind: ServiceKind,
    pub(crate) config: ServiceConfig,
    phase: AtomicU8,
    drive_mode: AtomicU8,
    fps: AtomicU32,
    lifecycle: Mutex<()>,
    /// `on_svc` 持读锁推进，`stop` 取写锁等待进行中的帧结束。
    ticking: RwLock<()>,

    pub(crate) frame_codec: Arc<dyn FrameCodec>,
    pub(crate) coders: CoderRegistry,
    pub(crate) dispatcher: Dispatcher,
    pub(crate) facades: FacadeRegistry,
    pub(crate) table: SessionTable,
    coder_not_found: RwLock<Option<CoderNotFoundReporter>>,

    session_ids: SessionIdAllocator,
    next_listener: AtomicU64,
    next_token: AtomicU64,
    next_packet: AtomicU64,
    round_robin: AtomicUsize,

    pollers: RwLock<Vec<Arc<Poller>>>,
    engine: Mutex<Option<Engine>>,
    io: Mutex<Option<tokio::runtime::Runtime>>,
    listeners: DashMap<ListenerId, ListenerEntry>,
    packets: DashMap<PacketId, PreEncoded>,
}

impl ServiceShared {
    fn phase(&self) -> Phase {
        Phase::from_u8(self.phase.load(Ordering::Acquire))
    }

    fn set_phase(&self, phase: Phase) {
        self.phase.store(phase as u8, Ordering::Release);
    }

    fn ensure_active(&self) -> Result<(), ServiceError> {
        if self.phase().is_active() {
            Ok(())
        } else {
            Err(ServiceError::not_started())
        }
    }

    fn ensure_not_stopped(&self) -> Result<(), ServiceError> {
        match self.phase() {
            Phase::Stopping | Phase::Stopped => Err(ServiceError::not_started()),
            _ => Ok(()),
        }
    }

    /// 获取生命周期锁；轮询线程内拒绝，`stop` 持锁回收轮询线程时会与之互等。
    fn lock_lifecycle(&self, operation: &str) -> Result<MutexGuard<'_, ()>, ServiceError> {
        if poller::in_poller_context() {
            return Err(ServiceError::invalid_argument(format!(
                "{operation} must not be called from a poller thread"
            )));
        }
        Ok(self.lifecycle.lock())
    }

    pub(crate) fn fps(&self) -> u32 {
        self.fps.load(Ordering::Relaxed)
    }

    fn drive_mode(&self) -> DriveMode {
        match self.drive_mode.load(Ordering::Acquire) {
            0 => DriveMode::Push,
            _ => DriveMode::Pull,
        }
    }

    /// 把已建连的套接字登记为会话，并按轮转顺序移交给轮询器。
    pub(crate) fn adopt_stream(
        &self,
        stream: std::net::TcpStream,
        origin: SessionOrigin,
    ) -> Result<SessionId, ServiceError> {
        self.ensure_active()?;
        transport::configure_stream(&stream, &self.config.tcp)?;
        let (local_addr, peer_addr) =
            stream_addrs(&stream).map_err(|err| map_io_error(error::CONFIGURE, err))?;

        let pollers = self.pollers.read();
        if pollers.is_empty() {
            return Err(ServiceError::not_started());
        }
        let index = self.round_robin.fetch_add(1, Ordering::Relaxed) % pollers.len();
        let session_id = self.session_ids.allocate();
        let shared = Arc::new(SessionShared::new(session_id));
        let info = SessionInfo {
            session_id,
            local_addr,
            peer_addr,
            origin,
            poller: index,
        };

        self.table.insert(shared.clone());
        if pollers[index]
            .send(PollerCommand::Adopt(Session::new(shared, stream, info)))
            .is_err()
        {
            self.table.remove(session_id);
            return Err(ServiceError::not_started());
        }
        Ok(session_id)
    }

    /// 把异步建连失败投递到某个轮询器；服务已停止时静默丢弃。
    pub(crate) fn deliver_async_failure(
        &self,
        token: ConnToken,
        peer_addr: SocketAddr,
        err: ServiceError,
    ) {
        let pollers = self.pollers.read();
        if pollers.is_empty() || !self.phase().is_active() {
            tracing::debug!(token = token.get(), "async connect result dropped after stop");
            return;
        }
        let index = self.round_robin.fetch_add(1, Ordering::Relaxed) % pollers.len();
        let command = PollerCommand::AsyncConnFailed {
            token,
            peer_addr,
            failure: ConnFailure {
                kind: err.kind(),
                message: err.message().to_owned(),
            },
        };
        if pollers[index].send(command).is_err() {
            tracing::debug!(token = token.get(), "async connect result dropped after stop");
        }
    }

    pub(crate) fn report_coder_not_found(&self, opcode: Opcode) {
        let reporter = self.coder_not_found.read().clone();
        if let Some(reporter) = reporter {
            reporter(opcode);
        }
    }

    fn encode_frame(&self, packet: &Packet) -> Result<Bytes, ServiceError> {
        let payload = self
            .coders
            .encode(packet)
            .map_err(|err| ServiceError::encode_failed(packet.opcode, err))?;
        self.frame_with_payload(packet, payload)
    }

    fn frame_with_payload(&self, packet: &Packet, payload: Bytes) -> Result<Bytes, ServiceError> {
        let wire = Packet {
            payload,
            ..packet.clone()
        };
        let mut buf = BytesMut::new();
        self.frame_codec
            .encode(&wire, &mut buf)
            .map_err(|err| ServiceError::encode_failed(packet.opcode, err))?;
        Ok(buf.freeze())
    }

    fn close_listeners(&self) {
        let ids: Vec<ListenerId> = self.listeners.iter().map(|entry| *entry.key()).collect();
        for id in ids {
            if let Some((_, entry)) = self.listeners.remove(&id) {
                entry.task.abort();
                tracing::debug!(listener = id.get(), addr = %entry.local_addr, "listener closed");
            }
        }
    }

    /// 摘下全部轮询器并关闭其会话。
    fn shutdown_pollers(&self) {
        let pollers = std::mem::take(&mut *self.pollers.write());
        for poller in &pollers {
            poller.shutdown(self);
        }
        self.table.clear();
    }

    fn rollback_start(&self, started: usize, inited: usize) {
        self.facades.stop_first(started);
        self.close_listeners();
        if let Some(engine) = self.engine.lock().take() {
            join_engine(engine);
        }
        self.shutdown_pollers();
        self.facades.destroy_first(inited);
        self.set_phase(Phase::Created);
    }

    fn report_replacement(&self, what: &str, opcode: Option<Opcode>) {
        self.facades.proto_report(
            &ProtoReport::new(
                ReportLayer::Registry,
                ServiceErrorKind::HandlerRegistrationConflict,
                format!("{what} replaced"),
            )
            .with_opcode(opcode),
        );
    }
}

fn join_engine(engine: Engine) {
    let _ = engine.shutdown.send(true);
    for thread in engine.threads {
        if thread.join().is_err() {
            tracing::error!("poller thread panicked");
        }
    }
}

fn check_opcode(opcode: Opcode) -> Result<(), ServiceError> {
    if opcode < 0 {
        return Err(ServiceError::invalid_argument(format!(
            "opcode {opcode} must be non-negative"
        )));
    }
    Ok(())
}

fn check_port(port: u16) -> Result<(), ServiceError> {
    if port == 0 {
        return Err(ServiceError::invalid_argument("remote port must not be 0"));
    }
    Ok(())
}

/// 服务句柄，克隆开销为一次引用计数。
#[derive(Clone)]
pub struct ServiceHandle {
    shared: Arc<ServiceShared>,
}

impl ServiceHandle {
    pub fn id(&self) -> u32 {
        self.shared.id
    }

    pub fn name(&self) -> &str {
        &self.shared.config.name
    }

    pub fn kind(&self) -> ServiceKind {
        self.shared.kind
    }

    pub fn config(&self) -> &ServiceConfig {
        &self.shared.config
    }

    pub fn state(&self) -> ServiceState {
        match self.shared.phase() {
            Phase::Created | Phase::Starting => ServiceState::Created,
            Phase::Started | Phase::Stopping => ServiceState::Started,
            Phase::Stopped => ServiceState::Stopped,
        }
    }

    pub fn is_started(&self) -> bool {
        self.shared.phase() == Phase::Started
    }

    pub fn drive_mode(&self) -> DriveMode {
        self.shared.drive_mode()
    }

    /// 切换驱动模式，仅允许在启动前调用。
    pub fn set_drive_mode(&self, mode: DriveMode) -> Result<(), ServiceError> {
        let _guard = self.shared.lock_lifecycle("set_drive_mode")?;
        if self.shared.phase() != Phase::Created {
            return Err(ServiceError::new(
                ServiceErrorKind::AlreadyStarted,
                "drive mode can only change before start",
            ));
        }
        let raw = match mode {
            DriveMode::Push => 0,
            DriveMode::Pull => 1,
        };
        self.shared.drive_mode.store(raw, Ordering::Release);
        Ok(())
    }

    pub fn fps(&self) -> u32 {
        self.shared.fps()
    }

    /// 调整帧率，运行中的轮询线程在下一帧生效。
    pub fn set_fps(&self, fps: u32) -> Result<(), ServiceError> {
        validate_fps(fps)?;
        self.shared.fps.store(fps, Ordering::Relaxed);
        Ok(())
    }

    pub fn frame_interval(&self) -> Duration {
        frame_interval(self.fps())
    }

    /// 启动服务。
    pub fn start(&self, poller_count: usize) -> Result<(), ServiceError> {
        if poller_count == 0 {
            return Err(ServiceError::invalid_argument(
                "poller count must be positive",
            ));
        }
        let shared = &self.shared;
        let _guard = shared.lock_lifecycle("start")?;
        if shared.phase() != Phase::Created {
            return Err(ServiceError::new(
                ServiceErrorKind::AlreadyStarted,
                "service has already been started",
            ));
        }

        if let Err((inited, err)) = shared.facades.init_all() {
            shared.facades.destroy_first(inited);
            return Err(facade_failed("on_init", err));
        }
        let inited = shared.facades.len();

        *shared.pollers.write() = (0..poller_count).map(|i| Arc::new(Poller::new(i))).collect();
        shared.set_phase(Phase::Starting);

        if let Err((started, err)) = shared.facades.start_all() {
            shared.rollback_start(started, inited);
            return Err(facade_failed("on_start", err));
        }
        let started = shared.facades.len();

        if shared.drive_mode() == DriveMode::Push {
            let (shutdown, signal) = watch::channel(false);
            let mut engine = Engine {
                threads: Vec::with_capacity(poller_count),
                shutdown,
            };
            let pollers = shared.pollers.read().clone();
            for poller in pollers {
                match poller::spawn_push_thread(poller, shared.clone(), signal.clone()) {
                    Ok(thread) => engine.threads.push(thread),
                    Err(err) => {
                        *shared.engine.lock() = Some(engine);
                        shared.rollback_start(started, inited);
                        return Err(ServiceError::allocation_failed("poller thread", err));
                    }
                }
            }
            *shared.engine.lock() = Some(engine);
        }

        shared.set_phase(Phase::Started);
        tracing::info!(
            service = shared.id,
            name = %shared.config.name,
            pollers = poller_count,
            mode = ?shared.drive_mode(),
            fps = shared.fps(),
            "service started"
        );
        Ok(())
    }

    /// 停止服务；未启动或已停止时不做任何事。
    pub fn stop(&self) -> Result<(), ServiceError> {
        if poller::in_poller_context() {
            return Err(ServiceError::invalid_argument(
                "stop must not be called from a poller thread",
            ));
        }
        let shared = &self.shared;
        if shared.phase() == Phase::Starting {
            return Err(ServiceError::invalid_argument(
                "stop must not be called while start is in progress",
            ));
        }
        let _guard = shared.lifecycle.lock();
        if shared.phase() != Phase::Started {
            return Ok(());
        }

        shared.set_phase(Phase::Stopping);
        // 等待进行中的 `on_svc` 帧结束；之后的调用会看到 `Stopping` 并直接返回。
        drop(shared.ticking.write());
        shared.facades.stop_first(shared.facades.len());

        shared.close_listeners();
        if let Some(runtime) = shared.io.lock().take() {
            runtime.shutdown_background();
        }
        if let Some(engine) = shared.engine.lock().take() {
            join_engine(engine);
        }
        shared.shutdown_pollers();
        shared.packets.clear();

        shared.facades.destroy_first(shared.facades.len());
        shared.set_phase(Phase::Stopped);
        tracing::info!(service = shared.id, name = %shared.config.name, "service stopped");
        Ok(())
    }

    /// 监听 `ip:port`，仅服务端可用。
    pub fn listen(&self, ip: &str, port: u16) -> Result<ListenHandle, ServiceError> {
        let shared = &self.shared;
        if shared.kind != ServiceKind::Server {
            return Err(ServiceError::invalid_argument(
                "listen is only available on server services",
            ));
        }
        shared.ensure_active()?;
        let addr = transport::parse_addr(ip, port)?;
        let listener = transport::bind_listener(addr, &shared.config.tcp)?;
        let local_addr = listener
            .local_addr()
            .map_err(|err| map_io_error(error::BIND, err))?;
        let listener_id = ListenerId::new(shared.next_listener.fetch_add(1, Ordering::Relaxed));

        let io = shared.io.lock();
        let runtime = io.as_ref().ok_or_else(ServiceError::not_started)?;
        let task = runtime.spawn(transport::accept_loop(
            listener,
            listener_id,
            Arc::downgrade(&self.shared),
        ));
        shared
            .listeners
            .insert(listener_id, ListenerEntry { local_addr, task });
        tracing::info!(
            service = shared.id,
            listener = listener_id.get(),
            addr = %local_addr,
            "listening"
        );
        Ok(ListenHandle {
            listener_id,
            local_addr,
        })
    }

    /// 关闭监听器，已接受的会话不受影响。
    pub fn close_listener(&self, listener_id: ListenerId) -> Result<(), ServiceError> {
        match self.shared.listeners.remove(&listener_id) {
            Some((_, entry)) => {
                entry.task.abort();
                tracing::info!(
                    listener = listener_id.get(),
                    addr = %entry.local_addr,
                    "listener closed"
                );
                Ok(())
            }
            None => Err(ServiceError::invalid_argument(format!(
                "listener {listener_id} not found"
            ))),
        }
    }

    /// 同步建连，阻塞至成功或超时。
    pub fn connect(&self, ip: &str, port: u16) -> Result<SessionId, ServiceError> {
        let shared = &self.shared;
        shared.ensure_active()?;
        check_port(port)?;
        let addr = transport::parse_addr(ip, port)?;
        let stream = transport::connect_blocking(addr, shared.config.connect_timeout())?;
        shared.adopt_stream(stream, SessionOrigin::Connected)
    }

    /// 异步建连，结果通过 `on_async_conn_result` 投递。
    pub fn async_conn(&self, ip: &str, port: u16) -> Result<ConnToken, ServiceError> {
        let shared = &self.shared;
        shared.ensure_active()?;
        check_port(port)?;
        let addr = transport::parse_addr(ip, port)?;
        let token = ConnToken::new(shared.next_token.fetch_add(1, Ordering::Relaxed) + 1);

        let io = shared.io.lock();
        let runtime = io.as_ref().ok_or_else(ServiceError::not_started)?;
        runtime.spawn(transport::connect_async(
            addr,
            shared.config.connect_timeout(),
            token,
            Arc::downgrade(&self.shared),
        ));
        Ok(token)
    }

    /// 请求关闭会话：排空出站数据或宽限期到期后关闭。
    pub fn remove_session(
        &self,
        session_id: SessionId,
        reason: impl Into<Cow<'static, str>>,
    ) -> Result<(), ServiceError> {
        let shared = &self.shared;
        let session = shared
            .table
            .get(session_id)
            .ok_or_else(|| ServiceError::session_not_found(session_id))?;
        session.request_close(
            DestroyReason::new(Initiator::Local, reason),
            Instant::now() + shared.config.close_grace(),
        )
    }

    pub fn is_session_valid(&self, session_id: SessionId) -> bool {
        self.shared
            .table
            .get(session_id)
            .is_some_and(|session| session.state() == SessionState::Valid)
    }

    /// 查询会话状态，会话不存在（或已经销毁）时返回 `None`。
    pub fn session_state(&self, session_id: SessionId) -> Option<SessionState> {
        self.shared
            .table
            .get(session_id)
            .map(|session| session.state())
    }

    pub fn session_count(&self) -> usize {
        self.shared.table.len()
    }

    /// 编码并投递到会话的出站队列。
    pub fn send_bytes(
        &self,
        session_id: SessionId,
        opcode: Opcode,
        data: impl Into<Bytes>,
        status: Status,
    ) -> Result<(), ServiceError> {
        let shared = &self.shared;
        shared.ensure_active()?;
        check_opcode(opcode)?;
        let session = shared
            .table
            .get(session_id)
            .ok_or_else(|| ServiceError::session_not_found(session_id))?;
        if session.state() == SessionState::Closing {
            return Err(ServiceError::session_closing(session_id));
        }
        let frame = shared.encode_frame(&Packet::new(session_id, opcode, status, data))?;
        session.enqueue(frame)
    }

    /// 预编码一次负载，返回可反复发送的句柄。
    pub fn pre_encode(
        &self,
        opcode: Opcode,
        data: impl Into<Bytes>,
    ) -> Result<PacketId, ServiceError> {
        let shared = &self.shared;
        shared.ensure_not_stopped()?;
        check_opcode(opcode)?;
        let packet = Packet::new(SessionId::new(0), opcode, 0, data);
        let payload = shared
            .coders
            .encode(&packet)
            .map_err(|err| ServiceError::encode_failed(opcode, err))?;
        let packet_id = PacketId::new(shared.next_packet.fetch_add(1, Ordering::Relaxed) + 1);
        shared
            .packets
            .insert(packet_id, PreEncoded { opcode, payload });
        Ok(packet_id)
    }

    /// 发送预编码的负载。
    pub fn send_packet(
        &self,
        session_id: SessionId,
        opcode: Opcode,
        packet_id: PacketId,
        status: Status,
    ) -> Result<(), ServiceError> {
        let shared = &self.shared;
        shared.ensure_active()?;
        let payload = match shared.packets.get(&packet_id) {
            Some(entry) if entry.opcode == opcode => entry.payload.clone(),
            Some(entry) => {
                return Err(ServiceError::invalid_argument(format!(
                    "packet {packet_id} was encoded for opcode {}, not {opcode}",
                    entry.opcode
                )));
            }
            None => {
                return Err(ServiceError::invalid_argument(format!(
                    "packet {packet_id} not found"
                )));
            }
        };
        let session = shared
            .table
            .get(session_id)
            .ok_or_else(|| ServiceError::session_not_found(session_id))?;
        let packet =
            Packet::new(session_id, opcode, status, Bytes::new()).with_packet_id(packet_id);
        let frame = shared.frame_with_payload(&packet, payload)?;
        session.enqueue(frame)
    }

    /// 释放预编码的负载。
    pub fn release_packet(&self, packet_id: PacketId) -> Result<(), ServiceError> {
        self.shared
            .packets
            .remove(&packet_id)
            .map(|_| ())
            .ok_or_else(|| ServiceError::invalid_argument(format!("packet {packet_id} not found")))
    }

    /// 向多个会话发送同一数据包，只编码一次。
    ///
    /// 编码后的帧在目标之间共享，因此帧编解码器的输出不应依赖 `session_id`。
    pub fn multicast(
        &self,
        session_ids: &[SessionId],
        opcode: Opcode,
        data: impl Into<Bytes>,
        status: Status,
    ) -> Result<MulticastReport, ServiceError> {
        let shared = &self.shared;
        shared.ensure_active()?;
        check_opcode(opcode)?;
        let mut report = MulticastReport::default();
        let Some(first) = session_ids.first() else {
            return Ok(report);
        };
        let frame = shared.encode_frame(&Packet::new(*first, opcode, status, data))?;

        for &session_id in session_ids {
            let delivered = shared
                .table
                .get(session_id)
                .ok_or_else(|| ServiceError::session_not_found(session_id))
                .and_then(|session| session.enqueue(frame.clone()));
            match delivered {
                Ok(()) => report.delivered.push(session_id),
                Err(err) => report.failed.push((session_id, err.kind())),
            }
        }
        Ok(report)
    }

    /// 向调用时刻全部 `Valid` 会话发送，返回投递数量。
    pub fn broadcast(
        &self,
        opcode: Opcode,
        data: impl Into<Bytes>,
        status: Status,
    ) -> Result<usize, ServiceError> {
        let shared = &self.shared;
        shared.ensure_active()?;
        check_opcode(opcode)?;
        let targets = shared.table.valid_sessions();
        let Some(first) = targets.first() else {
            return Ok(0);
        };
        let frame = shared.encode_frame(&Packet::new(first.id(), opcode, status, data))?;
        Ok(targets
            .iter()
            .filter(|session| session.enqueue(frame.clone()).is_ok())
            .count())
    }

    /// 注册 Facade，仅允许在启动前调用。
    pub fn register_facade(&self, facade: Arc<dyn Facade>) -> Result<(), ServiceError> {
        let _guard = self.shared.lock_lifecycle("register_facade")?;
        if self.shared.phase() != Phase::Created {
            return Err(ServiceError::new(
                ServiceErrorKind::AlreadyStarted,
                "facades can only be registered before start",
            ));
        }
        self.shared.facades.register(facade);
        Ok(())
    }

    /// 注册操作码编解码器；覆盖时上报，已使用过的操作码拒绝覆盖。
    pub fn register_coder(
        &self,
        opcode: Opcode,
        coder: impl PacketCoder,
    ) -> Result<(), ServiceError> {
        let shared = &self.shared;
        shared.ensure_not_stopped()?;
        check_opcode(opcode)?;
        if shared.coders.register(opcode, Arc::new(coder))?.is_some() {
            shared.report_replacement("packet coder", Some(opcode));
        }
        Ok(())
    }

    pub fn subscribe(
        &self,
        opcode: Opcode,
        handler: impl PacketHandler,
    ) -> Result<(), ServiceError> {
        let shared = &self.shared;
        shared.ensure_not_stopped()?;
        check_opcode(opcode)?;
        if shared.dispatcher.subscribe(opcode, Arc::new(handler)).is_some() {
            shared.report_replacement("packet handler", Some(opcode));
        }
        Ok(())
    }

    pub fn pre_subscribe(
        &self,
        opcode: Opcode,
        handler: impl PacketPreHandler,
    ) -> Result<(), ServiceError> {
        let shared = &self.shared;
        shared.ensure_not_stopped()?;
        check_opcode(opcode)?;
        if shared
            .dispatcher
            .pre_subscribe(opcode, Arc::new(handler))
            .is_some()
        {
            shared.report_replacement("packet pre-handler", Some(opcode));
        }
        Ok(())
    }

    pub fn unify_pre_subscribe(&self, handler: impl PacketPreHandler) -> Result<(), ServiceError> {
        let shared = &self.shared;
        shared.ensure_not_stopped()?;
        if shared.dispatcher.unify_pre_subscribe(Arc::new(handler)).is_some() {
            shared.report_replacement("unify pre-handler", None);
        }
        Ok(())
    }

    /// `Reject` 策略下找不到解码器时的回调。
    pub fn set_coder_not_found_reporter(&self, reporter: impl Fn(Opcode) + Send + Sync + 'static) {
        *self.shared.coder_not_found.write() = Some(Arc::new(reporter));
    }

    /// `Pull` 模式下推进一帧：依次驱动全部轮询器，再执行每帧钩子。
    pub fn on_svc(&self, full_stack: bool) -> Result<(), ServiceError> {
        let shared = &self.shared;
        if poller::in_poller_context() {
            return Err(ServiceError::invalid_argument(
                "on_svc must not be called from a poller callback",
            ));
        }
        let _tick = shared.ticking.read();
        if shared.phase() != Phase::Started {
            return Err(ServiceError::not_started());
        }
        if shared.drive_mode() != DriveMode::Pull {
            return Err(ServiceError::invalid_argument(
                "on_svc is only available in pull mode",
            ));
        }

        let started = Instant::now();
        let pollers = shared.pollers.read().clone();
        for poller in &pollers {
            poller.tick(shared, full_stack);
        }
        poller::run_frame_hooks(shared, frame_interval(shared.fps()), started);
        Ok(())
    }
}

impl fmt::Debug for ServiceHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServiceHandle")
            .field("id", &self.shared.id)
            .field("name", &self.shared.config.name)
            .field("state", &self.state())
            .finish()
    }
}

fn facade_failed(hook: &'static str, err: crate::error::FacadeError) -> ServiceError {
    ServiceError::new(
        ServiceErrorKind::FacadeFailed,
        format!("facade {hook} failed: {err}"),
    )
    .with_source(err)
}

/// 服务实例；解引用为 [`ServiceHandle`]，释放时自动停止。
pub struct Service {
    handle: ServiceHandle,
}

impl Service {
    pub fn builder(kind: ServiceKind) -> ServiceBuilder {
        ServiceBuilder {
            kind,
            config: ServiceConfig::default(),
            frame_codec: None,
        }
    }

    pub fn handle(&self) -> ServiceHandle {
        self.handle.clone()
    }
}

impl Deref for Service {
    type Target = ServiceHandle;

    fn deref(&self) -> &Self::Target {
        &self.handle
    }
}

impl Drop for Service {
    fn drop(&mut self) {
        if let Err(err) = self.handle.stop() {
            tracing::warn!(
                service = self.handle.id(),
                code = err.code(),
                "stop on drop failed: {err}"
            );
        }
        let shared = &self.handle.shared;
        if let Some(runtime) = shared.io.lock().take() {
            runtime.shutdown_background();
        }
        shared.dispatcher.clear();
        shared.coders.clear();
        shared.facades.clear();
        shared.packets.clear();
        *shared.coder_not_found.write() = None;
    }
}

impl fmt::Debug for Service {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.handle.fmt(f)
    }
}

/// [`Service`] 构建器。
pub struct ServiceBuilder {
    kind: ServiceKind,
    config: ServiceConfig,
    frame_codec: Option<Arc<dyn FrameCodec>>,
}

impl ServiceBuilder {
    pub fn config(mut self, config: ServiceConfig) -> Self {
        self.config = config;
        self
    }

    /// 替换默认的 [`LengthPrefixedCodec`]。
    pub fn frame_codec(mut self, codec: impl FrameCodec) -> Self {
        self.frame_codec = Some(Arc::new(codec));
        self
    }

    pub fn build(self) -> Result<Service, ServiceError> {
        let config = self.config;
        config.validate()?;

        let io = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(1)
            .thread_name(format!("{}-io", config.name))
            .enable_io()
            .enable_time()
            .build()
            .map_err(|err| ServiceError::allocation_failed("io runtime", err))?;

        let frame_codec = self.frame_codec.unwrap_or_else(|| {
            Arc::new(LengthPrefixedCodec::new(config.endian, config.max_frame_size))
        });
        let drive_mode = match config.drive_mode {
            DriveMode::Push => 0,
            DriveMode::Pull => 1,
        };

        let shared = ServiceShared {
            id: NEXT_SERVICE_ID.fetch_add(1, Ordering::Relaxed),
            kind: self.kind,
            phase: AtomicU8::new(Phase::Created as u8),
            drive_mode: AtomicU8::new(drive_mode),
            fps: AtomicU32::new(config.fps),
            lifecycle: Mutex::new(()),
            ticking: RwLock::new(()),
            frame_codec,
            coders: CoderRegistry::new(config.unknown_opcode_policy),
            dispatcher: Dispatcher::new(),
            facades: FacadeRegistry::new(),
            table: SessionTable::default(),
            coder_not_found: RwLock::new(None),
            session_ids: SessionIdAllocator::new(),
            next_listener: AtomicU64::new(1),
            next_token: AtomicU64::new(0),
            next_packet: AtomicU64::new(0),
            round_robin: AtomicUsize::new(0),
            pollers: RwLock::new(Vec::new()),
            engine: Mutex::new(None),
            io: Mutex::new(Some(io)),
            listeners: DashMap::new(),
            packets: DashMap::new(),
            config,
        };
        tracing::debug!(
            service = shared.id,
            name = %shared.config.name,
            kind = ?shared.kind,
            "service created"
        );
        Ok(Service {
            handle: ServiceHandle {
                shared: Arc::new(shared),
            },
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pull_service(kind: ServiceKind) -> Service {
        Service::builder(kind)
            .config(ServiceConfig::default().with_drive_mode(DriveMode::Pull))
            .build()
            .expect("build")
    }

    #[test]
    fn service_ids_are_unique() {
        let a = pull_service(ServiceKind::Client);
        let b = pull_service(ServiceKind::Client);
        assert_ne!(a.id(), b.id());
        assert!(a.id() >= 1);
    }

    #[test]
    fn operations_require_active_service() {
        let service = pull_service(ServiceKind::Server);
        let err = service
            .send_bytes(SessionId::new(1), 1, "x", 0)
            .expect_err("not started");
        assert_eq!(err.kind(), ServiceErrorKind::NotStarted);
        assert_eq!(
            service.listen("127.0.0.1", 0).expect_err("not started").kind(),
            ServiceErrorKind::NotStarted
        );
        assert_eq!(
            service.on_svc(true).expect_err("not started").kind(),
            ServiceErrorKind::NotStarted
        );
    }

    #[test]
    fn client_cannot_listen() {
        let service = pull_service(ServiceKind::Client);
        service.start(1).expect("start");
        let err = service.listen("127.0.0.1", 0).expect_err("client");
        assert_eq!(err.kind(), ServiceErrorKind::InvalidArgument);
        service.stop().expect("stop");
    }

    #[test]
    fn drive_mode_and_fps_rules() {
        let service = pull_service(ServiceKind::Client);
        service.set_fps(30).expect("fps");
        assert_eq!(service.frame_interval(), Duration::from_micros(33_333));
        assert_eq!(
            service.set_fps(1001).expect_err("range").kind(),
            ServiceErrorKind::InvalidArgument
        );

        service.start(1).expect("start");
        assert_eq!(
            service
                .set_drive_mode(DriveMode::Push)
                .expect_err("started")
                .kind(),
            ServiceErrorKind::AlreadyStarted
        );
        assert_eq!(
            service.start(1).expect_err("twice").kind(),
            ServiceErrorKind::AlreadyStarted
        );
        service.stop().expect("stop");
        service.stop().expect("idempotent");
        assert_eq!(service.state(), ServiceState::Stopped);
        assert_eq!(
            service.start(1).expect_err("monotonic").kind(),
            ServiceErrorKind::AlreadyStarted
        );
    }

    #[test]
    fn pre_encoded_packets_are_validated() {
        let service = pull_service(ServiceKind::Client);
        let packet_id = service.pre_encode(4, "hello").expect("pre-encode");
        service.start(1).expect("start");
        assert_eq!(
            service
                .send_packet(SessionId::new(1), 5, packet_id, 0)
                .expect_err("opcode mismatch")
                .kind(),
            ServiceErrorKind::InvalidArgument
        );
        assert_eq!(
            service
                .send_packet(SessionId::new(1), 4, packet_id, 0)
                .expect_err("no session")
                .kind(),
            ServiceErrorKind::SessionNotFound
        );
        service.release_packet(packet_id).expect("release");
        assert!(service.release_packet(packet_id).is_err());
    }

    #[test]
    fn negative_opcode_is_rejected() {
        let service = pull_service(ServiceKind::Client);
        assert_eq!(
            service
                .subscribe(-1, |_: &Packet| {})
                .expect_err("negative")
                .kind(),
            ServiceErrorKind::InvalidArgument
        );
    }
}
