//! # poller 模块
//!
//! ## 设计动机（Why）
//! - 每个轮询器独占一组会话，同一会话的读缓冲、分帧与写出只在一个执行上下文中发生，
//!   轮询器之间没有针对单个会话的竞争；
//! - 新会话通过命令通道移交给轮询器，沿用传输层“接收任务 → 通道 → 消费方”的所有权转移方式。
//!
//! ## 单帧流程（How）
//! 1. 处理命令：接管新会话（`Pending → Valid`，触发 `on_session_create`），投递异步建连结果；
//! 2. 对每个 `Valid` 会话读取可用字节、分帧、分发；残帧留待下一帧；
//! 3. 写出出站队列，部分写保留剩余字节；
//! 4. 收尾：`Closing` 会话在排空或宽限期到期后关闭，读写失败的会话立即关闭，
//!    每个会话恰好触发一次 `on_session_destroy`。
//!
//! ## 驱动方式
//! - `Push`：[`spawn_push_thread`] 为每个轮询器创建独立线程，以 `current_thread` 运行时的
//!   `interval` 按帧率驱动，`watch` 通道通知退出；
//! - `Pull`：宿主在 `on_svc` 中同步调用 [`Poller::tick`]。

use std::cell::Cell;
use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use bytes::Buf;
use parking_lot::Mutex;
use tokio::sync::{mpsc, watch};
use tokio::time::MissedTickBehavior;

use crate::codec::{DecodeFailure, DecodeOutcome};
use crate::config::frame_interval;
use crate::dispatch::DispatchOutcome;
use crate::error::{ServiceErrorKind, map_io_error};
use crate::error::{READ, WRITE};
use crate::facade::{
    AsyncConnResult, ConnFailure, ConnToken, DestroyReason, Initiator, ProtoReport, ReportLayer,
    SessionDestroyInfo, SessionOrigin,
};
use crate::packet::SessionId;
use crate::service::ServiceShared;
use crate::session::{ReadStatus, Session, SessionState};

thread_local! {
    static IN_POLLER: Cell<bool> = const { Cell::new(false) };
}

/// 当前线程是否正在执行轮询帧（含其中触发的全部回调）。
pub(crate) fn in_poller_context() -> bool {
    IN_POLLER.with(Cell::get)
}

struct PollerScope {
    previous: bool,
}

impl PollerScope {
    fn enter() -> Self {
        Self {
            previous: IN_POLLER.with(|flag| flag.replace(true)),
        }
    }
}

impl Drop for PollerScope {
    fn drop(&mut self) {
        IN_POLLER.with(|flag| flag.set(self.previous));
    }
}

/// 发往轮询器的命令。
#[derive(Debug)]
pub(crate) enum PollerCommand {
    /// 接管一个已建连的会话。
    Adopt(Session),
    /// 异步建连失败。
    AsyncConnFailed {
        token: ConnToken,
        peer_addr: SocketAddr,
        failure: ConnFailure,
    },
}

struct PollerCore {
    commands: mpsc::UnboundedReceiver<PollerCommand>,
    sessions: BTreeMap<SessionId, Session>,
}

/// 轮询器。
pub(crate) struct Poller {
    index: usize,
    sender: mpsc::UnboundedSender<PollerCommand>,
    core: Mutex<PollerCore>,
}

impl Poller {
    pub(crate) fn new(index: usize) -> Self {
        let (sender, commands) = mpsc::unbounded_channel();
        Self {
            index,
            sender,
            core: Mutex::new(PollerCore {
                commands,
                sessions: BTreeMap::new(),
            }),
        }
    }

    pub(crate) fn index(&self) -> usize {
        self.index
    }

    /// 投递命令；轮询器已经关闭时原样返回命令。
    pub(crate) fn send(&self, command: PollerCommand) -> Result<(), PollerCommand> {
        self.sender.send(command).map_err(|err| err.0)
    }

    /// 执行一帧。
    pub(crate) fn tick(&self, service: &ServiceShared, full_stack: bool) {
        let _scope = PollerScope::enter();
        let mut core = self.core.lock();
        let PollerCore { commands, sessions } = &mut *core;

        while let Ok(command) = commands.try_recv() {
            self.apply(service, sessions, command);
        }

        let now = Instant::now();
        let mut finished = Vec::new();
        for session in sessions.values_mut() {
            if let Some(reason) = drive_session(service, session, full_stack, now) {
                finished.push((session.id(), reason));
            }
        }

        for (id, reason) in finished {
            if let Some(session) = sessions.remove(&id) {
                destroy(service, session, reason);
            }
        }
    }

    /// 停止时关闭全部会话：先接管通道中尚未处理的会话，保证创建与销毁事件成对出现。
    pub(crate) fn shutdown(&self, service: &ServiceShared) {
        let _scope = PollerScope::enter();
        let mut core = self.core.lock();
        let PollerCore { commands, sessions } = &mut *core;

        commands.close();
        while let Ok(command) = commands.try_recv() {
            self.apply(service, sessions, command);
        }

        let drained = std::mem::take(sessions);
        for (_, mut session) in drained {
            if let Err(err) = session.flush() {
                tracing::debug!(
                    session_id = session.id().get(),
                    error = %err,
                    "final flush failed"
                );
            }
            destroy(
                service,
                session,
                DestroyReason::new(Initiator::Service, "service stopped"),
            );
        }
    }

    fn apply(
        &self,
        service: &ServiceShared,
        sessions: &mut BTreeMap<SessionId, Session>,
        command: PollerCommand,
    ) {
        match command {
            PollerCommand::Adopt(session) => {
                // 接管前已被请求关闭的会话仍然先触发创建事件，随后在收尾阶段关闭。
                session.shared().activate();
                let info = session.info().clone();
                sessions.insert(session.id(), session);
                service.facades.session_create(&info);
                if let SessionOrigin::AsyncConnected { token } = info.origin {
                    service.facades.async_conn_result(&AsyncConnResult {
                        token,
                        peer_addr: info.peer_addr,
                        outcome: Ok(info.session_id),
                    });
                }
            }
            PollerCommand::AsyncConnFailed {
                token,
                peer_addr,
                failure,
            } => {
                tracing::warn!(
                    poller = self.index,
                    token = token.get(),
                    peer = %peer_addr,
                    code = failure.kind.code(),
                    "async connect failed: {}",
                    failure.message
                );
                service.facades.async_conn_result(&AsyncConnResult {
                    token,
                    peer_addr,
                    outcome: Err(failure),
                });
            }
        }
    }
}

impl std::fmt::Debug for Poller {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Poller").field("index", &self.index).finish()
    }
}

/// 推进单个会话，返回需要关闭时的原因。
fn drive_session(
    service: &ServiceShared,
    session: &mut Session,
    full_stack: bool,
    now: Instant,
) -> Option<DestroyReason> {
    let config = &service.config;

    if session.shared().state() == SessionState::Valid {
        let status = session.read_available(config.read_chunk_size, config.max_read_per_tick);
        decode_and_dispatch(service, session, full_stack);
        match status {
            ReadStatus::Open => {}
            ReadStatus::Eof => {
                return Some(DestroyReason::new(Initiator::Peer, "peer closed connection"));
            }
            ReadStatus::Failed(err) => {
                let err = map_io_error(READ, err);
                report_transport(service, session, err.kind(), err.message());
                return Some(DestroyReason::new(Initiator::Error, err.to_string()));
            }
        }
    }

    let drained = match session.flush() {
        Ok(drained) => drained,
        Err(err) => {
            let err = map_io_error(WRITE, err);
            report_transport(service, session, err.kind(), err.message());
            return Some(DestroyReason::new(Initiator::Error, err.to_string()));
        }
    };

    if session.shared().state() == SessionState::Closing {
        let expired = session
            .shared()
            .close_deadline()
            .is_none_or(|deadline| now >= deadline);
        if drained || expired {
            return Some(
                session
                    .shared()
                    .take_close_request()
                    .map(|request| request.reason)
                    .unwrap_or_else(|| DestroyReason::new(Initiator::Local, "session removed")),
            );
        }
    }
    None
}

fn decode_and_dispatch(service: &ServiceShared, session: &mut Session, full_stack: bool) {
    let id = session.id();
    loop {
        let before = session.inbound().len();
        match service.frame_codec.decode(id, session.inbound()) {
            Ok(DecodeOutcome::Incomplete) => break,
            Ok(DecodeOutcome::Complete(packet)) => {
                let taken = before - session.inbound().len();
                session.advance_offset(taken);
                dispatch_packet(service, session, packet, full_stack);
                // 处理器可能已请求关闭本会话，剩余帧不再分发。
                if session.shared().state() != SessionState::Valid {
                    break;
                }
            }
            Err(DecodeFailure {
                error,
                opcode,
                discard,
            }) => {
                service.facades.proto_report(
                    &ProtoReport::new(
                        ReportLayer::Codec,
                        ServiceErrorKind::DecodeFailed,
                        error.to_string(),
                    )
                    .with_session(id)
                    .with_opcode(opcode)
                    .with_offset(session.offset()),
                );
                let inbound = session.inbound();
                let discard = match discard {
                    0 => inbound.len(),
                    n => n.min(inbound.len()),
                };
                inbound.advance(discard);
                session.advance_offset(discard);
                if discard == 0 {
                    break;
                }
            }
        }
    }
}

fn dispatch_packet(
    service: &ServiceShared,
    session: &Session,
    packet: crate::packet::Packet,
    full_stack: bool,
) {
    let offset = session.offset();
    match service
        .dispatcher
        .dispatch(packet, full_stack, &service.coders)
    {
        DispatchOutcome::Handled => {}
        DispatchOutcome::Vetoed(stage) => {
            tracing::trace!(session_id = session.id().get(), ?stage, "packet vetoed");
        }
        DispatchOutcome::Unhandled(packet) => service.facades.unhandled_packet(&packet),
        DispatchOutcome::DecodeFailed { opcode, error } => service.facades.proto_report(
            &ProtoReport::new(
                ReportLayer::Dispatch,
                ServiceErrorKind::DecodeFailed,
                error.to_string(),
            )
            .with_session(session.id())
            .with_opcode(Some(opcode))
            .with_offset(offset),
        ),
        DispatchOutcome::CoderMissing(opcode) => {
            service.report_coder_not_found(opcode);
            service.facades.proto_report(
                &ProtoReport::new(
                    ReportLayer::Registry,
                    ServiceErrorKind::DecodeFailed,
                    format!("no coder registered for opcode {opcode}"),
                )
                .with_session(session.id())
                .with_opcode(Some(opcode))
                .with_offset(offset),
            );
        }
    }
}

fn report_transport(
    service: &ServiceShared,
    session: &Session,
    kind: ServiceErrorKind,
    message: &str,
) {
    service.facades.proto_report(
        &ProtoReport::new(ReportLayer::Transport, kind, message)
            .with_session(session.id())
            .with_offset(session.offset()),
    );
}

fn destroy(service: &ServiceShared, session: Session, reason: DestroyReason) {
    let (info, shared) = session.close();
    service.table.remove(shared.id());
    service
        .facades
        .session_destroy(&SessionDestroyInfo { info, reason });
}

/// `Push` 模式下轮询线程的退出信号。
pub(crate) type ShutdownSignal = watch::Receiver<bool>;

/// 为轮询器创建驱动线程。
///
/// - 线程名为 `spark-comm-poller-{index}`；
/// - 0 号轮询器额外负责每帧的 `on_update`/`on_idle`；
/// - 每帧结束后重新读取帧率，`set_fps` 在下一帧生效。
pub(crate) fn spawn_push_thread(
    poller: Arc<Poller>,
    service: Arc<ServiceShared>,
    mut shutdown: ShutdownSignal,
) -> std::io::Result<JoinHandle<()>> {
    let index = poller.index();
    std::thread::Builder::new()
        .name(format!("spark-comm-poller-{index}"))
        .spawn(move || {
            let runtime = match tokio::runtime::Builder::new_current_thread()
                .enable_time()
                .build()
            {
                Ok(runtime) => runtime,
                Err(err) => {
                    tracing::error!(poller = index, error = %err, "poller runtime unavailable");
                    return;
                }
            };

            runtime.block_on(async move {
                let mut fps = service.fps();
                let mut ticker = ticker_for(fps);
                loop {
                    tokio::select! {
                        _ = ticker.tick() => {}
                        changed = shutdown.changed() => {
                            if changed.is_err() || *shutdown.borrow() {
                                break;
                            }
                            continue;
                        }
                    }

                    let started = Instant::now();
                    poller.tick(&service, true);
                    if index == 0 {
                        let idle = frame_interval(fps).saturating_sub(started.elapsed());
                        let _scope = PollerScope::enter();
                        service.facades.frame(idle);
                    }

                    let current = service.fps();
                    if current != fps {
                        fps = current;
                        ticker = ticker_for(fps);
                    }
                }
            });
            tracing::debug!(poller = index, "poller thread exited");
        })
}

fn ticker_for(fps: u32) -> tokio::time::Interval {
    let mut ticker = tokio::time::interval(frame_interval(fps));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    ticker
}

/// 在调用方线程上执行每帧钩子（`Pull` 模式）。
pub(crate) fn run_frame_hooks(service: &ServiceShared, frame: Duration, started: Instant) {
    let _scope = PollerScope::enter();
    service
        .facades
        .frame(frame.saturating_sub(started.elapsed()));
}
