//! # facade 模块
//!
//! ## 设计动机（Why）
//! - 宿主通过 [`Facade`] 观察服务的生命周期、会话事件与协议异常；一个服务可挂载多个 Facade，
//!   按注册顺序组成有序列表；
//! - 生命周期的“拆除”阶段（`on_stop`、`on_destroy`）按逆序执行，与启动顺序对称。
//!
//! ## 行为契约（What）
//! - 全部钩子带默认空实现，宿主只需覆盖关心的事件；
//! - `on_init`/`on_start` 失败会中止启动；`on_update`/`on_idle` 失败只会转为
//!   [`ProtoReport`] 事件，服务继续运行；
//! - 会话与协议事件在拥有该会话的轮询线程上触发，实现不得阻塞。
//!
//! ## 风险提示（Trade-offs）
//! - 事件分发基于快照，启动后注册表冻结，因此分发过程不持有任何锁，钩子内可安全回调服务。

use std::borrow::Cow;
use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;

use crate::error::{FacadeError, ServiceErrorKind};
use crate::packet::{ListenerId, Opcode, Packet, SessionId};

/// 异步建连请求的凭据，与 [`AsyncConnResult::token`] 一一对应。
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ConnToken(u64);

impl ConnToken {
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }

    pub const fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for ConnToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// 会话的来源。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SessionOrigin {
    /// 监听器接受的连接，携带监听器编号。
    Accepted { listener: ListenerId },
    /// 同步 `connect` 建立的连接。
    Connected,
    /// 异步建连成功。
    AsyncConnected { token: ConnToken },
}

/// 会话创建事件。
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SessionInfo {
    pub session_id: SessionId,
    pub local_addr: SocketAddr,
    pub peer_addr: SocketAddr,
    pub origin: SessionOrigin,
    /// 拥有该会话的轮询器编号。
    pub poller: usize,
}

/// 会话关闭的发起方。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Initiator {
    /// 宿主调用 `remove_session`。
    Local,
    /// 对端关闭连接。
    Peer,
    /// 读写失败。
    Error,
    /// 服务停止。
    Service,
}

/// 会话关闭原因。
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DestroyReason {
    pub initiator: Initiator,
    pub message: Cow<'static, str>,
}

impl DestroyReason {
    pub fn new(initiator: Initiator, message: impl Into<Cow<'static, str>>) -> Self {
        Self {
            initiator,
            message: message.into(),
        }
    }
}

/// 会话销毁事件，每个会话恰好触发一次。
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SessionDestroyInfo {
    pub info: SessionInfo,
    pub reason: DestroyReason,
}

/// 异步建连失败的描述。
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ConnFailure {
    pub kind: ServiceErrorKind,
    pub message: String,
}

/// 异步建连结果。
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AsyncConnResult {
    pub token: ConnToken,
    pub peer_addr: SocketAddr,
    pub outcome: Result<SessionId, ConnFailure>,
}

impl AsyncConnResult {
    pub fn is_connected(&self) -> bool {
        self.outcome.is_ok()
    }

    pub fn session_id(&self) -> Option<SessionId> {
        self.outcome.as_ref().ok().copied()
    }
}

/// 上报发生在哪一层。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReportLayer {
    Transport,
    Codec,
    Dispatch,
    Facade,
    Registry,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum ReportLevel {
    Warn,
    Error,
}

/// 协议层异常报告。
///
/// # 教案式说明
/// - **意图 (Why)**：轮询线程内的解码失败、读写错误、钩子失败都不会以 `Err` 冒泡，
///   统一转换为该事件交给宿主；
/// - **契约 (What)**：`offset` 为该会话入站字节流中出错位置的偏移；与会话无关的报告
///   （如注册冲突）不携带 `session_id`。
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ProtoReport {
    pub session_id: Option<SessionId>,
    pub opcode: Option<Opcode>,
    pub offset: Option<u64>,
    pub layer: ReportLayer,
    pub level: ReportLevel,
    pub kind: ServiceErrorKind,
    pub message: String,
}

impl ProtoReport {
    pub fn new(layer: ReportLayer, kind: ServiceErrorKind, message: impl Into<String>) -> Self {
        Self {
            session_id: None,
            opcode: None,
            offset: None,
            layer,
            level: ReportLevel::Warn,
            kind,
            message: message.into(),
        }
    }

    pub fn with_session(mut self, session_id: SessionId) -> Self {
        self.session_id = Some(session_id);
        self
    }

    pub fn with_opcode(mut self, opcode: Option<Opcode>) -> Self {
        self.opcode = opcode;
        self
    }

    pub fn with_offset(mut self, offset: u64) -> Self {
        self.offset = Some(offset);
        self
    }

    pub fn with_level(mut self, level: ReportLevel) -> Self {
        self.level = level;
        self
    }
}

/// 服务生命周期与事件的观察者。
///
/// # 教案式说明
/// - **意图 (Why)**：替代原生绑定中的回调表，由宿主以 trait 对象注入；
/// - **契约 (What)**：
///   - 生命周期钩子：`on_init` → `on_start` → (`on_update`/`on_idle` 每帧) → `on_stop`
///     → `on_destroy`；
///   - `on_session_destroy` 总是在对应的 `on_session_create` 之后，且恰好一次；
///   - 钩子中可以调用 [`ServiceHandle`](crate::ServiceHandle) 的控制面操作，但不得调用 `stop`
///     （轮询线程内调用会返回 `InvalidArgument`）；
/// - **风险 (Trade-offs)**：钩子在轮询线程上同步执行，耗时操作应转交其他线程。
#[allow(unused_variables)]
pub trait Facade: Send + Sync + 'static {
    fn on_init(&self) -> Result<(), FacadeError> {
        Ok(())
    }

    fn on_destroy(&self) {}

    fn on_start(&self) -> Result<(), FacadeError> {
        Ok(())
    }

    fn on_stop(&self) {}

    /// 每帧一次。
    fn on_update(&self) -> Result<(), FacadeError> {
        Ok(())
    }

    /// 每帧一次，`idle` 为本帧剩余的空闲时间。
    fn on_idle(&self, idle: Duration) -> Result<(), FacadeError> {
        Ok(())
    }

    fn on_session_create(&self, info: &SessionInfo) {}

    fn on_session_destroy(&self, info: &SessionDestroyInfo) {}

    fn on_async_conn_result(&self, result: &AsyncConnResult) {}

    fn on_proto_report(&self, report: &ProtoReport) {}

    /// 没有处理器订阅的数据包，负载已解码。
    fn on_unhandled_packet(&self, packet: &Packet) {}
}

/// 有序 Facade 注册表。
#[derive(Default)]
pub struct FacadeRegistry {
    facades: RwLock<Arc<Vec<Arc<dyn Facade>>>>,
}

impl FacadeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, facade: Arc<dyn Facade>) {
        let mut guard = self.facades.write();
        let mut next = Vec::clone(&guard);
        next.push(facade);
        *guard = Arc::new(next);
    }

    pub fn len(&self) -> usize {
        self.facades.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn snapshot(&self) -> Arc<Vec<Arc<dyn Facade>>> {
        self.facades.read().clone()
    }

    /// 按顺序执行 `on_init`；失败时返回已成功的数量与错误。
    pub(crate) fn init_all(&self) -> Result<(), (usize, FacadeError)> {
        for (index, facade) in self.snapshot().iter().enumerate() {
            facade.on_init().map_err(|err| (index, err))?;
        }
        Ok(())
    }

    /// 按顺序执行 `on_start`；失败时返回已成功的数量与错误。
    pub(crate) fn start_all(&self) -> Result<(), (usize, FacadeError)> {
        for (index, facade) in self.snapshot().iter().enumerate() {
            facade.on_start().map_err(|err| (index, err))?;
        }
        Ok(())
    }

    /// 逆序对前 `count` 个 Facade 执行 `on_stop`。
    pub(crate) fn stop_first(&self, count: usize) {
        for facade in self.snapshot().iter().take(count).rev() {
            facade.on_stop();
        }
    }

    /// 逆序对前 `count` 个 Facade 执行 `on_destroy`。
    pub(crate) fn destroy_first(&self, count: usize) {
        for facade in self.snapshot().iter().take(count).rev() {
            facade.on_destroy();
        }
    }

    /// 每帧钩子；失败转为 `FacadeFailed` 报告。
    pub(crate) fn frame(&self, idle: Duration) {
        let facades = self.snapshot();
        for facade in facades.iter() {
            if let Err(err) = facade.on_update() {
                self.fan_out_report(
                    &facades,
                    &ProtoReport::new(
                        ReportLayer::Facade,
                        ServiceErrorKind::FacadeFailed,
                        format!("on_update failed: {err}"),
                    ),
                );
            }
        }
        for facade in facades.iter() {
            if let Err(err) = facade.on_idle(idle) {
                self.fan_out_report(
                    &facades,
                    &ProtoReport::new(
                        ReportLayer::Facade,
                        ServiceErrorKind::FacadeFailed,
                        format!("on_idle failed: {err}"),
                    ),
                );
            }
        }
    }

    pub(crate) fn session_create(&self, info: &SessionInfo) {
        tracing::debug!(
            session_id = info.session_id.get(),
            peer = %info.peer_addr,
            poller = info.poller,
            "session created"
        );
        for facade in self.snapshot().iter() {
            facade.on_session_create(info);
        }
    }

    pub(crate) fn session_destroy(&self, info: &SessionDestroyInfo) {
        tracing::debug!(
            session_id = info.info.session_id.get(),
            initiator = ?info.reason.initiator,
            reason = %info.reason.message,
            "session destroyed"
        );
        for facade in self.snapshot().iter() {
            facade.on_session_destroy(info);
        }
    }

    pub(crate) fn async_conn_result(&self, result: &AsyncConnResult) {
        for facade in self.snapshot().iter() {
            facade.on_async_conn_result(result);
        }
    }

    pub(crate) fn proto_report(&self, report: &ProtoReport) {
        self.fan_out_report(&self.snapshot(), report);
    }

    pub(crate) fn unhandled_packet(&self, packet: &Packet) {
        for facade in self.snapshot().iter() {
            facade.on_unhandled_packet(packet);
        }
    }

    pub(crate) fn clear(&self) {
        *self.facades.write() = Arc::new(Vec::new());
    }

    fn fan_out_report(&self, facades: &[Arc<dyn Facade>], report: &ProtoReport) {
        tracing::warn!(
            session_id = report.session_id.map(SessionId::get),
            opcode = report.opcode,
            offset = report.offset,
            layer = ?report.layer,
            code = report.kind.code(),
            "{}",
            report.message
        );
        for facade in facades {
            facade.on_proto_report(report);
        }
    }
}

impl fmt::Debug for FacadeRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FacadeRegistry")
            .field("len", &self.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use tracing_test::traced_test;

    struct Probe {
        name: &'static str,
        fail_start: bool,
        fail_update: bool,
        log: Arc<Mutex<Vec<String>>>,
    }

    impl Probe {
        fn new(name: &'static str, log: &Arc<Mutex<Vec<String>>>) -> Self {
            Self {
                name,
                fail_start: false,
                fail_update: false,
                log: log.clone(),
            }
        }

        fn push(&self, event: &str) {
            self.log.lock().push(format!("{}:{event}", self.name));
        }
    }

    impl Facade for Probe {
        fn on_init(&self) -> Result<(), FacadeError> {
            self.push("init");
            Ok(())
        }

        fn on_start(&self) -> Result<(), FacadeError> {
            self.push("start");
            if self.fail_start {
                return Err(FacadeError::new("boom"));
            }
            Ok(())
        }

        fn on_stop(&self) {
            self.push("stop");
        }

        fn on_destroy(&self) {
            self.push("destroy");
        }

        fn on_update(&self) -> Result<(), FacadeError> {
            if self.fail_update {
                return Err(FacadeError::new("tick"));
            }
            Ok(())
        }

        fn on_proto_report(&self, report: &ProtoReport) {
            self.push(&format!("report:{}", report.kind.code()));
        }
    }

    #[test]
    fn teardown_runs_in_reverse_order() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let registry = FacadeRegistry::new();
        registry.register(Arc::new(Probe::new("a", &log)));
        registry.register(Arc::new(Probe::new("b", &log)));

        registry.init_all().expect("init");
        registry.start_all().expect("start");
        registry.stop_first(registry.len());
        registry.destroy_first(registry.len());

        assert_eq!(
            *log.lock(),
            vec![
                "a:init", "b:init", "a:start", "b:start", "b:stop", "a:stop", "b:destroy",
                "a:destroy"
            ]
        );
    }

    #[test]
    fn start_failure_reports_progress() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let registry = FacadeRegistry::new();
        registry.register(Arc::new(Probe::new("a", &log)));
        let mut failing = Probe::new("b", &log);
        failing.fail_start = true;
        registry.register(Arc::new(failing));
        registry.register(Arc::new(Probe::new("c", &log)));

        let (started, err) = registry.start_all().expect_err("b fails");
        assert_eq!(started, 1);
        assert_eq!(err.message(), "boom");
        assert!(!log.lock().iter().any(|e| e == "c:start"));
    }

    #[traced_test]
    #[test]
    fn update_failure_becomes_report() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let registry = FacadeRegistry::new();
        let mut failing = Probe::new("a", &log);
        failing.fail_update = true;
        registry.register(Arc::new(failing));
        registry.register(Arc::new(Probe::new("b", &log)));

        registry.frame(Duration::from_millis(1));

        assert_eq!(
            *log.lock(),
            vec![
                "a:report:spark.comm.facade_failed",
                "b:report:spark.comm.facade_failed"
            ]
        );
        assert!(logs_contain("on_update failed"));
    }
}
