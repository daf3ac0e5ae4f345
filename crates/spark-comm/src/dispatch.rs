//! # dispatch 模块
//!
//! ## 设计动机（Why）
//! - 入站数据包按操作码路由到宿主处理器；路由表在运行期可热更新，读路径不得被注册阻塞；
//! - 沿用路由层 `ArcSwap` 整表替换的做法：注册时复制旧表、插入新项、原子发布快照。
//!
//! ## 行为契约（What）
//! - 单个数据包的处理顺序固定：
//!   1. 操作码前置处理器，返回 `false` 即否决；
//!   2. 统一前置处理器（仅 `full_stack` 时执行），返回 `false` 即否决；
//!   3. 操作码编解码器解码负载；
//!   4. 操作码处理器；若未注册则返回 [`DispatchOutcome::Unhandled`] 交由 Facade；
//! - 前置处理器看到原始负载，处理器看到解码后的负载；
//! - 重复注册以最后一次为准，返回被替换的旧实例并记录告警。
//!
//! ## 风险提示（Trade-offs）
//! - 处理器运行在轮询线程上，阻塞会拖慢同一轮询器上的全部会话。

use std::collections::HashMap;
use std::sync::Arc;

use arc_swap::ArcSwap;
use parking_lot::Mutex;

use crate::codec::CoderRegistry;
use crate::error::CodecError;
use crate::packet::{Opcode, Packet};

/// 操作码处理器。
pub trait PacketHandler: Send + Sync + 'static {
    fn handle(&self, packet: &Packet);
}

impl<F> PacketHandler for F
where
    F: Fn(&Packet) + Send + Sync + 'static,
{
    fn handle(&self, packet: &Packet) {
        self(packet)
    }
}

/// 前置处理器：返回 `true` 放行，`false` 否决。
pub trait PacketPreHandler: Send + Sync + 'static {
    fn pre_handle(&self, packet: &Packet) -> bool;
}

impl<F> PacketPreHandler for F
where
    F: Fn(&Packet) -> bool + Send + Sync + 'static,
{
    fn pre_handle(&self, packet: &Packet) -> bool {
        self(packet)
    }
}

/// 否决发生的阶段。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum VetoStage {
    /// 操作码前置处理器。
    Pre,
    /// 统一前置处理器。
    Unify,
}

/// 一次分发的结果，由轮询器转换为 Facade 事件。
#[derive(Debug, PartialEq, Eq)]
pub enum DispatchOutcome {
    Vetoed(VetoStage),
    Handled,
    /// 没有处理器，携带解码后的数据包。
    Unhandled(Packet),
    /// 编解码器报告失败，数据包被丢弃。
    DecodeFailed { opcode: Opcode, error: CodecError },
    /// `Reject` 策略下找不到编解码器，数据包被丢弃。
    CoderMissing(Opcode),
}

#[derive(Clone, Default)]
struct DispatchTable {
    handlers: HashMap<Opcode, Arc<dyn PacketHandler>>,
    pre_handlers: HashMap<Opcode, Arc<dyn PacketPreHandler>>,
    unify: Option<Arc<dyn PacketPreHandler>>,
}

/// 操作码分发器。
///
/// # 教案式说明
/// - **意图 (Why)**：把“谁处理该操作码”与轮询循环解耦，注册可来自任意线程；
/// - **契约 (What)**：`dispatch` 只读取一次快照，同一数据包的全部阶段看到同一版本的表；
/// - **风险 (Trade-offs)**：每次注册都复制整张表，注册频率应远低于分发频率。
pub struct Dispatcher {
    table: ArcSwap<DispatchTable>,
    write_lock: Mutex<()>,
}

impl Default for Dispatcher {
    fn default() -> Self {
        Self::new()
    }
}

impl Dispatcher {
    pub fn new() -> Self {
        Self {
            table: ArcSwap::from_pointee(DispatchTable::default()),
            write_lock: Mutex::new(()),
        }
    }

    /// 注册操作码处理器，返回被替换的旧处理器。
    pub fn subscribe(
        &self,
        opcode: Opcode,
        handler: Arc<dyn PacketHandler>,
    ) -> Option<Arc<dyn PacketHandler>> {
        let previous = self.update(|table| table.handlers.insert(opcode, handler));
        if previous.is_some() {
            tracing::warn!(opcode, "packet handler replaced");
        }
        previous
    }

    /// 注册操作码前置处理器，返回被替换的旧实例。
    pub fn pre_subscribe(
        &self,
        opcode: Opcode,
        handler: Arc<dyn PacketPreHandler>,
    ) -> Option<Arc<dyn PacketPreHandler>> {
        let previous = self.update(|table| table.pre_handlers.insert(opcode, handler));
        if previous.is_some() {
            tracing::warn!(opcode, "packet pre-handler replaced");
        }
        previous
    }

    /// 注册统一前置处理器，返回被替换的旧实例。
    pub fn unify_pre_subscribe(
        &self,
        handler: Arc<dyn PacketPreHandler>,
    ) -> Option<Arc<dyn PacketPreHandler>> {
        let previous = self.update(|table| table.unify.replace(handler));
        if previous.is_some() {
            tracing::warn!("unify pre-handler replaced");
        }
        previous
    }

    pub fn has_handler(&self, opcode: Opcode) -> bool {
        self.table.load().handlers.contains_key(&opcode)
    }

    /// 分发一个刚完成分帧的数据包。
    pub fn dispatch(
        &self,
        raw: Packet,
        full_stack: bool,
        coders: &CoderRegistry,
    ) -> DispatchOutcome {
        let table = self.table.load();

        if let Some(pre) = table.pre_handlers.get(&raw.opcode)
            && !pre.pre_handle(&raw)
        {
            return DispatchOutcome::Vetoed(VetoStage::Pre);
        }
        if full_stack
            && let Some(unify) = table.unify.as_ref()
            && !unify.pre_handle(&raw)
        {
            return DispatchOutcome::Vetoed(VetoStage::Unify);
        }

        let opcode = raw.opcode;
        let payload = match coders.decode(&raw) {
            Ok(payload) => payload,
            Err(CodecError::CoderNotFound(opcode)) => return DispatchOutcome::CoderMissing(opcode),
            Err(error) => return DispatchOutcome::DecodeFailed { opcode, error },
        };
        let packet = raw.with_payload(payload);

        match table.handlers.get(&opcode) {
            Some(handler) => {
                handler.handle(&packet);
                DispatchOutcome::Handled
            }
            None => DispatchOutcome::Unhandled(packet),
        }
    }

    /// 清空全部注册，服务销毁时用于打断处理器与服务句柄之间的引用环。
    pub(crate) fn clear(&self) {
        let _guard = self.write_lock.lock();
        self.table.store(Arc::new(DispatchTable::default()));
    }

    fn update<R>(&self, apply: impl FnOnce(&mut DispatchTable) -> R) -> R {
        let _guard = self.write_lock.lock();
        let mut table = DispatchTable::clone(&self.table.load());
        let result = apply(&mut table);
        self.table.store(Arc::new(table));
        result
    }
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let table = self.table.load();
        f.debug_struct("Dispatcher")
            .field("handlers", &table.handlers.len())
            .field("pre_handlers", &table.pre_handlers.len())
            .field("unify", &table.unify.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::UnknownOpcodePolicy;
    use crate::packet::SessionId;
    use bytes::Bytes;
    use tracing_test::traced_test;

    fn packet(opcode: Opcode) -> Packet {
        Packet::new(SessionId::new(1), opcode, 0, Bytes::from_static(b"raw"))
    }

    fn recorder() -> (Arc<Mutex<Vec<&'static str>>>, impl Fn(&'static str) + Clone) {
        let log = Arc::new(Mutex::new(Vec::new()));
        let sink = log.clone();
        (log, move |event| sink.lock().push(event))
    }

    #[test]
    fn pre_handler_runs_before_unify_and_can_veto() {
        let dispatcher = Dispatcher::new();
        let coders = CoderRegistry::new(UnknownOpcodePolicy::PassThrough);
        let (log, record) = recorder();

        let r = record.clone();
        dispatcher.pre_subscribe(
            7,
            Arc::new(move |_: &Packet| {
                r("pre");
                false
            }),
        );
        let r = record.clone();
        dispatcher.unify_pre_subscribe(Arc::new(move |_: &Packet| {
            r("unify");
            true
        }));
        let r = record.clone();
        dispatcher.subscribe(7, Arc::new(move |_: &Packet| r("handler")));

        let outcome = dispatcher.dispatch(packet(7), true, &coders);
        assert_eq!(outcome, DispatchOutcome::Vetoed(VetoStage::Pre));
        assert_eq!(*log.lock(), vec!["pre"]);
    }

    #[test]
    fn unify_is_skipped_without_full_stack() {
        let dispatcher = Dispatcher::new();
        let coders = CoderRegistry::new(UnknownOpcodePolicy::PassThrough);
        let (log, record) = recorder();

        let r = record.clone();
        dispatcher.unify_pre_subscribe(Arc::new(move |_: &Packet| {
            r("unify");
            false
        }));
        let r = record.clone();
        dispatcher.subscribe(3, Arc::new(move |_: &Packet| r("handler")));

        assert_eq!(
            dispatcher.dispatch(packet(3), false, &coders),
            DispatchOutcome::Handled
        );
        assert_eq!(
            dispatcher.dispatch(packet(3), true, &coders),
            DispatchOutcome::Vetoed(VetoStage::Unify)
        );
        assert_eq!(*log.lock(), vec!["handler", "unify"]);
    }

    #[test]
    fn missing_handler_returns_decoded_packet() {
        let dispatcher = Dispatcher::new();
        let coders = CoderRegistry::new(UnknownOpcodePolicy::PassThrough);
        match dispatcher.dispatch(packet(11), true, &coders) {
            DispatchOutcome::Unhandled(p) => assert_eq!(p.payload, Bytes::from_static(b"raw")),
            other => panic!("unexpected outcome: {other:?}"),
        }

        let strict = CoderRegistry::new(UnknownOpcodePolicy::Reject);
        assert_eq!(
            dispatcher.dispatch(packet(11), true, &strict),
            DispatchOutcome::CoderMissing(11)
        );
    }

    #[traced_test]
    #[test]
    fn replacement_is_returned_and_logged() {
        let dispatcher = Dispatcher::new();
        assert!(dispatcher.subscribe(1, Arc::new(|_: &Packet| {})).is_none());
        assert!(dispatcher.subscribe(1, Arc::new(|_: &Packet| {})).is_some());
        assert!(logs_contain("packet handler replaced"));
    }
}
