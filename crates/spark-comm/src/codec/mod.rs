//! # codec 模块
//!
//! ## 设计动机（Why）
//! - 编解码拆成两层：[`FrameCodec`] 负责字节流分帧（流式、可跨读边界恢复），
//!   [`PacketCoder`] 负责按操作码变换负载；前者每个服务一份，后者按操作码注册；
//! - 两层都以 trait 对象形式由宿主实现，替代原生绑定中的函数指针回调。
//!
//! ## 契约（What）
//! - `FrameCodec::decode` 成功时从缓冲头部切走一整帧（即“已消费字节数”），
//!   数据不足返回 [`DecodeOutcome::Incomplete`] 且不得修改缓冲；
//!   失败时通过 [`DecodeFailure::discard`] 告知需要丢弃多少字节以重新同步；
//! - [`CoderRegistry`] 在操作码首次被编码或解码后锁定其编解码器，禁止中途替换。

pub mod frame;

use std::collections::HashMap;
use std::sync::Arc;

use arc_swap::ArcSwap;
use bytes::{Bytes, BytesMut};
use dashmap::DashSet;
use parking_lot::Mutex;

use crate::config::UnknownOpcodePolicy;
use crate::error::{CodecError, ServiceError, ServiceErrorKind};
use crate::packet::{Opcode, Packet, SessionId};

pub use frame::LengthPrefixedCodec;

/// 一次分帧尝试的结果。
#[derive(Debug, PartialEq, Eq)]
pub enum DecodeOutcome {
    /// 解出一帧，对应字节已从缓冲中移除。
    Complete(Packet),
    /// 数据不足，等待下一次读取。
    Incomplete,
}

/// 分帧失败的描述。
///
/// - `opcode`：若帧头已解析出操作码则携带，便于上报；
/// - `discard`：需要从缓冲头部丢弃的字节数，调用方会将其截断到缓冲长度。
#[derive(Debug, PartialEq, Eq)]
pub struct DecodeFailure {
    pub error: CodecError,
    pub opcode: Option<Opcode>,
    pub discard: usize,
}

/// 传输帧编解码器。
///
/// # 教案式说明
/// - **意图 (Why)**：把“字节流 ↔ 数据包”的分帧规则从轮询器中剥离，宿主可替换为自定义线格式；
/// - **契约 (What)**：
///   - `encode` 将完整帧追加到 `dst`，不得写入半帧；
///   - `decode` 必须可恢复：同一帧无论一次到达还是拆成任意多段到达，结果一致；
///   - 实现需 `Send + Sync`，同一实例会被所有轮询线程与发送线程共享；
/// - **风险 (Trade-offs)**：`decode` 只看到连续缓冲，超大帧会在缓冲中累积直至完整，
///   因此实现应结合帧上限尽早拒绝。
pub trait FrameCodec: Send + Sync + 'static {
    fn encode(&self, packet: &Packet, dst: &mut BytesMut) -> Result<(), CodecError>;

    fn decode(
        &self,
        session_id: SessionId,
        src: &mut BytesMut,
    ) -> Result<DecodeOutcome, DecodeFailure>;
}

/// 按操作码注册的负载编解码器。
///
/// - `encode` 在发送线程上执行，返回写入线上的负载；
/// - `decode` 在轮询线程上执行，返回交给处理器的负载；
/// - 两者互逆：`decode(encode(p)) == p.payload`。
pub trait PacketCoder: Send + Sync + 'static {
    fn encode(&self, packet: &Packet) -> Result<Bytes, CodecError>;

    fn decode(&self, packet: &Packet) -> Result<Bytes, CodecError>;
}

type CoderTable = HashMap<Opcode, Arc<dyn PacketCoder>>;

/// 操作码 → 编解码器的注册表。
///
/// # 教案式说明
/// - **意图 (Why)**：读路径（每个数据包一次）无锁，写路径（注册）整表替换，
///   与 `DefaultRouter` 的 `ArcSwap` 热更新模式一致；
/// - **契约 (What)**：
///   - 未注册的操作码按 [`UnknownOpcodePolicy`] 处理；
///   - 操作码一旦被编码或解码使用过，`register` 返回 `HandlerRegistrationConflict`；
/// - **风险 (Trade-offs)**：“已使用”标记与注册之间没有全局锁，注册与首个数据包并发到达时，
///   首包可能仍使用旧编解码器。
pub struct CoderRegistry {
    coders: ArcSwap<CoderTable>,
    used: DashSet<Opcode>,
    policy: UnknownOpcodePolicy,
    write_lock: Mutex<()>,
}

impl CoderRegistry {
    pub fn new(policy: UnknownOpcodePolicy) -> Self {
        Self {
            coders: ArcSwap::from_pointee(CoderTable::new()),
            used: DashSet::new(),
            policy,
            write_lock: Mutex::new(()),
        }
    }

    pub fn policy(&self) -> UnknownOpcodePolicy {
        self.policy
    }

    /// 注册编解码器，返回被替换的旧实例。
    pub fn register(
        &self,
        opcode: Opcode,
        coder: Arc<dyn PacketCoder>,
    ) -> Result<Option<Arc<dyn PacketCoder>>, ServiceError> {
        let _guard = self.write_lock.lock();
        if self.used.contains(&opcode) {
            return Err(ServiceError::new(
                ServiceErrorKind::HandlerRegistrationConflict,
                format!("coder for opcode {opcode} is already in use and cannot be replaced"),
            ));
        }
        let mut table = CoderTable::clone(&self.coders.load());
        let previous = table.insert(opcode, coder);
        self.coders.store(Arc::new(table));
        Ok(previous)
    }

    pub fn contains(&self, opcode: Opcode) -> bool {
        self.coders.load().contains_key(&opcode)
    }

    pub fn is_locked(&self, opcode: Opcode) -> bool {
        self.used.contains(&opcode)
    }

    /// 出站：生成写入线上的负载。
    pub fn encode(&self, packet: &Packet) -> Result<Bytes, CodecError> {
        match self.lookup(packet.opcode) {
            Some(coder) => coder.encode(packet),
            None => self.fallback(packet),
        }
    }

    /// 入站：生成交给处理器的负载。
    pub fn decode(&self, packet: &Packet) -> Result<Bytes, CodecError> {
        match self.lookup(packet.opcode) {
            Some(coder) => coder.decode(packet),
            None => self.fallback(packet),
        }
    }

    pub(crate) fn clear(&self) {
        let _guard = self.write_lock.lock();
        self.coders.store(Arc::new(CoderTable::new()));
    }

    fn lookup(&self, opcode: Opcode) -> Option<Arc<dyn PacketCoder>> {
        let coder = self.coders.load().get(&opcode).cloned();
        if coder.is_some() && !self.used.contains(&opcode) {
            self.used.insert(opcode);
        }
        coder
    }

    fn fallback(&self, packet: &Packet) -> Result<Bytes, CodecError> {
        match self.policy {
            UnknownOpcodePolicy::PassThrough => Ok(packet.payload.clone()),
            UnknownOpcodePolicy::Reject => Err(CodecError::CoderNotFound(packet.opcode)),
        }
    }
}

impl std::fmt::Debug for CoderRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut opcodes: Vec<Opcode> = self.coders.load().keys().copied().collect();
        opcodes.sort_unstable();
        f.debug_struct("CoderRegistry")
            .field("opcodes", &opcodes)
            .field("policy", &self.policy)
            .finish()
    }
}
