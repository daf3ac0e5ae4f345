//! 数据包与标识类型。

use std::fmt;

use bytes::Bytes;

/// 操作码：标识数据包的应用层类型，用于编解码器与处理器路由。合法值为非负整数。
pub type Opcode = i32;

/// 数据包状态字段，随帧透传，语义由业务定义。
pub type Status = i32;

/// 会话标识。
///
/// # 教案式说明
/// - **意图 (Why)**：以新类型包装整数，避免与操作码、状态码等整数参数混用；
/// - **契约 (What)**：由服务内的单调分配器从 `1` 开始发放，服务存活期间绝不复用。
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SessionId(u64);

impl SessionId {
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }

    pub const fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// 监听器标识，与会话编号互不占用。
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ListenerId(u64);

impl ListenerId {
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }

    pub const fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for ListenerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// 预编码数据包的句柄，由 [`ServiceHandle::pre_encode`](crate::ServiceHandle::pre_encode) 发放。
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct PacketId(u64);

impl PacketId {
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }

    pub const fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for PacketId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// 应用层数据包。
///
/// # 教案式说明
/// - **意图 (Why)**：作为编解码器、分发器与 Facade 之间传递的唯一载体；
/// - **契约 (What)**：
///   - `payload` 使用 [`Bytes`]，克隆为引用计数操作，一旦交给编解码器即视为不可变；
///   - `packet_id` 仅在通过预编码缓存重发时携带；
///   - 入站方向上 `session_id` 为来源会话，出站方向上为目标会话。
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Packet {
    pub session_id: SessionId,
    pub opcode: Opcode,
    pub status: Status,
    pub payload: Bytes,
    pub packet_id: Option<PacketId>,
}

impl Packet {
    pub fn new(
        session_id: SessionId,
        opcode: Opcode,
        status: Status,
        payload: impl Into<Bytes>,
    ) -> Self {
        Self {
            session_id,
            opcode,
            status,
            payload: payload.into(),
            packet_id: None,
        }
    }

    /// 以新的负载替换原负载，其余字段保持不变。
    pub fn with_payload(mut self, payload: Bytes) -> Self {
        self.payload = payload;
        self
    }

    pub fn with_packet_id(mut self, packet_id: PacketId) -> Self {
        self.packet_id = Some(packet_id);
        self
    }
}
