#![doc = r#"
# spark-comm

## 设计动机（Why）
- **定位**：多会话、多协议的 TCP 通信服务运行时：监听、同步/异步建连、单播、组播、广播，
  以及基于 Facade 的生命周期钩子；
- **架构角色**：宿主（原生应用或跨语言绑定）只与 [`Service`] / [`ServiceHandle`] 交互，
  通过实现 [`Facade`]、[`FrameCodec`]、[`PacketCoder`] 与处理器 trait 注入业务逻辑；
- **设计理念**：会话归属单一轮询器，同一会话的读、分帧、分发、写出始终在同一执行上下文中完成；
  控制面调用可来自任意线程。

## 核心契约（What）
- 服务状态 `Created → Started → Stopped` 单调前进；
- 会话编号从 `1` 单调发放、绝不复用；每个会话恰好触发一次 `on_session_create` 与
  `on_session_destroy`，且顺序固定；
- 入站数据包按“前置处理器 → 统一前置处理器 → 解码 → 处理器 / `on_unhandled_packet`”
  的固定顺序处理；
- 控制面错误以 [`ServiceError`] 返回，轮询线程内的协议与 IO 错误以 [`ProtoReport`] 上报。

## 实现策略（How）
- **驱动**：`Push` 模式下每个轮询器一个线程，按帧率运行；`Pull` 模式由宿主调用
  [`ServiceHandle::on_svc`] 推进；
- **IO**：监听与异步建连运行在服务自带的 Tokio 运行时上，建连后的 `std` 套接字以非阻塞方式
  交给轮询器逐帧读写；
- **注册表**：分发表与编解码表使用 `ArcSwap` 整表替换，会话表使用 `DashMap`。

## 风险与考量（Trade-offs）
- 处理器与 Facade 钩子运行在轮询线程上，阻塞会拖慢同一轮询器上的全部会话；
- 出站队列不设上限，背压需由宿主基于业务协议实现。
"#]

pub mod codec;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod facade;
pub mod packet;
mod poller;
mod service;
mod session;
mod transport;

pub use codec::{
    CoderRegistry, DecodeFailure, DecodeOutcome, FrameCodec, LengthPrefixedCodec, PacketCoder,
};
pub use config::{
    DriveMode, Endian, ServiceConfig, ServiceKind, TcpSocketConfig, UnknownOpcodePolicy,
};
pub use dispatch::{DispatchOutcome, Dispatcher, PacketHandler, PacketPreHandler, VetoStage};
pub use error::{CodecError, FacadeError, ServiceError, ServiceErrorKind};
pub use facade::{
    AsyncConnResult, ConnFailure, ConnToken, DestroyReason, Facade, FacadeRegistry, Initiator,
    ProtoReport, ReportLayer, ReportLevel, SessionDestroyInfo, SessionInfo, SessionOrigin,
};
pub use packet::{ListenerId, Opcode, Packet, PacketId, SessionId, Status};
pub use service::{
    ListenHandle, MulticastReport, Service, ServiceBuilder, ServiceHandle, ServiceState,
};
pub use session::SessionState;

/// 常用类型的集中导出。
pub mod prelude {
    pub use crate::{
        DriveMode, Facade, FacadeError, Packet, Service, ServiceConfig, ServiceError,
        ServiceErrorKind, ServiceHandle, ServiceKind, SessionId,
    };
}
