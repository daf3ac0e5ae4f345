//! # error 模块说明
//!
//! ## 角色定位（Why）
//! - 为服务运行时对外暴露的全部失败路径提供一个封闭的错误分类 [`ServiceErrorKind`]，
//!   让宿主（包括跨语言绑定）可以仅凭返回码完成处置，不依赖异常机制；
//! - 将底层 `std::io::Error` 按“操作种类”映射为稳定错误码，沿用传输层
//!   `OperationKind` 的做法，便于日志与告警按码聚合。
//!
//! ## 设计要求（What）
//! - 所有错误类型派生 `thiserror::Error`，可直接交给 `anyhow` 等上层框架；
//! - `code()` 返回 `spark.comm.<kind>` 形式的稳定字符串，`status()` 返回整数状态码，
//!   `0` 保留给成功；
//! - 轮询线程内部的协议/IO 错误不会以 `Err` 形式冒泡，而是转换为
//!   [`ProtoReport`](crate::facade::ProtoReport) 事件。

use std::borrow::Cow;
use std::fmt;
use std::io;

use crate::packet::{Opcode, SessionId};

/// 服务错误的封闭分类。
///
/// # 教案式说明
/// - **意图 (Why)**：控制面调用（Start/Stop/注册/发送）必须以返回码形式告知失败原因；
///   分类固定后，宿主可以安全地 `match` 全部分支。
/// - **契约 (What)**：
///   - `DecodeFailed` 与 `HandlerRegistrationConflict` 属于可恢复错误，通常只出现在上报事件里；
///   - `AllocationFailed` 为致命错误，仅在创建服务时出现；
///   - `Timeout` 仅由同步 `connect` 返回。
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ServiceErrorKind {
    /// 服务尚未启动（或已经停止）。
    NotStarted,
    /// 服务已启动，或已经走完生命周期。
    AlreadyStarted,
    /// 非法参数：地址、端口、操作码、轮询器数量等。
    InvalidArgument,
    /// 目标会话不存在。
    SessionNotFound,
    /// 目标会话正在关闭。
    SessionClosing,
    /// 编码失败。
    EncodeFailed,
    /// 解码失败，流会被重新同步。
    DecodeFailed,
    /// 注册冲突，非致命。
    HandlerRegistrationConflict,
    /// 资源分配失败，服务无法创建。
    AllocationFailed,
    /// 同步建连超时。
    Timeout,
    /// Facade 钩子返回了错误。
    FacadeFailed,
    /// 绑定、建连等套接字操作失败。
    Io,
}

impl ServiceErrorKind {
    /// 稳定错误码。
    pub const fn code(self) -> &'static str {
        match self {
            ServiceErrorKind::NotStarted => "spark.comm.not_started",
            ServiceErrorKind::AlreadyStarted => "spark.comm.already_started",
            ServiceErrorKind::InvalidArgument => "spark.comm.invalid_argument",
            ServiceErrorKind::SessionNotFound => "spark.comm.session_not_found",
            ServiceErrorKind::SessionClosing => "spark.comm.session_closing",
            ServiceErrorKind::EncodeFailed => "spark.comm.encode_failed",
            ServiceErrorKind::DecodeFailed => "spark.comm.decode_failed",
            ServiceErrorKind::HandlerRegistrationConflict => "spark.comm.registration_conflict",
            ServiceErrorKind::AllocationFailed => "spark.comm.allocation_failed",
            ServiceErrorKind::Timeout => "spark.comm.timeout",
            ServiceErrorKind::FacadeFailed => "spark.comm.facade_failed",
            ServiceErrorKind::Io => "spark.comm.io",
        }
    }

    /// 面向宿主的整数状态码，`0` 保留给成功。
    pub const fn status(self) -> i32 {
        match self {
            ServiceErrorKind::NotStarted => 1,
            ServiceErrorKind::AlreadyStarted => 2,
            ServiceErrorKind::InvalidArgument => 3,
            ServiceErrorKind::SessionNotFound => 4,
            ServiceErrorKind::SessionClosing => 5,
            ServiceErrorKind::EncodeFailed => 6,
            ServiceErrorKind::DecodeFailed => 7,
            ServiceErrorKind::HandlerRegistrationConflict => 8,
            ServiceErrorKind::AllocationFailed => 9,
            ServiceErrorKind::Timeout => 10,
            ServiceErrorKind::FacadeFailed => 11,
            ServiceErrorKind::Io => 12,
        }
    }

    /// 是否属于致命错误。
    pub const fn is_fatal(self) -> bool {
        matches!(self, ServiceErrorKind::AllocationFailed)
    }
}

impl fmt::Display for ServiceErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.code())
    }
}

/// 服务运行时统一错误。
///
/// # 教案式说明
/// - **意图 (Why)**：与 `CoreError` 一样承载“稳定分类 + 人类可读消息 + 可选底层原因”，
///   但分类收敛为 [`ServiceErrorKind`]，便于以返回码跨越语言边界；
/// - **契约 (What)**：`Send + Sync + 'static`，可以安全跨线程传播；
///   `source()` 暴露底层 IO 或编解码错误；
/// - **风险 (Trade-offs)**：消息使用 `Cow<'static, str>`，静态文案零分配，动态上下文需一次堆分配。
#[derive(Debug, thiserror::Error)]
#[error("[{kind}] {message}")]
pub struct ServiceError {
    kind: ServiceErrorKind,
    message: Cow<'static, str>,
    #[source]
    source: Option<Box<dyn std::error::Error + Send + Sync + 'static>>,
}

impl ServiceError {
    /// 构造错误。
    pub fn new(kind: ServiceErrorKind, message: impl Into<Cow<'static, str>>) -> Self {
        Self {
            kind,
            message: message.into(),
            source: None,
        }
    }

    /// 附带底层原因。
    pub fn with_source(mut self, source: impl std::error::Error + Send + Sync + 'static) -> Self {
        self.source = Some(Box::new(source));
        self
    }

    pub fn kind(&self) -> ServiceErrorKind {
        self.kind
    }

    pub fn code(&self) -> &'static str {
        self.kind.code()
    }

    pub fn status(&self) -> i32 {
        self.kind.status()
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub(crate) fn not_started() -> Self {
        Self::new(ServiceErrorKind::NotStarted, "service is not started")
    }

    pub(crate) fn invalid_argument(message: impl Into<Cow<'static, str>>) -> Self {
        Self::new(ServiceErrorKind::InvalidArgument, message)
    }

    pub(crate) fn session_not_found(session_id: SessionId) -> Self {
        Self::new(
            ServiceErrorKind::SessionNotFound,
            format!("session {session_id} not found"),
        )
    }

    pub(crate) fn session_closing(session_id: SessionId) -> Self {
        Self::new(
            ServiceErrorKind::SessionClosing,
            format!("session {session_id} is closing"),
        )
    }

    pub(crate) fn encode_failed(opcode: Opcode, error: CodecError) -> Self {
        Self::new(
            ServiceErrorKind::EncodeFailed,
            format!("encode opcode {opcode} failed: {error}"),
        )
        .with_source(error)
    }

    pub(crate) fn allocation_failed(what: &'static str, error: io::Error) -> Self {
        Self::new(
            ServiceErrorKind::AllocationFailed,
            format!("allocate {what} failed: {error}"),
        )
        .with_source(error)
    }
}

/// 编解码阶段的错误。
///
/// - **契约 (What)**：帧编解码器与按操作码注册的 [`PacketCoder`](crate::codec::PacketCoder)
///   都返回该类型；进入轮询线程后会被转换为 `DecodeFailed` 上报，进入发送路径则转换为
///   `EncodeFailed` 返回给调用方。
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum CodecError {
    /// 帧长度超出配置上限。
    #[error("frame length {len} exceeds limit {limit}")]
    FrameTooLarge { len: usize, limit: usize },
    /// 帧头无法解析。
    #[error("malformed frame header: {0}")]
    MalformedHeader(String),
    /// `Reject` 策略下未找到操作码对应的编解码器。
    #[error("no coder registered for opcode {0}")]
    CoderNotFound(Opcode),
    /// 宿主编解码器报告的失败。
    #[error("coder for opcode {opcode} failed: {reason}")]
    Coder { opcode: Opcode, reason: String },
}

impl CodecError {
    /// 供宿主实现 [`PacketCoder`](crate::codec::PacketCoder) 时构造失败原因。
    pub fn coder(opcode: Opcode, reason: impl Into<String>) -> Self {
        CodecError::Coder {
            opcode,
            reason: reason.into(),
        }
    }
}

/// Facade 钩子返回的错误。
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
#[error("{message}")]
pub struct FacadeError {
    message: Cow<'static, str>,
}

impl FacadeError {
    pub fn new(message: impl Into<Cow<'static, str>>) -> Self {
        Self {
            message: message.into(),
        }
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}

/// 描述一次底层套接字操作对应的默认文案。
#[derive(Clone, Copy, Debug)]
pub(crate) struct OperationKind {
    pub message: &'static str,
}

pub(crate) const BIND: OperationKind = OperationKind { message: "tcp bind" };
pub(crate) const ACCEPT: OperationKind = OperationKind {
    message: "tcp accept",
};
pub(crate) const CONNECT: OperationKind = OperationKind {
    message: "tcp connect",
};
pub(crate) const READ: OperationKind = OperationKind { message: "tcp read" };
pub(crate) const WRITE: OperationKind = OperationKind {
    message: "tcp write",
};
pub(crate) const CONFIGURE: OperationKind = OperationKind {
    message: "tcp configure",
};

/// 将 IO 错误映射为服务错误；超时单独归类为 [`ServiceErrorKind::Timeout`]。
pub(crate) fn map_io_error(kind: OperationKind, error: io::Error) -> ServiceError {
    let category = match error.kind() {
        io::ErrorKind::TimedOut => ServiceErrorKind::Timeout,
        _ => ServiceErrorKind::Io,
    };
    ServiceError::new(category, format!("{}: {}", kind.message, error)).with_source(error)
}

/// 构造超时错误。
pub(crate) fn timeout_error(kind: OperationKind) -> ServiceError {
    ServiceError::new(
        ServiceErrorKind::Timeout,
        format!("{} timed out", kind.message),
    )
}
