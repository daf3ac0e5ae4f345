//! # 服务配置
//!
//! ## 设计动机（Why）
//! - 将帧率、驱动模式、帧上限、超时与套接字选项外部化，部署时以 TOML 文件调参，
//!   运行时代码不再散落魔法数字；
//! - 所有字段均带默认值（`#[serde(default)]`），配置文件只需列出需要覆盖的键。
//!
//! ## 契约（What）
//! - [`ServiceConfig::from_toml_str`] / [`ServiceConfig::load`] 解析后立即调用
//!   [`ServiceConfig::validate`]，非法取值返回 `InvalidArgument`；
//! - 时长字段统一以毫秒整数表达，避免 TOML 中出现结构化时长。
//!
//! ## 示例
//! ```toml
//! name = "gate"
//! fps = 60
//! drive_mode = "push"
//! endian = "little"
//! unknown_opcode_policy = "reject"
//!
//! [tcp]
//! nodelay = true
//! keepalive_secs = 30
//! ```

use std::path::Path;
use std::time::Duration;

use serde::Deserialize;

use crate::error::{ServiceError, ServiceErrorKind};

/// 最小帧率。
pub const MIN_FPS: u32 = 1;
/// 最大帧率。
pub const MAX_FPS: u32 = 1000;
/// 默认帧率。
pub const DEFAULT_FPS: u32 = 200;
/// 默认单帧上限：1 MiB。
pub const DEFAULT_MAX_FRAME_SIZE: usize = 1024 * 1024;

/// 服务类型。
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServiceKind {
    /// 仅主动建连。
    Client,
    /// 可监听也可建连。
    Server,
}

/// 轮询器驱动模式。
///
/// - `Push`：每个轮询器拥有独立线程，按帧率自驱动；
/// - `Pull`：由宿主显式调用 [`ServiceHandle::on_svc`](crate::ServiceHandle::on_svc) 推进。
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DriveMode {
    #[default]
    Push,
    Pull,
}

/// 默认帧编解码器使用的字节序。
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Endian {
    #[default]
    Big,
    Little,
}

/// 未注册操作码的编解码策略。
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnknownOpcodePolicy {
    /// 原样透传负载。
    #[default]
    PassThrough,
    /// 拒绝：发送返回 `EncodeFailed`，接收上报“找不到解码器”并丢弃数据包。
    Reject,
}

/// TCP 套接字选项，建连与接受连接后统一应用。
#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct TcpSocketConfig {
    pub nodelay: bool,
    /// `None` 表示不开启 TCP keepalive。
    pub keepalive_secs: Option<u64>,
    /// 监听套接字是否设置 `SO_REUSEADDR`。
    pub reuse_address: bool,
}

impl Default for TcpSocketConfig {
    fn default() -> Self {
        Self {
            nodelay: true,
            keepalive_secs: None,
            reuse_address: true,
        }
    }
}

impl TcpSocketConfig {
    pub fn keepalive(&self) -> Option<Duration> {
        self.keepalive_secs.map(Duration::from_secs)
    }
}

/// 服务运行时配置。
///
/// # 教案式说明
/// - **意图 (Why)**：集中描述一个服务实例的可调参数，创建服务时一次性交付；
/// - **契约 (What)**：
///   - `fps` ∈ [`MIN_FPS`, `MAX_FPS`]；
///   - `max_frame_size` 至少容纳默认帧头；
///   - `read_chunk_size`、`max_read_per_tick` 必须为正，且后者不小于前者；
/// - **风险 (Trade-offs)**：`max_read_per_tick` 限制单个会话在一帧内的读取量，
///   过小会拉长大包的接收延迟，过大则可能让单个会话拖慢同一轮询器上的其他会话。
#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct ServiceConfig {
    pub name: String,
    pub fps: u32,
    pub drive_mode: DriveMode,
    pub max_frame_size: usize,
    pub endian: Endian,
    pub unknown_opcode_policy: UnknownOpcodePolicy,
    pub connect_timeout_ms: u64,
    pub close_grace_ms: u64,
    pub read_chunk_size: usize,
    pub max_read_per_tick: usize,
    pub tcp: TcpSocketConfig,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            name: "spark-comm".to_owned(),
            fps: DEFAULT_FPS,
            drive_mode: DriveMode::Push,
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
            endian: Endian::Big,
            unknown_opcode_policy: UnknownOpcodePolicy::PassThrough,
            connect_timeout_ms: 5_000,
            close_grace_ms: 1_000,
            read_chunk_size: 16 * 1024,
            max_read_per_tick: 1024 * 1024,
            tcp: TcpSocketConfig::default(),
        }
    }
}

impl ServiceConfig {
    /// 从 TOML 文本解析并校验配置。
    pub fn from_toml_str(text: &str) -> Result<Self, ServiceError> {
        let config: ServiceConfig = toml::from_str(text).map_err(|err| {
            ServiceError::new(
                ServiceErrorKind::InvalidArgument,
                format!("parse service config failed: {err}"),
            )
            .with_source(err)
        })?;
        config.validate()?;
        Ok(config)
    }

    /// 从文件加载配置。
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ServiceError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|err| {
            ServiceError::new(
                ServiceErrorKind::InvalidArgument,
                format!("read service config `{}` failed: {err}", path.display()),
            )
            .with_source(err)
        })?;
        Self::from_toml_str(&text)
    }

    /// 校验取值范围。
    pub fn validate(&self) -> Result<(), ServiceError> {
        validate_fps(self.fps)?;
        if self.max_frame_size < crate::codec::frame::HEADER_LEN {
            return Err(ServiceError::invalid_argument(format!(
                "max_frame_size {} is smaller than frame header {}",
                self.max_frame_size,
                crate::codec::frame::HEADER_LEN
            )));
        }
        if self.read_chunk_size == 0 || self.max_read_per_tick < self.read_chunk_size {
            return Err(ServiceError::invalid_argument(format!(
                "read_chunk_size {} / max_read_per_tick {} are inconsistent",
                self.read_chunk_size, self.max_read_per_tick
            )));
        }
        if self.connect_timeout_ms == 0 {
            return Err(ServiceError::invalid_argument(
                "connect_timeout_ms must be positive",
            ));
        }
        Ok(())
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn close_grace(&self) -> Duration {
        Duration::from_millis(self.close_grace_ms)
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_fps(mut self, fps: u32) -> Self {
        self.fps = fps;
        self
    }

    pub fn with_drive_mode(mut self, mode: DriveMode) -> Self {
        self.drive_mode = mode;
        self
    }

    pub fn with_endian(mut self, endian: Endian) -> Self {
        self.endian = endian;
        self
    }

    pub fn with_unknown_opcode_policy(mut self, policy: UnknownOpcodePolicy) -> Self {
        self.unknown_opcode_policy = policy;
        self
    }

    pub fn with_max_frame_size(mut self, max_frame_size: usize) -> Self {
        self.max_frame_size = max_frame_size;
        self
    }

    pub fn with_close_grace(mut self, grace: Duration) -> Self {
        self.close_grace_ms = grace.as_millis() as u64;
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout_ms = timeout.as_millis() as u64;
        self
    }
}

pub(crate) fn validate_fps(fps: u32) -> Result<(), ServiceError> {
    if !(MIN_FPS..=MAX_FPS).contains(&fps) {
        return Err(ServiceError::invalid_argument(format!(
            "fps {fps} out of range [{MIN_FPS}, {MAX_FPS}]"
        )));
    }
    Ok(())
}

/// 帧率对应的帧间隔。
pub(crate) fn frame_interval(fps: u32) -> Duration {
    Duration::from_micros(1_000_000 / u64::from(fps.max(MIN_FPS)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_document_yields_defaults() {
        let config = ServiceConfig::from_toml_str("").expect("empty config");
        assert_eq!(config, ServiceConfig::default());
    }

    #[test]
    fn overrides_are_applied() {
        let config = ServiceConfig::from_toml_str(
            r#"
            name = "gate"
            fps = 30
            drive_mode = "pull"
            endian = "little"
            unknown_opcode_policy = "reject"
            close_grace_ms = 250

            [tcp]
            nodelay = false
            keepalive_secs = 15
            "#,
        )
        .expect("valid config");
        assert_eq!(config.name, "gate");
        assert_eq!(config.fps, 30);
        assert_eq!(config.drive_mode, DriveMode::Pull);
        assert_eq!(config.endian, Endian::Little);
        assert_eq!(config.unknown_opcode_policy, UnknownOpcodePolicy::Reject);
        assert_eq!(config.close_grace(), Duration::from_millis(250));
        assert!(!config.tcp.nodelay);
        assert_eq!(config.tcp.keepalive(), Some(Duration::from_secs(15)));
        assert!(config.tcp.reuse_address, "未覆盖的嵌套字段保持默认值");
    }

    #[test]
    fn out_of_range_values_are_rejected() {
        let err = ServiceConfig::from_toml_str("fps = 0").expect_err("fps 0");
        assert_eq!(err.kind(), ServiceErrorKind::InvalidArgument);

        let err = ServiceConfig::from_toml_str("max_frame_size = 4").expect_err("tiny frame");
        assert_eq!(err.kind(), ServiceErrorKind::InvalidArgument);

        let err = ServiceConfig::from_toml_str("drive_mode = \"sideways\"").expect_err("bad enum");
        assert_eq!(err.kind(), ServiceErrorKind::InvalidArgument);
    }

    #[test]
    fn frame_interval_follows_fps() {
        assert_eq!(frame_interval(1), Duration::from_secs(1));
        assert_eq!(frame_interval(200), Duration::from_millis(5));
        assert_eq!(frame_interval(30), Duration::from_micros(33_333));
    }
}
