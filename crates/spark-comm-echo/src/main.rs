//! spark-comm-echo：最小回显服务。
//!
//! 启动一个 `Push` 模式的服务端，通过统一前置处理器把每个数据包原样写回对端，
//! 会话事件与协议报告经由 Facade 写入日志；收到 Ctrl-C 后优雅停止。

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use spark_comm::prelude::*;
use spark_comm::{ProtoReport, SessionDestroyInfo, SessionInfo};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "spark-comm-echo")]
#[command(version, about, long_about = None)]
struct Args {
    /// TOML 配置文件，缺省使用内置默认值
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// 监听地址
    #[arg(short, long, default_value = "0.0.0.0:9000")]
    listen: SocketAddr,

    /// 轮询器数量
    #[arg(short, long, default_value_t = 2)]
    pollers: usize,
}

/// 把会话事件写入日志。
struct LoggingFacade;

impl Facade for LoggingFacade {
    fn on_start(&self) -> Result<(), FacadeError> {
        tracing::info!("echo service ready");
        Ok(())
    }

    fn on_stop(&self) {
        tracing::info!("echo service stopping");
    }

    fn on_session_create(&self, info: &SessionInfo) {
        tracing::info!(
            session_id = info.session_id.get(),
            peer = %info.peer_addr,
            poller = info.poller,
            "session created"
        );
    }

    fn on_session_destroy(&self, info: &SessionDestroyInfo) {
        tracing::info!(
            session_id = info.info.session_id.get(),
            initiator = ?info.reason.initiator,
            reason = %info.reason.message,
            "session destroyed"
        );
    }

    fn on_proto_report(&self, report: &ProtoReport) {
        tracing::warn!(
            session_id = report.session_id.map(|id| id.get()),
            layer = ?report.layer,
            kind = ?report.kind,
            "{}",
            report.message
        );
    }
}

fn main() -> Result<()> {
    let args = Args::parse();
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = match &args.config {
        Some(path) => ServiceConfig::load(path)
            .with_context(|| format!("failed to load config from {}", path.display()))?,
        None => ServiceConfig::default().with_name("spark-comm-echo"),
    }
    .with_drive_mode(DriveMode::Push);

    let service = Service::builder(ServiceKind::Server)
        .config(config)
        .build()
        .context("failed to build service")?;
    service.register_facade(Arc::new(LoggingFacade))?;

    let echo = service.handle();
    service.unify_pre_subscribe(move |packet: &Packet| {
        if let Err(err) = echo.send_bytes(
            packet.session_id,
            packet.opcode,
            packet.payload.clone(),
            packet.status,
        ) {
            tracing::debug!(
                session_id = packet.session_id.get(),
                code = err.code(),
                "echo dropped: {err}"
            );
        }
        false
    })?;

    service.start(args.pollers).context("failed to start service")?;
    let listen = service
        .listen(&args.listen.ip().to_string(), args.listen.port())
        .with_context(|| format!("failed to listen on {}", args.listen))?;
    tracing::info!(addr = %listen.local_addr, "echo server listening, press Ctrl-C to stop");

    let signals = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("failed to build signal runtime")?;
    signals
        .block_on(tokio::signal::ctrl_c())
        .context("failed to wait for Ctrl-C")?;

    service.stop()?;
    Ok(())
}
