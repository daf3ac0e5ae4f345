//! # transport 模块
//!
//! ## 设计动机（Why）
//! - 汇总套接字层的全部细节：地址解析、监听绑定、同步/异步建连、套接字选项；
//! - 监听与异步建连运行在服务自带的 Tokio 运行时上，建连完成后把 `std` 套接字
//!   移交给轮询器，以非阻塞方式逐帧读写。
//!
//! ## 契约（What）
//! - 所有 IO 错误按操作种类（bind/accept/connect/configure）映射为 [`ServiceError`]；
//! - 后台任务只持有服务的弱引用，服务销毁后任务自然退出。

use std::net::{IpAddr, SocketAddr, TcpListener as StdTcpListener, TcpStream as StdTcpStream};
use std::sync::Weak;
use std::time::Duration;

use socket2::{Domain, Protocol, SockRef, Socket, TcpKeepalive, Type};
use tokio::net::{TcpListener, TcpStream};

use crate::config::TcpSocketConfig;
use crate::error::{self, ServiceError, map_io_error, timeout_error};
use crate::facade::{ConnToken, SessionOrigin};
use crate::packet::ListenerId;
use crate::service::ServiceShared;

/// 接受连接失败后的退避时长，避免文件描述符耗尽时空转。
const ACCEPT_BACKOFF: Duration = Duration::from_millis(50);

const LISTEN_BACKLOG: i32 = 1024;

/// 解析 `ip` + `port`。
pub(crate) fn parse_addr(ip: &str, port: u16) -> Result<SocketAddr, ServiceError> {
    let ip: IpAddr = ip
        .trim()
        .parse()
        .map_err(|_| ServiceError::invalid_argument(format!("invalid ip address `{ip}`")))?;
    Ok(SocketAddr::new(ip, port))
}

/// 同步绑定监听套接字。
pub(crate) fn bind_listener(
    addr: SocketAddr,
    tcp: &TcpSocketConfig,
) -> Result<StdTcpListener, ServiceError> {
    let bind = |err| map_io_error(error::BIND, err);
    let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))
        .map_err(bind)?;
    if tcp.reuse_address {
        socket.set_reuse_address(true).map_err(bind)?;
    }
    socket.bind(&addr.into()).map_err(bind)?;
    socket.listen(LISTEN_BACKLOG).map_err(bind)?;
    socket.set_nonblocking(true).map_err(bind)?;
    Ok(socket.into())
}

/// 同步建连，超时返回 `Timeout`。
pub(crate) fn connect_blocking(
    addr: SocketAddr,
    timeout: Duration,
) -> Result<StdTcpStream, ServiceError> {
    let connect = |err| map_io_error(error::CONNECT, err);
    let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))
        .map_err(connect)?;
    socket.connect_timeout(&addr.into(), timeout).map_err(|err| {
        if err.kind() == std::io::ErrorKind::WouldBlock {
            timeout_error(error::CONNECT)
        } else {
            connect(err)
        }
    })?;
    Ok(socket.into())
}

/// 应用套接字选项并切换为非阻塞模式。
pub(crate) fn configure_stream(
    stream: &StdTcpStream,
    tcp: &TcpSocketConfig,
) -> Result<(), ServiceError> {
    let configure = |err| map_io_error(error::CONFIGURE, err);
    stream.set_nodelay(tcp.nodelay).map_err(configure)?;
    if let Some(idle) = tcp.keepalive() {
        SockRef::from(stream)
            .set_tcp_keepalive(&TcpKeepalive::new().with_time(idle))
            .map_err(configure)?;
    }
    stream.set_nonblocking(true).map_err(configure)
}

/// 监听器的接受循环。
pub(crate) async fn accept_loop(
    listener: StdTcpListener,
    listener_id: ListenerId,
    service: Weak<ServiceShared>,
) {
    let listener = match TcpListener::from_std(listener) {
        Ok(listener) => listener,
        Err(err) => {
            let err = map_io_error(error::ACCEPT, err);
            tracing::error!(listener = listener_id.get(), code = err.code(), "{err}");
            return;
        }
    };

    loop {
        match listener.accept().await {
            Ok((stream, peer)) => {
                let Some(shared) = service.upgrade() else {
                    break;
                };
                let adopted = stream
                    .into_std()
                    .map_err(|err| map_io_error(error::ACCEPT, err))
                    .and_then(|stream| {
                        shared.adopt_stream(stream, SessionOrigin::Accepted {
                            listener: listener_id,
                        })
                    });
                match adopted {
                    Ok(session_id) => tracing::debug!(
                        listener = listener_id.get(),
                        session_id = session_id.get(),
                        %peer,
                        "connection accepted"
                    ),
                    Err(err) => tracing::warn!(
                        listener = listener_id.get(),
                        %peer,
                        code = err.code(),
                        "drop accepted connection: {err}"
                    ),
                }
            }
            Err(err) => {
                let err = map_io_error(error::ACCEPT, err);
                tracing::warn!(listener = listener_id.get(), code = err.code(), "{err}");
                tokio::time::sleep(ACCEPT_BACKOFF).await;
            }
        }
    }
}

/// 异步建连任务，结果投递到轮询器。
pub(crate) async fn connect_async(
    addr: SocketAddr,
    timeout: Duration,
    token: ConnToken,
    service: Weak<ServiceShared>,
) {
    let connected = match tokio::time::timeout(timeout, TcpStream::connect(addr)).await {
        Ok(Ok(stream)) => stream
            .into_std()
            .map_err(|err| map_io_error(error::CONNECT, err)),
        Ok(Err(err)) => Err(map_io_error(error::CONNECT, err)),
        Err(_) => Err(timeout_error(error::CONNECT)),
    };

    let Some(service) = service.upgrade() else {
        return;
    };
    let outcome = connected.and_then(|stream| {
        service.adopt_stream(stream, SessionOrigin::AsyncConnected { token })
    });
    if let Err(err) = outcome {
        service.deliver_async_failure(token, addr, err);
    }
}
