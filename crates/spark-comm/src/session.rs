//! # session 模块
//!
//! ## 核心意图（Why）
//! - 会话拆成两半：[`SessionShared`] 放在全局会话表中，供任意线程查询状态、投递出站数据、
//!   请求关闭；[`Session`] 持有套接字与入站缓冲，只归属一个轮询器；
//! - 会话表沿用 `DashMap` 仓储的做法，创建、查询、回收均具备原子语义。
//!
//! ## 行为契约（What）
//! - 会话编号由 [`SessionIdAllocator`] 从 `1` 单调发放，服务存活期间绝不复用；
//! - 状态只前进：`Pending → Valid → Closing → Closed`（`Pending` 可直接进入 `Closing`）；
//! - 出站队列是加锁的 FIFO，唯一的消费者是拥有该会话的轮询器。
//!
//! ## 风险提示（Trade-offs）
//! - 出站队列不设上限，发送速度长期高于对端接收速度时内存会持续增长。

use std::collections::VecDeque;
use std::io::{self, Read, Write};
use std::net::{Shutdown, SocketAddr, TcpStream};
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, AtomicU64, Ordering};
use std::time::Instant;

use bytes::{Buf, Bytes, BytesMut};
use dashmap::DashMap;
use parking_lot::Mutex;

use crate::error::ServiceError;
use crate::facade::{DestroyReason, SessionInfo};
use crate::packet::SessionId;

/// 会话状态。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum SessionState {
    /// 已建连，尚未被轮询器接管。
    Pending = 0,
    Valid = 1,
    /// 已请求关闭，等待出站数据排空或宽限期到期。
    Closing = 2,
    Closed = 3,
}

impl SessionState {
    fn from_u8(raw: u8) -> Self {
        match raw {
            0 => SessionState::Pending,
            1 => SessionState::Valid,
            2 => SessionState::Closing,
            _ => SessionState::Closed,
        }
    }
}

/// 单调会话编号分配器。
#[derive(Debug)]
pub(crate) struct SessionIdAllocator {
    next: AtomicU64,
}

impl SessionIdAllocator {
    pub(crate) fn new() -> Self {
        Self {
            next: AtomicU64::new(1),
        }
    }

    pub(crate) fn allocate(&self) -> SessionId {
        SessionId::new(self.next.fetch_add(1, Ordering::Relaxed))
    }
}

#[derive(Debug)]
pub(crate) struct CloseRequest {
    pub reason: DestroyReason,
    pub deadline: Instant,
}

/// 会话中可跨线程访问的部分。
#[derive(Debug)]
pub(crate) struct SessionShared {
    id: SessionId,
    state: AtomicU8,
    outbound: Mutex<VecDeque<Bytes>>,
    close_request: Mutex<Option<CloseRequest>>,
}

impl SessionShared {
    pub(crate) fn new(id: SessionId) -> Self {
        Self {
            id,
            state: AtomicU8::new(SessionState::Pending as u8),
            outbound: Mutex::new(VecDeque::new()),
            close_request: Mutex::new(None),
        }
    }

    pub(crate) fn id(&self) -> SessionId {
        self.id
    }

    pub(crate) fn state(&self) -> SessionState {
        SessionState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// `Pending → Valid`；会话在接管前已被请求关闭时返回 `false`。
    pub(crate) fn activate(&self) -> bool {
        self.state
            .compare_exchange(
                SessionState::Pending as u8,
                SessionState::Valid as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }

    pub(crate) fn mark_closed(&self) {
        self.state
            .store(SessionState::Closed as u8, Ordering::Release);
    }

    /// 请求关闭，只有第一次请求生效。
    pub(crate) fn request_close(
        &self,
        reason: DestroyReason,
        deadline: Instant,
    ) -> Result<(), ServiceError> {
        let mut request = self.close_request.lock();
        match self.state() {
            SessionState::Pending | SessionState::Valid => {
                *request = Some(CloseRequest { reason, deadline });
                self.state
                    .store(SessionState::Closing as u8, Ordering::Release);
                Ok(())
            }
            SessionState::Closing => Err(ServiceError::session_closing(self.id)),
            SessionState::Closed => Err(ServiceError::session_not_found(self.id)),
        }
    }

    pub(crate) fn take_close_request(&self) -> Option<CloseRequest> {
        self.close_request.lock().take()
    }

    pub(crate) fn close_deadline(&self) -> Option<Instant> {
        self.close_request.lock().as_ref().map(|r| r.deadline)
    }

    /// 投递一段已编码的帧。
    pub(crate) fn enqueue(&self, frame: Bytes) -> Result<(), ServiceError> {
        match self.state() {
            SessionState::Pending | SessionState::Valid => {
                self.outbound.lock().push_back(frame);
                Ok(())
            }
            SessionState::Closing => Err(ServiceError::session_closing(self.id)),
            SessionState::Closed => Err(ServiceError::session_not_found(self.id)),
        }
    }

    fn drain_outbound(&self, into: &mut VecDeque<Bytes>) {
        let mut queue = self.outbound.lock();
        into.extend(queue.drain(..));
    }

    fn has_outbound(&self) -> bool {
        !self.outbound.lock().is_empty()
    }
}

/// 全局会话表：编号 → 共享会话。
#[derive(Debug, Default)]
pub(crate) struct SessionTable {
    sessions: DashMap<SessionId, Arc<SessionShared>>,
}

impl SessionTable {
    pub(crate) fn insert(&self, shared: Arc<SessionShared>) {
        self.sessions.insert(shared.id(), shared);
    }

    pub(crate) fn get(&self, id: SessionId) -> Option<Arc<SessionShared>> {
        self.sessions.get(&id).map(|entry| entry.value().clone())
    }

    pub(crate) fn remove(&self, id: SessionId) -> Option<Arc<SessionShared>> {
        self.sessions.remove(&id).map(|(_, shared)| shared)
    }

    /// 当前处于 `Valid` 的会话快照。
    pub(crate) fn valid_sessions(&self) -> Vec<Arc<SessionShared>> {
        self.sessions
            .iter()
            .filter(|entry| entry.value().state() == SessionState::Valid)
            .map(|entry| entry.value().clone())
            .collect()
    }

    pub(crate) fn len(&self) -> usize {
        self.sessions.len()
    }

    pub(crate) fn clear(&self) {
        self.sessions.clear();
    }
}

/// 单次读取的结果。
#[derive(Debug)]
pub(crate) enum ReadStatus {
    /// 连接仍然可用。
    Open,
    /// 对端关闭。
    Eof,
    Failed(io::Error),
}

/// 轮询器持有的会话。
#[derive(Debug)]
pub(crate) struct Session {
    shared: Arc<SessionShared>,
    stream: TcpStream,
    info: SessionInfo,
    inbound: BytesMut,
    /// `inbound[0]` 在入站字节流中的偏移。
    consumed: u64,
    writing: VecDeque<Bytes>,
}

impl Session {
    pub(crate) fn new(shared: Arc<SessionShared>, stream: TcpStream, info: SessionInfo) -> Self {
        Self {
            shared,
            stream,
            info,
            inbound: BytesMut::new(),
            consumed: 0,
            writing: VecDeque::new(),
        }
    }

    pub(crate) fn id(&self) -> SessionId {
        self.shared.id()
    }

    pub(crate) fn shared(&self) -> &Arc<SessionShared> {
        &self.shared
    }

    pub(crate) fn info(&self) -> &SessionInfo {
        &self.info
    }

    pub(crate) fn inbound(&mut self) -> &mut BytesMut {
        &mut self.inbound
    }

    pub(crate) fn offset(&self) -> u64 {
        self.consumed
    }

    /// 记录被分帧器取走或丢弃的字节。
    pub(crate) fn advance_offset(&mut self, count: usize) {
        self.consumed += count as u64;
    }

    /// 读取当前可读的全部字节，最多 `limit` 字节。
    pub(crate) fn read_available(&mut self, chunk: usize, limit: usize) -> ReadStatus {
        let mut total = 0;
        while total < limit {
            let start = self.inbound.len();
            let want = chunk.min(limit - total);
            self.inbound.resize(start + want, 0);
            match self.stream.read(&mut self.inbound[start..]) {
                Ok(0) => {
                    self.inbound.truncate(start);
                    return ReadStatus::Eof;
                }
                Ok(n) => {
                    self.inbound.truncate(start + n);
                    total += n;
                }
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => {
                    self.inbound.truncate(start);
                    break;
                }
                Err(err) if err.kind() == io::ErrorKind::Interrupted => {
                    self.inbound.truncate(start);
                }
                Err(err) => {
                    self.inbound.truncate(start);
                    return ReadStatus::Failed(err);
                }
            }
        }
        ReadStatus::Open
    }

    /// 尽量写出排队数据，返回出站数据是否已全部写完。
    pub(crate) fn flush(&mut self) -> io::Result<bool> {
        self.shared.drain_outbound(&mut self.writing);
        while let Some(front) = self.writing.front_mut() {
            if front.is_empty() {
                self.writing.pop_front();
                continue;
            }
            match self.stream.write(front) {
                Ok(0) => return Err(io::Error::from(io::ErrorKind::WriteZero)),
                Ok(n) => front.advance(n),
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => return Ok(false),
                Err(err) if err.kind() == io::ErrorKind::Interrupted => {}
                Err(err) => return Err(err),
            }
        }
        Ok(!self.shared.has_outbound())
    }

    /// 关闭套接字并转入 `Closed`。
    pub(crate) fn close(self) -> (SessionInfo, Arc<SessionShared>) {
        let _ = self.stream.shutdown(Shutdown::Both);
        self.shared.mark_closed();
        (self.info, self.shared)
    }
}

/// 读取套接字两端地址。
pub(crate) fn stream_addrs(stream: &TcpStream) -> io::Result<(SocketAddr, SocketAddr)> {
    Ok((stream.local_addr()?, stream.peer_addr()?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::facade::Initiator;
    use std::time::Duration;

    #[test]
    fn ids_start_at_one_and_increase() {
        let ids = SessionIdAllocator::new();
        assert_eq!(ids.allocate(), SessionId::new(1));
        assert_eq!(ids.allocate(), SessionId::new(2));
    }

    #[test]
    fn close_request_is_accepted_once() {
        let shared = SessionShared::new(SessionId::new(3));
        assert!(shared.activate());
        let deadline = Instant::now() + Duration::from_secs(1);
        shared
            .request_close(DestroyReason::new(Initiator::Local, "bye"), deadline)
            .expect("first close");
        let err = shared
            .request_close(DestroyReason::new(Initiator::Local, "again"), deadline)
            .expect_err("second close");
        assert_eq!(err.kind(), crate::ServiceErrorKind::SessionClosing);

        let err = shared.enqueue(Bytes::from_static(b"x")).expect_err("closing");
        assert_eq!(err.kind(), crate::ServiceErrorKind::SessionClosing);
    }

    #[test]
    fn pending_session_closed_before_adoption_is_not_activated() {
        let shared = SessionShared::new(SessionId::new(4));
        shared
            .request_close(
                DestroyReason::new(Initiator::Local, "early"),
                Instant::now(),
            )
            .expect("close pending");
        assert!(!shared.activate());
        assert_eq!(shared.state(), SessionState::Closing);
    }

    #[test]
    fn valid_snapshot_skips_pending_sessions() {
        let table = SessionTable::default();
        let pending = Arc::new(SessionShared::new(SessionId::new(1)));
        let valid = Arc::new(SessionShared::new(SessionId::new(2)));
        assert!(valid.activate());
        table.insert(pending);
        table.insert(valid);

        let ids: Vec<_> = table.valid_sessions().iter().map(|s| s.id()).collect();
        assert_eq!(ids, vec![SessionId::new(2)]);
        assert_eq!(table.len(), 2);
    }
}
