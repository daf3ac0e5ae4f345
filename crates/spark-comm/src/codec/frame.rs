use bytes::{Buf, BufMut, BytesMut};

use crate::codec::{DecodeFailure, DecodeOutcome, FrameCodec};
use crate::config::{DEFAULT_MAX_FRAME_SIZE, Endian};
use crate::error::CodecError;
use crate::packet::{Opcode, Packet, SessionId};

/// 帧头长度：`len: u32` + `opcode: i32` + `status: i32`。
pub const HEADER_LEN: usize = 12;

/// 长度前缀分帧编解码器，服务默认使用的线格式。
///
/// # 设计动机（Why）
/// - 为运行时提供开箱即用的流式分帧，验证 [`FrameCodec`] 契约的可恢复性要求；
/// - 帧头携带操作码与状态码，负载原样跟随，便于宿主以任意语言实现对端。
///
/// # 帧布局（What）
/// ```text
/// +-----------+--------------+--------------+-------------------+
/// | len (u32) | opcode (i32) | status (i32) | payload (len-12)  |
/// +-----------+--------------+--------------+-------------------+
/// ```
/// - `len` 为整帧长度（含帧头），字节序由 [`Endian`] 决定；
/// - 整帧长度不得超过 `max_frame_size`。
///
/// # 重新同步（How）
/// - 帧头合法但操作码为负：丢弃整帧，后续帧不受影响；
/// - 帧长小于帧头或超过上限：帧头本身已不可信，丢弃当前缓冲中的全部字节，
///   在下一次读取的数据边界重新开始分帧。
///
/// # 权衡（Trade-offs）
/// - 线格式不带同步魔数，帧头损坏后只能以读边界为恢复点；需要更强恢复能力的部署
///   应实现自定义 [`FrameCodec`]。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct LengthPrefixedCodec {
    endian: Endian,
    max_frame_size: usize,
}

impl LengthPrefixedCodec {
    pub fn new(endian: Endian, max_frame_size: usize) -> Self {
        Self {
            endian,
            max_frame_size: max_frame_size.max(HEADER_LEN),
        }
    }

    pub fn endian(&self) -> Endian {
        self.endian
    }

    pub fn max_frame_size(&self) -> usize {
        self.max_frame_size
    }

    fn read_header(&self, mut header: &[u8]) -> (usize, Opcode, i32) {
        match self.endian {
            Endian::Big => (
                header.get_u32() as usize,
                header.get_i32(),
                header.get_i32(),
            ),
            Endian::Little => (
                header.get_u32_le() as usize,
                header.get_i32_le(),
                header.get_i32_le(),
            ),
        }
    }
}

impl Default for LengthPrefixedCodec {
    fn default() -> Self {
        Self::new(Endian::Big, DEFAULT_MAX_FRAME_SIZE)
    }
}

impl FrameCodec for LengthPrefixedCodec {
    fn encode(&self, packet: &Packet, dst: &mut BytesMut) -> Result<(), CodecError> {
        let len = HEADER_LEN + packet.payload.len();
        if len > self.max_frame_size {
            return Err(CodecError::FrameTooLarge {
                len,
                limit: self.max_frame_size,
            });
        }

        dst.reserve(len);
        match self.endian {
            Endian::Big => {
                dst.put_u32(len as u32);
                dst.put_i32(packet.opcode);
                dst.put_i32(packet.status);
            }
            Endian::Little => {
                dst.put_u32_le(len as u32);
                dst.put_i32_le(packet.opcode);
                dst.put_i32_le(packet.status);
            }
        }
        dst.put_slice(&packet.payload);
        Ok(())
    }

    fn decode(
        &self,
        session_id: SessionId,
        src: &mut BytesMut,
    ) -> Result<DecodeOutcome, DecodeFailure> {
        if src.len() < HEADER_LEN {
            return Ok(DecodeOutcome::Incomplete);
        }

        let (len, opcode, status) = self.read_header(&src[..HEADER_LEN]);
        if len < HEADER_LEN {
            return Err(DecodeFailure {
                error: CodecError::MalformedHeader(format!(
                    "frame length {len} is shorter than header {HEADER_LEN}"
                )),
                opcode: None,
                discard: src.len(),
            });
        }
        if len > self.max_frame_size {
            return Err(DecodeFailure {
                error: CodecError::FrameTooLarge {
                    len,
                    limit: self.max_frame_size,
                },
                opcode: None,
                discard: src.len(),
            });
        }
        // 长度可信时先等整帧到齐，非法帧才能被完整丢弃。
        if src.len() < len {
            return Ok(DecodeOutcome::Incomplete);
        }
        if opcode < 0 {
            return Err(DecodeFailure {
                error: CodecError::MalformedHeader(format!("negative opcode {opcode}")),
                opcode: Some(opcode),
                discard: len,
            });
        }

        let mut frame = src.split_to(len);
        frame.advance(HEADER_LEN);
        Ok(DecodeOutcome::Complete(Packet::new(
            session_id,
            opcode,
            status,
            frame.freeze(),
        )))
    }
}
