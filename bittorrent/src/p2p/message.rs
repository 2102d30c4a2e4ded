use bytes::{Buf, BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::block;
use super::PeerError;

// Hard cap on a single message's payload (spec: 2 MiB). Anything past this is either
// corrupt framing or a hostile peer and the connection is closed rather than allocating.
pub const MAX_MESSAGE_SIZE: u32 = 2 * 1024 * 1024;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {

    KeepAlive,
    Choke,
    Unchoke,
    Interested,
    NotInterested,
    Have { idx: u32 },
    // Raw wire bytes; the session converts to a `Bitfield` once it knows piece count.
    Bitfield(Vec<u8>),
    Request(block::BlockInfo),
    Block(block::BlockData),
    Cancel(block::BlockInfo),
    Port { port: u16 },

    // BEP 6 Fast Extension.
    Suggest { idx: u32 },
    HaveAll,
    HaveNone,
    Reject(block::BlockInfo),
    AllowFast { idx: u32 },

    // BEP 10 Extension Protocol: id 0 is reserved for the handshake itself.
    Extended { ext_id: u8, payload: Vec<u8> },

    // BEP 52 v2 Merkle hash exchange.
    HashRequest { pieces_root: [u8; 32], base_layer: u8, index: u32, length: u32, proof_layers: u8 },
    Hashes { pieces_root: [u8; 32], base_layer: u8, index: u32, length: u32, proof_layers: u8, hashes: Vec<u8> },
    HashReject { pieces_root: [u8; 32], base_layer: u8, index: u32, length: u32, proof_layers: u8 },
}

pub struct MessageCodec;

impl Encoder<Message> for MessageCodec {

    type Error = PeerError;

    fn encode(&mut self, msg: Message, dst: &mut BytesMut) -> Result<(), Self::Error> {
        match msg {

            Message::KeepAlive => dst.put_u32(0),

            Message::Choke => { dst.put_u32(1); dst.put_u8(0); },
            Message::Unchoke => { dst.put_u32(1); dst.put_u8(1); },
            Message::Interested => { dst.put_u32(1); dst.put_u8(2); },
            Message::NotInterested => { dst.put_u32(1); dst.put_u8(3); },

            Message::Have { idx } => {
                dst.put_u32(5);
                dst.put_u8(4);
                dst.put_u32(idx);
            },

            Message::Bitfield(bytes) => {
                dst.put_u32(1 + bytes.len() as u32);
                dst.put_u8(5);
                dst.extend_from_slice(&bytes);
            },

            Message::Request(block) => {
                dst.put_u32(13);
                dst.put_u8(6);
                dst.put_u32(block.piece_idx as u32);
                dst.put_u32(block.offset as u32);
                dst.put_u32(block.len as u32);
            },

            Message::Block(block) => {
                dst.put_u32(9 + block.data.len() as u32);
                dst.put_u8(7);
                dst.put_u32(block.piece_idx as u32);
                dst.put_u32(block.offset as u32);
                dst.extend_from_slice(&block.data);
            },

            Message::Cancel(block) => {
                dst.put_u32(13);
                dst.put_u8(8);
                dst.put_u32(block.piece_idx as u32);
                dst.put_u32(block.offset as u32);
                dst.put_u32(block.len as u32);
            },

            Message::Port { port } => {
                dst.put_u32(3);
                dst.put_u8(9);
                dst.put_u16(port);
                dst.put_u16(0); // pad to the historically-used 2-byte payload + reserved.
            },

            Message::Suggest { idx } => {
                dst.put_u32(5);
                dst.put_u8(0x0D);
                dst.put_u32(idx);
            },

            Message::HaveAll => { dst.put_u32(1); dst.put_u8(0x0E); },
            Message::HaveNone => { dst.put_u32(1); dst.put_u8(0x0F); },

            Message::Reject(block) => {
                dst.put_u32(13);
                dst.put_u8(0x10);
                dst.put_u32(block.piece_idx as u32);
                dst.put_u32(block.offset as u32);
                dst.put_u32(block.len as u32);
            },

            Message::AllowFast { idx } => {
                dst.put_u32(5);
                dst.put_u8(0x11);
                dst.put_u32(idx);
            },

            Message::Extended { ext_id, payload } => {
                dst.put_u32(2 + payload.len() as u32);
                dst.put_u8(20);
                dst.put_u8(ext_id);
                dst.extend_from_slice(&payload);
            },

            Message::HashRequest { pieces_root, base_layer, index, length, proof_layers } => {
                dst.put_u32(1 + 32 + 1 + 4 + 4 + 1);
                dst.put_u8(21);
                dst.extend_from_slice(&pieces_root);
                dst.put_u8(base_layer);
                dst.put_u32(index);
                dst.put_u32(length);
                dst.put_u8(proof_layers);
            },

            Message::Hashes { pieces_root, base_layer, index, length, proof_layers, hashes } => {
                dst.put_u32(1 + 32 + 1 + 4 + 4 + 1 + hashes.len() as u32);
                dst.put_u8(22);
                dst.extend_from_slice(&pieces_root);
                dst.put_u8(base_layer);
                dst.put_u32(index);
                dst.put_u32(length);
                dst.put_u8(proof_layers);
                dst.extend_from_slice(&hashes);
            },

            Message::HashReject { pieces_root, base_layer, index, length, proof_layers } => {
                dst.put_u32(1 + 32 + 1 + 4 + 4 + 1);
                dst.put_u8(23);
                dst.extend_from_slice(&pieces_root);
                dst.put_u8(base_layer);
                dst.put_u32(index);
                dst.put_u32(length);
                dst.put_u8(proof_layers);
            },
        }

        Ok(())
    }
}

impl Decoder for MessageCodec {

    type Item = Message;
    type Error = PeerError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {

        if src.remaining() < 4 { return Ok(None); }

        let mut peeker = std::io::Cursor::new(&src);
        let msg_len = peeker.get_u32();

        if msg_len > MAX_MESSAGE_SIZE {
            crate::metrics::ERRORS.buffer_overflow.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
            return Err(PeerError::MessageTooLarge(msg_len));
        }
        let msg_len = msg_len as usize;

        if src.remaining() >= 4 + msg_len {
            src.advance(4);
            if msg_len == 0 { return Ok(Some(Message::KeepAlive)); }
        } else {
            return Ok(None);
        }

        let msg = match src.get_u8() {
            0 => Message::Choke,
            1 => Message::Unchoke,
            2 => Message::Interested,
            3 => Message::NotInterested,
            4 => Message::Have { idx: src.get_u32() },
            5 => {
                let mut bitfield = vec![0; msg_len - 1];
                src.copy_to_slice(&mut bitfield);
                Message::Bitfield(bitfield)
            },
            6 => {
                let piece_idx = src.get_u32() as usize;
                let offset = src.get_u32() as usize;
                let len = src.get_u32() as usize;
                Message::Request(block::BlockInfo { piece_idx, offset, len })
            },
            7 => {
                let piece_idx = src.get_u32() as usize;
                let offset = src.get_u32() as usize;
                let mut data = vec![0; msg_len - 9];
                src.copy_to_slice(&mut data);
                Message::Block(block::BlockData { piece_idx, offset, data })
            },
            8 => {
                let piece_idx = src.get_u32() as usize;
                let offset = src.get_u32() as usize;
                let len = src.get_u32() as usize;
                Message::Cancel(block::BlockInfo { piece_idx, offset, len })
            },
            9 => {
                let port = src.get_u16();
                if msg_len > 3 { src.advance(msg_len - 3); }
                Message::Port { port }
            },
            0x0D => Message::Suggest { idx: src.get_u32() },
            0x0E => Message::HaveAll,
            0x0F => Message::HaveNone,
            0x10 => {
                let piece_idx = src.get_u32() as usize;
                let offset = src.get_u32() as usize;
                let len = src.get_u32() as usize;
                Message::Reject(block::BlockInfo { piece_idx, offset, len })
            },
            0x11 => Message::AllowFast { idx: src.get_u32() },
            20 => {
                let ext_id = src.get_u8();
                let mut payload = vec![0; msg_len - 2];
                src.copy_to_slice(&mut payload);
                Message::Extended { ext_id, payload }
            },
            id @ (21 | 22 | 23) => {
                let mut pieces_root = [0u8; 32];
                src.copy_to_slice(&mut pieces_root);
                let base_layer = src.get_u8();
                let index = src.get_u32();
                let length = src.get_u32();
                let proof_layers = src.get_u8();

                match id {
                    21 => Message::HashRequest { pieces_root, base_layer, index, length, proof_layers },
                    22 => {
                        let fixed_len = 1 + 32 + 1 + 4 + 4 + 1;
                        let mut hashes = vec![0; msg_len - fixed_len];
                        src.copy_to_slice(&mut hashes);
                        Message::Hashes { pieces_root, base_layer, index, length, proof_layers, hashes }
                    },
                    _ => Message::HashReject { pieces_root, base_layer, index, length, proof_layers },
                }
            },
            id => {
                tracing::warn!("invalid message id: {}", id);
                return Err(PeerError::InvalidMessageId(id));
            }
        };

        Ok(Some(msg))
    }
}

impl std::fmt::Display for Message {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Message::KeepAlive => write!(f, "keep alive"),
            Message::Choke => write!(f, "choke"),
            Message::Unchoke => write!(f, "unchoke"),
            Message::Interested => write!(f, "interested"),
            Message::NotInterested => write!(f, "not interested"),
            Message::Have { idx } => write!(f, "have piece idx: {}", idx),
            Message::Bitfield(bytes) => write!(f, "bitfield ({} bytes)", bytes.len()),
            Message::Request(block) => write!(f, "request {{ piece: {}, offset: {}, len: {} }}", block.piece_idx, block.offset, block.len),
            Message::Block(block) => write!(f, "block {{ piece: {}, offset: {}, len: {} }}", block.piece_idx, block.offset, block.data.len()),
            Message::Cancel(block) => write!(f, "cancel {{ piece: {}, offset: {}, len: {} }}", block.piece_idx, block.offset, block.len),
            Message::Port { port } => write!(f, "port {}", port),
            Message::Suggest { idx } => write!(f, "suggest piece {}", idx),
            Message::HaveAll => write!(f, "have-all"),
            Message::HaveNone => write!(f, "have-none"),
            Message::Reject(block) => write!(f, "reject {{ piece: {}, offset: {}, len: {} }}", block.piece_idx, block.offset, block.len),
            Message::AllowFast { idx } => write!(f, "allow-fast piece {}", idx),
            Message::Extended { ext_id, payload } => write!(f, "extended {{ id: {}, len: {} }}", ext_id, payload.len()),
            Message::HashRequest { index, .. } => write!(f, "hash-request piece {}", index),
            Message::Hashes { index, .. } => write!(f, "hashes piece {}", index),
            Message::HashReject { index, .. } => write!(f, "hash-reject piece {}", index),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_msg_stream() {
        let mut out_buf = BytesMut::new();
        let mut buf = BytesMut::new();

        buf.extend_from_slice(&[0, 0, 0, 0]);
        buf.extend_from_slice(&[0, 0, 0, 1, 0]);
        buf.extend_from_slice(&[0, 0, 0, 1, 1]);
        buf.extend_from_slice(&[0, 0, 0, 1, 2]);
        buf.extend_from_slice(&[0, 0, 0, 1, 3]);
        buf.extend_from_slice(&[0, 0, 0, 5, 4, 0, 0, 0, 0xb]);
        buf.extend_from_slice(&[0, 0, 0, 4, 5, 0x1, 0x2, 0x3]);
        buf.extend_from_slice(&[0, 0, 0, 0xd, 0x6, 0, 0, 0, 0xb, 0, 0x13, 0x40, 0, 0, 0, 0x40, 0]);
        buf.extend_from_slice(&[0, 0, 0, 12, 0x7, 0, 0, 0, 0xb, 0, 0x13, 0x40, 0, 0x1, 0x2, 0x3]);

        let expected = [
            Message::KeepAlive,
            Message::Choke,
            Message::Unchoke,
            Message::Interested,
            Message::NotInterested,
            Message::Have { idx: 0xb },
            Message::Bitfield(vec![0x1, 0x2, 0x3]),
            Message::Request(block::BlockInfo { piece_idx: 0xb, offset: 0x134000, len: 0x4000 }),
            Message::Block(block::BlockData { piece_idx: 0xb, offset: 0x134000, data: vec![0x1, 0x2, 0x3] }),
        ];

        for msg in expected.into_iter() {
            MessageCodec.encode(msg.clone(), &mut out_buf).unwrap();
            let decoded = MessageCodec.decode(&mut buf).unwrap().unwrap();
            assert_eq!(decoded, msg, "decoded message does not match expected");
        }
    }

    #[test]
    fn test_msg_decode_chunked() {
        let mut buf = BytesMut::new();
        buf.extend_from_slice(&[0, 0, 0]);
        assert_eq!(MessageCodec.decode(&mut buf).unwrap(), None);
        buf.extend_from_slice(&[1, 2]);
        assert_eq!(MessageCodec.decode(&mut buf).unwrap().unwrap(), Message::Interested);
    }

    #[test]
    fn test_msg_decode_invalid_id() {
        let mut src = BytesMut::from(&[0u8, 0, 0, 1, 255][..]);
        let result = MessageCodec.decode(&mut src);
        assert!(matches!(result, Err(PeerError::InvalidMessageId(255))));
    }

    #[test]
    fn fast_extension_messages_roundtrip() {
        let mut buf = BytesMut::new();
        for msg in [
            Message::HaveAll,
            Message::HaveNone,
            Message::Suggest { idx: 7 },
            Message::AllowFast { idx: 3 },
            Message::Reject(block::BlockInfo { piece_idx: 1, offset: 0, len: 16384 }),
        ] {
            MessageCodec.encode(msg.clone(), &mut buf).unwrap();
            let decoded = MessageCodec.decode(&mut buf).unwrap().unwrap();
            assert_eq!(decoded, msg);
        }
    }

    #[test]
    fn oversize_message_is_rejected() {
        let mut buf = BytesMut::new();
        buf.put_u32(MAX_MESSAGE_SIZE + 1);
        assert!(matches!(MessageCodec.decode(&mut buf), Err(PeerError::MessageTooLarge(_))));
    }
}
