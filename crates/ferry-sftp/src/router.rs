//! Matching incoming frames to outstanding request ids.

use std::collections::VecDeque;
use std::time::Duration;

use ferry_proto::{split_reply, ProtoError, RawReply};
use ferry_transport::Wire;

use crate::{SessionConfig, SftpError};

/// Reads frames off the wire and hands each one to whoever asked for its
/// request id. Replies that arrive for ids nobody is waiting on yet are
/// parked in a bounded side-buffer.
pub struct ReplyRouter<W: Wire> {
    wire: W,
    parked: VecDeque<RawReply>,
    limit: usize,
    timeout: Duration,
    max_frame: usize,
}

impl<W: Wire> ReplyRouter<W> {
    pub fn new(wire: W, config: &SessionConfig) -> Self {
        ReplyRouter {
            wire,
            parked: VecDeque::new(),
            limit: config.side_buffer_limit,
            timeout: config.transfer_timeout,
            max_frame: config.max_frame,
        }
    }

    /// Sends one finished frame.
    pub fn send(&mut self, frame: Vec<u8>) -> crate::Result<()> {
        self.wire.write_all(&frame, self.timeout)?;
        Ok(())
    }

    /// Reads exactly one framed message.
    pub fn read_frame(&mut self) -> crate::Result<RawReply> {
        let mut len_buf = [0u8; 4];
        self.wire.read_exact(&mut len_buf, self.timeout)?;
        let len = u32::from_be_bytes(len_buf) as usize;
        if len == 0 {
            return Err(SftpError::Protocol(ProtoError::TruncatedReply));
        }
        if len + 4 > self.max_frame {
            return Err(SftpError::Protocol(ProtoError::OversizedFrame {
                len: len + 4,
                max: self.max_frame,
            }));
        }
        let mut body = vec![0u8; len];
        self.wire.read_exact(&mut body, self.timeout)?;
        Ok(split_reply(&body)?)
    }

    /// Returns the reply to `id`, parking everything else that arrives
    /// first.
    pub fn get_reply(&mut self, id: u32) -> crate::Result<RawReply> {
        if let Some(pos) = self.parked.iter().position(|r| r.id == id) {
            if let Some(reply) = self.parked.remove(pos) {
                return Ok(reply);
            }
        }
        loop {
            let frame = self.read_frame()?;
            if frame.id == id {
                return Ok(frame);
            }
            self.park(frame)?;
        }
    }

    /// Returns the first reply whose id is in `ids`, parking the rest.
    /// The write-ack drain uses this: any arriving ack credits its slot.
    pub fn get_reply_from(&mut self, ids: &[u32]) -> crate::Result<RawReply> {
        if let Some(pos) = self.parked.iter().position(|r| ids.contains(&r.id)) {
            if let Some(reply) = self.parked.remove(pos) {
                return Ok(reply);
            }
        }
        loop {
            let frame = self.read_frame()?;
            if ids.contains(&frame.id) {
                return Ok(frame);
            }
            self.park(frame)?;
        }
    }

    /// Zero-timeout probe: one frame if the wire has one ready, else
    /// `None`. Never blocks beyond the frame read itself.
    pub fn poll_frame(&mut self) -> crate::Result<Option<RawReply>> {
        if self.wire.readable(Duration::ZERO)? {
            Ok(Some(self.read_frame()?))
        } else {
            Ok(None)
        }
    }

    /// Removes and returns a parked frame whose id is in `ids`, if any.
    pub fn take_parked_from(&mut self, ids: &[u32]) -> Option<RawReply> {
        let pos = self.parked.iter().position(|r| ids.contains(&r.id))?;
        self.parked.remove(pos)
    }

    pub fn park(&mut self, frame: RawReply) -> crate::Result<()> {
        if self.parked.len() >= self.limit {
            return Err(SftpError::ReplyQueueFull(self.parked.len()));
        }
        self.parked.push_back(frame);
        Ok(())
    }

    pub fn parked_len(&self) -> usize {
        self.parked.len()
    }

    /// Tears the router apart, handing the wire back for shutdown.
    pub fn into_wire(self) -> W {
        self.wire
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ferry_proto::PacketType;
    use ferry_transport::TransportError;

    /// Byte-level loopback: reads serve whatever was queued.
    struct ScriptWire {
        incoming: VecDeque<u8>,
        outgoing: Vec<u8>,
    }

    impl ScriptWire {
        fn new() -> Self {
            ScriptWire {
                incoming: VecDeque::new(),
                outgoing: Vec::new(),
            }
        }

        fn queue_status(&mut self, id: u32, code: u32) {
            let body_len = 1 + 4 + 4;
            self.incoming
                .extend((body_len as u32).to_be_bytes().iter().copied());
            self.incoming.push_back(101);
            self.incoming.extend(id.to_be_bytes().iter().copied());
            self.incoming.extend(code.to_be_bytes().iter().copied());
        }
    }

    impl Wire for ScriptWire {
        fn write_all(&mut self, buf: &[u8], _deadline: Duration) -> ferry_transport::Result<()> {
            self.outgoing.extend_from_slice(buf);
            Ok(())
        }

        fn read_exact(
            &mut self,
            buf: &mut [u8],
            _deadline: Duration,
        ) -> ferry_transport::Result<()> {
            for slot in buf.iter_mut() {
                *slot = self
                    .incoming
                    .pop_front()
                    .ok_or(TransportError::ConnectionClosed)?;
            }
            Ok(())
        }

        fn readable(&mut self, _timeout: Duration) -> ferry_transport::Result<bool> {
            Ok(!self.incoming.is_empty())
        }
    }

    fn router(wire: ScriptWire) -> ReplyRouter<ScriptWire> {
        ReplyRouter::new(wire, &SessionConfig::default())
    }

    #[test]
    fn returns_matching_reply() {
        let mut wire = ScriptWire::new();
        wire.queue_status(7, 0);
        let mut router = router(wire);
        let reply = router.get_reply(7).unwrap();
        assert_eq!(reply.ptype, PacketType::Status);
        assert_eq!(reply.id, 7);
    }

    #[test]
    fn parks_out_of_order_replies() {
        let mut wire = ScriptWire::new();
        wire.queue_status(2, 0);
        wire.queue_status(1, 0);
        let mut router = router(wire);
        assert_eq!(router.get_reply(1).unwrap().id, 1);
        assert_eq!(router.parked_len(), 1);
        // The parked frame serves the next call without touching the wire.
        assert_eq!(router.get_reply(2).unwrap().id, 2);
        assert_eq!(router.parked_len(), 0);
    }

    #[test]
    fn side_buffer_overflow_is_fatal() {
        let mut wire = ScriptWire::new();
        for id in 0..20 {
            wire.queue_status(id, 0);
        }
        let mut config = SessionConfig::default();
        config.side_buffer_limit = 4;
        let mut router = ReplyRouter::new(wire, &config);
        match router.get_reply(99) {
            Err(SftpError::ReplyQueueFull(_)) => {}
            other => panic!("expected ReplyQueueFull, got {other:?}"),
        }
    }

    #[test]
    fn get_reply_from_takes_any_listed_id() {
        let mut wire = ScriptWire::new();
        wire.queue_status(5, 0);
        wire.queue_status(3, 0);
        let mut router = router(wire);
        let first = router.get_reply_from(&[3, 5]).unwrap();
        assert_eq!(first.id, 5);
        let second = router.get_reply_from(&[3]).unwrap();
        assert_eq!(second.id, 3);
    }

    #[test]
    fn oversized_frame_is_rejected() {
        let mut wire = ScriptWire::new();
        let huge = (ferry_proto::DEFAULT_MAX_FRAME as u32) + 1;
        wire.incoming.extend(huge.to_be_bytes().iter().copied());
        let mut router = router(wire);
        match router.read_frame() {
            Err(SftpError::Protocol(ProtoError::OversizedFrame { .. })) => {}
            other => panic!("expected OversizedFrame, got {other:?}"),
        }
    }
}
