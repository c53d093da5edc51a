use bytes::{Buf, BytesMut};
use std::cmp::min;
use std::io;

const CHUNK: usize = 16384;

/// Result of one ingress pass over a readable socket.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct Ingress {
    /// Bytes appended to the buffer during this pass.
    pub received: usize,
    /// The peer closed its write side.
    pub eof: bool,
    /// The buffer hit its capacity limit before the socket drained.
    pub full: bool,
}

/// Capacity-limited FIFO byte queue between a socket and a parser. Data is
/// appended at the tail and consumed from the head.
pub struct Buffer {
    data: BytesMut,
    limit: usize,
}

impl Buffer {
    #[inline]
    pub fn new(limit: usize) -> Buffer {
        Buffer {
            data: BytesMut::new(),
            limit,
        }
    }

    /// The number of bytes in the buffer.
    #[inline]
    pub fn len(&self) -> usize {
        self.data.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Remaining capacity before the limit.
    #[inline]
    pub fn free_capacity(&self) -> usize {
        self.limit - min(self.limit, self.data.len())
    }

    /// Slice containing buffered data.
    #[inline]
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// Discards `count` bytes from the head.
    #[inline]
    pub fn consume(&mut self, count: usize) {
        self.data.advance(count);
    }

    #[inline]
    pub fn clear(&mut self) {
        self.data.clear();
    }

    /// Appends bytes at the tail. Fails without writing when the bytes do
    /// not fit under the limit.
    #[inline]
    pub fn append(&mut self, bytes: &[u8]) -> bool {
        if bytes.len() > self.free_capacity() {
            return false;
        }

        self.data.extend_from_slice(bytes);
        true
    }

    /// Reads from the supplied reader until it would block, the peer closes,
    /// or the buffer fills up.
    pub fn ingress<R: io::Read>(&mut self, mut reader: R) -> io::Result<Ingress> {
        let mut chunk = [0u8; CHUNK];
        let mut received = 0;

        loop {
            let want = min(chunk.len(), self.free_capacity());

            if want == 0 {
                return Ok(Ingress {
                    received,
                    eof: false,
                    full: true,
                });
            }

            match reader.read(&mut chunk[..want]) {
                Ok(0) => {
                    return Ok(Ingress {
                        received,
                        eof: true,
                        full: false,
                    });
                }
                Ok(count) => {
                    self.data.extend_from_slice(&chunk[..count]);
                    received += count;
                }
                Err(ref err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(ref err) if err.kind() == io::ErrorKind::WouldBlock => {
                    return Ok(Ingress {
                        received,
                        eof: false,
                        full: false,
                    });
                }
                Err(err) => return Err(err),
            }
        }
    }

    /// Writes buffered data to the supplied writer until it would block or
    /// the buffer drains, advancing the head past what was written.
    pub fn egress<W: io::Write>(&mut self, mut writer: W) -> io::Result<usize> {
        let mut sent = 0;

        while !self.data.is_empty() {
            match writer.write(&self.data) {
                Ok(0) => return Err(io::ErrorKind::WriteZero.into()),
                Ok(count) => {
                    self.data.advance(count);
                    sent += count;
                }
                Err(ref err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(ref err) if err.kind() == io::ErrorKind::WouldBlock => return Ok(sent),
                Err(err) => return Err(err),
            }
        }

        Ok(sent)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    /// Socket stand-in delivering data in fixed-size slices and reporting
    /// WouldBlock when drained or full.
    struct MockChannel {
        data: Vec<u8>,
        cursor: usize,
        slice: usize,
        max_size: usize,
    }

    impl MockChannel {
        fn new(data: Vec<u8>, slice: usize, max_size: usize) -> MockChannel {
            MockChannel {
                data,
                cursor: 0,
                slice,
                max_size,
            }
        }

        fn clear(&mut self) {
            self.data.clear();
            self.cursor = 0;
        }
    }

    impl io::Read for MockChannel {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            if self.cursor == self.data.len() {
                return Err(io::ErrorKind::WouldBlock.into());
            }

            let count = min(min(self.slice, buf.len()), self.data.len() - self.cursor);
            buf[..count].copy_from_slice(&self.data[self.cursor..self.cursor + count]);
            self.cursor += count;
            Ok(count)
        }
    }

    impl io::Write for MockChannel {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            if self.data.len() == self.max_size {
                return Err(io::ErrorKind::WouldBlock.into());
            }

            let count = min(self.slice, buf.len());
            self.data.extend(&buf[..count]);
            Ok(count)
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn test_roundtrip() {
        let payload: Vec<u8> = (0..2048u32).map(|item| item as u8).collect();
        let mut channel = MockChannel::new(payload.clone(), 500, payload.len());
        let mut buffer = Buffer::new(4096);

        let ingress = buffer.ingress(&mut channel).unwrap();

        assert_eq!(ingress.received, payload.len());
        assert!(!ingress.eof);
        assert!(!ingress.full);
        assert_eq!(buffer.data(), &payload[..]);

        channel.clear();
        let sent = buffer.egress(&mut channel).unwrap();

        assert_eq!(sent, payload.len());
        assert!(buffer.is_empty());
        assert_eq!(channel.data, payload);
    }

    #[test]
    fn test_ingress_eof() {
        let mut buffer = Buffer::new(64);
        let ingress = buffer.ingress(Cursor::new(vec![1, 2, 3])).unwrap();

        assert_eq!(ingress.received, 3);
        assert!(ingress.eof);
        assert_eq!(buffer.data(), &[1, 2, 3]);
    }

    #[test]
    fn test_ingress_stops_at_limit() {
        let payload: Vec<u8> = (0..256u32).map(|item| item as u8).collect();
        let mut channel = MockChannel::new(payload, 32, 0);
        let mut buffer = Buffer::new(100);

        let ingress = buffer.ingress(&mut channel).unwrap();

        assert!(ingress.full);
        assert_eq!(ingress.received, 100);
        assert_eq!(buffer.free_capacity(), 0);
    }

    #[test]
    fn test_egress_error_on_zero_write() {
        let mut sink = vec![];
        let mut buffer = Buffer::new(64);

        buffer.append(&[1]);

        let result = buffer.egress(&mut sink[..]);

        assert_eq!(result.unwrap_err().kind(), io::ErrorKind::WriteZero);
    }

    #[test]
    fn test_egress_partial_on_would_block() {
        let mut channel = MockChannel::new(Vec::new(), 8, 8);
        let mut buffer = Buffer::new(64);

        buffer.append(&[7u8; 20]);

        let sent = buffer.egress(&mut channel).unwrap();

        assert_eq!(sent, 8);
        assert_eq!(buffer.len(), 12);
    }

    #[test]
    fn test_append_respects_limit() {
        let mut buffer = Buffer::new(4);

        assert!(buffer.append(&[1, 2, 3]));
        assert!(!buffer.append(&[4, 5]));
        assert!(buffer.append(&[4]));
        assert_eq!(buffer.data(), &[1, 2, 3, 4]);
    }

    #[test]
    fn test_consume() {
        let mut buffer = Buffer::new(16);

        buffer.append(b"abcdef");
        buffer.consume(4);

        assert_eq!(buffer.data(), b"ef");
    }
}
