//! The downstream half of the client stream pipeline.
//!
//! The reply context is the head node; whatever writes to the client
//! socket sits below it behind [`ReplySink`]. The head pushes the parsed
//! reply exactly once, then body windows in offset order; a zero-length
//! chunk signals completion, the error flag an upstream failure.

use bytes::{Bytes, BytesMut};
use parking_lot::Mutex;
use std::sync::Arc;

use crate::msg::HttpReply;

/// One delivery from the reply context to the next node.
#[derive(Clone, Debug)]
pub struct StreamChunk {
    /// Body offset of the first byte (headers excluded).
    pub offset: u64,
    pub data: Bytes,
    pub error: bool,
}

impl StreamChunk {
    pub fn error() -> StreamChunk {
        StreamChunk {
            offset: 0,
            data: Bytes::new(),
            error: true,
        }
    }
}

/// The next node in the pipeline.
pub trait ReplySink: Send {
    /// `reply` accompanies the first delivery only.
    fn deliver(&mut self, reply: Option<&HttpReply>, chunk: StreamChunk);
}

#[derive(Default)]
struct SinkState {
    reply: Option<HttpReply>,
    body: BytesMut,
    errored: bool,
    complete: bool,
}

/// A sink that accumulates the response in memory. Used by tests and by
/// embedders that want the whole reply at once.
#[derive(Clone, Default)]
pub struct BufferSink(Arc<Mutex<SinkState>>);

impl BufferSink {
    pub fn new() -> BufferSink {
        BufferSink::default()
    }

    pub fn reply(&self) -> Option<HttpReply> {
        self.0.lock().reply.clone()
    }

    pub fn body(&self) -> Bytes {
        Bytes::copy_from_slice(&self.0.lock().body)
    }

    pub fn errored(&self) -> bool {
        self.0.lock().errored
    }

    pub fn complete(&self) -> bool {
        self.0.lock().complete
    }

    /// Completed, failed, or otherwise in need of no further pulls.
    pub fn settled(&self) -> bool {
        let s = self.0.lock();
        s.complete || s.errored
    }
}

impl ReplySink for BufferSink {
    fn deliver(&mut self, reply: Option<&HttpReply>, chunk: StreamChunk) {
        let mut s = self.0.lock();
        let first = reply.is_some();
        if let Some(r) = reply {
            s.reply = Some(r.clone());
        }
        if chunk.error {
            s.errored = true;
            return;
        }
        // the first delivery may legitimately carry no body yet; a later
        // zero-length chunk is the completion signal
        if chunk.data.is_empty() && !first && s.reply.is_some() {
            s.complete = true;
        }
        s.body.extend_from_slice(&chunk.data);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sink_accumulates_and_settles() {
        let sink = BufferSink::new();
        let mut node: Box<dyn ReplySink> = Box::new(sink.clone());
        let reply = HttpReply::parse(b"HTTP/1.1 200 OK\r\nContent-Length: 6\r\n\r\n").unwrap();
        node.deliver(
            Some(&reply),
            StreamChunk {
                offset: 0,
                data: Bytes::from_static(b"abc"),
                error: false,
            },
        );
        node.deliver(
            None,
            StreamChunk {
                offset: 3,
                data: Bytes::from_static(b"def"),
                error: false,
            },
        );
        assert!(!sink.settled());
        node.deliver(
            None,
            StreamChunk {
                offset: 6,
                data: Bytes::new(),
                error: false,
            },
        );
        assert!(sink.complete());
        assert_eq!(&sink.body()[..], b"abcdef");
        assert_eq!(sink.reply().unwrap().status, http::StatusCode::OK);
    }
}
