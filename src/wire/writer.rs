//! Outbound side of a connection: a FIFO queue drained by one thread

use crate::error::{NetworkError, Result};
use crate::wire::codec::{write_message, Message};
use crossbeam_channel::{unbounded, Receiver, Sender};
use log::{debug, warn};
use std::io::Write;
use std::thread::{self, JoinHandle};

/// Invoked once per message with the outcome of its write
pub type SendCallback = Box<dyn FnOnce(Result<()>) + Send + 'static>;

/// Events a running writer emits to its owner
#[derive(Debug)]
pub enum WriterEvent {
    /// A write failed and the loop stopped
    Failed(NetworkError),
}

struct OutboundMessage {
    message: Message,
    callback: Option<SendCallback>,
}

impl OutboundMessage {
    fn complete(self, result: Result<()>) {
        if let Some(callback) = self.callback {
            callback(result);
        }
    }
}

/// Handle to a writer thread. Dropping it closes the queue; the thread exits
/// once it has written everything already queued.
pub struct MessageWriter {
    queue: Sender<OutboundMessage>,
    handle: Option<JoinHandle<()>>,
}

impl MessageWriter {
    pub fn spawn<W: Write + Send + 'static>(
        stream: W,
        name: String,
        chunk_size: usize,
        events: Sender<WriterEvent>,
    ) -> Result<Self> {
        let (queue, jobs) = unbounded();
        let handle = thread::Builder::new()
            .name(name)
            .spawn(move || Self::run(stream, jobs, chunk_size, events))
            .map_err(|e| NetworkError::Io(format!("Failed to spawn writer thread: {e}")))?;

        Ok(Self {
            queue,
            handle: Some(handle),
        })
    }

    /// Queue a message without waiting for it to be written
    pub fn enqueue(&self, message: Message) -> Result<()> {
        self.push(OutboundMessage {
            message,
            callback: None,
        })
    }

    /// Queue a message; `callback` learns whether it reached the socket.
    ///
    /// If the writer has already stopped the error is returned directly and
    /// the callback is not invoked.
    pub fn enqueue_with_callback(&self, message: Message, callback: SendCallback) -> Result<()> {
        self.push(OutboundMessage {
            message,
            callback: Some(callback),
        })
    }

    fn push(&self, job: OutboundMessage) -> Result<()> {
        self.queue
            .send(job)
            .map_err(|_| NetworkError::NotConnected("writer has stopped".to_string()))
    }

    /// Number of messages waiting to be written
    pub fn pending(&self) -> usize {
        self.queue.len()
    }

    /// Close the queue and wait for the thread to finish
    pub fn join(mut self) {
        let handle = self.handle.take();
        drop(self);
        if let Some(handle) = handle {
            let _ = handle.join();
        }
    }

    fn run<W: Write>(
        mut stream: W,
        jobs: Receiver<OutboundMessage>,
        chunk_size: usize,
        events: Sender<WriterEvent>,
    ) {
        while let Ok(job) = jobs.recv() {
            match write_message(&mut stream, &job.message, chunk_size) {
                Ok(()) => job.complete(Ok(())),
                Err(e) if e.is_transient() => {
                    warn!("Write failed, dropping {} queued message(s): {e}", jobs.len());
                    job.complete(Err(e.clone()));
                    for dropped in jobs.try_iter() {
                        dropped.complete(Err(NetworkError::NotConnected(
                            "dropped after write failure".to_string(),
                        )));
                    }
                    let _ = events.send(WriterEvent::Failed(e));
                    return;
                }
                // Encoding errors only concern this message
                Err(e) => job.complete(Err(e)),
            }
        }
        debug!("Writer queue closed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wire::codec::read_frame;
    use crate::wire::codec::Frame;
    use std::io::{self, Cursor};
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    #[derive(Clone, Default)]
    struct SharedBuf(Arc<Mutex<Vec<u8>>>);

    impl Write for SharedBuf {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }
        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    struct BrokenPipe;

    impl Write for BrokenPipe {
        fn write(&mut self, _buf: &[u8]) -> io::Result<usize> {
            Err(io::Error::new(io::ErrorKind::BrokenPipe, "peer went away"))
        }
        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn test_writes_in_submission_order() {
        let buf = SharedBuf::default();
        let (events_tx, _events_rx) = unbounded();
        let writer =
            MessageWriter::spawn(buf.clone(), "test-writer".to_string(), 1024, events_tx).unwrap();

        for i in 0..20u8 {
            writer.enqueue(Message::new(3, vec![i; 10])).unwrap();
        }
        writer.join();

        let bytes = buf.0.lock().unwrap().clone();
        let mut cursor = Cursor::new(bytes);
        for i in 0..20u8 {
            match read_frame(&mut cursor).unwrap() {
                Frame::Whole(m) => assert_eq!(m.payload, vec![i; 10]),
                other => panic!("unexpected frame {other:?}"),
            }
        }
    }

    #[test]
    fn test_failure_reports_and_stops() {
        let (events_tx, events_rx) = unbounded();
        let writer =
            MessageWriter::spawn(BrokenPipe, "test-writer".to_string(), 1024, events_tx).unwrap();

        let (done_tx, done_rx) = unbounded();
        writer
            .enqueue_with_callback(
                Message::new(3, vec![1, 2, 3]),
                Box::new(move |result| {
                    let _ = done_tx.send(result);
                }),
            )
            .unwrap();

        let result = done_rx.recv_timeout(Duration::from_secs(2)).unwrap();
        assert!(matches!(result, Err(NetworkError::Io(_))));
        assert!(matches!(
            events_rx.recv_timeout(Duration::from_secs(2)).unwrap(),
            WriterEvent::Failed(_)
        ));

        // The loop is gone; later sends fail fast instead of blocking
        let mut rejected = false;
        for _ in 0..50 {
            if writer.enqueue(Message::new(3, vec![])).is_err() {
                rejected = true;
                break;
            }
            thread::sleep(Duration::from_millis(10));
        }
        assert!(rejected);
    }

    #[test]
    fn test_oversized_message_fails_alone() {
        let buf = SharedBuf::default();
        let (events_tx, events_rx) = unbounded();
        let writer =
            MessageWriter::spawn(buf.clone(), "test-writer".to_string(), 0, events_tx).unwrap();

        let (done_tx, done_rx) = unbounded();
        writer
            .enqueue_with_callback(
                Message::new(3, vec![1]),
                Box::new(move |result| {
                    let _ = done_tx.send(result);
                }),
            )
            .unwrap();

        assert!(matches!(
            done_rx.recv_timeout(Duration::from_secs(2)).unwrap(),
            Err(NetworkError::Config(_))
        ));
        assert!(events_rx.try_recv().is_err());
        writer.join();
    }
}
