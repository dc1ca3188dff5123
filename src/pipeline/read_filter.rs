use crate::pipeline::{Message, MessageSink, WorkQueue};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

struct Inner {
    queue: WorkQueue<Message>,
    sink: Arc<dyn MessageSink>,
    min_qscore: f32,
}

impl Inner {
    fn worker_thread(&self) {
        while let Some(message) = self.queue.pop() {
            match message {
                Message::Read(read) => {
                    let qscore = read.mean_qscore();
                    if qscore < self.min_qscore {
                        log::debug!(
                            "Filtered out read {} with mean qscore {:.2}",
                            read.read_id,
                            qscore
                        );
                    } else {
                        self.sink.push_message(Message::Read(read));
                    }
                }
                other => self.sink.push_message(other),
            }
        }
    }
}

/// Drops reads whose mean basecall quality is below a threshold.
pub struct ReadFilterNode {
    inner: Arc<Inner>,
    workers: Vec<JoinHandle<()>>,
}

impl ReadFilterNode {
    pub fn new(
        sink: Arc<dyn MessageSink>,
        min_qscore: f32,
        num_worker_threads: usize,
        max_reads: usize,
    ) -> Self {
        let inner = Arc::new(Inner {
            queue: WorkQueue::new(max_reads),
            sink,
            min_qscore,
        });
        let workers = (0..num_worker_threads)
            .map(|_| {
                let inner = Arc::clone(&inner);
                thread::spawn(move || inner.worker_thread())
            })
            .collect();
        ReadFilterNode { inner, workers }
    }
}

impl MessageSink for ReadFilterNode {
    fn push_message(&self, message: Message) {
        if self.inner.queue.push(message).is_err() {
            log::trace!("Read filter terminated; dropping message");
        }
    }

    fn terminate(&self) {
        self.inner.queue.terminate();
    }
}

impl Drop for ReadFilterNode {
    fn drop(&mut self) {
        self.inner.queue.terminate();
        for worker in self.workers.drain(..) {
            worker.join().expect("Read filter worker panicked");
        }
        self.inner.sink.terminate();
    }
}
