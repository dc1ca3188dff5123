use crate::pipeline::{Message, MessageSink, WorkQueue};
use crate::reads::{Read, ReadPair};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};

struct Inner {
    queue: WorkQueue<Message>,
    sink: Arc<dyn MessageSink>,
    /// template id -> complement id
    pairs: HashMap<String, String>,
    /// complement id -> template id
    partner_of: HashMap<String, String>,
    /// Reads waiting for their partner, keyed by read id.
    cache: Mutex<HashMap<String, Box<Read>>>,
}

impl Inner {
    fn worker_thread(&self) {
        while let Some(message) = self.queue.pop() {
            let read = match message {
                Message::Read(read) => read,
                other => {
                    self.sink.push_message(other);
                    continue;
                }
            };

            if let Some(complement_id) = self.pairs.get(&read.read_id) {
                let mut cache = self.cache.lock().unwrap();
                if let Some(complement) = cache.remove(complement_id) {
                    drop(cache);
                    self.sink.push_message(Message::Pair(Box::new(ReadPair {
                        template: read,
                        complement,
                    })));
                } else {
                    cache.insert(read.read_id.clone(), read);
                }
            } else if let Some(template_id) = self.partner_of.get(&read.read_id) {
                let mut cache = self.cache.lock().unwrap();
                if let Some(template) = cache.remove(template_id) {
                    drop(cache);
                    self.sink.push_message(Message::Pair(Box::new(ReadPair {
                        template,
                        complement: read,
                    })));
                } else {
                    cache.insert(read.read_id.clone(), read);
                }
            } else {
                log::debug!("Read {} is not in the pair list; dropping", read.read_id);
            }
        }
    }
}

/// Pairs simplex reads by a known template-complement map and emits
/// `ReadPair` messages. Reads whose partner never arrives are discarded at
/// teardown.
pub struct PairingNode {
    inner: Arc<Inner>,
    workers: Vec<JoinHandle<()>>,
}

impl PairingNode {
    pub fn new(
        sink: Arc<dyn MessageSink>,
        template_complement_map: HashMap<String, String>,
        num_worker_threads: usize,
        max_reads: usize,
    ) -> Self {
        let partner_of = template_complement_map
            .iter()
            .map(|(t, c)| (c.clone(), t.clone()))
            .collect();
        let inner = Arc::new(Inner {
            queue: WorkQueue::new(max_reads),
            sink,
            pairs: template_complement_map,
            partner_of,
            cache: Mutex::new(HashMap::new()),
        });
        let workers = (0..num_worker_threads)
            .map(|_| {
                let inner = Arc::clone(&inner);
                thread::spawn(move || inner.worker_thread())
            })
            .collect();
        PairingNode { inner, workers }
    }
}

impl MessageSink for PairingNode {
    fn push_message(&self, message: Message) {
        if self.inner.queue.push(message).is_err() {
            log::trace!("Pairing node terminated; dropping message");
        }
    }

    fn terminate(&self) {
        self.inner.queue.terminate();
    }
}

impl Drop for PairingNode {
    fn drop(&mut self) {
        self.inner.queue.terminate();
        for worker in self.workers.drain(..) {
            worker.join().expect("Pairing worker panicked");
        }
        let unpaired = self.inner.cache.lock().unwrap().len();
        if unpaired > 0 {
            log::debug!("Discarding {} reads whose partner never arrived", unpaired);
        }
        self.inner.sink.terminate();
    }
}
