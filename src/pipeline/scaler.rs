use crate::pipeline::{Message, MessageSink, WorkQueue};
use crate::reads::Read;
use crate::utils::med_mad;
use std::sync::Arc;
use std::thread::{self, JoinHandle};

const MAD_SCALE: f32 = 1.4826;

// Leading-noise trim parameters.
const TRIM_WINDOW: usize = 40;
const TRIM_THRESHOLD: f32 = 2.4;
const TRIM_MIN_ELEMENTS: usize = 3;
const TRIM_MAX_SAMPLES: usize = 8000;
const TRIM_MAX_FRACTION: f32 = 0.3;

/// Index of the first sample past the leading adapter/stall noise, detected
/// as the point where the normalized signal settles after its initial peak.
fn trim_start(signal: &[f32]) -> usize {
    let limit = TRIM_MAX_SAMPLES.min(signal.len());
    let mut seen_peak = false;
    for window_start in (0..limit.saturating_sub(TRIM_WINDOW)).step_by(TRIM_WINDOW) {
        let window = &signal[window_start..window_start + TRIM_WINDOW];
        let num_above = window.iter().filter(|&&s| s > TRIM_THRESHOLD).count();
        if num_above > TRIM_MIN_ELEMENTS {
            seen_peak = true;
        } else if seen_peak {
            let end = window_start + TRIM_WINDOW;
            if end as f32 / signal.len() as f32 > TRIM_MAX_FRACTION {
                return 0;
            }
            return end;
        }
    }
    0
}

struct Inner {
    queue: WorkQueue<Message>,
    sink: Arc<dyn MessageSink>,
}

impl Inner {
    /// Normalizes the raw signal by med/MAD and records the linear transform
    /// back into pore current: `pA = scale * sample + shift`.
    fn scale_read(&self, read: &mut Read) {
        let Some((med, mad)) = med_mad(&read.raw_data) else {
            return;
        };
        let spread = if mad > 0.0 { MAD_SCALE * mad } else { 1.0 };
        for sample in &mut read.raw_data {
            *sample = (*sample - med) / spread;
        }
        read.shift = read.scaling * (med + read.offset);
        read.scale = read.scaling * spread;

        let trimmed = trim_start(&read.raw_data);
        if trimmed > 0 {
            read.raw_data.drain(..trimmed);
            read.num_trimmed_samples += trimmed as u64;
        }
        log::debug!(
            "Scaled read {}: shift {:.3}, scale {:.3}, trimmed {} samples",
            read.read_id,
            read.shift,
            read.scale,
            trimmed
        );
    }

    fn worker_thread(&self) {
        while let Some(message) = self.queue.pop() {
            match message {
                Message::Read(mut read) => {
                    self.scale_read(&mut read);
                    self.sink.push_message(Message::Read(read));
                }
                other => self.sink.push_message(other),
            }
        }
    }
}

/// Normalizes raw signal ahead of basecalling.
pub struct ScalerNode {
    inner: Arc<Inner>,
    workers: Vec<JoinHandle<()>>,
}

impl ScalerNode {
    pub fn new(sink: Arc<dyn MessageSink>, num_worker_threads: usize, max_reads: usize) -> Self {
        let inner = Arc::new(Inner {
            queue: WorkQueue::new(max_reads),
            sink,
        });
        let workers = (0..num_worker_threads)
            .map(|_| {
                let inner = Arc::clone(&inner);
                thread::spawn(move || inner.worker_thread())
            })
            .collect();
        ScalerNode { inner, workers }
    }
}

impl MessageSink for ScalerNode {
    fn push_message(&self, message: Message) {
        if self.inner.queue.push(message).is_err() {
            log::trace!("Scaler terminated; dropping message");
        }
    }

    fn terminate(&self) {
        self.inner.queue.terminate();
    }
}

impl Drop for ScalerNode {
    fn drop(&mut self) {
        self.inner.queue.terminate();
        for worker in self.workers.drain(..) {
            worker.join().expect("Scaler worker panicked");
        }
        self.inner.sink.terminate();
    }
}
