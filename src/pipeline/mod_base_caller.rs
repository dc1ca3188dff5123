//! Calls modified bases on basecalled reads. Input workers chunk the signal
//! around motif hits, per-caller batching workers feed chunks through the
//! model runners with a deadline-driven flush, and a single output worker
//! scatters scores back into the originating reads, forwarding each read only
//! once every one of its chunks has been scored.

use crate::modbase::{
    aggregate_modbase_info, BaseModInfo, ModBaseEncoder, ModBaseRunner,
};
use crate::pipeline::{Message, MessageSink, WorkQueue};
use crate::reads::Read;
use crate::utils::{base_id, moves_to_map, sequence_to_ints, Result};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

const FORCE_TIMEOUT: Duration = Duration::from_millis(100);

/// A fixed-length signal window around one motif hit, the unit of batching.
/// The source read stays in the node's working-reads table, keyed by
/// `read_key`, until all of its chunks have been scored.
struct ModBaseChunk {
    read_key: u64,
    context_hit: usize,
    signal: Vec<f32>,
    encoded_kmers: Vec<i8>,
    scores: Vec<f32>,
}

struct Inner {
    queue: WorkQueue<Message>,
    sink: Arc<dyn MessageSink>,
    runners: Vec<Arc<dyn ModBaseRunner>>,
    batch_size: usize,
    block_stride: usize,
    num_states: usize,
    base_prob_offsets: [usize; 4],
    base_mod_info: Arc<BaseModInfo>,

    // One queue per caller, all under one mutex; runner workers signal
    // chunk_queues_cv as they drain, input workers wait on it for space.
    chunk_queues: Mutex<Vec<VecDeque<ModBaseChunk>>>,
    chunks_added_cv: Condvar,
    chunk_queues_cv: Condvar,

    processed_chunks: Mutex<Vec<ModBaseChunk>>,
    processed_chunks_cv: Condvar,

    working_reads: Mutex<HashMap<u64, Box<Read>>>,
    next_read_key: AtomicU64,

    num_active_input_workers: AtomicUsize,
    num_active_runner_workers: AtomicUsize,
    terminate_runners: AtomicBool,
    terminate_output: AtomicBool,
}

impl Inner {
    fn input_worker_thread(&self) {
        while let Some(message) = self.queue.pop() {
            let read = match message {
                Message::Read(read) => read,
                other => {
                    self.sink.push_message(other);
                    continue;
                }
            };
            if let Err(e) = self.process_read(read) {
                log::error!("{}", e);
            }
        }

        let remaining = self.num_active_input_workers.fetch_sub(1, Ordering::SeqCst) - 1;
        if remaining == 0 {
            self.terminate_runners.store(true, Ordering::SeqCst);
            self.chunks_added_cv.notify_all();
        }
    }

    fn process_read(&self, mut read: Box<Read>) -> Result<()> {
        // Backpressure: wait until every caller queue is below its cap.
        let max_chunks_in = self.batch_size * 5;
        {
            let mut queues = self.chunk_queues.lock().unwrap();
            while !queues.iter().all(|q| q.len() < max_chunks_in) {
                queues = self.chunk_queues_cv.wait(queues).unwrap();
            }
        }

        // Initialize the probability table before any chunks are handed out:
        // every position starts fully canonical.
        read.base_mod_probs = vec![0; read.seq.len() * self.num_states];
        for (i, &base) in read.seq.iter().enumerate() {
            let id = base_id(base).ok_or_else(|| {
                format!(
                    "Invalid character '{}' in sequence of read {}",
                    base as char, read.read_id
                )
            })?;
            read.base_mod_probs[i * self.num_states + self.base_prob_offsets[id]] = 255;
        }
        read.base_mod_info = Some(Arc::clone(&self.base_mod_info));

        let sequence_ints = sequence_to_ints(&read.seq)?;
        let seq_to_sig_map =
            moves_to_map(&read.moves, self.block_stride, read.raw_data.len());
        debug_assert_eq!(seq_to_sig_map.len(), read.seq.len() + 1);

        read.num_modbase_chunks = 0;
        read.num_modbase_chunks_called = 0;

        // All runners share the same callers; use the first for chunking.
        let runner = &self.runners[0];
        let read_key = self.next_read_key.fetch_add(1, Ordering::SeqCst);
        let mut chunks_to_enqueue: Vec<Vec<ModBaseChunk>> = Vec::with_capacity(runner.num_callers());
        for caller_id in 0..runner.num_callers() {
            let params = runner.caller_params(caller_id);
            let scaled =
                runner.scale_signal(caller_id, &read.raw_data, &sequence_ints, &seq_to_sig_map);
            let encoder = ModBaseEncoder::new(
                params.context_samples(),
                params.bases_before,
                params.bases_after,
            );

            let context_hits = runner.motif_hits(caller_id, &read.seq);
            let mut caller_chunks = Vec::with_capacity(context_hits.len());
            for context_hit in context_hits {
                let slice = encoder.get_context(context_hit, &sequence_ints, &seq_to_sig_map);
                let mut signal = vec![0.0f32; params.context_samples()];
                signal[slice.lead_samples_needed..slice.lead_samples_needed + slice.num_samples]
                    .copy_from_slice(
                        &scaled[slice.first_sample..slice.first_sample + slice.num_samples],
                    );
                caller_chunks.push(ModBaseChunk {
                    read_key,
                    context_hit,
                    signal,
                    encoded_kmers: slice.encoded_kmers,
                    scores: Vec::new(),
                });
                read.num_modbase_chunks += 1;
            }
            chunks_to_enqueue.push(caller_chunks);
        }

        if read.num_modbase_chunks == 0 {
            // No modified bases to call, pass directly to the next node.
            self.sink.push_message(Message::Read(read));
            return Ok(());
        }

        // Register the read before its chunks become visible to the scorers.
        self.working_reads.lock().unwrap().insert(read_key, read);
        for (caller_id, caller_chunks) in chunks_to_enqueue.into_iter().enumerate() {
            let num_added = caller_chunks.len();
            if num_added == 0 {
                continue;
            }
            let mut queues = self.chunk_queues.lock().unwrap();
            queues[caller_id].extend(caller_chunks);
            drop(queues);
            if num_added > self.batch_size {
                self.chunks_added_cv.notify_all();
            } else {
                self.chunks_added_cv.notify_one();
            }
        }
        Ok(())
    }

    fn runner_worker_thread(&self, worker_id: usize, caller_id: usize) {
        let runner = Arc::clone(&self.runners[worker_id]);
        let mut batched_chunks: Vec<ModBaseChunk> = Vec::new();
        let mut last_chunk_reserve_time = Instant::now();

        loop {
            let mut queues = self.chunk_queues.lock().unwrap();
            let deadline = last_chunk_reserve_time + FORCE_TIMEOUT;
            let mut timed_out = false;
            while queues[caller_id].is_empty() && !self.terminate_runners.load(Ordering::SeqCst) {
                let now = Instant::now();
                if now >= deadline {
                    timed_out = true;
                    break;
                }
                let (guard, _) = self
                    .chunks_added_cv
                    .wait_timeout(queues, deadline - now)
                    .unwrap();
                queues = guard;
            }

            if timed_out {
                // No new chunks within the deadline: flush what we have.
                drop(queues);
                if !batched_chunks.is_empty() {
                    self.call_current_batch(&*runner, caller_id, &mut batched_chunks);
                }
                last_chunk_reserve_time = Instant::now();
                continue;
            }

            if queues[caller_id].is_empty() && self.terminate_runners.load(Ordering::SeqCst) {
                drop(queues);
                if !batched_chunks.is_empty() {
                    self.call_current_batch(&*runner, caller_id, &mut batched_chunks);
                }
                let remaining =
                    self.num_active_runner_workers.fetch_sub(1, Ordering::SeqCst) - 1;
                if remaining == 0 {
                    self.terminate_output.store(true, Ordering::SeqCst);
                    self.processed_chunks_cv.notify_one();
                }
                return;
            }

            // Grab what fits in the current batch while holding the lock, but
            // only feed the runner after releasing it.
            let previous_chunk_count = batched_chunks.len();
            while batched_chunks.len() != self.batch_size && !queues[caller_id].is_empty() {
                batched_chunks.push(queues[caller_id].pop_front().unwrap());
                last_chunk_reserve_time = Instant::now();
            }
            drop(queues);
            self.chunk_queues_cv.notify_one();

            for (chunk_idx, chunk) in batched_chunks
                .iter()
                .enumerate()
                .skip(previous_chunk_count)
            {
                runner.accept_chunk(caller_id, chunk_idx, &chunk.signal, &chunk.encoded_kmers);
            }

            if batched_chunks.len() == self.batch_size {
                self.call_current_batch(&*runner, caller_id, &mut batched_chunks);
            }
        }
    }

    fn call_current_batch(
        &self,
        runner: &dyn ModBaseRunner,
        caller_id: usize,
        batched_chunks: &mut Vec<ModBaseChunk>,
    ) {
        let batch = match runner.call_chunks(caller_id, batched_chunks.len()) {
            Ok(batch) => batch,
            Err(e) => {
                // Runner failures are fatal for the stage; termination
                // propagates through the queues.
                log::error!("Modified base model call failed: {}", e);
                self.queue.terminate();
                batched_chunks.clear();
                return;
            }
        };
        debug_assert_eq!(batch.scores.len(), batched_chunks.len() * batch.row_size);

        let mut processed = self.processed_chunks.lock().unwrap();
        for (i, mut chunk) in batched_chunks.drain(..).enumerate() {
            chunk.scores = batch.scores[i * batch.row_size..(i + 1) * batch.row_size].to_vec();
            processed.push(chunk);
        }
        drop(processed);
        self.processed_chunks_cv.notify_one();
    }

    fn output_worker_thread(&self) {
        loop {
            let mut processed = self.processed_chunks.lock().unwrap();
            while processed.is_empty() && !self.terminate_output.load(Ordering::SeqCst) {
                processed = self.processed_chunks_cv.wait(processed).unwrap();
            }
            if processed.is_empty() && self.terminate_output.load(Ordering::SeqCst) {
                self.sink.terminate();
                return;
            }
            let chunks: Vec<ModBaseChunk> = processed.drain(..).collect();
            drop(processed);

            let mut working_reads = self.working_reads.lock().unwrap();
            for chunk in &chunks {
                let Some(read) = working_reads.get_mut(&chunk.read_key) else {
                    log::error!("Scored chunk for unknown read key {}", chunk.read_key);
                    continue;
                };
                let result_pos = chunk.context_hit;
                // The sequence was validated when the chunks were generated.
                let offset = self.base_prob_offsets[base_id(read.seq[result_pos]).unwrap()];
                for (i, &score) in chunk.scores.iter().enumerate() {
                    read.base_mod_probs[self.num_states * result_pos + offset + i] =
                        (score * 256.0).floor().min(255.0) as u8;
                }
                read.num_modbase_chunks_called += 1;
            }

            // Move completed reads on to the next node.
            let completed: Vec<u64> = working_reads
                .iter()
                .filter(|(_, read)| read.num_modbase_chunks_called == read.num_modbase_chunks)
                .map(|(&key, _)| key)
                .collect();
            for key in completed {
                let read = working_reads.remove(&key).unwrap();
                self.sink.push_message(Message::Read(read));
            }
        }
    }
}

/// Node producing per-position modified base probabilities through a set of
/// opaque model runners, one worker thread per (runner, caller) pair.
pub struct ModBaseCallerNode {
    inner: Arc<Inner>,
    input_workers: Vec<JoinHandle<()>>,
    runner_workers: Vec<JoinHandle<()>>,
    output_worker: Option<JoinHandle<()>>,
}

impl ModBaseCallerNode {
    pub fn new(
        sink: Arc<dyn MessageSink>,
        runners: Vec<Arc<dyn ModBaseRunner>>,
        num_input_workers: usize,
        block_stride: usize,
        batch_size: usize,
        max_reads: usize,
    ) -> Result<Self> {
        assert!(!runners.is_empty() && batch_size > 0);
        let num_callers = runners[0].num_callers();
        let params: Vec<_> = (0..num_callers)
            .map(|caller_id| runners[0].caller_params(caller_id))
            .collect();
        let aggregate = aggregate_modbase_info(&params)?;

        let inner = Arc::new(Inner {
            queue: WorkQueue::new(max_reads),
            sink,
            batch_size,
            block_stride,
            num_states: aggregate.num_states,
            base_prob_offsets: aggregate.base_prob_offsets,
            base_mod_info: Arc::new(aggregate.info),
            chunk_queues: Mutex::new((0..num_callers).map(|_| VecDeque::new()).collect()),
            chunks_added_cv: Condvar::new(),
            chunk_queues_cv: Condvar::new(),
            processed_chunks: Mutex::new(Vec::new()),
            processed_chunks_cv: Condvar::new(),
            working_reads: Mutex::new(HashMap::new()),
            next_read_key: AtomicU64::new(0),
            num_active_input_workers: AtomicUsize::new(num_input_workers),
            num_active_runner_workers: AtomicUsize::new(runners.len() * num_callers),
            terminate_runners: AtomicBool::new(false),
            terminate_output: AtomicBool::new(false),
            runners,
        });

        let output_worker = {
            let inner = Arc::clone(&inner);
            thread::Builder::new()
                .name("modbase-out".to_string())
                .spawn(move || inner.output_worker_thread())
                .expect("Failed to spawn modbase output worker")
        };

        let mut runner_workers = Vec::new();
        for worker_id in 0..inner.runners.len() {
            for caller_id in 0..num_callers {
                let inner = Arc::clone(&inner);
                runner_workers.push(
                    thread::Builder::new()
                        .name(format!("modbase-{}-{}", worker_id, caller_id))
                        .spawn(move || inner.runner_worker_thread(worker_id, caller_id))
                        .expect("Failed to spawn modbase runner worker"),
                );
            }
        }

        let input_workers = (0..num_input_workers)
            .map(|i| {
                let inner = Arc::clone(&inner);
                thread::Builder::new()
                    .name(format!("modbase-in-{}", i))
                    .spawn(move || inner.input_worker_thread())
                    .expect("Failed to spawn modbase input worker")
            })
            .collect();

        Ok(ModBaseCallerNode {
            inner,
            input_workers,
            runner_workers,
            output_worker: Some(output_worker),
        })
    }
}

impl MessageSink for ModBaseCallerNode {
    fn push_message(&self, message: Message) {
        if self.inner.queue.push(message).is_err() {
            log::trace!("Modbase node terminated; dropping message");
        }
    }

    fn terminate(&self) {
        self.inner.queue.terminate();
    }
}

impl Drop for ModBaseCallerNode {
    fn drop(&mut self) {
        self.inner.queue.terminate();
        for worker in self.input_workers.drain(..) {
            worker.join().expect("Modbase input worker panicked");
        }
        for worker in self.runner_workers.drain(..) {
            worker.join().expect("Modbase runner worker panicked");
        }
        // The output worker terminates the downstream sink on exit.
        if let Some(worker) = self.output_worker.take() {
            worker.join().expect("Modbase output worker panicked");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::modbase::{find_motif_hits, CallerParams, ScoreBatch};
    use crate::pipeline::testing::CaptureSink;

    const STRIDE: usize = 2;

    struct MockRunner {
        params: Vec<CallerParams>,
        score: f32,
    }

    impl MockRunner {
        fn cpg(score: f32) -> Self {
            MockRunner {
                params: vec![CallerParams {
                    context_before: 8,
                    context_after: 8,
                    bases_before: 1,
                    bases_after: 1,
                    motif: "CG".to_string(),
                    motif_offset: 0,
                    mod_bases: "m".to_string(),
                    mod_long_names: vec!["5mC".to_string()],
                }],
                score,
            }
        }

        fn with_motif(motif: &str) -> Self {
            let mut runner = MockRunner::cpg(0.75);
            runner.params[0].motif = motif.to_string();
            runner
        }
    }

    impl ModBaseRunner for MockRunner {
        fn num_callers(&self) -> usize {
            self.params.len()
        }

        fn caller_params(&self, caller_id: usize) -> &CallerParams {
            &self.params[caller_id]
        }

        fn scale_signal(
            &self,
            _caller_id: usize,
            signal: &[f32],
            _sequence_ints: &[i32],
            _seq_to_sig_map: &[u64],
        ) -> Vec<f32> {
            signal.to_vec()
        }

        fn motif_hits(&self, caller_id: usize, seq: &[u8]) -> Vec<usize> {
            let params = &self.params[caller_id];
            find_motif_hits(seq, params.motif.as_bytes(), params.motif_offset)
        }

        fn accept_chunk(
            &self,
            _caller_id: usize,
            _chunk_idx: usize,
            signal: &[f32],
            encoded_kmers: &[i8],
        ) {
            assert_eq!(signal.len(), self.params[0].context_samples());
            assert!(!encoded_kmers.is_empty());
        }

        fn call_chunks(&self, _caller_id: usize, num_chunks: usize) -> Result<ScoreBatch> {
            let row = vec![1.0 - self.score, self.score];
            Ok(ScoreBatch {
                scores: row
                    .iter()
                    .cycle()
                    .take(num_chunks * row.len())
                    .copied()
                    .collect(),
                row_size: row.len(),
            })
        }
    }

    fn basecalled_read(id: &str, seq: &[u8]) -> Box<Read> {
        Box::new(Read {
            read_id: id.to_string(),
            raw_data: vec![0.5; seq.len() * STRIDE],
            moves: vec![1; seq.len()],
            qstring: vec![b'5'; seq.len()],
            seq: seq.to_vec(),
            model_stride: STRIDE,
            ..Default::default()
        })
    }

    fn run_node(runner: MockRunner, batch_size: usize, reads: Vec<Box<Read>>) -> Vec<Read> {
        let sink = Arc::new(CaptureSink::default());
        {
            let node = ModBaseCallerNode::new(
                sink.clone(),
                vec![Arc::new(runner) as Arc<dyn ModBaseRunner>],
                2,
                STRIDE,
                batch_size,
                100,
            )
            .unwrap();
            for read in reads {
                node.push_message(Message::Read(read));
            }
        }
        sink.reads()
    }

    #[test]
    fn test_canonical_init_without_motif_hits() {
        // No CAA motif in ACGT: the read passes straight through with a fully
        // canonical probability table.
        let reads = run_node(
            MockRunner::with_motif("CAA"),
            4,
            vec![basecalled_read("r0", b"ACGT")],
        );
        assert_eq!(reads.len(), 1);
        let read = &reads[0];
        let num_states = 5;
        let offsets = [0usize, 1, 3, 4];
        assert_eq!(read.base_mod_probs.len(), 4 * num_states);
        for (i, &base) in read.seq.iter().enumerate() {
            for state in 0..num_states {
                let expected = if state == offsets[base_id(base).unwrap()] {
                    255
                } else {
                    0
                };
                assert_eq!(read.base_mod_probs[i * num_states + state], expected);
            }
        }
        assert_eq!(read.num_modbase_chunks, 0);
        assert_eq!(read.num_modbase_chunks_called, 0);
        assert!(read.base_mod_info.is_some());
    }

    #[test]
    fn test_scores_scattered_into_read() {
        // Single CG hit at position 3.
        let reads = run_node(
            MockRunner::cpg(0.75),
            4,
            vec![basecalled_read("r0", b"ATACGTTA")],
        );
        assert_eq!(reads.len(), 1);
        let read = &reads[0];
        let num_states = 5;
        assert_eq!(read.num_modbase_chunks, 1);
        assert_eq!(read.num_modbase_chunks_called, 1);
        // C column offset is 1: canonical then 5mC, quantized to u8.
        assert_eq!(read.base_mod_probs[3 * num_states + 1], 64);
        assert_eq!(read.base_mod_probs[3 * num_states + 2], 192);
        // Untouched positions stay fully canonical.
        assert_eq!(read.base_mod_probs[1 * num_states + 4], 255);
    }

    #[test]
    fn test_probability_rows_sum_to_one_within_quantization() {
        let reads = run_node(
            MockRunner::cpg(0.4),
            4,
            vec![basecalled_read("r0", b"ACGCGCGT")],
        );
        let read = &reads[0];
        let num_states = 5;
        for i in 0..read.seq.len() {
            let row = &read.base_mod_probs[i * num_states..(i + 1) * num_states];
            let total: u32 = row.iter().map(|&p| p as u32).sum();
            // 255 for untouched rows; scored rows quantize to within 2/256.
            assert!((253..=256).contains(&total), "row {} sums to {}", i, total);
        }
    }

    #[test]
    fn test_malformed_read_is_dropped() {
        let reads = run_node(
            MockRunner::cpg(0.75),
            4,
            vec![
                basecalled_read("bad", b"ACGNNT"),
                basecalled_read("good", b"ACGT"),
            ],
        );
        assert_eq!(reads.len(), 1);
        assert_eq!(reads[0].read_id, "good");
    }

    #[test]
    fn test_timeout_flush_forwards_read() {
        // Batch size far above the chunk count: only the 100 ms deadline can
        // flush the batch.
        let sink = Arc::new(CaptureSink::default());
        let node = ModBaseCallerNode::new(
            sink.clone(),
            vec![Arc::new(MockRunner::cpg(0.75)) as Arc<dyn ModBaseRunner>],
            1,
            STRIDE,
            64,
            100,
        )
        .unwrap();
        node.push_message(Message::Read(basecalled_read("r0", b"ATACGTTA")));

        let deadline = Instant::now() + Duration::from_secs(5);
        while sink.reads().is_empty() && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(10));
        }
        let reads = sink.reads();
        assert_eq!(reads.len(), 1);
        assert_eq!(reads[0].num_modbase_chunks_called, 1);
        drop(node);
    }

    #[test]
    fn test_graceful_shutdown_with_reads_in_flight() {
        let reads: Vec<Box<Read>> = (0..200)
            .map(|i| basecalled_read(&format!("read-{}", i), &b"AACGTACGTT".repeat(4)))
            .collect();
        let out = run_node(MockRunner::cpg(0.6), 8, reads);
        assert_eq!(out.len(), 200);
        for read in &out {
            assert!(read.num_modbase_chunks > 0);
            assert_eq!(read.num_modbase_chunks_called, read.num_modbase_chunks);
        }
    }

    #[test]
    fn test_split_and_modbase_pass_through_chain() {
        // A read with no pore regions and no motif hits emerges from a
        // split + modbase chain unchanged apart from processing metadata.
        use crate::pipeline::{DuplexSplitNode, DuplexSplitSettings};

        let read = basecalled_read("r0", b"ATTATATTAA");
        let (seq, raw, moves, qstring) = (
            read.seq.clone(),
            read.raw_data.clone(),
            read.moves.clone(),
            read.qstring.clone(),
        );

        let sink = Arc::new(CaptureSink::default());
        {
            let modbase = Arc::new(
                ModBaseCallerNode::new(
                    sink.clone(),
                    vec![Arc::new(MockRunner::cpg(0.75)) as Arc<dyn ModBaseRunner>],
                    1,
                    STRIDE,
                    4,
                    100,
                )
                .unwrap(),
            );
            let split = DuplexSplitNode::new(
                modbase.clone(),
                DuplexSplitSettings {
                    expect_pore_prefix: 0,
                    ..Default::default()
                },
                1,
                100,
            );
            split.push_message(Message::Read(read));
        }

        let reads = sink.reads();
        assert_eq!(reads.len(), 1);
        let out = &reads[0];
        assert_eq!(out.seq, seq);
        assert_eq!(out.raw_data, raw);
        assert_eq!(out.moves, moves);
        assert_eq!(out.qstring, qstring);
        assert_eq!(out.read_id, "r0");
        // Only processing metadata changed.
        assert_eq!(out.parent_read_id, "r0");
        assert!(out.base_mod_info.is_some());
        assert_eq!(out.num_modbase_chunks, 0);
        assert!(sink.is_terminated());
    }

    #[test]
    fn test_sink_terminated_after_shutdown() {
        let sink = Arc::new(CaptureSink::default());
        {
            let node = ModBaseCallerNode::new(
                sink.clone(),
                vec![Arc::new(MockRunner::cpg(0.75)) as Arc<dyn ModBaseRunner>],
                1,
                STRIDE,
                4,
                100,
            )
            .unwrap();
            node.push_message(Message::Read(basecalled_read("r0", b"ATACGTTA")));
        }
        assert!(sink.is_terminated());
    }
}
