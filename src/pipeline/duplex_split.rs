//! Splits basecalled reads whose signal carries two concatenated strands.
//! Candidate spacer regions come from three kinds of evidence: an open-pore
//! current spike, a match of the sequencing adapter inside the read, and a
//! reverse-complement match between the template end and complement start.

use crate::pipeline::{Message, MessageSink, WorkQueue};
use crate::reads::Read;
use crate::utils::{
    adjust_timestamp, check_rc_match, derive_uuid, find_best_match, move_cum_sums, moves_to_map,
    PosRange,
};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

#[derive(Debug, Clone)]
pub struct DuplexSplitSettings {
    pub enabled: bool,
    /// Only the pore+adapter strategy runs in simplex mode.
    pub simplex_mode: bool,
    /// Open-pore thresholds in pA, converted per read before scanning.
    pub pore_thr: f32,
    pub relaxed_pore_thr: f32,
    /// Maximum sample gap between above-threshold samples of one pore region.
    pub pore_cl_dist: usize,
    /// Leading samples to ignore when scanning for pore regions.
    pub expect_pore_prefix: usize,
    pub adapter: String,
    pub adapter_edist: usize,
    pub relaxed_adapter_edist: usize,
    /// How far past a pore region the adapter search extends, in bases.
    pub pore_adapter_range: usize,
    /// Template-end window checked against the complement start.
    pub end_flank: usize,
    /// Bases excluded from the very end of the template-end window.
    pub end_trim: usize,
    /// Complement-start window length.
    pub start_flank: usize,
    pub flank_edist: usize,
    pub relaxed_flank_edist: usize,
    pub middle_adapter_search_span: usize,
    /// Bases at the read start where a standalone adapter match is expected anyway.
    pub expect_adapter_prefix: usize,
}

impl Default for DuplexSplitSettings {
    fn default() -> Self {
        DuplexSplitSettings {
            enabled: true,
            simplex_mode: false,
            pore_thr: 2.2,
            relaxed_pore_thr: 1.8,
            pore_cl_dist: 4000,
            expect_pore_prefix: 5000,
            adapter: "AATGTACTTCGTTCAGTTACGTATTGCT".to_string(),
            adapter_edist: 4,
            relaxed_adapter_edist: 8,
            pore_adapter_range: 100,
            end_flank: 1200,
            end_trim: 200,
            start_flank: 1700,
            flank_edist: 150,
            relaxed_flank_edist: 250,
            middle_adapter_search_span: 1000,
            expect_adapter_prefix: 200,
        }
    }
}

/// A read extended with the cached running sum of its move table.
struct ExtRead {
    read: Box<Read>,
    move_sums: Vec<u64>,
}

impl ExtRead {
    fn new(read: Box<Read>) -> Self {
        let move_sums = move_cum_sums(&read.moves);
        debug_assert!(
            move_sums.last().copied().unwrap_or(0) == read.seq.len() as u64,
            "move table and sequence length disagree"
        );
        ExtRead { read, move_sums }
    }
}

#[derive(Debug, Clone, Copy)]
enum Strategy {
    PoreAdapter,
    PoreFlank,
    PoreAll,
    AdapterFlank,
    AdapterMiddle,
}

/// Maximal runs of samples above `threshold`, merging runs separated by at
/// most `cluster_dist` samples. Half-open sample ranges.
fn detect_pore_signal(
    signal: &[f32],
    threshold: f32,
    cluster_dist: usize,
    ignore_prefix: usize,
) -> Vec<PosRange> {
    let mut regions = Vec::new();
    let mut start = 0usize;
    let mut end = 0usize;
    for (i, &sample) in signal.iter().enumerate().skip(ignore_prefix) {
        if sample > threshold {
            if end == 0 || i > end + cluster_dist {
                if end > 0 {
                    regions.push((start, end));
                }
                start = i;
            }
            end = i + 1;
        }
    }
    if end > 0 {
        regions.push((start, end));
    }
    regions
}

/// Coalesces sorted ranges whose gap is at most `merge_dist`.
fn merge_ranges(ranges: &[PosRange], merge_dist: usize) -> Vec<PosRange> {
    let mut merged: Vec<PosRange> = Vec::new();
    for &r in ranges {
        debug_assert!(merged.is_empty() || r.0 >= merged.last().unwrap().0);
        match merged.last_mut() {
            Some(last) if r.0 <= last.1 + merge_dist => last.1 = last.1.max(r.1),
            _ => merged.push(r),
        }
    }
    merged
}

/// Copies out the subread covering `seq_range` / `signal_range` of a read.
/// Both signal ends are stride aligned, except that the final subread ends
/// exactly at the signal length. The caller sets `parent_read_id`.
fn subread(read: &Read, seq_range: PosRange, signal_range: PosRange) -> Box<Read> {
    let stride = read.model_stride;
    debug_assert!(signal_range.0 % stride == 0);
    debug_assert!(
        signal_range.1 % stride == 0
            || (signal_range.1 == read.raw_data.len() && seq_range.1 == read.seq.len())
    );

    let mut sub = Box::new(read.clone());
    sub.read_id = derive_uuid(
        &read.read_id,
        &format!("{}-{}", seq_range.0, seq_range.1),
    );
    sub.raw_data = read.raw_data[signal_range.0..signal_range.1].to_vec();
    sub.seq = read.seq[seq_range.0..seq_range.1].to_vec();
    sub.qstring = read.qstring[seq_range.0..seq_range.1].to_vec();
    sub.moves = read.moves[signal_range.0 / stride..signal_range.1 / stride].to_vec();
    sub.attributes.read_number = u32::MAX;
    if !read.attributes.start_time.is_empty() && read.sample_rate > 0 {
        let offset_ms =
            (read.num_trimmed_samples + signal_range.0 as u64) * 1000 / read.sample_rate;
        match adjust_timestamp(&read.attributes.start_time, offset_ms) {
            Ok(start_time) => sub.attributes.start_time = start_time,
            Err(e) => log::warn!("Keeping start time of read {}: {}", read.read_id, e),
        }
    }
    // Absorbed into the shifted start time.
    sub.num_trimmed_samples = 0;
    sub
}

struct Inner {
    queue: WorkQueue<Message>,
    sink: Arc<dyn MessageSink>,
    settings: DuplexSplitSettings,
    strategies: Vec<(&'static str, Strategy)>,
}

impl Inner {
    /// Projects pore-signal regions into sequence coordinates through the
    /// cached move sums. Regions at the very end of the signal or before
    /// basecalls started are dropped.
    fn possible_pore_regions(&self, ext: &ExtRead, pore_thr: f32) -> Vec<PosRange> {
        let read = &ext.read;
        if read.scale == 0.0 {
            return Vec::new();
        }
        log::debug!("Analyzing signal in read {}", read.read_id);
        // pA = scale * sample + shift, so compare against (pA - shift) / scale.
        let raw_thr = (pore_thr - read.shift) / read.scale;

        let mut pore_regions = Vec::new();
        for (sig_start, sig_end) in detect_pore_signal(
            &read.raw_data,
            raw_thr,
            self.settings.pore_cl_dist,
            self.settings.expect_pore_prefix,
        ) {
            let move_start = sig_start / read.model_stride;
            let move_end = sig_end / read.model_stride;
            debug_assert!(move_end >= move_start);
            if move_start >= ext.move_sums.len()
                || move_end >= ext.move_sums.len()
                || ext.move_sums[move_start] == 0
            {
                // Very end of the signal, or basecalls have not started yet.
                continue;
            }
            let start_pos = (ext.move_sums[move_start] - 1) as usize;
            let end_pos = ext.move_sums[move_end] as usize;
            debug_assert!(end_pos > start_pos);
            pore_regions.push((start_pos, end_pos));
        }
        pore_regions
    }

    fn check_nearby_adapter(&self, read: &Read, r: PosRange, adapter_edist: usize) -> bool {
        // The spacer region itself is included in the search.
        let window = (
            r.0,
            (r.1 + self.settings.pore_adapter_range).min(read.seq.len()),
        );
        find_best_match(self.settings.adapter.as_bytes(), &read.seq, adapter_edist, window)
            .is_some()
    }

    /// `r` is a potential spacer region.
    fn check_flank_match(&self, read: &Read, r: PosRange, dist_thr: usize) -> bool {
        let s = &self.settings;
        r.0 >= s.end_flank
            && r.1 + s.start_flank <= read.seq.len()
            && check_rc_match(
                &read.seq,
                (r.0 - s.end_flank, r.0 - s.end_trim),
                // The spacer region is included in the complement window.
                (r.0, r.1 + s.start_flank),
                dist_thr,
            )
    }

    fn identify_middle_adapter_split(&self, read: &Read) -> Option<PosRange> {
        let s = &self.settings;
        let r_l = read.seq.len();
        if r_l < s.end_flank + s.start_flank || r_l < s.middle_adapter_search_span {
            return None;
        }

        let middle = r_l / 2;
        let span = s.middle_adapter_search_span / 2;
        let adapter_match = find_best_match(
            s.adapter.as_bytes(),
            &read.seq,
            s.relaxed_adapter_edist,
            (middle - span, middle + span),
        )?;
        let adapter_start = adapter_match.0;
        if adapter_start > 0
            && self.check_flank_match(read, (adapter_start, adapter_start), s.relaxed_flank_edist)
            && check_rc_match(
                &read.seq,
                (r_l - s.end_flank, r_l - s.end_trim),
                (0, s.start_flank),
                s.relaxed_flank_edist,
            )
        {
            return Some((adapter_start - 1, adapter_start));
        }
        None
    }

    fn apply_strategy(&self, strategy: Strategy, ext: &ExtRead) -> Vec<PosRange> {
        let s = &self.settings;
        match strategy {
            Strategy::PoreAdapter => self
                .possible_pore_regions(ext, s.pore_thr)
                .into_iter()
                .filter(|&r| self.check_nearby_adapter(&ext.read, r, s.adapter_edist))
                .collect(),
            Strategy::PoreFlank => {
                let candidates: Vec<PosRange> = self
                    .possible_pore_regions(ext, s.pore_thr)
                    .into_iter()
                    .filter(|&r| self.check_flank_match(&ext.read, r, s.flank_edist))
                    .collect();
                merge_ranges(&candidates, s.end_flank + s.start_flank)
            }
            Strategy::PoreAll => {
                let candidates: Vec<PosRange> = self
                    .possible_pore_regions(ext, s.relaxed_pore_thr)
                    .into_iter()
                    .filter(|&r| {
                        self.check_nearby_adapter(&ext.read, r, s.relaxed_adapter_edist)
                            && self.check_flank_match(&ext.read, r, s.relaxed_flank_edist)
                    })
                    .collect();
                merge_ranges(&candidates, s.end_flank + s.start_flank)
            }
            Strategy::AdapterFlank => {
                let seq_len = ext.read.seq.len();
                let window = (s.expect_adapter_prefix.min(seq_len), seq_len);
                find_best_match(s.adapter.as_bytes(), &ext.read.seq, s.adapter_edist, window)
                    .into_iter()
                    .filter(|&r| self.check_flank_match(&ext.read, (r.0, r.0), s.flank_edist))
                    .collect()
            }
            Strategy::AdapterMiddle => self
                .identify_middle_adapter_split(&ext.read)
                .into_iter()
                .collect(),
        }
    }

    /// Cuts a read at the given spacers, excluding the spacer intervals.
    /// Spacers must be sorted by start position.
    fn split(&self, read: Box<Read>, spacers: &[PosRange]) -> Vec<Box<Read>> {
        debug_assert!(!spacers.is_empty());
        debug_assert!(read.model_stride > 0, "splitting an unbasecalled read");
        let seq_to_sig_map = moves_to_map(&read.moves, read.model_stride, read.raw_data.len());
        debug_assert_eq!(seq_to_sig_map.len(), read.seq.len() + 1);

        let mut subreads = Vec::with_capacity(spacers.len() + 1);
        let mut start_pos = 0usize;
        let mut signal_start = seq_to_sig_map[0] as usize;
        for &r in spacers {
            subreads.push(subread(
                &read,
                (start_pos, r.0),
                (signal_start, seq_to_sig_map[r.0] as usize),
            ));
            start_pos = r.1;
            signal_start = seq_to_sig_map[r.1] as usize;
        }
        subreads.push(subread(
            &read,
            (start_pos, read.seq.len()),
            (signal_start, read.raw_data.len()),
        ));
        subreads
    }

    fn process_read(&self, read: Box<Read>) {
        let init_read_id = read.read_id.clone();
        log::debug!(
            "Processing read {}; length {}",
            init_read_id,
            read.seq.len()
        );

        let mut to_split = vec![ExtRead::new(read)];
        for &(name, strategy) in &self.strategies {
            let mut round_result = Vec::with_capacity(to_split.len());
            for ext in to_split {
                let spacers = self.apply_strategy(strategy, &ext);
                log::debug!(
                    "{} strategy: {} splits in read {}",
                    name,
                    spacers.len(),
                    init_read_id
                );
                if spacers.is_empty() {
                    round_result.push(ext);
                } else {
                    for sub in self.split(ext.read, &spacers) {
                        round_result.push(ExtRead::new(sub));
                    }
                }
            }
            to_split = round_result;
        }

        log::debug!(
            "Read {} split into {} subreads",
            init_read_id,
            to_split.len()
        );
        for ext in to_split {
            let mut sub = ext.read;
            sub.parent_read_id = init_read_id.clone();
            self.sink.push_message(Message::Read(sub));
        }
    }

    fn worker_thread(&self) {
        while let Some(message) = self.queue.pop() {
            if !self.settings.enabled {
                self.sink.push_message(message);
                continue;
            }
            match message {
                Message::Read(read) => self.process_read(read),
                other => self.sink.push_message(other),
            }
        }
    }
}

/// Node splitting pore events that were traversed twice into their subreads.
/// Reads without split evidence pass through, tagged with their own id as
/// `parent_read_id`.
pub struct DuplexSplitNode {
    inner: Arc<Inner>,
    workers: Vec<JoinHandle<()>>,
}

impl DuplexSplitNode {
    pub fn new(
        sink: Arc<dyn MessageSink>,
        settings: DuplexSplitSettings,
        num_worker_threads: usize,
        max_reads: usize,
    ) -> Self {
        let mut strategies = vec![("PORE_ADAPTER", Strategy::PoreAdapter)];
        if !settings.simplex_mode {
            strategies.extend([
                ("PORE_FLANK", Strategy::PoreFlank),
                ("PORE_ALL", Strategy::PoreAll),
                ("ADAPTER_FLANK", Strategy::AdapterFlank),
                ("ADAPTER_MIDDLE", Strategy::AdapterMiddle),
            ]);
        }
        let inner = Arc::new(Inner {
            queue: WorkQueue::new(max_reads),
            sink,
            settings,
            strategies,
        });
        let workers = (0..num_worker_threads)
            .map(|i| {
                let inner = Arc::clone(&inner);
                thread::Builder::new()
                    .name(format!("split-{}", i))
                    .spawn(move || inner.worker_thread())
                    .expect("Failed to spawn split worker")
            })
            .collect();
        DuplexSplitNode { inner, workers }
    }
}

impl MessageSink for DuplexSplitNode {
    fn push_message(&self, message: Message) {
        if self.inner.queue.push(message).is_err() {
            log::trace!("Split node terminated; dropping message");
        }
    }

    fn terminate(&self) {
        self.inner.queue.terminate();
    }
}

impl Drop for DuplexSplitNode {
    fn drop(&mut self) {
        self.inner.queue.terminate();
        for worker in self.workers.drain(..) {
            worker.join().expect("Split worker panicked");
        }
        self.inner.sink.terminate();
    }
}
