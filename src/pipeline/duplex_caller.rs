//! Basespace duplex calling: decodes a template/complement pair into a single
//! higher-accuracy consensus read by aligning the template against the
//! reverse-complemented complement and arbitrating disagreements by quality.

use crate::pipeline::{Message, MessageSink, WorkQueue};
use crate::reads::{Read, ReadPair};
use crate::utils::reverse_complement;
use bio::alignment::pairwise::Aligner;
use bio::alignment::AlignmentOperation;
use itertools::Itertools;
use std::sync::Arc;
use std::thread::{self, JoinHandle};

/// Phred cap for bases confirmed by both strands.
const MAX_DUPLEX_QSCORE: u8 = 50;

fn call_duplex(pair: &ReadPair) -> Option<Box<Read>> {
    let template = &pair.template;
    let complement = &pair.complement;
    if template.seq.is_empty() || complement.seq.is_empty() {
        log::warn!(
            "Cannot duplex call pair {};{}: missing basecall",
            template.read_id,
            complement.read_id
        );
        return None;
    }

    let rc_seq = reverse_complement(&complement.seq);
    let mut rc_qual = complement.qstring.clone();
    rc_qual.reverse();

    let mut aligner = Aligner::with_capacity(
        template.seq.len(),
        rc_seq.len(),
        -5,
        -1,
        |a: u8, b: u8| if a == b { 1 } else { -1 },
    );
    let alignment = aligner.global(&template.seq, &rc_seq);

    let mut seq = Vec::with_capacity(template.seq.len());
    let mut qstring = Vec::with_capacity(template.seq.len());
    let mut x_pos = 0;
    let mut y_pos = 0;
    for (op, group) in &alignment.operations.iter().group_by(|op| **op) {
        let op_len = group.count();
        match op {
            AlignmentOperation::Match => {
                for k in 0..op_len {
                    let qt = template.qstring[x_pos + k].saturating_sub(33);
                    let qc = rc_qual[y_pos + k].saturating_sub(33);
                    seq.push(template.seq[x_pos + k]);
                    qstring.push(33 + (qt + qc).min(MAX_DUPLEX_QSCORE));
                }
                x_pos += op_len;
                y_pos += op_len;
            }
            AlignmentOperation::Subst => {
                for k in 0..op_len {
                    let qt = template.qstring[x_pos + k].saturating_sub(33);
                    let qc = rc_qual[y_pos + k].saturating_sub(33);
                    if qt >= qc {
                        seq.push(template.seq[x_pos + k]);
                        qstring.push(33 + (qt - qc));
                    } else {
                        seq.push(rc_seq[y_pos + k]);
                        qstring.push(33 + (qc - qt));
                    }
                }
                x_pos += op_len;
                y_pos += op_len;
            }
            AlignmentOperation::Ins => {
                // Template-only bases keep their simplex quality.
                for k in 0..op_len {
                    seq.push(template.seq[x_pos + k]);
                    qstring.push(template.qstring[x_pos + k]);
                }
                x_pos += op_len;
            }
            AlignmentOperation::Del => {
                y_pos += op_len;
            }
            _ => unreachable!("global alignment produced a clip"),
        }
    }

    let mut duplex = Box::new(Read {
        read_id: format!("{};{}", template.read_id, complement.read_id),
        seq,
        qstring,
        is_duplex: true,
        sample_rate: template.sample_rate,
        attributes: template.attributes.clone(),
        ..Default::default()
    });
    duplex.attributes.num_samples = 0;
    Some(duplex)
}

struct Inner {
    queue: WorkQueue<Message>,
    sink: Arc<dyn MessageSink>,
}

impl Inner {
    fn worker_thread(&self) {
        while let Some(message) = self.queue.pop() {
            match message {
                Message::Pair(pair) => {
                    if let Some(duplex) = call_duplex(&pair) {
                        log::debug!(
                            "Duplex called {} ({} bp)",
                            duplex.read_id,
                            duplex.seq.len()
                        );
                        self.sink.push_message(Message::Read(duplex));
                    }
                }
                other => self.sink.push_message(other),
            }
        }
    }
}

/// Consumes `ReadPair` messages and emits duplex consensus reads.
pub struct DuplexCallerNode {
    inner: Arc<Inner>,
    workers: Vec<JoinHandle<()>>,
}

impl DuplexCallerNode {
    pub fn new(sink: Arc<dyn MessageSink>, num_worker_threads: usize, max_reads: usize) -> Self {
        let inner = Arc::new(Inner {
            queue: WorkQueue::new(max_reads),
            sink,
        });
        let workers = (0..num_worker_threads)
            .map(|i| {
                let inner = Arc::clone(&inner);
                thread::Builder::new()
                    .name(format!("duplex-{}", i))
                    .spawn(move || inner.worker_thread())
                    .expect("Failed to spawn duplex caller worker")
            })
            .collect();
        DuplexCallerNode { inner, workers }
    }
}

impl MessageSink for DuplexCallerNode {
    fn push_message(&self, message: Message) {
        if self.inner.queue.push(message).is_err() {
            log::trace!("Duplex caller terminated; dropping message");
        }
    }

    fn terminate(&self) {
        self.inner.queue.terminate();
    }
}

impl Drop for DuplexCallerNode {
    fn drop(&mut self) {
        self.inner.queue.terminate();
        for worker in self.workers.drain(..) {
            worker.join().expect("Duplex caller worker panicked");
        }
        self.inner.sink.terminate();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::testing::CaptureSink;

    fn read_with(id: &str, seq: &[u8], q: u8) -> Box<Read> {
        Box::new(Read {
            read_id: id.to_string(),
            qstring: vec![b'!' + q; seq.len()],
            seq: seq.to_vec(),
            sample_rate: 4000,
            ..Default::default()
        })
    }

    fn run_pair(template: Box<Read>, complement: Box<Read>) -> Vec<Read> {
        let sink = Arc::new(CaptureSink::default());
        {
            let node = DuplexCallerNode::new(sink.clone(), 1, 10);
            node.push_message(Message::Pair(Box::new(ReadPair {
                template,
                complement,
            })));
        }
        sink.reads()
    }

    #[test]
    fn test_perfect_pair_consensus() {
        let template = read_with("t", b"ACGTTGCAACGT", 20);
        let complement = read_with("c", &reverse_complement(b"ACGTTGCAACGT"), 20);
        let reads = run_pair(template, complement);
        assert_eq!(reads.len(), 1);
        let duplex = &reads[0];
        assert_eq!(duplex.read_id, "t;c");
        assert!(duplex.is_duplex);
        assert_eq!(duplex.seq, b"ACGTTGCAACGT".to_vec());
        // Confirmed bases get the summed quality.
        assert!(duplex.qstring.iter().all(|&q| q == 33 + 40));
        // No signal-domain payload on a consensus read.
        assert!(duplex.raw_data.is_empty());
        assert!(duplex.moves.is_empty());
    }

    #[test]
    fn test_mismatch_resolved_by_quality() {
        let seq_t = b"ACGTTGCAACGT".to_vec();
        let mut seq_c = seq_t.clone();
        seq_c[5] = b'A'; // disagree at position 5 (G in template)
        let template = read_with("t", &seq_t, 10);
        let complement = read_with("c", &reverse_complement(&seq_c), 30);
        let reads = run_pair(template, complement);
        let duplex = &reads[0];
        // The higher-quality complement wins the disagreement.
        assert_eq!(duplex.seq[5], b'A');
        assert_eq!(duplex.qstring[5], 33 + 20);
    }

    #[test]
    fn test_empty_basecall_is_skipped() {
        let template = read_with("t", b"", 20);
        let complement = read_with("c", b"ACGT", 20);
        let reads = run_pair(template, complement);
        assert!(reads.is_empty());
    }
}
