/// Where a chunk's signal window falls relative to the read signal. Windows
/// centered near the read ends run past the signal; the missing samples are
/// zero padding the caller node must supply.
#[derive(Debug, Clone, PartialEq)]
pub struct ContextSlice {
    pub first_sample: usize,
    pub num_samples: usize,
    pub lead_samples_needed: usize,
    pub tail_samples_needed: usize,
    /// One-hot kmer encoding per window sample, `context_samples * kmer_len * 4`.
    pub encoded_kmers: Vec<i8>,
}

/// One-hot encodes the kmer under each signal step of a fixed-length window
/// centered on a motif hit, for input into a modified base model.
pub struct ModBaseEncoder {
    context_samples: usize,
    bases_before: usize,
    bases_after: usize,
}

impl ModBaseEncoder {
    pub fn new(context_samples: usize, bases_before: usize, bases_after: usize) -> Self {
        ModBaseEncoder {
            context_samples,
            bases_before,
            bases_after,
        }
    }

    pub fn kmer_len(&self) -> usize {
        self.bases_before + 1 + self.bases_after
    }

    /// Computes the window around the base at `seq_pos` and its kmer encoding.
    /// `seq_to_sig_map` must have one entry per base plus the trailing signal
    /// length, as produced by `moves_to_map`.
    pub fn get_context(
        &self,
        seq_pos: usize,
        sequence_ints: &[i32],
        seq_to_sig_map: &[u64],
    ) -> ContextSlice {
        debug_assert!(seq_pos + 1 < seq_to_sig_map.len());
        let signal_len = *seq_to_sig_map.last().unwrap() as usize;

        let base_start = seq_to_sig_map[seq_pos] as i64;
        let base_end = seq_to_sig_map[seq_pos + 1] as i64;
        let center = (base_start + base_end) / 2;
        let first = center - (self.context_samples / 2) as i64;
        let last = first + self.context_samples as i64;

        let (first_sample, lead_samples_needed) = if first >= 0 {
            (first as usize, 0)
        } else {
            (0, (-first) as usize)
        };
        let (num_samples, tail_samples_needed) = if last > signal_len as i64 {
            (
                signal_len.saturating_sub(first_sample),
                (last - signal_len as i64) as usize,
            )
        } else {
            (last as usize - first_sample, 0)
        };

        let kmer_len = self.kmer_len();
        let mut encoded_kmers = vec![0i8; self.context_samples * kmer_len * 4];
        for slot in lead_samples_needed..lead_samples_needed + num_samples {
            let sample = first_sample + (slot - lead_samples_needed);
            // Base owning this sample: map[idx] <= sample < map[idx + 1].
            let idx = seq_to_sig_map
                .partition_point(|&s| s as usize <= sample)
                .saturating_sub(1);
            if idx >= sequence_ints.len() {
                continue;
            }
            for k in 0..kmer_len {
                let base_pos = idx as i64 - self.bases_before as i64 + k as i64;
                if base_pos < 0 || base_pos >= sequence_ints.len() as i64 {
                    continue;
                }
                let base = sequence_ints[base_pos as usize];
                if base >= 0 {
                    encoded_kmers[(slot * kmer_len + k) * 4 + base as usize] = 1;
                }
            }
        }

        ContextSlice {
            first_sample,
            num_samples,
            lead_samples_needed,
            tail_samples_needed,
            encoded_kmers,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // seq ACGT, two samples per base: map entry per base start plus signal len.
    const MAP: [u64; 5] = [0, 2, 4, 6, 8];
    const SEQ: [i32; 4] = [0, 1, 2, 3];

    #[test]
    fn test_window_inside_signal() {
        let encoder = ModBaseEncoder::new(4, 0, 0);
        let slice = encoder.get_context(1, &SEQ, &MAP);
        // base 1 covers samples [2, 4), center 3, window [1, 5).
        assert_eq!(slice.first_sample, 1);
        assert_eq!(slice.num_samples, 4);
        assert_eq!(slice.lead_samples_needed, 0);
        assert_eq!(slice.tail_samples_needed, 0);
    }

    #[test]
    fn test_window_pads_at_start() {
        let encoder = ModBaseEncoder::new(6, 0, 0);
        let slice = encoder.get_context(0, &SEQ, &MAP);
        // base 0 center is sample 1, window [-2, 4).
        assert_eq!(slice.first_sample, 0);
        assert_eq!(slice.lead_samples_needed, 2);
        assert_eq!(slice.num_samples, 4);
        assert_eq!(slice.tail_samples_needed, 0);
    }

    #[test]
    fn test_window_pads_at_end() {
        let encoder = ModBaseEncoder::new(6, 0, 0);
        let slice = encoder.get_context(3, &SEQ, &MAP);
        // base 3 center is sample 7, window [4, 10) but the signal ends at 8.
        assert_eq!(slice.first_sample, 4);
        assert_eq!(slice.num_samples, 4);
        assert_eq!(slice.lead_samples_needed, 0);
        assert_eq!(slice.tail_samples_needed, 2);
    }

    #[test]
    fn test_single_base_kmer_encoding() {
        let encoder = ModBaseEncoder::new(4, 0, 0);
        let slice = encoder.get_context(1, &SEQ, &MAP);
        // Window samples 1..5 sit over bases 0, 1, 1, 2 = A, C, C, G.
        let expect_one = [(0, 0), (1, 1), (2, 1), (3, 2)];
        for (slot, base) in expect_one {
            for b in 0..4 {
                let expected = if b == base { 1 } else { 0 };
                assert_eq!(slice.encoded_kmers[slot * 4 + b], expected);
            }
        }
    }

    #[test]
    fn test_kmer_context_spans_neighbors() {
        let encoder = ModBaseEncoder::new(2, 1, 1);
        let slice = encoder.get_context(1, &SEQ, &MAP);
        // Window samples 2..4 over base 1; kmer is A,C,G at each sample.
        assert_eq!(slice.encoded_kmers.len(), 2 * 3 * 4);
        for slot in 0..2 {
            assert_eq!(slice.encoded_kmers[(slot * 3) * 4], 1); // A
            assert_eq!(slice.encoded_kmers[(slot * 3 + 1) * 4 + 1], 1); // C
            assert_eq!(slice.encoded_kmers[(slot * 3 + 2) * 4 + 2], 1); // G
        }
    }

    #[test]
    fn test_padding_slots_are_zero() {
        let encoder = ModBaseEncoder::new(6, 0, 0);
        let slice = encoder.get_context(0, &SEQ, &MAP);
        for slot in 0..slice.lead_samples_needed {
            for b in 0..4 {
                assert_eq!(slice.encoded_kmers[slot * 4 + b], 0);
            }
        }
    }
}
