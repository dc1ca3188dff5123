use crate::utils::Result;

/// Index of a canonical base in the ACGT ordering, or `None` for anything else.
pub fn base_id(base: u8) -> Option<usize> {
    match base {
        b'A' => Some(0),
        b'C' => Some(1),
        b'G' => Some(2),
        b'T' => Some(3),
        _ => None,
    }
}

pub fn sequence_to_ints(seq: &[u8]) -> Result<Vec<i32>> {
    seq.iter()
        .map(|&b| {
            base_id(b)
                .map(|id| id as i32)
                .ok_or_else(|| format!("Invalid character '{}' in sequence", b as char))
        })
        .collect()
}

pub fn reverse_complement(seq: &[u8]) -> Vec<u8> {
    bio::alphabets::dna::revcomp(seq)
}

/// Running sum of the move table: `out[i]` is the number of bases emitted by
/// downsampled signal block `i` inclusive.
pub fn move_cum_sums(moves: &[u8]) -> Vec<u64> {
    let mut sums = Vec::with_capacity(moves.len());
    let mut total = 0u64;
    for &m in moves {
        total += m as u64;
        sums.push(total);
    }
    sums
}

/// Maps each base index to the signal sample where it starts. The result has
/// one entry per emitted base plus a final entry holding `signal_len`, so a
/// base `i` covers samples `[map[i], map[i + 1])`.
pub fn moves_to_map(moves: &[u8], block_stride: usize, signal_len: usize) -> Vec<u64> {
    let mut map = Vec::with_capacity(moves.iter().filter(|&&m| m == 1).count() + 1);
    for (i, &m) in moves.iter().enumerate() {
        if m == 1 {
            map.push((i * block_stride) as u64);
        }
    }
    map.push(signal_len as u64);
    map
}

/// Mean qscore of a phred+33 quality string, averaged in error space.
pub fn mean_qscore_from_qstring(qstring: &[u8]) -> f32 {
    if qstring.is_empty() {
        return 0.0;
    }
    let mean_err = qstring
        .iter()
        .map(|&q| {
            let phred = q.saturating_sub(33) as f32;
            10f32.powf(-phred / 10.0)
        })
        .sum::<f32>()
        / qstring.len() as f32;
    -10.0 * mean_err.max(1e-7).log10()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_base_id() {
        assert_eq!(base_id(b'A'), Some(0));
        assert_eq!(base_id(b'C'), Some(1));
        assert_eq!(base_id(b'G'), Some(2));
        assert_eq!(base_id(b'T'), Some(3));
        assert_eq!(base_id(b'N'), None);
        assert_eq!(base_id(b'a'), None);
    }

    #[test]
    fn test_sequence_to_ints() {
        assert_eq!(sequence_to_ints(b"ACGT").unwrap(), vec![0, 1, 2, 3]);
        assert!(sequence_to_ints(b"ACNGT").is_err());
    }

    #[test]
    fn test_reverse_complement() {
        assert_eq!(reverse_complement(b"AATGC"), b"GCATT".to_vec());
        assert_eq!(reverse_complement(b""), Vec::<u8>::new());
    }

    #[test]
    fn test_move_cum_sums() {
        //                T  A     T        T  C
        let moves = [1u8, 1, 0, 1, 0, 0, 1, 1, 0];
        assert_eq!(move_cum_sums(&moves), vec![1, 2, 2, 3, 3, 3, 4, 5, 5]);
        assert!(move_cum_sums(&[]).is_empty());
    }

    #[test]
    fn test_moves_to_map() {
        let moves = [1u8, 0, 1, 1, 0];
        let map = moves_to_map(&moves, 4, 20);
        assert_eq!(map, vec![0, 8, 12, 20]);
    }

    #[test]
    fn test_moves_to_map_no_moves() {
        assert_eq!(moves_to_map(&[0, 0], 4, 8), vec![8]);
    }

    #[test]
    fn test_mean_qscore() {
        // Uniform quality string: mean equals the per-base score.
        let qstring = vec![b'!' + 20; 50];
        let q = mean_qscore_from_qstring(&qstring);
        assert!((q - 20.0).abs() < 1e-3);
        assert_eq!(mean_qscore_from_qstring(&[]), 0.0);
    }

    #[test]
    fn test_mean_qscore_is_error_weighted() {
        // One very low quality base drags the mean far below the arithmetic mean.
        let mut qstring = vec![b'!' + 30; 9];
        qstring.push(b'!');
        let q = mean_qscore_from_qstring(&qstring);
        assert!(q < 15.0);
    }
}
