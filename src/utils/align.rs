use crate::utils::reverse_complement;
use bio::alignment::pairwise::Aligner;

/// Half-open range of positions, in sequence or signal coordinates.
pub type PosRange = (usize, usize);

fn edit_aligner(pattern_len: usize, text_len: usize) -> Aligner<fn(u8, u8) -> i32> {
    // Unit-cost edit distance: the semiglobal score is the negated distance of
    // the best infix match of the pattern in the text.
    fn unit(a: u8, b: u8) -> i32 {
        if a == b {
            0
        } else {
            -1
        }
    }
    Aligner::with_capacity(pattern_len, text_len, 0, -1, unit as fn(u8, u8) -> i32)
}

/// Finds the best infix match of `pattern` inside `text[subrange]` with edit
/// distance at most `dist_thr`. Returns the matched range in `text`
/// coordinates, or `None` when the window is empty or every placement exceeds
/// the threshold.
pub fn find_best_match(
    pattern: &[u8],
    text: &[u8],
    dist_thr: usize,
    subrange: PosRange,
) -> Option<PosRange> {
    let (shift, end) = subrange;
    debug_assert!(shift <= end && end <= text.len());
    let window = &text[shift..end];
    if window.is_empty() || pattern.is_empty() {
        return None;
    }

    let mut aligner = edit_aligner(pattern.len(), window.len());
    let alignment = aligner.semiglobal(pattern, window);
    let dist = (-alignment.score) as usize;
    if dist <= dist_thr {
        Some((alignment.ystart + shift, alignment.yend + shift))
    } else {
        None
    }
}

/// Semi-global alignment of the "template end" region against the
/// reverse-complemented "complement start" region: true when the two strands
/// of a candidate duplex agree within `dist_thr` edits.
pub fn check_rc_match(seq: &[u8], templ_r: PosRange, compl_r: PosRange, dist_thr: usize) -> bool {
    debug_assert!(templ_r.1 > templ_r.0 && compl_r.1 > compl_r.0);
    debug_assert!(templ_r.1 <= seq.len() && compl_r.1 <= seq.len());
    let rc_compl = reverse_complement(&seq[compl_r.0..compl_r.1]);
    let templ = &seq[templ_r.0..templ_r.1];

    let mut aligner = edit_aligner(templ.len(), rc_compl.len());
    let alignment = aligner.semiglobal(templ, &rc_compl);
    (-alignment.score) as usize <= dist_thr
}
