//! Modified base calling support: the opaque model runner capability, the
//! per-caller parameter set, and the aggregated modification alphabet shared
//! by every read that passes through the caller node.

mod encoder;

pub use encoder::{ContextSlice, ModBaseEncoder};

use crate::utils::Result;

/// Parameters of a single modified base caller, as read from its model.
#[derive(Debug, Clone)]
pub struct CallerParams {
    /// Signal context around a motif hit, in samples.
    pub context_before: usize,
    pub context_after: usize,
    /// Sequence context around a motif hit, in bases.
    pub bases_before: usize,
    pub bases_after: usize,
    /// Motif targeted by the caller, e.g. "CG".
    pub motif: String,
    /// Offset of the canonical base inside the motif.
    pub motif_offset: usize,
    /// Modification code letters, e.g. "m" for 5mC.
    pub mod_bases: String,
    pub mod_long_names: Vec<String>,
}

impl CallerParams {
    pub fn canonical_base(&self) -> u8 {
        self.motif.as_bytes()[self.motif_offset]
    }

    pub fn base_mod_count(&self) -> usize {
        self.mod_bases.len()
    }

    pub fn context_samples(&self) -> usize {
        self.context_before + self.context_after
    }
}

/// Modification alphabet of the models that ran on a read; shared between all
/// reads scored by one caller node.
#[derive(Debug, Clone, PartialEq)]
pub struct BaseModInfo {
    /// Canonical bases interleaved with their modification codes, e.g. "ACmGT".
    pub alphabet: String,
    /// Space separated long names, e.g. "5mC".
    pub long_names: String,
    /// Per canonical base motif context, "motif:offset" or "_", space separated.
    pub context: String,
}

/// Scores for one batch of chunks, shaped `[num_chunks, row_size]`.
pub struct ScoreBatch {
    pub scores: Vec<f32>,
    pub row_size: usize,
}

/// Capability of a modified base model runner. Each runner owns `num_callers`
/// sub-callers; caller state is internal to the implementation, which must
/// keep concurrent use of *distinct* callers safe. The node pins one worker
/// thread per (runner, caller) pair and never shares a caller between threads.
pub trait ModBaseRunner: Send + Sync {
    fn num_callers(&self) -> usize;

    fn caller_params(&self, caller_id: usize) -> &CallerParams;

    /// Rescales the normalized read signal into the model's expected domain.
    fn scale_signal(
        &self,
        caller_id: usize,
        signal: &[f32],
        sequence_ints: &[i32],
        seq_to_sig_map: &[u64],
    ) -> Vec<f32>;

    /// Positions in `seq` matching the caller's motif.
    fn motif_hits(&self, caller_id: usize, seq: &[u8]) -> Vec<usize>;

    /// Stages one chunk at `chunk_idx` of the caller's input batch.
    fn accept_chunk(&self, caller_id: usize, chunk_idx: usize, signal: &[f32], encoded_kmers: &[i8]);

    /// Scores the first `num_chunks` staged chunks.
    fn call_chunks(&self, caller_id: usize, num_chunks: usize) -> Result<ScoreBatch>;
}

/// Scans a sequence for motif occurrences, reporting the position of the
/// canonical base within each occurrence.
pub fn find_motif_hits(seq: &[u8], motif: &[u8], motif_offset: usize) -> Vec<usize> {
    if motif.is_empty() || seq.len() < motif.len() {
        return Vec::new();
    }
    seq.windows(motif.len())
        .enumerate()
        .filter(|(_, w)| *w == motif)
        .map(|(i, _)| i + motif_offset)
        .collect()
}

/// Aggregated modification alphabet across the callers of one runner.
pub struct ModBaseAggregate {
    pub info: BaseModInfo,
    /// Column of the canonical probability for each base of ACGT; the mod
    /// probability columns follow it.
    pub base_prob_offsets: [usize; 4],
    /// Total probability columns per sequence position.
    pub num_states: usize,
}

pub fn aggregate_modbase_info(callers: &[&CallerParams]) -> Result<ModBaseAggregate> {
    const ALLOWED_BASES: &[u8; 4] = b"ACGT";

    struct PerBase {
        alphabet: String,
        long_names: Vec<String>,
        motif: Option<(String, usize)>,
        base_count: usize,
    }
    let mut per_base: Vec<PerBase> = ALLOWED_BASES
        .iter()
        .map(|&b| PerBase {
            alphabet: (b as char).to_string(),
            long_names: Vec::new(),
            motif: None,
            base_count: 1,
        })
        .collect();

    for params in callers {
        let base = params.canonical_base();
        let base_id = crate::utils::base_id(base)
            .ok_or_else(|| format!("Invalid base '{}' in modbase model metadata", base as char))?;
        let entry = &mut per_base[base_id];
        if entry.motif.is_some() {
            return Err(format!(
                "Multiple modbase callers target base '{}'",
                base as char
            ));
        }
        entry.alphabet.push_str(&params.mod_bases);
        entry.long_names = params.mod_long_names.clone();
        entry.motif = Some((params.motif.clone(), params.motif_offset));
        entry.base_count = params.base_mod_count() + 1;
    }

    let mut alphabet = String::new();
    let mut long_names = Vec::new();
    let mut context = Vec::new();
    let mut base_prob_offsets = [0usize; 4];
    let mut num_states = 0;
    for (base_id, entry) in per_base.iter().enumerate() {
        base_prob_offsets[base_id] = num_states;
        num_states += entry.base_count;
        alphabet.push_str(&entry.alphabet);
        long_names.extend(entry.long_names.iter().cloned());
        context.push(match &entry.motif {
            Some((motif, offset)) => format!("{}:{}", motif, offset),
            None => "_".to_string(),
        });
    }

    Ok(ModBaseAggregate {
        info: BaseModInfo {
            alphabet,
            long_names: long_names.join(" "),
            context: context.join(" "),
        },
        base_prob_offsets,
        num_states,
    })
}
