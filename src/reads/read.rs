//! Module for representing reads as they move through the basecalling pipeline.
//!

use crate::modbase::BaseModInfo;
use crate::utils::mean_qscore_from_qstring;
use itertools::Itertools;
use std::sync::Arc;

/// Acquisition-time metadata attached to a read by the data loader.
#[derive(Debug, Clone, PartialEq)]
pub struct Attributes {
    /// Channel mux, `u32::MAX` when unknown.
    pub mux: u32,
    /// Per-channel number of the read as it was acquired, `u32::MAX` when unknown.
    pub read_number: u32,
    /// Channel ID.
    pub channel_number: i32,
    /// Read acquisition start time.
    pub start_time: String,
    /// Name of the signal file the read came from.
    pub fast5_filename: String,
    /// Number of samples acquired for the read.
    pub num_samples: u64,
}

impl Default for Attributes {
    fn default() -> Self {
        Attributes {
            mux: u32::MAX,
            read_number: u32::MAX,
            channel_number: -1,
            start_time: String::new(),
            fast5_filename: String::new(),
            num_samples: 0,
        }
    }
}

/// A single pore capture: raw signal, and sequence-space fields once the read
/// has been basecalled.
#[derive(Clone, Default)]
pub struct Read {
    /// Unique read ID (UUID4).
    pub read_id: String,
    /// Read id of the originating read when this read is a subread.
    pub parent_read_id: String,

    /// Raw signal samples, normalized once the scaler has run.
    pub raw_data: Vec<f32>,
    pub digitisation: f32,
    pub range: f32,
    pub offset: f32,
    pub sample_rate: u64,

    /// Set by the scaler: `pA = scale * sample + shift` for normalized samples.
    pub shift: f32,
    pub scale: f32,
    /// Factor converting raw sequencer integers into pore current values.
    pub scaling: f32,

    /// Down-sampling factor of the basecalling model.
    pub model_stride: usize,
    /// Basecalled sequence.
    pub seq: Vec<u8>,
    /// Per-base phred+33 qualities; always the same length as `seq`.
    pub qstring: Vec<u8>,
    /// Move table over downsampled signal blocks; a `1` marks a new base.
    pub moves: Vec<u8>,

    /// Dense per-base modification probability table,
    /// `seq.len() * num_states` entries once initialized.
    pub base_mod_probs: Vec<u8>,
    /// Modification alphabet of the models that ran on this read.
    pub base_mod_info: Option<Arc<BaseModInfo>>,

    /// Simplex basecalling fan-out counters.
    pub num_chunks: usize,
    pub num_chunks_called: usize,
    /// Modified base fan-out counters, maintained by the modbase caller node.
    pub num_modbase_chunks: usize,
    pub num_modbase_chunks_called: usize,

    /// Samples removed from the front of the raw signal.
    pub num_trimmed_samples: u64,
    /// Set on consensus reads produced by duplex calling.
    pub is_duplex: bool,

    pub attributes: Attributes,
}

impl Read {
    /// Mean basecall quality, averaged in error space.
    pub fn mean_qscore(&self) -> f32 {
        mean_qscore_from_qstring(&self.qstring)
    }
}

impl std::fmt::Debug for Read {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Read")
            .field("read_id", &self.read_id)
            .field("num_samples", &self.raw_data.len())
            .field("seq", &String::from_utf8_lossy(&self.seq))
            .field(
                "moves",
                &self.moves.iter().map(|m| m.to_string()).join(""),
            )
            .finish()
    }
}

/// Two reads expected to be the template and complement strands of one duplex.
#[derive(Debug)]
pub struct ReadPair {
    pub template: Box<Read>,
    pub complement: Box<Read>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_attributes_default_sentinels() {
        let attributes = Attributes::default();
        assert_eq!(attributes.mux, u32::MAX);
        assert_eq!(attributes.read_number, u32::MAX);
        assert_eq!(attributes.channel_number, -1);
    }

    #[test]
    fn test_mean_qscore() {
        let read = Read {
            qstring: vec![b'!' + 12; 100],
            ..Default::default()
        };
        assert!((read.mean_qscore() - 12.0).abs() < 1e-3);
    }
}
