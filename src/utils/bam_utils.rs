use crate::reads::Read;
use crate::utils::{base_id, Result};
use crossbeam_channel::Sender;
use flate2::read::MultiGzDecoder;
use rust_htslib::bam::{
    self,
    record::{Aux, AuxArray},
    Read as BamRead,
};
use std::collections::{HashMap, HashSet};
use std::fs::File;
use std::io::{BufRead, BufReader, Read as IoRead};
use std::path::Path;

/// Builds a `Read` from the basecall fields of an alignment record. Signal
/// and move data do not survive a round trip through BAM, only sequence
/// space does.
pub fn record_to_read(record: &bam::Record) -> Read {
    let read_id = String::from_utf8_lossy(record.qname()).to_string();
    let seq = record.seq().as_bytes();
    let qstring = record.qual().iter().map(|&q| q + 33).collect();
    Read {
        read_id,
        seq,
        qstring,
        ..Default::default()
    }
}

/// Streams reads out of a BAM file into a channel. When `read_ids` is
/// non-empty, records with other names are skipped. A send failure means the
/// receiver is gone and streaming stops quietly.
pub fn stream_reads_into_channel(
    reads_path: &Path,
    read_ids: &HashSet<String>,
    sender: Sender<Result<Read>>,
) {
    let mut bam = match bam::Reader::from_path(reads_path) {
        Ok(bam) => bam,
        Err(e) => {
            let _ = sender.send(Err(format!(
                "Failed to open BAM file {}: {}",
                reads_path.display(),
                e
            )));
            return;
        }
    };

    let mut record = bam::Record::new();
    while let Some(result) = bam.read(&mut record) {
        match result {
            Ok(()) => {
                if record.is_secondary() || record.is_supplementary() {
                    continue;
                }
                if !read_ids.is_empty() {
                    let qname = String::from_utf8_lossy(record.qname());
                    if !read_ids.contains(qname.as_ref()) {
                        continue;
                    }
                }
                if sender.send(Ok(record_to_read(&record))).is_err() {
                    return;
                }
            }
            Err(e) => {
                let _ = sender.send(Err(format!("Error reading BAM record: {}", e)));
                return;
            }
        }
    }
}

/// Loads a space-delimited template/complement pairs file, gzipped or plain.
pub fn load_pairs_file(path: &Path) -> Result<HashMap<String, String>> {
    fn is_gzipped(path: &Path) -> bool {
        let path_str = path.to_string_lossy().to_lowercase();
        path_str.ends_with(".gz") || path_str.ends_with(".gzip")
    }

    let file = File::open(path).map_err(|e| format!("File {}: {}", path.display(), e))?;
    let reader: BufReader<Box<dyn IoRead>> = if is_gzipped(path) {
        BufReader::new(Box::new(MultiGzDecoder::new(file)))
    } else {
        BufReader::new(Box::new(file))
    };

    let mut pairs = HashMap::new();
    for (line_number, line) in reader.lines().enumerate() {
        let line = line.map_err(|e| format!("Error reading line {}: {}", line_number + 1, e))?;
        if line.trim().is_empty() {
            continue;
        }
        let fields: Vec<&str> = line.split_whitespace().collect();
        if fields.len() != 2 {
            return Err(format!(
                "Expected 'template complement' at line {}, found: {}",
                line_number + 1,
                line
            ));
        }
        if pairs
            .insert(fields[0].to_string(), fields[1].to_string())
            .is_some()
        {
            log::warn!("Duplicate template {} in pairs file", fields[0]);
        }
    }
    Ok(pairs)
}

/// MM/ML tag payloads for the modified base probabilities of a read, or
/// `None` when the read has no modification data. Probabilities below
/// `threshold` are left out.
pub fn modbase_tags(read: &Read, threshold: u8) -> Option<(String, Vec<u8>)> {
    let info = read.base_mod_info.as_ref()?;
    if read.base_mod_probs.is_empty() {
        return None;
    }
    let alphabet = info.alphabet.as_bytes();
    let num_states = alphabet.len();
    debug_assert_eq!(read.base_mod_probs.len(), read.seq.len() * num_states);

    let mut mm = String::new();
    let mut ml = Vec::new();
    let mut canonical = 0u8;
    for (column, &letter) in alphabet.iter().enumerate() {
        if base_id(letter).is_some() {
            canonical = letter;
            continue;
        }
        let mut deltas = Vec::new();
        let mut skipped = 0usize;
        for (pos, &base) in read.seq.iter().enumerate() {
            if base != canonical {
                continue;
            }
            let prob = read.base_mod_probs[pos * num_states + column];
            if prob >= threshold {
                deltas.push(skipped.to_string());
                ml.push(prob);
                skipped = 0;
            } else {
                skipped += 1;
            }
        }
        if deltas.is_empty() {
            continue;
        }
        mm.push(canonical as char);
        mm.push('+');
        mm.push(letter as char);
        mm.push(',');
        mm.push_str(&deltas.join(","));
        mm.push(';');
    }

    if mm.is_empty() {
        None
    } else {
        Some((mm, ml))
    }
}

fn push(rec: &mut bam::Record, tag: &[u8; 2], aux: Aux) -> Result<()> {
    rec.push_aux(tag, aux)
        .map_err(|e| format!("Failed to write {} tag: {}", String::from_utf8_lossy(tag), e))
}

/// Serializes a finished read as an unmapped alignment record carrying the
/// acquisition and basecall tags.
pub fn read_to_record(read: &Read, modbase_threshold: u8) -> Result<bam::Record> {
    let mut rec = bam::Record::new();
    let qual: Vec<u8> = read.qstring.iter().map(|q| q.saturating_sub(33)).collect();
    rec.set(read.read_id.as_bytes(), None, &read.seq, &qual);
    rec.set_tid(-1);
    rec.set_pos(-1);
    rec.set_mtid(-1);
    rec.set_mpos(-1);
    rec.set_unmapped();

    push(&mut rec, b"qs", Aux::Float(read.mean_qscore()))?;
    let num_samples = read.raw_data.len() as u64 + read.num_trimmed_samples;
    push(&mut rec, b"ns", Aux::U32(num_samples as u32))?;
    push(&mut rec, b"ts", Aux::U32(read.num_trimmed_samples as u32))?;
    if read.sample_rate > 0 {
        let duration = num_samples as f32 / read.sample_rate as f32;
        push(&mut rec, b"du", Aux::Float(duration))?;
    }
    if read.attributes.mux != u32::MAX {
        push(&mut rec, b"mx", Aux::I32(read.attributes.mux as i32))?;
    }
    if read.attributes.read_number != u32::MAX {
        push(&mut rec, b"rn", Aux::I32(read.attributes.read_number as i32))?;
    }
    if read.attributes.channel_number >= 0 {
        push(&mut rec, b"ch", Aux::I32(read.attributes.channel_number))?;
    }
    if !read.attributes.start_time.is_empty() {
        push(&mut rec, b"st", Aux::String(&read.attributes.start_time))?;
    }
    if !read.attributes.fast5_filename.is_empty() {
        push(&mut rec, b"f5", Aux::String(&read.attributes.fast5_filename))?;
    }
    if read.scale != 0.0 {
        push(&mut rec, b"sm", Aux::Float(read.shift))?;
        push(&mut rec, b"sd", Aux::Float(read.scale))?;
    }
    if !read.parent_read_id.is_empty() {
        push(&mut rec, b"pi", Aux::String(&read.parent_read_id))?;
    }
    push(&mut rec, b"dx", Aux::I32(read.is_duplex as i32))?;

    if !read.moves.is_empty() {
        let mut mv: Vec<i8> = Vec::with_capacity(read.moves.len() + 1);
        mv.push(read.model_stride as i8);
        mv.extend(read.moves.iter().map(|&m| m as i8));
        let mv_tag: AuxArray<i8> = (&mv).into();
        push(&mut rec, b"mv", Aux::ArrayI8(mv_tag))?;
    }

    if let Some((mm, ml)) = modbase_tags(read, modbase_threshold) {
        push(&mut rec, b"MM", Aux::String(&mm))?;
        let ml_tag: AuxArray<u8> = (&ml).into();
        push(&mut rec, b"ML", Aux::ArrayU8(ml_tag))?;
    }

    Ok(rec)
}
