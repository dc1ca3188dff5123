use crate::cli::DuplexArgs;
use crate::pipeline::{
    DuplexCallerNode, Message, MessageSink, PairingNode, ReadFilterNode, WriterNode, WriterOutput,
    DEFAULT_MAX_MESSAGES,
};
use crate::utils::{load_pairs_file, stream_reads_into_channel, Result};
use crossbeam_channel::bounded;
use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::thread;

const CHANNEL_BUFFER_SIZE: usize = 2048;

pub fn duplex(args: DuplexArgs) -> Result<()> {
    log::info!("> Loading pairs file");
    let template_complement_map = load_pairs_file(&args.pairs_path)?;
    log::info!("> Loaded {} read pairs", template_complement_map.len());

    let read_ids: HashSet<String> = template_complement_map
        .iter()
        .flat_map(|(t, c)| [t.clone(), c.clone()])
        .collect();

    let (output_suffix, output) = if args.emit_fastq {
        ("fastq", WriterOutput::Fastq)
    } else {
        ("bam", WriterOutput::Bam)
    };
    let output_path = PathBuf::from(format!("{}.{}", args.output_prefix, output_suffix));

    // Pipeline is built sink first so each node can hand its downstream a
    // reference; locals drop in reverse order, which tears it down head first.
    let writer = Arc::new(WriterNode::new(
        &output_path,
        output,
        0,
        DEFAULT_MAX_MESSAGES,
    )?);
    let read_filter = Arc::new(ReadFilterNode::new(
        writer.clone(),
        args.min_qscore,
        1,
        DEFAULT_MAX_MESSAGES,
    ));
    let duplex_caller = Arc::new(DuplexCallerNode::new(
        read_filter.clone(),
        args.num_threads,
        DEFAULT_MAX_MESSAGES,
    ));
    let pairing = Arc::new(PairingNode::new(
        duplex_caller.clone(),
        template_complement_map,
        1,
        DEFAULT_MAX_MESSAGES,
    ));

    log::info!("> Starting basespace duplex pipeline");
    let (sender, receiver) = bounded(CHANNEL_BUFFER_SIZE);
    let reads_path = args.reads_path.clone();
    let reader_thread =
        thread::spawn(move || stream_reads_into_channel(&reads_path, &read_ids, sender));

    let mut num_reads = 0usize;
    for read in &receiver {
        match read {
            Ok(read) => {
                pairing.push_message(Message::Read(Box::new(read)));
                num_reads += 1;
            }
            Err(e) => {
                log::error!("Read streaming: {}", e);
            }
        }
    }
    reader_thread.join().expect("BAM reader thread panicked");
    log::info!("> Fed {} simplex reads into the pipeline", num_reads);

    Ok(())
}
