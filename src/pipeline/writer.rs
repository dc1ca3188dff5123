use crate::pipeline::{Message, MessageSink, WorkQueue};
use crate::utils::{read_to_record, Result};
use bio::io::fastq;
use rust_htslib::bam::{self, header::HeaderRecord};
use std::fs::File;
use std::path::Path;
use std::sync::Arc;
use std::thread::{self, JoinHandle};

/// Output flavor of the terminal writer.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum WriterOutput {
    Bam,
    Fastq,
}

enum OutputWriter {
    Bam(bam::Writer),
    Fastq(fastq::Writer<File>),
}

fn create_bam_header() -> bam::Header {
    let mut header = bam::Header::new();
    let args: Vec<String> = std::env::args().collect();
    let mut record = HeaderRecord::new(b"PG");
    record.push_tag(b"ID", env!("CARGO_PKG_NAME"));
    record.push_tag(b"PN", env!("CARGO_PKG_NAME"));
    record.push_tag(b"VN", env!("CARGO_PKG_VERSION"));
    record.push_tag(b"CL", args.join(" "));
    header.push_record(&record);
    header
}

struct Inner {
    queue: WorkQueue<Message>,
}

fn worker_thread(inner: &Inner, mut writer: OutputWriter, modbase_threshold: u8) {
    let mut num_reads = 0usize;
    let mut num_duplex = 0usize;
    let mut num_alignments = 0usize;
    while let Some(message) = inner.queue.pop() {
        match message {
            Message::Read(read) => {
                match &mut writer {
                    OutputWriter::Bam(bam_writer) => {
                        match read_to_record(&read, modbase_threshold) {
                            Ok(record) => {
                                if let Err(e) = bam_writer.write(&record) {
                                    log::error!("Failed to write read {}: {}", read.read_id, e);
                                    continue;
                                }
                            }
                            Err(e) => {
                                log::error!("Failed to serialize read {}: {}", read.read_id, e);
                                continue;
                            }
                        }
                    }
                    OutputWriter::Fastq(fastq_writer) => {
                        if let Err(e) =
                            fastq_writer.write(&read.read_id, None, &read.seq, &read.qstring)
                        {
                            log::error!("Failed to write read {}: {}", read.read_id, e);
                            continue;
                        }
                    }
                }
                num_reads += 1;
                if read.is_duplex {
                    num_duplex += 1;
                }
            }
            Message::Alignment(record) => match &mut writer {
                OutputWriter::Bam(bam_writer) => {
                    if let Err(e) = bam_writer.write(&record) {
                        log::error!("Failed to write alignment record: {}", e);
                        continue;
                    }
                    num_alignments += 1;
                }
                OutputWriter::Fastq(_) => {
                    log::warn!("Dropping alignment record in FASTQ output mode");
                }
            },
            Message::Pair(pair) => {
                log::warn!(
                    "Writer received unexpected read pair {};{}",
                    pair.template.read_id,
                    pair.complement.read_id
                );
            }
        }
    }
    log::info!(
        "Written {} reads ({} duplex), {} alignment records",
        num_reads,
        num_duplex,
        num_alignments
    );
}

/// Terminal sink serializing finished reads to BAM or FASTQ.
pub struct WriterNode {
    inner: Arc<Inner>,
    worker: Option<JoinHandle<()>>,
}

impl WriterNode {
    pub fn new(
        output_path: &Path,
        output: WriterOutput,
        modbase_threshold: u8,
        max_messages: usize,
    ) -> Result<Self> {
        let writer = match output {
            WriterOutput::Bam => {
                let header = create_bam_header();
                let bam_writer =
                    bam::Writer::from_path(output_path, &header, bam::Format::Bam)
                        .map_err(|e| {
                            format!("Failed to create {}: {}", output_path.display(), e)
                        })?;
                OutputWriter::Bam(bam_writer)
            }
            WriterOutput::Fastq => {
                let fastq_writer = fastq::Writer::to_file(output_path)
                    .map_err(|e| format!("Failed to create {}: {}", output_path.display(), e))?;
                OutputWriter::Fastq(fastq_writer)
            }
        };

        let inner = Arc::new(Inner {
            queue: WorkQueue::new(max_messages),
        });
        let worker = {
            let inner = Arc::clone(&inner);
            thread::Builder::new()
                .name("writer".to_string())
                .spawn(move || worker_thread(&inner, writer, modbase_threshold))
                .expect("Failed to spawn writer worker")
        };
        Ok(WriterNode {
            inner,
            worker: Some(worker),
        })
    }
}

impl MessageSink for WriterNode {
    fn push_message(&self, message: Message) {
        if self.inner.queue.push(message).is_err() {
            log::trace!("Writer terminated; dropping message");
        }
    }

    fn terminate(&self) {
        self.inner.queue.terminate();
    }
}

impl Drop for WriterNode {
    fn drop(&mut self) {
        self.inner.queue.terminate();
        if let Some(worker) = self.worker.take() {
            worker.join().expect("Writer worker panicked");
        }
    }
}
