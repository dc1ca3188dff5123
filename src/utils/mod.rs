mod align;
mod bam_utils;
mod math;
mod sequence;
mod time;
mod uuid;

pub use align::{check_rc_match, find_best_match, PosRange};
pub use bam_utils::{
    load_pairs_file, modbase_tags, read_to_record, record_to_read, stream_reads_into_channel,
};
pub use math::{med_mad, median};
pub use sequence::{
    base_id, mean_qscore_from_qstring, move_cum_sums, moves_to_map, reverse_complement,
    sequence_to_ints,
};
pub use time::{adjust_timestamp, timestamp_from_string, timestamp_to_string};
pub use uuid::derive_uuid;

pub type Result<T> = std::result::Result<T, String>;

pub fn handle_error_and_exit(err: String) -> ! {
    log::error!("{}", err);
    std::process::exit(1);
}
