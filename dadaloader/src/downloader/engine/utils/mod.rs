//! Utility modules for download engines.

mod aria2_parser;
mod output_record_reader;

pub use aria2_parser::{
    is_progress_line, parse_eta, parse_line, parse_notice, parse_progress, parse_size,
};
pub use output_record_reader::OutputRecordReader;
