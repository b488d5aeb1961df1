//! Record reader for child process output.
//!
//! aria2 rewrites its console line with `\r` when attached to a terminal and
//! prints plain lines otherwise. Records are delimited by either `\n` or `\r`.

use std::io;

use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};

/// Records longer than this are cut; the remainder starts a new record.
const MAX_RECORD_LEN: usize = 64 * 1024;

/// Reads an async stream and yields trimmed, non-empty text records.
///
/// `next_record` is cancel safe: buffered bytes survive a dropped future.
pub struct OutputRecordReader<R> {
    reader: BufReader<R>,
    pending: Vec<u8>,
}

impl<R> OutputRecordReader<R>
where
    R: AsyncRead + Unpin,
{
    pub fn new(reader: R) -> Self {
        Self {
            reader: BufReader::new(reader),
            pending: Vec::new(),
        }
    }

    /// Returns the next record, or `None` at end of stream.
    pub async fn next_record(&mut self) -> io::Result<Option<String>> {
        loop {
            let buf = self.reader.fill_buf().await?;
            if buf.is_empty() {
                let record = take_record(&mut self.pending);
                return Ok((!record.is_empty()).then_some(record));
            }

            let room = MAX_RECORD_LEN.saturating_sub(self.pending.len());
            match buf.iter().position(|&b| b == b'\n' || b == b'\r') {
                Some(idx) if idx <= room => {
                    self.pending.extend_from_slice(&buf[..idx]);
                    self.reader.consume(idx + 1);
                }
                _ => {
                    let take = buf.len().min(room);
                    self.pending.extend_from_slice(&buf[..take]);
                    self.reader.consume(take);
                    if self.pending.len() < MAX_RECORD_LEN {
                        continue;
                    }
                }
            }

            let record = take_record(&mut self.pending);
            if !record.is_empty() {
                return Ok(Some(record));
            }
        }
    }
}

fn take_record(pending: &mut Vec<u8>) -> String {
    let record = String::from_utf8_lossy(pending).trim().to_string();
    pending.clear();
    record
}
