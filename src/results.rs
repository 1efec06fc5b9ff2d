use std::collections::HashMap;
use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::Path;
use std::thread::{self, JoinHandle};

use anyhow::Context;
use log::info;

use crate::listener::Listener;
use crate::message::WordRecord;

/// Master-side sink for final counts. Each received record is the full
/// aggregated total for one word from its designated reducer, so the table
/// insert overwrites by word, and the output file gets one `word : count`
/// line per record in arrival order.
pub struct ResultAggregator {
    listener: Listener<WordRecord>,
    handler: JoinHandle<io::Result<HashMap<String, u64>>>,
}

impl ResultAggregator {
    pub fn start(bind_ip: &str, port: u16, output_path: &Path) -> anyhow::Result<Self> {
        let listener: Listener<WordRecord> = Listener::start((bind_ip, port), "results")?;
        info!("master receiving results on {}", listener.local_addr());

        let records = listener.receiver();
        let path = output_path.to_path_buf();
        let handler = thread::Builder::new()
            .name("result-handler".to_string())
            .spawn(move || {
                let mut table = HashMap::new();
                let mut out = BufWriter::new(File::create(&path)?);
                while let Ok(record) = records.recv() {
                    writeln!(out, "{} : {}", record.word, record.count)?;
                    table.insert(record.word, record.count);
                }
                out.flush()?;
                Ok(table)
            })?;

        Ok(ResultAggregator { listener, handler })
    }

    pub fn port(&self) -> u16 {
        self.listener.port()
    }

    /// Stop accepting, let the handler drain whatever is queued, and hand
    /// back the final table. Failure to write the results file surfaces
    /// here; the run has nothing to show without it.
    pub fn finish(mut self) -> anyhow::Result<HashMap<String, u64>> {
        self.listener.stop();
        self.listener.join();
        let table = self
            .handler
            .join()
            .map_err(|_| anyhow::anyhow!("result handler panicked"))?
            .context("writing results file")?;
        info!("results complete, {} distinct words", table.len());
        Ok(table)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::send_message;
    use std::fs;

    #[test]
    fn collects_records_and_writes_lines_in_arrival_order() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("results.txt");
        let aggregator = ResultAggregator::start("127.0.0.1", 0, &path).unwrap();
        let addr = ("127.0.0.1", aggregator.port());

        send_message(
            addr,
            &WordRecord {
                word: "the".to_string(),
                count: 2,
            },
        )
        .unwrap();
        send_message(
            addr,
            &WordRecord {
                word: "cat".to_string(),
                count: 1,
            },
        )
        .unwrap();

        let table = aggregator.finish().unwrap();
        assert_eq!(table.get("the"), Some(&2));
        assert_eq!(table.get("cat"), Some(&1));

        let written = fs::read_to_string(&path).unwrap();
        assert_eq!(written, "the : 2\ncat : 1\n");
    }
}
