use crate::sink::RecordSink;
use anyhow::{anyhow, Result};
use audit_core::Record;
use std::sync::mpsc;
use std::thread::{self, JoinHandle};
use tracing::{debug, info};

pub enum WriterMessage {
    Record(Record),
    /// Sentinel: no more records will be produced this block.
    Shutdown,
}

/// Producer side of the writer queue, cloned into every agent thread.
#[derive(Clone)]
pub struct RecordSender {
    tx: mpsc::Sender<WriterMessage>,
}

impl RecordSender {
    pub fn send(&self, record: Record) -> Result<()> {
        self.tx
            .send(WriterMessage::Record(record))
            .map_err(|_| anyhow!("result writer queue is closed"))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WriterSummary {
    pub records_written: usize,
}

/// Sole consumer of the block's record queue and sole owner of the sink.
pub struct ResultWriter {
    tx: mpsc::Sender<WriterMessage>,
    handle: JoinHandle<Result<WriterSummary>>,
}

impl ResultWriter {
    pub fn spawn(block: usize, mut sink: Box<dyn RecordSink + Send>) -> Result<Self> {
        let (tx, rx) = mpsc::channel();
        let handle = thread::Builder::new()
            .name(format!("auditor-writer-{}", block))
            .spawn(move || drain(block, &rx, sink.as_mut()))
            .map_err(|e| anyhow!("failed to spawn result writer thread: {}", e))?;
        Ok(Self { tx, handle })
    }

    pub fn sender(&self) -> RecordSender {
        RecordSender {
            tx: self.tx.clone(),
        }
    }

    /// Enqueues the sentinel and waits for the writer to drain everything
    /// queued ahead of it. Callers must have joined every producer first.
    pub fn finish(self) -> Result<WriterSummary> {
        let sentinel = self.tx.send(WriterMessage::Shutdown);
        let summary = self
            .handle
            .join()
            .map_err(|_| anyhow!("result writer thread panicked"))??;
        sentinel.map_err(|_| anyhow!("result writer stopped before shutdown was requested"))?;
        Ok(summary)
    }
}

fn drain(
    block: usize,
    rx: &mpsc::Receiver<WriterMessage>,
    sink: &mut dyn RecordSink,
) -> Result<WriterSummary> {
    let mut records_written = 0usize;
    loop {
        match rx.recv() {
            Ok(WriterMessage::Record(record)) => {
                sink.append_record(&record)?;
                records_written += 1;
                debug!(block, agent = %record.agent, step = %record.step, "record written");
            }
            Ok(WriterMessage::Shutdown) => break,
            Err(_) => {
                sink.flush()?;
                return Err(anyhow!(
                    "result writer queue disconnected before shutdown sentinel"
                ));
            }
        }
    }
    sink.flush()?;
    info!(block, records_written, "result writer drained");
    Ok(WriterSummary { records_written })
}
