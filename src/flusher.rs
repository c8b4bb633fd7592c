use crate::capture::{lock, SharedRing};
use crate::models::record::Envelope;
use anyhow::{Context, Result};
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

/// Destination for flushed batches. Returning `Ok` acks the whole batch.
pub trait Sink {
    fn send(&mut self, batch: &[Envelope]) -> Result<()>;
}

/// Appends one JSON object per line to a local spool file.
#[derive(Debug, Clone)]
pub struct SpoolSink {
    path: PathBuf,
}

impl SpoolSink {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn default_path() -> Option<PathBuf> {
        dirs::data_local_dir().map(|p| p.join("traceway").join("spool.jsonl"))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Sink for SpoolSink {
    fn send(&mut self, batch: &[Envelope]) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("creating {}", parent.display()))?;
        }
        // Serialize first so a bad record never leaves a half-written batch.
        let mut buf = String::new();
        for env in batch {
            buf.push_str(&serde_json::to_string(env)?);
            buf.push('\n');
        }
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .with_context(|| format!("opening {}", self.path.display()))?;
        file.write_all(buf.as_bytes())?;
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FlushReport {
    /// Records handed to the sink.
    pub sent:    usize,
    /// Records actually removed afterwards. Can be lower than `sent` if some
    /// were evicted while the sink was running.
    pub removed: usize,
}

/// One flush cycle: snapshot under the lock, send outside it, then ack what was sent.
///
/// `max_batch == 0` means no limit; otherwise only the oldest `max_batch`
/// records are sent. On sink failure nothing is removed and the error is returned.
pub fn flush_once<S: Sink + ?Sized>(
    buffer: &SharedRing<Envelope>,
    sink: &mut S,
    max_batch: usize,
) -> Result<FlushReport> {
    let batch: Vec<Envelope> = {
        let ring = lock(buffer);
        let take = if max_batch > 0 { max_batch } else { ring.len() };
        ring.iter().take(take).cloned().collect()
    };
    if batch.is_empty() {
        return Ok(FlushReport::default());
    }

    sink.send(&batch).context("sink rejected batch")?;

    let ids: Vec<u64> = batch.iter().map(|e| e.id).collect();
    let removed = lock(buffer).remove_by_key(&ids, |e| e.id);
    tracing::debug!(sent = batch.len(), removed, "flushed batch");
    Ok(FlushReport { sent: batch.len(), removed })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::shared;
    use crate::models::record::{MetricRecord, Record, Tags};
    use crate::util::ring_buffer::RingBuffer;
    use anyhow::bail;

    fn env(value: f64) -> Envelope {
        Envelope::new(Record::Metric(MetricRecord {
            name: "cpu".into(),
            value,
            recorded_at: chrono::Utc::now(),
            tags: Tags::new(),
        }))
    }

    #[derive(Default)]
    struct Collecting {
        got:  Vec<Envelope>,
        fail: bool,
    }

    impl Sink for Collecting {
        fn send(&mut self, batch: &[Envelope]) -> Result<()> {
            if self.fail { bail!("collector offline"); }
            self.got.extend_from_slice(batch);
            Ok(())
        }
    }

    fn ring_with(values: &[f64]) -> SharedRing<Envelope> {
        let ring = shared(RingBuffer::new(8).unwrap());
        for v in values { lock(&ring).push(env(*v)); }
        ring
    }

    #[test]
    fn successful_send_acks_batch() {
        let ring = ring_with(&[1.0, 2.0, 3.0]);
        let mut sink = Collecting::default();
        let report = flush_once(&ring, &mut sink, 0).unwrap();
        assert_eq!(report, FlushReport { sent: 3, removed: 3 });
        assert_eq!(sink.got.len(), 3);
        assert!(lock(&ring).is_empty());
    }

    #[test]
    fn failed_send_keeps_records() {
        let ring = ring_with(&[1.0, 2.0]);
        let mut sink = Collecting { fail: true, ..Default::default() };
        assert!(flush_once(&ring, &mut sink, 0).is_err());
        assert_eq!(lock(&ring).len(), 2);
    }

    #[test]
    fn max_batch_sends_oldest_first() {
        let ring = ring_with(&[1.0, 2.0, 3.0]);
        let mut sink = Collecting::default();
        let report = flush_once(&ring, &mut sink, 2).unwrap();
        assert_eq!(report.sent, 2);
        assert_eq!(sink.got.len(), 2);
        let left = lock(&ring).read_all();
        assert_eq!(left.len(), 1);
        match &left[0].record {
            Record::Metric(m) => assert_eq!(m.value, 3.0),
            other => panic!("unexpected record {:?}", other),
        }
        let sent: Vec<u64> = sink.got.iter().map(|e| e.id).collect();
        assert!(sent.iter().all(|id| *id < left[0].id));
    }

    #[test]
    fn empty_buffer_skips_sink() {
        let ring = ring_with(&[]);
        let mut sink = Collecting { fail: true, ..Default::default() };
        assert_eq!(flush_once(&ring, &mut sink, 0).unwrap(), FlushReport::default());
    }

    #[test]
    fn records_pushed_during_send_survive() {
        struct Racing(SharedRing<Envelope>);
        impl Sink for Racing {
            fn send(&mut self, _batch: &[Envelope]) -> Result<()> {
                lock(&self.0).push(env(99.0));
                Ok(())
            }
        }
        let ring = ring_with(&[1.0]);
        let mut sink = Racing(ring.clone());
        let report = flush_once(&ring, &mut sink, 0).unwrap();
        assert_eq!(report.removed, 1);
        assert_eq!(lock(&ring).len(), 1);
    }
}
