use agentrun_base::data::Step;
use app::app::StepBufferConfig;
use infra::infra::step::StepWriter;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

#[derive(Debug, Default)]
struct BufferState {
    entries: Vec<Step>,
    // bumped whenever the entries are taken; a timer armed for an older
    // generation finds its batch already written
    generation: u64,
}

/// Batches the step writes of every run executed by this process.
///
/// Entries are written when `max_entries` are buffered, when the flush
/// interval armed by the first entry of a batch elapses, or on an explicit
/// [`StepBuffer::flush`]. Writes are serialized, so `flush` returns only after
/// every entry appended before the call has been handed to the writer.
///
/// A failed batch insert falls back to one insert per entry. Entries whose
/// single insert fails too are logged and dropped: step persistence never
/// fails a run.
#[derive(Clone)]
pub struct StepBuffer {
    writer: Arc<dyn StepWriter>,
    config: Arc<StepBufferConfig>,
    state: Arc<Mutex<BufferState>>,
    write_lock: Arc<Mutex<()>>,
}

impl fmt::Debug for StepBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StepBuffer")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl StepBuffer {
    pub fn new(writer: Arc<dyn StepWriter>, config: Arc<StepBufferConfig>) -> Self {
        Self {
            writer,
            config,
            state: Arc::new(Mutex::new(BufferState::default())),
            write_lock: Arc::new(Mutex::new(())),
        }
    }

    pub async fn append(&self, step: Step) {
        let (len, generation) = {
            let mut state = self.state.lock().await;
            state.entries.push(step);
            (state.entries.len(), state.generation)
        };
        if len >= self.config.max_entries.max(1) {
            self.flush().await;
        } else if len == 1 {
            self.arm_timer(generation);
        }
    }

    /// write everything buffered so far. returns the number of steps stored.
    pub async fn flush(&self) -> usize {
        let _guard = self.write_lock.lock().await;
        let entries = {
            let mut state = self.state.lock().await;
            Self::take(&mut state)
        };
        self.write(entries).await
    }

    pub async fn pending_len(&self) -> usize {
        self.state.lock().await.entries.len()
    }

    fn take(state: &mut BufferState) -> Vec<Step> {
        state.generation += 1;
        std::mem::take(&mut state.entries)
    }

    fn arm_timer(&self, generation: u64) {
        let this = self.clone();
        let interval = Duration::from_millis(self.config.flush_interval_msec);
        tokio::spawn(async move {
            tokio::time::sleep(interval).await;
            let _guard = this.write_lock.lock().await;
            let entries = {
                let mut state = this.state.lock().await;
                if state.generation != generation {
                    return;
                }
                Self::take(&mut state)
            };
            this.write(entries).await;
        });
    }

    async fn write(&self, entries: Vec<Step>) -> usize {
        if entries.is_empty() {
            return 0;
        }
        match self.writer.insert_batch(&entries).await {
            Ok(_) => {
                tracing::debug!("flushed {} steps", entries.len());
                entries.len()
            }
            Err(e) => {
                tracing::warn!(
                    "batch insert of {} steps failed, writing one by one: {:?}",
                    entries.len(),
                    e
                );
                let mut written = 0;
                for step in entries.iter() {
                    match self.writer.insert(step).await {
                        Ok(true) => written += 1,
                        Ok(false) => {
                            tracing::warn!(run_id = step.run_id.value, idx = step.idx, "step not stored")
                        }
                        Err(e) => tracing::error!(
                            run_id = step.run_id.value,
                            idx = step.idx,
                            "failed to store step: {:?}",
                            e
                        ),
                    }
                }
                written
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use agentrun_base::data::RunId;
    use anyhow::{anyhow, Result};
    use async_trait::async_trait;
    use std::sync::Mutex as StdMutex;

    #[derive(Default)]
    struct FakeWriter {
        fail_batch: bool,
        fail_idx: Vec<i64>,
        batches: StdMutex<Vec<Vec<i64>>>,
        singles: StdMutex<Vec<i64>>,
    }

    impl FakeWriter {
        fn batches(&self) -> Vec<Vec<i64>> {
            self.batches.lock().unwrap().clone()
        }
        fn singles(&self) -> Vec<i64> {
            self.singles.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl StepWriter for FakeWriter {
        async fn insert_batch(&self, steps: &[Step]) -> Result<u64> {
            if self.fail_batch {
                return Err(anyhow!("batch rejected"));
            }
            self.batches
                .lock()
                .unwrap()
                .push(steps.iter().map(|s| s.idx).collect());
            Ok(steps.len() as u64)
        }
        async fn insert(&self, step: &Step) -> Result<bool> {
            if self.fail_idx.contains(&step.idx) {
                return Err(anyhow!("row rejected"));
            }
            self.singles.lock().unwrap().push(step.idx);
            Ok(true)
        }
    }

    fn step(idx: i64) -> Step {
        Step {
            run_id: RunId::new(1),
            idx,
            name: format!("step-{}", idx),
            output: serde_json::json!({"i": idx}),
            error: None,
            created_at: 0,
        }
    }

    fn buffer(writer: Arc<FakeWriter>, max_entries: usize) -> StepBuffer {
        StepBuffer::new(
            writer,
            Arc::new(StepBufferConfig {
                max_entries,
                flush_interval_msec: 1000,
            }),
        )
    }

    #[tokio::test(start_paused = true)]
    async fn test_flush_at_max_entries() {
        let writer = Arc::new(FakeWriter::default());
        let buf = buffer(writer.clone(), 3);
        buf.append(step(1)).await;
        buf.append(step(2)).await;
        assert!(writer.batches().is_empty());
        buf.append(step(3)).await;
        assert_eq!(writer.batches(), vec![vec![1, 2, 3]]);
        assert_eq!(buf.pending_len().await, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_flush_after_interval() {
        let writer = Arc::new(FakeWriter::default());
        let buf = buffer(writer.clone(), 10);
        buf.append(step(1)).await;
        buf.append(step(2)).await;
        tokio::time::sleep(Duration::from_millis(999)).await;
        assert!(writer.batches().is_empty());
        tokio::time::sleep(Duration::from_millis(100)).await;
        tokio::task::yield_now().await;
        assert_eq!(writer.batches(), vec![vec![1, 2]]);
        assert_eq!(buf.pending_len().await, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timer_of_flushed_batch_is_ignored() {
        let writer = Arc::new(FakeWriter::default());
        let buf = buffer(writer.clone(), 3);
        buf.append(step(1)).await; // arms a timer for t=1000
        tokio::time::sleep(Duration::from_millis(500)).await;
        buf.append(step(2)).await;
        buf.append(step(3)).await; // size flush
        buf.append(step(4)).await; // arms a timer for t=1500
        tokio::time::sleep(Duration::from_millis(600)).await;
        tokio::task::yield_now().await;
        // the t=1000 timer belonged to the flushed batch
        assert_eq!(writer.batches(), vec![vec![1, 2, 3]]);
        assert_eq!(buf.pending_len().await, 1);
        tokio::time::sleep(Duration::from_millis(500)).await;
        tokio::task::yield_now().await;
        assert_eq!(writer.batches(), vec![vec![1, 2, 3], vec![4]]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_batch_failure_falls_back_to_single_inserts() {
        let writer = Arc::new(FakeWriter {
            fail_batch: true,
            fail_idx: vec![2],
            ..Default::default()
        });
        let buf = buffer(writer.clone(), 10);
        for i in 1..=3 {
            buf.append(step(i)).await;
        }
        assert_eq!(buf.flush().await, 2);
        assert_eq!(writer.singles(), vec![1, 3]);
        assert_eq!(buf.pending_len().await, 0);
        // nothing left for the armed timer
        tokio::time::sleep(Duration::from_millis(1500)).await;
        assert_eq!(writer.singles(), vec![1, 3]);
    }

    #[tokio::test]
    async fn test_debug_format() {
        let buf = buffer(Arc::new(FakeWriter::default()), 10);
        let out = format!("{:?}", buf);
        assert!(out.starts_with("StepBuffer"));
        assert!(out.contains("max_entries: 10"));
    }

    #[tokio::test]
    async fn test_flush_empty() {
        let writer = Arc::new(FakeWriter::default());
        let buf = buffer(writer.clone(), 10);
        assert_eq!(buf.flush().await, 0);
        assert!(writer.batches().is_empty());
    }
}
