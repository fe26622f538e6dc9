use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use tracing::info;

use crate::core::mirror::{MirrorEngine, MirrorReport};
use crate::core::models::BackupTask;
use crate::error::MirrorError;

#[derive(Default)]
struct EngineState {
    calls: Vec<BackupTask>,
    failing_sources: HashSet<PathBuf>,
}

/// Pretends to mirror: records the task, waits `delay` and reports success
/// unless the source was marked as failing. Clones share their record.
#[derive(Clone, Default)]
pub struct SimulatedEngine {
    delay: Duration,
    state: Arc<Mutex<EngineState>>,
}

impl SimulatedEngine {
    pub fn with_delay(delay: Duration) -> Self {
        Self {
            delay,
            ..Self::default()
        }
    }

    fn state(&self) -> MutexGuard<'_, EngineState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Make every mirror of `source` fail until `heal_source` is called.
    pub fn fail_source(&self, source: impl Into<PathBuf>) {
        self.state().failing_sources.insert(source.into());
    }

    pub fn heal_source(&self, source: &Path) {
        self.state().failing_sources.remove(source);
    }

    /// Every task received so far, in order.
    pub fn calls(&self) -> Vec<BackupTask> {
        self.state().calls.clone()
    }

    pub fn call_count(&self) -> usize {
        self.state().calls.len()
    }
}

#[async_trait]
impl MirrorEngine for SimulatedEngine {
    async fn mirror(&self, task: &BackupTask) -> Result<MirrorReport, MirrorError> {
        self.state().calls.push(task.clone());

        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }

        let failing = self.state().failing_sources.contains(&task.source);

        if failing {
            return Err(MirrorError::Simulated(task.source.clone()));
        }

        info!(
            source = %task.source.display(),
            target = %task.target.display(),
            "(Simulated) mirror complete"
        );
        Ok(MirrorReport::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::models::DeviceKey;

    #[tokio::test]
    async fn test_task_recorded_while_mirror_is_in_progress() {
        let engine = SimulatedEngine::with_delay(Duration::from_secs(60));
        let task = BackupTask {
            key: DeviceKey::new("sda", "/media/usb1"),
            source: PathBuf::from("/media/usb1"),
            target: PathBuf::from("/backup/usb1"),
        };

        let running = tokio::spawn({
            let engine = engine.clone();
            let task = task.clone();
            async move { engine.mirror(&task).await }
        });

        tokio::time::timeout(Duration::from_secs(5), async {
            while engine.call_count() == 0 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();

        assert_eq!(engine.calls(), vec![task]);
        assert!(!running.is_finished());
        running.abort();
    }

    #[tokio::test]
    async fn test_failing_source_is_still_recorded() {
        let engine = SimulatedEngine::default();
        engine.fail_source("/media/usb1");
        let task = BackupTask {
            key: DeviceKey::new("sda", "/media/usb1"),
            source: PathBuf::from("/media/usb1"),
            target: PathBuf::from("/backup/usb1"),
        };

        assert!(matches!(engine.mirror(&task).await, Err(MirrorError::Simulated(_))));
        assert_eq!(engine.call_count(), 1);

        engine.heal_source(Path::new("/media/usb1"));
        assert!(engine.mirror(&task).await.is_ok());
    }
}
