use std::sync::Arc;

use crate::adapters::{self, HostAdapters};
use crate::config::AppConfig;
use crate::core::classifier::{Classifier, ClassifierRules};
use crate::core::hardware::{BusProbe, DeviceTreeSource};
use crate::core::mirror::{MirrorEngine, create_engine};
use crate::core::ownership::resolve_backup_owner;

#[derive(Clone)]
pub struct AppContext {
    pub config: Arc<AppConfig>,
    pub source: Arc<dyn DeviceTreeSource>,
    pub probe: Arc<dyn BusProbe>,
    pub engine: Arc<dyn MirrorEngine>,
}

impl AppContext {
    /// Wire up the real (or, with `simulation`, simulated) host and the
    /// configured mirror engine.
    pub fn new(config: AppConfig) -> Self {
        let host = adapters::get_host(&config);
        let owner = resolve_backup_owner(&config.backup_directory);
        let engine = create_engine(config.mirror_engine, owner);
        Self::with_collaborators(config, host, engine)
    }

    pub fn with_collaborators(
        config: AppConfig,
        host: HostAdapters,
        engine: Arc<dyn MirrorEngine>,
    ) -> Self {
        Self {
            config: Arc::new(config),
            source: host.source,
            probe: host.probe,
            engine,
        }
    }

    pub fn classifier(&self) -> Classifier {
        Classifier::new(
            self.source.clone(),
            self.probe.clone(),
            ClassifierRules::from_config(&self.config),
        )
    }
}
