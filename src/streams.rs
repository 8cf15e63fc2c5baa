use std::collections::hash_map::Entry;
use std::collections::HashMap;

use crossbeam::channel::Sender;

use crate::config::PipelineConfig;
use crate::error::ConfigError;
use crate::persistence::CalibrationDocument;
use crate::pipeline::{Pipeline, PipelineOutput};
use crate::types::RawSample;

/// Independent pipelines keyed by stream id.
///
/// Every stream gets its own calibration, detector baseline and filter state.
/// Nothing is shared between entries except the configuration template.
pub struct StreamRegistry {
    config: PipelineConfig,
    persist_tx: Option<Sender<CalibrationDocument>>,
    pipelines: HashMap<String, Pipeline>,
}

impl StreamRegistry {
    pub fn new(config: PipelineConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self {
            config,
            persist_tx: None,
            pipelines: HashMap::new(),
        })
    }

    /// Pipelines created from now on hand accepted calibrations to `tx`.
    pub fn with_persistence(mut self, tx: Sender<CalibrationDocument>) -> Self {
        self.persist_tx = Some(tx);
        self
    }

    pub fn get(&self, stream_id: &str) -> Option<&Pipeline> {
        self.pipelines.get(stream_id)
    }

    pub fn get_mut(&mut self, stream_id: &str) -> Option<&mut Pipeline> {
        self.pipelines.get_mut(stream_id)
    }

    pub fn get_or_create(&mut self, stream_id: &str) -> Result<&mut Pipeline, ConfigError> {
        match self.pipelines.entry(stream_id.to_string()) {
            Entry::Occupied(entry) => Ok(entry.into_mut()),
            Entry::Vacant(entry) => {
                let mut pipeline = Pipeline::new(self.config.clone())?;
                if let Some(tx) = &self.persist_tx {
                    pipeline = pipeline.with_persistence(tx.clone());
                }
                log::info!("New stream '{}'", stream_id);
                Ok(entry.insert(pipeline))
            }
        }
    }

    pub fn process(&mut self, stream_id: &str, raw: &RawSample) -> Result<PipelineOutput, ConfigError> {
        Ok(self.get_or_create(stream_id)?.process(raw))
    }

    pub fn remove(&mut self, stream_id: &str) -> Option<Pipeline> {
        let removed = self.pipelines.remove(stream_id);
        if removed.is_some() {
            log::info!("Dropped stream '{}'", stream_id);
        }
        removed
    }

    pub fn stream_ids(&self) -> impl Iterator<Item = &str> {
        self.pipelines.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.pipelines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pipelines.is_empty()
    }
}
