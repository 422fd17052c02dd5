use crate::{
    aggregate::AggregationEngine, config::AppConfig, ingest::BatchProcessor, store::SensorStore,
};
use std::sync::Arc;

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<AppConfig>,
    pub store: Arc<dyn SensorStore>,
    pub aggregation: AggregationEngine,
    pub processor: Arc<BatchProcessor>,
}

impl AppState {
    pub fn new(config: Arc<AppConfig>, store: Arc<dyn SensorStore>) -> Self {
        let aggregation = AggregationEngine::new(Arc::clone(&store));
        let processor = Arc::new(BatchProcessor::new(
            Arc::clone(&store),
            config.ingest.clone(),
        ));
        Self {
            config,
            store,
            aggregation,
            processor,
        }
    }
}
