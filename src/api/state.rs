use std::sync::Arc;

use crate::trading::pipeline::SignalPipeline;
use crate::trading::strategy::performance_tracker::StrategyPerformanceTracker;

/// 各处理器共享的应用状态
#[derive(Clone)]
pub struct AppState {
    pub pipeline: Arc<SignalPipeline>,
    pub tracker: Arc<StrategyPerformanceTracker>,
}

impl AppState {
    pub fn new(pipeline: Arc<SignalPipeline>) -> Self {
        let tracker = pipeline.tracker().clone();
        Self { pipeline, tracker }
    }
}
