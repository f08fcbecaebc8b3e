use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::clock::Clock;
use crate::node::{EngineError, NodeFactory, OperationResult, SplitPlan, StorageEngine};

/// Routes fabric logs through the test writer. Safe to call repeatedly.
pub(crate) fn init_test_tracing() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

/// A clock that only moves when a test advances it.
#[derive(Debug)]
pub(crate) struct FakeClock {
    base: Instant,
    offset: Mutex<Duration>,
}

impl FakeClock {
    pub(crate) fn new() -> Self {
        Self { base: Instant::now(), offset: Mutex::new(Duration::ZERO) }
    }

    pub(crate) fn advance(&self, duration: Duration) {
        let mut offset = self.offset.lock().unwrap();
        *offset = offset.saturating_add(duration);
    }
}

impl Clock for FakeClock {
    fn now(&self) -> Instant {
        self.base + *self.offset.lock().unwrap()
    }
}

/// Factory tag every test engine registers under.
pub(crate) const TEST_ENGINE_TAG: &str = "vector_bucket";

#[derive(Debug, Serialize, Deserialize)]
struct BucketState {
    objects: Vec<u64>,
    cost_per_op: u64,
}

/// A storage engine holding plain numbers as objects. Every operation costs a
/// fixed number of distance computations; the payload of an operation is
/// ignored and echoed back.
#[derive(Debug)]
pub(crate) struct VectorBucket {
    state: Mutex<BucketState>,
    execute_delay: Duration,
}

impl VectorBucket {
    pub(crate) fn new(objects: Vec<u64>, cost_per_op: u64) -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(BucketState { objects, cost_per_op }),
            execute_delay: Duration::ZERO,
        })
    }

    /// A bucket whose operations take `delay` to complete.
    pub(crate) fn with_delay(objects: Vec<u64>, cost_per_op: u64, delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(BucketState { objects, cost_per_op }),
            execute_delay: delay,
        })
    }

    /// Changes what future operations cost.
    pub(crate) fn set_cost(&self, cost_per_op: u64) {
        self.state.lock().unwrap().cost_per_op = cost_per_op;
    }
}

#[async_trait]
impl StorageEngine for VectorBucket {
    fn object_count(&self) -> u64 {
        u64::try_from(self.state.lock().unwrap().objects.len()).expect("count fits in u64")
    }

    async fn execute(&self, payload: &[u8]) -> Result<OperationResult, EngineError> {
        if !self.execute_delay.is_zero() {
            tokio::time::sleep(self.execute_delay).await;
        }
        let cost = self.state.lock().unwrap().cost_per_op;
        Ok(OperationResult { output: payload.to_vec(), distance_computations: cost })
    }

    async fn split(&self) -> Result<Option<SplitPlan>, EngineError> {
        let mut state = self.state.lock().unwrap();
        if state.objects.len() < 2 {
            return Ok(None);
        }
        let split_at = state.objects.len() / 2;
        let half = state.objects.split_off(split_at);
        let params = serde_json::json!({ "objects": half, "cost_per_op": state.cost_per_op });
        Ok(Some(SplitPlan { node_type: TEST_ENGINE_TAG.to_string(), params }))
    }

    async fn leave(&self) -> Result<(), EngineError> {
        self.state.lock().unwrap().objects.clear();
        Ok(())
    }

    async fn migrate(
        &self,
        _old: vantage_dispatch::NodeId,
        _new: vantage_dispatch::NodeId,
    ) -> Result<(), EngineError> {
        Ok(())
    }

    async fn snapshot(&self) -> Result<Vec<u8>, EngineError> {
        let state = self.state.lock().unwrap();
        serde_json::to_vec(&*state).map_err(|e| EngineError::Snapshot(e.to_string()))
    }
}

/// Factory for [`VectorBucket`] engines.
pub(crate) struct VectorBucketFactory;

impl NodeFactory for VectorBucketFactory {
    fn create(&self, params: &serde_json::Value) -> Result<Arc<dyn StorageEngine>, EngineError> {
        let state: BucketState = serde_json::from_value(params.clone())
            .map_err(|e| EngineError::Construction(e.to_string()))?;
        Ok(VectorBucket::new(state.objects, state.cost_per_op))
    }

    fn restore(&self, snapshot: &[u8]) -> Result<Arc<dyn StorageEngine>, EngineError> {
        let state: BucketState = serde_json::from_slice(snapshot)
            .map_err(|e| EngineError::Construction(e.to_string()))?;
        Ok(VectorBucket::new(state.objects, state.cost_per_op))
    }
}
