use crate::core::{BatchKey, FlowContext, FlowData, FlowStatus};
use crate::errors::FlowResult;
use async_trait::async_trait;
use uuid::Uuid;

/// Storage for flow contexts.
///
/// Implementations must offer read-your-writes consistency to a single
/// caller: a `find` issued after a successful write observes that write.
/// Results are returned in insertion order.
#[async_trait]
pub trait FlowContextRepo<T: FlowData>: Send + Sync {
    /// Inserts new contexts. Contexts whose id already exists are skipped.
    async fn save(&self, contexts: &[FlowContext<T>]) -> FlowResult<usize>;

    /// Replaces status, data, batch, error and timestamp of existing contexts.
    async fn update(&self, contexts: &[FlowContext<T>]) -> FlowResult<usize>;

    /// Inserts `successors` and applies [`update`](Self::update) to `origins`
    /// as one write.
    ///
    /// `fence` runs inside the write before anything becomes visible; when
    /// it fails nothing is written and its error is returned. Returns the
    /// `(saved, updated)` row counts.
    async fn advance(
        &self,
        successors: &[FlowContext<T>],
        origins: &[FlowContext<T>],
        fence: &(dyn Fn() -> FlowResult<()> + Send + Sync),
    ) -> FlowResult<(usize, usize)>;

    /// Replaces only data and batch of existing contexts.
    async fn update_data_and_batch(&self, contexts: &[FlowContext<T>]) -> FlowResult<usize>;

    /// Finds contexts of a stream at a position with a status, optionally
    /// restricted to one trace.
    async fn find(
        &self,
        stream_id: &str,
        trace_id: Option<Uuid>,
        position: &str,
        status: FlowStatus,
    ) -> FlowResult<Vec<FlowContext<T>>>;

    /// Finds contexts grouped under `key` with a status.
    async fn find_batch(
        &self,
        key: &BatchKey,
        status: FlowStatus,
    ) -> FlowResult<Vec<FlowContext<T>>>;

    /// Returns every context of a trace.
    async fn find_all_by_trace(&self, trace_id: Uuid) -> FlowResult<Vec<FlowContext<T>>>;

    /// Loads contexts by id; unknown ids are omitted.
    async fn find_by_ids(&self, ids: &[Uuid]) -> FlowResult<Vec<FlowContext<T>>>;
}
