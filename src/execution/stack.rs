// =============================================================================
// Execution stack — orchestrates routing → planning → placement → recording
// =============================================================================
//
// One instance per trading mode. The stack owns the forensic journal, the
// telemetry dashboard, the anomaly detector and the TCA reporter; order
// placement goes through the caller-supplied broker client so live and paper
// modes share the same path.
//
// The heartbeat runs on its own timer, started once via
// `start_heartbeat_timer`. It must stay independent of `execute` traffic:
// a stuck order in a quiet market still has to surface.
// =============================================================================

use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use parking_lot::Mutex;
use serde_json::{json, Map, Value};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::anomaly::{AnomalyDetector, IncidentResponder, RemediationHooks};
use crate::broker::{BrokerClient, BrokerOrderArgs, OrderRecord, BROKER_CALL_TIMEOUT};
use crate::events::EventBus;
use crate::journal::{utc_now_iso, ExecutionJournal, TraceContext};
use crate::telemetry::{TcaReporter, TelemetryDashboard};
use crate::types::{OrderStatus, OrderType, TradingMode};

use super::planner::ExecutionAlgoPlanner;
use super::request::ExecutionRequest;
use super::retry::{ErrorBucket, RetryPolicy};
use super::router::SmartOrderRouter;
use super::slippage::SlippageModel;
use super::ExecError;

/// Fixed heartbeat cadence for anomaly surveillance + TCA regeneration.
const HEARTBEAT_INTERVAL_SECS: u64 = 30;

// ---------------------------------------------------------------------------
// Fill quality tracker
// ---------------------------------------------------------------------------

/// Per-child placement/error records, one JSON line each, feeding offline
/// execution-quality analysis.
pub struct FillQualityTracker {
    path: PathBuf,
}

impl FillQualityTracker {
    pub fn new(trading_mode: TradingMode, base_dir: &Path) -> Self {
        Self {
            path: base_dir.join(format!("execution_quality_{trading_mode}.jsonl")),
        }
    }

    pub fn append(&self, record: &Map<String, Value>) {
        let line = match serde_json::to_string(&Value::Object(record.clone())) {
            Ok(line) => line,
            Err(err) => {
                error!(error = %err, "failed to serialise execution quality record");
                return;
            }
        };
        if let Err(err) = self.append_line(&line) {
            error!(error = %err, path = %self.path.display(), "failed to write execution quality record");
        }
    }

    fn append_line(&self, line: &str) -> std::io::Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        file.write_all(line.as_bytes())?;
        file.write_all(b"\n")?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Execution stack
// ---------------------------------------------------------------------------

pub struct ExecutionStack {
    router: SmartOrderRouter,
    planner: ExecutionAlgoPlanner,
    slippage: SlippageModel,
    retry: RetryPolicy,
    fill_quality: FillQualityTracker,
    journal: Arc<ExecutionJournal>,
    dashboard: Arc<TelemetryDashboard>,
    detector: Arc<AnomalyDetector>,
    tca: TcaReporter,
    heartbeat_handle: Mutex<Option<JoinHandle<()>>>,
}

impl ExecutionStack {
    pub fn new(
        trading_mode: TradingMode,
        base_dir: &Path,
        remediation_hooks: Arc<dyn RemediationHooks>,
        bus: EventBus,
    ) -> Self {
        let journal = Arc::new(ExecutionJournal::new(trading_mode, base_dir));
        let dashboard = Arc::new(TelemetryDashboard::new(trading_mode, base_dir));
        let responder = Arc::new(IncidentResponder::new(
            journal.clone(),
            remediation_hooks,
            bus,
        ));
        let detector = Arc::new(AnomalyDetector::new(responder));

        Self {
            router: SmartOrderRouter::new(),
            planner: ExecutionAlgoPlanner::new(),
            slippage: SlippageModel::new(),
            retry: RetryPolicy::new(),
            fill_quality: FillQualityTracker::new(trading_mode, base_dir),
            journal,
            dashboard,
            detector,
            tca: TcaReporter::new(trading_mode, base_dir),
            heartbeat_handle: Mutex::new(None),
        }
    }

    pub fn journal(&self) -> &Arc<ExecutionJournal> {
        &self.journal
    }

    pub fn dashboard(&self) -> &Arc<TelemetryDashboard> {
        &self.dashboard
    }

    pub fn detector(&self) -> &Arc<AnomalyDetector> {
        &self.detector
    }

    // -------------------------------------------------------------------------
    // Heartbeat timer
    // -------------------------------------------------------------------------

    /// Start the background heartbeat. Call once after the stack is wired;
    /// idempotent thereafter.
    pub fn start_heartbeat_timer(self: &Arc<Self>) {
        let mut slot = self.heartbeat_handle.lock();
        if slot.is_some() {
            return;
        }
        let stack = Arc::clone(self);
        *slot = Some(tokio::spawn(async move {
            let mut ticker =
                tokio::time::interval(std::time::Duration::from_secs(HEARTBEAT_INTERVAL_SECS));
            // The first tick fires immediately; skip it so startup is quiet.
            ticker.tick().await;
            loop {
                ticker.tick().await;
                stack.heartbeat();
            }
        }));
        info!(interval_secs = HEARTBEAT_INTERVAL_SECS, "execution heartbeat started");
    }

    /// Cancel the heartbeat (engine shutdown).
    pub fn stop_heartbeat_timer(&self) {
        if let Some(handle) = self.heartbeat_handle.lock().take() {
            handle.abort();
            info!("execution heartbeat stopped");
        }
    }

    /// One surveillance pass: anomaly checks plus TCA regeneration. Public
    /// so external schedulers can also drive it.
    pub fn heartbeat(&self) {
        self.detector.heartbeat();
        self.tca.generate(&self.journal);
    }

    // -------------------------------------------------------------------------
    // Core execute path
    // -------------------------------------------------------------------------

    /// Transform a parent request into child orders at the broker.
    ///
    /// Returns the child order ids in submission order. On terminal failure
    /// the ids placed before the failing slice are inside the error so the
    /// caller can reconcile.
    pub async fn execute(
        &self,
        request: &ExecutionRequest,
        broker: &dyn BrokerClient,
        base_order_args: &BrokerOrderArgs,
    ) -> Result<Vec<String>, ExecError> {
        let mut tags = Map::new();
        tags.insert("tradingsymbol".into(), json!(request.tradingsymbol));
        tags.insert("execution_algo".into(), json!(request.execution_algo.as_str()));
        tags.insert(
            "source".into(),
            json!(request.metadata_str("source").unwrap_or("unknown")),
        );
        let mut trace = TraceContext::new(tags);

        // Duplicate detection works even without an explicit signal id: the
        // detector derives a fallback from the order context.
        let raw_signal_id = request
            .metadata_str("signal_id")
            .map(str::to_string)
            .or_else(|| request.metadata.get("auto_token").map(value_to_string))
            .unwrap_or_default();
        self.detector.on_signal(
            &raw_signal_id,
            &request.tradingsymbol,
            request.quantity,
            request.metadata_str("source").unwrap_or(""),
        );

        let route = self.router.choose_route(request);
        let slices = self.planner.plan(request);
        let mut order_ids: Vec<String> = Vec::with_capacity(slices.len());

        let signal_event = trace.next_span(
            "signal_received",
            obj(&[
                (
                    "signal_id",
                    if raw_signal_id.is_empty() {
                        Value::Null
                    } else {
                        json!(raw_signal_id)
                    },
                ),
                ("tradingsymbol", json!(request.tradingsymbol)),
                ("quantity", json!(request.quantity)),
                ("metadata", Value::Object(request.metadata.clone())),
            ]),
        );
        self.journal.append("signal", signal_event.clone());
        self.dashboard.observe("signal", &signal_event);

        for (idx, &child_qty) in slices.iter().enumerate() {
            let child_index = idx + 1;
            let metrics = self.slippage.estimate(request, child_qty);

            let mut order_args = base_order_args.clone();
            order_args.quantity = child_qty;
            order_args.order_type = route.order_type;
            order_args.price = if route.order_type == OrderType::Limit {
                route.limit_price
            } else {
                None
            };

            let mut attempts: u32 = 0;
            loop {
                let started_at = Instant::now();
                let outcome = match tokio::time::timeout(
                    BROKER_CALL_TIMEOUT,
                    broker.place_order(&order_args),
                )
                .await
                {
                    Ok(result) => result,
                    Err(_) => Err(anyhow::anyhow!(
                        "broker call timeout after {}s",
                        BROKER_CALL_TIMEOUT.as_secs()
                    )),
                };

                match outcome {
                    Ok(order_id) => {
                        self.detector.on_order_submitted(&order_id);
                        order_ids.push(order_id.clone());

                        let placed_record = obj(&[
                            ("timestamp", json!(utc_now_iso())),
                            ("trace_id", json!(trace.trace_id)),
                            ("tradingsymbol", json!(request.tradingsymbol)),
                            ("child_index", json!(child_index)),
                            ("children", json!(slices.len())),
                            ("quantity", json!(child_qty)),
                            ("order_id", json!(order_id)),
                            ("arrival_price", json!(request.ltp)),
                            ("limit_price", json!(order_args.price)),
                            ("expected_slippage", json!(metrics.expected_slippage)),
                            ("impact_estimate", json!(metrics.impact_estimate)),
                            ("latency_ms", json!(round2(started_at.elapsed().as_secs_f64() * 1000.0))),
                            ("execution_algo", json!(request.execution_algo.as_str())),
                            ("route", json!(route.route)),
                            ("queue_priority", json!(route.queue_priority.as_str())),
                            ("status", json!("placed")),
                            ("risk_used", metadata_value(request, "risk_used")),
                            ("risk_total", metadata_value(request, "risk_total")),
                        ]);
                        self.fill_quality.append(&placed_record);
                        let journal_event = trace.next_span("order_placed", placed_record.clone());
                        self.journal.append("order_placed", journal_event);
                        self.dashboard.observe("order_placed", &placed_record);
                        break;
                    }
                    Err(err) => {
                        let message = format!("{err:#}");
                        let bucket = self.retry.classify(&message);
                        let max_attempts = self.retry.max_attempts(bucket);
                        attempts += 1;

                        let error_record = obj(&[
                            ("timestamp", json!(utc_now_iso())),
                            ("trace_id", json!(trace.trace_id)),
                            ("tradingsymbol", json!(request.tradingsymbol)),
                            ("child_index", json!(child_index)),
                            ("children", json!(slices.len())),
                            ("quantity", json!(child_qty)),
                            ("arrival_price", json!(request.ltp)),
                            ("expected_slippage", json!(metrics.expected_slippage)),
                            ("impact_estimate", json!(metrics.impact_estimate)),
                            ("execution_algo", json!(request.execution_algo.as_str())),
                            ("route", json!(route.route)),
                            ("queue_priority", json!(route.queue_priority.as_str())),
                            ("status", json!("error")),
                            ("error_bucket", json!(bucket.as_str())),
                            ("error", json!(message)),
                            ("attempt", json!(attempts)),
                            ("risk_used", metadata_value(request, "risk_used")),
                            ("risk_total", metadata_value(request, "risk_total")),
                        ]);
                        self.fill_quality.append(&error_record);
                        self.journal
                            .append("order_error", trace.next_span("order_error", error_record.clone()));
                        self.dashboard.observe("order_error", &error_record);

                        if attempts >= max_attempts {
                            warn!(
                                tradingsymbol = %request.tradingsymbol,
                                bucket = %bucket,
                                attempts,
                                "execution giving up on child order"
                            );
                            return Err(match bucket {
                                ErrorBucket::Risk => ExecError::RiskRejection {
                                    reason: message,
                                    placed_order_ids: order_ids,
                                },
                                _ => ExecError::Fatal {
                                    bucket,
                                    attempts,
                                    message,
                                    placed_order_ids: order_ids,
                                },
                            });
                        }
                        tokio::time::sleep(self.retry.backoff(bucket, attempts - 1)).await;
                    }
                }
            }
        }

        Ok(order_ids)
    }

    // -------------------------------------------------------------------------
    // Fill / exit recording
    // -------------------------------------------------------------------------

    /// Call whenever a fill confirmation arrives (live or paper). Closes out
    /// anomaly surveillance for the order.
    pub fn record_fill(&self, order_id: &str, filled_price: f64, filled_qty: i64) {
        self.detector.on_order_closed(order_id);
        let payload = obj(&[
            ("order_id", json!(order_id)),
            ("filled_price", json!(filled_price)),
            ("filled_qty", json!(filled_qty)),
            ("status", json!("filled")),
        ]);
        self.journal.append("order_fill", payload.clone());
        self.dashboard.observe("order_fill", &payload);
    }

    /// Convenience hook for paper `OrderUpdate` events: only COMPLETE
    /// records with a positive fill close out surveillance.
    pub fn record_paper_fill(&self, order: &OrderRecord) {
        if order.status != OrderStatus::Complete {
            return;
        }
        let filled_price = if order.average_price > 0.0 {
            order.average_price
        } else {
            order.price.unwrap_or(0.0)
        };
        let filled_qty = if order.filled_quantity > 0 {
            order.filled_quantity
        } else {
            order.quantity
        };
        if !order.order_id.is_empty() && filled_qty > 0 {
            self.record_fill(&order.order_id, filled_price, filled_qty);
        }
    }

    /// Call when an order is cancelled or rejected so it leaves the
    /// stuck-order watchlist immediately.
    pub fn record_cancelled(&self, order_id: &str) {
        self.detector.on_order_closed(order_id);
        self.journal.append(
            "order_cancelled",
            obj(&[("order_id", json!(order_id)), ("status", json!("cancelled"))]),
        );
    }

    pub fn record_exit(&self, tradingsymbol: &str, outcome: &str, pnl: f64) {
        let payload = obj(&[
            ("tradingsymbol", json!(tradingsymbol)),
            ("outcome", json!(outcome)),
            ("pnl", json!(pnl)),
            ("status", json!("closed")),
        ]);
        self.journal.append("position_exit", payload.clone());
        self.dashboard.observe("position_exit", &payload);
    }

    /// Forward tick liveness to the anomaly detector.
    pub fn ingest_tick(&self, symbol: &str, tick_ts: Option<f64>) {
        self.detector.on_tick(symbol, tick_ts);
    }
}

impl Drop for ExecutionStack {
    fn drop(&mut self) {
        if let Some(handle) = self.heartbeat_handle.lock().take() {
            handle.abort();
        }
    }
}

impl std::fmt::Debug for ExecutionStack {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutionStack")
            .field("journal", &self.journal)
            .field("detector", &self.detector)
            .finish()
    }
}

fn obj(pairs: &[(&str, Value)]) -> Map<String, Value> {
    pairs.iter().map(|(k, v)| (k.to_string(), v.clone())).collect()
}

fn metadata_value(request: &ExecutionRequest, key: &str) -> Value {
    request.metadata.get(key).cloned().unwrap_or(Value::Null)
}

fn value_to_string(v: &Value) -> String {
    match v {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn round2(v: f64) -> f64 {
    (v * 100.0).round() / 100.0
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::anomaly::NoopHooks;
    use crate::broker::BrokerPosition;
    use crate::execution::request::ExecutionAlgo;
    use crate::types::{Exchange, ProductType, TransactionType};
    use async_trait::async_trait;
    use std::collections::VecDeque;

    /// Broker double that replays a script of outcomes.
    struct ScriptedBroker {
        script: Mutex<VecDeque<Result<String, String>>>,
        placed: Mutex<Vec<BrokerOrderArgs>>,
    }

    impl ScriptedBroker {
        fn new(script: Vec<Result<String, String>>) -> Self {
            Self {
                script: Mutex::new(script.into_iter().collect()),
                placed: Mutex::new(Vec::new()),
            }
        }

        fn placed_count(&self) -> usize {
            self.placed.lock().len()
        }
    }

    #[async_trait]
    impl BrokerClient for ScriptedBroker {
        async fn place_order(&self, args: &BrokerOrderArgs) -> anyhow::Result<String> {
            self.placed.lock().push(args.clone());
            match self.script.lock().pop_front() {
                Some(Ok(id)) => Ok(id),
                Some(Err(msg)) => Err(anyhow::anyhow!(msg)),
                None => Ok(format!("auto_{}", self.placed.lock().len())),
            }
        }

        async fn cancel_order(&self, _order_id: &str) -> anyhow::Result<()> {
            Ok(())
        }

        async fn positions(&self) -> anyhow::Result<Vec<BrokerPosition>> {
            Ok(Vec::new())
        }

        async fn orders(&self) -> anyhow::Result<Vec<OrderRecord>> {
            Ok(Vec::new())
        }

        async fn profile(&self) -> anyhow::Result<Value> {
            Ok(json!({"user_id": "TEST"}))
        }

        async fn margins(&self) -> anyhow::Result<Value> {
            Ok(json!({}))
        }
    }

    fn stack(dir: &Path) -> ExecutionStack {
        ExecutionStack::new(TradingMode::Paper, dir, Arc::new(NoopHooks), EventBus::new())
    }

    fn market_request(qty: i64) -> ExecutionRequest {
        ExecutionRequest::new(
            "NIFTY24DEC24500CE",
            TransactionType::Buy,
            qty,
            crate::types::OrderType::Market,
            ProductType::Mis,
            120.0,
        )
    }

    fn base_args(qty: i64) -> BrokerOrderArgs {
        BrokerOrderArgs {
            exchange: Exchange::Nfo,
            tradingsymbol: "NIFTY24DEC24500CE".into(),
            transaction_type: TransactionType::Buy,
            quantity: qty,
            product: ProductType::Mis,
            order_type: crate::types::OrderType::Market,
            price: None,
            trigger_price: None,
            group_name: None,
        }
    }

    fn journal_events(stack: &ExecutionStack, event_type: &str) -> Vec<Map<String, Value>> {
        stack
            .journal()
            .read_entries()
            .into_iter()
            .filter(|e| e.get("event_type").and_then(Value::as_str) == Some(event_type))
            .collect()
    }

    #[tokio::test]
    async fn happy_path_single_strike() {
        let dir = tempfile::tempdir().unwrap();
        let stack = stack(dir.path());
        let broker = ScriptedBroker::new(vec![Ok("ord_1".into())]);

        let ids = stack
            .execute(&market_request(50), &broker, &base_args(50))
            .await
            .unwrap();
        assert_eq!(ids, vec!["ord_1"]);

        let placed = journal_events(&stack, "order_placed");
        assert_eq!(placed.len(), 1);
        assert_eq!(placed[0]["child_index"], json!(1));
        assert_eq!(placed[0]["children"], json!(1));
        assert_eq!(placed[0]["quantity"], json!(50));
        assert_eq!(placed[0]["arrival_price"], json!(120.0));
        assert_eq!(stack.dashboard().counter("order_placed"), 1);

        // The fill closes anomaly surveillance and the TCA fill rate is 100.
        stack.record_fill("ord_1", 120.0, 50);
        assert_eq!(stack.detector().active_order_count(), 0);
        stack.heartbeat();
        let tca: Value = serde_json::from_str(
            &std::fs::read_to_string(dir.path().join("tca_report_paper.json")).unwrap(),
        )
        .unwrap();
        assert_eq!(tca["fill_rate_pct"], json!(100.0));
    }

    #[tokio::test]
    async fn twap_places_children_in_planner_order() {
        let dir = tempfile::tempdir().unwrap();
        let stack = stack(dir.path());
        let broker = ScriptedBroker::new(vec![
            Ok("c1".into()),
            Ok("c2".into()),
            Ok("c3".into()),
            Ok("c4".into()),
        ]);

        let mut request = market_request(100);
        request.execution_algo = ExecutionAlgo::Twap;
        request.max_child_orders = 4;
        request.randomize_slices = false;

        let ids = stack.execute(&request, &broker, &base_args(100)).await.unwrap();
        assert_eq!(ids, vec!["c1", "c2", "c3", "c4"]);

        let placed = journal_events(&stack, "order_placed");
        assert_eq!(placed.len(), 4);
        for (i, event) in placed.iter().enumerate() {
            assert_eq!(event["child_index"], json!(i + 1));
            assert_eq!(event["quantity"], json!(25));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn transient_errors_retry_with_backoff() {
        let dir = tempfile::tempdir().unwrap();
        let stack = stack(dir.path());
        let broker = ScriptedBroker::new(vec![
            Err("connection reset".into()),
            Err("connection reset".into()),
            Ok("ord_1".into()),
        ]);

        let before = tokio::time::Instant::now();
        let ids = stack
            .execute(&market_request(50), &broker, &base_args(50))
            .await
            .unwrap();
        let slept = before.elapsed();

        assert_eq!(ids, vec!["ord_1"]);
        assert_eq!(broker.placed_count(), 3);

        // 0.2 s after the first failure, 0.4 s after the second.
        assert!(
            slept >= std::time::Duration::from_millis(600),
            "expected >= 600ms of backoff, got {slept:?}"
        );
        assert!(slept < std::time::Duration::from_millis(800));

        let errors = journal_events(&stack, "order_error");
        assert_eq!(errors.len(), 2);
        assert_eq!(errors[0]["error_bucket"], json!("transient"));
        assert_eq!(errors[0]["attempt"], json!(1));
        assert_eq!(errors[1]["attempt"], json!(2));
    }

    #[tokio::test]
    async fn risk_errors_never_retry() {
        let dir = tempfile::tempdir().unwrap();
        let stack = stack(dir.path());
        let broker = ScriptedBroker::new(vec![
            Err("Insufficient margin. Required 100000".into()),
            Ok("should_never_place".into()),
        ]);

        let err = stack
            .execute(&market_request(50), &broker, &base_args(50))
            .await
            .unwrap_err();

        match err {
            ExecError::RiskRejection { reason, placed_order_ids } => {
                assert!(reason.to_lowercase().contains("insufficient"));
                assert!(placed_order_ids.is_empty());
            }
            other => panic!("expected risk rejection, got {other:?}"),
        }
        assert_eq!(broker.placed_count(), 1);
    }

    #[tokio::test]
    async fn fatal_error_carries_already_placed_children() {
        let dir = tempfile::tempdir().unwrap();
        let stack = stack(dir.path());
        let broker = ScriptedBroker::new(vec![
            Ok("c1".into()),
            Err("order id invalid".into()),
        ]);

        let mut request = market_request(100);
        request.execution_algo = ExecutionAlgo::Twap;
        request.max_child_orders = 2;
        request.randomize_slices = false;

        let err = stack.execute(&request, &broker, &base_args(100)).await.unwrap_err();
        match err {
            ExecError::Fatal { bucket, placed_order_ids, .. } => {
                assert_eq!(bucket, ErrorBucket::Fatal);
                assert_eq!(placed_order_ids, vec!["c1".to_string()]);
            }
            other => panic!("expected fatal, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn execute_feeds_duplicate_signal_detection() {
        let dir = tempfile::tempdir().unwrap();
        let stack = stack(dir.path());
        let broker = ScriptedBroker::new(vec![Ok("a".into()), Ok("b".into())]);

        let mut request = market_request(50);
        request
            .metadata
            .insert("signal_id".into(), json!("sig_77"));

        stack.execute(&request, &broker, &base_args(50)).await.unwrap();
        stack.execute(&request, &broker, &base_args(50)).await.unwrap();

        let incidents = journal_events(&stack, "incident");
        assert_eq!(incidents.len(), 1);
        assert_eq!(incidents[0]["incident"], json!("duplicate_signal"));
    }

    #[tokio::test]
    async fn paper_fill_recording_requires_complete_status() {
        let dir = tempfile::tempdir().unwrap();
        let stack = stack(dir.path());

        let mut order = OrderRecord {
            order_id: "paper_1".into(),
            tradingsymbol: "NIFTY24DEC24500CE".into(),
            transaction_type: TransactionType::Buy,
            quantity: 50,
            order_type: crate::types::OrderType::Market,
            product: ProductType::Mis,
            exchange: Exchange::Nfo,
            status: OrderStatus::Open,
            price: Some(120.0),
            trigger_price: None,
            order_timestamp: String::new(),
            average_price: 0.0,
            filled_quantity: 0,
            pending_quantity: 50,
            exchange_timestamp: None,
            group_name: None,
            entry_qty: 0,
            exit_qty: 0,
            realized_pnl: 0.0,
        };

        stack.record_paper_fill(&order);
        assert!(journal_events(&stack, "order_fill").is_empty());

        order.status = OrderStatus::Complete;
        order.average_price = 121.0;
        order.filled_quantity = 50;
        stack.record_paper_fill(&order);

        let fills = journal_events(&stack, "order_fill");
        assert_eq!(fills.len(), 1);
        assert_eq!(fills[0]["filled_price"], json!(121.0));
        assert_eq!(fills[0]["filled_qty"], json!(50));
    }

    #[tokio::test]
    async fn cancelled_orders_leave_surveillance() {
        let dir = tempfile::tempdir().unwrap();
        let stack = stack(dir.path());
        let broker = ScriptedBroker::new(vec![Ok("ord_1".into())]);

        stack
            .execute(&market_request(50), &broker, &base_args(50))
            .await
            .unwrap();
        assert_eq!(stack.detector().active_order_count(), 1);

        stack.record_cancelled("ord_1");
        assert_eq!(stack.detector().active_order_count(), 0);
        assert_eq!(journal_events(&stack, "order_cancelled").len(), 1);
    }
}
