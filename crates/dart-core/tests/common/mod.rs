#![allow(dead_code)]

use std::sync::Arc;

use async_trait::async_trait;
use dart_core::gate::ApprovalRequest;
use dart_core::memory::{IncidentSummary, MemoryMatch, MemoryStore};
use dart_core::prelude::*;
use dart_core::test_harness::{QueueApprovals, ScriptedCollector, ScriptedExecutor, ScriptedReasoning, ScriptedVendor};
use dart_core::CollaboratorError;
use tokio::sync::mpsc::UnboundedReceiver;

pub struct Rig {
    pub commander: Arc<Commander>,
    pub approvals: UnboundedReceiver<ApprovalRequest>,
    pub executor: Arc<ScriptedExecutor>,
    pub reasoning: Arc<ScriptedReasoning>,
    pub vendor: Arc<ScriptedVendor>,
    pub sink: Arc<MemorySink>,
}

pub struct RigBuilder {
    config: CommanderConfig,
    collectors: Vec<ScriptedCollector>,
    vendor: ScriptedVendor,
    memory: Arc<dyn MemoryStore>,
    reasoning: ScriptedReasoning,
    executor: ScriptedExecutor,
}

impl RigBuilder {
    pub fn new() -> Self {
        Self {
            config: CommanderConfig::default(),
            collectors: Vec::new(),
            vendor: ScriptedVendor::honest(),
            memory: Arc::new(dart_core::InMemoryStore::new()),
            reasoning: ScriptedReasoning::default(),
            executor: ScriptedExecutor::default(),
        }
    }

    pub fn config(mut self, config: CommanderConfig) -> Self {
        self.config = config;
        self
    }

    pub fn collector(mut self, collector: ScriptedCollector) -> Self {
        self.collectors.push(collector);
        self
    }

    pub fn vendor(mut self, vendor: ScriptedVendor) -> Self {
        self.vendor = vendor;
        self
    }

    pub fn memory(mut self, memory: Arc<dyn MemoryStore>) -> Self {
        self.memory = memory;
        self
    }

    pub fn reasoning(mut self, reasoning: ScriptedReasoning) -> Self {
        self.reasoning = reasoning;
        self
    }

    pub fn executor(mut self, executor: ScriptedExecutor) -> Self {
        self.executor = executor;
        self
    }

    pub fn build(self) -> Rig {
        let (approvals, rx) = QueueApprovals::new();
        let executor = Arc::new(self.executor);
        let reasoning = Arc::new(self.reasoning);
        let vendor = Arc::new(self.vendor);
        let sink = Arc::new(MemorySink::new());

        let mut collaborators = Collaborators::new(
            vendor.clone(),
            self.memory,
            reasoning.clone(),
            executor.clone(),
            Arc::new(approvals),
        );
        for collector in self.collectors {
            collaborators = collaborators.with_collector(Arc::new(collector));
        }
        let commander = Commander::new(self.config, collaborators)
            .unwrap()
            .with_sink(sink.clone());

        Rig {
            commander: Arc::new(commander),
            approvals: rx,
            executor,
            reasoning,
            vendor,
            sink,
        }
    }
}

/// Memory store returning one incident at a fixed similarity
pub struct FixedMemory {
    pub similarity: f64,
    pub summary: IncidentSummary,
}

#[async_trait]
impl MemoryStore for FixedMemory {
    async fn query(&self, _signature: &str, _top_k: usize) -> Result<Vec<MemoryMatch>, CollaboratorError> {
        Ok(vec![MemoryMatch {
            similarity: self.similarity,
            summary: self.summary.clone(),
        }])
    }

    async fn store(&self, _summary: IncidentSummary) -> Result<(), CollaboratorError> {
        Ok(())
    }
}

pub fn incident(signature: &str, fix_action: &str) -> IncidentSummary {
    IncidentSummary {
        incident_id: MissionId::new(),
        signature: signature.into(),
        root_cause: "zero quantity rows reach the revenue view".into(),
        fix_type: "create_view".into(),
        fix_action: fix_action.into(),
        rollback: "restore previous view definition".into(),
        embedding: Vec::new(),
        timestamp: chrono::Utc::now(),
        evidence_digest: String::new(),
        vendor_verdict: VendorStatus::Degraded,
    }
}

pub fn div_zero_alert() -> Alert {
    Alert::new("revenue-dashboard", "ERROR_DIV_ZERO", "division by zero in revenue view")
}

pub fn column_missing_alert() -> Alert {
    Alert::new("billing-etl", "ERROR_COL_MISSING", "column region does not exist")
}

/// Alert no signature rule recognizes
pub fn opaque_alert() -> Alert {
    Alert::new("nightly-batch", "E42", "job stalled without output")
}

pub const SAFE_VIEW: &str = "CREATE OR REPLACE VIEW revenue AS SELECT total / NULLIF(qty, 0) AS unit_price FROM orders";
pub const ADD_COLUMN: &str = "ALTER TABLE invoices ADD COLUMN region TEXT";

/// Yield until the mission reaches `stage`
pub async fn wait_for_stage(commander: &Commander, id: MissionId, stage: Stage) {
    for _ in 0..1_000 {
        if commander.stage_of(id) == Some(stage) {
            return;
        }
        tokio::task::yield_now().await;
    }
    panic!("mission never reached {stage}");
}

pub fn summaries(record: &MissionRecord, kind: AuditKind) -> Vec<String> {
    record
        .audit
        .iter()
        .filter(|e| e.kind == kind)
        .map(|e| e.summary.clone())
        .collect()
}
