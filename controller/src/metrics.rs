use models::policy::{NodeRefresh, RefreshPhase};

use kube::ResourceExt;
use opentelemetry::{metrics::Meter, Key};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tracing::instrument;

const PHASE_KEY: Key = Key::from_static_str("phase");

#[derive(Debug)]
pub struct RefreshControllerMetrics {
    shared_phase_data: Arc<Mutex<RefreshPhaseData>>,
}

#[derive(Debug, Default)]
/// The most recently observed phase of each NodeRefresh policy, keyed by namespace/name.
pub struct RefreshPhaseData {
    policy_phase_map: HashMap<String, RefreshPhase>,
}

impl RefreshControllerMetrics {
    #[instrument]
    pub fn new(meter: Meter) -> Self {
        let shared_phase_data = Arc::new(Mutex::new(RefreshPhaseData::default()));
        let phase_data_for_observer = Arc::clone(&shared_phase_data);

        // Observer for the number of policies currently in each phase.
        let policies_phase_observer = meter
            .u64_observable_gauge("node_refresh_policies")
            .with_description("NodeRefresh policies by phase")
            .init();

        let _ = meter.register_callback(move |cx| {
            let data = phase_data_for_observer.lock().unwrap();
            let mut counts: HashMap<String, u64> = HashMap::new();
            for phase in data.policy_phase_map.values() {
                *counts.entry(phase.to_string()).or_insert(0) += 1;
            }
            for (phase, count) in counts {
                let labels = vec![PHASE_KEY.string(phase)];
                policies_phase_observer.observe(cx, count, &labels);
            }
        });

        RefreshControllerMetrics { shared_phase_data }
    }

    /// Record the phase a policy was observed in during reconciliation.
    pub fn observe_policy(&self, policy: &NodeRefresh) {
        let phase = policy
            .status
            .as_ref()
            .map(|status| status.phase)
            .unwrap_or_default();
        let key = format!(
            "{}/{}",
            policy.namespace().unwrap_or_default(),
            policy.name_any()
        );
        if let Ok(mut data) = self.shared_phase_data.try_lock() {
            data.policy_phase_map.insert(key, phase);
        }
    }
}
