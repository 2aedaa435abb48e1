//! Ingestion pipeline: reconciler, alert evaluator and recent alerts, with
//! fan-out to the bus and read-only watch views.
//!
//! Events are published in this order for every accepted observation:
//! `newData`/`update`, then `reconciled`, then `alert` when one is raised.
//! Rejected observations publish nothing.

use std::sync::Arc;

use tokio::sync::watch;
use tracing::debug;

use airwatch_core::{
    Alert, AlertEvaluator, BusEvent, DeviceStatus, EventBus, ObservationEvent, ReconciledSnapshot,
    ReconciledUpdate, Reconciler, RecentAlerts, Settings, SubscriptionBus,
};

/// How an observation reached the session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Origin {
    NewData,
    Update,
}

/// Watch channels the manager keeps while the pipeline moves between owners.
#[derive(Debug, Clone)]
pub struct PipelineViews {
    pub snapshot: Arc<watch::Sender<Arc<ReconciledSnapshot>>>,
    pub alerts: Arc<watch::Sender<Vec<Alert>>>,
}

impl PipelineViews {
    pub fn new() -> Self {
        let (snapshot, _) = watch::channel(Arc::new(ReconciledSnapshot::default()));
        let (alerts, _) = watch::channel(Vec::new());
        Self {
            snapshot: Arc::new(snapshot),
            alerts: Arc::new(alerts),
        }
    }
}

impl Default for PipelineViews {
    fn default() -> Self {
        Self::new()
    }
}

pub struct IngestPipeline {
    reconciler: Reconciler,
    evaluator: AlertEvaluator,
    recent_alerts: RecentAlerts,
    bus: Arc<SubscriptionBus>,
    views: PipelineViews,
}

impl IngestPipeline {
    pub fn new(settings: &Settings, bus: Arc<SubscriptionBus>, views: PipelineViews) -> Self {
        Self {
            reconciler: Reconciler::new(settings.reconciler.history_cap),
            evaluator: AlertEvaluator::new(settings.alerts.clone()),
            recent_alerts: RecentAlerts::new(settings.alerts.recent_capacity),
            bus,
            views,
        }
    }

    /// Reconcile one observation. Returns the update when it was accepted.
    pub fn ingest(&mut self, event: ObservationEvent, origin: Origin) -> Option<Arc<ReconciledUpdate>> {
        let update = match self.reconciler.ingest(event) {
            Ok(update) => Arc::new(update),
            Err(e) => {
                debug!(error = %e, "Ignoring stale observation");
                return None;
            }
        };

        let accepted = Arc::new(update.appended.clone());
        self.bus.publish(match origin {
            Origin::NewData => BusEvent::NewData(accepted),
            Origin::Update => BusEvent::Update(accepted),
        });
        self.bus.publish(BusEvent::Reconciled(update.clone()));
        self.views.snapshot.send_replace(update.snapshot.clone());

        match self.evaluator.try_evaluate(&update.appended) {
            Ok(Some(alert)) if self.recent_alerts.contains(&alert.station_id, alert.triggered_at) => {
                debug!(station_id = %alert.station_id, "Alert already pushed by backend");
            }
            Ok(Some(alert)) => self.record_alert(alert),
            Ok(None) => {}
            Err(e) => debug!(error = %e, "Observation not evaluated"),
        }

        Some(update)
    }

    /// Ingest a batch ordered oldest to newest; returns the accepted count.
    pub fn preload<I>(&mut self, events: I) -> usize
    where
        I: IntoIterator<Item = ObservationEvent>,
    {
        events
            .into_iter()
            .filter_map(|event| self.ingest(event, Origin::NewData))
            .count()
    }

    /// Keep and publish an alert raised by the backend.
    ///
    /// Dropped when it is for a reading older than the station's latest, or
    /// when the same reading already raised an alert here.
    pub fn accept_pushed_alert(&mut self, alert: Alert) -> bool {
        if let Some(latest) = self.reconciler.latest(&alert.station_id) {
            if alert.triggered_at < latest.observed_at {
                debug!(
                    station_id = %alert.station_id,
                    triggered_at = %alert.triggered_at,
                    "Ignoring pushed alert for a superseded reading"
                );
                return false;
            }
        }
        if self.recent_alerts.contains(&alert.station_id, alert.triggered_at) {
            debug!(station_id = %alert.station_id, "Ignoring duplicate pushed alert");
            return false;
        }

        self.record_alert(alert);
        true
    }

    fn record_alert(&mut self, alert: Alert) {
        self.recent_alerts.push(alert.clone());
        self.views.alerts.send_replace(self.recent_alerts.to_vec());
        self.bus.publish(BusEvent::Alert(Arc::new(alert)));
    }

    pub fn publish_device_status(&self, status: DeviceStatus) {
        self.bus.publish(BusEvent::DeviceStatus(Arc::new(status)));
    }

    pub fn reconciler(&self) -> &Reconciler {
        &self.reconciler
    }

    pub fn recent_alerts(&self) -> &RecentAlerts {
        &self.recent_alerts
    }

    pub fn views(&self) -> &PipelineViews {
        &self.views
    }
}
