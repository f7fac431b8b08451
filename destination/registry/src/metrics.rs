use prometheus_client::{
    encoding::EncodeLabelSet,
    metrics::{counter::Counter, family::Family, gauge::Gauge},
    registry::Registry,
};

/// Describes the registry's watches and subscriptions.
///
/// A default instance records metrics that are not exported.
#[derive(Clone, Debug, Default)]
pub struct RegistryMetrics {
    watches: Gauge,
    watches_started: Family<ResolverLabels, Counter>,
    unresolvable: Counter,
    subscriptions: Gauge,
    subscriptions_lagged: Counter,
    deltas: Counter,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
struct ResolverLabels {
    resolver: &'static str,
}

// === impl RegistryMetrics ===

impl RegistryMetrics {
    pub fn register(prom: &mut Registry) -> Self {
        let metrics = Self::default();

        prom.register(
            "watches",
            "Gauge of the number of active destination watches",
            metrics.watches.clone(),
        );
        prom.register(
            "watches_started",
            "Count of destination watches started, by resolver",
            metrics.watches_started.clone(),
        );
        prom.register(
            "unresolvable",
            "Count of subscriptions to destinations that no resolver handles",
            metrics.unresolvable.clone(),
        );
        prom.register(
            "subscriptions",
            "Gauge of the number of subscriptions attached to watches",
            metrics.subscriptions.clone(),
        );
        prom.register(
            "subscriptions_lagged",
            "Count of subscriptions detached because they fell behind",
            metrics.subscriptions_lagged.clone(),
        );
        prom.register(
            "deltas",
            "Count of deltas published by watches",
            metrics.deltas.clone(),
        );

        metrics
    }

    pub(crate) fn watch_started(&self, resolver: &'static str) {
        self.watches.inc();
        self.watches_started
            .get_or_create(&ResolverLabels { resolver })
            .inc();
    }

    pub(crate) fn watch_stopped(&self) {
        self.watches.dec();
    }

    pub(crate) fn unresolvable(&self) {
        self.unresolvable.inc();
    }

    pub(crate) fn subscription_attached(&self) {
        self.subscriptions.inc();
    }

    pub(crate) fn subscription_detached(&self) {
        self.subscriptions.dec();
    }

    pub(crate) fn subscription_lagged(&self) {
        self.subscriptions_lagged.inc();
        self.subscriptions.dec();
    }

    pub(crate) fn delta_published(&self) {
        self.deltas.inc();
    }
}
