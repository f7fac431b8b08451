use kube::Resource;
use kubert::index::{IndexNamespacedResource, NamespacedRemoved};
use parking_lot::RwLock;
use prometheus_client::{
    encoding::EncodeLabelSet,
    metrics::{counter::Counter, family::Family, gauge::Gauge},
    registry::Registry,
};
use std::sync::Arc;

/// Wraps an index to record the events it processes.
#[derive(Debug)]
pub struct IndexMetrics<T> {
    inner: T,
    family: IndexMetricsFamily,
}

/// The metrics shared by every resource kind's [`IndexMetrics`].
#[derive(Clone, Debug, Default)]
pub struct IndexMetricsFamily {
    size: Family<KindLabels, Gauge>,
    applies: Family<KindLabels, Counter>,
    deletes: Family<KindLabels, Counter>,
    resets: Family<KindLabels, Counter>,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
struct KindLabels {
    kind: String,
}

/// Reports the number of resources of kind `R` in an index.
pub trait SizedIndex<R> {
    fn size(&self) -> usize;
}

// === impl IndexMetricsFamily ===

impl IndexMetricsFamily {
    pub fn register(prom: &mut Registry) -> Self {
        let metrics = Self::default();
        prom.register(
            "size",
            "Gauge of the number of resources in the index",
            metrics.size.clone(),
        );
        prom.register(
            "applies",
            "Count of resources applied to the index",
            metrics.applies.clone(),
        );
        prom.register(
            "deletes",
            "Count of resources deleted from the index",
            metrics.deletes.clone(),
        );
        prom.register(
            "resets",
            "Count of index resets following watch restarts",
            metrics.resets.clone(),
        );
        metrics
    }

    /// Wraps a shared index for a single resource kind.
    pub fn wrap<T>(&self, inner: Arc<RwLock<T>>) -> Arc<RwLock<IndexMetrics<Arc<RwLock<T>>>>> {
        Arc::new(RwLock::new(IndexMetrics {
            inner,
            family: self.clone(),
        }))
    }
}

// === impl IndexMetrics ===

impl<T> IndexMetrics<Arc<RwLock<T>>> {
    fn labels<R: Resource<DynamicType = ()>>() -> KindLabels {
        KindLabels {
            kind: R::kind(&()).to_string(),
        }
    }

    fn observe_size<R: Resource<DynamicType = ()>>(&self)
    where
        T: SizedIndex<R>,
    {
        let size = self.inner.read().size();
        self.family
            .size
            .get_or_create(&Self::labels::<R>())
            .set(size as i64);
    }
}

impl<T, R> IndexNamespacedResource<R> for IndexMetrics<Arc<RwLock<T>>>
where
    T: IndexNamespacedResource<R> + SizedIndex<R>,
    R: Resource<DynamicType = ()>,
{
    fn apply(&mut self, resource: R) {
        self.family
            .applies
            .get_or_create(&Self::labels::<R>())
            .inc();
        self.inner.write().apply(resource);
        self.observe_size::<R>();
    }

    fn delete(&mut self, namespace: String, name: String) {
        self.family
            .deletes
            .get_or_create(&Self::labels::<R>())
            .inc();
        self.inner.write().delete(namespace, name);
        self.observe_size::<R>();
    }

    fn reset(&mut self, resources: Vec<R>, removed: NamespacedRemoved) {
        self.family.resets.get_or_create(&Self::labels::<R>()).inc();
        self.inner.write().reset(resources, removed);
        self.observe_size::<R>();
    }
}
