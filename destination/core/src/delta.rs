use crate::{Endpoint, EndpointSet};
use std::collections::BTreeSet;

/// The change between two successive snapshots of a destination.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Delta {
    pub added: BTreeSet<Endpoint>,
    pub removed: BTreeSet<Endpoint>,

    /// Set when the destination has no endpoints after this change. The value
    /// indicates whether the destination exists at all.
    pub no_endpoints: Option<bool>,
}

/// Computes the change from `prev` to `next`.
///
/// Endpoints are compared by address alone, so an endpoint whose metadata
/// changed without its address changing does not produce an event. Returns
/// `None` when there is nothing to report.
pub fn diff(prev: Option<&EndpointSet>, next: &EndpointSet) -> Option<Delta> {
    let Some(prev) = prev else {
        // A subscriber without prior state must always learn something so that
        // it doesn't wait indefinitely for a destination with no endpoints.
        if next.is_empty() {
            return Some(Delta::no_endpoints(next.exists()));
        }
        return Some(Delta {
            added: next.endpoints().clone(),
            ..Delta::default()
        });
    };

    let added = next
        .endpoints()
        .difference(prev.endpoints())
        .cloned()
        .collect::<BTreeSet<_>>();
    let removed = prev
        .endpoints()
        .difference(next.endpoints())
        .cloned()
        .collect::<BTreeSet<_>>();

    let no_endpoints = if next.is_empty() && (!prev.is_empty() || prev.exists() != next.exists())
    {
        Some(next.exists())
    } else {
        None
    };

    let delta = Delta {
        added,
        removed,
        no_endpoints,
    };
    if delta.is_empty() {
        return None;
    }
    Some(delta)
}

// === impl Delta ===

impl Delta {
    pub fn no_endpoints(exists: bool) -> Self {
        Self {
            no_endpoints: Some(exists),
            ..Self::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty() && self.no_endpoints.is_none()
    }

    /// Applies this change to a subscriber's view of a destination's endpoints.
    pub fn apply(&self, view: &mut BTreeSet<Endpoint>) {
        for ep in &self.removed {
            view.remove(ep);
        }
        for ep in &self.added {
            view.replace(ep.clone());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Destination, Scheme};
    use pretty_assertions::assert_eq;
    use proptest::prelude::*;
    use std::net::SocketAddr;

    fn dst() -> Destination {
        Destination::new(Scheme::Service, "web.ns.svc.cluster.local", 80)
    }

    fn ep(last: u8) -> Endpoint {
        Endpoint::new(([10, 0, 0, last], 80))
    }

    fn set(version: u64, eps: &[u8]) -> EndpointSet {
        EndpointSet::new(dst(), version, eps.iter().copied().map(ep))
    }

    fn addrs(eps: &BTreeSet<Endpoint>) -> Vec<SocketAddr> {
        eps.iter().map(|e| e.addr).collect()
    }

    #[test]
    fn initial_snapshot_adds_everything() {
        let delta = diff(None, &set(1, &[1, 2])).expect("must emit");
        assert_eq!(addrs(&delta.added), vec![ep(1).addr, ep(2).addr]);
        assert!(delta.removed.is_empty());
        assert_eq!(delta.no_endpoints, None);
    }

    #[test]
    fn initial_empty_snapshot_reports_no_endpoints() {
        assert_eq!(
            diff(None, &EndpointSet::missing(dst(), 1)),
            Some(Delta::no_endpoints(false))
        );
        assert_eq!(diff(None, &set(1, &[])), Some(Delta::no_endpoints(true)));
    }

    #[test]
    fn churn() {
        let a = set(1, &[1, 2]);
        let b = set(2, &[2, 3]);
        let delta = diff(Some(&a), &b).expect("must emit");
        assert_eq!(addrs(&delta.added), vec![ep(3).addr]);
        assert_eq!(addrs(&delta.removed), vec![ep(1).addr]);
        assert_eq!(delta.no_endpoints, None);
    }

    #[test]
    fn losing_all_endpoints() {
        let a = set(1, &[1, 2]);
        let b = set(2, &[]);
        let delta = diff(Some(&a), &b).expect("must emit");
        assert!(delta.added.is_empty());
        assert_eq!(addrs(&delta.removed), vec![ep(1).addr, ep(2).addr]);
        assert_eq!(delta.no_endpoints, Some(true));

        let delta = diff(Some(&a), &EndpointSet::missing(dst(), 2)).expect("must emit");
        assert_eq!(delta.removed.len(), 2);
        assert_eq!(delta.no_endpoints, Some(false));
    }

    #[test]
    fn existence_flip_while_empty() {
        let created = diff(Some(&EndpointSet::missing(dst(), 1)), &set(2, &[]));
        assert_eq!(created, Some(Delta::no_endpoints(true)));

        let deleted = diff(Some(&set(1, &[])), &EndpointSet::missing(dst(), 2));
        assert_eq!(deleted, Some(Delta::no_endpoints(false)));

        assert_eq!(diff(Some(&set(1, &[])), &set(2, &[])), None);
    }

    #[test]
    fn metadata_only_changes_are_suppressed() {
        let a = EndpointSet::new(dst(), 1, Some(ep(1).with_label("pod", "a")));
        let b = EndpointSet::new(dst(), 2, Some(ep(1).with_label("pod", "b")));
        assert_eq!(diff(Some(&a), &b), None);
    }

    fn arb_set(version: u64) -> impl Strategy<Value = EndpointSet> {
        (
            any::<bool>(),
            proptest::collection::vec((0u8..8, 79u16..82, any::<bool>()), 0..12),
        )
            .prop_map(move |(exists, eps)| {
                if !exists && eps.is_empty() {
                    return EndpointSet::missing(dst(), version);
                }
                EndpointSet::new(
                    dst(),
                    version,
                    eps.into_iter().map(|(ip, port, labeled)| {
                        let ep = Endpoint::new(([10, 0, 0, ip], port));
                        if labeled {
                            ep.with_identity("default.ns.serviceaccount")
                        } else {
                            ep
                        }
                    }),
                )
            })
    }

    proptest! {
        #[test]
        fn diff_is_minimal_and_converges(a in arb_set(1), b in arb_set(2)) {
            let expected_added = b.endpoints().difference(a.endpoints()).cloned().collect::<BTreeSet<_>>();
            let expected_removed = a.endpoints().difference(b.endpoints()).cloned().collect::<BTreeSet<_>>();

            let mut view = a.endpoints().clone();
            match diff(Some(&a), &b) {
                Some(delta) => {
                    prop_assert_eq!(&delta.added, &expected_added);
                    prop_assert_eq!(&delta.removed, &expected_removed);
                    delta.apply(&mut view);
                }
                None => {
                    prop_assert!(expected_added.is_empty() && expected_removed.is_empty());
                }
            }
            prop_assert_eq!(addrs(&view), addrs(b.endpoints()));
        }

        #[test]
        fn identical_snapshots_never_emit(a in arb_set(1)) {
            prop_assert_eq!(diff(Some(&a), &a), None);
        }

        #[test]
        fn fresh_subscribers_converge(b in arb_set(3)) {
            let delta = diff(None, &b).expect("initial diff always emits");
            let mut view = BTreeSet::new();
            delta.apply(&mut view);
            prop_assert_eq!(addrs(&view), addrs(b.endpoints()));
        }
    }
}
