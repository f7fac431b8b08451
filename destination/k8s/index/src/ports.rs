use anyhow::{bail, Context, Result};
use std::{collections::BTreeMap, num::NonZeroU16};

/// A `HashSet` specialized for ports.
///
/// Because ports are `u16` values, this type avoids the overhead of actually
/// hashing ports.
pub type PortSet = std::collections::HashSet<NonZeroU16, std::hash::BuildHasherDefault<PortHasher>>;

/// A hasher for ports.
///
/// Ports are hashed as their own integer values.
#[derive(Debug, Default)]
pub struct PortHasher(u16);

// === impl PortHasher ===

impl std::hash::Hasher for PortHasher {
    fn write(&mut self, _: &[u8]) {
        unreachable!("hashing a `u16` calls `write_u16`");
    }

    #[inline]
    fn write_u16(&mut self, port: u16) {
        self.0 = port;
    }

    #[inline]
    fn finish(&self) -> u64 {
        self.0 as u64
    }
}

/// Tests whether `port` is in `ports`.
pub(crate) fn contains(ports: &PortSet, port: u16) -> bool {
    NonZeroU16::new(port).is_some_and(|p| ports.contains(&p))
}

/// Reads `annotation` as a port set. An invalid annotation is logged and
/// treated as the empty set.
pub(crate) fn ports_annotation(
    annotations: &BTreeMap<String, String>,
    annotation: &str,
) -> Option<PortSet> {
    let spec = annotations.get(annotation)?;
    Some(parse_portset(spec).unwrap_or_else(|error| {
        tracing::info!(%spec, %error, %annotation, "Invalid ports list");
        PortSet::default()
    }))
}

/// Reads a comma-separated list of ports or port ranges, e.g. `25,443,8000-8099`.
pub fn parse_portset(s: &str) -> Result<PortSet> {
    let mut ports = PortSet::default();

    for spec in s.split(',').map(str::trim).filter(|s| !s.is_empty()) {
        match spec.split_once('-') {
            None => {
                ports.insert(spec.parse().context("parsing port")?);
            }
            Some((floor, ceil)) => {
                let floor = floor.trim().parse::<NonZeroU16>().context("parsing port")?;
                let ceil = ceil.trim().parse::<NonZeroU16>().context("parsing port")?;
                if floor > ceil {
                    bail!("Port range must be increasing");
                }
                ports.extend((floor.get()..=ceil.get()).filter_map(NonZeroU16::new));
            }
        }
    }

    Ok(ports)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ports(ports: &[u16]) -> PortSet {
        ports.iter().copied().filter_map(NonZeroU16::new).collect()
    }

    #[test]
    fn parses_portsets() {
        assert!(parse_portset("").unwrap().is_empty());
        assert!(parse_portset("0").is_err());
        assert_eq!(parse_portset("25").unwrap(), ports(&[25]));
        assert_eq!(parse_portset("3306, 1-3").unwrap(), ports(&[1, 2, 3, 3306]));
        assert!(parse_portset("2-1").is_err());
        assert!(parse_portset("2-").is_err());
        assert!(parse_portset("65536").is_err());
        assert_eq!(
            parse_portset("25,587,3306,4444,5432,6379,9300,11211")
                .unwrap()
                .len(),
            8
        );
    }

    #[test]
    fn invalid_annotations_are_empty() {
        let annotations = maplit::btreemap! {
            "config.linkerd.io/opaque-ports".to_string() => "http".to_string(),
        };
        assert_eq!(
            ports_annotation(&annotations, "config.linkerd.io/opaque-ports"),
            Some(PortSet::default())
        );
        assert_eq!(ports_annotation(&annotations, "other"), None);
    }
}
