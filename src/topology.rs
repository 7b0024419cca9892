use crate::util::cpu::AffinityMask;
use anyhow::{anyhow, Context};
use std::convert::Infallible;
use std::str::FromStr;

/// Mask of the logical cores sharing one core complex.
pub type ClusterMask = AffinityMask;

const FAMILY_MARKER: &str = "Family";

/// Hardware threads per physical core on every known configuration.
pub const THREADS_PER_CORE: usize = 2;

struct KnownTopology {
    family: u32,
    logical_cores: usize,
    clusters: usize,
    cores_per_cluster: usize,
}

const KNOWN_TOPOLOGIES: &[KnownTopology] = &[
    // Zen 3: 6 / 8 cores per CCX
    KnownTopology {
        family: 25,
        logical_cores: 24,
        clusters: 2,
        cores_per_cluster: 6,
    },
    KnownTopology {
        family: 25,
        logical_cores: 32,
        clusters: 2,
        cores_per_cluster: 8,
    },
    // Zen, Zen+, Zen 2: 3 / 4 cores per CCX
    KnownTopology {
        family: 23,
        logical_cores: 12,
        clusters: 2,
        cores_per_cluster: 3,
    },
    KnownTopology {
        family: 23,
        logical_cores: 16,
        clusters: 2,
        cores_per_cluster: 4,
    },
    KnownTopology {
        family: 23,
        logical_cores: 24,
        clusters: 4,
        cores_per_cluster: 3,
    },
    KnownTopology {
        family: 23,
        logical_cores: 32,
        clusters: 4,
        cores_per_cluster: 4,
    },
];

/// Core complexes of the local processor.
///
/// Masks partition the logical core range into equally sized, contiguous
/// groups. An unrecognized processor has no clusters at all, in which case no
/// restriction may ever be applied.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct TopologyProfile {
    masks: Vec<ClusterMask>,
    cores_per_cluster: usize,
    logical_cores: usize,
}

impl TopologyProfile {
    pub fn empty(logical_cores: usize) -> Self {
        Self {
            masks: Vec::default(),
            cores_per_cluster: 0,
            logical_cores,
        }
    }

    /// Derives the profile from a processor identification string such as
    /// `AMD64 Family 25 Model 33 Stepping 0, AuthenticAMD`.
    ///
    /// Fails if the string carries no parsable family, there is no safe
    /// topology to fall back to in that case.
    pub fn resolve(identifier: &str, logical_cores: usize) -> anyhow::Result<Self> {
        let family = parse_family(identifier)
            .with_context(|| format!("unsupported processor identifier {:?}", identifier))?;
        Ok(Self::for_family(family, logical_cores))
    }

    pub fn for_family(family: u32, logical_cores: usize) -> Self {
        let known = KNOWN_TOPOLOGIES
            .iter()
            .find(|t| t.family == family && t.logical_cores == logical_cores);

        let known = match known {
            Some(known) => known,
            None => {
                log::debug!(
                    "no cluster layout known for family {} with {} logical cores",
                    family,
                    logical_cores
                );
                return Self::empty(logical_cores);
            }
        };

        let width = known.logical_cores / known.clusters;
        let masks = (0..known.clusters)
            .map(|i| ClusterMask::contiguous(i * width, width))
            .collect();

        Self {
            masks,
            cores_per_cluster: known.cores_per_cluster,
            logical_cores,
        }
    }

    #[inline]
    pub fn cluster_count(&self) -> usize {
        self.masks.len()
    }

    #[inline]
    pub fn cores_per_cluster(&self) -> usize {
        self.cores_per_cluster
    }

    #[inline]
    pub fn logical_cores(&self) -> usize {
        self.logical_cores
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.masks.is_empty()
    }

    #[inline]
    pub fn masks(&self) -> &[ClusterMask] {
        &self.masks
    }

    #[inline]
    pub fn mask(&self, cluster: usize) -> Option<ClusterMask> {
        self.masks.get(cluster).copied()
    }

    /// Every logical core, the mask of an unrestricted process.
    #[inline]
    pub fn full_mask(&self) -> AffinityMask {
        AffinityMask::full(self.logical_cores)
    }
}

/// Reads the family number following the `Family` marker. At most two digits
/// are considered, single digit families (`Family 6 Model ...`) are accepted.
pub fn parse_family(identifier: &str) -> anyhow::Result<u32> {
    let start = identifier
        .find(FAMILY_MARKER)
        .ok_or_else(|| anyhow!("missing {:?} field", FAMILY_MARKER))?;

    let field = identifier[start + FAMILY_MARKER.len()..]
        .trim_start()
        .chars()
        .take(2)
        .collect::<String>();

    field
        .trim_end()
        .parse::<u32>()
        .with_context(|| format!("family {:?} is not a number", field))
}

/// 1-based index of the cluster lightly loaded processes are confined to.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct PreferredCluster(usize);

impl PreferredCluster {
    /// Clusters beyond the detected count are clamped later on, see [`resolve`].
    ///
    /// [`resolve`]: PreferredCluster::resolve
    pub fn new(cluster: usize) -> Self {
        Self(cluster.max(1))
    }

    #[inline]
    pub fn get(self) -> usize {
        self.0
    }

    /// The 0-based index into `profile`, clamped to its last cluster.
    /// `None` for a profile without clusters.
    pub fn resolve(self, profile: &TopologyProfile) -> Option<usize> {
        match profile.cluster_count() {
            0 => None,
            count => Some(self.0.min(count) - 1),
        }
    }
}

impl Default for PreferredCluster {
    #[inline]
    fn default() -> Self {
        Self(1)
    }
}

/// Command line form: only `1` to `4` are recognized, anything else selects
/// the first cluster. So `"5"` parses to the first cluster, while
/// [`PreferredCluster::new`]`(5)` clamps to the last detected one.
impl FromStr for PreferredCluster {
    type Err = Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let cluster = match s {
            "1" => 1,
            "2" => 2,
            "3" => 3,
            "4" => 4,
            _ => 1,
        };
        Ok(Self(cluster))
    }
}
