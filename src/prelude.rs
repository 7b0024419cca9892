pub use crate::controller::{AffinityController, ManagedProcessState, TickOutcome};
pub use crate::os::{Pid, Platform, ProcessHandle, ProcessInfo, ThreadInfo, ThreadState, Tid, WindowQuery};
pub use crate::sampler::{single_cluster_threshold, CpuUsage, Sample};
pub use crate::schedule::{ControlLoop, ShutdownSwitch};
pub use crate::topology::{ClusterMask, PreferredCluster, TopologyProfile};
pub use crate::util::cpu::AffinityMask;
pub use crate::{AutoCcx, AutoCcxBuilder};
