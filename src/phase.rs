use serde::{Deserialize, Serialize};

/// Lifecycle state of a worker, reported to the master after every
/// transition. Variant order is the protocol order: the derived `Ord`
/// is the rank the barrier compares against.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Phase {
    Idle,
    MasterInfoReceived,
    MyInfoReceived,
    SlavesInfoReceived,
    Interconnected,
    ShuffleOn,
    Mapping,
    MappingDone,
    WaitingReduce,
    Reducing,
    ReduceDone,
    SendingResults,
    SendingResultsDone,
    Terminated,
}

impl Phase {
    /// Position of the phase in the lifecycle order.
    pub fn rank(self) -> u8 {
        self as u8
    }
}
