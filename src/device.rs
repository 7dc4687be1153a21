use std::{fmt, thread};

/// A logical compute lane. One replica of the generator runs per device.
///
/// Lanes map onto host worker threads; a lane is available when its index is
/// below the detected hardware parallelism.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Device {
    /// The host processor, always available.
    Cpu,
    /// A dedicated compute lane.
    Lane(usize),
}

impl Device {
    /// Whether this device can host a replica on this machine.
    pub fn is_available(self) -> bool {
        match self {
            Device::Cpu => true,
            Device::Lane(idx) => idx < available_lanes(),
        }
    }
}

impl fmt::Display for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Device::Cpu => f.write_str("cpu"),
            Device::Lane(idx) => write!(f, "lane:{idx}"),
        }
    }
}

/// Number of compute lanes backed by the host.
pub fn available_lanes() -> usize {
    thread::available_parallelism().map_or(1, |n| n.get())
}

/// The first `n` lanes of the host, in order.
pub fn detect(n: usize) -> Vec<Device> {
    (0..n.min(available_lanes())).map(Device::Lane).collect()
}
