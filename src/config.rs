//! Tunable constants for the stack. Collected here instead of scattered
//! literals so a deployment can retune timeouts without touching state
//! machine code.

use std::time::Duration;

/// Number of connection control block slots. The index into this table is
/// the socket handle handed back to applications.
pub const CB_TABLE_SIZE: usize = 128;

pub const EPHEMERAL_PORT_MIN: u16 = 49152;
pub const EPHEMERAL_PORT_MAX: u16 = 65535;

/// Bounds any wait in a synchronized state where data is unacknowledged.
pub const USER_TIMEOUT: Duration = Duration::from_secs(10);

/// Maximum segment lifetime. TIME_WAIT holds the CB for 2*MSL.
pub const MSL: Duration = Duration::from_secs(10);
pub const TIME_WAIT_TIMEOUT: Duration = Duration::from_secs(2 * MSL.as_secs());

/// How often the timer thread scans the CB table.
pub const TIMER_TICK: Duration = Duration::from_millis(100);

/// How often the fragment reassembly table is swept for idle entries.
pub const REASSEMBLY_SWEEP_INTERVAL: Duration = Duration::from_secs(10);
pub const REASSEMBLY_IDLE_TIMEOUT: Duration = Duration::from_secs(30);
pub const MAX_REASSEMBLIES: usize = 8;

/// Maximum segment size: MTU (1500) minus IPv4 header (20) minus a reserve
/// for the fixed 20-byte TCP header matching the distilled design's number.
pub const MSS: usize = 1440;

/// Size of each connection's receive window buffer.
pub const RECV_WINDOW_SIZE: usize = 65535;

pub const MTU: usize = 1500;
pub const IPV4_HEADER_LEN: usize = 20;
pub const TCP_HEADER_LEN: usize = 20;

pub const IP_PROTOCOL_TCP: u8 = 6;

pub const IPV4_FLAG_DF: u16 = 0x4000;
pub const IPV4_FLAG_MF: u16 = 0x2000;
pub const IPV4_FRAG_OFFSET_MASK: u16 = 0x1fff;
