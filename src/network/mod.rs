//! Socket fabric: the raw monitor link, the UDP transport and the
//! multiplexed wait over both.

mod poll;
mod socket;

pub use poll::{Poller, Readiness, SysPoller};
pub use socket::{FrameLink, RawSocket, SocketFactory, SystemSockets, open_udp};
