// Not all helpers are used by all tests.
#![allow(dead_code)]

use std::net::{Ipv4Addr, SocketAddrV4};
use std::sync::Once;
use std::time::Duration;

pub fn init() {
    static INIT: Once = Once::new();

    INIT.call_once(|| {
        env_logger::try_init().expect("unable to initialise logger");
    });
}

/// `127.0.0.1:0`, for OS-assigned ports.
pub fn any_local_address() -> SocketAddrV4 {
    SocketAddrV4::new(Ipv4Addr::LOCALHOST, 0)
}

/// Deadline generous enough for CI, short enough to fail fast.
pub fn long_timeout() -> Option<Duration> {
    Some(Duration::from_secs(5))
}
