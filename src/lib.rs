//! Threadlet is a cooperative green-thread network runtime.
//!
//! Application code is written as straight-line blocking code inside small
//! user-scheduled tasks ("threadlets"). Whenever a task would block on a
//! socket operation or a timeout, the runtime parks it, registers interest
//! with the OS readiness poller (`epoll` on Linux, `kqueue` on the BSDs and
//! macOS), and resumes it when the descriptor becomes ready or the deadline
//! fires.
//!
//! One [`EventLoop`] drives one OS thread. Tasks are pinned to the loop that
//! first scheduled them and never migrate. Scheduling is FIFO within a
//! loop's ready queue and otherwise unfair on purpose.
//!
//! # Examples
//!
//! A UDP echo server and a client talking to it, both as tasks on a single
//! loop:
//!
//! ```no_run
//! use std::net::{Ipv4Addr, SocketAddrV4};
//! use std::rc::Rc;
//! use threadlet::net::UdpSocket;
//! use threadlet::{Buffer, EventLoop};
//!
//! let event_loop = EventLoop::new().unwrap();
//!
//! let server = Rc::new(UdpSocket::bind(SocketAddrV4::new(Ipv4Addr::LOCALHOST, 0)).unwrap());
//! let addr = server.local_addr().unwrap();
//! let echo = Rc::clone(&server);
//!
//! event_loop.spawn(move || {
//!     let (buf, sender) = echo.recv_from(None).unwrap();
//!     let mut buf = buf;
//!     echo.send_to(&mut buf, sender, None).unwrap();
//! });
//!
//! event_loop.spawn(move || {
//!     let client = UdpSocket::bind(SocketAddrV4::new(Ipv4Addr::LOCALHOST, 0)).unwrap();
//!     let mut msg = Buffer::from_slice(b"hello");
//!     client.send_to(&mut msg, addr, None).unwrap();
//!     let (reply, _) = client.recv_from(None).unwrap();
//!     assert_eq!(reply.payload(), b"hello");
//! });
//!
//! event_loop.run().unwrap();
//! ```

#![deny(missing_debug_implementations)]

mod buffer;
mod error;
mod event_loop;
mod interest;
mod poller;
mod queue;
mod sys;
mod task;
mod timeout;
mod waiters;

pub mod net;
pub mod shared;
pub mod time;
pub mod timer;

pub use buffer::Buffer;
pub use error::{Error, Result};
pub use event_loop::{yield_now, EventLoop, StopHandle};
pub use interest::{Interest, Readiness};
pub use task::JoinHandle;
