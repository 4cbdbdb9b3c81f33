//! Actor-style processes: mailboxes with selective receive and a call/cast server loop.
//!
//! The [`Mailbox`] is the heart of it ‒ an untyped buffer where a receiver picks messages by
//! *type and predicate* rather than strictly in arrival order, the way actor runtimes in the
//! Erlang tradition do it. [`spawn`] runs a closure on its own thread with a mailbox and a stop
//! signal attached and hands back a [`Proc`] to stop, await and [`monitor`][Proc::monitor] it.
//! The [`Server`] trait plus [`call`]/[`cast`] add the usual request/response convenience on
//! top.
//!
//! # Examples
//!
//! ```rust
//! use synckit::actor::{self, Message, Reply, Server};
//!
//! struct Doubler;
//!
//! impl Server for Doubler {
//!     fn handle_call(&mut self, reply: Reply, msg: Message) {
//!         let n = *msg.downcast::<i32>().expect("Only i32 calls around here");
//!         reply.send(n * 2);
//!     }
//! }
//!
//! let proc = actor::start(Doubler);
//! let answer = actor::call(proc.mailbox(), 3);
//! assert_eq!(6, *answer.downcast::<i32>().unwrap());
//! proc.stop();
//! proc.wait().unwrap();
//! ```

mod mailbox;
mod proc;
mod server;

pub use self::mailbox::{Mailbox, Message};
pub use self::proc::{spawn, Context, ExitError, Exited, Proc, ProcId, Shutdown};
pub use self::server::{call, call_from, cast, start, Reply, Server};
