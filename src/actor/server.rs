//! The call/cast [`Server`] layer on top of a [`Mailbox`].

use std::any::Any;
use std::sync::Arc;

use log::warn;

use super::mailbox::{Mailbox, Message};
use super::proc::{self, Proc, Shutdown};

/// A call in flight: the request plus where the answer goes.
struct Call {
    from: Arc<Mailbox>,
    msg: Message,
}

/// A cast in flight: fire and forget.
struct Cast {
    msg: Message,
}

/// The answer to a [`Call`], waited for by [`call`]/[`call_from`].
struct CallReply {
    msg: Message,
}

/// The one-shot handle for answering a call.
///
/// Consumed by sending ‒ a call gets at most one answer and the type system keeps it that way.
/// Dropping it without answering leaves the caller blocked, so don't.
pub struct Reply {
    from: Arc<Mailbox>,
}

impl Reply {
    /// Sends the answer back to the caller.
    pub fn send<M: Any + Send>(self, msg: M) {
        self.from.send(CallReply { msg: Box::new(msg) });
    }
}

/// The behaviour of a [`start`]ed server process.
///
/// All three handlers have defaults, so a server only spells out the kinds of traffic it
/// expects: unexpected calls and casts are programming errors and panic (taking the server
/// process down with an [`ExitError::Panicked`][super::ExitError::Panicked] exit), unexpected
/// plain messages are merely logged and dropped.
pub trait Server: Send + 'static {
    /// Handles a [`call`], answering through `reply`.
    ///
    /// The answer doesn't have to be sent from inside this method ‒ moving `reply` somewhere
    /// else and answering later is fine, the caller just blocks meanwhile.
    fn handle_call(&mut self, reply: Reply, msg: Message) {
        let _ = (reply, msg);
        panic!("Call handling not implemented but a call arrived");
    }

    /// Handles a [`cast`].
    fn handle_cast(&mut self, msg: Message) {
        let _ = msg;
        panic!("Cast handling not implemented but a cast arrived");
    }

    /// Handles a message that is neither a call nor a cast.
    fn handle_info(&mut self, msg: Message) {
        let _ = msg;
        warn!("Info handling not implemented, dropping a message");
    }
}

/// Runs the server's dispatch loop as a process.
///
/// The loop takes messages from the process mailbox in arrival order and routes them to the
/// matching [`Server`] handler. [`Proc::stop`] ends the loop cleanly.
pub fn start<S: Server>(mut server: S) -> Proc {
    proc::spawn(move |ctx| {
        loop {
            let msg = ctx.mailbox().recv_message();
            let msg = match msg.downcast::<Shutdown>() {
                Ok(_) => return Ok(()),
                Err(msg) => msg,
            };
            let msg = match msg.downcast::<Call>() {
                Ok(call) => {
                    let Call { from, msg } = *call;
                    server.handle_call(Reply { from }, msg);
                    continue;
                }
                Err(msg) => msg,
            };
            match msg.downcast::<Cast>() {
                Ok(cast) => server.handle_cast(cast.msg),
                Err(msg) => server.handle_info(msg),
            }
        }
    })
}

/// Sends a call into the target mailbox and blocks until the answer comes back.
///
/// The answer is whatever the server passed to [`Reply::send`], still boxed.
pub fn call<M: Any + Send>(target: &Mailbox, msg: M) -> Message {
    let reply_to = Arc::new(Mailbox::new());
    call_from(&reply_to, target, msg)
}

/// Like [`call`], but the answer is routed through the given mailbox.
///
/// Useful for callers that already own one (a process calling another from inside its body).
pub fn call_from<M: Any + Send>(reply_to: &Arc<Mailbox>, target: &Mailbox, msg: M) -> Message {
    target.send(Call {
        from: Arc::clone(reply_to),
        msg: Box::new(msg),
    });
    let reply: CallReply = reply_to.recv();
    reply.msg
}

/// Sends a cast ‒ a message handled by [`Server::handle_cast`], with no answer.
pub fn cast<M: Any + Send>(target: &Mailbox, msg: M) {
    target.send(Cast { msg: Box::new(msg) });
}

#[cfg(test)]
mod tests {
    use super::super::proc::ExitError;
    use super::*;

    struct Counter {
        count: i64,
    }

    enum Command {
        Increment(i64),
    }

    struct Get;

    impl Server for Counter {
        fn handle_call(&mut self, reply: Reply, msg: Message) {
            if msg.downcast::<Get>().is_ok() {
                reply.send(self.count);
            } else {
                panic!("Unexpected call");
            }
        }

        fn handle_cast(&mut self, msg: Message) {
            match *msg.downcast::<Command>().expect("Unexpected cast") {
                Command::Increment(by) => self.count += by,
            }
        }
    }

    #[test]
    fn call_and_cast() {
        let proc = start(Counter { count: 0 });
        cast(proc.mailbox(), Command::Increment(2));
        cast(proc.mailbox(), Command::Increment(3));
        let count = call(proc.mailbox(), Get);
        assert_eq!(5, *count.downcast::<i64>().unwrap());
        proc.stop();
        assert_eq!(Ok(()), proc.wait());
    }

    #[test]
    fn unrelated_messages_go_to_info() {
        struct Tattletale {
            seen: Arc<Mailbox>,
        }

        impl Server for Tattletale {
            fn handle_info(&mut self, msg: Message) {
                self.seen.send_boxed(msg);
            }
        }

        let seen = Arc::new(Mailbox::new());
        let proc = start(Tattletale {
            seen: Arc::clone(&seen),
        });
        proc.send("psst");
        assert_eq!("psst", seen.recv::<&str>());
        proc.stop();
        proc.wait().unwrap();
    }

    #[test]
    fn unimplemented_call_panics_the_server() {
        struct Mute;
        impl Server for Mute {}

        let proc = start(Mute);
        // The server dies before answering, so ask without blocking on the reply.
        proc.send(Call {
            from: Arc::new(Mailbox::new()),
            msg: Box::new(()),
        });
        match proc.wait() {
            Err(ExitError::Panicked(_)) => (),
            other => panic!("Expected a panicked exit, got {:?}", other),
        }
    }

    #[test]
    fn call_from_reuses_the_mailbox() {
        let proc = start(Counter { count: 7 });
        let reply_to = Arc::new(Mailbox::new());
        let count = call_from(&reply_to, proc.mailbox(), Get);
        assert_eq!(7, *count.downcast::<i64>().unwrap());
        proc.stop();
    }
}
