//! Waiting for the first of several channel operations.
//!
//! A runtime-built variant of a select statement: collect [`SelectCase`]s, hand them to
//! [`select`], and the callback of whichever operation fires first gets run. Unlike the
//! `select!`-style macros this works with a number of cases only known at runtime.
//!
//! The cases operate on crossbeam channel endpoints, which is what the rest of this crate hands
//! out ([`Queue::get`][crate::Queue::get], [`Stopper::done`][crate::Stopper::done],
//! [`Sub::recv`][crate::Sub::recv], …).
//!
//! # Examples
//!
//! ```rust
//! use crossbeam_channel::unbounded;
//! use synckit::select::{recv, select};
//!
//! let (s1, r1) = unbounded();
//! let (_s2, r2) = unbounded::<String>();
//! s1.send(3).unwrap();
//!
//! let mut got = None;
//! select(vec![
//!     recv(&r1, |v| got = v.ok()),
//!     recv(&r2, |_| unreachable!("Nothing was sent here")),
//! ]);
//! assert_eq!(Some(3), got);
//! ```

use crossbeam_channel::{Receiver, RecvError, SelectedOperation, SendError, Sender};

/// One branch of a [`select`] call.
///
/// Built by [`recv`], [`send`] or [`default_case`].
pub struct SelectCase<'c> {
    inner: CaseInner<'c>,
}

enum CaseInner<'c> {
    Ready(Box<dyn Op<'c> + 'c>),
    Default(Box<dyn FnOnce() + 'c>),
}

/// A case that registers a channel operation (everything except the default case).
trait Op<'c> {
    fn register(&self, select: &mut crossbeam_channel::Select<'c>) -> usize;
    fn complete(self: Box<Self>, oper: SelectedOperation<'_>);
}

struct RecvOp<'c, T, F> {
    receiver: &'c Receiver<T>,
    callback: F,
}

impl<'c, T, F> Op<'c> for RecvOp<'c, T, F>
where
    F: FnOnce(Result<T, RecvError>),
{
    fn register(&self, select: &mut crossbeam_channel::Select<'c>) -> usize {
        select.recv(self.receiver)
    }

    fn complete(self: Box<Self>, oper: SelectedOperation<'_>) {
        let result = oper.recv(self.receiver);
        (self.callback)(result);
    }
}

struct SendOp<'c, T, F> {
    sender: &'c Sender<T>,
    value: T,
    callback: F,
}

impl<'c, T, F> Op<'c> for SendOp<'c, T, F>
where
    F: FnOnce(Result<(), SendError<T>>),
{
    fn register(&self, select: &mut crossbeam_channel::Select<'c>) -> usize {
        select.send(self.sender)
    }

    fn complete(self: Box<Self>, oper: SelectedOperation<'_>) {
        let SendOp {
            sender,
            value,
            callback,
        } = *self;
        let result = oper.send(sender, value);
        callback(result);
    }
}

/// A receive case. The callback runs with the outcome if this receive is the one selected.
pub fn recv<'c, T, F>(receiver: &'c Receiver<T>, callback: F) -> SelectCase<'c>
where
    F: FnOnce(Result<T, RecvError>) + 'c,
{
    SelectCase {
        inner: CaseInner::Ready(Box::new(RecvOp { receiver, callback })),
    }
}

/// A send case delivering `value`. The callback runs with the outcome if selected.
pub fn send<'c, T, F>(sender: &'c Sender<T>, value: T, callback: F) -> SelectCase<'c>
where
    T: 'c,
    F: FnOnce(Result<(), SendError<T>>) + 'c,
{
    SelectCase {
        inner: CaseInner::Ready(Box::new(SendOp {
            sender,
            value,
            callback,
        })),
    }
}

/// The default case: runs if no other case is ready at the time of the call.
///
/// With a default case present, [`select`] never blocks.
pub fn default_case<'c, F>(callback: F) -> SelectCase<'c>
where
    F: FnOnce() + 'c,
{
    SelectCase {
        inner: CaseInner::Default(Box::new(callback)),
    }
}

/// Performs a select over the given cases, running the callback of the one that fired.
///
/// Blocks until some case is ready, unless a default case is present. At most one default case
/// is allowed (more is a caller bug and panics). With no cases at all ‒ and no default ‒ there
/// is nothing that could ever become ready, so the call blocks forever; that mirrors what an
/// empty select statement does in languages that have one.
pub fn select(cases: Vec<SelectCase<'_>>) {
    let mut default = None;
    let mut ops = Vec::with_capacity(cases.len());
    for case in cases {
        match case.inner {
            CaseInner::Ready(op) => ops.push(Some(op)),
            CaseInner::Default(callback) => {
                assert!(default.is_none(), "Multiple default cases in one select");
                default = Some(callback);
            }
        }
    }

    if ops.is_empty() {
        match default {
            Some(callback) => callback(),
            None => loop {
                std::thread::park();
            },
        }
        return;
    }

    let mut select = crossbeam_channel::Select::new();
    for op in &ops {
        // Indices are handed out sequentially, so they match positions in `ops`.
        op.as_ref().expect("Still all present").register(&mut select);
    }

    let oper = match default {
        Some(callback) => match select.try_select() {
            Ok(oper) => oper,
            Err(_) => return callback(),
        },
        None => select.select(),
    };
    let index = oper.index();
    let op = ops[index]
        .take()
        .expect("Select returned an unregistered index");
    op.complete(oper);
}

#[cfg(test)]
mod tests {
    use crossbeam_channel::unbounded;
    use crossbeam_utils::thread;

    use super::*;

    #[test]
    fn picks_the_ready_one() {
        let (s1, r1) = unbounded();
        let (_s2, r2) = unbounded::<String>();

        thread::scope(|s| {
            s.spawn(move |_| {
                s1.send(3).unwrap();
            });

            let mut got = None;
            select(vec![
                recv(&r1, |v| got = Some(v.unwrap())),
                recv(&r2, |_| panic!("Expected to receive from the other channel")),
            ]);
            assert_eq!(Some(3), got);
        })
        .unwrap();
    }

    #[test]
    fn default_when_nothing_ready() {
        let (_s, r) = unbounded::<i32>();
        let mut fired = false;
        select(vec![
            recv(&r, |_| panic!("Nothing was sent")),
            default_case(|| fired = true),
        ]);
        assert!(fired);
    }

    #[test]
    fn send_case() {
        let (s, r) = unbounded();
        let mut sent = false;
        select(vec![send(&s, 42, |result| {
            result.unwrap();
            sent = true;
        })]);
        assert!(sent);
        assert_eq!(Ok(42), r.recv());
    }

    #[test]
    fn disconnected_counts_as_ready() {
        let (s, r) = unbounded::<i32>();
        drop(s);
        let mut outcome = None;
        select(vec![recv(&r, |v| outcome = Some(v))]);
        assert!(outcome.expect("Case should have fired").is_err());
    }

    #[test]
    #[should_panic(expected = "Multiple default cases")]
    fn refuses_two_defaults() {
        select(vec![default_case(|| ()), default_case(|| ())]);
    }

    #[test]
    fn default_alone_runs() {
        let mut fired = false;
        select(vec![default_case(|| fired = true)]);
        assert!(fired);
    }
}
