//! Mailbox / rendezvous matching, grounded on SimGrid's
//! `simix::MailboxImpl` match loop: two FIFO queues (pending sends,
//! pending receives), matched pairwise by predicate, with a permanent
//! receiver as an eager-mode fast path.

use std::cell::Cell;
use std::collections::VecDeque;
use std::rc::Rc;

use crate::activity::ActivityId;
use crate::actor::ActorId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MailboxId(pub u64);

/// A pending send or receive request waiting for its counterpart.
pub struct Request {
    pub actor: ActorId,
    pub payload_size: usize,
    /// `self.matches(other)`: does this request accept `other` as a
    /// counterpart? Evaluated in both directions.
    pub matcher: Box<dyn Fn(&Request) -> bool>,
    /// The activity this request's own caller is already blocked on (or is
    /// about to block on). Whichever side matches second reuses this id as
    /// the one shared comm activity instead of creating a second one.
    pub activity: ActivityId,
    /// Lets a `recv` that enqueued before any sender existed learn the
    /// eventual payload size: the matching `send` writes it here, since by
    /// the time `recv`'s caller wakes up the activity itself is long gone
    /// from the table.
    pub result_size: Rc<Cell<usize>>,
}

impl std::fmt::Debug for Request {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Request")
            .field("actor", &self.actor)
            .field("payload_size", &self.payload_size)
            .field("activity", &self.activity)
            .finish()
    }
}

/// A ready payload delivered by the permanent-receiver fast path, queued
/// until the receiver actually calls `recv`.
#[derive(Debug)]
pub struct ReadyPayload {
    pub sender: ActorId,
    pub payload_size: usize,
}

#[derive(Debug, Default)]
pub struct Mailbox {
    sends: VecDeque<Request>,
    recvs: VecDeque<Request>,
    pub permanent_receiver: Option<ActorId>,
    ready: VecDeque<ReadyPayload>,
}

/// Outcome of offering a request to a mailbox.
#[derive(Debug)]
pub enum MatchResult {
    /// No match found, `self` was enqueued.
    Enqueued,
    /// Matched immediately against the other side's queue head satisfying
    /// the predicate; both requests are returned so the caller can create
    /// and start the Comm activity that binds them.
    Matched(Request, Request),
    /// Matched the permanent-receiver fast path: the payload was queued as
    /// "ready" and there is nothing further for the caller to start now.
    DeliveredToReadyBuffer,
}

impl Mailbox {
    pub fn new() -> Mailbox {
        Mailbox::default()
    }

    /// A recv issued by `self.permanent_receiver` drains the ready buffer
    /// before falling back to normal matching.
    pub fn take_ready(&mut self) -> Option<ReadyPayload> {
        self.ready.pop_front()
    }

    /// Offers a send request. If the mailbox has a permanent receiver and
    /// no matching recv is queued, delivers straight to the ready buffer
    /// instead of falling through to normal FIFO matching.
    pub fn offer_send(&mut self, req: Request) -> MatchResult {
        if let Some(m) = find_match(&req, &mut self.recvs) {
            return MatchResult::Matched(req, m);
        }
        if self.permanent_receiver.is_some() {
            self.ready.push_back(ReadyPayload {
                sender: req.actor,
                payload_size: req.payload_size,
            });
            return MatchResult::DeliveredToReadyBuffer;
        }
        self.sends.push_back(req);
        MatchResult::Enqueued
    }

    /// Offers a recv request against the pending sends queue.
    pub fn offer_recv(&mut self, req: Request) -> MatchResult {
        if let Some(m) = find_match(&req, &mut self.sends) {
            return MatchResult::Matched(req, m);
        }
        self.recvs.push_back(req);
        MatchResult::Enqueued
    }

    /// `iprobe(match)`: first send matching `predicate` without removing
    /// it, for the caller to inspect before committing to a real recv.
    pub fn iprobe(&self, predicate: impl Fn(&Request) -> bool) -> Option<ActorId> {
        self.sends.iter().find(|r| predicate(r)).map(|r| r.actor)
    }

    pub fn pending_sends(&self) -> usize {
        self.sends.len()
    }

    pub fn pending_recvs(&self) -> usize {
        self.recvs.len()
    }
}

/// Walks `others` FIFO, removing and returning the first candidate for
/// which both `req.matcher` and `candidate.matcher` accept each other.
fn find_match(req: &Request, others: &mut VecDeque<Request>) -> Option<Request> {
    let pos = others.iter().position(|c| (req.matcher)(c) && (c.matcher)(req))?;
    others.remove(pos)
}

#[derive(Debug, Default)]
pub struct MailboxTable {
    mailboxes: std::collections::HashMap<MailboxId, Mailbox>,
    by_name: std::collections::HashMap<String, MailboxId>,
    next_id: u64,
}

impl MailboxTable {
    pub fn new() -> MailboxTable {
        MailboxTable::default()
    }

    pub fn get_or_create(&mut self, name: &str) -> MailboxId {
        if let Some(&id) = self.by_name.get(name) {
            return id;
        }
        let id = MailboxId(self.next_id);
        self.next_id += 1;
        self.by_name.insert(name.to_string(), id);
        self.mailboxes.insert(id, Mailbox::new());
        id
    }

    pub fn get_mut(&mut self, id: MailboxId) -> Option<&mut Mailbox> {
        self.mailboxes.get_mut(&id)
    }

    /// Reverse lookup used by deadlock diagnostics, which only ever has a
    /// [`MailboxId`] in hand (from an activity's `Kind::Comm`) and wants the
    /// name a human gave it.
    pub fn name_of(&self, id: MailboxId) -> Option<&str> {
        self.by_name.iter().find(|&(_, &v)| v == id).map(|(k, _)| k.as_str())
    }
}

fn accept_all(_: &Request) -> bool {
    true
}

/// Convenience matcher used by callers who don't need predicate matching.
pub fn any_matcher() -> Box<dyn Fn(&Request) -> bool> {
    Box::new(accept_all)
}

#[cfg(test)]
mod test {
    use super::*;

    fn req(actor: u64, size: usize) -> Request {
        Request {
            actor: ActorId(actor),
            payload_size: size,
            matcher: any_matcher(),
            activity: ActivityId(actor),
            result_size: Rc::new(Cell::new(0)),
        }
    }

    #[test]
    fn send_then_recv_matches() {
        let mut mb = Mailbox::new();
        assert!(matches!(mb.offer_send(req(1, 10)), MatchResult::Enqueued));
        match mb.offer_recv(req(2, 10)) {
            MatchResult::Matched(recv, send) => {
                assert_eq!(recv.actor, ActorId(2));
                assert_eq!(send.actor, ActorId(1));
            }
            _ => panic!("expected a match"),
        }
    }

    #[test]
    fn recv_then_send_matches() {
        let mut mb = Mailbox::new();
        assert!(matches!(mb.offer_recv(req(1, 10)), MatchResult::Enqueued));
        assert!(matches!(mb.offer_send(req(2, 10)), MatchResult::Matched(_, _)));
    }

    #[test]
    fn at_most_one_queue_nonempty() {
        let mut mb = Mailbox::new();
        mb.offer_send(req(1, 10));
        mb.offer_send(req(2, 10));
        assert_eq!(mb.pending_sends(), 2);
        assert_eq!(mb.pending_recvs(), 0);
        mb.offer_recv(req(3, 10));
        assert_eq!(mb.pending_sends(), 1);
        assert_eq!(mb.pending_recvs(), 0);
    }

    #[test]
    fn permanent_receiver_delivers_eagerly() {
        let mut mb = Mailbox::new();
        mb.permanent_receiver = Some(ActorId(9));
        match mb.offer_send(req(1, 42)) {
            MatchResult::DeliveredToReadyBuffer => {}
            _ => panic!("expected eager delivery"),
        }
        let ready = mb.take_ready().unwrap();
        assert_eq!(ready.sender, ActorId(1));
        assert_eq!(ready.payload_size, 42);
    }

    #[test]
    fn iprobe_does_not_remove() {
        let mut mb = Mailbox::new();
        mb.offer_send(req(1, 10));
        assert_eq!(mb.iprobe(accept_all), Some(ActorId(1)));
        assert_eq!(mb.pending_sends(), 1);
    }

    #[test]
    fn non_matching_predicate_enqueues_both() {
        let mut mb = Mailbox::new();
        let picky_send = Request {
            actor: ActorId(1),
            payload_size: 10,
            matcher: Box::new(|c| c.actor == ActorId(99)),
            activity: ActivityId(1),
            result_size: Rc::new(Cell::new(0)),
        };
        mb.offer_send(picky_send);
        assert!(matches!(mb.offer_recv(req(2, 10)), MatchResult::Enqueued));
        assert_eq!(mb.pending_sends(), 1);
        assert_eq!(mb.pending_recvs(), 1);
    }
}
