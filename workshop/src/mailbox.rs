//! FIFO, blocking hand-off points between stations and their owners.

use std::time::Duration;

use crossbeam_channel::{unbounded, Receiver, Sender};

use crate::error::WorkError;
use crate::mail::Mail;

/// One item in a mailbox.
#[derive(Clone, Debug)]
pub enum Packet {
    /// An ordinary envelope.
    Mail(Mail),
    /// A fatal worker failure escaping a station.
    Failure(WorkError),
    /// The poison pill: drain and shut down.
    Terminate,
}

/// A FIFO queue of [`Packet`]s.
///
/// Both endpoints are held by every clone, so a mailbox stays connected for
/// as long as any handle is alive. Mailboxes are the only hand-off points
/// between threads; within one mailbox delivery order is the enqueue order.
#[derive(Clone)]
pub struct Mailbox {
    tx: Sender<Packet>,
    rx: Receiver<Packet>,
}

impl Default for Mailbox {
    fn default() -> Self {
        Mailbox::new()
    }
}

impl Mailbox {
    /// A fresh, empty mailbox.
    pub fn new() -> Self {
        let (tx, rx) = unbounded();
        Mailbox { tx, rx }
    }

    /// Enqueues a packet.
    pub fn put(&self, packet: Packet) {
        self.tx.send(packet).expect("mailbox holds its own receiver");
    }

    /// Enqueues a mail envelope.
    pub fn put_mail(&self, mail: Mail) {
        self.put(Packet::Mail(mail));
    }

    /// Dequeues the next packet, waiting at most `timeout`.
    pub fn get(&self, timeout: Duration) -> Option<Packet> {
        self.rx.recv_timeout(timeout).ok()
    }

    /// Dequeues the next packet without blocking.
    pub fn try_get(&self) -> Option<Packet> {
        self.rx.try_recv().ok()
    }

    /// True when no packet is queued.
    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }

    /// Number of queued packets.
    pub fn len(&self) -> usize {
        self.rx.len()
    }
}

impl std::fmt::Debug for Mailbox {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Mailbox").field("queued", &self.len()).finish()
    }
}
