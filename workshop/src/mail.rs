//! Mail envelopes and their routing metadata.

use std::borrow::Cow;
use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};
use smallvec::SmallVec;

use crate::error::WorkError;
use crate::future::Future;
use crate::instruction::Instruction;
use crate::value::{Args, Value};

/// Names a worker endpoint: its class, a set of tags, and optionally the
/// unique id of one actor instance.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Contact {
    /// Worker class id.
    pub class: Cow<'static, str>,
    /// Free-form routing tags.
    pub tags: BTreeSet<String>,
    /// A specific actor instance, when addressing one.
    pub actor_id: Option<u64>,
}

impl Contact {
    /// A contact naming a class, with no tags and no instance.
    pub fn class(class: impl Into<Cow<'static, str>>) -> Self {
        Contact {
            class: class.into(),
            tags: BTreeSet::new(),
            actor_id: None,
        }
    }

    /// Adds a routing tag, builder-style.
    pub fn tagged(mut self, tag: impl Into<String>) -> Self {
        self.tags.insert(tag.into());
        self
    }
}

/// One hop in a mail's delivery history.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct MailTrace {
    /// Who handled the mail.
    pub contact: Contact,
    /// The instruction handled at that hop.
    pub instruction: Instruction,
}

/// Routing metadata attached to every mail.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct MailMeta {
    /// The sending endpoint, when sent from inside a worker.
    pub source: Option<Contact>,
    /// The receiving endpoint.
    pub target: Option<Contact>,
    /// Whether the mail should reach every station of the matching class.
    pub notify_all: bool,
    /// Hops accumulated so far.
    pub trace: SmallVec<[MailTrace; 2]>,
}

/// An envelope: instruction, arguments, optional result future, metadata.
#[derive(Clone, Debug)]
pub struct Mail {
    /// What to do.
    pub instruction: Instruction,
    /// Arguments for the instruction.
    pub args: Args,
    /// Where the result goes, for submitted mails.
    pub future: Option<Future>,
    /// Routing metadata.
    pub meta: MailMeta,
}

impl Mail {
    /// A bare mail with empty metadata.
    pub fn new(instruction: Instruction, args: Args) -> Self {
        Mail {
            instruction,
            args,
            future: None,
            meta: MailMeta::default(),
        }
    }

    /// Attaches a result future, builder-style.
    pub fn with_future(mut self, future: Future) -> Self {
        self.future = Some(future);
        self
    }
}

/// Completes a mail future with `outcome`; failures without a future are
/// logged so they do not vanish silently.
pub(crate) fn complete(future: Option<&Future>, outcome: Result<Value, WorkError>) {
    match (future, outcome) {
        (Some(future), Ok(value)) => {
            let _ = future.set_result(value);
        }
        (Some(future), Err(error)) => {
            let _ = future.set_failure(error);
        }
        (None, Ok(_)) => {}
        (None, Err(error)) => {
            tracing::debug!(%error, "emitted mail failed");
        }
    }
}
