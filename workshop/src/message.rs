//! The user-facing builder that produces mails.

use smallvec::SmallVec;

use crate::error::WorkError;
use crate::future::Future;
use crate::instruction::Instruction;
use crate::mail::{Contact, Mail, MailMeta, MailTrace};
use crate::value::Args;
use crate::workbench::WorkbenchContext;

/// Builds one or more mails around an [`Instruction`].
///
/// `submit` and `emit` post through the workbench context of the calling
/// thread, so they only work from code running on behalf of a worker; from
/// the outside, hand the message to a workshop instead.
#[derive(Clone, Debug)]
pub struct Message {
    instruction: Instruction,
    args: Option<Args>,
    receivers: SmallVec<[Contact; 2]>,
    notify_all: bool,
}

impl Message {
    /// Starts a message for `instruction`.
    pub fn new(instruction: Instruction) -> Self {
        Message {
            instruction,
            args: None,
            receivers: SmallVec::new(),
            notify_all: false,
        }
    }

    /// Adds a receiver. Fan-out duplicates the mail per receiver at send
    /// time; without any receiver the instruction's owning class is the
    /// target.
    pub fn to(mut self, receiver: Contact) -> Self {
        self.receivers.push(receiver);
        self
    }

    /// Requests delivery to every station whose worker class matches the
    /// instruction's owning class.
    pub fn notify_all(mut self) -> Self {
        self.notify_all = true;
        self
    }

    /// Binds the argument bundle; binding twice is an error.
    pub fn params(mut self, args: Args) -> Result<Self, WorkError> {
        if self.args.is_some() {
            return Err(WorkError::Argument(
                "message parameters were already bound".into(),
            ));
        }
        self.args = Some(args);
        Ok(self)
    }

    /// Sends from inside a worker and returns a future for the result.
    ///
    /// Requires a single effective receiver: a future has one producer.
    pub fn submit(self) -> Result<Future, WorkError> {
        let context = WorkbenchContext::current().ok_or(WorkError::NoContext)?;
        let future = Future::new();
        let mails = self.into_mails(Some(context.contact().clone()), Some(future.clone()))?;
        for mail in mails {
            context.post(mail);
        }
        Ok(future)
    }

    /// Sends from inside a worker, fire-and-forget.
    pub fn emit(self) -> Result<(), WorkError> {
        let context = WorkbenchContext::current().ok_or(WorkError::NoContext)?;
        let mails = self.into_mails(Some(context.contact().clone()), None)?;
        for mail in mails {
            context.post(mail);
        }
        Ok(())
    }

    /// Expands the builder into one mail per receiver.
    pub(crate) fn into_mails(
        self,
        source: Option<Contact>,
        future: Option<Future>,
    ) -> Result<SmallVec<[Mail; 2]>, WorkError> {
        let Message {
            instruction,
            args,
            receivers,
            notify_all,
        } = self;
        if future.is_some() && (receivers.len() > 1 || notify_all) {
            return Err(WorkError::Argument(
                "a submitted message must have a single receiver".into(),
            ));
        }
        let args = args.unwrap_or_default();
        let targets: SmallVec<[Option<Contact>; 2]> = if receivers.is_empty() {
            let fallback = instruction.class().map(|class| Contact::class(class.to_string()));
            SmallVec::from_iter([fallback])
        } else {
            receivers.into_iter().map(Some).collect()
        };

        let mut trace = SmallVec::new();
        if let Some(contact) = &source {
            trace.push(MailTrace {
                contact: contact.clone(),
                instruction: instruction.clone(),
            });
        }

        Ok(targets
            .into_iter()
            .map(|target| Mail {
                instruction: instruction.clone(),
                args: args.clone(),
                future: future.clone(),
                meta: MailMeta {
                    source: source.clone(),
                    target,
                    notify_all,
                    trace: trace.clone(),
                },
            })
            .collect())
    }
}
