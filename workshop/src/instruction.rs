//! Tagged routing capabilities for mails.
//!
//! An instruction names its owning worker class and a method on it, so
//! routing is a mapping lookup rather than reflection over method objects.

use std::borrow::Cow;

use serde::{Deserialize, Serialize};

use crate::worker::WorkerClass;

/// What a mail asks a worker to do.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Instruction {
    /// An instruction method on a worker class.
    Method {
        /// Owning worker class id.
        class: Cow<'static, str>,
        /// Method id within the class.
        method: Cow<'static, str>,
    },
    /// A reserved string sentinel; not routable today.
    Signal(Cow<'static, str>),
}

impl Instruction {
    /// An instruction on worker class `W`.
    pub fn of<W: WorkerClass>(method: impl Into<Cow<'static, str>>) -> Self {
        Instruction::Method {
            class: Cow::Borrowed(W::CLASS),
            method: method.into(),
        }
    }

    /// An instruction from raw class and method ids.
    pub fn method(
        class: impl Into<Cow<'static, str>>,
        method: impl Into<Cow<'static, str>>,
    ) -> Self {
        Instruction::Method {
            class: class.into(),
            method: method.into(),
        }
    }

    /// A reserved signal sentinel.
    pub fn signal(name: impl Into<Cow<'static, str>>) -> Self {
        Instruction::Signal(name.into())
    }

    /// The owning class id, when this is a method instruction.
    pub fn class(&self) -> Option<&str> {
        match self {
            Instruction::Method { class, .. } => Some(class),
            Instruction::Signal(_) => None,
        }
    }

    /// The method id, when this is a method instruction.
    pub fn name(&self) -> Option<&str> {
        match self {
            Instruction::Method { method, .. } => Some(method),
            Instruction::Signal(_) => None,
        }
    }
}

impl std::fmt::Display for Instruction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Instruction::Method { class, method } => write!(f, "{class}.{method}"),
            Instruction::Signal(name) => write!(f, "signal:{name}"),
        }
    }
}
