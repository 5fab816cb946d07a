//! Actions: the only way to change store state.
//!
//! Domain actions implement [`Action`]. The engine wraps them in the closed
//! sum [`Dispatchable`], which is either a simple action or a
//! [`CompositeAction`] grouping ordered children.
//!
//! # Example
//!
//! ```ignore
//! use dataflow_core::{composite, Action, CompositeAction};
//!
//! #[derive(Debug, Clone)]
//! enum Download {
//!     Start { url: String },
//!     Progress(u8),
//!     Prefetch { url: String },
//!     Reset,
//! }
//!
//! impl Action for Download {
//!     fn is_serial(&self) -> bool {
//!         // Prefetching must not hold up the queue
//!         !matches!(self, Download::Prefetch { .. })
//!     }
//! }
//!
//! let flow = composite![
//!     Download::Start { url: url.clone() },
//!     Download::Progress(100),
//! ]
//! .with_fallback(Download::Reset);
//! store.dispatch(flow)?;
//! ```

use std::fmt;

use crate::context::ExecutionContext;

/// A domain action.
///
/// Blanket requirements match what the engine needs to clone actions into
/// state and error events and move them across threads.
pub trait Action: Clone + fmt::Debug + Send + Sync + 'static {
    /// Context this action's reducer must run on.
    ///
    /// `None` inherits from the enclosing composite, then the store default.
    fn execution_context(&self) -> Option<ExecutionContext> {
        None
    }

    /// Serial actions hold the queue until they complete.
    ///
    /// Non-serial actions are detached and the queue advances immediately.
    fn is_serial(&self) -> bool {
        true
    }

    /// Label shown in logs and [`Store::pipelines`](crate::Store::pipelines).
    ///
    /// Defaults to the `Debug` output cut off after [`LABEL_LIMIT`] bytes.
    /// Override it when formatting the action is expensive.
    fn label(&self) -> String {
        debug_label(self)
    }
}

/// Longest label produced by the default [`Action::label`].
pub const LABEL_LIMIT: usize = 64;

/// `Debug` output of `value`, cut off after [`LABEL_LIMIT`] bytes.
///
/// Formatting stops as soon as the limit is reached, so large payloads are
/// never formatted in full.
pub fn debug_label(value: &(impl fmt::Debug + ?Sized)) -> String {
    let mut label = BoundedLabel {
        text: String::with_capacity(LABEL_LIMIT),
    };
    if fmt::write(&mut label, format_args!("{:?}", value)).is_err() {
        label.text.push_str("...");
    }
    label.text
}

struct BoundedLabel {
    text: String,
}

impl fmt::Write for BoundedLabel {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        let room = LABEL_LIMIT - self.text.len();
        if s.len() <= room {
            self.text.push_str(s);
            return Ok(());
        }
        let mut end = room;
        while !s.is_char_boundary(end) {
            end -= 1;
        }
        self.text.push_str(&s[..end]);
        Err(fmt::Error)
    }
}

// =============================================================================
// Composite Action
// =============================================================================

/// An ordered group of child actions processed one at a time.
///
/// Children run in order against the latest state. The first failing child
/// stops the group; its error names the child, and the group's fallback (if
/// any) is dispatched as a new top-level action.
#[derive(Clone)]
pub struct CompositeAction<A> {
    children: Vec<Dispatchable<A>>,
    fallback: Option<Box<Dispatchable<A>>>,
    serial: bool,
    context: Option<ExecutionContext>,
}

impl<A: Action> CompositeAction<A> {
    /// Create a serial composite with no fallback and no context of its own.
    pub fn new<I, D>(children: I) -> Self
    where
        I: IntoIterator<Item = D>,
        D: Into<Dispatchable<A>>,
    {
        Self {
            children: children.into_iter().map(Into::into).collect(),
            fallback: None,
            serial: true,
            context: None,
        }
    }

    /// Dispatch `fallback` if a child fails.
    pub fn with_fallback(mut self, fallback: impl Into<Dispatchable<A>>) -> Self {
        self.fallback = Some(Box::new(fallback.into()));
        self
    }

    /// Set whether the composite holds its parent queue until it completes.
    pub fn with_serial(mut self, serial: bool) -> Self {
        self.serial = serial;
        self
    }

    /// Shorthand for `with_serial(false)`.
    pub fn concurrent(self) -> Self {
        self.with_serial(false)
    }

    /// Default context for children that do not name their own.
    pub fn with_context(mut self, context: ExecutionContext) -> Self {
        self.context = Some(context);
        self
    }

    pub fn children(&self) -> &[Dispatchable<A>] {
        &self.children
    }

    pub fn fallback(&self) -> Option<&Dispatchable<A>> {
        self.fallback.as_deref()
    }

    pub fn is_serial(&self) -> bool {
        self.serial
    }

    pub fn execution_context(&self) -> Option<&ExecutionContext> {
        self.context.as_ref()
    }

    pub(crate) fn into_parts(
        self,
    ) -> (
        Vec<Dispatchable<A>>,
        Option<Dispatchable<A>>,
        Option<ExecutionContext>,
    ) {
        (self.children, self.fallback.map(|f| *f), self.context)
    }
}

impl<A: fmt::Debug> fmt::Debug for CompositeAction<A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CompositeAction")
            .field("children", &self.children)
            .field("fallback", &self.fallback)
            .field("serial", &self.serial)
            .field("context", &self.context.as_ref().map(|c| c.name()))
            .finish()
    }
}

// =============================================================================
// Dispatchable
// =============================================================================

/// Anything that can be dispatched to a store.
#[derive(Clone, Debug)]
pub enum Dispatchable<A> {
    Simple(A),
    Composite(CompositeAction<A>),
}

impl<A: Action> Dispatchable<A> {
    pub fn is_serial(&self) -> bool {
        match self {
            Dispatchable::Simple(action) => action.is_serial(),
            Dispatchable::Composite(composite) => composite.is_serial(),
        }
    }

    pub fn execution_context(&self) -> Option<ExecutionContext> {
        match self {
            Dispatchable::Simple(action) => action.execution_context(),
            Dispatchable::Composite(composite) => composite.execution_context().cloned(),
        }
    }

    pub fn as_simple(&self) -> Option<&A> {
        match self {
            Dispatchable::Simple(action) => Some(action),
            Dispatchable::Composite(_) => None,
        }
    }

    /// Short label for logs and the pipeline registry.
    pub(crate) fn label(&self) -> String {
        match self {
            Dispatchable::Simple(action) => action.label(),
            Dispatchable::Composite(composite) => {
                format!("composite({} children)", composite.children().len())
            }
        }
    }
}

impl<A: Action> From<A> for Dispatchable<A> {
    fn from(action: A) -> Self {
        Dispatchable::Simple(action)
    }
}

impl<A: Action> From<CompositeAction<A>> for Dispatchable<A> {
    fn from(composite: CompositeAction<A>) -> Self {
        Dispatchable::Composite(composite)
    }
}

// =============================================================================
// SetBy
// =============================================================================

/// Author of a state value.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SetBy<A> {
    /// The initial state handed to the store.
    Initialization,
    /// A simple action (for composite children, the child itself).
    Action(A),
}

impl<A> SetBy<A> {
    pub fn action(&self) -> Option<&A> {
        match self {
            SetBy::Initialization => None,
            SetBy::Action(action) => Some(action),
        }
    }

    pub fn is_initialization(&self) -> bool {
        matches!(self, SetBy::Initialization)
    }
}
