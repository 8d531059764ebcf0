//! Explicit scopes carrying tags that are attached to everything captured within them.
//!
//! A [`Scope`] is a plain value passed to the capture calls that should use it. [`ScopeStack`]
//! gives nested code its own scope that is discarded when the returned guard goes out of scope.
use std::ops::{Deref, DerefMut};

use crate::events::Event;
use crate::flags::Properties;
use crate::Client;

/// Distinct id and tags applied to events captured "inside" the scope.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Scope {
    distinct_id: Option<String>,
    tags: Properties,
}

impl Scope {
    /// An empty scope.
    pub fn new() -> Scope {
        Scope::default()
    }

    /// Attribute events and exceptions without a distinct id to `distinct_id`.
    pub fn with_distinct_id(mut self, distinct_id: impl Into<String>) -> Scope {
        self.distinct_id = Some(distinct_id.into());
        self
    }

    /// Add a tag, sent as a property of every event captured in this scope.
    pub fn with_tag(mut self, key: impl Into<String>, value: impl Into<serde_json::Value>) -> Scope {
        self.tag(key, value);
        self
    }

    /// Add a tag to this scope.
    pub fn tag(&mut self, key: impl Into<String>, value: impl Into<serde_json::Value>) {
        self.tags.insert(key.into(), value.into());
    }

    /// Tags of this scope.
    pub fn tags(&self) -> &Properties {
        &self.tags
    }

    /// Distinct id events in this scope are attributed to, if any.
    pub fn distinct_id(&self) -> Option<&str> {
        self.distinct_id.as_deref()
    }

    /// Remove all tags.
    pub fn clear_tags(&mut self) {
        self.tags.clear();
    }

    /// Fill in what `event` doesn't set itself. Explicit event properties win over tags.
    pub(crate) fn apply(&self, mut event: Event) -> Event {
        if event.distinct_id().is_empty() {
            if let Some(distinct_id) = &self.distinct_id {
                event = event.with_distinct_id(distinct_id.as_str());
            }
        }
        for (key, value) in &self.tags {
            event = event.with_default_property(key, value);
        }
        event
    }
}

/// A stack of scopes. The top one is current.
#[derive(Debug, Clone)]
pub struct ScopeStack {
    frames: Vec<Scope>,
}

impl ScopeStack {
    /// A stack holding a single empty scope.
    pub fn new() -> ScopeStack {
        ScopeStack::with_root(Scope::new())
    }

    /// A stack whose bottom scope is `root`.
    pub fn with_root(root: Scope) -> ScopeStack {
        ScopeStack { frames: vec![root] }
    }

    /// The innermost scope.
    pub fn current(&self) -> &Scope {
        // The root frame is never popped.
        &self.frames[self.frames.len() - 1]
    }

    /// Mutable access to the innermost scope.
    pub fn current_mut(&mut self) -> &mut Scope {
        let top = self.frames.len() - 1;
        &mut self.frames[top]
    }

    /// Enter a nested scope, inheriting the current one unless `fresh` is set.
    ///
    /// The nested scope is popped when the returned guard is dropped, including on early return
    /// and unwinding.
    pub fn push(&mut self, fresh: bool) -> ScopeGuard<'_> {
        let scope = if fresh {
            Scope::new()
        } else {
            self.current().clone()
        };
        self.frames.push(scope);
        ScopeGuard { stack: self }
    }

    /// Number of scopes, including the root.
    pub fn depth(&self) -> usize {
        self.frames.len()
    }
}

impl Default for ScopeStack {
    fn default() -> ScopeStack {
        ScopeStack::new()
    }
}

/// Keeps a nested scope entered. See [`ScopeStack::push`].
#[derive(Debug)]
pub struct ScopeGuard<'a> {
    stack: &'a mut ScopeStack,
}

impl Deref for ScopeGuard<'_> {
    type Target = ScopeStack;

    fn deref(&self) -> &ScopeStack {
        self.stack
    }
}

impl DerefMut for ScopeGuard<'_> {
    fn deref_mut(&mut self) -> &mut ScopeStack {
        self.stack
    }
}

impl Drop for ScopeGuard<'_> {
    fn drop(&mut self) {
        self.stack.frames.pop();
    }
}

/// Run `f`, capturing its error as an `$exception` within `scope` before returning it unchanged.
pub fn capture_errors<T, E, F>(client: &Client, scope: &Scope, f: F) -> Result<T, E>
where
    E: std::error::Error + 'static,
    F: FnOnce() -> Result<T, E>,
{
    f().map_err(|err| {
        if let Err(enqueue_err) = client.capture_exception(&err, scope) {
            log::warn!(target: "posthog", "failed to capture exception: {enqueue_err}");
        }
        err
    })
}

/// Wrap `f` so that every error it returns is captured within `scope`.
pub fn with_error_capture<'a, A, T, E, F>(
    client: &'a Client,
    scope: Scope,
    f: F,
) -> impl Fn(A) -> Result<T, E> + 'a
where
    A: 'a,
    T: 'a,
    E: std::error::Error + 'static,
    F: Fn(A) -> Result<T, E> + 'a,
{
    move |arg| capture_errors(client, &scope, || f(arg))
}
