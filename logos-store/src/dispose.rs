//! Revocable subscriptions.
//!
//! Every `listen`/`observe`/`subscribe` call in the workspace returns a
//! [`Disposer`]. Owners collect them in a [`DisposerList`] so that a single
//! teardown (or simply dropping the list) releases every listener, on every
//! exit path.

/// One-shot release handle for a subscription.
///
/// Releasing is idempotent and also happens on drop.
#[must_use = "dropping a Disposer immediately unsubscribes"]
pub struct Disposer {
    release: Option<Box<dyn FnOnce()>>,
}

impl Disposer {
    pub fn new(release: impl FnOnce() + 'static) -> Self {
        Self {
            release: Some(Box::new(release)),
        }
    }

    /// A disposer with nothing to release.
    pub fn noop() -> Self {
        Self { release: None }
    }

    /// Run the release callback. Further calls do nothing.
    pub fn dispose(&mut self) {
        if let Some(release) = self.release.take() {
            release();
        }
    }

    pub fn is_disposed(&self) -> bool {
        self.release.is_none()
    }
}

impl Drop for Disposer {
    fn drop(&mut self) {
        self.dispose();
    }
}

impl std::fmt::Debug for Disposer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Disposer")
            .field("disposed", &self.is_disposed())
            .finish()
    }
}

/// Scoped collection of disposers, released together.
#[derive(Debug, Default)]
pub struct DisposerList {
    disposers: Vec<Disposer>,
}

impl DisposerList {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, disposer: Disposer) {
        self.disposers.push(disposer);
    }

    /// Release everything in reverse registration order.
    ///
    /// The list is emptied, so calling this again is a no-op.
    pub fn dispose_all(&mut self) {
        while let Some(mut disposer) = self.disposers.pop() {
            disposer.dispose();
        }
    }

    pub fn len(&self) -> usize {
        self.disposers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.disposers.is_empty()
    }
}

impl Extend<Disposer> for DisposerList {
    fn extend<I: IntoIterator<Item = Disposer>>(&mut self, iter: I) {
        self.disposers.extend(iter);
    }
}

impl Drop for DisposerList {
    fn drop(&mut self) {
        self.dispose_all();
    }
}
