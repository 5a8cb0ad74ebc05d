//! Materialized-view fan-out.
//!
//! The table core does not compute view contents; it only fires callbacks
//! at the right moments. A [`MaterializedView`] registers with a table and
//! receives exactly one callback per successful user-initiated mutation.
//! Undo-initiated mutations never fire callbacks.

use crate::tuple::Tuple;

/// Callback surface for one materialized view over a table.
pub trait MaterializedView {
    /// View name (diagnostics only).
    fn name(&self) -> &str;

    /// A row was inserted.
    fn on_insert(&mut self, new: &Tuple);

    /// A row was updated in place.
    fn on_update(&mut self, old: &Tuple, new: &Tuple);

    /// A row was deleted.
    fn on_delete(&mut self, old: &Tuple);
}

/// Ordered fan-out of mutation events to registered views.
#[derive(Default)]
pub struct ViewDispatcher {
    views: Vec<Box<dyn MaterializedView + Send>>,
}

impl ViewDispatcher {
    /// Creates a dispatcher with no registered views.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a view; the dispatcher owns it.
    pub fn add(&mut self, view: Box<dyn MaterializedView + Send>) {
        self.views.push(view);
    }

    /// Returns the number of registered views.
    pub fn len(&self) -> usize {
        self.views.len()
    }

    /// Returns true if no views are registered.
    pub fn is_empty(&self) -> bool {
        self.views.is_empty()
    }

    /// Fires `on_insert` on every view in registration order.
    pub fn dispatch_insert(&mut self, new: &Tuple) {
        for view in &mut self.views {
            view.on_insert(new);
        }
    }

    /// Fires `on_update` on every view in registration order.
    pub fn dispatch_update(&mut self, old: &Tuple, new: &Tuple) {
        for view in &mut self.views {
            view.on_update(old, new);
        }
    }

    /// Fires `on_delete` on every view in registration order.
    pub fn dispatch_delete(&mut self, old: &Tuple) {
        for view in &mut self.views {
            view.on_delete(old);
        }
    }
}
