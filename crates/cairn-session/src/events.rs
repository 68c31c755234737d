//! Lifecycle event fan-out to application listeners.
//!
//! Each event kind has its own registry. Creation-side events run handlers
//! in registration order; destruction-side events run them in reverse so that
//! resources set up by an early listener are torn down last.

use std::sync::Arc;

use parking_lot::RwLock;
use serde_json::Value;

use crate::session::Session;

/// Handler for events carrying only the session.
pub type SessionHandler = dyn Fn(&Session) + Send + Sync;

/// Handler for id changes; receives the previous id.
pub type IdChangedHandler = dyn Fn(&Session, &str) + Send + Sync;

/// Handler for attribute writes; receives name, previous and new value.
pub type AttributeSetHandler = dyn Fn(&Session, &str, Option<&Value>, &Value) + Send + Sync;

/// Handler for attribute removal; receives name and removed value.
pub type AttributeRemovedHandler = dyn Fn(&Session, &str, &Value) + Send + Sync;

/// Listener interface bundling all session-level callbacks.
///
/// Every method defaults to a no-op so implementors pick what they need.
pub trait SessionListener: Send + Sync {
    fn on_created(&self, _session: &Session) {}
    fn on_accessed(&self, _session: &Session) {}
    fn on_released(&self, _session: &Session) {}
    fn on_destroyed(&self, _session: &Session) {}
    fn on_destroyed_by_timeout(&self, _session: &Session) {}
    fn on_id_changed(&self, _session: &Session, _old_id: &str) {}
    fn on_attribute_set(
        &self,
        _session: &Session,
        _name: &str,
        _old: Option<&Value>,
        _new: &Value,
    ) {
    }
    fn on_attribute_removed(&self, _session: &Session, _name: &str, _old: &Value) {}
}

/// Read-mostly list of handlers for one event kind.
///
/// Dispatch clones the handler list before calling out, so handlers may
/// register further handlers without deadlocking.
pub struct HandlerRegistry<F: ?Sized> {
    handlers: RwLock<Vec<Arc<F>>>,
}

impl<F: ?Sized> Default for HandlerRegistry<F> {
    fn default() -> Self {
        Self {
            handlers: RwLock::new(Vec::new()),
        }
    }
}

impl<F: ?Sized> HandlerRegistry<F> {
    pub fn register(&self, handler: Arc<F>) {
        self.handlers.write().push(handler);
    }

    pub fn len(&self) -> usize {
        self.handlers.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.read().is_empty()
    }

    pub fn clear(&self) {
        self.handlers.write().clear();
    }

    fn snapshot(&self) -> Vec<Arc<F>> {
        self.handlers.read().clone()
    }

    /// Call handlers in registration order.
    pub fn for_each(&self, mut f: impl FnMut(&F)) {
        for handler in self.snapshot() {
            f(&handler);
        }
    }

    /// Call handlers in reverse registration order.
    pub fn for_each_rev(&self, mut f: impl FnMut(&F)) {
        for handler in self.snapshot().iter().rev() {
            f(handler);
        }
    }
}

/// Dispatcher holding one registry per event kind.
#[derive(Default)]
pub struct SessionEvents {
    pub created: HandlerRegistry<SessionHandler>,
    pub accessed: HandlerRegistry<SessionHandler>,
    pub released: HandlerRegistry<SessionHandler>,
    pub destroyed: HandlerRegistry<SessionHandler>,
    pub destroyed_by_timeout: HandlerRegistry<SessionHandler>,
    pub id_changed: HandlerRegistry<IdChangedHandler>,
    pub attribute_set: HandlerRegistry<AttributeSetHandler>,
    pub attribute_removed: HandlerRegistry<AttributeRemovedHandler>,
}

impl std::fmt::Debug for SessionEvents {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionEvents")
            .field("created", &self.created.len())
            .field("destroyed", &self.destroyed.len())
            .field("attribute_set", &self.attribute_set.len())
            .finish_non_exhaustive()
    }
}

impl SessionEvents {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_created(&self, f: impl Fn(&Session) + Send + Sync + 'static) {
        self.created.register(Arc::new(f));
    }

    pub fn on_accessed(&self, f: impl Fn(&Session) + Send + Sync + 'static) {
        self.accessed.register(Arc::new(f));
    }

    pub fn on_released(&self, f: impl Fn(&Session) + Send + Sync + 'static) {
        self.released.register(Arc::new(f));
    }

    pub fn on_destroyed(&self, f: impl Fn(&Session) + Send + Sync + 'static) {
        self.destroyed.register(Arc::new(f));
    }

    pub fn on_destroyed_by_timeout(&self, f: impl Fn(&Session) + Send + Sync + 'static) {
        self.destroyed_by_timeout.register(Arc::new(f));
    }

    pub fn on_id_changed(&self, f: impl Fn(&Session, &str) + Send + Sync + 'static) {
        self.id_changed.register(Arc::new(f));
    }

    pub fn on_attribute_set(
        &self,
        f: impl Fn(&Session, &str, Option<&Value>, &Value) + Send + Sync + 'static,
    ) {
        self.attribute_set.register(Arc::new(f));
    }

    pub fn on_attribute_removed(&self, f: impl Fn(&Session, &str, &Value) + Send + Sync + 'static) {
        self.attribute_removed.register(Arc::new(f));
    }

    /// Register every callback of a [`SessionListener`].
    pub fn add_listener(&self, listener: Arc<dyn SessionListener>) {
        let l = Arc::clone(&listener);
        self.on_created(move |s| l.on_created(s));
        let l = Arc::clone(&listener);
        self.on_accessed(move |s| l.on_accessed(s));
        let l = Arc::clone(&listener);
        self.on_released(move |s| l.on_released(s));
        let l = Arc::clone(&listener);
        self.on_destroyed(move |s| l.on_destroyed(s));
        let l = Arc::clone(&listener);
        self.on_destroyed_by_timeout(move |s| l.on_destroyed_by_timeout(s));
        let l = Arc::clone(&listener);
        self.on_id_changed(move |s, old| l.on_id_changed(s, old));
        let l = Arc::clone(&listener);
        self.on_attribute_set(move |s, name, old, new| l.on_attribute_set(s, name, old, new));
        self.on_attribute_removed(move |s, name, old| listener.on_attribute_removed(s, name, old));
    }

    /// Drop every registered handler (application stop).
    pub fn clear(&self) {
        self.created.clear();
        self.accessed.clear();
        self.released.clear();
        self.destroyed.clear();
        self.destroyed_by_timeout.clear();
        self.id_changed.clear();
        self.attribute_set.clear();
        self.attribute_removed.clear();
    }

    pub(crate) fn session_created(&self, session: &Session) {
        self.created.for_each(|h| h(session));
    }

    pub(crate) fn session_accessed(&self, session: &Session) {
        self.accessed.for_each(|h| h(session));
    }

    pub(crate) fn session_released(&self, session: &Session) {
        self.released.for_each(|h| h(session));
    }

    pub(crate) fn session_destroyed(&self, session: &Session) {
        self.destroyed.for_each_rev(|h| h(session));
    }

    pub(crate) fn session_destroyed_by_timeout(&self, session: &Session) {
        self.destroyed_by_timeout.for_each_rev(|h| h(session));
    }

    pub(crate) fn session_id_changed(&self, session: &Session, old_id: &str) {
        self.id_changed.for_each(|h| h(session, old_id));
    }

    pub(crate) fn attribute_set(
        &self,
        session: &Session,
        name: &str,
        old: Option<&Value>,
        new: &Value,
    ) {
        self.attribute_set.for_each(|h| h(session, name, old, new));
    }

    pub(crate) fn attribute_removed(&self, session: &Session, name: &str, old: &Value) {
        self.attribute_removed.for_each_rev(|h| h(session, name, old));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use serde_json::json;

    fn session() -> Session {
        Session::new("s1", 0, "app", 0, 60, false)
    }

    #[test]
    fn test_creation_in_order_destruction_reversed() {
        let events = SessionEvents::new();
        let log = Arc::new(Mutex::new(Vec::new()));

        for name in ["first", "second", "third"] {
            let log_c = Arc::clone(&log);
            events.on_created(move |_| log_c.lock().push(format!("created:{name}")));
            let log_d = Arc::clone(&log);
            events.on_destroyed(move |_| log_d.lock().push(format!("destroyed:{name}")));
        }

        let s = session();
        events.session_created(&s);
        events.session_destroyed(&s);

        assert_eq!(
            *log.lock(),
            vec![
                "created:first",
                "created:second",
                "created:third",
                "destroyed:third",
                "destroyed:second",
                "destroyed:first",
            ]
        );
    }

    #[test]
    fn test_listener_trait_registration() {
        #[derive(Default)]
        struct Counting {
            seen: Mutex<Vec<String>>,
        }

        impl SessionListener for Counting {
            fn on_created(&self, session: &Session) {
                self.seen.lock().push(format!("created {}", session.id()));
            }

            fn on_attribute_set(
                &self,
                _session: &Session,
                name: &str,
                old: Option<&Value>,
                new: &Value,
            ) {
                self.seen.lock().push(format!("set {name} {old:?} {new}"));
            }
        }

        let events = SessionEvents::new();
        let listener = Arc::new(Counting::default());
        events.add_listener(listener.clone());

        let s = session();
        events.session_created(&s);
        events.attribute_set(&s, "k", None, &json!(1));
        events.session_released(&s);

        assert_eq!(
            *listener.seen.lock(),
            vec!["created s1".to_string(), "set k None 1".to_string()]
        );
        assert_eq!(events.created.len(), 1);
    }

    #[test]
    fn test_handler_may_register_during_dispatch() {
        let events = Arc::new(SessionEvents::new());
        let inner = Arc::clone(&events);
        events.on_accessed(move |_| inner.on_accessed(|_| {}));

        events.session_accessed(&session());
        assert_eq!(events.accessed.len(), 2);
    }

    #[test]
    fn test_clear() {
        let events = SessionEvents::new();
        events.on_created(|_| {});
        events.on_destroyed(|_| {});
        events.clear();
        assert!(events.created.is_empty());
        assert!(events.destroyed.is_empty());
    }
}
