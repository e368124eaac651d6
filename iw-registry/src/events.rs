use actix::Message;
use std::{collections::HashMap, sync::Arc};
use tokio::sync::oneshot;

/// Implemented by event enums dispatched through [`Listeners`]. Each variant
/// maps onto one of a fixed set of names, which is what callers (and the
/// orchestrator's `await` config) register against
pub trait Event: Clone + Send + 'static {
    /// Every name this event type can be emitted under
    const NAMES: &'static [&'static str];

    fn name(&self) -> &'static str;
}

pub type Listener<E> = Arc<dyn Fn(&E) + Send + Sync>;

/// Map from event name to the ordered list of callbacks registered for it.
/// Dispatch is inline: [`Listeners::emit`] calls every persistent callback in
/// registration order, then completes and drops the one-shot waiters
pub struct Listeners<E: Event> {
    persistent: HashMap<&'static str, Vec<Listener<E>>>,
    once: HashMap<&'static str, Vec<oneshot::Sender<()>>>,
}

impl<E: Event> Default for Listeners<E> {
    fn default() -> Self {
        Self {
            persistent: HashMap::new(),
            once: HashMap::new(),
        }
    }
}

impl<E: Event> Listeners<E> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Resolve a caller supplied name against the names `E` can emit
    pub fn known(name: &str) -> Option<&'static str> {
        E::NAMES.iter().copied().find(|n| *n == name)
    }

    pub fn on(&mut self, name: &str, listener: Listener<E>) -> bool {
        match Self::known(name) {
            Some(key) => {
                self.persistent.entry(key).or_default().push(listener);
                true
            }
            None => {
                log::warn!("Ignoring listener for unknown event {name:}");
                false
            }
        }
    }

    /// Complete `waiter` the next time an event called `name` is emitted
    pub fn once(&mut self, name: &str, waiter: oneshot::Sender<()>) -> bool {
        match Self::known(name) {
            Some(key) => {
                self.once.entry(key).or_default().push(waiter);
                true
            }
            None => {
                log::warn!("Ignoring waiter for unknown event {name:}");
                false
            }
        }
    }

    pub fn emit(&mut self, event: E) {
        let name = event.name();
        if let Some(listeners) = self.persistent.get(name) {
            for listener in listeners {
                listener(&event);
            }
        }
        if let Some(waiters) = self.once.remove(name) {
            for waiter in waiters {
                // receiver may have given up waiting
                waiter.send(()).ok();
            }
        }
    }

    pub fn listener_count(&self, name: &str) -> usize {
        self.persistent.get(name).map(Vec::len).unwrap_or_default()
    }

    pub fn clear(&mut self) {
        self.persistent.clear();
        self.once.clear();
    }
}

/// Ask an actor to complete `waiter` the next time it emits `name`
#[derive(Message)]
#[rtype(result = "()")]
pub struct AwaitEvent {
    pub name: &'static str,
    pub waiter: oneshot::Sender<()>,
}

/// Register a persistent listener on an actor's events. Resolves to whether
/// the name was known
pub struct OnEvent<E: Event> {
    pub name: String,
    pub listener: Listener<E>,
}

impl<E: Event> Message for OnEvent<E> {
    type Result = bool;
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[derive(Debug, Clone, PartialEq)]
    enum Door {
        Opened(u8),
        Closed,
    }

    impl Event for Door {
        const NAMES: &'static [&'static str] = &["opened", "closed"];

        fn name(&self) -> &'static str {
            match self {
                Door::Opened(_) => "opened",
                Door::Closed => "closed",
            }
        }
    }

    #[test]
    fn dispatches_in_registration_order_by_name() {
        let seen = Arc::new(Mutex::new(vec![]));
        let mut listeners = Listeners::<Door>::new();

        for tag in ["first", "second"] {
            let seen = seen.clone();
            assert!(listeners.on(
                "opened",
                Arc::new(move |e: &Door| seen.lock().unwrap().push((tag, e.clone())))
            ));
        }

        listeners.emit(Door::Closed);
        listeners.emit(Door::Opened(3));

        assert_eq!(
            *seen.lock().unwrap(),
            vec![("first", Door::Opened(3)), ("second", Door::Opened(3))]
        );
    }

    #[test]
    fn unknown_names_are_rejected() {
        let mut listeners = Listeners::<Door>::new();
        assert!(!listeners.on("slammed", Arc::new(|_: &Door| {})));
        let (tx, _rx) = oneshot::channel();
        assert!(!listeners.once("slammed", tx));
        assert_eq!(Listeners::<Door>::known("closed"), Some("closed"));
    }

    #[test]
    fn once_waiters_fire_a_single_time() {
        let mut listeners = Listeners::<Door>::new();
        let (tx, mut rx) = oneshot::channel();
        assert!(listeners.once("closed", tx));

        listeners.emit(Door::Opened(1));
        assert!(rx.try_recv().is_err());

        listeners.emit(Door::Closed);
        assert!(rx.try_recv().is_ok());

        // nothing left registered for the next emit
        listeners.emit(Door::Closed);
        assert_eq!(listeners.listener_count("closed"), 0);
    }
}
