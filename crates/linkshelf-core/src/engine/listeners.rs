use std::cell::RefCell;
use std::collections::BTreeMap;

use crate::model::Item;

/// Handle returned by [`SyncEngine::register_listener`](super::SyncEngine::register_listener).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ListenerKey(u64);

type Listener = Box<dyn FnMut(&[Item])>;

#[derive(Default)]
pub(super) struct Listeners {
    next_key: u64,
    entries: BTreeMap<ListenerKey, Listener>,
    /// Keys unregistered while their entries were lent out to `notify`.
    unregistered: Vec<ListenerKey>,
}

impl Listeners {
    pub(super) fn register(&mut self, listener: Listener) -> ListenerKey {
        let key = ListenerKey(self.next_key);
        self.next_key += 1;
        self.entries.insert(key, listener);
        key
    }

    pub(super) fn unregister(&mut self, key: ListenerKey) {
        if self.entries.remove(&key).is_none() {
            self.unregistered.push(key);
        }
    }

    /// Call every listener without holding the borrow, so callbacks may
    /// re-enter the engine (and register or unregister listeners).
    pub(super) fn notify(cell: &RefCell<Self>, items: &[Item]) {
        let mut lent = std::mem::take(&mut cell.borrow_mut().entries);
        for listener in lent.values_mut() {
            listener(items);
        }

        let mut listeners = cell.borrow_mut();
        for key in std::mem::take(&mut listeners.unregistered) {
            lent.remove(&key);
        }
        // Anything registered during the callbacks is already in `entries`.
        lent.append(&mut listeners.entries);
        listeners.entries = lent;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::rc::Rc;

    #[test]
    fn notify_calls_every_listener() {
        let cell = RefCell::new(Listeners::default());
        let calls = Rc::new(RefCell::new(0));
        for _ in 0..2 {
            let calls = Rc::clone(&calls);
            cell.borrow_mut()
                .register(Box::new(move |_| *calls.borrow_mut() += 1));
        }
        Listeners::notify(&cell, &[]);
        assert_eq!(*calls.borrow(), 2);
    }

    #[test]
    fn unregistered_listener_is_not_called() {
        let cell = RefCell::new(Listeners::default());
        let calls = Rc::new(RefCell::new(0));
        let counter = Rc::clone(&calls);
        let key = cell
            .borrow_mut()
            .register(Box::new(move |_| *counter.borrow_mut() += 1));
        cell.borrow_mut().unregister(key);
        Listeners::notify(&cell, &[]);
        assert_eq!(*calls.borrow(), 0);
    }

    #[test]
    fn listener_can_unregister_itself_during_notify() {
        let cell = Rc::new(RefCell::new(Listeners::default()));
        let calls = Rc::new(RefCell::new(0));
        let key_slot: Rc<RefCell<Option<ListenerKey>>> = Rc::new(RefCell::new(None));

        let inner_cell = Rc::clone(&cell);
        let inner_calls = Rc::clone(&calls);
        let inner_key = Rc::clone(&key_slot);
        let key = cell.borrow_mut().register(Box::new(move |_| {
            *inner_calls.borrow_mut() += 1;
            if let Some(key) = *inner_key.borrow() {
                inner_cell.borrow_mut().unregister(key);
            }
        }));
        *key_slot.borrow_mut() = Some(key);

        Listeners::notify(&cell, &[]);
        Listeners::notify(&cell, &[]);
        assert_eq!(*calls.borrow(), 1);
    }
}
