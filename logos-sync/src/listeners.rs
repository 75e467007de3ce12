//! Callback table shared by the observable pieces of a session
//! (awareness, user preferences).

use std::sync::{Arc, Mutex, MutexGuard, Weak};

use logos_store::Disposer;

type Callback<E> = Arc<dyn Fn(&E) + Send + Sync>;

struct Table<E> {
    next_id: u64,
    entries: Vec<(u64, Callback<E>)>,
}

/// Subscribers to events of type `E`.
///
/// Callbacks run outside the table lock, so they may subscribe or
/// unsubscribe while being notified.
pub struct Listeners<E> {
    table: Arc<Mutex<Table<E>>>,
}

impl<E: 'static> Listeners<E> {
    pub fn new() -> Self {
        Self {
            table: Arc::new(Mutex::new(Table { next_id: 0, entries: Vec::new() })),
        }
    }

    pub fn add<F>(&self, callback: F) -> Disposer
    where
        F: Fn(&E) + Send + Sync + 'static,
    {
        let id = {
            let mut table = self.lock();
            table.next_id += 1;
            let id = table.next_id;
            table.entries.push((id, Arc::new(callback)));
            id
        };

        let weak: Weak<Mutex<Table<E>>> = Arc::downgrade(&self.table);
        Disposer::new(move || {
            if let Some(table) = weak.upgrade() {
                let mut table = table.lock().unwrap_or_else(|e| e.into_inner());
                table.entries.retain(|(entry, _)| *entry != id);
            }
        })
    }

    pub fn emit(&self, event: &E) {
        let callbacks: Vec<Callback<E>> =
            self.lock().entries.iter().map(|(_, cb)| cb.clone()).collect();
        for callback in callbacks {
            callback(event);
        }
    }

    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> MutexGuard<'_, Table<E>> {
        self.table.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl<E: 'static> Default for Listeners<E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<E> Clone for Listeners<E> {
    fn clone(&self) -> Self {
        Self { table: self.table.clone() }
    }
}
