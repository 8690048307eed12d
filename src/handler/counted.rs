//! Generic reference-counted map from descriptors to native handles

use crate::error::HandlerError;
use crate::resources::{Descriptor, DescriptorId, Resource};
use std::collections::HashMap;

struct Entry<D: Resource, N> {
    descriptor: Descriptor<D>,
    native: N,
    count: usize,
}

/// Maps live descriptors to their native handle and a reference count.
///
/// A native handle exists exactly while the count is above zero. Creation
/// and destruction are supplied by the caller, so the same map serves every
/// resource kind.
pub struct Handler<D: Resource, N> {
    entries: HashMap<DescriptorId, Entry<D, N>>,
}

impl<D: Resource, N> Default for Handler<D, N> {
    fn default() -> Self {
        Self::new()
    }
}

impl<D: Resource, N> Handler<D, N> {
    pub fn new() -> Self {
        Self {
            entries: HashMap::new(),
        }
    }

    /// Take a reference on `descriptor`, creating its native handle on first use.
    ///
    /// If `create` fails the descriptor stays unhandled.
    pub fn handle<E>(
        &mut self,
        descriptor: &Descriptor<D>,
        create: impl FnOnce(&Descriptor<D>) -> Result<N, E>,
    ) -> Result<&mut N, E> {
        let entry = match self.entries.entry(descriptor.id()) {
            std::collections::hash_map::Entry::Occupied(occupied) => {
                let entry = occupied.into_mut();
                entry.count += 1;
                log::debug!("{} `{}` handled, count {}", D::KIND, descriptor.name(), entry.count);
                entry
            }
            std::collections::hash_map::Entry::Vacant(vacant) => {
                let native = create(descriptor)?;
                log::debug!("{} `{}` created", D::KIND, descriptor.name());
                vacant.insert(Entry {
                    descriptor: descriptor.clone(),
                    native,
                    count: 1,
                })
            }
        };
        Ok(&mut entry.native)
    }

    /// Drop a reference on `descriptor`. The last release hands the native
    /// handle to `destroy`. Returns the remaining count.
    pub fn release(&mut self, descriptor: &Descriptor<D>, destroy: impl FnOnce(N)) -> Result<usize, HandlerError> {
        let id = descriptor.id();
        let Some(entry) = self.entries.get_mut(&id) else {
            return Err(HandlerError::OverRelease {
                kind: D::KIND,
                label: descriptor.name(),
            });
        };

        entry.count -= 1;
        let remaining = entry.count;
        if remaining == 0 {
            if let Some(entry) = self.entries.remove(&id) {
                log::debug!("{} `{}` destroyed", D::KIND, descriptor.name());
                destroy(entry.native);
            }
        } else {
            log::debug!("{} `{}` released, count {}", D::KIND, descriptor.name(), remaining);
        }
        Ok(remaining)
    }

    pub fn get_internal(&self, descriptor: &Descriptor<D>) -> Option<&N> {
        self.entries.get(&descriptor.id()).map(|e| &e.native)
    }

    pub fn get_internal_mut(&mut self, descriptor: &Descriptor<D>) -> Option<&mut N> {
        self.entries.get_mut(&descriptor.id()).map(|e| &mut e.native)
    }

    /// Current reference count, 0 when unhandled
    pub fn count(&self, descriptor: &Descriptor<D>) -> usize {
        self.entries.get(&descriptor.id()).map_or(0, |e| e.count)
    }

    pub fn contains(&self, descriptor: &Descriptor<D>) -> bool {
        self.entries.contains_key(&descriptor.id())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Every live descriptor with its count
    pub fn descriptors(&self) -> Vec<(Descriptor<D>, usize)> {
        self.entries
            .values()
            .map(|e| (e.descriptor.clone(), e.count))
            .collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&Descriptor<D>, &N)> {
        self.entries.values().map(|e| (&e.descriptor, &e.native))
    }

    /// Destroy every native handle regardless of its count.
    ///
    /// Returns what was live, with counts, so [`Handler::handle_all`] can
    /// restore the same state.
    pub fn release_all(&mut self, mut destroy: impl FnMut(&Descriptor<D>, N)) -> Vec<(Descriptor<D>, usize)> {
        let mut released = Vec::with_capacity(self.entries.len());
        for (_, entry) in self.entries.drain() {
            destroy(&entry.descriptor, entry.native);
            released.push((entry.descriptor, entry.count));
        }
        if !released.is_empty() {
            log::debug!("Released all {} {} entries", released.len(), D::KIND);
        }
        released
    }

    /// Recreate each descriptor once and restore its count.
    ///
    /// Failures are returned per descriptor with the count that was lost, so
    /// composites can give back what they held on their dependencies. The
    /// others are still restored.
    pub fn handle_all<E>(
        &mut self,
        descriptors: Vec<(Descriptor<D>, usize)>,
        mut create: impl FnMut(&Descriptor<D>) -> Result<N, E>,
    ) -> Vec<(Descriptor<D>, usize, E)> {
        let mut failures = Vec::new();
        for (descriptor, count) in descriptors {
            if count == 0 {
                continue;
            }
            if let Some(entry) = self.entries.get_mut(&descriptor.id()) {
                entry.count += count;
                continue;
            }
            match create(&descriptor) {
                Ok(native) => {
                    self.entries.insert(
                        descriptor.id(),
                        Entry {
                            descriptor,
                            native,
                            count,
                        },
                    );
                }
                Err(e) => failures.push((descriptor, count, e)),
            }
        }
        failures
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resources::DataBuffer;
    use std::cell::Cell;

    fn buffer() -> Descriptor<DataBuffer> {
        Descriptor::new(DataBuffer::from_f32(1, &[1.0, 2.0, 3.0]))
    }

    #[test]
    fn test_handle_creates_once() {
        let mut handler: Handler<DataBuffer, u32> = Handler::new();
        let d = buffer();
        let created = Cell::new(0);

        for _ in 0..3 {
            let native = handler
                .handle(&d, |_| {
                    created.set(created.get() + 1);
                    Ok::<_, ()>(7)
                })
                .unwrap();
            assert_eq!(*native, 7);
        }

        assert_eq!(created.get(), 1);
        assert_eq!(handler.count(&d), 3);
        assert_eq!(handler.len(), 1);
        assert_eq!(handler.get_internal(&d), Some(&7));
    }

    #[test]
    fn test_release_destroys_at_zero() {
        let mut handler: Handler<DataBuffer, u32> = Handler::new();
        let d = buffer();
        handler.handle(&d, |_| Ok::<_, ()>(1)).unwrap();
        handler.handle(&d, |_| Ok::<_, ()>(2)).unwrap();

        let destroyed = Cell::new(None);
        assert_eq!(handler.release(&d, |n| destroyed.set(Some(n))).unwrap(), 1);
        assert_eq!(destroyed.get(), None);
        assert_eq!(handler.get_internal(&d), Some(&1));

        assert_eq!(handler.release(&d, |n| destroyed.set(Some(n))).unwrap(), 0);
        assert_eq!(destroyed.get(), Some(1));
        assert!(handler.get_internal(&d).is_none());
        assert!(handler.is_empty());
    }

    #[test]
    fn test_over_release_leaves_others_untouched() {
        let mut handler: Handler<DataBuffer, u32> = Handler::new();
        let live = buffer();
        let never = Descriptor::new(DataBuffer::from_f32(1, &[0.0]).with_label("ghost"));
        handler.handle(&live, |_| Ok::<_, ()>(5)).unwrap();

        let err = handler.release(&never, |_| panic!("nothing to destroy")).unwrap_err();
        assert_eq!(
            err,
            HandlerError::OverRelease {
                kind: "data buffer",
                label: "ghost".into()
            }
        );
        assert_eq!(handler.count(&live), 1);
        assert_eq!(handler.get_internal(&live), Some(&5));
    }

    #[test]
    fn test_failed_creation_stays_unhandled() {
        let mut handler: Handler<DataBuffer, u32> = Handler::new();
        let d = buffer();

        assert_eq!(handler.handle(&d, |_| Err("no memory")).unwrap_err(), "no memory");
        assert_eq!(handler.count(&d), 0);
        assert!(handler.release(&d, |_| {}).is_err());

        // A later attempt may succeed
        handler.handle(&d, |_| Ok::<_, &str>(3)).unwrap();
        assert_eq!(handler.count(&d), 1);
    }

    #[test]
    fn test_release_all_then_handle_all_restores_counts() {
        let mut handler: Handler<DataBuffer, u32> = Handler::new();
        let a = buffer();
        let b = buffer();
        for _ in 0..3 {
            handler.handle(&a, |_| Ok::<_, ()>(1)).unwrap();
        }
        handler.handle(&b, |_| Ok::<_, ()>(2)).unwrap();

        let mut destroyed = Vec::new();
        let released = handler.release_all(|_, n| destroyed.push(n));
        destroyed.sort();
        assert_eq!(destroyed, vec![1, 2]);
        assert!(handler.is_empty());

        let failures = handler.handle_all(released, |_| Ok::<_, ()>(10));
        assert!(failures.is_empty());
        assert_eq!(handler.count(&a), 3);
        assert_eq!(handler.count(&b), 1);
        assert_eq!(handler.get_internal(&a), Some(&10));
    }

    #[test]
    fn test_handle_all_returns_lost_counts() {
        let mut handler: Handler<DataBuffer, u32> = Handler::new();
        let a = buffer();
        let b = Descriptor::new(DataBuffer::from_f32(1, &[0.0]).with_label("broken"));
        handler.handle(&a, |_| Ok::<_, ()>(1)).unwrap();
        for _ in 0..2 {
            handler.handle(&b, |_| Ok::<_, ()>(2)).unwrap();
        }

        let released = handler.release_all(|_, _| {});
        let failures = handler.handle_all(released, |d| if d.id() == b.id() { Err("lost") } else { Ok(3) });
        assert_eq!(failures.len(), 1);
        let (failed, count, error) = &failures[0];
        assert_eq!(failed.id(), b.id());
        assert_eq!((*count, *error), (2, "lost"));
        assert_eq!(handler.count(&a), 1);
        assert_eq!(handler.count(&b), 0);
    }

    #[test]
    fn test_get_internal_does_not_count() {
        let mut handler: Handler<DataBuffer, u32> = Handler::new();
        let d = buffer();
        assert!(handler.get_internal(&d).is_none());
        handler.handle(&d, |_| Ok::<_, ()>(1)).unwrap();
        for _ in 0..5 {
            handler.get_internal(&d);
        }
        assert_eq!(handler.count(&d), 1);
    }
}
