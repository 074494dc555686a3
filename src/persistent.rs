//! The in-memory side of persistence: object headers, lazy references,
//! and the registry that maps stored class tags to state decoders.
//!
//! A persistent object moves through three statuses:
//!
//! UNSAVED  the state here is usable and has not been stored;
//! SAVED    the state here is usable and matches the stored state;
//! GHOST    the state has been discarded and is reloaded on first access.
//!
//! New instances are UNSAVED.  A commit makes them SAVED; cache pressure,
//! abort, and invalidation make SAVED objects GHOST; loading makes a GHOST
//! SAVED again.

use crate::error::Result;
use crate::record::Oid;
use crate::serialize::{StateDecoder, StateEncoder};
use rustc_hash::FxHashMap;
use std::any::Any;
use std::cell::{Cell, RefCell};
use std::rc::Rc;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Status {
    Unsaved,
    Saved,
    Ghost,
}

/// Application state carried by a persistent object.  The connection
/// treats it as opaque apart from encoding, which walks its persistent
/// references through the encoder.
pub trait ObjectState: 'static {
    /// The registered tag stored with every record of this class.
    fn class_name(&self) -> &'static str;

    fn encode(&self, encoder: &mut StateEncoder) -> Result<()>;

    fn as_any(&self) -> &dyn Any;

    fn as_any_mut(&mut self) -> &mut dyn Any;
}

pub type PObject = Rc<PersistentObject>;

/// Header and state cell for one persistent object.  Connections are
/// single-threaded, so plain cells carry the mutable header fields.
pub struct PersistentObject {
    class: &'static str,
    oid: Cell<Option<Oid>>,
    /// Identity of the owning connection, set when an oid is assigned.
    owner: Cell<Option<u64>>,
    status: Cell<Status>,
    /// Stamp of the last access, compared against the connection's
    /// transaction serial for conflict detection and cache eviction.
    serial: Cell<u64>,
    state: RefCell<Option<Box<dyn ObjectState>>>,
}

impl PersistentObject {
    /// A fresh UNSAVED object that has never been stored.
    pub fn new(state: Box<dyn ObjectState>) -> PObject {
        Rc::new(PersistentObject {
            class: state.class_name(),
            oid: Cell::new(None),
            owner: Cell::new(None),
            status: Cell::new(Status::Unsaved),
            serial: Cell::new(0),
            state: RefCell::new(Some(state)),
        })
    }

    /// A ghost: identity without state.
    pub(crate) fn ghost(class: &'static str, oid: Oid, owner: u64) -> PObject {
        Rc::new(PersistentObject {
            class,
            oid: Cell::new(Some(oid)),
            owner: Cell::new(Some(owner)),
            status: Cell::new(Status::Ghost),
            serial: Cell::new(0),
            state: RefCell::new(None),
        })
    }

    pub fn class_name(&self) -> &'static str {
        self.class
    }

    pub fn oid(&self) -> Option<Oid> {
        self.oid.get()
    }

    pub fn status(&self) -> Status {
        self.status.get()
    }

    pub fn is_ghost(&self) -> bool {
        self.status.get() == Status::Ghost
    }

    pub fn serial(&self) -> u64 {
        self.serial.get()
    }

    pub(crate) fn owner(&self) -> Option<u64> {
        self.owner.get()
    }

    pub(crate) fn set_oid(&self, oid: Option<Oid>) {
        self.oid.set(oid);
    }

    pub(crate) fn set_owner(&self, owner: Option<u64>) {
        self.owner.set(owner);
    }

    pub(crate) fn set_serial(&self, serial: u64) {
        self.serial.set(serial);
    }

    pub(crate) fn set_status_saved(&self) {
        self.status.set(Status::Saved);
    }

    pub(crate) fn set_status_unsaved(&self) {
        self.status.set(Status::Unsaved);
    }

    /// Discard the state; it will be reloaded from storage on next access.
    pub(crate) fn set_status_ghost(&self) {
        self.status.set(Status::Ghost);
        *self.state.borrow_mut() = None;
    }

    pub(crate) fn state(&self) -> &RefCell<Option<Box<dyn ObjectState>>> {
        &self.state
    }
}

/// A reference from one persistent object to another.  On disk a reference
/// is always an oid; in memory it is an oid resolved lazily through the
/// connection's cache, except for objects that have not been committed
/// yet, which are held directly until the commit assigns them an oid.
pub struct PRef {
    target: RefCell<RefTarget>,
}

#[derive(Clone)]
enum RefTarget {
    /// Decoded from this connection's own storage.
    Stored(Oid),
    /// Taken from a live object; the owner stamp lets the serializer
    /// reject references that cross connections.
    Named { oid: Oid, owner: u64 },
    Direct(PObject),
}

impl PRef {
    pub fn to(obj: &PObject) -> PRef {
        let target = match obj.oid() {
            Some(oid) => RefTarget::Named {
                oid,
                owner: obj.owner().expect("named object has no owner"),
            },
            None => RefTarget::Direct(obj.clone()),
        };
        PRef {
            target: RefCell::new(target),
        }
    }

    pub fn from_oid(oid: Oid) -> PRef {
        PRef {
            target: RefCell::new(RefTarget::Stored(oid)),
        }
    }

    pub fn oid(&self) -> Option<Oid> {
        match &*self.target.borrow() {
            RefTarget::Stored(oid) => Some(*oid),
            RefTarget::Named { oid, .. } => Some(*oid),
            RefTarget::Direct(obj) => obj.oid(),
        }
    }

    /// The owner stamp, for references taken from live objects.
    pub(crate) fn owner(&self) -> Option<u64> {
        match &*self.target.borrow() {
            RefTarget::Stored(_) => None,
            RefTarget::Named { owner, .. } => Some(*owner),
            RefTarget::Direct(obj) => obj.owner(),
        }
    }

    /// The directly held object, for references not yet named by oid.
    pub(crate) fn direct(&self) -> Option<PObject> {
        match &*self.target.borrow() {
            RefTarget::Direct(obj) => Some(obj.clone()),
            _ => None,
        }
    }

    /// Once the target has an oid, drop the direct handle so object graphs
    /// own no reference cycles: every edge goes back through the cache.
    pub(crate) fn normalize(&self) {
        let named = match &*self.target.borrow() {
            RefTarget::Direct(obj) => match (obj.oid(), obj.owner()) {
                (Some(oid), Some(owner)) => Some(RefTarget::Named { oid, owner }),
                _ => None,
            },
            _ => None,
        };
        if let Some(named) = named {
            *self.target.borrow_mut() = named;
        }
    }
}

impl Clone for PRef {
    fn clone(&self) -> PRef {
        PRef {
            target: RefCell::new(self.target.borrow().clone()),
        }
    }
}

impl std::fmt::Debug for PRef {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match &*self.target.borrow() {
            RefTarget::Stored(oid) => write!(f, "PRef({})", oid),
            RefTarget::Named { oid, .. } => write!(f, "PRef({})", oid),
            RefTarget::Direct(obj) => write!(f, "PRef(<unsaved {}>)", obj.class_name()),
        }
    }
}

pub type DecodeStateFn = fn(&mut StateDecoder) -> Result<Box<dyn ObjectState>>;

/// Class identity is carried explicitly: every storable class registers a
/// tag and a decode function, and ghosts are built from the tag alone.
#[derive(Default)]
pub struct ClassRegistry {
    classes: FxHashMap<&'static str, DecodeStateFn>,
}

impl ClassRegistry {
    pub fn new() -> ClassRegistry {
        ClassRegistry::default()
    }

    pub fn register(&mut self, name: &'static str, decode: DecodeStateFn) {
        let previous = self.classes.insert(name, decode);
        assert!(previous.is_none(), "class {:?} registered twice", name);
    }

    /// Resolve a stored tag to its canonical name and decoder.
    pub fn lookup(&self, name: &str) -> Option<(&'static str, DecodeStateFn)> {
        self.classes
            .get_key_value(name)
            .map(|(&name, &decode)| (name, decode))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pmap::PMap;

    #[test]
    fn new_objects_are_unsaved_and_unnamed() {
        let obj = PersistentObject::new(Box::new(PMap::new()));
        assert_eq!(obj.status(), Status::Unsaved);
        assert_eq!(obj.oid(), None);
    }

    #[test]
    fn ghostify_discards_state() {
        let obj = PersistentObject::new(Box::new(PMap::new()));
        obj.set_status_ghost();
        assert!(obj.is_ghost());
        assert!(obj.state().borrow().is_none());
    }

    #[test]
    fn reference_normalizes_once_target_is_named() {
        let obj = PersistentObject::new(Box::new(PMap::new()));
        let reference = PRef::to(&obj);
        assert_eq!(reference.oid(), None);
        assert!(reference.direct().is_some());
        obj.set_oid(Some(Oid(7)));
        obj.set_owner(Some(1));
        reference.normalize();
        assert_eq!(reference.oid(), Some(Oid(7)));
        assert!(reference.direct().is_none());
    }
}
