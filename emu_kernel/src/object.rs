//! Kernel object model
//!
//! Every addressable entity (process, thread, mutex, chunk) is one variant
//! of the closed [`KernelObject`] enum, stored in an [`ObjectTable`] arena
//! keyed by [`ObjectId`]. Entities refer to each other by id only; nothing
//! holds a pointer into the arena.

use crate::chunk::Chunk;
use crate::mutex::Mutex;
use crate::process::Process;
use crate::thread::Thread;
use core_types::{AccessType, Handle, ObjectId, ObjectType};
use kernel_api::KernelError;
use state_stream::StateStream;
use std::collections::BTreeMap;

/// Fields shared by every kernel object
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ObjectHeader {
    pub uid: ObjectId,
    pub name: String,
    /// Owning process, or [`ObjectId::NONE`] for kernel-owned objects
    pub owner: ObjectId,
    pub access: AccessType,
}

impl ObjectHeader {
    pub fn new(uid: ObjectId, name: impl Into<String>, owner: ObjectId, access: AccessType) -> Self {
        Self {
            uid,
            name: name.into(),
            owner,
            access,
        }
    }

    pub fn do_state(&mut self, stream: &mut StateStream) {
        stream.section("Object", 1, |s| {
            s.absorb(&mut self.uid);
            s.absorb(&mut self.name);
            s.absorb(&mut self.owner);

            let mut global = self.access == AccessType::Global;
            s.absorb(&mut global);
            self.access = if global {
                AccessType::Global
            } else {
                AccessType::Local
            };
        });
    }
}

/// A kernel object of any type
#[derive(Debug, Clone)]
pub enum KernelObject {
    Process(Box<Process>),
    Thread(Box<Thread>),
    Mutex(Mutex),
    Chunk(Chunk),
}

impl KernelObject {
    /// Creates an empty object of the given type, ready to be loaded
    pub fn empty(ty: ObjectType) -> Self {
        match ty {
            ObjectType::Process => KernelObject::Process(Box::default()),
            ObjectType::Thread => KernelObject::Thread(Box::default()),
            ObjectType::Mutex => KernelObject::Mutex(Mutex::default()),
            ObjectType::Chunk => KernelObject::Chunk(Chunk::default()),
        }
    }

    pub fn object_type(&self) -> ObjectType {
        match self {
            KernelObject::Process(_) => ObjectType::Process,
            KernelObject::Thread(_) => ObjectType::Thread,
            KernelObject::Mutex(_) => ObjectType::Mutex,
            KernelObject::Chunk(_) => ObjectType::Chunk,
        }
    }

    pub fn header(&self) -> &ObjectHeader {
        match self {
            KernelObject::Process(p) => &p.header,
            KernelObject::Thread(t) => &t.header,
            KernelObject::Mutex(m) => &m.header,
            KernelObject::Chunk(c) => &c.header,
        }
    }

    pub fn header_mut(&mut self) -> &mut ObjectHeader {
        match self {
            KernelObject::Process(p) => &mut p.header,
            KernelObject::Thread(t) => &mut t.header,
            KernelObject::Mutex(m) => &mut m.header,
            KernelObject::Chunk(c) => &mut c.header,
        }
    }

    pub fn uid(&self) -> ObjectId {
        self.header().uid
    }

    pub fn name(&self) -> &str {
        &self.header().name
    }

    /// Serialization hook, dispatched by type
    pub fn do_state(&mut self, stream: &mut StateStream) {
        self.header_mut().do_state(stream);
        match self {
            KernelObject::Process(p) => p.do_state(stream),
            KernelObject::Thread(t) => t.do_state(stream),
            KernelObject::Mutex(m) => m.do_state(stream),
            KernelObject::Chunk(c) => c.do_state(stream),
        }
    }
}

/// Typed access to one variant of [`KernelObject`]
pub trait KernelObjectKind: Sized {
    const TYPE: ObjectType;

    fn from_object(object: &KernelObject) -> Option<&Self>;
    fn from_object_mut(object: &mut KernelObject) -> Option<&mut Self>;
    fn into_object(self) -> KernelObject;
}

macro_rules! object_kind {
    ($ty:ty, $variant:ident, boxed) => {
        impl KernelObjectKind for $ty {
            const TYPE: ObjectType = ObjectType::$variant;

            fn from_object(object: &KernelObject) -> Option<&Self> {
                match object {
                    KernelObject::$variant(inner) => Some(&**inner),
                    _ => None,
                }
            }

            fn from_object_mut(object: &mut KernelObject) -> Option<&mut Self> {
                match object {
                    KernelObject::$variant(inner) => Some(&mut **inner),
                    _ => None,
                }
            }

            fn into_object(self) -> KernelObject {
                KernelObject::$variant(Box::new(self))
            }
        }
    };
    ($ty:ty, $variant:ident) => {
        impl KernelObjectKind for $ty {
            const TYPE: ObjectType = ObjectType::$variant;

            fn from_object(object: &KernelObject) -> Option<&Self> {
                match object {
                    KernelObject::$variant(inner) => Some(inner),
                    _ => None,
                }
            }

            fn from_object_mut(object: &mut KernelObject) -> Option<&mut Self> {
                match object {
                    KernelObject::$variant(inner) => Some(inner),
                    _ => None,
                }
            }

            fn into_object(self) -> KernelObject {
                KernelObject::$variant(self)
            }
        }
    };
}

object_kind!(Process, Process, boxed);
object_kind!(Thread, Thread, boxed);
object_kind!(Mutex, Mutex);
object_kind!(Chunk, Chunk);

/// Arena of every live kernel object
///
/// Ids come from a monotonic counter and are never reused, so a stale id
/// resolves to "not found" rather than to a different object.
#[derive(Debug, Clone)]
pub struct ObjectTable {
    objects: BTreeMap<ObjectId, KernelObject>,
    next_uid: u64,
}

impl ObjectTable {
    pub fn new() -> Self {
        Self {
            objects: BTreeMap::new(),
            next_uid: 1,
        }
    }

    /// Hands out a fresh id without creating an object
    pub fn reserve_id(&mut self) -> ObjectId {
        let uid = ObjectId::from_raw(self.next_uid);
        self.next_uid += 1;
        uid
    }

    /// Assigns an id, builds the object with it and registers it
    pub fn create<T, F>(&mut self, build: F) -> ObjectId
    where
        T: KernelObjectKind,
        F: FnOnce(ObjectId) -> T,
    {
        let uid = self.reserve_id();
        self.insert(uid, build(uid).into_object());
        uid
    }

    /// Registers an object under an id previously returned by `reserve_id`
    pub fn insert(&mut self, uid: ObjectId, object: KernelObject) {
        self.objects.insert(uid, object);
    }

    pub fn remove(&mut self, uid: ObjectId) -> Option<KernelObject> {
        self.objects.remove(&uid)
    }

    pub fn contains(&self, uid: ObjectId) -> bool {
        self.objects.contains_key(&uid)
    }

    pub fn object(&self, uid: ObjectId) -> Result<&KernelObject, KernelError> {
        self.objects
            .get(&uid)
            .ok_or(KernelError::ObjectNotFound(uid))
    }

    pub fn object_mut(&mut self, uid: ObjectId) -> Result<&mut KernelObject, KernelError> {
        self.objects
            .get_mut(&uid)
            .ok_or(KernelError::ObjectNotFound(uid))
    }

    /// Resolves an id to an object of type `T`
    pub fn get<T: KernelObjectKind>(&self, uid: ObjectId) -> Result<&T, KernelError> {
        let object = self.object(uid)?;
        T::from_object(object).ok_or(KernelError::WrongObjectType {
            id: uid,
            expected: T::TYPE,
            actual: object.object_type(),
        })
    }

    pub fn get_mut<T: KernelObjectKind>(&mut self, uid: ObjectId) -> Result<&mut T, KernelError> {
        let object = self.object_mut(uid)?;
        let actual = object.object_type();
        T::from_object_mut(object).ok_or(KernelError::WrongObjectType {
            id: uid,
            expected: T::TYPE,
            actual,
        })
    }

    /// Ids of all objects of type `T`, in creation order
    pub fn ids_of<T: KernelObjectKind>(&self) -> Vec<ObjectId> {
        self.objects
            .iter()
            .filter(|(_, object)| object.object_type() == T::TYPE)
            .map(|(uid, _)| *uid)
            .collect()
    }

    /// Finds the first object of type `T` with the given name
    pub fn find_by_name<T: KernelObjectKind>(&self, name: &str) -> Option<ObjectId> {
        self.objects
            .iter()
            .find(|(_, object)| object.object_type() == T::TYPE && object.name() == name)
            .map(|(uid, _)| *uid)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&ObjectId, &KernelObject)> {
        self.objects.iter()
    }

    pub fn len(&self) -> usize {
        self.objects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }

    pub fn clear(&mut self) {
        self.objects.clear();
    }

    /// Saves or loads every object, in uid order
    pub fn do_state(&mut self, stream: &mut StateStream) {
        stream.section("ObjectTable", 1, |s| {
            let mut next_uid = self.next_uid;
            s.absorb(&mut next_uid);

            let mut count = self.objects.len() as u32;
            s.absorb(&mut count);

            if s.is_reading() {
                let mut loaded = BTreeMap::new();
                for _ in 0..count {
                    let mut tag = 0u8;
                    s.absorb(&mut tag);
                    if s.is_failed() {
                        return;
                    }
                    let Some(ty) = ObjectType::from_tag(tag) else {
                        s.fail_corrupt(format!("unknown object tag {}", tag));
                        return;
                    };
                    let mut object = KernelObject::empty(ty);
                    object.do_state(s);
                    if s.is_failed() {
                        return;
                    }
                    loaded.insert(object.uid(), object);
                }
                self.next_uid = next_uid;
                self.objects = loaded;
            } else {
                for object in self.objects.values_mut() {
                    let mut tag = object.object_type().tag();
                    s.absorb(&mut tag);
                    object.do_state(s);
                }
            }
        });
    }
}

impl Default for ObjectTable {
    fn default() -> Self {
        Self::new()
    }
}

/// Maps small integer handles to objects for one owner
///
/// The process-scoped tables hand out local handles; the kernel-wide table
/// hands out handles with [`Handle::GLOBAL_FLAG`] set.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HandleTable {
    global: bool,
    slots: Vec<ObjectId>,
}

impl HandleTable {
    /// Creates a table handing out local handles
    pub fn local() -> Self {
        Self {
            global: false,
            slots: Vec::new(),
        }
    }

    /// Creates a table handing out global handles
    pub fn global() -> Self {
        Self {
            global: true,
            slots: Vec::new(),
        }
    }

    /// Opens a handle to `object` in the first free slot
    pub fn add(&mut self, object: ObjectId) -> Handle {
        let index = match self.slots.iter().position(|slot| slot.is_none()) {
            Some(free) => {
                self.slots[free] = object;
                free
            }
            None => {
                self.slots.push(object);
                self.slots.len() - 1
            }
        };
        Handle::new(index as u32, self.global)
    }

    /// Resolves a handle
    pub fn get(&self, handle: Handle) -> Option<ObjectId> {
        if handle.is_global() != self.global {
            return None;
        }
        let index = handle.index()? as usize;
        self.slots.get(index).copied().filter(|id| !id.is_none())
    }

    /// Closes a handle, returning the object it referred to
    pub fn close(&mut self, handle: Handle) -> Option<ObjectId> {
        let object = self.get(handle)?;
        let index = handle.index()? as usize;
        self.slots[index] = ObjectId::NONE;
        Some(object)
    }

    /// Closes every handle referring to `object`
    pub fn close_all(&mut self, object: ObjectId) {
        for slot in self.slots.iter_mut().filter(|slot| **slot == object) {
            *slot = ObjectId::NONE;
        }
    }

    /// Number of open handles
    pub fn len(&self) -> usize {
        self.slots.iter().filter(|id| !id.is_none()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Objects referenced by open handles
    pub fn objects(&self) -> impl Iterator<Item = ObjectId> + '_ {
        self.slots.iter().copied().filter(|id| !id.is_none())
    }

    pub fn do_state(&mut self, stream: &mut StateStream) {
        stream.section("HandleTable", 1, |s| {
            s.absorb(&mut self.global);
            s.absorb(&mut self.slots);
        });
    }
}
