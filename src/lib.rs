//! A crate for reading, inspecting, and generating Java class files, compliant with the Java SE
//! 17 JVM Specification. The reading side is a streaming visitor (`ClassReader` driving a
//! `ClassVisitor`) rather than a parse tree; the writing side builds a class file incrementally
//! through `ClassWriter`/`MethodWriter` and synthesizes stack map frames and max-stack/max-locals
//! on the fly, the way a bytecode-generation library has to.

pub mod attributes;
pub mod class;
pub mod constant;
pub mod descriptor;
pub mod error;
pub mod frame;
pub mod label;
pub mod opcode;
pub mod read;
pub mod reader;
pub mod visitor;
pub mod writer;
